use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Process-wide shutdown signal, fanned out to workers as cancellation tokens.
#[derive(Clone, Debug, Default)]
pub struct FunctionSignal {
    token: CancellationToken,
}

impl FunctionSignal {
    /// Traps SIGINT and SIGTERM (the `termination` handler set), so pod
    /// deletion shuts the process down as gracefully as Ctrl-C does.
    pub fn trap_on_shutdown(&self) -> Result<()> {
        let signal = self.clone();
        ::ctrlc::set_handler(move || signal.terminate())
            .map_err(|error| anyhow!("failed to set shutdown signal handler: {error}"))
    }

    pub fn terminate(&self) {
        info!("Gracefully shutting down...");
        self.token.cancel()
    }

    pub fn is_terminating(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Child scope cancelled when the process is asked to terminate.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub async fn wait_to_terminate(&self) {
        self.token.cancelled().await
    }
}
