mod session;

use std::{fs, path::PathBuf, process::exit, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use ditto_api::{config, task::Task, task::TaskDefinition};
use ditto_client::{Cluster, KubeCluster};
use ditto_core::{signal::FunctionSignal, tracer};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::session::{Session, SessionGroup};

pub(crate) mod consts {
    pub const NAME: &str = "ditto-operator";
}

/// Mounted into every pod; tells the operator which namespace it runs in.
const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

#[derive(Clone, Debug, Parser)]
#[command(name = crate::consts::NAME, about, version)]
struct Args {
    /// Directory holding the task definition files (.yaml/.yml)
    #[arg(
        long,
        env = "DITTO_CONFIG_DIR",
        value_name = "DIR",
        default_value = "."
    )]
    config_dir: PathBuf,

    /// Seconds between task definition digests; 0 disables hot reload
    #[arg(
        long,
        env = "DITTO_RELOAD_INTERVAL",
        value_name = "SECONDS",
        default_value_t = 30
    )]
    reload_interval: u64,
}

#[tokio::main]
async fn main() {
    ::rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracer::init_once();

    let args = Args::parse();

    let signal = FunctionSignal::default();
    if let Err(error) = signal.trap_on_shutdown() {
        error!("{error}");
        exit(1);
    }

    match try_main(args, signal).await {
        Ok(()) => {
            info!("terminated");
        }
        Err(error) => {
            error!("fatal error: {error}");
            exit(1);
        }
    }
}

async fn try_main(args: Args, signal: FunctionSignal) -> Result<()> {
    let cluster: Arc<dyn Cluster> = Arc::new(KubeCluster::try_default().await?);
    let own_namespace = own_namespace();

    while !signal.is_terminating() {
        let digest = config::digest_dir(&args.config_dir)?;
        let definitions = config::load_dir(&args.config_dir)?;
        let tasks = build_tasks(&definitions, own_namespace.as_deref());
        if tasks.is_empty() {
            warn!("no valid task definitions in {:?}", args.config_dir);
        } else {
            info!("running {} task(s)", tasks.len());
        }

        let scope = signal.child_token();
        let sessions = tasks
            .into_iter()
            .map(|task| Session::new(task, cluster.clone()))
            .collect();
        let group = tokio::spawn(SessionGroup::new(sessions).run(scope.clone()));

        // park until shutdown or until the task definitions change on disk
        loop {
            if args.reload_interval == 0 {
                signal.wait_to_terminate().await;
                break;
            }

            tokio::select! {
                () = signal.wait_to_terminate() => break,
                () = sleep(Duration::from_secs(args.reload_interval)) => {
                    match config::digest_dir(&args.config_dir) {
                        Ok(current) if current != digest => {
                            info!("task definitions changed, reloading");
                            break;
                        }
                        Ok(_) => {}
                        Err(error) => warn!("failed to digest task definitions: {error}"),
                    }
                }
            }
        }

        scope.cancel();
        group.await.ok();
    }

    Ok(())
}

/// A definition that fails to build excludes that task only.
fn build_tasks(definitions: &[TaskDefinition], own_namespace: Option<&str>) -> Vec<Task> {
    definitions
        .iter()
        .filter_map(|definition| match definition.build(own_namespace) {
            Ok(task) => Some(task),
            Err(error) => {
                warn!("skipping invalid task definition: {error}");
                None
            }
        })
        .collect()
}

fn own_namespace() -> Option<String> {
    fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
        .ok()
        .map(|namespace| namespace.trim().to_string())
        .filter(|namespace| !namespace.is_empty())
}
