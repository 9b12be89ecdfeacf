use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use tokio::{task, time::sleep};

use crate::ModifyError;

/// Hard wall-clock budget for a single script evaluation.
const SCRIPT_BUDGET: Duration = Duration::from_secs(2);

pub(crate) async fn evaluate(document: Value, script: String) -> Result<Value, ModifyError> {
    evaluate_with_budget(document, script, SCRIPT_BUDGET).await
}

/// Runs `script` against `document` on a blocking worker, racing it against
/// the budget. Exactly one of {result, timeout, execution error} is reported
/// and the worker never outlives the call: on expiry the interrupt flag is
/// raised and the engine stops at its next progress checkpoint.
async fn evaluate_with_budget(
    document: Value,
    script: String,
    budget: Duration,
) -> Result<Value, ModifyError> {
    let interrupted = Arc::new(AtomicBool::new(false));

    let mut worker = task::spawn_blocking({
        let interrupted = interrupted.clone();
        move || run_sandboxed(document, &script, &interrupted)
    });

    tokio::select! {
        result = &mut worker => {
            result.map_err(|error| ModifyError::Script(format!("script worker failed: {error}")))?
        }
        () = sleep(budget) => {
            interrupted.store(true, Ordering::Relaxed);
            worker.await.ok();
            Err(ModifyError::ScriptTimeout)
        }
    }
}

/// One fresh engine per call; no state survives it.
fn run_sandboxed(
    document: Value,
    script: &str,
    interrupted: &Arc<AtomicBool>,
) -> Result<Value, ModifyError> {
    let mut engine = Engine::new();
    engine.on_progress({
        let interrupted = interrupted.clone();
        move |_| interrupted.load(Ordering::Relaxed).then(|| Dynamic::UNIT)
    });

    let resource = ::rhai::serde::to_dynamic(&document)
        .map_err(|error| ModifyError::Script(error.to_string()))?;
    let mut scope = Scope::new();
    scope.push("resource", resource);

    engine
        .run_with_scope(&mut scope, script)
        .map_err(|error| match *error {
            EvalAltResult::ErrorTerminated(..) => ModifyError::ScriptTimeout,
            error => ModifyError::Script(error.to_string()),
        })?;

    let resource = scope
        .get("resource")
        .cloned()
        .ok_or_else(|| ModifyError::ResultInvalid("the resource binding was dropped".into()))?;
    ::rhai::serde::from_dynamic(&resource)
        .map_err(|error| ModifyError::ResultInvalid(error.to_string()))
}
