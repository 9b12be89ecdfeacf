mod script;

use json_patch::Patch;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModifyError {
    #[error("invalid modification patch: {0}")]
    InvalidPatch(#[source] ::serde_json::Error),
    #[error("failed to apply patch: {0}")]
    Patch(#[from] ::json_patch::PatchError),
    #[error("script timeout")]
    ScriptTimeout,
    #[error("failed to execute script: {0}")]
    Script(String),
    #[error("modification produced an invalid document: {0}")]
    ResultInvalid(String),
}

/// A compiled per-task modification pipeline: a structural patch followed by
/// an optional sandboxed script transform. Pure with respect to the cluster.
#[derive(Clone, Debug, Default)]
pub struct Modification {
    patch: Option<Patch>,
    script: Option<String>,
}

impl Modification {
    pub fn try_new(
        patch: Option<&[Value]>,
        script: Option<&str>,
    ) -> Result<Self, ModifyError> {
        let patch = patch
            .map(|operations| {
                ::serde_json::from_value(Value::Array(operations.to_vec()))
                    .map_err(ModifyError::InvalidPatch)
            })
            .transpose()?;
        let script = script
            .map(str::trim)
            .filter(|script| !script.is_empty())
            .map(Into::into);
        Ok(Self { patch, script })
    }

    pub fn is_empty(&self) -> bool {
        self.patch.is_none() && self.script.is_none()
    }

    /// Runs `document` through the pipeline. A patch failure aborts before
    /// the script runs; a script failure aborts before anything is returned.
    pub async fn apply(&self, mut document: Value) -> Result<Value, ModifyError> {
        if let Some(patch) = &self.patch {
            ::json_patch::patch(&mut document, patch)?;
        }
        if let Some(script) = &self.script {
            document = self::script::evaluate(document, script.clone()).await?;
        }
        Ok(document)
    }
}
