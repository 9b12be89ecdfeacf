use ditto_modify::{Modification, ModifyError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::resource::{GroupVersionResource, ResourceParseError};

#[derive(Debug, Error)]
pub enum TaskBuildError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error(transparent)]
    InvalidResource(#[from] ResourceParseError),
    #[error("invalid target namespace pattern: {0}")]
    InvalidTargetPattern(#[from] ::regex::Error),
    #[error(transparent)]
    InvalidModification(#[from] ModifyError),
}

/// One raw replication task record, as written by the user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefinition {
    pub resource: String,
    pub source: SourceSpec,
    pub target: TargetSpec,
    pub modification: ModificationSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSpec {
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSpec {
    /// Regular expression matched against destination namespace names.
    pub namespace: String,
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModificationSpec {
    /// RFC-6902 JSON Patch operations, applied in array order.
    pub patch: Option<Vec<Value>>,
    pub script: Option<String>,
}

impl TaskDefinition {
    /// Validates the definition into an immutable [`Task`].
    ///
    /// `fallback_namespace` stands in for a missing `source.namespace`; the
    /// operator passes its own namespace when running in-cluster.
    pub fn build(&self, fallback_namespace: Option<&str>) -> Result<Task, TaskBuildError> {
        if self.resource.is_empty() {
            return Err(TaskBuildError::MissingField("resource"));
        }
        let resource = self.resource.parse()?;

        let source_namespace = self
            .source
            .namespace
            .as_deref()
            .filter(|namespace| !namespace.is_empty())
            .or(fallback_namespace)
            .ok_or(TaskBuildError::MissingField("source.namespace"))?
            .to_string();

        if self.source.name.is_empty() {
            return Err(TaskBuildError::MissingField("source.name"));
        }
        let source_name = self.source.name.clone();

        if self.target.namespace.is_empty() {
            return Err(TaskBuildError::MissingField("target.namespace"));
        }
        let target_namespace = Regex::new(&self.target.namespace)?;

        let target_name = self
            .target
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| source_name.clone());

        let modification = Modification::try_new(
            self.modification.patch.as_deref(),
            self.modification.script.as_deref(),
        )?;

        Ok(Task {
            resource,
            source_namespace,
            source_name,
            target_namespace,
            target_name,
            modification,
        })
    }
}

/// A validated replication task. Built exactly once and never mutated, so it
/// is safe to share across sessions behind an `Arc`.
#[derive(Clone, Debug)]
pub struct Task {
    pub resource: GroupVersionResource,
    pub source_namespace: String,
    pub source_name: String,
    pub target_namespace: Regex,
    pub target_name: String,
    pub modification: Modification,
}
