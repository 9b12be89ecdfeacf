use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::task::TaskDefinition;

/// Parses every YAML document in `text` into a task definition.
pub fn parse_str(text: &str) -> Result<Vec<TaskDefinition>> {
    ::serde_yaml::Deserializer::from_str(text)
        .map(|document| {
            TaskDefinition::deserialize(document)
                .map_err(|error| anyhow!("failed to parse task definition: {error}"))
        })
        .collect()
}

pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<TaskDefinition>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|error| anyhow!("failed to read task file {path:?}: {error}"))?;
    parse_str(&text).map_err(|error| anyhow!("{path:?}: {error}"))
}

/// Loads every task definition from the `.yaml`/`.yml` files directly under
/// `dir`, in file name order.
pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<TaskDefinition>> {
    let mut definitions = Vec::new();
    for path in task_files(dir.as_ref())? {
        definitions.append(&mut load_file(&path)?);
    }
    Ok(definitions)
}

/// Content digest of the task files under `dir`, for change detection.
pub fn digest_dir(dir: impl AsRef<Path>) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in task_files(dir.as_ref())? {
        let content = fs::read(&path)
            .map_err(|error| anyhow!("failed to read task file {path:?}: {error}"))?;
        hasher.update(&content);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

fn task_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|error| anyhow!("failed to read task directory {dir:?}: {error}"))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|error| anyhow!("failed to read task directory {dir:?}: {error}"))?
            .path();
        if path.is_file()
            && matches!(
                path.extension().and_then(OsStr::to_str),
                Some("yaml" | "yml")
            )
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
