use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ResourceParseError {
    #[error("invalid resource reference: {0:?}")]
    InvalidReference(String),
}

/// A fully-qualified resource kind reference, e.g. `networking.k8s.io/v1/ingresses`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl FromStr for GroupVersionResource {
    type Err = ResourceParseError;

    /// Parses a compact `/`-separated reference:
    /// * `{resource}` with version `v1` and the core group
    /// * `{version}/{resource}` when the first segment starts with `v`,
    ///   otherwise `{group}/{resource}` with version `v1`
    /// * `{group}/{version}/{resource}` verbatim
    ///
    /// The 2-segment rule cannot tell a version apart from an API group that
    /// literally starts with `v`; such groups must spell out all 3 segments.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const DEFAULT_VERSION: &str = "v1";

        match *s.split('/').collect::<Vec<_>>().as_slice() {
            [resource] => Ok(Self {
                group: String::default(),
                version: DEFAULT_VERSION.into(),
                resource: resource.into(),
            }),
            [group_or_version, resource] => {
                let (group, version) = if group_or_version.starts_with('v') {
                    (String::default(), group_or_version.into())
                } else {
                    (group_or_version.into(), DEFAULT_VERSION.into())
                };
                Ok(Self {
                    group,
                    version,
                    resource: resource.into(),
                })
            }
            [group, version, resource] => Ok(Self {
                group: group.into(),
                version: version.into(),
                resource: resource.into(),
            }),
            _ => Err(ResourceParseError::InvalidReference(s.into())),
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Self {
            group,
            version,
            resource,
        } = self;
        if group.is_empty() {
            write!(f, "{version}/{resource}")
        } else {
            write!(f, "{group}/{version}/{resource}")
        }
    }
}

impl GroupVersionResource {
    /// The `apiVersion` rendering, with the bare version for the core group.
    pub fn api_version(&self) -> String {
        let Self { group, version, .. } = self;
        if group.is_empty() {
            version.clone()
        } else {
            format!("{group}/{version}")
        }
    }
}
