//! Strongly-typed identifiers for domain entities.

use crate::Error;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

define_id!(FlowId, "flw");
define_id!(JobId, "job");
define_id!(AgentId, "agt");

static NODE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,100}$").unwrap());

/// Address of a node in a step tree, e.g. `root/build/compile`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath(String);

impl NodePath {
    pub const ROOT: &'static str = "root";
    pub const SEPARATOR: char = '/';

    pub fn root() -> Self {
        Self(Self::ROOT.to_string())
    }

    /// Checks whether `name` is usable as a path segment.
    pub fn is_valid_name(name: &str) -> bool {
        NODE_NAME.is_match(name)
    }

    /// Path of the child named `name`.
    pub fn append(&self, name: &str) -> crate::Result<Self> {
        if !Self::is_valid_name(name) {
            return Err(Error::InvalidPath(format!("illegal node name '{}'", name)));
        }
        Ok(Self(format!("{}{}{}", self.0, Self::SEPARATOR, name)))
    }

    pub fn parse(raw: &str) -> crate::Result<Self> {
        let mut segments = raw.split(Self::SEPARATOR);
        if segments.next() != Some(Self::ROOT) {
            return Err(Error::InvalidPath(raw.to_string()));
        }
        if !segments.all(Self::is_valid_name) {
            return Err(Error::InvalidPath(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT
    }

    /// Last segment of the path.
    pub fn name(&self) -> &str {
        self.0
            .rsplit_once(Self::SEPARATOR)
            .map(|(_, name)| name)
            .unwrap_or(&self.0)
    }

    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once(Self::SEPARATOR)
            .map(|(parent, _)| Self(parent.to_string()))
    }

    pub fn depth(&self) -> usize {
        self.0.matches(Self::SEPARATOR).count()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_display() {
        let id = JobId::new();
        assert!(id.to_string().starts_with("job_"));
    }

    #[test]
    fn test_agent_id_parse() {
        let id = AgentId::new();
        let parsed: AgentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_node_path_append_and_name() {
        let path = NodePath::root().append("build").unwrap().append("compile").unwrap();
        assert_eq!(path.as_str(), "root/build/compile");
        assert_eq!(path.name(), "compile");
        assert_eq!(path.depth(), 2);
        assert_eq!(path.parent().unwrap().as_str(), "root/build");
        assert_eq!(NodePath::root().name(), "root");
        assert!(NodePath::root().parent().is_none());
    }

    #[test]
    fn test_node_path_rejects_bad_names() {
        assert!(NodePath::root().append("has space").is_err());
        assert!(NodePath::root().append("a#b").is_err());
        assert!(NodePath::root().append("").is_err());
    }

    #[test]
    fn test_node_path_parse() {
        assert!(NodePath::parse("root/a/b").is_ok());
        assert!(NodePath::parse("other/a").is_err());
        assert!(NodePath::parse("root//a").is_err());
    }
}
