//! Ordered step tree built from a flow definition.

use crate::flow::{FlowDefinition, StepDefinition};
use crate::ids::NodePath;
use crate::vars::{self, Vars};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Default step timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;

/// A runnable node of the tree (or the root).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub path: NodePath,
    pub name: String,
    pub envs: Vars,
    pub scripts: Vec<String>,
    pub condition: Option<String>,
    pub allow_failure: bool,
    /// Runs regardless of upstream failure.
    pub is_final: bool,
    pub timeout_secs: u64,
    pub exports: Vec<String>,
    pub workdir: Option<String>,
    /// Tag selector; only set on the root.
    pub tags: Vec<String>,
}

impl Node {
    pub fn has_condition(&self) -> bool {
        self.condition
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }
}

/// Traversal structure over the leaf steps of a flow, in depth-first order.
#[derive(Debug, Clone)]
pub struct StepTree {
    root: Node,
    ordered: Vec<Node>,
    index: HashMap<NodePath, usize>,
}

/// Values a group passes down to its children.
#[derive(Clone, Default)]
struct Inherited {
    envs: Vars,
    condition: Option<String>,
    allow_failure: Option<bool>,
    is_final: Option<bool>,
    timeout: Option<u64>,
}

impl StepTree {
    pub fn parse(raw: &str) -> Result<Self> {
        Self::from_definition(&FlowDefinition::from_yaml(raw)?)
    }

    pub fn from_definition(def: &FlowDefinition) -> Result<Self> {
        let root = Node {
            path: NodePath::root(),
            name: NodePath::ROOT.to_string(),
            envs: def.envs.clone(),
            scripts: vec![],
            condition: None,
            allow_failure: false,
            is_final: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            exports: vec![],
            workdir: def.workdir.clone(),
            tags: def
                .selector
                .as_ref()
                .map(|s| s.label.clone())
                .unwrap_or_default(),
        };

        let mut tree = Self {
            root,
            ordered: Vec::new(),
            index: HashMap::new(),
        };

        let root_path = tree.root.path.clone();
        tree.flatten(&root_path, &def.steps, &Inherited::default())?;
        Ok(tree)
    }

    fn flatten(
        &mut self,
        parent: &NodePath,
        steps: &[StepDefinition],
        inherited: &Inherited,
    ) -> Result<()> {
        let mut seen = HashSet::new();

        for step in steps {
            if !seen.insert(step.name.as_str()) {
                return Err(Error::InvalidFlow(format!(
                    "duplicated step name '{}' under '{}'",
                    step.name, parent
                )));
            }

            let path = parent
                .append(&step.name)
                .map_err(|e| Error::InvalidFlow(e.to_string()))?;

            let mut envs = inherited.envs.clone();
            vars::merge(&mut envs, &step.envs);

            let current = Inherited {
                envs,
                condition: step.condition.clone().or_else(|| inherited.condition.clone()),
                allow_failure: step.allow_failure.or(inherited.allow_failure),
                is_final: step.is_final.or(inherited.is_final),
                timeout: step.timeout.or(inherited.timeout),
            };

            if !step.steps.is_empty() {
                if step.script.is_some() {
                    return Err(Error::InvalidFlow(format!(
                        "group step '{}' cannot have a script",
                        path
                    )));
                }
                self.flatten(&path, &step.steps, &current)?;
                continue;
            }

            let node = Node {
                name: step.name.clone(),
                envs: current.envs,
                scripts: step.script.iter().cloned().collect(),
                condition: current.condition,
                allow_failure: current.allow_failure.unwrap_or(false),
                is_final: current.is_final.unwrap_or(false),
                timeout_secs: current.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
                exports: step.exports.clone(),
                workdir: self.root.workdir.clone(),
                tags: vec![],
                path: path.clone(),
            };

            self.index.insert(path, self.ordered.len());
            self.ordered.push(node);
        }

        Ok(())
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn get(&self, path: &NodePath) -> Option<&Node> {
        if path.is_root() {
            return Some(&self.root);
        }
        self.index.get(path).map(|&i| &self.ordered[i])
    }

    /// Runnable nodes in execution order.
    pub fn ordered(&self) -> &[Node] {
        &self.ordered
    }

    pub fn position(&self, path: &NodePath) -> Option<usize> {
        self.index.get(path).copied()
    }

    /// Node following `path`; `next(root)` is the first node.
    pub fn next(&self, path: &NodePath) -> Option<&Node> {
        self.ordered.get(self.start_after(path)?)
    }

    /// First node flagged final after `path`.
    pub fn next_final(&self, path: &NodePath) -> Option<&Node> {
        let start = self.start_after(path)?;
        self.ordered.iter().skip(start).find(|n| n.is_final)
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    fn start_after(&self, path: &NodePath) -> Option<usize> {
        if path.is_root() {
            return Some(0);
        }
        self.index.get(path).map(|&i| i + 1)
    }
}
