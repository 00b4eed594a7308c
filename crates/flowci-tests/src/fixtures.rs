//! Test fixtures for creating sample data.

use chrono::{Duration, Utc};
use flowci_core::agent::{Agent, Os};
use flowci_core::flow::Flow;
use flowci_core::ids::{JobId, NodePath};
use flowci_core::job::{Job, JobStatus, Trigger};
use flowci_core::step::ExecutedCmd;
use flowci_core::tree::StepTree;
use flowci_core::vars;

/// Three sequential steps.
pub const LINEAR_YML: &str = r#"
steps:
  - name: checkout
    script: git clone repo
  - name: build
    script: cargo build
  - name: test
    script: cargo test
"#;

/// A failing middle step followed by a cleanup that always runs.
pub const WITH_FINAL_YML: &str = r#"
steps:
  - name: build
    script: cargo build
  - name: test
    script: cargo test
  - name: cleanup
    final: true
    script: rm -rf target
"#;

/// Only agents tagged `linux` may run it.
pub const LINUX_ONLY_YML: &str = r#"
selector:
  label: [linux]
steps:
  - name: build
    script: make
"#;

/// Factory for creating test flows.
pub struct FlowFixture;

impl FlowFixture {
    pub fn simple() -> Flow {
        let mut flow = Flow::new("test-flow");
        flow.variables = vars::from_pairs([("FLOWCI_GIT_BRANCH", "main")]);
        flow
    }
}

/// Factory for creating job records without going through the scheduler.
pub struct JobFixture;

impl JobFixture {
    pub fn pending(flow: &Flow, build_number: u64) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            key: Job::key_of(flow.id, build_number),
            flow_id: flow.id,
            flow_name: flow.name.clone(),
            build_number,
            trigger: Trigger::Manual,
            status: JobStatus::Pending,
            current_path: NodePath::root(),
            agent_id: None,
            context: vars::from_pairs([(vars::JOB_STATUS, "PENDING")]),
            message: None,
            expire_at: now + Duration::minutes(30),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Pending step records for every node of `yml`.
    pub fn steps(job: &Job, yml: &str) -> Vec<ExecutedCmd> {
        let tree = StepTree::parse(yml).expect("valid fixture yml");
        tree.ordered()
            .iter()
            .enumerate()
            .map(|(i, node)| ExecutedCmd::pending(job.id, job.flow_id, node, i as u32))
            .collect()
    }
}

/// Factory for creating agents.
pub struct AgentFixture;

impl AgentFixture {
    pub fn named(name: &str) -> Agent {
        Agent::new(name, vec![])
    }

    pub fn linux(name: &str) -> Agent {
        let mut agent = Agent::new(name, vec!["linux".to_string()]);
        agent.os = Os::Linux;
        agent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_steps_follow_tree_order() {
        let flow = FlowFixture::simple();
        let job = JobFixture::pending(&flow, 1);
        let paths: Vec<String> = JobFixture::steps(&job, LINEAR_YML)
            .iter()
            .map(|s| s.id.path.to_string())
            .collect();
        assert_eq!(paths, vec!["root/checkout", "root/build", "root/test"]);
    }

    #[test]
    fn test_fixture_ymls_parse() {
        for yml in [LINEAR_YML, WITH_FINAL_YML, LINUX_ONLY_YML] {
            assert!(StepTree::parse(yml).is_ok());
        }
    }
}
