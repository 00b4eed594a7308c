//! Step trees rebuilt from job yml snapshots.

use dashmap::DashMap;
use flowci_core::ids::JobId;
use flowci_core::ports::JobYmlRepository;
use flowci_core::tree::StepTree;
use flowci_core::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Per-job cache of parsed step trees.
pub struct TreeManager {
    ymls: Arc<dyn JobYmlRepository>,
    cache: DashMap<JobId, Arc<StepTree>>,
}

impl TreeManager {
    pub fn new(ymls: Arc<dyn JobYmlRepository>) -> Self {
        Self {
            ymls,
            cache: DashMap::new(),
        }
    }

    /// Tree of a job, parsed from its snapshot on first use.
    pub async fn get(&self, job_id: JobId) -> Result<Arc<StepTree>> {
        if let Some(tree) = self.cache.get(&job_id) {
            return Ok(Arc::clone(&tree));
        }

        let yml = self
            .ymls
            .get(job_id)
            .await?
            .ok_or_else(|| Error::JobYmlNotFound(job_id.to_string()))?;

        let tree = Arc::new(StepTree::parse(&yml.raw)?);
        debug!(%job_id, nodes = tree.len(), "Step tree loaded");
        self.cache.insert(job_id, Arc::clone(&tree));
        Ok(tree)
    }

    pub fn put(&self, job_id: JobId, tree: Arc<StepTree>) {
        self.cache.insert(job_id, tree);
    }

    pub fn evict(&self, job_id: JobId) {
        self.cache.remove(&job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowci_core::job::JobYml;
    use flowci_memory::MemoryJobYmlRepository;

    #[tokio::test]
    async fn test_tree_loaded_once() {
        let repo = Arc::new(MemoryJobYmlRepository::new());
        let job_id = JobId::new();
        repo.create(&JobYml {
            job_id,
            raw: "steps:\n  - name: a\n    script: echo a\n".to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let trees = TreeManager::new(repo.clone());
        assert_eq!(trees.get(job_id).await.unwrap().len(), 1);
        assert_eq!(trees.get(job_id).await.unwrap().len(), 1);
        assert_eq!(repo.reads(), 1);

        trees.evict(job_id);
        trees.get(job_id).await.unwrap();
        assert_eq!(repo.reads(), 2);
    }

    #[tokio::test]
    async fn test_missing_snapshot() {
        let trees = TreeManager::new(Arc::new(MemoryJobYmlRepository::new()));
        let err = trees.get(JobId::new()).await.unwrap_err();
        assert!(matches!(err, Error::JobYmlNotFound(_)));
    }
}
