//! Collaborator traits the inventory depends on but does not implement
//! (spec.md §6 supplement). Callers inject real adapters; `#[cfg(test)]`
//! provides minimal in-memory stand-ins to exercise the rest of the crate.

use anyhow::Result;

use crate::inventory::entity::{DetachedBlock, DetachedDataset, DetachedDatasetReplica, DetachedFile, DetachedGroup, DetachedSite};

/// Persistence backend for block file listings, keyed by `dataset#block`.
/// Server-side inventories call this on every access; client-side
/// inventories only call it on a cache miss.
pub trait InventoryStore {
    fn load_files(&self, dataset_name: &str, block_name: &str) -> Result<Vec<DetachedFile>>;
}

/// Federation catalog collaborator supplying site/group/dataset/block
/// definitions to populate the inventory on startup or refresh.
pub trait SiteInfoSource {
    fn sites(&self) -> Result<Vec<DetachedSite>>;
    fn groups(&self) -> Result<Vec<DetachedGroup>>;
}

/// Federation catalog collaborator supplying dataset/block/replica layout.
pub trait ReplicaInfoSource {
    fn datasets(&self) -> Result<Vec<DetachedDataset>>;
    fn blocks(&self, dataset_name: &str) -> Result<Vec<DetachedBlock>>;
    fn dataset_replicas(&self, dataset_name: &str) -> Result<Vec<DetachedDatasetReplica>>;
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct InMemoryStore {
        pub files: RefCell<HashMap<String, Vec<DetachedFile>>>,
    }

    impl InMemoryStore {
        pub fn set_files(&self, dataset: &str, block: &str, files: Vec<DetachedFile>) {
            self.files.borrow_mut().insert(format!("{}#{}", dataset, block), files);
        }
    }

    impl InventoryStore for InMemoryStore {
        fn load_files(&self, dataset_name: &str, block_name: &str) -> Result<Vec<DetachedFile>> {
            Ok(self
                .files
                .borrow()
                .get(&format!("{}#{}", dataset_name, block_name))
                .cloned()
                .unwrap_or_default())
        }
    }
}
