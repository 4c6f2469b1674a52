//! Inventory registry (component C3): owns the entity graph keyed by name,
//! the FileSet cache, and the file-loading/embed/unlink operations that keep
//! the graph's declared invariants (spec.md §3, §8) intact.

pub mod entity;
pub mod file_cache;
pub mod store;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::Result;

use crate::error::{IntegrityError, ObjectError};
use crate::inventory::entity::{
    Block, BlockId, BlockReplica, Dataset, DatasetReplica, DetachedBlock, DetachedGroup, DetachedSite,
    File, FileState, Group, Partition, Site,
};
use crate::inventory::file_cache::FileCache;
use crate::inventory::store::InventoryStore;

/// The inventory graph. `is_server_side` mirrors spec.md §4.1's "has_store"
/// gate: a server-side inventory never retains file sets past the call that
/// produced them.
pub struct Inventory {
    pub is_server_side: bool,
    sites: RefCell<HashMap<String, Rc<Site>>>,
    groups: RefCell<HashMap<String, Rc<Group>>>,
    datasets: RefCell<HashMap<String, Rc<Dataset>>>,
    partitions: RefCell<HashMap<String, Rc<Partition>>>,
    file_cache: RefCell<FileCache>,
}

impl Inventory {
    pub fn new(is_server_side: bool) -> Self {
        Inventory {
            is_server_side,
            sites: RefCell::new(HashMap::new()),
            groups: RefCell::new(HashMap::new()),
            datasets: RefCell::new(HashMap::new()),
            partitions: RefCell::new(HashMap::new()),
            file_cache: RefCell::new(FileCache::default()),
        }
    }

    // -- lookups --------------------------------------------------------

    pub fn site(&self, name: &str) -> Option<Rc<Site>> {
        self.sites.borrow().get(name).cloned()
    }

    pub fn group(&self, name: &str) -> Option<Rc<Group>> {
        self.groups.borrow().get(name).cloned()
    }

    pub fn dataset(&self, name: &str) -> Option<Rc<Dataset>> {
        self.datasets.borrow().get(name).cloned()
    }

    pub fn block(&self, dataset_name: &str, block_name: &str) -> Option<Rc<Block>> {
        self.dataset(dataset_name)?.find_block(block_name)
    }

    pub fn sites(&self) -> Vec<Rc<Site>> {
        self.sites.borrow().values().cloned().collect()
    }

    pub fn datasets(&self) -> Vec<Rc<Dataset>> {
        self.datasets.borrow().values().cloned().collect()
    }

    pub fn register_partition(&self, partition: Partition) {
        self.partitions.borrow_mut().insert(partition.name.clone(), Rc::new(partition));
    }

    pub fn partition(&self, name: &str) -> Option<Rc<Partition>> {
        self.partitions.borrow().get(name).cloned()
    }

    // -- embed (create-or-update) ---------------------------------------

    pub fn embed_site(&self, d: &DetachedSite) -> Rc<Site> {
        let mut sites = self.sites.borrow_mut();
        if let Some(existing) = sites.get(&d.name) {
            *existing.host.borrow_mut() = d.host.clone();
            *existing.storage_type.borrow_mut() = d.storage_type.clone();
            *existing.backend.borrow_mut() = d.backend.clone();
            return existing.clone();
        }
        let site = Site::new(d.name.clone(), d.host.clone(), d.storage_type.clone(), d.backend.clone());
        sites.insert(d.name.clone(), site.clone());
        site
    }

    pub fn embed_group(&self, d: &DetachedGroup) -> Rc<Group> {
        let mut groups = self.groups.borrow_mut();
        if let Some(existing) = groups.get(&d.name) {
            return existing.clone();
        }
        let group = Group::new(d.name.clone());
        groups.insert(d.name.clone(), group.clone());
        group
    }

    pub fn embed_dataset(&self, name: &str) -> Rc<Dataset> {
        let mut datasets = self.datasets.borrow_mut();
        if let Some(existing) = datasets.get(name) {
            return existing.clone();
        }
        let dataset = Dataset::new(name);
        datasets.insert(name.to_string(), dataset.clone());
        dataset
    }

    /// Returns the embedded block and whether embedding changed any field
    /// (spec.md §8 property 3: embedding an identical object is a no-op).
    pub fn embed_block(&self, d: &DetachedBlock) -> Result<(Rc<Block>, bool), ObjectError> {
        let dataset = self
            .datasets
            .borrow()
            .get(&d.dataset_name)
            .cloned()
            .ok_or_else(|| ObjectError::DatasetNotEmbedded(d.name.clone(), d.dataset_name.clone()))?;

        if let Some(existing) = dataset.find_block(&d.name) {
            let changed = !existing.equal_fields(d);
            if changed {
                existing.set_size_raw(d.size);
                existing.set_num_files_raw(d.num_files);
                existing.is_open.set(d.is_open);
                existing.last_update.set(d.last_update);
                existing.id.set(BlockId::from_raw(d.id));
            }
            return Ok((existing, changed));
        }

        let block = Block::new(&dataset, d.name.clone(), d.size, d.num_files, d.is_open, d.last_update, d.id);
        dataset.blocks.borrow_mut().push(block.clone());
        Ok((block, true))
    }

    pub fn embed_dataset_replica(&self, dataset_name: &str, site_name: &str) -> Result<Rc<DatasetReplica>, ObjectError> {
        let dataset = self
            .datasets
            .borrow()
            .get(dataset_name)
            .cloned()
            .ok_or_else(|| ObjectError::UnknownDataset(dataset_name.to_string()))?;
        let site = self
            .sites
            .borrow()
            .get(site_name)
            .cloned()
            .ok_or_else(|| ObjectError::UnknownSite(site_name.to_string()))?;

        if let Some(existing) = dataset.find_replica(site_name) {
            return Ok(existing);
        }
        let replica = DatasetReplica::new(&dataset, &site);
        dataset.replicas.borrow_mut().push(replica.clone());
        site.dataset_replicas.borrow_mut().push(replica.clone());
        Ok(replica)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn embed_block_replica(
        &self,
        dataset_name: &str,
        block_name: &str,
        site_name: &str,
        group_name: Option<&str>,
        is_custodial: bool,
        time_created: i64,
        time_updated: i64,
    ) -> Result<Rc<BlockReplica>, ObjectError> {
        let block = self
            .block(dataset_name, block_name)
            .ok_or_else(|| ObjectError::UnknownBlock(dataset_name.to_string(), block_name.to_string()))?;
        let site = self
            .sites
            .borrow()
            .get(site_name)
            .cloned()
            .ok_or_else(|| ObjectError::UnknownSite(site_name.to_string()))?;
        let group = match group_name {
            Some(name) => Some(
                self.groups
                    .borrow()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ObjectError::UnknownGroup(name.to_string()))?,
            ),
            None => None,
        };
        let dataset_replica = self.embed_dataset_replica(dataset_name, site_name)?;

        if let Some(existing) = block.find_replica(site_name) {
            *existing.group.borrow_mut() = group;
            existing.is_custodial.set(is_custodial);
            existing.time_created.set(time_created);
            existing.time_updated.set(time_updated);
            return Ok(existing);
        }

        let replica = BlockReplica::new(&block, &site, group, is_custodial, time_created, time_updated);
        block.add_replica(&replica);
        dataset_replica.add_block_replica(replica.clone());
        site.add_block_replica(&replica);
        Ok(replica)
    }

    // -- unlink -----------------------------------------------------------

    pub fn unlink_block(&self, dataset_name: &str, block_name: &str) -> Result<(), ObjectError> {
        let dataset = self
            .datasets
            .borrow()
            .get(dataset_name)
            .cloned()
            .ok_or_else(|| ObjectError::UnknownDataset(dataset_name.to_string()))?;
        let block = dataset
            .find_block(block_name)
            .ok_or_else(|| ObjectError::UnknownBlock(dataset_name.to_string(), block_name.to_string()))?;

        for replica in block.replicas() {
            if let Some(ds_replica) = dataset.find_replica(&replica.site_name) {
                ds_replica.remove_block_replica(block_name);
            }
        }
        dataset.blocks.borrow_mut().retain(|b| b.name != block_name);
        self.file_cache.borrow_mut().evict(&block.full_name());
        Ok(())
    }

    pub fn unlink_dataset_replica(&self, dataset_name: &str, site_name: &str) -> Result<(), ObjectError> {
        let dataset = self
            .datasets
            .borrow()
            .get(dataset_name)
            .cloned()
            .ok_or_else(|| ObjectError::UnknownDataset(dataset_name.to_string()))?;
        let site = self
            .sites
            .borrow()
            .get(site_name)
            .cloned()
            .ok_or_else(|| ObjectError::UnknownSite(site_name.to_string()))?;
        let replica = dataset
            .find_replica(site_name)
            .ok_or_else(|| ObjectError::UnknownDatasetReplica(dataset_name.to_string(), site_name.to_string()))?;

        for block_replica in replica.block_replicas.borrow().iter() {
            block_replica.block.upgrade().map(|b| b.remove_replica(site_name));
        }
        dataset.replicas.borrow_mut().retain(|r| r.site_name != site_name);
        site.dataset_replicas.borrow_mut().retain(|r| r.dataset_name != dataset_name);
        Ok(())
    }

    pub fn unlink_dataset(&self, name: &str) -> Option<Rc<Dataset>> {
        self.datasets.borrow_mut().remove(name)
    }

    pub fn unlink_site(&self, name: &str) -> Option<Rc<Site>> {
        self.sites.borrow_mut().remove(name)
    }

    // -- file set access --------------------------------------------------

    /// Returns the materialized file set for `block`, consulting the cache
    /// (client-side) or the store directly (server-side), per spec.md §4.1.
    pub fn files(&self, block: &Rc<Block>, store: &dyn InventoryStore) -> Result<Rc<Vec<Rc<File>>>> {
        if let BlockId::Transient = block.id.get() {
            return Ok(Rc::new(Vec::new()));
        }
        if self.is_server_side {
            return Ok(Rc::new(self.load_from_store(block, store)?));
        }

        if let FileState::Loaded(files) = &*block.files.borrow() {
            return Ok(Rc::new(files.clone()));
        }

        let key = block.full_name();
        if let Some(set) = self.file_cache.borrow().get(&key) {
            *block.files.borrow_mut() = FileState::Cached;
            return Ok(set);
        }

        let loaded = self.load_from_store(block, store)?;
        let rc = self.file_cache.borrow_mut().put(key, loaded);
        *block.files.borrow_mut() = FileState::Cached;
        Ok(rc)
    }

    fn load_from_store(&self, block: &Rc<Block>, store: &dyn InventoryStore) -> Result<Vec<Rc<File>>> {
        let detached = store.load_files(&block.dataset_name, &block.name)?;
        let files: Vec<Rc<File>> = detached.into_iter().map(|f| File::new(f.lfn, f.size)).collect();
        let total_size: u64 = files.iter().map(|f| f.size).sum();

        if files.len() as u32 != block.num_files() {
            return Err(IntegrityError::FileCountMismatch(block.full_name(), block.num_files(), files.len() as u32).into());
        }
        if total_size != block.size() {
            return Err(IntegrityError::SizeMismatch(block.full_name(), block.size(), total_size).into());
        }
        Ok(files)
    }

    /// Forces `block`'s file set into `Loaded` state, detached from the
    /// cache, and returns an owned snapshot to mutate from.
    fn force_load_mut(&self, block: &Rc<Block>, store: &dyn InventoryStore) -> Result<Vec<Rc<File>>> {
        let snapshot = (*self.files(block, store)?).clone();
        self.file_cache.borrow_mut().evict(&block.full_name());
        *block.files.borrow_mut() = FileState::Loaded(snapshot.clone());
        Ok(snapshot)
    }

    pub fn add_file(&self, block: &Rc<Block>, file: Rc<File>, store: &dyn InventoryStore) -> Result<()> {
        let mut files = self.force_load_mut(block, store)?;
        block.set_num_files_raw(block.num_files() + 1);
        block.set_size_raw(block.size() + file.size);
        files.push(file);
        *block.files.borrow_mut() = FileState::Loaded(files);
        Ok(())
    }

    pub fn remove_file(&self, block: &Rc<Block>, lfn: &str, store: &dyn InventoryStore) -> Result<()> {
        let mut files = self.force_load_mut(block, store)?;
        let before = files.len();
        files.retain(|f| f.lfn != lfn);
        if files.len() != before {
            block.set_num_files_raw(block.num_files() - (before - files.len()) as u32);
            block.set_size_raw(files.iter().map(|f| f.size).sum());
        }
        *block.files.borrow_mut() = FileState::Loaded(files);
        Ok(())
    }

    /// Setting `size` directly force-loads the file set first if the value
    /// is actually changing (SPEC_FULL.md §3 supplement).
    pub fn set_block_size(&self, block: &Rc<Block>, new_size: u64, store: &dyn InventoryStore) -> Result<()> {
        if new_size != block.size() {
            self.force_load_mut(block, store)?;
            block.set_size_raw(new_size);
        }
        Ok(())
    }

    pub fn set_block_num_files(&self, block: &Rc<Block>, new_num_files: u32, store: &dyn InventoryStore) -> Result<()> {
        if new_num_files != block.num_files() {
            self.force_load_mut(block, store)?;
            block.set_num_files_raw(new_num_files);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::entity::DetachedFile;
    use crate::inventory::store::test_support::InMemoryStore;

    fn setup() -> (Inventory, InMemoryStore) {
        let inv = Inventory::new(false);
        inv.embed_site(&DetachedSite {
            name: "T2_US".into(),
            host: "t2.example".into(),
            storage_type: "disk".into(),
            backend: "gfal2".into(),
        });
        inv.embed_dataset("/a/b/c");
        (inv, InMemoryStore::default())
    }

    #[test]
    fn embed_block_creates_then_is_idempotent() {
        let (inv, _store) = setup();
        let detached = DetachedBlock {
            dataset_name: "/a/b/c".into(),
            name: "0".into(),
            size: 100,
            num_files: 2,
            is_open: false,
            last_update: 1,
            id: 1,
        };
        let (block, created) = inv.embed_block(&detached).unwrap();
        assert!(created);
        assert_eq!(block.size(), 100);

        let (same, changed) = inv.embed_block(&detached).unwrap();
        assert!(!changed);
        assert_eq!(same.full_name(), block.full_name());
    }

    #[test]
    fn embed_block_without_dataset_errors() {
        let inv = Inventory::new(false);
        let detached = DetachedBlock {
            dataset_name: "/missing".into(),
            name: "0".into(),
            size: 1,
            num_files: 1,
            is_open: false,
            last_update: 1,
            id: 1,
        };
        let err = inv.embed_block(&detached).unwrap_err();
        assert!(matches!(err, ObjectError::DatasetNotEmbedded(_, _)));
    }

    #[test]
    fn files_cache_hit_avoids_second_store_call() {
        let (inv, store) = setup();
        let detached = DetachedBlock {
            dataset_name: "/a/b/c".into(),
            name: "0".into(),
            size: 20,
            num_files: 2,
            is_open: false,
            last_update: 1,
            id: 1,
        };
        let (block, _) = inv.embed_block(&detached).unwrap();
        store.set_files("/a/b/c", "0", vec![
            DetachedFile { lfn: "f1".into(), size: 10 },
            DetachedFile { lfn: "f2".into(), size: 10 },
        ]);
        let first = inv.files(&block, &store).unwrap();
        assert_eq!(first.len(), 2);
        // Corrupt the store; a cache hit must not re-read it.
        store.set_files("/a/b/c", "0", vec![]);
        let second = inv.files(&block, &store).unwrap();
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn files_mismatch_is_integrity_error() {
        let (inv, store) = setup();
        let detached = DetachedBlock {
            dataset_name: "/a/b/c".into(),
            name: "0".into(),
            size: 999,
            num_files: 1,
            is_open: false,
            last_update: 1,
            id: 1,
        };
        let (block, _) = inv.embed_block(&detached).unwrap();
        store.set_files("/a/b/c", "0", vec![DetachedFile { lfn: "f1".into(), size: 10 }]);
        let err = inv.files(&block, &store).unwrap_err();
        assert!(err.downcast_ref::<IntegrityError>().is_some());
    }

    #[test]
    fn transient_block_has_empty_files_without_store_call() {
        let (inv, store) = setup();
        let detached = DetachedBlock {
            dataset_name: "/a/b/c".into(),
            name: "0".into(),
            size: 0,
            num_files: 0,
            is_open: true,
            last_update: 1,
            id: 0,
        };
        let (block, _) = inv.embed_block(&detached).unwrap();
        let files = inv.files(&block, &store).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn add_file_updates_declared_size_and_count() {
        let (inv, store) = setup();
        let detached = DetachedBlock {
            dataset_name: "/a/b/c".into(),
            name: "0".into(),
            size: 10,
            num_files: 1,
            is_open: true,
            last_update: 1,
            id: 1,
        };
        let (block, _) = inv.embed_block(&detached).unwrap();
        store.set_files("/a/b/c", "0", vec![DetachedFile { lfn: "f1".into(), size: 10 }]);
        inv.add_file(&block, File::new("f2", 5), &store).unwrap();
        assert_eq!(block.size(), 15);
        assert_eq!(block.num_files(), 2);
    }

    #[test]
    fn unlink_block_removes_it_from_dataset() {
        let (inv, _store) = setup();
        let detached = DetachedBlock {
            dataset_name: "/a/b/c".into(),
            name: "0".into(),
            size: 1,
            num_files: 1,
            is_open: false,
            last_update: 1,
            id: 1,
        };
        inv.embed_block(&detached).unwrap();
        inv.unlink_block("/a/b/c", "0").unwrap();
        assert!(inv.block("/a/b/c", "0").is_none());
    }

    /// spec.md §8 S1: embed two blocks, confirm the dataset sees both, then
    /// unlink one and confirm both the dataset and the file-set cache drop it.
    #[test]
    fn s1_embed_then_unlink_round_trips_dataset_and_file_cache() {
        let (inv, store) = setup();
        let x1 = DetachedBlock { dataset_name: "/a/b/c".into(), name: "1".into(), size: 10, num_files: 2, is_open: false, last_update: 1, id: 1 };
        let x2 = DetachedBlock { dataset_name: "/a/b/c".into(), name: "2".into(), size: 20, num_files: 3, is_open: false, last_update: 1, id: 2 };
        let (block1, _) = inv.embed_block(&x1).unwrap();
        inv.embed_block(&x2).unwrap();
        assert_eq!(inv.dataset("/a/b/c").unwrap().blocks.borrow().len(), 2);

        store.set_files("/a/b/c", "1", vec![
            DetachedFile { lfn: "f1".into(), size: 5 },
            DetachedFile { lfn: "f2".into(), size: 5 },
        ]);
        inv.files(&block1, &store).unwrap();
        assert!(inv.file_cache.borrow().contains(&block1.full_name()));

        inv.unlink_block("/a/b/c", "1").unwrap();
        assert_eq!(inv.dataset("/a/b/c").unwrap().blocks.borrow().len(), 1);
        assert!(!inv.file_cache.borrow().contains(&block1.full_name()));
    }
}
