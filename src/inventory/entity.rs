//! Inventory graph entities (component C1 of SPEC_FULL.md).
//!
//! In-inventory entities form a small owned graph: `Inventory` owns `Site`/
//! `Group`/`Dataset` by name, `Dataset` owns its `Block`s, `Site` owns its
//! `DatasetReplica`s, and `DatasetReplica` owns its `BlockReplica`s. Back
//! edges (`Block` -> `Dataset`, `BlockReplica` -> `Site`/`Block`) are
//! `Weak` so the graph has no reference cycles (see DESIGN.md, "Cyclic
//! back-references").
//!
//! Detached variants (`Detached*`) are plain, serializable data — the shape
//! an update-board command or a catalog client hands to `Inventory::embed`.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

/// A block's persistence identity. Blocks that were never written to the
/// store (`Transient`) are defined to have an empty file set and are never
/// sent to the store for loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Transient,
    Persisted(u64),
}

impl BlockId {
    pub fn from_raw(id: u64) -> Self {
        if id == 0 {
            BlockId::Transient
        } else {
            BlockId::Persisted(id)
        }
    }
}

/// Per-dataset attribute bag. `locked_blocks` is populated by the
/// lock-source aggregator (C8); `None` at the top level means "no lock
/// information has been computed for this dataset".
pub type LockedBlocks = HashMap<String, Option<HashSet<String>>>;

#[derive(Debug, Clone, Default)]
pub struct AttrMap {
    pub locked_blocks: Option<LockedBlocks>,
}

// ---------------------------------------------------------------------
// Detached (plain, serializable) entities
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedSite {
    pub name: String,
    pub host: String,
    pub storage_type: String,
    pub backend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedGroup {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedFile {
    pub lfn: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedBlock {
    pub dataset_name: String,
    pub name: String,
    pub size: u64,
    pub num_files: u32,
    pub is_open: bool,
    pub last_update: i64,
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedDataset {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedBlockReplica {
    pub dataset_name: String,
    pub block_name: String,
    pub site_name: String,
    pub group_name: Option<String>,
    pub is_custodial: bool,
    pub time_created: i64,
    pub time_updated: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedDatasetReplica {
    pub dataset_name: String,
    pub site_name: String,
    pub block_replicas: Vec<DetachedBlockReplica>,
}

// ---------------------------------------------------------------------
// In-inventory (linked) entities
// ---------------------------------------------------------------------

pub struct Site {
    pub name: String,
    pub host: RefCell<String>,
    pub storage_type: RefCell<String>,
    pub backend: RefCell<String>,
    pub dataset_replicas: RefCell<Vec<Rc<DatasetReplica>>>,
    block_replicas: RefCell<Vec<Weak<BlockReplica>>>,
    occupancy: Cell<u64>,
}

impl Site {
    pub fn new(name: impl Into<String>, host: String, storage_type: String, backend: String) -> Rc<Self> {
        Rc::new(Site {
            name: name.into(),
            host: RefCell::new(host),
            storage_type: RefCell::new(storage_type),
            backend: RefCell::new(backend),
            dataset_replicas: RefCell::new(Vec::new()),
            block_replicas: RefCell::new(Vec::new()),
            occupancy: Cell::new(0),
        })
    }

    pub fn occupancy(&self) -> u64 {
        self.occupancy.get()
    }

    pub fn find_dataset_replica(&self, dataset_name: &str) -> Option<Rc<DatasetReplica>> {
        self.dataset_replicas
            .borrow()
            .iter()
            .find(|r| r.dataset_name == dataset_name)
            .cloned()
    }

    /// Rebuild the transitive block-replica list and recompute occupancy
    /// (spec.md §3: "`set_block_replicas` recomputes occupancy").
    pub fn set_block_replicas(&self, replicas: Vec<Rc<BlockReplica>>) {
        let total: u64 = replicas.iter().map(|r| r.block_size()).sum();
        self.occupancy.set(total);
        *self.block_replicas.borrow_mut() = replicas.iter().map(Rc::downgrade).collect();
    }

    pub fn add_block_replica(&self, replica: &Rc<BlockReplica>) {
        self.block_replicas.borrow_mut().push(Rc::downgrade(replica));
        self.occupancy.set(self.occupancy.get() + replica.block_size());
    }

    pub fn block_replicas(&self) -> Vec<Rc<BlockReplica>> {
        self.block_replicas
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

#[derive(Debug)]
pub struct Group {
    pub name: String,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Rc<Self> {
        Rc::new(Group { name: name.into() })
    }
}

#[derive(Debug)]
pub struct File {
    pub lfn: String,
    pub size: u64,
}

impl File {
    pub fn new(lfn: impl Into<String>, size: u64) -> Rc<Self> {
        Rc::new(File { lfn: lfn.into(), size })
    }
}

/// `Unloaded`: never fetched. `Cached`: the authoritative set lives in the
/// inventory's `FileCache`, keyed by this block's full name — look there
/// first, and fall back to `Unloaded` semantics if the entry was evicted.
/// `Loaded`: materialized and detached from the cache (forced by a mutation).
#[derive(Debug)]
pub enum FileState {
    Unloaded,
    Cached,
    Loaded(Vec<Rc<File>>),
}

#[derive(Debug)]
pub struct Block {
    pub name: String,
    dataset: RefCell<Weak<Dataset>>,
    pub dataset_name: String,
    pub id: Cell<BlockId>,
    size: Cell<u64>,
    num_files: Cell<u32>,
    pub is_open: Cell<bool>,
    pub last_update: Cell<i64>,
    pub(crate) files: RefCell<FileState>,
    replicas: RefCell<Vec<Weak<BlockReplica>>>,
}

impl Block {
    pub fn new(
        dataset: &Rc<Dataset>,
        name: impl Into<String>,
        size: u64,
        num_files: u32,
        is_open: bool,
        last_update: i64,
        id: u64,
    ) -> Rc<Self> {
        Rc::new(Block {
            name: name.into(),
            dataset_name: dataset.name.clone(),
            dataset: RefCell::new(Rc::downgrade(dataset)),
            id: Cell::new(BlockId::from_raw(id)),
            size: Cell::new(size),
            num_files: Cell::new(num_files),
            is_open: Cell::new(is_open),
            last_update: Cell::new(last_update),
            files: RefCell::new(FileState::Unloaded),
            replicas: RefCell::new(Vec::new()),
        })
    }

    pub fn dataset(&self) -> Option<Rc<Dataset>> {
        self.dataset.borrow().upgrade()
    }

    pub fn full_name(&self) -> String {
        format!("{}#{}", self.dataset_name, self.name)
    }

    pub fn size(&self) -> u64 {
        self.size.get()
    }

    pub fn num_files(&self) -> u32 {
        self.num_files.get()
    }

    /// Direct setter used by field-copy on embed; callers that need the
    /// load-before-change guard (spec.md §3 supplement) should go through
    /// `Inventory::set_block_size`.
    pub(crate) fn set_size_raw(&self, value: u64) {
        self.size.set(value);
    }

    pub(crate) fn set_num_files_raw(&self, value: u32) {
        self.num_files.set(value);
    }

    pub fn add_replica(&self, replica: &Rc<BlockReplica>) {
        self.replicas.borrow_mut().push(Rc::downgrade(replica));
    }

    pub fn remove_replica(&self, site_name: &str) {
        self.replicas
            .borrow_mut()
            .retain(|r| r.upgrade().map_or(false, |r| r.site_name() != site_name));
    }

    pub fn replicas(&self) -> Vec<Rc<BlockReplica>> {
        self.replicas.borrow().iter().filter_map(Weak::upgrade).collect()
    }

    pub fn find_replica(&self, site_name: &str) -> Option<Rc<BlockReplica>> {
        self.replicas().into_iter().find(|r| r.site_name() == site_name)
    }

    /// Field-wise equality used by `Inventory::update`'s idempotence check
    /// (spec.md §4.1, §8 property 3) — compares by value, not identity.
    pub fn equal_fields(&self, other: &DetachedBlock) -> bool {
        self.name == other.name
            && self.dataset_name == other.dataset_name
            && self.size() == other.size
            && self.num_files() == other.num_files
            && self.is_open.get() == other.is_open
            && self.last_update.get() == other.last_update
    }
}

pub struct Dataset {
    pub name: String,
    pub blocks: RefCell<Vec<Rc<Block>>>,
    pub replicas: RefCell<Vec<Rc<DatasetReplica>>>,
    pub attr: RefCell<AttrMap>,
}

impl Dataset {
    pub fn new(name: impl Into<String>) -> Rc<Self> {
        Rc::new(Dataset {
            name: name.into(),
            blocks: RefCell::new(Vec::new()),
            replicas: RefCell::new(Vec::new()),
            attr: RefCell::new(AttrMap::default()),
        })
    }

    pub fn find_block(&self, name: &str) -> Option<Rc<Block>> {
        self.blocks.borrow().iter().find(|b| b.name == name).cloned()
    }

    pub fn find_replica(&self, site_name: &str) -> Option<Rc<DatasetReplica>> {
        self.replicas
            .borrow()
            .iter()
            .find(|r| r.site_name == site_name)
            .cloned()
    }
}

#[derive(Debug)]
pub struct BlockReplica {
    pub block: Weak<Block>,
    pub site: Weak<Site>,
    pub dataset_name: String,
    pub block_name: String,
    pub site_name: String,
    pub group: RefCell<Option<Rc<Group>>>,
    pub is_custodial: Cell<bool>,
    pub time_created: Cell<i64>,
    pub time_updated: Cell<i64>,
}

impl BlockReplica {
    pub fn new(
        block: &Rc<Block>,
        site: &Rc<Site>,
        group: Option<Rc<Group>>,
        is_custodial: bool,
        time_created: i64,
        time_updated: i64,
    ) -> Rc<Self> {
        Rc::new(BlockReplica {
            block: Rc::downgrade(block),
            site: Rc::downgrade(site),
            dataset_name: block.dataset_name.clone(),
            block_name: block.name.clone(),
            site_name: site.name.clone(),
            group: RefCell::new(group),
            is_custodial: Cell::new(is_custodial),
            time_created: Cell::new(time_created),
            time_updated: Cell::new(time_updated),
        })
    }

    pub fn site_name(&self) -> &str {
        &self.site_name
    }

    pub fn block_size(&self) -> u64 {
        self.block.upgrade().map(|b| b.size()).unwrap_or(0)
    }

    pub fn full_block_name(&self) -> String {
        format!("{}#{}", self.dataset_name, self.block_name)
    }
}

#[derive(Debug)]
pub struct DatasetReplica {
    pub dataset: Weak<Dataset>,
    pub site: Weak<Site>,
    pub dataset_name: String,
    pub site_name: String,
    pub block_replicas: RefCell<Vec<Rc<BlockReplica>>>,
}

impl DatasetReplica {
    pub fn new(dataset: &Rc<Dataset>, site: &Rc<Site>) -> Rc<Self> {
        Rc::new(DatasetReplica {
            dataset: Rc::downgrade(dataset),
            site: Rc::downgrade(site),
            dataset_name: dataset.name.clone(),
            site_name: site.name.clone(),
            block_replicas: RefCell::new(Vec::new()),
        })
    }

    pub fn dataset(&self) -> Option<Rc<Dataset>> {
        self.dataset.upgrade()
    }

    pub fn site(&self) -> Option<Rc<Site>> {
        self.site.upgrade()
    }

    pub fn is_partial(&self) -> bool {
        let full_block_count = self
            .dataset()
            .map(|d| d.blocks.borrow().len())
            .unwrap_or(0);
        self.block_replicas.borrow().len() < full_block_count
    }

    pub fn is_custodial(&self) -> bool {
        self.block_replicas.borrow().iter().any(|br| br.is_custodial.get())
    }

    pub fn add_block_replica(&self, replica: Rc<BlockReplica>) {
        self.block_replicas.borrow_mut().push(replica);
    }

    pub fn remove_block_replica(&self, block_name: &str) {
        self.block_replicas.borrow_mut().retain(|br| br.block_name != block_name);
    }
}

/// A named predicate over `BlockReplica` (spec.md §3, "Partition").
pub struct Partition {
    pub name: String,
    predicate: Box<dyn Fn(&BlockReplica) -> bool>,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition").field("name", &self.name).finish()
    }
}

impl Partition {
    pub fn new(name: impl Into<String>, predicate: impl Fn(&BlockReplica) -> bool + 'static) -> Self {
        Partition { name: name.into(), predicate: Box::new(predicate) }
    }

    pub fn matches(&self, replica: &BlockReplica) -> bool {
        (self.predicate)(replica)
    }

    /// A partition that accepts every block replica — the default view.
    pub fn all(name: impl Into<String>) -> Self {
        Partition::new(name, |_| true)
    }
}
