//! Policy engine (component C7).
//!
//! Grounded on `original_source/lib/detox/policy.py`'s `Policy.evaluate`/
//! `partition_replicas`/`restore_replicas`, and on the teacher's
//! `backup/prune.rs::compute_prune_info` for the outer loop's style:
//! classify every candidate in one pass, independent of any other
//! candidate's outcome, then act on the classified buckets.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::error::ConfigurationError;
use crate::inventory::entity::{Block, BlockReplica, Dataset, DatasetReplica, Site};
use crate::inventory::Inventory;
use crate::policy::condition::{variable_value, Value};
use crate::policy::parser::{Action, Policy, SortDir};

/// The action reached for one dataset replica, paired with the replica
/// itself (spec.md §4.4 "Evaluation").
pub struct Verdict {
    pub replica: Rc<DatasetReplica>,
    pub action: Action,
}

impl Policy {
    /// First matching line wins; the single line with no condition (the
    /// default, guaranteed to exist by the parser) is the fallback. See
    /// `PolicyLine::evaluate` for the block-level matching-subset/promotion
    /// and static-condition caching logic (spec.md §4.4, §8 properties 6-7).
    pub fn evaluate(&self, replica: &Rc<DatasetReplica>, now: i64) -> Result<Action, ConfigurationError> {
        for line in &self.lines {
            if let Some(action) = line.evaluate(replica, now)? {
                return Ok(action);
            }
        }
        unreachable!("parser guarantees exactly one unconditioned line")
    }

    /// A throwaway replica anchored to the real site (sharing its identity
    /// and occupancy, via `Rc::clone` rather than a copy) is enough to
    /// evaluate a site-level condition — `On`/`When` only ever inspect
    /// `site_name`/`site_occupancy`, both resolvable off that replica.
    fn pseudo_replica_at(site: &Rc<Site>) -> Rc<BlockReplica> {
        let dataset = Dataset::new("");
        let block = Block::new(&dataset, "", 0, 0, false, 0, 0);
        BlockReplica::new(&block, site, None, false, 0, 0)
    }

    pub fn applies_to_site(&self, site: &Rc<Site>, now: i64) -> Result<bool, ConfigurationError> {
        self.target_site.evaluate(&Self::pseudo_replica_at(site), now)
    }

    /// Whether `site` currently needs detoxing at all (spec.md §4.3's `When`
    /// deletion trigger, spec.md §4.4's `deletion_trigger`).
    pub fn triggers_deletion_at(&self, site: &Rc<Site>, now: i64) -> Result<bool, ConfigurationError> {
        self.deletion_trigger.evaluate(&Self::pseudo_replica_at(site), now)
    }

    /// Classifies every dataset replica into an action in one pass (no
    /// candidate's classification depends on another's). Not to be confused
    /// with `partition_replicas` below, which scopes the inventory to a
    /// detox-cycle working set rather than deciding replica fates.
    pub fn classify_replicas(&self, replicas: &[Rc<DatasetReplica>], now: i64) -> Result<Vec<Verdict>, ConfigurationError> {
        replicas
            .iter()
            .map(|r| Ok(Verdict { replica: r.clone(), action: self.evaluate(r, now)? }))
            .collect()
    }

    /// Restricts the inventory's view to `target_sites`, further narrowed
    /// by this policy's `partition` predicate (spec.md §4.4). A dataset
    /// replica at a target site keeps only its in-partition block
    /// replicas; if none remain, the whole dataset replica is removed from
    /// its dataset and site. Excluded block replicas (and fully-excluded
    /// dataset replicas) are stashed so `restore_replicas` can undo this.
    /// Replicas at sites outside `target_sites` are left untouched. Returns
    /// the dataset replicas that remain in the working set.
    pub fn partition_replicas(&self, inventory: &Inventory, target_sites: &[Rc<Site>]) -> Vec<Rc<DatasetReplica>> {
        let target_names: HashSet<&str> = target_sites.iter().map(|s| s.name.as_str()).collect();
        let mut site_dataset_replicas: HashMap<String, Vec<Rc<DatasetReplica>>> =
            target_sites.iter().map(|s| (s.name.clone(), Vec::new())).collect();
        let mut site_block_replicas: HashMap<String, Vec<Rc<BlockReplica>>> =
            target_sites.iter().map(|s| (s.name.clone(), Vec::new())).collect();
        let mut working_set = Vec::new();

        for dataset in inventory.datasets() {
            let original: Vec<Rc<DatasetReplica>> = dataset.replicas.borrow().clone();
            let mut retained = Vec::with_capacity(original.len());

            for replica in original {
                if !target_names.contains(replica.site_name.as_str()) {
                    retained.push(replica);
                    continue;
                }

                let all_block_replicas: Vec<Rc<BlockReplica>> = replica.block_replicas.borrow().clone();
                let (in_partition, out_of_partition): (Vec<_>, Vec<_>) =
                    all_block_replicas.into_iter().partition(|br| self.partition.matches(br));

                if in_partition.is_empty() {
                    self.untracked_replicas.borrow_mut().push((replica.clone(), out_of_partition));
                    replica.block_replicas.borrow_mut().clear();
                    // dropped: not pushed back into `retained`
                } else {
                    *replica.block_replicas.borrow_mut() = in_partition.clone();
                    if !out_of_partition.is_empty() {
                        self.untracked_replicas.borrow_mut().push((replica.clone(), out_of_partition));
                    }
                    site_dataset_replicas.get_mut(&replica.site_name).unwrap().push(replica.clone());
                    site_block_replicas.get_mut(&replica.site_name).unwrap().extend(in_partition);
                    retained.push(replica.clone());
                    working_set.push(replica);
                }
            }

            *dataset.replicas.borrow_mut() = retained;
        }

        for site in target_sites {
            *site.dataset_replicas.borrow_mut() = site_dataset_replicas.remove(&site.name).unwrap_or_default();
            site.set_block_replicas(site_block_replicas.remove(&site.name).unwrap_or_default());
        }

        working_set
    }

    /// Undoes `partition_replicas`, putting every stashed block replica
    /// (and fully-excluded dataset replica) back into its dataset and site.
    pub fn restore_replicas(&self) {
        let stashed: Vec<(Rc<DatasetReplica>, Vec<Rc<BlockReplica>>)> =
            self.untracked_replicas.borrow_mut().drain(..).collect();

        for (replica, block_replicas) in stashed {
            if let Some(dataset) = replica.dataset() {
                let mut replicas = dataset.replicas.borrow_mut();
                if !replicas.iter().any(|r| Rc::ptr_eq(r, &replica)) {
                    replicas.push(replica.clone());
                }
            }

            if let Some(site) = replica.site.upgrade() {
                let mut site_replicas = site.dataset_replicas.borrow_mut();
                if !site_replicas.iter().any(|r| Rc::ptr_eq(r, &replica)) {
                    site_replicas.push(replica.clone());
                }
                drop(site_replicas);
                for block_replica in &block_replicas {
                    site.add_block_replica(block_replica);
                }
            }

            replica.block_replicas.borrow_mut().extend(block_replicas);
        }
    }

    /// Among the replicas marked for deletion, returns the block replicas
    /// to remove ordered per the policy's `Order` directive (multi-key
    /// lexicographic; oldest/largest/etc. first), stopping (excluding) at
    /// the first one for which the stop condition holds. `Action::Delete`
    /// contributes every block replica of its dataset replica;
    /// `Action::DeleteBlock` contributes only its matching subset.
    pub fn deletion_candidates(&self, verdicts: &[Verdict], now: i64) -> Result<Vec<Rc<BlockReplica>>, ConfigurationError> {
        let mut candidates: Vec<Rc<BlockReplica>> = verdicts
            .iter()
            .flat_map(|v| match &v.action {
                Action::Delete => v.replica.block_replicas.borrow().clone(),
                Action::DeleteBlock(subset) => subset.clone(),
                _ => Vec::new(),
            })
            .collect();

        candidates.sort_by(|a, b| {
            for (var, dir) in &self.order {
                let av = variable_value(var, a, now);
                let bv = variable_value(var, b, now);
                let ordering = match (av, bv) {
                    (Some(Value::Number(x)), Some(Value::Number(y))) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                };
                let ordering = match dir {
                    SortDir::Ascending => ordering,
                    SortDir::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });

        let mut result = Vec::with_capacity(candidates.len());
        for replica in candidates {
            if self.stop_condition.evaluate(&replica, now)? {
                break;
            }
            result.push(replica);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::entity::{Block, Dataset, DetachedBlock, DetachedSite, Partition, Site};
    use crate::policy::parser::parse;

    /// Builds one `DatasetReplica` with a single `BlockReplica` of the
    /// given age/custodial-ness, wired up through the owned graph.
    fn dataset_replica_with_age(site_name: &str, age_created_at: i64, custodial: bool) -> Rc<DatasetReplica> {
        let site = Site::new(site_name, "h".into(), "disk".into(), "gfal2".into());
        let dataset = Dataset::new("/a/b/c");
        let block = Block::new(&dataset, "0", 100, 1, false, 0, 1);
        let block_replica = BlockReplica::new(&block, &site, None, custodial, age_created_at, age_created_at);
        let dataset_replica = DatasetReplica::new(&dataset, &site);
        dataset_replica.add_block_replica(block_replica);
        dataset_replica
    }

    const POLICY_TEXT: &str = "
        On site_name == T2_*
        When site_occupancy >= 0
        Until replica_age < 1000
        Order decreasing replica_age
        Protect is_custodial == 1
        Delete
    ";

    #[test]
    fn custodial_replicas_are_protected() {
        let policy = parse(POLICY_TEXT).unwrap();
        let replica = dataset_replica_with_age("T2_US", 0, true);
        assert!(matches!(policy.evaluate(&replica, 10_000).unwrap(), Action::Protect));
    }

    #[test]
    fn non_custodial_replicas_are_deleted_by_default() {
        let policy = parse(POLICY_TEXT).unwrap();
        let replica = dataset_replica_with_age("T2_US", 0, false);
        assert!(matches!(policy.evaluate(&replica, 10_000).unwrap(), Action::Delete));
    }

    #[test]
    fn deletion_stops_once_stop_condition_is_met() {
        let policy = parse(POLICY_TEXT).unwrap();
        let now = 10_000;
        // oldest first due to `decreasing` order on replica_age
        let old = dataset_replica_with_age("T2_US", 0, false); // age 10000
        let recent = dataset_replica_with_age("T2_US", 9_500, false); // age 500 < 1000 stop condition
        let verdicts = policy.classify_replicas(&[old.clone(), recent.clone()], now).unwrap();
        let candidates = policy.deletion_candidates(&verdicts, now).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].site_name, old.site_name);
        assert_eq!(candidates[0].time_created.get(), old.block_replicas.borrow()[0].time_created.get());
    }

    /// spec.md §8 property 7: a `DeleteBlock` rule whose matching subset is
    /// every block replica of the dataset replica promotes to `Delete`;
    /// when only some blocks match, the subset is carried on `DeleteBlock`.
    #[test]
    fn block_level_rule_promotes_to_dataset_level_when_the_whole_replica_matches() {
        const BLOCK_POLICY: &str = "
            On site_name == *
            When site_occupancy >= 0
            Until replica_age < 0
            DeleteBlock is_custodial == 0
            Protect
        ";
        let policy = parse(BLOCK_POLICY).unwrap();

        let site = Site::new("S1", "h".into(), "disk".into(), "gfal2".into());
        let dataset = Dataset::new("/d");
        let replica = DatasetReplica::new(&dataset, &site);
        for name in ["b1", "b2"] {
            let block = Block::new(&dataset, name, 100, 1, false, 0, 1);
            replica.add_block_replica(BlockReplica::new(&block, &site, None, false, 0, 0));
        }

        assert!(matches!(policy.evaluate(&replica, 0).unwrap(), Action::Delete));
    }

    #[test]
    fn block_level_rule_carries_only_the_matching_subset() {
        const BLOCK_POLICY: &str = "
            On site_name == *
            When site_occupancy >= 0
            Until replica_age < 0
            DeleteBlock is_custodial == 0
            Protect
        ";
        let policy = parse(BLOCK_POLICY).unwrap();

        let site = Site::new("S1", "h".into(), "disk".into(), "gfal2".into());
        let dataset = Dataset::new("/d");
        let replica = DatasetReplica::new(&dataset, &site);

        let custodial_block = Block::new(&dataset, "b1", 100, 1, false, 0, 1);
        let custodial = BlockReplica::new(&custodial_block, &site, None, true, 0, 0);
        replica.add_block_replica(custodial.clone());

        let non_custodial_block = Block::new(&dataset, "b2", 100, 1, false, 0, 1);
        let non_custodial = BlockReplica::new(&non_custodial_block, &site, None, false, 0, 0);
        replica.add_block_replica(non_custodial.clone());

        match policy.evaluate(&replica, 0).unwrap() {
            Action::DeleteBlock(subset) => {
                assert_eq!(subset.len(), 1);
                assert_eq!(subset[0].block_name, "b2");
            }
            other => panic!("expected DeleteBlock, got {:?}", other),
        }
    }

    #[test]
    fn partition_then_restore_returns_inventory_to_original_state() {
        let inventory = Inventory::new(false);
        for name in ["S1", "S2"] {
            inventory.embed_site(&DetachedSite { name: name.into(), host: "h".into(), storage_type: "disk".into(), backend: "gfal2".into() });
        }
        inventory.embed_dataset("/d");
        for (i, block) in ["b1", "b2", "b3"].iter().enumerate() {
            inventory
                .embed_block(&DetachedBlock { dataset_name: "/d".into(), name: block.to_string(), size: 100, num_files: 1, is_open: false, last_update: 0, id: i as u64 })
                .unwrap();
        }
        for site in ["S1", "S2"] {
            for block in ["b1", "b2", "b3"] {
                inventory.embed_block_replica("/d", block, site, None, false, 0, 0).unwrap();
            }
        }

        let s1 = inventory.site("S1").unwrap();
        let s2 = inventory.site("S2").unwrap();
        assert_eq!(s1.block_replicas().len(), 3);
        assert_eq!(s2.block_replicas().len(), 3);

        // In partition: {b1, b2} at S1 only.
        let partition = Rc::new(Partition::new("only-s1-b1-b2", |br: &BlockReplica| {
            br.site_name == "S1" && (br.block_name == "b1" || br.block_name == "b2")
        }));
        let policy = parse(POLICY_TEXT).unwrap().with_partition(partition);

        let working_set = policy.partition_replicas(&inventory, &[s1.clone(), s2.clone()]);
        assert_eq!(working_set.len(), 1);
        assert_eq!(working_set[0].site_name, "S1");

        assert!(s2.find_dataset_replica("/d").is_none());
        assert_eq!(s2.block_replicas().len(), 0);
        let s1_replica = s1.find_dataset_replica("/d").unwrap();
        assert_eq!(s1_replica.block_replicas.borrow().len(), 2);
        assert_eq!(s1.block_replicas().len(), 2);

        policy.restore_replicas();

        let s1_replica = s1.find_dataset_replica("/d").unwrap();
        let s2_replica = s2.find_dataset_replica("/d").unwrap();
        assert_eq!(s1_replica.block_replicas.borrow().len(), 3);
        assert_eq!(s2_replica.block_replicas.borrow().len(), 3);
        assert_eq!(s1.block_replicas().len(), 3);
        assert_eq!(s2.block_replicas().len(), 3);
    }

    /// spec.md §8 S3, evaluated verbatim.
    #[test]
    fn s3_protect_delete_dismiss_per_the_worked_policy_text() {
        const S3_POLICY: &str = r#"
            On site_name == "*"
            When site_occupancy > 0.9
            Until site_occupancy < 0.85
            Order decreasing replica_size
            Protect dataset_name == "/keep/me/*"
            Delete replica_age > 30
            Dismiss
        "#;
        let policy = parse(S3_POLICY).unwrap();
        let now = 1_000_000;
        let day = 86_400;

        let replica_in = |dataset_name: &str, created_at: i64| -> Rc<DatasetReplica> {
            let site = Site::new("S", "h".into(), "disk".into(), "gfal2".into());
            let dataset = Dataset::new(dataset_name);
            let block = Block::new(&dataset, "0", 100, 1, false, 0, 1);
            let block_replica = BlockReplica::new(&block, &site, None, false, created_at, created_at);
            let dataset_replica = DatasetReplica::new(&dataset, &site);
            dataset_replica.add_block_replica(block_replica);
            dataset_replica
        };

        let keep = replica_in("/keep/me/X", now);
        assert!(matches!(policy.evaluate(&keep, now).unwrap(), Action::Protect));

        let old = replica_in("/other/Y", now - 40 * day);
        assert!(matches!(policy.evaluate(&old, now).unwrap(), Action::Delete));

        let fresh = replica_in("/other/Z", now - 5 * day);
        assert!(matches!(policy.evaluate(&fresh, now).unwrap(), Action::Dismiss));
    }
}
