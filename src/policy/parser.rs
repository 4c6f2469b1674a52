//! Policy line parser (component C5).
//!
//! Grounded on `original_source/lib/detox/policy.py::parse_lines`: a policy
//! file is a flat, ordered list of directives and decision lines. Four
//! directives set policy-wide parameters (`On` — the site condition the
//! policy applies within; `When` — the deletion trigger, i.e. whether a
//! site needs detoxing at all; `Until` — the stop condition for a deletion
//! run; `Order <direction> <var> [<direction> <var>…]` — the multi-key sort
//! used to pick deletion candidates), and the remaining lines are
//! `<Action> <condition>` or a single bare `<Action>` line that supplies
//! the default decision (spec.md §4.3's keyword table).

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::error::ConfigurationError;
use crate::inventory::entity::{BlockReplica, DatasetReplica, Partition};
use crate::policy::condition::{is_demand_variable, variable_type, Expr, VarType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Protect,
    Dismiss,
    Delete,
    ProtectBlock,
    DeleteBlock,
}

impl Decision {
    fn from_keyword(word: &str) -> Option<Decision> {
        match word {
            "Protect" => Some(Decision::Protect),
            "Dismiss" => Some(Decision::Dismiss),
            "Delete" => Some(Decision::Delete),
            "ProtectBlock" => Some(Decision::ProtectBlock),
            "DeleteBlock" => Some(Decision::DeleteBlock),
            _ => None,
        }
    }

    fn is_block_level(self) -> bool {
        matches!(self, Decision::ProtectBlock | Decision::DeleteBlock)
    }

    /// `ProtectBlock`/`DeleteBlock` -> `Protect`/`Delete`, used when a
    /// block-level rule's matching subset turns out to be the entire
    /// `DatasetReplica` (spec.md §4.4 "Evaluation", §8 property 7).
    fn dataset_level(self) -> Decision {
        match self {
            Decision::ProtectBlock => Decision::Protect,
            Decision::DeleteBlock => Decision::Delete,
            other => other,
        }
    }

    fn to_action(self, block_replicas: Option<Vec<Rc<BlockReplica>>>) -> Action {
        match self {
            Decision::Protect => Action::Protect,
            Decision::Dismiss => Action::Dismiss,
            Decision::Delete => Action::Delete,
            Decision::ProtectBlock => Action::ProtectBlock(block_replicas.unwrap_or_default()),
            Decision::DeleteBlock => Action::DeleteBlock(block_replicas.unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Ascending,
    Descending,
}

/// The tagged set of outcomes `Policy::evaluate` may produce (spec.md
/// §4.4: "Actions are the tagged set `{Keep, Protect, Dismiss, Delete,
/// ProtectBlock, DeleteBlock}`"). `Keep` has no parseable keyword — it
/// mirrors `original_source/lib/detox/policy.py`'s `Keep` action class,
/// defined there but never produced by `parse_lines` either — and is kept
/// for the tagged set's completeness rather than emitted by this crate.
#[derive(Debug, Clone)]
pub enum Action {
    Keep,
    Protect,
    Dismiss,
    Delete,
    ProtectBlock(Vec<Rc<BlockReplica>>),
    DeleteBlock(Vec<Rc<BlockReplica>>),
}

#[derive(Debug, Clone)]
pub struct PolicyLine {
    pub condition: Option<Expr>,
    pub decision: Decision,
    /// Per-`DatasetReplica` memoized action, keyed by replica identity
    /// (`Rc::as_ptr`, mirroring the original's plain-identity dict key).
    /// Populated only when `condition` is `Some` and static (spec.md §4.3's
    /// static/dynamic distinction, §8 property 6); `None` otherwise, so a
    /// dynamic or unconditioned line is never consulted for caching.
    cache: Option<RefCell<HashMap<usize, Option<Action>>>>,
}

impl PolicyLine {
    fn new(condition: Option<Expr>, decision: Decision) -> Self {
        let cache = match &condition {
            Some(cond) if cond.is_static() => Some(RefCell::new(HashMap::new())),
            _ => None,
        };
        PolicyLine { condition, decision, cache }
    }

    /// Evaluates this line against one `DatasetReplica`: `None` means the
    /// line didn't match (fall through to the next line); `Some(action)` is
    /// the result, already promoted to the dataset-level decision when a
    /// block-level condition's matching subset equals the whole replica
    /// (spec.md §4.4 "Evaluation", §8 property 7).
    pub(crate) fn evaluate(&self, replica: &Rc<DatasetReplica>, now: i64) -> Result<Option<Action>, ConfigurationError> {
        let condition = match &self.condition {
            // Unconditioned (default) lines match every block replica
            // trivially, so a block-level default always promotes to its
            // dataset-level variant.
            None => return Ok(Some(self.decision.dataset_level().to_action(None))),
            Some(condition) => condition,
        };

        let key = Rc::as_ptr(replica) as usize;
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.borrow().get(&key) {
                return Ok(cached.clone());
            }
        }

        let block_replicas = replica.block_replicas.borrow();
        let mut matching = Vec::new();
        for block_replica in block_replicas.iter() {
            if condition.evaluate(block_replica, now)? {
                matching.push(block_replica.clone());
            }
        }

        let action = if matching.is_empty() {
            None
        } else if self.decision.is_block_level() {
            if matching.len() == block_replicas.len() {
                Some(self.decision.dataset_level().to_action(None))
            } else {
                Some(self.decision.to_action(Some(matching)))
            }
        } else {
            Some(self.decision.to_action(None))
        };

        if let Some(cache) = &self.cache {
            cache.borrow_mut().insert(key, action.clone());
        }

        Ok(action)
    }
}

/// The detox-cycle partition (spec.md §4.4's `partition`): decides whether
/// a block replica belongs to the working set this policy run operates on.
/// The policy text format has no directive for it — a caller configures it
/// separately (see `Policy::with_partition`) before running
/// `partition_replicas`. Defaults to `Partition::all`, accepting everything.
#[derive(Debug, Clone)]
pub struct Policy {
    pub target_site: Expr,
    /// `When` — whether a site needs detoxing at all (spec.md §4.3/§4.4's
    /// `deletion_trigger`). Required, distinct from `stop_condition`.
    pub deletion_trigger: Expr,
    pub stop_condition: Expr,
    /// Multi-key sort for deletion candidates; empty means no ordering.
    /// `Order <direction> <var> [<direction> <var>…]`, direction first
    /// per spec.md §4.3 (not the variable first).
    pub order: Vec<(String, SortDir)>,
    pub lines: Vec<PolicyLine>,
    pub partition: Rc<Partition>,
    /// Caller-supplied generation counter (spec.md §4.4's `version`); the
    /// policy text format carries no directive for it, so it defaults to 0
    /// and a caller sets it via `with_version` (mirroring `with_partition`)
    /// when reloading a policy from a versioned source.
    pub version: u64,
    /// True when any rule line's condition is dynamic or emits a
    /// block-level action, meaning a single `evaluate` pass cannot be
    /// trusted to be stable across mutations and callers must re-run the
    /// engine after committing a round's decisions (spec.md §4.4).
    pub need_iteration: bool,
    /// Demand-plugin-backed variable names referenced by `target_site`,
    /// `deletion_trigger`, `stop_condition`, the rule lines, or the sort
    /// key (spec.md §4.3).
    pub used_demand_plugins: HashSet<String>,
    /// Temporary container of block replicas excluded by the last
    /// `partition_replicas` call (spec.md §4.4), consumed by
    /// `restore_replicas`. One entry per dataset replica that lost at
    /// least one block replica to the partition.
    pub(crate) untracked_replicas: RefCell<Vec<(Rc<DatasetReplica>, Vec<Rc<BlockReplica>>)>>,
}

impl Policy {
    pub fn with_partition(mut self, partition: Rc<Partition>) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }
}

pub fn parse(text: &str) -> Result<Policy, ConfigurationError> {
    let mut target_site = None;
    let mut deletion_trigger = None;
    let mut stop_condition = None;
    let mut order = Vec::new();
    let mut lines = Vec::new();
    let mut default_decision = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut words = line.splitn(2, char::is_whitespace);
        let keyword = words.next().unwrap_or("");
        let rest = words.next().unwrap_or("").trim();

        match keyword {
            "On" => {
                target_site = Some(Expr::parse(rest)?);
            }
            "When" => {
                deletion_trigger = Some(Expr::parse(rest)?);
            }
            "Until" => {
                stop_condition = Some(Expr::parse(rest)?);
            }
            "Order" => {
                order = parse_order(rest)?;
            }
            _ => {
                let decision = Decision::from_keyword(keyword)
                    .ok_or_else(|| ConfigurationError::InvalidLine(line.to_string()))?;
                if rest.is_empty() {
                    if default_decision.is_some() {
                        return Err(ConfigurationError::DuplicateDefaultDecision);
                    }
                    default_decision = Some(decision);
                } else {
                    lines.push(PolicyLine::new(Some(Expr::parse(rest)?), decision));
                }
            }
        }
    }

    let target_site = target_site.ok_or(ConfigurationError::MissingTargetSite)?;
    let deletion_trigger = deletion_trigger.ok_or(ConfigurationError::MissingDeletionTrigger)?;
    let stop_condition = stop_condition.ok_or(ConfigurationError::MissingStopCondition)?;
    let default_decision = default_decision.ok_or(ConfigurationError::MissingDefaultDecision)?;

    let mut used_demand_plugins = HashSet::new();
    for cond in [&target_site, &deletion_trigger, &stop_condition] {
        used_demand_plugins.extend(cond.demand_plugins().into_iter().map(String::from));
    }
    for (var, _) in &order {
        if is_demand_variable(var) {
            used_demand_plugins.insert(var.clone());
        }
    }

    // Mirrors `policy.py::parse_lines`: need_iteration and the rule-line
    // share of used_demand_plugins are derived from the conditioned rule
    // lines only, not the unconditioned default (appended after this loop).
    let mut need_iteration = false;
    for line in &lines {
        if let Some(cond) = &line.condition {
            used_demand_plugins.extend(cond.demand_plugins().into_iter().map(String::from));
            if !cond.is_static() {
                need_iteration = true;
            }
        }
        if line.decision.is_block_level() {
            need_iteration = true;
        }
    }

    lines.push(PolicyLine::new(None, default_decision));

    Ok(Policy {
        target_site,
        deletion_trigger,
        stop_condition,
        order,
        lines,
        partition: Rc::new(Partition::all("default")),
        version: 0,
        need_iteration,
        used_demand_plugins,
        untracked_replicas: RefCell::new(Vec::new()),
    })
}

/// `Order <direction> <var> [<direction> <var>…]`, terminated early by a
/// bare `none` token (spec.md §4.3's sort-key semantics).
fn parse_order(rest: &str) -> Result<Vec<(String, SortDir)>, ConfigurationError> {
    let words: Vec<&str> = rest.split_whitespace().collect();
    let mut order = Vec::new();
    let mut i = 0;
    while i < words.len() {
        let dir_word = words[i];
        if dir_word == "none" {
            break;
        }
        let dir = match dir_word {
            "increasing" | "asc" => SortDir::Ascending,
            "decreasing" | "desc" => SortDir::Descending,
            other => return Err(ConfigurationError::InvalidSortDirection(other.to_string())),
        };
        let var = words
            .get(i + 1)
            .ok_or_else(|| ConfigurationError::InvalidLine(format!("Order {}", rest)))?;
        if !matches!(variable_type(var), Some(VarType::Number)) {
            return Err(ConfigurationError::NonSortableVariable((*var).to_string()));
        }
        order.push((var.to_string(), dir));
        i += 2;
    }
    Ok(order)
}
