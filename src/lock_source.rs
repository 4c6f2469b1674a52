//! Lock-source aggregator (component C8).
//!
//! Grounded on `original_source/lib/policy/producers/weblock.py`: polls a
//! set of web endpoints for dataset/block locks and merges them into each
//! dataset's `locked_blocks` attribute. Content shapes mirror the Python
//! original's three producer kinds (`LIST_OF_DATASETS`,
//! `CMSWEB_LIST_OF_DATASETS`, `SITE_TO_DATASETS`).
//!
//! Resolves spec.md §9's lock-precedence Open Question (see DESIGN.md,
//! decision 2): a dataset-level lock (`None`, "every block is locked")
//! always wins over a block-level lock at the same site, independent of
//! which source reported it first.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;

use crate::config::{LockContentType, LockSourceConfig};
use crate::inventory::entity::LockedBlocks;
use crate::inventory::Inventory;
use crate::tools::http::SimpleHttp;

/// Merge one `(site, block)` observation into a dataset's lock map. Once a
/// site's entry is `None` (whole dataset locked) it is never downgraded to
/// a block-level set by a later, less specific observation.
pub fn merge_lock(locked: &mut LockedBlocks, site_name: &str, block_name: Option<&str>) {
    if let Some(None) = locked.get(site_name) {
        return;
    }
    match block_name {
        None => {
            locked.insert(site_name.to_string(), None);
        }
        Some(block) => match locked.get_mut(site_name) {
            Some(Some(set)) => {
                set.insert(block.to_string());
            }
            _ => {
                let mut set = HashSet::new();
                set.insert(block.to_string());
                locked.insert(site_name.to_string(), Some(set));
            }
        },
    }
}

/// One parsed lock observation: `site_name = None` means "every site
/// matching the source's configured glob"; `block_name = None` means the
/// whole dataset is locked.
struct Observation {
    dataset_name: String,
    site_name: Option<String>,
    block_name: Option<String>,
}

fn parse_body(content_type: LockContentType, body: &str) -> Result<Vec<Observation>> {
    let value: Value = serde_json::from_str(body).context("lock source response is not valid JSON")?;

    match content_type {
        LockContentType::ListOfDatasets => {
            let datasets = value.as_array().context("expected a JSON array of dataset names")?;
            Ok(datasets
                .iter()
                .filter_map(|v| v.as_str())
                .map(|name| Observation { dataset_name: name.to_string(), site_name: None, block_name: None })
                .collect())
        }
        LockContentType::CmswebListOfDatasets => {
            let datasets = value
                .get("result")
                .and_then(Value::as_array)
                .context("expected an object with a 'result' array")?;
            Ok(datasets
                .iter()
                .filter_map(|v| v.as_str())
                .map(|name| Observation { dataset_name: name.to_string(), site_name: None, block_name: None })
                .collect())
        }
        LockContentType::SiteToDatasets => {
            let obj = value.as_object().context("expected a JSON object mapping site name to lock entries")?;
            let mut observations = Vec::new();
            for (site_name, entries) in obj {
                let entries = entries
                    .as_object()
                    .context("expected an object of {object: {lock: bool, ...}} per site")?;
                for (object_name, detail) in entries {
                    let locked = detail.get("lock").and_then(Value::as_bool).unwrap_or(false);
                    if !locked {
                        continue;
                    }
                    let (dataset_name, block_name) = match object_name.split_once('#') {
                        Some((dataset, block)) => (dataset.to_string(), Some(block.to_string())),
                        None => (object_name.clone(), None),
                    };
                    observations.push(Observation { dataset_name, site_name: Some(site_name.clone()), block_name });
                }
            }
            Ok(observations)
        }
    }
}

/// Applies one source's parsed observations to the inventory, expanding
/// site-less observations against every site name matching the source's
/// configured glob.
pub fn apply_observations(inventory: &Inventory, config: &LockSourceConfig, observations: &[Observation]) {
    let pattern = glob_to_regex(&config.site_pattern);

    for obs in observations {
        let dataset = match inventory.dataset(&obs.dataset_name) {
            Some(d) => d,
            None => continue,
        };

        let site_names: Vec<String> = match &obs.site_name {
            Some(name) => vec![name.clone()],
            None => inventory
                .sites()
                .into_iter()
                .map(|s| s.name.clone())
                .filter(|name| pattern.is_match(name))
                .collect(),
        };

        let mut attr = dataset.attr.borrow_mut();
        let locked = attr.locked_blocks.get_or_insert_with(LockedBlocks::new);
        for site_name in site_names {
            merge_lock(locked, &site_name, obs.block_name.as_deref());
        }
    }
}

fn glob_to_regex(glob: &str) -> Regex {
    let escaped = regex::escape(glob).replace("\\*", ".*").replace("\\?", ".");
    Regex::new(&format!("^{}$", escaped)).unwrap_or_else(|_| Regex::new("^$").unwrap())
}

/// Blocks until `lock_url` 404s ("no lock on the lock file"), sleeping 60 s
/// between busy responses (spec.md §4.5).
async fn wait_for_unlock(client: &SimpleHttp, lock_url: &str) -> Result<()> {
    loop {
        let status = client.get_status(lock_url).await.with_context(|| format!("polling lock file '{}'", lock_url))?;
        if status == 404 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}

/// Fetches and applies one source's current lock state. Does not clear
/// `locked_blocks` itself — callers merging several sources into one
/// update cycle must clear once, before any source's `refresh_once` runs
/// (see `update`).
pub async fn refresh_once(inventory: &Inventory, client: &SimpleHttp, config: &LockSourceConfig) -> Result<()> {
    if let Some(lock_url) = &config.lock_url {
        wait_for_unlock(client, lock_url).await?;
    }
    let body = client.get_string(&config.url).await.with_context(|| format!("fetching lock source '{}'", config.name))?;
    let observations = parse_body(config.content_type, &body)?;
    apply_observations(inventory, config, &observations);
    Ok(())
}

/// Clears every dataset's `locked_blocks` (spec.md §4.5, §8 property 10).
pub fn clear_locked_blocks(inventory: &Inventory) {
    for dataset in inventory.datasets() {
        dataset.attr.borrow_mut().locked_blocks = None;
    }
}

/// Runs one update cycle: clears `locked_blocks` on every dataset, then
/// fetches and merges each configured source in turn, mirroring the
/// original's `WebReplicaLock.update` — a single clear followed by a
/// sequential pass over all sources, not one independent loop per source
/// (spec.md §4.5: "Clear `locked_blocks` on all datasets before merging
/// all sources"). A source that fails to fetch is logged and skipped; it
/// does not stop the remaining sources from merging into this cycle.
pub async fn update(inventory: &Inventory, client: &SimpleHttp, configs: &[LockSourceConfig]) {
    clear_locked_blocks(inventory);
    for config in configs {
        if let Err(err) = refresh_once(inventory, client, config).await {
            log::warn!("lock source '{}' refresh failed: {:#}", config.name, err);
        }
    }
}

/// Runs `update` forever, sleeping between cycles for the shortest
/// configured `poll_interval_secs` (falling back to the default interval
/// when no sources are configured).
pub async fn run_forever(inventory: std::rc::Rc<Inventory>, client: SimpleHttp, configs: Vec<LockSourceConfig>) {
    let cycle_interval = configs.iter().map(|c| c.poll_interval_secs).min().unwrap_or(3600);
    loop {
        update(&inventory, &client, &configs).await;
        tokio::time::sleep(Duration::from_secs(cycle_interval)).await;
    }
}
