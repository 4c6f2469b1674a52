//! Configuration shapes (ambient stack supplement, SPEC_FULL.md §2).
//!
//! No CLI argument parser is implemented (out of scope, spec.md §1); a
//! binary entry point reads a single JSON config path and deserializes it
//! with `serde`, following the teacher's `configdir!`/`buildcfg.rs`
//! convention for well-known paths rather than a bundled config format.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// TLS and socket parameters for the mutual-TLS application server (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
    pub cafile: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    pub work_area_root: PathBuf,
    #[serde(default)]
    pub allow_proxy_certs: bool,
    /// Interpreter used to run a submitted application's materialized
    /// `exec.py` (spec.md §4.6's `submit` command). Matches the original's
    /// Python-script convention; kept configurable rather than hardcoded
    /// so a deployment can point at a specific interpreter.
    #[serde(default = "default_exec_interpreter")]
    pub exec_interpreter: String,
}

fn default_port() -> u16 {
    crate::buildcfg::APP_SERVER_PORT
}

fn default_exec_interpreter() -> String {
    "python3".to_string()
}

/// One lock-source endpoint to poll (C8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSourceConfig {
    pub name: String,
    pub url: String,
    pub content_type: LockContentType,
    /// `fnmatch`-style glob restricting which sites this source's entries
    /// apply to; only consulted for `ListOfDatasets`/`CmswebListOfDatasets`.
    #[serde(default = "default_site_pattern")]
    pub site_pattern: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// When set, polled until it 404s ("no lock on the lock file") before
    /// the source itself is fetched; each non-404 response sleeps 60 s and
    /// retries (spec.md §4.5).
    #[serde(default)]
    pub lock_url: Option<String>,
}

fn default_site_pattern() -> String {
    "*".to_string()
}

fn default_poll_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockContentType {
    ListOfDatasets,
    CmswebListOfDatasets,
    SiteToDatasets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub lock_sources: Vec<LockSourceConfig>,
}

impl RootConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config file {:?}", path))?;
        let config: RootConfig = serde_json::from_str(&text).with_context(|| format!("parsing config file {:?}", path))?;
        Ok(config)
    }
}
