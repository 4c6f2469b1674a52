//! Error taxonomy for the inventory, policy and application-server subsystems.
//!
//! Each variant maps to one of the four kinds spec'd for the core: structural
//! object errors, detected data-integrity faults, illegal operations for the
//! current mode, and malformed policy/config text. All four convert into
//! `anyhow::Error` via `#[from]` so callers can use `?` freely and only
//! downcast when they need to distinguish a kind.

use thiserror::Error;

/// Structural errors: unknown parent, malformed name, entity not found when required.
#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("unknown dataset '{0}'")]
    UnknownDataset(String),
    #[error("unknown block '{0}#{1}'")]
    UnknownBlock(String, String),
    #[error("unknown site '{0}'")]
    UnknownSite(String),
    #[error("unknown group '{0}'")]
    UnknownGroup(String),
    #[error("invalid block name '{0}'")]
    InvalidBlockName(String),
    #[error("cannot embed block '{0}' before its dataset '{1}' exists")]
    DatasetNotEmbedded(String, String),
    #[error("replica not found for block '{0}' at site '{1}'")]
    UnknownBlockReplica(String, String),
    #[error("replica not found for dataset '{0}' at site '{1}'")]
    UnknownDatasetReplica(String, String),
}

/// Detected inconsistency between declared and materialized state.
#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("number of files mismatch in {0}: declared {1}, loaded {2}")]
    FileCountMismatch(String, u32, u32),
    #[error("size mismatch in {0}: declared {1}, loaded {2}")]
    SizeMismatch(String, u64, u64),
}

/// An operation that is illegal given the current mode (e.g. server-side inventory).
#[derive(Error, Debug)]
pub enum OperationalError {
    #[error("non-cache file load is not allowed on the server side for block {0}")]
    NonCacheLoadOnServerSide(String),
    #[error("{0}")]
    IllegalCommand(String),
}

/// Malformed policy text or configuration.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("invalid policy line: {0}")]
    InvalidLine(String),
    #[error("target site definition missing")]
    MissingTargetSite,
    #[error("deletion trigger missing")]
    MissingDeletionTrigger,
    #[error("stop condition missing")]
    MissingStopCondition,
    #[error("default decision missing")]
    MissingDefaultDecision,
    #[error("default decision given more than once")]
    DuplicateDefaultDecision,
    #[error("invalid sort direction '{0}'")]
    InvalidSortDirection(String),
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("cannot sort by non-numeric, non-time variable '{0}'")]
    NonSortableVariable(String),
    #[error("condition parse error: {0}")]
    ConditionParseError(String),
}
