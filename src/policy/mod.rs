//! Policy parsing and evaluation (components C5, C6, C7).

pub mod condition;
pub mod engine;
pub mod parser;

pub use engine::Verdict;
pub use parser::{Action, Decision, Policy, PolicyLine, SortDir};
