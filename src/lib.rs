//! Core inventory, policy and application-server library for a scientific
//! data management federation: the in-memory entity graph (C1-C3), the
//! durable update board (C4), the detox-style policy engine (C5-C7), the
//! lock-source aggregator (C8), and the mutually-authenticated application
//! server and console (C9-C10).

pub mod board;
pub mod buildcfg;
pub mod config;
pub mod console;
pub mod error;
pub mod inventory;
pub mod lock_source;
pub mod policy;
pub mod server;
pub mod tools;
