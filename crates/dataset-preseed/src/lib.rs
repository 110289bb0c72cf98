pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod exec;
pub mod fsops;
pub mod marker;
pub mod notify;
pub mod replication;
pub mod report;
pub mod restore;
pub mod signal;

pub use error::{Error, ErrorKind, Result};
