//! Core domain types and storage for buyruk.

pub mod config;
pub mod context;
pub mod epics;
pub mod exchange;
pub mod issues;
pub mod models;
pub mod project;
pub mod storage;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
