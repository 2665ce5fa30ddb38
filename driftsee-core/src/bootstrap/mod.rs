//! Bootstrap helpers for the `DriftSee` server

pub mod config;

pub use config::load_config;
