//! Medsync CLI - command-line interface tying the importer crates together.

pub mod config;

pub use config::{Command, Config};
