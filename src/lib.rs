pub mod args;
pub mod backend;
pub mod builder;
pub mod commands;
pub mod config;
pub mod error;
pub mod metadata;
pub mod provisioner;
pub mod retry;
pub mod rt;
pub mod state;
pub mod sticky_disk;
pub mod teardown;

pub use error::{Error, Result};
