//! unible CLI library
//!
//! Command line front end for the unible BLE central: argument parsing,
//! configuration, command handlers and the simulated demo backend.

pub mod cli;
pub mod commands;
pub mod config;
pub mod demo;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::{AppConfig, Backend};
pub use error::{CliError, Result};
