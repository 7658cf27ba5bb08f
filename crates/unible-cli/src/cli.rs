//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Backend;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Platform stack to drive
    #[arg(short, long, value_enum)]
    pub backend: Option<Backend>,

    /// Directory for the persisted service cache
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show adapter availability and platform capabilities
    State,
    /// Scan for advertising devices
    Scan {
        /// Service UUID to match (repeatable)
        #[arg(short, long = "service")]
        services: Vec<String>,
        /// Local name prefix to match (repeatable)
        #[arg(short, long = "name-prefix")]
        name_prefixes: Vec<String>,
        /// Manufacturer filter as COMPANY[:DATA[:MASK]] in hex (repeatable)
        #[arg(short, long = "manufacturer")]
        manufacturer: Vec<String>,
        /// Seconds to scan; 0 scans until Ctrl+C
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Connect and print the GATT tree
    Services {
        device: String,
        /// Also discover descriptors
        #[arg(long)]
        descriptors: bool,
    },
    /// Read a characteristic
    Read {
        device: String,
        service: String,
        characteristic: String,
    },
    /// Write a hex value to a characteristic
    Write {
        device: String,
        service: String,
        characteristic: String,
        value: String,
        /// Write without response
        #[arg(long)]
        without_response: bool,
    },
    /// Subscribe to a characteristic and print its values
    Watch {
        device: String,
        service: String,
        characteristic: String,
        /// Use indications instead of notifications
        #[arg(long)]
        indicate: bool,
        /// Seconds to watch; 0 watches until Ctrl+C
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// List devices held connected by the operating system
    SystemDevices {
        /// Only devices offering one of these services (repeatable)
        #[arg(short, long = "service")]
        services: Vec<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}
