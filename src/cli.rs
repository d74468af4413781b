//! Command-line interface definitions for tapwire.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// Local interception proxy.
///
/// tapwire relays HTTP(S) and TCP traffic for configured remotes, publishes
/// every relayed HTTP message as an event, and hands those events to
/// user scripts.
#[derive(Parser, Debug)]
#[command(name = "tapwire")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long = "check")]
    pub check: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
