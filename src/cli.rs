//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Baton - relay race schedule projection and device sync
#[derive(Parser, Debug)]
#[command(name = "baton")]
#[command(version)]
#[command(about = "Relay race schedule projection and multi-device state sync")]
#[command(
    long_about = "Baton projects a 36-leg relay schedule from runner paces and recorded handoffs, validates and repairs saved race state, and simulates several devices keeping one race in sync."
)]
pub struct Cli {
    /// Config file (TOML, or JSON by extension)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the projected schedule for a race start
    Schedule {
        /// Race start time (RFC 3339, e.g. 2024-06-01T07:00:00Z)
        #[arg(short, long)]
        start: String,

        /// Roster file: JSON array of runners
        #[arg(short, long)]
        roster: Option<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Validate a saved race state and show the repairs that would fix it
    Validate {
        /// Race state file (JSON)
        #[arg(short, long)]
        state: PathBuf,

        /// Print JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Run several devices against an in-memory remote and check they converge
    Simulate {
        /// Number of devices
        #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(2..=12))]
        devices: u8,
    },
}
