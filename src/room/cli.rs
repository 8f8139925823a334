// CLI commands for a room peer

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Room peer CLI
#[derive(Debug, Parser)]
#[command(name = "keyroom")]
#[command(about = "Encrypted group chat over TCP with a pre-shared room key")]
pub struct KeyroomCli {
    /// Config file (default: ~/.keyroom/config.json when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: KeyroomCommand,
}

/// Peer subcommands
#[derive(Debug, Subcommand)]
pub enum KeyroomCommand {
    /// Host a room: listen for clients and print the room key
    Listen {
        /// Port to listen on (default: 1234)
        #[arg(short, long)]
        port: Option<u16>,

        /// Local address to bind (default: 0.0.0.0)
        #[arg(short, long)]
        bind: Option<String>,

        /// Display name (default: Anonymous)
        #[arg(short, long)]
        username: Option<String>,

        /// Reuse an existing room key instead of generating one
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Join a room hosted elsewhere
    Connect {
        /// Room key in hex, as printed by the host
        #[arg(short, long)]
        key: String,

        /// Host address (default: local host)
        #[arg(short, long)]
        address: Option<String>,

        /// Host port (default: 1234)
        #[arg(short, long)]
        port: Option<u16>,

        /// Display name (default: Anonymous)
        #[arg(short, long)]
        username: Option<String>,
    },

    /// Print a fresh room key
    Keygen,

    /// Write a config file with default settings
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
