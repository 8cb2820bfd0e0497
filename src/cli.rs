use clap::{Parser, Subcommand, ValueEnum};

/// capctl: start, stop and resize Fabric capacities
#[derive(Parser)]
#[command(name = "capctl", version, about)]
pub struct Cli {
    /// Keep credentials in memory only; nothing is written to disk
    #[arg(long, global = true)]
    pub ephemeral: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in (interactive if no valid session is cached)
    Login,

    /// Discard the cached session
    Logout,

    /// Show who is signed in and when the session expires
    Whoami,

    /// Discover every capacity across all subscriptions
    List,

    /// Resume a paused capacity
    Start {
        /// Capacity resource id or name
        id: String,
    },

    /// Suspend a running capacity
    Stop {
        /// Capacity resource id or name
        id: String,
    },

    /// Change a capacity's SKU (F2 .. F2048)
    Resize {
        /// Capacity resource id or name
        id: String,
        sku: String,
        /// Do not ask before resizing a running capacity
        #[arg(short, long)]
        yes: bool,
    },

    /// Serve the local dashboard API
    Serve {
        /// Port to bind on 127.0.0.1
        #[arg(short, long, default_value = "8401")]
        port: u16,
    },

    /// Toggle verbose activity logging (persisted)
    Debug {
        #[arg(value_enum)]
        state: Toggle,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn enabled(self) -> bool {
        matches!(self, Toggle::On)
    }
}
