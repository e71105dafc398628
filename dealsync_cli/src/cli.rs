use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "dealsync", version, about = "CRM deal sync with annotation-preserving stores")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one full refresh cycle for every owner and group.
    Cycle,

    /// Push note edits from a group's entity stores to its aggregate store.
    PushNotes {
        #[arg(long)]
        group: String,

        /// Email of the person running the command (checked against the allowlist).
        #[arg(long, env = "DEALSYNC_ACTOR_EMAIL")]
        actor: Option<String>,
    },

    /// Push flags and highlight colors from a group's aggregate store to its members.
    SyncHighlight {
        #[arg(long)]
        group: String,

        #[arg(long, env = "DEALSYNC_ACTOR_EMAIL")]
        actor: Option<String>,
    },

    /// Load and validate the sync config and directory, then print a summary.
    ValidateConfig,
}
