use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ESXi VM backup with snapshot bracketing and incremental chains
#[derive(Parser, Debug)]
#[command(name = "esxi-backup")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List VMs on the ESXi host
    List,

    /// Backup VMs
    Backup {
        /// Specific VM to backup
        #[arg(long)]
        vm: Option<String>,

        /// Force full backup (ignore previous backups)
        #[arg(long)]
        full: bool,

        /// Skip retention pruning
        #[arg(long)]
        no_prune: bool,
    },

    /// List VM snapshots
    Snapshots,

    /// Restore from backup
    Restore {
        /// VM name to restore
        vm: String,

        /// Backup to restore, by index in the listing or by name
        #[arg(long)]
        snapshot: Option<String>,

        /// Target directory for restore
        #[arg(long)]
        target: Option<String>,

        /// Just list backups
        #[arg(long)]
        list: bool,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Create sample configuration file
    Init,
}
