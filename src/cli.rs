use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "qfs", version, about = "Filesystem synchronization with compact databases and object-store repositories")]
pub struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct FilterArgs {
    /// Filter file; may be repeated, all filters must agree
    #[arg(long)]
    pub filter: Vec<PathBuf>,

    /// Load filters keeping only prune rules
    #[arg(long)]
    pub prune_only: bool,

    /// Apply the reserved .qfs layout rules
    #[arg(long)]
    pub repo_rules: bool,
}

#[derive(Debug, Args)]
pub struct StoreArgs {
    /// AWS region override
    #[arg(long, env = "QFS_REGION")]
    pub region: Option<String>,

    /// Custom S3 endpoint (R2, MinIO, ...)
    #[arg(long, env = "QFS_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Concurrent range workers for listing
    #[arg(long, default_value_t = 20)]
    pub threads: usize,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Walk a directory tree and write its database
    Scan {
        root: PathBuf,

        /// Output database file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        filters: FilterArgs,

        /// Remove files matching the junk pattern while scanning
        #[arg(long)]
        cleanup: bool,

        /// Stay on the root's filesystem device
        #[arg(long)]
        same_device: bool,

        /// Omit directories
        #[arg(long)]
        files_only: bool,

        /// Omit devices, pipes, and sockets
        #[arg(long)]
        no_special: bool,
    },

    /// Print the change plan between two snapshots (database files or
    /// directories)
    Diff {
        old: PathBuf,
        new: PathBuf,

        #[command(flatten)]
        filters: FilterArgs,

        /// Ignore ownership differences
        #[arg(long)]
        no_ownerships: bool,

        /// Track directory modification times
        #[arg(long)]
        non_file_times: bool,

        /// Print mtime check entries as well
        #[arg(long)]
        checks: bool,
    },

    /// List every object key under a repository prefix
    List {
        /// Repository locator, s3://bucket/prefix
        uri: String,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Upload a local file, directory, or symlink into the repository
    Push {
        local: PathBuf,

        /// Repository locator, s3://bucket/prefix
        uri: String,

        /// Path of the record inside the repository
        path: String,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Reconcile a local path with a repository record
    Pull {
        /// Repository locator, s3://bucket/prefix
        uri: String,

        /// Path of the record inside the repository
        path: String,

        local: PathBuf,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Build the repository's database snapshot
    Db {
        /// Repository locator, s3://bucket/prefix
        uri: String,

        /// Output database file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Delete shadowed and undecodable objects afterwards
        #[arg(long)]
        cleanup: bool,

        #[command(flatten)]
        store: StoreArgs,
    },
}
