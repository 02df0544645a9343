use std::path::PathBuf;

use clap::{Parser, Subcommand};

use loadstar_ingest::LoadKind;
use loadstar_tracker::{SortKey, SortOrder, StatusFilter};

/// Durable, cancellable ingestion of object-store files through an
/// external bulk loader.
#[derive(Parser, Debug)]
#[command(name = "loadstar", version, about)]
#[command(arg_required_else_help = true)]
pub struct CliArgs {
    /// Configuration profile; keys are looked up as {PROFILE}_{KEY} first
    #[arg(long, env = "LOADSTAR_PROFILE", global = true)]
    pub profile: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest every matching object under a prefix (Ctrl-C cancels)
    Ingest {
        /// Source bucket
        #[arg(long)]
        bucket: String,

        /// Key prefix within the bucket
        #[arg(long)]
        path: String,

        /// Descend into nested prefixes
        #[arg(long)]
        recursive: bool,

        /// Only files whose year token equals this year
        #[arg(long)]
        year: Option<i32>,

        /// Known collection whose naming convention applies
        #[arg(long)]
        collection: Option<String>,
    },

    /// Run the synthetic workload (Ctrl-C cancels)
    Synthetic {
        /// Job name, recorded as the job path
        #[arg(long, default_value = "synthetic")]
        name: String,

        #[arg(long, default_value_t = 10)]
        tasks: u32,

        /// Tasks per batch; capped at MAX_CONCURRENT_FILES
        #[arg(long, default_value_t = 2)]
        concurrency: u32,
    },

    /// Inspect and cancel jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },

    /// Requeue stale processing jobs and delete expired finished ones
    Sweep {
        /// Keep sweeping every SWEEP_INTERVAL_SECS until interrupted
        #[arg(long)]
        watch: bool,
    },

    /// Requeue stale jobs, then run every pending job
    Resume,

    /// Run the external loader once for a local file
    Load {
        #[arg(long, default_value = "items")]
        kind: LoadKind,

        file: PathBuf,
    },

    /// List the known collections and their naming conventions
    Collections,

    /// Print the active configuration with secrets redacted
    Config,
}

#[derive(Subcommand, Debug)]
pub enum JobsCommand {
    /// One page of jobs
    List {
        /// Zero-based page number
        #[arg(long, default_value_t = 0)]
        page: usize,

        /// all, pending, processing, completed, failed or cancelled
        #[arg(long, default_value = "all")]
        status: StatusFilter,

        /// created_at or updated_at
        #[arg(long, default_value = "created_at")]
        sort_by: SortKey,

        /// asc or desc
        #[arg(long, default_value = "desc")]
        order: SortOrder,
    },

    /// Show one job
    Show {
        job_id: String,

        /// Include per-item details
        #[arg(long)]
        detailed: bool,
    },

    /// Cancel a pending or processing job
    Cancel { job_id: String },
}
