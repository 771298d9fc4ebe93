//! CLI surface (spec.md §6, external interface): `init` runs a config
//! document's jobs, `index` re-indexes a locally-cached metrics directory,
//! `destroy` cleans up every namespace labelled with a given run UUID,
//! `version` prints the build version.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "kube-loadgen", about = "Workload generator and latency-measurement harness for Kubernetes", version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every job declared in a config document.
    Init {
        /// Path to the YAML config file.
        #[arg(short, long)]
        config: PathBuf,

        /// Template variable overrides in `key=value` form, merged ahead of
        /// job-level `inputVars` (spec.md §6).
        #[arg(short = 'p', long = "var", value_name = "key=value")]
        vars: Vec<String>,

        /// Directory the local-file indexer writes ndjson documents to.
        #[arg(long, default_value = "./metrics")]
        metrics_dir: PathBuf,
    },

    /// Re-index metrics previously recorded to a local cache directory.
    Index {
        /// Directory containing `<metric>.ndjson` files written by a prior run.
        #[arg(long, default_value = "./metrics")]
        metrics_dir: PathBuf,
    },

    /// Delete every namespace labelled with the given run UUID.
    Destroy {
        /// The run UUID stamped on the namespaces to remove (spec.md §6).
        #[arg(long)]
        run_id: String,
    },

    /// Print the build version.
    Version,
}
