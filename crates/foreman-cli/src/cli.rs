use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use foreman::{LogFormat, Wait};

/// foreman - rolls out templated releases with StatefulSet rotation
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Operator config file (defaults to $FOREMAN_CONFIG, then ~/.foreman.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct WaitArgs {
    /// Wait for workloads to become ready: true, false or a number of minutes
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub wait: Option<Wait>,

    /// Show what would change without touching the cluster
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate, persist and apply a resource spec
    Rollout {
        /// Resource id as <namespace>/<name>
        resource: String,

        /// Resource spec file; the persisted spec is used when omitted
        #[arg(short = 'f', long = "file")]
        spec: Option<PathBuf>,

        /// Override an app value (key.path=value), may be repeated
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Keep failed removals out of the release record
        #[arg(long)]
        prune: bool,

        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Delete everything a resource deployed
    Uninstall {
        /// Resource id as <namespace>/<name>
        resource: String,

        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Print the deployment status as JSON
    Status {
        /// Resource id as <namespace>/<name>
        resource: String,
    },
}
