use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "steward")]
#[command(version)]
#[command(about = "Supervise local services in dependency order", long_about = None)]
pub(crate) struct Cli {
    /// Control socket path. Can also be set via STEWARD_SOCKET env var.
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the daemon in the foreground
    Run {
        /// Plan file (default: $STEWARD_PLAN or <state dir>/plan.toml)
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Do not start enabled services on boot
        #[arg(long)]
        no_autostart: bool,
    },

    /// Show service status
    Services {
        /// Services to show (all when omitted)
        names: Vec<String>,
    },

    /// Start services and their requirements
    Start {
        #[arg(required = true)]
        names: Vec<String>,

        /// Return once the change is created
        #[arg(long)]
        no_wait: bool,
    },

    /// Stop services and the services that require them
    Stop {
        #[arg(required_unless_present = "all")]
        names: Vec<String>,

        /// Stop every running service
        #[arg(long, conflicts_with = "names")]
        all: bool,

        /// Return once the change is created
        #[arg(long)]
        no_wait: bool,
    },

    /// Stop and start services again
    Restart {
        #[arg(required = true)]
        names: Vec<String>,

        /// Return once the change is created
        #[arg(long)]
        no_wait: bool,
    },

    /// Reload the plan and bring services in line with it
    Replan {
        /// Return once the change is created
        #[arg(long)]
        no_wait: bool,
    },

    /// Start every service with startup = "enabled"
    Autostart {
        /// Return once the change is created
        #[arg(long)]
        no_wait: bool,
    },

    /// Show health check status
    Checks {
        /// Checks to show (all when omitted)
        names: Vec<String>,

        /// Only checks at this level (alive, ready)
        #[arg(long)]
        level: Option<String>,
    },

    /// Resume polling of stopped checks
    StartChecks {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Stop polling checks
    StopChecks {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// List recent changes
    Changes,

    /// Show the tasks of a change
    Tasks {
        /// Change ID
        id: String,
    },

    /// Abort a change that is still in progress
    Abort {
        /// Change ID
        id: String,
    },

    /// Show recent output of a service
    Logs {
        /// Service name
        name: String,

        /// Number of recent lines to show
        #[arg(short = 'n', long, default_value = "100")]
        lines: u32,
    },

    /// Send a signal to running services
    Signal {
        /// Signal name (e.g. HUP, SIGUSR1)
        signal: String,

        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Stop all services and the daemon
    Shutdown,
}
