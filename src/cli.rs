//! Command-line interface for ironcage
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// ironcage - FreeBSD jail manager
#[derive(Parser)]
#[command(name = "ironcage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Settings file path
    #[arg(short, long, default_value = crate::settings::DEFAULT_PATH)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create jails from a release or a template
    Create {
        /// Release to clone (e.g., 14.1-RELEASE)
        #[arg(short, long, required_unless_present = "template")]
        release: Option<String>,

        /// Template to clone instead of a release
        #[arg(short, long, conflicts_with = "release")]
        template: Option<String>,

        /// Jail name (a UUID is generated if not specified)
        #[arg(short, long)]
        name: Option<String>,

        /// Use an 8 character UUID
        #[arg(short, long, conflicts_with = "name")]
        short: bool,

        /// Number of jails to create
        #[arg(short = 'C', long, default_value = "1")]
        count: u32,

        /// Properties to set (KEY=VALUE)
        #[arg(value_parser = parse_key_val)]
        properties: Vec<(String, String)>,
    },

    /// Start jails (dependencies first)
    Start {
        /// Jail name, UUID or unique prefix
        #[arg(required_unless_present = "all")]
        jail: Option<String>,

        /// Start every jail with boot=on, in priority order
        #[arg(long, conflicts_with = "jail")]
        all: bool,
    },

    /// Stop jails
    Stop {
        /// Jail name, UUID or unique prefix
        #[arg(required_unless_present = "all")]
        jail: Option<String>,

        /// Stop every jail with boot=on, in reverse priority order
        #[arg(long, conflicts_with = "jail")]
        all: bool,

        /// Skip the prestop hook
        #[arg(short, long)]
        force: bool,
    },

    /// Stop and start a jail
    Restart {
        /// Jail name, UUID or unique prefix
        jail: String,
    },

    /// Destroy a jail and its datasets
    Destroy {
        /// Jail name, UUID or unique prefix
        jail: String,

        /// Stop a running jail first; also destroys jails with corrupt configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set properties (an empty value reverts to the default)
    Set {
        /// Jail name, or `default` for host-wide defaults
        jail: String,

        /// Properties to set (KEY=VALUE)
        #[arg(required = true, value_parser = parse_key_val)]
        properties: Vec<(String, String)>,
    },

    /// Show properties
    Get {
        /// Jail name, or `default` for host-wide defaults
        jail: String,

        /// Property name
        #[arg(default_value = "all")]
        property: String,
    },

    /// List jails
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Rename a stopped jail
    Rename {
        /// Jail name, UUID or unique prefix
        jail: String,

        /// New name
        name: String,
    },

    /// Snapshot a jail
    Snapshot {
        /// Jail name, UUID or unique prefix
        jail: String,

        /// Snapshot name (current UTC time if not specified)
        name: Option<String>,

        /// Delete the named snapshot instead
        #[arg(short, long, requires = "name")]
        delete: bool,
    },

    /// List snapshots of a jail
    Snapshots {
        /// Jail name, UUID or unique prefix
        jail: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Roll a stopped jail back to a snapshot
    Rollback {
        /// Jail name, UUID or unique prefix
        jail: String,

        /// Snapshot name
        snapshot: String,

        /// Destroy snapshots newer than the target
        #[arg(short, long)]
        force: bool,
    },

    /// Bring every jail configuration to the current version
    Migrate,

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse key=value pairs for properties
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no `=` found in `{s}`"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "ironcage", &mut std::io::stdout());
    }
}
