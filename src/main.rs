//! ironcage - FreeBSD jail manager
//!
//! Jails live on a ZFS pool as iocage-compatible datasets with a JSON
//! property document each. Start and stop run as ordered phases with
//! compensation, under a per-jail lock.

mod cancel;
mod cli;
mod config;
mod context;
mod devfs;
mod environ;
mod error;
mod fstab;
mod hooks;
mod host;
mod jail;
mod lifecycle;
mod lock;
mod manage;
mod network;
mod parse;
mod rctl;
mod runtime;
mod settings;
mod storage;
mod sys;
mod zfs;

use chrono::{TimeZone, Utc};
use cli::{Cli, Commands};
use context::Context;
use error::Result;
use host::ProcessHost;
use lifecycle::{BulkOutcome, LifecycleController};
use manage::{CreateOptions, JailManager};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Pseudo-jail naming the host-wide defaults in `set` and `get`
const DEFAULTS_TARGET: &str = "default";

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    if let Commands::Completion { shell } = &cli.command {
        Cli::generate_completion(*shell);
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cancel::install_handlers()?;
    let settings = settings::load(&cli.config)?;
    let ctx = Context::new(Arc::new(ProcessHost), settings);
    let lifecycle = LifecycleController::new(&ctx);
    let manager = JailManager::new(&ctx);

    match cli.command {
        Commands::Create {
            release,
            template,
            name,
            short,
            count,
            properties,
        } => {
            let opts = CreateOptions {
                release,
                template,
                name,
                short,
                count,
                properties,
            };
            for name in manager.create(&opts)? {
                println!("{} successfully created!", name);
            }
        }

        Commands::Start { jail, all } => match jail {
            Some(jail) if !all => {
                lifecycle.start(&jail)?;
                println!("{} started", jail);
            }
            _ => report_bulk("started", lifecycle.start_all()?),
        },

        Commands::Stop { jail, all, force } => match jail {
            Some(jail) if !all => {
                lifecycle.stop(&jail, force)?;
                println!("{} stopped", jail);
            }
            _ => report_bulk("stopped", lifecycle.stop_all()?),
        },

        Commands::Restart { jail } => {
            lifecycle.restart(&jail)?;
            println!("{} restarted", jail);
        }

        Commands::Destroy { jail, force } => {
            manager.destroy(&jail, force)?;
            println!("{} destroyed", jail);
        }

        Commands::Set { jail, properties } => {
            if jail == DEFAULTS_TARGET {
                manager.set_defaults(&properties)?;
            } else {
                manager.set(&jail, &properties)?;
            }
            for (key, value) in &properties {
                println!("{}: {}", key, if value.is_empty() { "(default)" } else { value.as_str() });
            }
        }

        Commands::Get { jail, property } => {
            let values = if jail == DEFAULTS_TARGET {
                manager.get_defaults(&property)?
            } else {
                manager.get(&jail, &property)?
            };
            if property == "all" {
                for (key, value) in values {
                    println!("{}:{}", key, value);
                }
            } else {
                for (_, value) in values {
                    println!("{}", value);
                }
            }
        }

        Commands::List { json } => {
            let rows = manager.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No jails.");
            } else {
                println!(
                    "{:<6} {:<24} {:<6} {:<16} {:<24} {:<6}",
                    "JID", "NAME", "STATE", "RELEASE", "IP4", "BOOT"
                );
                println!("{}", "-".repeat(87));
                for row in rows {
                    let name = if row.template { format!("{} (template)", row.name) } else { row.name };
                    println!(
                        "{:<6} {:<24} {:<6} {:<16} {:<24} {:<6}",
                        row.jid.map(|j| j.to_string()).unwrap_or_else(|| "-".to_string()),
                        name,
                        row.state,
                        row.release,
                        row.ip4,
                        if row.boot { "on" } else { "off" }
                    );
                }
            }
        }

        Commands::Rename { jail, name } => {
            manager.rename(&jail, &name)?;
            println!("{} renamed to {}", jail, name);
        }

        Commands::Snapshot { jail, name, delete } => match name {
            Some(name) if delete => {
                manager.delete_snapshot(&jail, &name)?;
                println!("Snapshot {}@{} deleted", jail, name);
            }
            name => {
                let taken = manager.snapshot(&jail, name.as_deref())?;
                println!("Snapshot {}@{} created", jail, taken);
            }
        },

        Commands::Snapshots { jail, json } => {
            let snapshots = manager.snapshots(&jail)?;
            if json {
                let rows: Vec<_> = snapshots
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "name": s.name,
                            "creation": s.creation,
                            "used": s.used,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if snapshots.is_empty() {
                println!("No snapshots for jail '{}'.", jail);
            } else {
                println!("{:<30} {:<24} {:<12}", "NAME", "CREATED", "USED");
                println!("{}", "-".repeat(68));
                for snap in snapshots {
                    let created = Utc
                        .timestamp_opt(snap.creation, 0)
                        .single()
                        .map(|t| t.format("%F %T").to_string())
                        .unwrap_or_else(|| snap.creation.to_string());
                    println!("{:<30} {:<24} {:<12}", snap.name, created, snap.used);
                }
            }
        }

        Commands::Rollback { jail, snapshot, force } => {
            manager.rollback(&jail, &snapshot, force)?;
            println!("{} rolled back to {}", jail, snapshot);
        }

        Commands::Migrate => {
            let report = manager.migrate()?;
            for name in &report.migrated {
                println!("{} migrated", name);
            }
            println!(
                "{} migrated, {} current, {} unreadable",
                report.migrated.len(),
                report.current.len(),
                report.corrupt.len()
            );
            for (name, e) in &report.corrupt {
                eprintln!("  {}: {}", name, e);
            }
        }

        Commands::Completion { .. } => {}
    }

    Ok(())
}

/// Print a bulk operation's results; any failure makes the exit status non-zero
fn report_bulk(verb: &str, outcome: BulkOutcome) {
    for name in &outcome.done {
        println!("{} {}", name, verb);
    }
    for name in &outcome.skipped {
        println!("{} already {}", name, verb);
    }
    for (name, e) in &outcome.failed {
        eprintln!("{} failed: {}", name, e);
    }
    if !outcome.is_success() {
        std::process::exit(1);
    }
}
