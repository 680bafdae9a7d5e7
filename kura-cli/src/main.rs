//! # Kura CLI
//!
//! Debugging tool for the property store: read, set, enumerate, and watch
//! properties, plus writer-mode bootstrap of a fresh properties directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use kura_api::{PropertyStore, ServiceClient};
use kura_core::StoreConfig;
use kura_storage::ValueBuf;

#[derive(Parser)]
#[command(name = "kura")]
#[command(about = "Kura - process-wide property store")]
struct Cli {
    /// Properties directory
    #[arg(long, default_value = "/dev/__properties__")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Print a property's value
    Get { name: String },
    /// Set a property through the setter daemon (or directly with --direct)
    Set {
        name: String,
        value: String,
        /// Write into the mapped area instead of asking the daemon
        #[arg(long)]
        direct: bool,
    },
    /// Delete a property (writer mode)
    Delete {
        name: String,
        /// Also clear emptied interior trie nodes
        #[arg(long)]
        prune: bool,
    },
    /// List every accessible property
    List,
    /// Block until a property (or anything, without a name) changes
    Wait {
        name: Option<String>,
        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Writer-mode bootstrap: create the directory and all context areas
    Init,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = StoreConfig::for_dir(&cli.dir);

    if let Commands::Init = cli.command {
        let (_store, label_failed) = PropertyStore::init_writer(&config)
            .context("writer-mode initialization failed")?;
        if label_failed {
            bail!("area created but labelling failed; aborting as the init daemon would");
        }
        println!("initialized {}", cli.dir.display());
        return Ok(());
    }

    let store = PropertyStore::open_with_config(&config)
        .with_context(|| format!("cannot open property store at {}", cli.dir.display()))?;

    match cli.command {
        Commands::Get { name } => {
            match store.find(&name) {
                Some(prop) => store.read_callback(&prop, |_, value, _| println!("{value}")),
                None => bail!("property \"{name}\" not found"),
            }
        }
        Commands::Set { name, value, direct } => {
            if direct {
                store.set(&name, &value)?;
            } else {
                ServiceClient::new(&config).set(&store, &name, &value)?;
            }
        }
        Commands::Delete { name, prune } => {
            if !store.delete(&name, prune)? {
                bail!("property \"{name}\" not found");
            }
        }
        Commands::List => {
            let mut buf = ValueBuf::new();
            store.foreach(|prop| {
                let name = prop.name().to_string();
                store.read(prop, &mut buf);
                println!("[{name}]: [{}]", buf.as_str());
            });
        }
        Commands::Wait { name, timeout_ms } => {
            let timeout = timeout_ms.map(Duration::from_millis);
            let woken = match name {
                Some(name) => {
                    let prop = store
                        .find(&name)
                        .with_context(|| format!("property \"{name}\" not found"))?;
                    store.wait(Some(&prop), prop.serial(), timeout)
                }
                None => store.wait(None, store.area_serial(), timeout),
            };
            match woken {
                Some(serial) => println!("changed (serial {serial})"),
                None => bail!("timed out"),
            }
        }
        Commands::Init => unreachable!(),
    }
    Ok(())
}
