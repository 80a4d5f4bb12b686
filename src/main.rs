use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use confstore::config::resolve_store_path;
use confstore::ConfigStore;
use std::path::{Path, PathBuf};
use tracing::{debug, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Read and edit an XML settings file
#[derive(Parser, Debug)]
#[command(name = "confstore")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file
    ///
    /// If not specified, falls back to:
    /// 1. The CONFSTORE_FILE environment variable
    /// 2. <config dir>/confstore/settings.xml
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new, empty settings file
    Init,

    /// Print the value of a setting
    Get { name: String },

    /// Add a setting or change its value
    Set { name: String, value: String },

    /// Add a setting that must not exist yet
    Add { name: String, value: String },

    /// Change a setting that must already exist
    Update { name: String, value: String },

    /// Remove a setting
    Remove { name: String },

    /// List all settings in file order
    List {
        /// Print as a JSON array
        #[arg(long)]
        json: bool,
    },
}

fn setup_logging(log_level: &str, log_file: Option<PathBuf>) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into());

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if let Some(log_path) = log_file {
        let file = std::fs::File::create(log_path)?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    Ok(())
}

/// Open the existing store, apply `change`, and save.
fn edit<F>(path: &Path, change: F) -> Result<()>
where
    F: FnOnce(&ConfigStore) -> confstore::Result<()>,
{
    let store = ConfigStore::open(path, false)?;
    change(&store)?;
    if store.save()? {
        info!("Saved {}", store.full_path().display());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.log_file)?;

    debug!("Starting confstore v{}", env!("CARGO_PKG_VERSION"));

    let path = resolve_store_path(args.file)?;

    match args.command {
        Command::Init => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            let store = ConfigStore::open(&path, true)?;
            println!("Created {}", store.full_path().display());
        }
        Command::Get { name } => {
            let store = ConfigStore::open(&path, false)?;
            match store.get(&name)? {
                Some(value) => println!("{}", value),
                None => bail!("Setting '{}' not found", name),
            }
        }
        Command::Set { name, value } => edit(&path, |s| s.add_or_update(&name, &value))?,
        Command::Add { name, value } => edit(&path, |s| s.add(&name, &value))?,
        Command::Update { name, value } => edit(&path, |s| s.update(&name, &value))?,
        Command::Remove { name } => edit(&path, |s| {
            if !s.remove(&name)? {
                info!("Setting '{}' was not present", name);
            }
            Ok(())
        })?,
        Command::List { json } => {
            let store = ConfigStore::open(&path, false)?;
            let entries = store.entries();
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    println!("{}={}", entry.name, entry.value);
                }
            }
        }
    }

    Ok(())
}
