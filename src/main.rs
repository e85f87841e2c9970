//! storplan - command-line entry point
//!
//! Loads a model snapshot, prints or checks its plan, or commits it.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use storplan::cli::{Cli, Commands};
use storplan::dm_table::{resolve_block_device, DmTable};
use storplan::{
    CommandRunner, DryRunRunner, EngineConfig, ModelSnapshot, Storage, SystemProber, SystemRunner,
};

/// Initialize logging; `RUST_LOG` overrides the default `info` level.
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    config.dry_run |= cli.dry_run;
    config.read_only |= cli.read_only;
    config.validate()?;
    Ok(config)
}

fn load_model(path: &Path) -> Result<ModelSnapshot> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read model from {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse model JSON in {:?}", path))
}

fn open_storage(config: EngineConfig, model: &Path) -> Result<Storage> {
    let runner: Box<dyn CommandRunner> = if config.dry_run {
        Box::new(DryRunRunner::new())
    } else {
        Box::new(SystemRunner::new())
    };
    let prober = SystemProber::new(
        config.proc_partitions.clone(),
        config.root_prefix.clone(),
        config.probe_soft_cap(),
    );
    let mut storage = Storage::new(config, runner, Box::new(prober)).context("Failed to open storage engine")?;
    storage.load_snapshot(load_model(model)?);
    Ok(storage)
}

fn main() -> Result<()> {
    init_logger();
    let cli = Cli::parse_args();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Plan { ref model } => {
            let storage = open_storage(config, model)?;
            println!("{}", storage.plan().summary());
        }
        Commands::Check { ref model } => {
            let storage = open_storage(config, model)?;
            if let Err(e) = storage.check_consistency() {
                error!(error = %e, "Consistency check failed");
                std::process::exit(e.code());
            }
            println!("Model is consistent ({} containers)", storage.containers().len());
        }
        Commands::Commit { ref model, ref save_model } => {
            let mut storage = open_storage(config, model)?;
            match storage.commit() {
                Ok(report) => {
                    for (i, description) in report.executed.iter().enumerate() {
                        println!("{:>3}. {}", i + 1, description);
                    }
                    if storage.runner().is_dry_run() {
                        for command in storage.runner().history() {
                            println!("     $ {}", command.join(" "));
                        }
                    }
                    if let Some(path) = save_model {
                        let json = serde_json::to_string_pretty(&storage.snapshot())
                            .context("Failed to serialize model")?;
                        fs::write(path, json).with_context(|| format!("Failed to write model to {:?}", path))?;
                    }
                    if let Some(sig) = report.deferred_signal {
                        drop(storage);
                        std::process::exit(128 + sig);
                    }
                    info!(actions = report.executed.len(), "Commit finished");
                }
                Err(e) => {
                    error!(error = %e, "Commit failed");
                    drop(storage);
                    std::process::exit(e.code());
                }
            }
        }
        Commands::DmTable { ref file, pe_size_k } => {
            let text = fs::read_to_string(file).with_context(|| format!("Failed to read table from {:?}", file))?;
            let table = DmTable::parse(&text)?;
            println!("targets: {}", table.target_names().join(", "));
            println!("size: {}k", table.size_k());
            let root = config.root_prefix.clone();
            for (device, extents) in table.pe_map(pe_size_k, |majmin| resolve_block_device(&root, majmin)) {
                println!("{} {}", device, extents);
            }
        }
    }

    Ok(())
}
