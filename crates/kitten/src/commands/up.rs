use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use libkitten::manager::Manager;
use libkitten::utils::ensure_root;

/// Start all containers of a deployment, wait for them to exit, then
/// tear everything down.
#[derive(Parser, Debug)]
pub struct Up {
    /// Deployment file (JSON)
    #[arg(short, long, default_value = "kitten.json")]
    file: PathBuf,
}

pub fn up(args: Up) -> Result<()> {
    ensure_root()?;

    let manager =
        Manager::from_file(&args.file).with_context(|| format!("failed to load {:?}", args.file))?;

    manager.start().context("failed to start deployment")?;
    let waited = manager.wait();
    manager.stop().context("failed to stop deployment")?;
    waited.context("a container failed")?;

    Ok(())
}
