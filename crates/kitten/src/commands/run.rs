use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use libkitten::config::KittenConfig;
use libkitten::container::Kitten;
use libkitten::utils::ensure_root;

/// Run a single container to completion and propagate its exit code.
#[derive(Parser, Debug)]
pub struct Run {
    /// Container config file (JSON)
    #[arg(short, long)]
    file: PathBuf,
}

pub fn run(args: Run) -> Result<i32> {
    ensure_root()?;

    let data = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {:?}", args.file))?;
    let config: KittenConfig =
        serde_json::from_str(&data).context("failed to parse container config")?;

    let kitten = Kitten::new(config)?;
    kitten.start().context("failed to start container")?;
    let exit_code = kitten.wait().context("failed to wait for container")?;

    Ok(exit_code)
}
