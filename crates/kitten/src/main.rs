mod commands;
mod observability;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{run, up};

#[derive(Parser, Debug)]
#[command(version, about = "A lightweight Linux container runtime and orchestrator")]
struct Opts {
    /// Change log level to debug
    #[arg(long, global = true)]
    debug: bool,
    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log: Option<PathBuf>,
    /// Log format: text (default) or json
    #[arg(long, global = true)]
    log_format: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a deployment and wait for it
    Up(up::Up),
    /// Run a single container from a config file
    Run(run::Run),
}

fn main() -> Result<()> {
    // The re-exec trampoline takes precedence over the CLI: when the
    // parent clones us into fresh namespaces, argv is
    // `kitten __kitten_child__ <config-json>`.
    let argv: Vec<String> = std::env::args().collect();
    if argv.get(1).map(String::as_str) == Some(libkitten::CHILD_SENTINEL) {
        child_main(argv.get(2).map(String::as_str).unwrap_or(""));
    }

    let opts = Opts::parse();
    observability::init(observability::ObservabilityConfig {
        debug: opts.debug,
        log_file: opts.log.clone(),
        log_format: opts.log_format.clone(),
    })?;

    match opts.command {
        Commands::Up(args) => up::up(args),
        Commands::Run(args) => {
            let exit_code = run::run(args)?;
            std::process::exit(exit_code);
        }
    }
}

/// Child entry: on success the user command replaces this process, so
/// this only returns control on launch failure.
fn child_main(config_json: &str) -> ! {
    observability::init_child();

    let err = match libkitten::child::run(config_json) {
        Err(err) => err,
        Ok(never) => match never {},
    };

    tracing::error!(?err, "container setup failed");
    eprintln!("kitten: {err}");
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
    std::process::exit(1);
}
