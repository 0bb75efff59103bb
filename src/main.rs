mod cli;
mod commands;
mod config;
mod ensemble;
mod judge;
mod lenient_json;
mod model;
mod prompt;
mod store;
mod util;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::{Cli, Commands};
use crate::config::run_log_path;
use crate::util::open_append_log;

fn main() {
    let cli = Cli::parse();
    init_tracing(run_log_file(&cli.command).as_deref());

    if let Err(err) = run(cli) {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Judge(args) => commands::judge::run(args),
        Commands::Merge(args) => commands::merge::run(args),
        Commands::Evaluate(args) => commands::evaluate::run(args),
        Commands::Scores(args) => commands::scores::run(args),
        Commands::Status(args) => commands::status::run(args),
    }
}

fn run_log_file(command: &Commands) -> Option<PathBuf> {
    match command {
        Commands::Judge(args) => Some(run_log_path(
            &args.output_root,
            &args.input,
            "judge",
            args.vendor,
        )),
        Commands::Merge(args) => Some(run_log_path(
            &args.output_root,
            &args.input,
            "merge",
            args.vendor,
        )),
        Commands::Evaluate(_) | Commands::Scores(_) | Commands::Status(_) => None,
    }
}

fn init_tracing(log_path: Option<&Path>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, log_error) = match log_path.map(open_append_log).transpose() {
        Ok(file) => (file, None),
        Err(err) => (None, Some(err)),
    };
    let file_layer = log_file.map(|file| {
        fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    if let Some(err) = log_error {
        warn!(error = %err, "run log file disabled; logging to stderr only");
    }
}
