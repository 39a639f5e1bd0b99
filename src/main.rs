//! Ontorank main executable

pub mod annotations;
pub mod calc;
pub mod common;
pub mod err;
pub mod ontology;
pub mod precompute;
pub mod query;
pub mod server;
pub mod sim;

use std::process::{ExitCode, Termination};

use clap::{Parser, Subcommand};
use console::{Emoji, Term};

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Bayesian ontology query engine",
    long_about = "Ranks annotated items (e.g. diseases) against a set of \
                  observed ontology terms (e.g. phenotypes)."
)]
struct Cli {
    /// Commonly used arguments
    #[command(flatten)]
    common: common::Args,

    /// The sub command to run
    #[command(subcommand)]
    command: Commands,
}

/// Enum supporting the parsing of top-level commands.
#[derive(Debug, Subcommand)]
enum Commands {
    /// Rank items against a query of ontology terms.
    Query(query::Args),
    /// Precompute score distributions for the similarity measures.
    Precompute(precompute::Args),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Build a tracing subscriber according to the configuration in `cli.common`.
    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(match cli.common.verbose.log_level() {
            Some(level) => match level {
                log::Level::Error => tracing::Level::ERROR,
                log::Level::Warn => tracing::Level::WARN,
                log::Level::Info => tracing::Level::INFO,
                log::Level::Debug => tracing::Level::DEBUG,
                log::Level::Trace => tracing::Level::TRACE,
            },
            None => tracing::Level::INFO,
        })
        .compact()
        .finish();

    // Install collector and go into sub commands.
    let term = Term::stderr();
    let result = tracing::subscriber::with_default(collector, || match &cli.command {
        Commands::Query(args) => query::run(&cli.common, args),
        Commands::Precompute(args) => precompute::run(&cli.common, args),
    });

    match result {
        Ok(()) => {
            term.write_line(&format!("All done. Have a nice day!{}", Emoji(" 😃", "")))
                .ok();
            ExitCode::SUCCESS
        }
        Err(err) => {
            term.write_line(&format!("{}", &err)).ok();
            err.report()
        }
    }
}
