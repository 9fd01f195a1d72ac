//! # Clause Matrix CLI (`cmx`)
//!
//! Turns a natural-language question about a contract corpus into a
//! document × field matrix of cited answers.
//!
//! ## Usage
//!
//! ```bash
//! cmx --config ./config/cmx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cmx init` | Create the SQLite database and run schema migrations |
//! | `cmx analyze "<prompt>" --caller <id>` | Run one analysis and print the matrix |
//! | `cmx show <request_id> --caller <id>` | Print a stored matrix |
//! | `cmx serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! cmx init
//! cmx analyze "What are the termination notice periods?" --caller alice
//! cmx analyze "Flag uncapped liability" --type risk --caller alice --json
//! cmx serve
//! ```
//!
//! Logging goes to stderr through `tracing`; set `RUST_LOG` to change the
//! filter (default `info,clause_matrix=debug`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use clause_matrix::config;
use clause_matrix::migrate;
use clause_matrix::server;
use clause_matrix::workflow::Orchestrator;
use clause_matrix_core::models::{AnalysisRequest, AnalysisType, MatrixResult};

/// Clause Matrix: cited, document-by-field answers over a contract corpus.
#[derive(Parser)]
#[command(name = "cmx", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cmx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Run one analysis over the caller's documents.
    Analyze {
        /// The question to answer, e.g. "What are the renewal terms?".
        prompt: String,

        /// Analysis type: `general`, `risk`, or `compliance`.
        #[arg(long = "type", default_value = "general")]
        analysis_type: AnalysisType,

        /// Caller whose document set is searched.
        #[arg(long)]
        caller: String,

        /// Print the full outcome as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print a stored matrix.
    Show {
        request_id: String,

        #[arg(long)]
        caller: String,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,clause_matrix=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Analyze {
            prompt,
            analysis_type,
            caller,
            json,
        } => {
            let engine = Orchestrator::from_config(&cfg).await?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });

            let outcome = engine
                .run_analysis(AnalysisRequest::new(prompt, analysis_type, caller), cancel)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!(
                    "Request {} ({}, intent: {})",
                    outcome.request_id, outcome.analysis_type, outcome.query_intent
                );
                print_matrix(&outcome.matrix);
                let meta = &outcome.metadata;
                println!(
                    "\n{} document(s), {} retr{}, final threshold {:.3}, top_k {}{}",
                    meta.documents_analyzed,
                    meta.retry_count,
                    if meta.retry_count == 1 { "y" } else { "ies" },
                    meta.final_params.score_threshold,
                    meta.final_params.top_k,
                    if meta.retry_budget_exhausted {
                        " (retry budget exhausted)"
                    } else {
                        ""
                    }
                );
            }
        }
        Commands::Show { request_id, caller } => {
            let engine = Orchestrator::from_config(&cfg).await?;
            match engine.load_matrix(&request_id, &caller).await? {
                Some((record, matrix)) => {
                    println!(
                        "Request {} [{}] {}: {}",
                        record.request_id,
                        record.status.as_str(),
                        record.analysis_type,
                        record.prompt
                    );
                    print_matrix(&matrix);
                }
                None => anyhow::bail!("No analysis found with id: {}", request_id),
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

fn print_matrix(matrix: &MatrixResult) {
    if matrix.rows.is_empty() {
        println!("No documents matched. Columns: {}", matrix.columns.join(", "));
        return;
    }
    for (document, row) in &matrix.rows {
        println!("\n{}", document);
        for column in &matrix.columns {
            let Some(cell) = row.get(column) else {
                continue;
            };
            let pages = if cell.page_numbers.is_empty() {
                String::new()
            } else {
                let list: Vec<String> = cell.page_numbers.iter().map(u32::to_string).collect();
                format!(" p.{}", list.join(","))
            };
            println!(
                "  {}: {} [{:.2}{}{}]",
                column,
                cell.value,
                cell.confidence,
                if cell.verified { "" } else { ", unverified" },
                pages
            );
            if !cell.exact_quote.is_empty() {
                println!("    \"{}\"", cell.exact_quote);
            }
        }
    }
}
