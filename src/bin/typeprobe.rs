//! typeprobe: infer SQL types from a live PostgreSQL server
//!
//! # Usage
//!
//! ```bash
//! # One query, connection from typeprobe.toml
//! typeprobe "SELECT id, name FROM users WHERE id = \$1" --name 1=userId
//!
//! # Every blank-line separated statement of a file, as JSON
//! typeprobe --file queries.sql --format json --url postgres://app@localhost/app
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use colored::*;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use typeprobe::config::Config;
use typeprobe::{InferOptions, Outcome, ParseError, QueryTypesResult, infer_with};
use typeprobe_pg::{PgConnection, PgError};

/// Exit status when any query was rejected by the server.
const EXIT_QUERY_ERRORS: i32 = 2;

#[derive(Parser)]
#[command(name = "typeprobe")]
#[command(version)]
#[command(about = "Infer parameter and result types of PostgreSQL queries", long_about = None)]
#[command(after_help = "EXAMPLES:
    typeprobe 'SELECT * FROM users WHERE id = $1' --name 1=userId
    typeprobe --file queries.sql --format json
    typeprobe --no-explain 'DELETE FROM sessions WHERE expires_at < now()'")]
struct Cli {
    /// SQL queries to inspect
    queries: Vec<String>,

    /// Read queries from a file, separated by blank lines
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Database connection URL
    #[arg(long, env = "TYPEPROBE_DATABASE_URL")]
    url: Option<String>,

    /// Config file (default: ./typeprobe.toml or the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Skip the EXPLAIN EXECUTE executability check
    #[arg(long)]
    no_explain: bool,

    /// Placeholder name, as INDEX=NAME (repeatable)
    #[arg(short = 'n', long = "name", value_parser = parse_placeholder_name)]
    names: Vec<(usize, String)>,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn parse_placeholder_name(arg: &str) -> Result<(usize, String), String> {
    let (index, name) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected INDEX=NAME, got '{}'", arg))?;
    let index = index
        .trim()
        .trim_start_matches('$')
        .parse::<usize>()
        .map_err(|_| format!("invalid placeholder index '{}'", index))?;
    if index == 0 {
        return Err("placeholder indexes start at 1".to_string());
    }
    Ok((index, name.trim().to_string()))
}

/// Split a file into statements at blank lines.
fn split_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                statements.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        statements.push(current.join("\n"));
    }
    statements
}

#[derive(Serialize)]
struct Report<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    types: Option<&'a QueryTypesResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ParseError>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            if let Some(PgError::Auth(reason)) = e.downcast_ref::<PgError>() {
                eprintln!("{} {}", "Authentication failed:".red().bold(), reason);
            } else {
                eprintln!("{} {:#}", "Error:".red().bold(), e);
            }
            std::process::exit(1);
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<i32> {
    let mut queries = cli.queries.clone();
    if let Some(path) = &cli.file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        queries.extend(split_statements(&text));
    }
    if queries.is_empty() {
        bail!("no queries given (pass them as arguments or with --file)");
    }

    let config = Config::load(cli.config.as_deref())?;
    let options = config.connection_options(cli.url.as_deref())?;
    let mut infer_options = InferOptions::from(&config.infer);
    if cli.no_explain {
        infer_options.explain = false;
    }
    let mapping: BTreeMap<usize, String> = cli.names.iter().cloned().collect();

    if cli.verbose {
        eprintln!(
            "{} {}@{}:{}/{}",
            "Connecting to:".dimmed(),
            options.user,
            options.host,
            options.port,
            options.database
        );
    }
    let mut conn = PgConnection::connect(&options).await?;

    let mut results = Vec::with_capacity(queries.len());
    for sql in &queries {
        let outcome = infer_with(sql, mapping.clone(), &infer_options, &mut conn)
            .await
            .with_context(|| format!("inspecting query: {}", sql))?;
        results.push(outcome);
    }
    conn.close().await?;

    match cli.format {
        OutputFormat::Json => {
            let reports: Vec<Report> = queries
                .iter()
                .zip(&results)
                .map(|(query, outcome)| match outcome {
                    Outcome::Ok(types) => Report {
                        query,
                        types: Some(types),
                        error: None,
                    },
                    Outcome::ServerError(e) => Report {
                        query,
                        types: None,
                        error: Some(e),
                    },
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        OutputFormat::Table => {
            for (query, outcome) in queries.iter().zip(&results) {
                print_table(query, outcome);
            }
        }
    }

    let rejected = results.iter().filter(|outcome| !outcome.is_ok()).count();
    Ok(if rejected > 0 { EXIT_QUERY_ERRORS } else { 0 })
}

fn print_table(query: &str, outcome: &Outcome<QueryTypesResult>) {
    println!("{}", query.yellow());

    match outcome {
        Outcome::ServerError(e) => {
            println!("  {} {}", "✗".red(), e);
        }
        Outcome::Ok(types) => {
            if !types.param_metadata.params.is_empty() {
                println!("  {}", "Parameters:".cyan());
                for (i, ty) in types.param_metadata.params.iter().enumerate() {
                    let name = types
                        .param_metadata
                        .mapping
                        .get(&(i + 1))
                        .map(String::as_str)
                        .unwrap_or("");
                    println!("    ${:<3} {:<16} {}", i + 1, name, ty.to_string().white());
                }
            }

            if types.return_types.is_empty() {
                println!("  {}", "(no result columns)".dimmed());
            } else {
                println!("  {}", "Columns:".cyan());
                let width = types
                    .return_types
                    .iter()
                    .map(|column| column.return_name.len())
                    .max()
                    .unwrap_or(0);
                for column in &types.return_types {
                    let nullability = if column.nullable {
                        "NULL".dimmed()
                    } else {
                        "NOT NULL".green()
                    };
                    let comment = column
                        .comment
                        .as_deref()
                        .map(|c| format!("  -- {}", c).dimmed().to_string())
                        .unwrap_or_default();
                    println!(
                        "    {:<width$}  {}  {}{}",
                        column.return_name,
                        column.type_.to_string().white(),
                        nullability,
                        comment,
                        width = width
                    );
                }
            }
        }
    }
    println!();
}
