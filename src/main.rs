mod app;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use app::App;

/// Split and inspect SQL Server batch scripts.
#[derive(Parser)]
#[command(name = "sqlbatch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every batch a script splits into, without executing anything.
    Parse(ParseArgs),
    /// Print the effective configuration as JSON.
    Config,
    /// Print the SET statements issued before and after a script.
    Statements(StatementsArgs),
}

#[derive(clap::Args)]
struct ParseArgs {
    /// Script file to split.
    file: PathBuf,

    /// Batch separator token.
    #[arg(long)]
    separator: Option<String>,

    /// Recognise SQLCMD directives and `$(name)` references.
    #[arg(long)]
    sqlcmd: bool,

    /// Scripting variable (format: NAME=VALUE). Repeatable. Listed in the
    /// report header only: parsing leaves `$(name)` references as written.
    #[arg(short = 'v', long = "var", value_parser = parse_variable)]
    variables: Vec<(String, String)>,
}

#[derive(clap::Args)]
struct StatementsArgs {
    /// Server major version the statements are chosen for.
    #[arg(long, default_value_t = 16)]
    server_version: u32,

    /// Statements for a script that failed (ROLLBACK instead of COMMIT).
    #[arg(long)]
    failed: bool,
}

fn parse_variable(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut app = App::new();
    let outcome = match cli.command {
        Command::Parse(args) => app.parse(&args.file, args.separator, args.sqlcmd, args.variables),
        Command::Config => app.print_config(),
        Command::Statements(args) => app.print_statements(args.server_version, args.failed),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
