//! parser-state CLI entry point

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use parser_state::commands::{run_parse, run_watch, CommandContext, CommandOutput};
use parser_state::{Cli, ParserStateConfig};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(output) => {
            print!("{}", output.text);
            ExitCode::from(output.exit_status)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn run(cli: &Cli) -> parser_state::Result<CommandOutput> {
    let config = match &cli.config {
        Some(path) => ParserStateConfig::load(path)?,
        None => ParserStateConfig::default(),
    };
    init_tracing(&config, cli.verbose);

    let ctx = CommandContext::new(cli.format, cli.verbose, config);
    match &cli.command {
        parser_state::cli::Commands::Parse(args) => run_parse(args, &ctx),
        parser_state::cli::Commands::Watch(args) => run_watch(args, &ctx),
    }
}

/// Logs go to stderr so stdout stays clean for reports and the event stream
fn init_tracing(config: &ParserStateConfig, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("parser_state={}", level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
