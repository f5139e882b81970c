mod commands;
mod output;
mod utils;

use clap::Parser;
use ovirtkit_core::Config;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ovirtkit")]
#[command(about = "ovirtkit - Upload disk images to an oVirt engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    #[arg(short, long, global = true, help = "Verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Quiet output")]
    quiet: bool,

    #[arg(
        long,
        global = true,
        help = "Output format",
        value_enum,
        default_value = "table"
    )]
    format: output::OutputFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    tracing::debug!(engine = %config.engine.url, "configuration loaded");

    match commands::execute(cli.command, config, cli.format).await {
        Ok(_) => Ok(()),
        Err(e) => {
            output::print_error(&format!("{e:#}"));
            std::process::exit(1);
        }
    }
}
