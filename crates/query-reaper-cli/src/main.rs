use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = query_reaper_cli::Cli::parse();
    query_reaper_cli::init_tracing(cli.log_json())?;
    query_reaper_cli::run_cli(cli)
}
