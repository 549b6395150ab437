use anyhow::Result;
use clap::Parser;
use repeatcrawl::logging::init_tracing;
use repeatcrawl::{run_harvest, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    run_harvest(Cli::parse()).await
}
