use anyhow::Result;
use clap::Parser;
use repeatcrawl::logging::init_tracing;
use repeatcrawl::{run_region_job, JobCli};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let code = run_region_job(JobCli::parse()).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
