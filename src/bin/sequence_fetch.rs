use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use repeatcrawl::logging::init_tracing;
use repeatcrawl::runtime::http_client;
use repeatcrawl::sequences::{error_log_path, HttpSequenceLookup};
use repeatcrawl::{resolve_sink, SequenceCli};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = SequenceCli::parse();
    let client = http_client(Duration::from_secs(cli.http_timeout_secs.max(1)))
        .context("building http client")?;
    let lookup = HttpSequenceLookup::new(client);
    let summary = resolve_sink(&cli.input, &cli.output, &lookup)
        .await
        .with_context(|| format!("resolving sequences from {}", cli.input.display()))?;
    println!(
        "Done. Wrote {} sequences to {}. Errors in {}.",
        summary.written,
        cli.output.display(),
        error_log_path(&cli.output).display()
    );
    Ok(())
}
