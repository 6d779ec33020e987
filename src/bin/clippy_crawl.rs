use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use clippy_backend::config::AgentConfig;
use clippy_backend::crawl::crawl_once;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,clippy_backend=debug")),
        )
        .init();

    let config = AgentConfig::load();
    let report = crawl_once(&config).await.context("crawl failed")?;
    println!(
        "Ingested {} comment(s) from {} topic(s)",
        report.comments, report.topics
    );
    Ok(())
}
