use tracing_subscriber::EnvFilter;

use clippy_backend::config::AgentConfig;
use clippy_backend::runtime::run_supervised;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,clippy=debug,clippy_backend=debug")),
        )
        .init();

    let config = AgentConfig::load();
    tracing::info!(
        "Clippy starting as {} on {} (model {})",
        config.username,
        config.forum_url,
        config.llm_model
    );

    run_supervised(config).await;
}
