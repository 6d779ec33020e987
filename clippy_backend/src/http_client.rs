use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for the shared HTTP client.
#[derive(Clone, Default)]
pub struct HttpClientOptions {
    pub user_agent: Option<String>,
    pub timeout: Option<Duration>,
    pub cookie_jar: Option<Arc<Jar>>,
}

pub fn build_http_client() -> reqwest::Client {
    build_http_client_with(HttpClientOptions::default())
}

pub fn build_http_client_with(options: HttpClientOptions) -> reqwest::Client {
    let allow_system_proxy = std::env::var("CLIPPY_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        if let Ok(Ok(client)) = std::panic::catch_unwind(|| attempt_build(&options, false)) {
            return client;
        }

        tracing::warn!(
            "HTTP client initialization with system proxy discovery failed; retrying with no_proxy"
        );
    }

    match std::panic::catch_unwind(|| attempt_build(&options, true)) {
        Ok(Ok(client)) => client,
        Ok(Err(error)) => {
            panic!(
                "Failed to initialize HTTP client (no_proxy fallback returned error): {}",
                error
            );
        }
        Err(_) => {
            panic!("Failed to initialize HTTP client (no_proxy fallback panicked)");
        }
    }
}

fn attempt_build(
    options: &HttpClientOptions,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder =
        reqwest::Client::builder().timeout(options.timeout.unwrap_or(DEFAULT_TIMEOUT));
    if let Some(user_agent) = options.user_agent.as_deref() {
        builder = builder.user_agent(user_agent);
    }
    if let Some(jar) = options.cookie_jar.clone() {
        builder = builder.cookie_provider(jar);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
