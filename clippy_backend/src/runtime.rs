//! Service wiring and the top-level supervisor.
//!
//! [`BotRuntime::bootstrap`] builds the whole service state: crawl policy,
//! logged-in session, realtime channel, tools and dispatch loop.
//! [`run_supervised`] runs it forever on a separate task, rebuilding
//! everything after a failure or panic with an exponential restart delay.
//! The deferred queue outlives restarts so in-flight media jobs still land.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::sync::Notify;
use url::Url;

use crate::config::AgentConfig;
use crate::database::AgentDatabase;
use crate::deferred::DeferredQueue;
use crate::dispatch::{DispatchLoop, DispatchSettings};
use crate::fetcher::{OriginPolicy, RateLimitedFetcher};
use crate::forum::nodebb::{NodeBB, NEW_NOTIFICATION_EVENT};
use crate::forum::session::SessionClient;
use crate::forum::Forum;
use crate::http_client::{build_http_client_with, HttpClientOptions};
use crate::llm_client::LlmClient;
use crate::memory::MemoryStore;
use crate::realtime::backoff::Backoff;
use crate::realtime::{Endpoint, RealtimeChannel};
use crate::store::ForumStore;
use crate::tools::agentic::ConversationEngine;
use crate::tools::forum_search::ForumSearchTool;
use crate::tools::image_gen::{GenerateImageTool, HordeBackend};
use crate::tools::memory::{MemoryAppendTool, MemoryReplaceTool};
use crate::tools::search::WebSearchTool;
use crate::tools::vision::AskImageTool;
use crate::tools::ToolRegistry;

/// A run at least this long resets the restart delay.
const HEALTHY_RUN: Duration = Duration::from_secs(60 * 60);
const FIRST_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Load the crawl policy and log in.
pub async fn login_session(config: &AgentConfig) -> Result<Arc<SessionClient>> {
    let base = Url::parse(&config.forum_url)
        .with_context(|| format!("Invalid forum URL '{}'", config.forum_url))?;
    let password = config
        .password
        .as_deref()
        .filter(|p| !p.is_empty())
        .context("No forum password configured (set NODEBB_PASSWORD)")?;

    let bootstrap_client = build_http_client_with(HttpClientOptions {
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    });
    let policy = OriginPolicy::load(
        &bootstrap_client,
        &base,
        &config.user_agent,
        config.min_request_interval(),
    )
    .await
    .context("Failed to load robots.txt")?;
    if let Some(interval) = policy.min_interval() {
        tracing::info!("Spacing forum requests at least {:?} apart", interval);
    }

    let session = Arc::new(SessionClient::new(
        base,
        &config.user_agent,
        RateLimitedFetcher::new(policy),
    ));
    session
        .login(&config.username, password)
        .await
        .context("Forum login failed")?;
    Ok(session)
}

/// Tools available to every conversation.
pub async fn build_registry(
    config: &AgentConfig,
    forum: Arc<dyn Forum>,
    llm: &LlmClient,
    store: Arc<ForumStore>,
) -> Arc<ToolRegistry> {
    let registry = Arc::new(ToolRegistry::new());
    registry
        .register(Arc::new(WebSearchTool::new(
            config.search_url.clone(),
            config.search_max_results,
        )))
        .await;
    registry
        .register(Arc::new(AskImageTool::new(
            forum.clone(),
            Arc::new(llm.with_model(&config.vision_model)),
        )))
        .await;
    registry.register(Arc::new(MemoryAppendTool)).await;
    registry.register(Arc::new(MemoryReplaceTool)).await;
    registry.register(Arc::new(ForumSearchTool::new(store))).await;

    if config.image_generation.enabled {
        let backend = Arc::new(HordeBackend::new(config.image_generation.clone()));
        registry
            .register(Arc::new(GenerateImageTool::new(backend, forum)))
            .await;
    } else {
        tracing::info!("Image generation disabled");
    }
    registry
}

pub struct BotRuntime {
    dispatch: DispatchLoop,
    realtime: RealtimeChannel,
}

impl BotRuntime {
    pub async fn bootstrap(config: &AgentConfig, deferred: DeferredQueue) -> Result<Self> {
        let db = Arc::new(
            AgentDatabase::new(&config.database_path).with_context(|| {
                format!("Failed to open database at '{}'", config.database_path)
            })?,
        );
        let memory = Arc::new(MemoryStore::open(db.clone())?);
        let store = Arc::new(ForumStore::new(db));

        let session = login_session(config).await?;

        let activity = Arc::new(Notify::new());
        let realtime = RealtimeChannel::new(config.realtime.clone());
        {
            let activity = activity.clone();
            realtime.on_event(
                NEW_NOTIFICATION_EVENT,
                Arc::new(move |_args: &[serde_json::Value]| activity.notify_one()),
            );
        }
        let endpoint = Endpoint::for_forum(
            session.base_url(),
            &config.user_agent,
            session.cookie_source(),
        )?;
        realtime.connect(endpoint);

        let forum: Arc<dyn Forum> = Arc::new(NodeBB::new(session, realtime.clone()));

        let llm = LlmClient::from_config(config);
        let registry = build_registry(config, forum.clone(), &llm, store).await;
        tracing::info!("Tools: {:?}", registry.list_names().await);

        let engine = ConversationEngine::new(Arc::new(llm), registry, config.max_iterations);
        let dispatch = DispatchLoop::new(
            forum,
            engine,
            memory,
            deferred,
            activity,
            DispatchSettings::from_config(config),
        );

        Ok(Self { dispatch, realtime })
    }

    pub async fn run(&self) -> Result<()> {
        self.dispatch.run_forever().await
    }

    pub fn shutdown(&self) {
        self.realtime.shutdown();
    }
}

impl Drop for BotRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Restart delay: doubles from one second up to a cap, and starts over once
/// a run stayed healthy for an hour.
pub struct RestartPolicy {
    backoff: Backoff,
    healthy_after: Duration,
}

impl RestartPolicy {
    pub fn new(max_delay: Duration) -> Self {
        Self::with_delays(FIRST_RESTART_DELAY, max_delay)
    }

    fn with_delays(first: Duration, max_delay: Duration) -> Self {
        Self {
            backoff: Backoff::new(first, max_delay, 0.0),
            healthy_after: HEALTHY_RUN,
        }
    }

    pub fn delay_after(&mut self, run_time: Duration) -> Duration {
        if run_time >= self.healthy_after {
            self.backoff.reset();
        }
        self.backoff.next_delay()
    }
}

/// Run the bot forever. Failures are logged and the whole service state is
/// rebuilt after the restart delay.
pub async fn run_supervised(config: AgentConfig) {
    let policy = RestartPolicy::new(Duration::from_secs(config.restart_delay_max_secs));
    let config = Arc::new(config);
    let deferred = DeferredQueue::new();

    supervise(policy, move || {
        let config = config.clone();
        let deferred = deferred.clone();
        async move {
            let runtime = BotRuntime::bootstrap(&config, deferred).await?;
            let result = runtime.run().await;
            drop(runtime);
            result
        }
    })
    .await
}

/// Start a fresh service lifetime from `start` after every exit.
async fn supervise<F, Fut>(mut policy: RestartPolicy, mut start: F)
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        let started = Instant::now();
        if let Err(e) = run_contained(start()).await {
            tracing::error!("Clippy stopped: {:#}", e);
        }

        let delay = policy.delay_after(started.elapsed());
        tracing::warn!("Restarting in {:?}", delay);
        tokio::time::sleep(delay).await;
    }
}

/// Run one service lifetime on its own task; a panic comes back as an error.
async fn run_contained<Fut>(run: Fut) -> Result<()>
where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    match tokio::spawn(run).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(anyhow!("panicked: {}", panic_message(e.into_panic()))),
        Err(e) => Err(anyhow!("service task cancelled: {}", e)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeForum, ScriptedModel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn restart_delay_doubles_to_cap() {
        let mut policy = RestartPolicy::new(Duration::from_secs(20 * 60));
        let delays: Vec<u64> = (0..13)
            .map(|_| policy.delay_after(Duration::from_secs(1)).as_secs())
            .collect();
        assert_eq!(&delays[..5], &[1, 2, 4, 8, 16]);
        assert_eq!(delays[10], 1024);
        assert_eq!(delays[11], 1200);
        assert_eq!(delays[12], 1200);
    }

    #[test]
    fn healthy_run_resets_delay() {
        let mut policy = RestartPolicy::new(Duration::from_secs(1200));
        for _ in 0..5 {
            policy.delay_after(Duration::ZERO);
        }
        assert_eq!(policy.delay_after(HEALTHY_RUN), Duration::from_secs(1));
        assert_eq!(policy.delay_after(Duration::ZERO), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn missing_password_fails_before_network() {
        let config = AgentConfig {
            forum_url: "https://forum.invalid".to_string(),
            password: None,
            ..AgentConfig::default()
        };
        let err = login_session(&config).await.err().unwrap();
        assert!(err.to_string().contains("NODEBB_PASSWORD"));
    }

    #[tokio::test]
    async fn registry_exposes_every_tool() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(AgentDatabase::new(dir.path().join("t.db")).unwrap());
        let config = AgentConfig::default();
        let llm = LlmClient::from_config(&config);
        let registry = build_registry(
            &config,
            Arc::new(crate::testing::FakeForum::default()),
            &llm,
            Arc::new(ForumStore::new(db)),
        )
        .await;
        assert_eq!(
            registry.list_names().await,
            vec![
                "ask_image",
                "generate_image",
                "memory_append",
                "memory_replace",
                "search",
                "search_forum",
            ]
        );
    }

    /// Dispatch loop over a forum whose notification listing panics.
    fn exploding_dispatch(dir: &tempfile::TempDir) -> DispatchLoop {
        let db = Arc::new(AgentDatabase::new(dir.path().join("boom.db")).unwrap());
        let forum = FakeForum::default();
        *forum.panic_listing.lock().unwrap() = true;
        let engine = ConversationEngine::new(
            Arc::new(ScriptedModel::new(vec![])),
            Arc::new(ToolRegistry::new()),
            10,
        );
        DispatchLoop::new(
            Arc::new(forum),
            engine,
            Arc::new(MemoryStore::open(db).unwrap()),
            DeferredQueue::new(),
            Arc::new(Notify::new()),
            DispatchSettings::from_config(&AgentConfig::default()),
        )
    }

    #[tokio::test]
    async fn panic_in_dispatch_becomes_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let dispatch = exploding_dispatch(&dir);
        let err = run_contained(async move { dispatch.run_forever().await })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("notification listing exploded"));
    }

    #[tokio::test]
    async fn supervisor_restarts_after_panics() {
        let dir = Arc::new(tempfile::tempdir().unwrap());
        let starts = Arc::new(AtomicUsize::new(0));

        let counter = starts.clone();
        let supervisor = tokio::spawn(supervise(
            RestartPolicy::with_delays(Duration::from_millis(1), Duration::from_millis(5)),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let dispatch = exploding_dispatch(&dir);
                async move { dispatch.run_forever().await }
            },
        ));

        let restarted = tokio::time::timeout(Duration::from_secs(5), async {
            while starts.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(restarted.is_ok());
        assert!(!supervisor.is_finished());
        supervisor.abort();
    }
}
