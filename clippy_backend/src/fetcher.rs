//! Polite fetching: robots.txt permission checks and crawl-delay spacing for
//! a single origin.
//!
//! Every request the session client issues goes through [`RateLimitedFetcher`]:
//! `check` before anything is sent, `throttle` to obtain a permit, and
//! `ThrottlePermit::complete` once a response (any status) came back.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, Instant};
use url::Url;

use crate::error::{ForumError, ForumResult};

#[derive(Debug, Clone, PartialEq, Eq)]
struct RobotsRule {
    allow: bool,
    path: String,
}

#[derive(Debug, Clone, Default)]
struct RobotsGroup {
    agents: Vec<String>,
    rules: Vec<RobotsRule>,
    crawl_delay: Option<Duration>,
}

impl RobotsGroup {
    fn applies_to(&self, user_agent: &str) -> bool {
        // Only the product token counts: "clippy/1.0" matches "clippy".
        let token = user_agent
            .split('/')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        self.agents.iter().any(|agent| {
            agent == "*" || (!agent.is_empty() && token.contains(&agent.to_ascii_lowercase()))
        })
    }

    fn allowance(&self, path: &str) -> bool {
        self.rules
            .iter()
            .find(|rule| rule.path == "*" || path.starts_with(&rule.path))
            .map(|rule| rule.allow)
            .unwrap_or(true)
    }
}

/// Parsed robots.txt rules.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    groups: Vec<RobotsGroup>,
    default_group: Option<RobotsGroup>,
    disallow_all: bool,
    allow_all: bool,
}

impl RobotsRules {
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            ..Default::default()
        }
    }

    pub fn disallow_all() -> Self {
        Self {
            disallow_all: true,
            ..Default::default()
        }
    }

    pub fn parse(contents: &str) -> Self {
        #[derive(PartialEq)]
        enum State {
            Start,
            SawAgent,
            SawRule,
        }

        let mut rules = RobotsRules::default();
        let mut current = RobotsGroup::default();
        let mut state = State::Start;

        let finish = |group: RobotsGroup, rules: &mut RobotsRules| {
            if group.agents.iter().any(|agent| agent == "*") {
                if rules.default_group.is_none() {
                    rules.default_group = Some(group);
                }
            } else if !group.agents.is_empty() {
                rules.groups.push(group);
            }
        };

        for raw_line in contents.lines() {
            let line = match raw_line.find('#') {
                Some(idx) => &raw_line[..idx],
                None => raw_line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    if state == State::SawRule {
                        finish(std::mem::take(&mut current), &mut rules);
                    }
                    current.agents.push(value.to_string());
                    state = State::SawAgent;
                }
                "disallow" | "allow" if state != State::Start => {
                    // An empty Disallow means "everything allowed".
                    let allow = field == "allow" || value.is_empty();
                    current.rules.push(RobotsRule {
                        allow,
                        path: value.to_string(),
                    });
                    state = State::SawRule;
                }
                "crawl-delay" if state != State::Start => {
                    if let Ok(seconds) = value.parse::<f64>() {
                        if seconds.is_finite() && seconds >= 0.0 {
                            current.crawl_delay = Some(Duration::from_secs_f64(seconds));
                        }
                    }
                    state = State::SawRule;
                }
                _ => {}
            }
        }

        if state != State::Start {
            finish(current, &mut rules);
        }
        rules
    }

    pub fn can_fetch(&self, user_agent: &str, path: &str) -> bool {
        if self.disallow_all {
            return false;
        }
        if self.allow_all {
            return true;
        }
        let path = if path.is_empty() { "/" } else { path };

        if let Some(group) = self.groups.iter().find(|g| g.applies_to(user_agent)) {
            return group.allowance(path);
        }
        self.default_group
            .as_ref()
            .map(|group| group.allowance(path))
            .unwrap_or(true)
    }

    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        if let Some(group) = self.groups.iter().find(|g| g.applies_to(user_agent)) {
            if group.crawl_delay.is_some() {
                return group.crawl_delay;
            }
        }
        self.default_group.as_ref().and_then(|g| g.crawl_delay)
    }
}

/// Fetch permission and spacing policy for one origin.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    rules: RobotsRules,
    user_agent: String,
    floor: Option<Duration>,
}

impl OriginPolicy {
    pub fn new(rules: RobotsRules, user_agent: impl Into<String>, floor: Option<Duration>) -> Self {
        Self {
            rules,
            user_agent: user_agent.into(),
            floor,
        }
    }

    /// Read `/robots.txt` from the origin of `base_url`.
    pub async fn load(
        client: &reqwest::Client,
        base_url: &Url,
        user_agent: &str,
        floor: Option<Duration>,
    ) -> ForumResult<Self> {
        let robots_url = base_url
            .join("/robots.txt")
            .map_err(|e| ForumError::invalid(format!("Bad base URL: {}", e)))?;

        let response = client.get(robots_url.clone()).send().await?;
        let status = response.status();

        let rules = if status.is_success() {
            let body = response.text().await?;
            RobotsRules::parse(&body)
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            tracing::warn!("robots.txt returned {}; treating every path as disallowed", status);
            RobotsRules::disallow_all()
        } else if status.is_client_error() {
            tracing::info!("robots.txt returned {}; no restrictions apply", status);
            RobotsRules::allow_all()
        } else {
            let body = response.text().await.unwrap_or_default();
            return Err(ForumError::RequestFailed {
                status: status.as_u16(),
                body,
            });
        };

        tracing::info!("Loaded crawl policy from {}", robots_url);
        Ok(Self::new(rules, user_agent, floor))
    }

    pub fn is_path_allowed(&self, path: &str) -> bool {
        self.rules.can_fetch(&self.user_agent, path)
    }

    pub fn is_url_allowed(&self, url: &Url) -> bool {
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        self.is_path_allowed(&path)
    }

    pub fn min_interval(&self) -> Option<Duration> {
        match (self.rules.crawl_delay(&self.user_agent), self.floor) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Serializes requests to one origin and keeps them spaced by the policy's
/// minimum interval.
pub struct RateLimitedFetcher {
    policy: OriginPolicy,
    last_completed: Mutex<Option<Instant>>,
}

/// Held while a request is in flight. Call [`ThrottlePermit::complete`] once a
/// response arrived; dropping it without completing leaves the clock alone.
pub struct ThrottlePermit<'a> {
    guard: MutexGuard<'a, Option<Instant>>,
}

impl ThrottlePermit<'_> {
    pub fn complete(mut self) {
        *self.guard = Some(Instant::now());
    }
}

impl RateLimitedFetcher {
    pub fn new(policy: OriginPolicy) -> Self {
        Self {
            policy,
            last_completed: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &OriginPolicy {
        &self.policy
    }

    pub fn allowed(&self, url: &Url) -> bool {
        self.policy.is_url_allowed(url)
    }

    pub fn check(&self, url: &Url) -> ForumResult<()> {
        if self.allowed(url) {
            Ok(())
        } else {
            Err(ForumError::PolicyViolation {
                url: url.to_string(),
            })
        }
    }

    /// Wait for our turn and for the crawl delay to elapse.
    pub async fn throttle(&self) -> ThrottlePermit<'_> {
        let guard = self.last_completed.lock().await;
        if let (Some(interval), Some(last)) = (self.policy.min_interval(), *guard) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                let wait = interval - elapsed;
                tracing::info!(
                    "Respecting crawl delay. Sleeping for {:.2} seconds.",
                    wait.as_secs_f64()
                );
                sleep(wait).await;
            }
        }
        ThrottlePermit { guard }
    }
}
