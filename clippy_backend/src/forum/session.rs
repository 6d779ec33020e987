//! Authenticated HTTP session with the forum.
//!
//! Every request to the forum origin goes through the rate-limited fetcher:
//! robots check first (a disallowed URL is never sent), then the crawl-delay
//! throttle, then the request itself.

use std::sync::{Arc, RwLock};

use reqwest::cookie::{CookieStore, Jar};
use reqwest::multipart::Form;
use reqwest::{RequestBuilder, Response};
use serde_json::Value;
use url::Url;

use crate::error::{ForumError, ForumResult};
use crate::fetcher::RateLimitedFetcher;
use crate::http_client::{build_http_client_with, HttpClientOptions};
use crate::realtime::CookieSource;

pub struct SessionClient {
    base: Url,
    client: reqwest::Client,
    jar: Arc<Jar>,
    fetcher: RateLimitedFetcher,
    csrf_token: RwLock<Option<String>>,
}

impl SessionClient {
    pub fn new(base: Url, user_agent: &str, fetcher: RateLimitedFetcher) -> Self {
        let jar = Arc::new(Jar::default());
        let client = build_http_client_with(HttpClientOptions {
            user_agent: Some(user_agent.to_string()),
            timeout: None,
            cookie_jar: Some(jar.clone()),
        });
        Self {
            base,
            client,
            jar,
            fetcher,
            csrf_token: RwLock::new(None),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn fetcher(&self) -> &RateLimitedFetcher {
        &self.fetcher
    }

    /// Resolve a forum-relative path (or pass through an absolute URL).
    pub fn resolve(&self, path: &str) -> ForumResult<Url> {
        self.base
            .join(path)
            .map_err(|e| ForumError::invalid(format!("Bad URL '{}': {}", path, e)))
    }

    fn is_forum_origin(&self, url: &Url) -> bool {
        url.origin() == self.base.origin()
    }

    /// Policy check, throttle, send, record completion, map non-2xx.
    async fn send(
        &self,
        url: Url,
        build: impl FnOnce(&reqwest::Client, Url) -> RequestBuilder,
    ) -> ForumResult<Response> {
        self.fetcher.check(&url)?;
        let permit = self.fetcher.throttle().await;
        tracing::debug!("Requesting {}", url);

        // A transport failure drops the permit without touching the clock.
        let response = build(&self.client, url).send().await?;
        permit.complete();

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ForumError::RequestFailed {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    pub async fn get(&self, path: &str) -> ForumResult<Response> {
        let url = self.resolve(path)?;
        self.send(url, |client, url| client.get(url)).await
    }

    pub async fn get_json(&self, path: &str) -> ForumResult<Value> {
        let response = self.get(path).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| ForumError::invalid(format!("{} did not return JSON: {}", path, e)))
    }

    /// Media download. Forum URLs go through the crawl policy; other hosts
    /// (image links in posts) are fetched directly.
    pub async fn get_bytes(&self, url_or_path: &str) -> ForumResult<Vec<u8>> {
        let url = self.resolve(url_or_path)?;
        let response = if self.is_forum_origin(&url) {
            self.send(url, |client, url| client.get(url)).await?
        } else {
            let response = self.client.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ForumError::RequestFailed {
                    status: status.as_u16(),
                    body,
                });
            }
            response
        };
        Ok(response.bytes().await?.to_vec())
    }

    /// Form POST carrying the current CSRF token.
    pub async fn post_form(&self, path: &str, fields: &[(&str, &str)]) -> ForumResult<Response> {
        let url = self.resolve(path)?;
        let token = self.csrf_token();
        let fields: Vec<(String, String)> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.send(url, move |client, url| {
            let mut req = client.post(url).form(&fields);
            if let Some(token) = token {
                req = req.header("x-csrf-token", token);
            }
            req
        })
        .await
    }

    /// Multipart POST with a freshly fetched CSRF token.
    pub async fn post_multipart(&self, path: &str, form: Form) -> ForumResult<Response> {
        let url = self.resolve(path)?;
        let token = self.refresh_csrf().await?;
        self.send(url, move |client, url| {
            client
                .post(url)
                .header("X-CSRF-Token", token)
                .multipart(form)
        })
        .await
    }

    /// Fetch a new CSRF token from `/api/config`.
    pub async fn refresh_csrf(&self) -> ForumResult<String> {
        let config = self.get_json("/api/config").await?;
        let token = config
            .get("csrf_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ForumError::invalid("/api/config has no csrf_token"))?
            .to_string();
        *self
            .csrf_token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token.clone());
        Ok(token)
    }

    pub fn csrf_token(&self) -> Option<String> {
        self.csrf_token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn login(&self, username: &str, password: &str) -> ForumResult<()> {
        let token = self.refresh_csrf().await?;
        let result = self
            .post_form(
                "/login",
                &[
                    ("username", username),
                    ("password", password),
                    ("_csrf", token.as_str()),
                ],
            )
            .await;

        match result {
            Ok(_) => {
                tracing::info!("Logged in to {} as {}", self.base, username);
                // The session cookie comes with a new token.
                if let Err(e) = self.refresh_csrf().await {
                    tracing::warn!("Could not refresh CSRF token after login: {}", e);
                }
                Ok(())
            }
            Err(ForumError::RequestFailed { status, body }) => {
                Err(ForumError::AuthenticationFailed { status, body })
            }
            Err(e) => Err(e),
        }
    }

    /// `Cookie` header value for the forum origin.
    pub fn cookie_header(&self) -> Option<String> {
        cookie_header(&self.jar, &self.base)
    }

    /// Cookie provider for the realtime handshake, read at every connect.
    pub fn cookie_source(&self) -> CookieSource {
        let jar = self.jar.clone();
        let base = self.base.clone();
        Arc::new(move || cookie_header(&jar, &base))
    }

    #[cfg(test)]
    pub(crate) fn add_cookie(&self, cookie: &str) {
        self.jar.add_cookie_str(cookie, &self.base);
    }
}

fn cookie_header(jar: &Jar, base: &Url) -> Option<String> {
    jar.cookies(base)
        .and_then(|value| value.to_str().ok().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{OriginPolicy, RobotsRules};

    fn session(robots: &str) -> SessionClient {
        let base = Url::parse("https://forum.invalid/").unwrap();
        let policy = OriginPolicy::new(RobotsRules::parse(robots), "clippy", None);
        SessionClient::new(base, "clippy", RateLimitedFetcher::new(policy))
    }

    #[test]
    fn resolves_relative_and_absolute_urls() {
        let client = session("");
        assert_eq!(
            client.resolve("/api/recent").unwrap().as_str(),
            "https://forum.invalid/api/recent"
        );
        assert_eq!(
            client
                .resolve("https://images.example/cat.jpg")
                .unwrap()
                .as_str(),
            "https://images.example/cat.jpg"
        );
    }

    #[tokio::test]
    async fn disallowed_path_is_never_sent() {
        let client = session("User-agent: *\nDisallow: /api/notifications\n");
        let err = client.get("/api/notifications").await.unwrap_err();
        match err {
            ForumError::PolicyViolation { url } => assert!(url.ends_with("/api/notifications")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn cookie_header_reflects_jar() {
        let client = session("");
        assert!(client.cookie_header().is_none());
        client.add_cookie("express.sid=abc123; Path=/");
        let source = client.cookie_source();
        assert_eq!(client.cookie_header().as_deref(), Some("express.sid=abc123"));
        assert_eq!(source().as_deref(), Some("express.sid=abc123"));
    }
}
