//! Web search through DuckDuckGo's HTML endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex_lite::Regex;
use reqwest::Url;
use serde_json::{json, Value};
use std::time::Duration;

use super::{Tool, ToolCategory, ToolContext, ToolOutput};
use crate::forum::markup::html_to_text;
use crate::http_client::{build_http_client_with, HttpClientOptions};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
// The HTML endpoint rejects obvious bot agents.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

pub struct WebSearchTool {
    endpoint: String,
    max_results: usize,
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(endpoint: impl Into<String>, max_results: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_results: max_results.max(1),
            client: build_http_client_with(HttpClientOptions {
                user_agent: Some(BROWSER_USER_AGENT.to_string()),
                timeout: Some(SEARCH_TIMEOUT),
                cookie_jar: None,
            }),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search the web with DuckDuckGo. Returns titles, links and snippets of the top results."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to search for"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if query.is_empty() {
            return Ok(ToolOutput::Error("Search query is empty".to_string()));
        }

        tracing::info!("Searching the web for '{}'", query);
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[("q", query)])
            .send()
            .await
            .context("search request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("search endpoint returned {}", status);
        }
        let html = response.text().await.context("search response unreadable")?;

        let results = parse_results(&html, self.max_results);
        if results.is_empty() {
            return Ok(ToolOutput::Text(format!("No results found for '{}'", query)));
        }
        Ok(ToolOutput::Text(format_results(&results)))
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Network
    }
}

/// Extract results from the DuckDuckGo HTML page.
pub fn parse_results(html: &str, limit: usize) -> Vec<SearchResult> {
    let (Ok(link_re), Ok(snippet_re)) = (
        Regex::new(r#"(?is)<a([^>]*class="[^"]*result__a[^"]*"[^>]*)>(.*?)</a>"#),
        Regex::new(r#"(?is)<(?:a|div|td)[^>]*class="[^"]*result__snippet[^"]*"[^>]*>(.*?)</(?:a|div|td)>"#),
    ) else {
        return Vec::new();
    };
    let Ok(href_re) = Regex::new(r#"(?i)\bhref\s*=\s*"([^"]*)""#) else {
        return Vec::new();
    };

    let links: Vec<(usize, String, String)> = link_re
        .captures_iter(html)
        .filter_map(|caps| {
            let start = caps.get(0)?.end();
            let href = href_re.captures(&caps[1])?[1].to_string();
            Some((start, resolve_result_url(&href), html_to_text(&caps[2])))
        })
        .collect();

    let mut results = Vec::new();
    for (index, (start, url, title)) in links.iter().enumerate() {
        if url.is_empty() || title.is_empty() {
            continue;
        }
        // A snippet belongs to the closest preceding title link.
        let end = links.get(index + 1).map(|next| next.0).unwrap_or(html.len());
        let snippet = snippet_re
            .captures(&html[*start..end])
            .map(|caps| html_to_text(&caps[1]))
            .unwrap_or_default();

        results.push(SearchResult {
            title: title.clone(),
            url: url.clone(),
            snippet,
        });
        if results.len() >= limit {
            break;
        }
    }
    results
}

/// Unwrap DuckDuckGo's `/l/?uddg=` redirect links.
fn resolve_result_url(href: &str) -> String {
    let href = href.replace("&amp;", "&");
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else {
        href.clone()
    };

    match Url::parse(&absolute) {
        Ok(url) => url
            .query_pairs()
            .find(|(key, _)| key == "uddg")
            .map(|(_, target)| target.into_owned())
            .unwrap_or(absolute),
        Err(_) => href,
    }
}

fn format_results(results: &[SearchResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            if r.snippet.is_empty() {
                format!("{}. {}\n   {}", i + 1, r.title, r.url)
            } else {
                format!("{}. {}\n   {}\n   {}", i + 1, r.title, r.url, r.snippet)
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<div class="result results_links results_links_deep web-result">
  <h2 class="result__title">
    <a rel="nofollow" class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.rust-lang.org%2F&amp;rut=abc">The <b>Rust</b> Programming Language</a>
  </h2>
  <a class="result__snippet" href="//duckduckgo.com/l/?uddg=x">A language empowering everyone to build <b>reliable</b> software.</a>
</div>
<div class="result results_links web-result">
  <h2 class="result__title">
    <a rel="nofollow" class="result__a" href="https://doc.rust-lang.org/book/">The Book</a>
  </h2>
</div>
<div class="result">
  <a rel="nofollow" class="result__a" href="https://crates.io/">crates.io</a>
  <a class="result__snippet" href="https://crates.io/">Rust package registry &amp; more</a>
</div>
"#;

    #[test]
    fn parses_titles_links_and_snippets() {
        let results = parse_results(PAGE, 10);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].title, "The Rust Programming Language");
        assert_eq!(results[0].url, "https://www.rust-lang.org/");
        assert_eq!(
            results[0].snippet,
            "A language empowering everyone to build reliable software."
        );
        assert_eq!(results[1].url, "https://doc.rust-lang.org/book/");
        assert_eq!(results[1].snippet, "");
        assert_eq!(results[2].snippet, "Rust package registry & more");
    }

    #[test]
    fn respects_result_limit() {
        assert_eq!(parse_results(PAGE, 2).len(), 2);
        assert!(parse_results("<html>no results</html>", 5).is_empty());
    }

    #[test]
    fn formats_numbered_list() {
        let text = format_results(&parse_results(PAGE, 2));
        assert!(text.starts_with("1. The Rust Programming Language\n   https://www.rust-lang.org/\n"));
        assert!(text.contains("\n\n2. The Book\n   https://doc.rust-lang.org/book/"));
    }

    #[tokio::test]
    async fn empty_query_is_rejected_without_network() {
        let tool = WebSearchTool::new("http://127.0.0.1:9/html/", 5);
        let out = tool
            .execute(json!({"query": "  "}), &ToolContext::default())
            .await
            .unwrap();
        assert!(!out.is_success());
    }
}
