//! Web search with page content extraction.
//!
//! [`SerperSearch`] asks a Serper-compatible API for organic results, fetches
//! the top pages in parallel, pulls their readable paragraph text with
//! `scraper`, and formats everything into one text block for the model.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::future::join_all;
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::SearchError;

pub const SERPER_URL: &str = "https://google.serper.dev/search";

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

/// Extracted text shorter than this is treated as no content.
const MIN_CONTENT_CHARS: usize = 100;

/// Boxed future returned by [`SearchService::search`].
pub type SearchFuture<'a> = Pin<Box<dyn Future<Output = Result<String, SearchError>> + Send + 'a>>;

/// A web search provider. Returns the normalized text block handed to the
/// model as tool content.
pub trait SearchService: Send + Sync {
    fn search<'a>(&'a self, query: &'a str) -> SearchFuture<'a>;
}

// ── Configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Organic results kept from the search response.
    pub max_results: usize,
    /// How many of those results get their page fetched.
    pub max_pages: usize,
    /// Characters of extracted content kept per page.
    pub max_content_chars: usize,
    /// Bytes of page HTML read before extraction; the rest is discarded.
    pub max_page_bytes: usize,
    pub fetch_timeout: Duration,
    pub search_timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: SERPER_URL.to_string(),
            api_key: None,
            max_results: 5,
            max_pages: 3,
            max_content_chars: 2000,
            max_page_bytes: 1024 * 1024,
            fetch_timeout: Duration::from_secs(10),
            search_timeout: Duration::from_secs(15),
        }
    }
}

// ── Provider response ──────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerperResponse {
    #[serde(default)]
    pub organic: Vec<OrganicResult>,
    pub answer_box: Option<AnswerBox>,
    pub knowledge_graph: Option<KnowledgeGraph>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrganicResult {
    pub title: Option<String>,
    pub link: Option<String>,
    pub snippet: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnswerBox {
    pub answer: Option<String>,
    pub snippet: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct KnowledgeGraph {
    pub title: Option<String>,
    pub description: Option<String>,
}

// ── Serper client ──────────────────────────────────────────────────

pub struct SerperSearch {
    api: reqwest::Client,
    pages: reqwest::Client,
    config: SearchConfig,
}

impl SerperSearch {
    pub fn new(config: SearchConfig) -> Result<Self, SearchError> {
        let api = reqwest::Client::builder()
            .timeout(config.search_timeout)
            .build()?;
        let pages = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(config.fetch_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { api, pages, config })
    }

    async fn query(&self, query: &str) -> Result<SerperResponse, SearchError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(SearchError::MissingApiKey)?;

        let resp = self
            .api
            .post(&self.config.endpoint)
            .header("X-API-KEY", api_key)
            .json(&serde_json::json!({ "q": query }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SearchError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }

    /// Fetch one page and extract its readable text. Any failure is `None`.
    async fn fetch_page(&self, url: &str) -> Option<String> {
        let mut resp = match self.pages.get(url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!("Failed to fetch {url}: HTTP {}", resp.status());
                return None;
            }
            Err(e) => {
                debug!("Failed to fetch {url}: {e}");
                return None;
            }
        };
        let mut body = Vec::new();
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    if !push_capped(&mut body, &chunk, self.config.max_page_bytes) {
                        debug!("Truncated {url} at {} bytes", body.len());
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Failed to read {url}: {e}");
                    return None;
                }
            }
        }
        extract_text(&String::from_utf8_lossy(&body), self.config.max_content_chars)
    }

    async fn run(&self, query: &str) -> Result<String, SearchError> {
        let mut response = self.query(query).await?;
        response.organic.truncate(self.config.max_results);
        if response.organic.is_empty() {
            return Ok(format!("No search results found for: {query}"));
        }

        let urls: Vec<&str> = response
            .organic
            .iter()
            .take(self.config.max_pages)
            .filter_map(|r| r.link.as_deref().filter(|l| !l.is_empty()))
            .collect();
        info!("Fetching content from {} pages...", urls.len());
        let pages = join_all(urls.iter().map(|url| self.fetch_page(url))).await;

        let text = format_results(query, &response, &pages);
        info!("Total search context length: {} chars", text.len());
        Ok(text)
    }
}

impl SearchService for SerperSearch {
    fn search<'a>(&'a self, query: &'a str) -> SearchFuture<'a> {
        Box::pin(self.run(query))
    }
}

/// Append `chunk` to `body` without letting it grow past `limit` bytes.
/// Returns `false` once the limit is reached.
fn push_capped(body: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    let room = limit.saturating_sub(body.len());
    if chunk.len() >= room {
        body.extend_from_slice(&chunk[..room]);
        return false;
    }
    body.extend_from_slice(chunk);
    true
}

// ── Formatting and extraction ──────────────────────────────────────

/// Normalize a search response and fetched page contents into one text
/// block. `pages[i]` is the content for `response.organic[i]`; results past
/// the end of `pages` were not fetched.
pub fn format_results(query: &str, response: &SerperResponse, pages: &[Option<String>]) -> String {
    let mut lines = vec![format!("Web search results for: {query}\n")];

    if let Some(answer) = response
        .answer_box
        .as_ref()
        .and_then(|ab| ab.answer.as_deref().or(ab.snippet.as_deref()))
        .filter(|a| !a.is_empty())
    {
        lines.push(format!("DIRECT ANSWER: {answer}\n"));
    }

    if let Some(kg) = &response.knowledge_graph
        && let Some(description) = kg.description.as_deref().filter(|d| !d.is_empty())
    {
        lines.push(format!(
            "KNOWLEDGE GRAPH: {} - {description}\n",
            kg.title.as_deref().unwrap_or_default()
        ));
    }

    for (i, result) in response.organic.iter().enumerate() {
        lines.push(format!(
            "--- Source {}: {} ---",
            i + 1,
            result.title.as_deref().unwrap_or("No title")
        ));
        lines.push(format!("URL: {}", result.link.as_deref().unwrap_or_default()));
        lines.push(format!(
            "Snippet: {}",
            result.snippet.as_deref().unwrap_or("No snippet")
        ));
        if let Some(page) = pages.get(i) {
            match page {
                Some(content) => lines.push(format!("Full content:\n{content}")),
                None => lines.push("(Could not extract page content)".to_string()),
            }
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

/// Readable text of an HTML page: paragraph text of the main content
/// container, whitespace collapsed. `None` when too little text remains.
pub fn extract_text(html: &str, max_chars: usize) -> Option<String> {
    let document = Html::parse_document(html);
    let paragraph = Selector::parse("p").ok()?;

    let root = ["article", "main", "body"].iter().find_map(|name| {
        let selector = Selector::parse(name).ok()?;
        document.select(&selector).next()
    })?;

    let mut paragraphs: Vec<String> = root
        .select(&paragraph)
        .map(|p| collapse_whitespace(&p.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .collect();
    if paragraphs.is_empty() {
        paragraphs.push(collapse_whitespace(&root.text().collect::<String>()));
    }

    let text = paragraphs.join("\n\n");
    if text.chars().count() <= MIN_CONTENT_CHARS {
        return None;
    }
    Some(text.chars().take(max_chars).collect())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
