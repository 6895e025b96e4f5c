//! Web search tool backed by the Tavily search API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{Tool, ToolArgs, ToolError, parse_args};

const DEFAULT_ENDPOINT: &str = "https://api.tavily.com/search";
const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);

fn default_recency_days() -> u32 {
    30
}

fn default_max_results() -> u32 {
    5
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchArgs {
    query: String,
    #[serde(default = "default_recency_days")]
    recency_days: u32,
    #[serde(default = "default_max_results")]
    max_results: u32,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

/// Tool that searches the web for recent information.
///
/// Unconfigured (no API key) it answers with an explanatory string instead of
/// failing, so the model can tell the user.
#[derive(Debug, Clone)]
pub struct WebSearchTool {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl WebSearchTool {
    /// Search tool using `TAVILY_API_KEY` from the environment.
    pub fn from_env() -> Self {
        let key = std::env::var("TAVILY_API_KEY").ok().filter(|k| !k.trim().is_empty());
        Self::new(DEFAULT_ENDPOINT, key)
    }

    /// Search tool against a specific endpoint.
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for up-to-date information."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "recency_days": {
                    "type": "integer",
                    "description": "Limit results to the last N days",
                    "default": 30
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of search results to return",
                    "default": 5
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<String, ToolError> {
        let args: SearchArgs = parse_args(args)?;
        let Some(key) = &self.api_key else {
            return Ok("Web search is not configured; set TAVILY_API_KEY.".to_owned());
        };

        debug!(query = %args.query, max_results = args.max_results, "web search");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(key)
            .json(&json!({
                "query": args.query,
                "max_results": args.max_results,
                "days": args.recency_days,
            }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ToolError::Failed(format!("search failed: {e}")))?;
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| ToolError::Failed(format!("invalid search response: {e}")))?;

        if body.results.is_empty() {
            return Ok("No results found.".to_owned());
        }
        let lines: Vec<String> = body
            .results
            .into_iter()
            .map(|hit| {
                let title = hit.title.as_deref().unwrap_or("result");
                format!("{title}: {}\n{}", hit.url, hit.content)
            })
            .collect();
        Ok(lines.join("\n\n"))
    }
}
