//! Fetch URL tool: downloads a page and returns its text, bounded for the model.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{Tool, ToolArgs, ToolError, parse_args, truncate_chars};

/// Maximum characters of page text returned to the model.
pub const MAX_CHARS: usize = 2000;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FetchArgs {
    url: String,
}

/// Tool that retrieves the text of a web page.
///
/// # Arguments (JSON)
///
/// - `url` (string, required): http or https URL to fetch
#[derive(Debug, Clone)]
pub struct FetchUrlTool {
    client: reqwest::Client,
}

impl FetchUrlTool {
    /// Create a fetch tool with a 10 second request timeout.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for FetchUrlTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Retrieve the readable text from a web page for citation."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "URL to fetch"}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<String, ToolError> {
        let FetchArgs { url } = parse_args(args)?;
        let parsed = url::Url::parse(url.trim())
            .map_err(|e| ToolError::InvalidArguments(format!("invalid url '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ToolError::InvalidArguments(
                "url must start with http:// or https://".into(),
            ));
        }

        debug!(%parsed, "fetching url");
        let body = match self.fetch(parsed).await {
            Ok(body) => body,
            Err(e) => return Ok(format!("Failed to fetch {url}: {e}")),
        };
        Ok(truncate_chars(body.trim(), MAX_CHARS))
    }
}

impl FetchUrlTool {
    async fn fetch(&self, url: url::Url) -> Result<String, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}
