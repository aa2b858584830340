//! Tools offered to the language model: web search (SerpAPI) and news
//! headlines (NewsAPI).
//!
//! Tool failures never fail the reply. The model always gets a
//! `{"results": [...]}` object back, with a short explanation when a key is
//! missing or the upstream call fails.

use serde_json::{Value, json};
use tracing::{debug, warn};

use murmur_core::config::ToolsConfig;

const DEFAULT_SERP_BASE_URL: &str = "https://serpapi.com";
const DEFAULT_NEWS_BASE_URL: &str = "https://newsapi.org";
const MAX_RESULTS: usize = 5;

pub const SEARCH_GOOGLE: &str = "search_google";
pub const GET_NEWS: &str = "get_news";

pub struct ToolBox {
    serp_api_key: Option<String>,
    news_api_key: Option<String>,
    serp_base_url: String,
    news_base_url: String,
    client: reqwest::Client,
}

impl ToolBox {
    pub fn new(serp_api_key: Option<String>, news_api_key: Option<String>) -> Self {
        Self {
            serp_api_key,
            news_api_key,
            serp_base_url: DEFAULT_SERP_BASE_URL.to_string(),
            news_base_url: DEFAULT_NEWS_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Build from config. `None` when tools are disabled.
    pub fn from_config(config: &ToolsConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let mut tools = Self::new(config.resolve_serp_api_key(), config.resolve_news_api_key());
        if let Some(base) = &config.serp_base_url {
            tools.serp_base_url = base.trim_end_matches('/').to_string();
        }
        if let Some(base) = &config.news_base_url {
            tools.news_base_url = base.trim_end_matches('/').to_string();
        }
        Some(tools)
    }

    pub fn with_base_urls(mut self, serp: &str, news: &str) -> Self {
        self.serp_base_url = serp.trim_end_matches('/').to_string();
        self.news_base_url = news.trim_end_matches('/').to_string();
        self
    }

    /// Gemini `tools` entry with one function declaration per tool.
    pub fn declarations(&self) -> Value {
        json!({
            "functionDeclarations": [
                {
                    "name": SEARCH_GOOGLE,
                    "description": "Search the web with Google and return short result snippets.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "query": { "type": "string", "description": "Search query" }
                        },
                        "required": ["query"]
                    }
                },
                {
                    "name": GET_NEWS,
                    "description": "Fetch current news headlines, optionally filtered by topic, country or category.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "query": { "type": "string", "description": "Topic to search for" },
                            "language": { "type": "string", "description": "Two-letter language code (default: en)" },
                            "country": { "type": "string", "description": "Two-letter country code (default: us)" },
                            "category": { "type": "string", "description": "business, entertainment, health, science, sports or technology" }
                        },
                        "required": ["query"]
                    }
                }
            ]
        })
    }

    /// Run one function call from the model.
    pub async fn call(&self, name: &str, args: &Value) -> Value {
        let arg = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or_default();
        debug!(tool = name, %args, "Tool call");
        let results = match name {
            SEARCH_GOOGLE => self.search_google(arg("query")).await,
            GET_NEWS => {
                let language = Some(arg("language")).filter(|s| !s.is_empty()).unwrap_or("en");
                let country = Some(arg("country")).filter(|s| !s.is_empty()).unwrap_or("us");
                let category = Some(arg("category")).filter(|s| !s.is_empty());
                self.get_news(arg("query"), language, country, category).await
            }
            other => {
                warn!(tool = other, "Model called an unknown tool");
                vec![format!("Unknown tool: {other}")]
            }
        };
        json!({ "results": results })
    }

    async fn search_google(&self, query: &str) -> Vec<String> {
        let Some(key) = &self.serp_api_key else {
            warn!("SERP_API_KEY missing, web search unavailable");
            return vec!["Search tool not configured.".into()];
        };
        let request = self
            .client
            .get(format!("{}/search.json", self.serp_base_url))
            .query(&[("q", query), ("api_key", key.as_str()), ("engine", "google")]);

        match fetch_json(request).await {
            Ok(body) => {
                if let Some(error) = body.get("error").and_then(Value::as_str) {
                    warn!(error, "SerpAPI returned an error");
                    return vec![format!("Search error: {error}")];
                }
                non_empty(search_snippets(&body), "No relevant results found.")
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Web search failed");
                vec!["Search failed.".into()]
            }
        }
    }

    async fn get_news(&self, query: &str, language: &str, country: &str, category: Option<&str>) -> Vec<String> {
        let Some(key) = &self.news_api_key else {
            warn!("NEWS_API_KEY missing, news unavailable");
            return vec!["News tool not configured.".into()];
        };

        let mut params = vec![("language", language)];
        if query.is_empty() {
            params.push(("country", country));
        } else {
            params.push(("q", query));
        }
        if let Some(category) = category {
            params.push(("category", category));
        }

        let result = async {
            let headlines = fetch_json(self.news_request("top-headlines", key).query(&params)).await?;
            let mut snippets = news_snippets(&headlines);
            if snippets.is_empty() && !query.is_empty() {
                let everything = self
                    .news_request("everything", key)
                    .query(&[("q", query), ("language", language), ("sortBy", "relevancy"), ("page", "1")]);
                snippets = news_snippets(&fetch_json(everything).await?);
            }
            anyhow::Ok(snippets)
        }
        .await;

        match result {
            Ok(snippets) => non_empty(snippets, "No news found."),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "News fetch failed");
                vec!["News fetch failed.".into()]
            }
        }
    }

    fn news_request(&self, endpoint: &str, key: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}/v2/{endpoint}", self.news_base_url))
            .header("X-Api-Key", key)
            .header("User-Agent", concat!("murmur/", env!("CARGO_PKG_VERSION")))
    }
}

async fn fetch_json(request: reqwest::RequestBuilder) -> anyhow::Result<Value> {
    let resp = request.send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("HTTP {status}: {body}");
    }
    Ok(resp.json().await?)
}

fn non_empty(snippets: Vec<String>, empty: &str) -> Vec<String> {
    if snippets.is_empty() { vec![empty.to_string()] } else { snippets }
}

/// Answer box first, then the top organic results.
pub fn search_snippets(body: &Value) -> Vec<String> {
    let mut snippets = Vec::new();
    if let Some(answer_box) = body.get("answer_box") {
        for key in ["answer", "snippet", "title"] {
            if let Some(text) = answer_box.get(key).and_then(Value::as_str) {
                snippets.push(text.to_string());
            }
        }
    }
    let organic = body.get("organic_results").and_then(Value::as_array);
    for result in organic.into_iter().flatten().take(MAX_RESULTS) {
        let text = ["snippet", "title", "link"]
            .iter()
            .find_map(|key| result.get(*key).and_then(Value::as_str));
        if let Some(text) = text {
            snippets.push(text.to_string());
        }
    }
    snippets
}

/// "<title> - <source>" for the first few articles.
pub fn news_snippets(body: &Value) -> Vec<String> {
    let articles = body.get("articles").and_then(Value::as_array);
    articles
        .into_iter()
        .flatten()
        .take(MAX_RESULTS)
        .filter_map(|article| {
            let title = article.get("title").and_then(Value::as_str)?;
            let source = article
                .pointer("/source/name")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            Some(format!("{title} - {source}"))
        })
        .collect()
}
