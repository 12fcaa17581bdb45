use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use backoff::SystemClock;
use chrono::{DateTime, Utc};
use feed_rs::parser;
use futures::stream::{self, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::classifier::TopicClassifier;
use crate::config::{Config, FeedConfig};
use crate::db::{Database, NewArticle};

/// Title used for entries that arrive without one.
pub const UNTITLED: &str = "Bez virsraksta";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("invalid feed: {0}")]
    Parse(#[from] feed_rs::parser::ParseFeedError),
}

/// One usable feed entry before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub title: String,
    pub summary: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub entries: Vec<RawEntry>,
    /// Entries dropped because they had no link
    pub missing_link: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Fetched {
        entries: usize,
        inserted: usize,
        duplicates: usize,
        missing_link: usize,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    #[serde(flatten)]
    pub outcome: SourceOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub sources: Vec<SourceReport>,
}

impl RefreshSummary {
    pub fn inserted(&self) -> usize {
        self.fetched().map(|(inserted, _)| inserted).sum()
    }

    pub fn duplicates(&self) -> usize {
        self.fetched().map(|(_, duplicates)| duplicates).sum()
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|r| matches!(r.outcome, SourceOutcome::Failed { .. }))
            .map(|r| r.source.as_str())
            .collect()
    }

    fn fetched(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.sources.iter().filter_map(|r| match r.outcome {
            SourceOutcome::Fetched {
                inserted,
                duplicates,
                ..
            } => Some((inserted, duplicates)),
            SourceOutcome::Failed { .. } => None,
        })
    }
}

#[derive(Debug, Clone)]
struct FetchSettings {
    max_retries: u32,
    retry_delay: Duration,
    max_concurrent: usize,
}

/// Holds the refresh flag until dropped.
struct RefreshGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RefreshGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct Fetcher {
    client: Client,
    db: Arc<Database>,
    classifier: TopicClassifier,
    sources: Vec<FeedConfig>,
    settings: FetchSettings,
    refreshing: AtomicBool,
}

impl Fetcher {
    pub fn new(db: Arc<Database>, config: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .user_agent("Zinas/1.0 (RSS Aggregator)")
            .build()?;

        Ok(Self {
            client,
            db,
            classifier: TopicClassifier::new(config.topics.clone()),
            sources: config.feeds.clone(),
            settings: FetchSettings {
                max_retries: config.max_retries,
                retry_delay: Duration::from_millis(config.retry_delay_ms),
                max_concurrent: config.max_concurrent_fetches.max(1),
            },
            refreshing: AtomicBool::new(false),
        })
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Fetch every configured source and store new articles.
    ///
    /// Returns `None` without doing anything when another refresh is already
    /// running. The flag is released even if the returned future is dropped
    /// part way through.
    pub async fn refresh_all_feeds(&self) -> anyhow::Result<Option<RefreshSummary>> {
        let Some(_guard) = RefreshGuard::acquire(&self.refreshing) else {
            info!("Refresh already in progress, skipping");
            return Ok(None);
        };

        self.do_refresh_all().await.map(Some)
    }

    async fn do_refresh_all(&self) -> anyhow::Result<RefreshSummary> {
        info!("Refreshing {} sources", self.sources.len());

        // Fetch concurrently but keep configuration order so the first
        // source to carry a URL is the one that gets stored.
        let fetched: Vec<_> = stream::iter(self.sources.clone())
            .map(|source| async move {
                let result = self.fetch_source(&source).await;
                (source, result)
            })
            .buffered(self.settings.max_concurrent)
            .collect()
            .await;

        let mut summary = RefreshSummary::default();
        for (source, result) in fetched {
            let outcome = match result {
                Ok(parsed) => {
                    let entries = parsed.entries.len();
                    let articles = self.classify_entries(&source.name, parsed.entries);
                    let upsert = self.db.upsert_articles(&articles).await?;
                    info!(
                        "Stored {} new articles for '{}' ({} already present)",
                        upsert.inserted, source.name, upsert.duplicates
                    );
                    SourceOutcome::Fetched {
                        entries,
                        inserted: upsert.inserted,
                        duplicates: upsert.duplicates,
                        missing_link: parsed.missing_link,
                    }
                }
                Err(e) => {
                    error!("Failed to refresh source '{}': {}", source.name, e);
                    SourceOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            summary.sources.push(SourceReport {
                source: source.name.clone(),
                outcome,
            });
        }

        info!(
            "Feed refresh complete: {} inserted, {} failed sources",
            summary.inserted(),
            summary.failed_sources().len()
        );
        Ok(summary)
    }

    pub fn classify_entries(&self, source: &str, entries: Vec<RawEntry>) -> Vec<NewArticle> {
        entries
            .into_iter()
            .map(|entry| NewArticle {
                topic: self.classifier.classify(&entry.title, &entry.summary).to_string(),
                title: entry.title,
                summary: entry.summary,
                source: source.to_string(),
                published_at: entry.published_at,
                url: entry.url,
                location: entry.location,
            })
            .collect()
    }

    /// Fetch and parse one source, retrying transport and status failures
    /// with exponential backoff.
    pub async fn fetch_source(&self, source: &FeedConfig) -> Result<ParsedFeed, FetchError> {
        info!("Fetching feed: {} ({})", source.name, source.url);

        let mut backoff: ExponentialBackoff<SystemClock> = ExponentialBackoff {
            current_interval: self.settings.retry_delay,
            initial_interval: self.settings.retry_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.settings.retry_delay * 16,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            match self.fetch_bytes(&source.url).await {
                Ok(bytes) => return Self::parse_entries(&bytes),
                Err(e) if attempt < self.settings.max_retries => {
                    attempt += 1;
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(self.settings.retry_delay);
                    warn!(
                        "Attempt {} for '{}' failed: {}; retrying in {:?}",
                        attempt, source.name, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Turn a feed document into entries. Entries without a link are
    /// dropped; a missing publish time becomes the current time.
    pub fn parse_entries(bytes: &[u8]) -> Result<ParsedFeed, FetchError> {
        // feed_rs doesn't expose <dc:coverage>, so read it from the raw XML
        let locations = Self::extract_locations_from_xml(bytes);

        let parsed = parser::parse(bytes)?;
        let now = Utc::now();

        let mut feed = ParsedFeed::default();
        for entry in parsed.entries {
            let title = entry
                .title
                .as_ref()
                .map(|t| t.content.trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| UNTITLED.to_string());

            let url = entry
                .links
                .first()
                .map(|l| l.href.trim().to_string())
                .unwrap_or_default();

            if url.is_empty() {
                warn!("Skipping entry with no link: {}", title);
                feed.missing_link += 1;
                continue;
            }

            let summary = entry.summary.map(|s| s.content).unwrap_or_default();
            let published_at = entry.published.or(entry.updated).unwrap_or(now);
            let location = locations.get(&url).cloned();

            feed.entries.push(RawEntry {
                title,
                summary,
                url,
                published_at,
                location,
            });
        }

        Ok(feed)
    }

    /// Map item link to its `<dc:coverage>` (or `<location>`) text.
    pub fn extract_locations_from_xml(xml_bytes: &[u8]) -> HashMap<String, String> {
        let mut locations = HashMap::new();
        let xml_str = match std::str::from_utf8(xml_bytes) {
            Ok(s) => s,
            Err(_) => return locations,
        };

        for item_block in xml_str.split("<item").skip(1) {
            // Only `<item>` and `<item attr=...>`, not `<itemFoo>`
            if !item_block.starts_with(|c: char| c == '>' || c.is_whitespace()) {
                continue;
            }
            let Some(open_end) = item_block.find('>') else {
                continue;
            };
            let body = &item_block[open_end + 1..];
            let item_end = body.find("</item>").unwrap_or(body.len());
            let item = &body[..item_end];

            let link = Self::extract_xml_element(item, "link");
            let location = Self::extract_xml_element(item, "dc:coverage")
                .or_else(|| Self::extract_xml_element(item, "location"))
                .filter(|l| !l.is_empty());

            if let (Some(link), Some(location)) = (link, location) {
                locations.insert(link, location);
            }
        }

        locations
    }

    pub fn extract_xml_element(xml: &str, tag: &str) -> Option<String> {
        let start_tag = format!("<{}>", tag);
        let end_tag = format!("</{}>", tag);

        let start = xml.find(&start_tag)? + start_tag.len();
        let end = xml[start..].find(&end_tag)? + start;

        let text = xml[start..end].trim();
        let text = text
            .strip_prefix("<![CDATA[")
            .and_then(|t| t.strip_suffix("]]>"))
            .map(str::trim)
            .unwrap_or(text);

        Some(unescape_xml(text))
    }
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

pub async fn start_background_refresh(fetcher: Arc<Fetcher>, interval_minutes: u64) {
    let interval = Duration::from_secs(interval_minutes * 60);

    loop {
        tokio::time::sleep(interval).await;
        info!("Starting scheduled feed refresh");
        if let Err(e) = fetcher.refresh_all_feeds().await {
            error!("Scheduled feed refresh failed: {}", e);
        }
    }
}
