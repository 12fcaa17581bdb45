//! The list-view pipeline: search logging, preference exclusions, repository
//! filtering and the optional topic-coverage ordering.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::FALLBACK_TOPIC;
use crate::db::{Article, ArticleFilter, Database};
use crate::preferences::SaveTag;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Recency,
    TopicCoverage,
}

impl SortOrder {
    /// `coverage` selects topic coverage; anything else is recency.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("coverage") => SortOrder::TopicCoverage,
            _ => SortOrder::Recency,
        }
    }
}

/// Raw list parameters as they arrive in the query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListParams {
    pub q: Option<String>,
    pub days: Option<String>,
    pub source: Option<String>,
    pub sort: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListRequest {
    pub query: String,
    pub days: Option<u32>,
    pub source: Option<String>,
    pub sort: SortOrder,
}

impl From<ListParams> for ListRequest {
    fn from(params: ListParams) -> Self {
        Self {
            query: params.q.map(|q| q.trim().to_string()).unwrap_or_default(),
            days: parse_days(params.days.as_deref()),
            source: params
                .source
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            sort: SortOrder::parse(params.sort.as_deref()),
        }
    }
}

/// Positive whole day counts only; anything else means no recency filter.
pub fn parse_days(raw: Option<&str>) -> Option<u32> {
    raw?.trim().parse::<u32>().ok().filter(|days| *days > 0)
}

/// Oldest publish time still inside a `days` window ending at `now`.
/// A window reaching past the representable range means no bound.
pub fn recency_bound(now: DateTime<Utc>, days: Option<u32>) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(Duration::days(i64::from(days?)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleListing {
    pub articles: Vec<Article>,
    pub sources: Vec<String>,
    pub saved_later: BTreeSet<i64>,
    pub saved_important: BTreeSet<i64>,
    pub viewed: BTreeSet<i64>,
    pub topic_counts: BTreeMap<String, usize>,
    pub query: String,
    pub sort: SortOrder,
}

fn topic_of(article: &Article) -> &str {
    if article.topic.is_empty() {
        FALLBACK_TOPIC
    } else {
        &article.topic
    }
}

pub fn build_topic_counts(articles: &[Article]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for article in articles {
        *counts.entry(topic_of(article).to_string()).or_insert(0) += 1;
    }
    counts
}

/// Reorder so articles whose topic is most common within `articles` come
/// first. The sort is stable, so recency order survives within a count.
pub fn sort_by_topic_coverage(mut articles: Vec<Article>) -> Vec<Article> {
    let counts: HashMap<String, usize> = build_topic_counts(&articles).into_iter().collect();
    articles.sort_by_key(|article| {
        std::cmp::Reverse(counts.get(topic_of(article)).copied().unwrap_or(0))
    });
    articles
}

async fn exclusion_filter(db: &Database, user_id: i64) -> anyhow::Result<ArticleFilter> {
    Ok(ArticleFilter {
        ignored_sources: db.ignored_sources(user_id).await?,
        ignored_articles: db.ignored_articles(user_id).await?,
        ..Default::default()
    })
}

/// Run one list request for `user_id`. `now` anchors the recency window.
pub async fn list_articles(
    db: &Database,
    user_id: i64,
    request: &ListRequest,
    now: DateTime<Utc>,
) -> anyhow::Result<ArticleListing> {
    db.record_search(user_id, &request.query).await?;

    let filter = ArticleFilter {
        text: Some(request.query.clone()).filter(|q| !q.is_empty()),
        since: recency_bound(now, request.days),
        source: request.source.clone(),
        ..exclusion_filter(db, user_id).await?
    };

    let mut articles = db.query_articles(&filter).await?;
    if request.sort == SortOrder::TopicCoverage {
        articles = sort_by_topic_coverage(articles);
    }

    let preferences = db.preference_snapshot(user_id).await?;

    Ok(ArticleListing {
        topic_counts: build_topic_counts(&articles),
        sources: db.list_sources().await?,
        saved_later: preferences.saved_with(SaveTag::Later),
        saved_important: preferences.saved_with(SaveTag::Important),
        viewed: preferences.viewed_ids(),
        query: request.query.clone(),
        sort: request.sort,
        articles,
    })
}

/// Articles matching `topic` grouped by source, honouring the user's
/// ignore lists. Not recorded in search history.
pub async fn compare_sources(
    db: &Database,
    user_id: i64,
    topic: &str,
) -> anyhow::Result<BTreeMap<String, Vec<Article>>> {
    let filter = ArticleFilter {
        text: Some(topic.trim().to_string()).filter(|t| !t.is_empty()),
        ..exclusion_filter(db, user_id).await?
    };

    let mut grouped: BTreeMap<String, Vec<Article>> = BTreeMap::new();
    for article in db.query_articles(&filter).await? {
        grouped.entry(article.source.clone()).or_default().push(article);
    }
    Ok(grouped)
}
