use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, QueryBuilder, Sqlite, SqlitePool};

use crate::preferences::{Identity, SaveTag};

/// Number of entries shown in the search history view.
pub const HISTORY_LIMIT: i64 = 20;
/// Number of entries shown in the recently viewed list.
pub const RECENTLY_VIEWED_LIMIT: i64 = 30;

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub summary: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub url: String,
    pub topic: String,
    pub location: Option<String>,
}

/// An article ready for insertion, already classified.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub title: String,
    pub summary: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub url: String,
    pub topic: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ViewedArticle {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub article: Article,
    pub viewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SearchEntry {
    pub query: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: i64,
    pub query: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Optional constraints for [`Database::query_articles`], combined with AND.
#[derive(Debug, Clone, Default)]
pub struct ArticleFilter {
    /// Substring of title, summary or topic. Case folding is ASCII only
    /// (SQLite `LIKE`), so `Ā` and `ā` are distinct.
    pub text: Option<String>,
    /// Inclusive lower bound on the published timestamp
    pub since: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub ignored_sources: Vec<String>,
    pub ignored_articles: Vec<i64>,
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Every connection to an in-memory database sees its own empty database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT UNIQUE NOT NULL,
                display_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                summary TEXT NOT NULL DEFAULT '',
                source TEXT NOT NULL,
                published_at TEXT NOT NULL,
                url TEXT UNIQUE NOT NULL,
                topic TEXT NOT NULL,
                location TEXT
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_articles_published
            ON articles(published_at DESC)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS saved_articles (
                user_id INTEGER NOT NULL,
                article_id INTEGER NOT NULL,
                tag TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_id, article_id, tag)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ignored_sources (
                user_id INTEGER NOT NULL,
                source TEXT NOT NULL,
                PRIMARY KEY (user_id, source)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ignored_articles (
                user_id INTEGER NOT NULL,
                article_id INTEGER NOT NULL,
                PRIMARY KEY (user_id, article_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS viewed_articles (
                user_id INTEGER NOT NULL,
                article_id INTEGER NOT NULL,
                viewed_at TEXT NOT NULL,
                PRIMARY KEY (user_id, article_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS search_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                query TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS saved_searches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                query TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Look up the user by email, creating the row on first sight.
    pub async fn get_or_create_user(&self, identity: &Identity) -> anyhow::Result<i64> {
        let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE email = ?")
            .bind(identity.email())
            .fetch_optional(&self.pool)
            .await?;

        if let Some((id,)) = existing {
            sqlx::query("UPDATE users SET display_name = ? WHERE id = ?")
                .bind(identity.display_name())
                .bind(id)
                .execute(&self.pool)
                .await?;
            return Ok(id);
        }

        // A concurrent first request may have created the row in the meantime
        sqlx::query(
            r#"
            INSERT INTO users (email, display_name, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(email) DO UPDATE SET display_name = excluded.display_name
            "#,
        )
        .bind(identity.email())
        .bind(identity.display_name())
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM users WHERE email = ?")
            .bind(identity.email())
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn insert_article(&self, article: &NewArticle) -> anyhow::Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO articles (title, summary, source, published_at, url, topic, location)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&article.title)
        .bind(&article.summary)
        .bind(&article.source)
        .bind(format_timestamp(article.published_at))
        .bind(&article.url)
        .bind(&article.topic)
        .bind(&article.location)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(InsertOutcome::Inserted(done.last_insert_rowid())),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Insert each article unless its URL is already stored. Existing rows
    /// are never refreshed.
    pub async fn upsert_articles(&self, articles: &[NewArticle]) -> anyhow::Result<UpsertSummary> {
        let mut summary = UpsertSummary::default();
        for article in articles {
            match self.insert_article(article).await? {
                InsertOutcome::Inserted(_) => summary.inserted += 1,
                InsertOutcome::Duplicate => summary.duplicates += 1,
            }
        }
        Ok(summary)
    }

    pub async fn query_articles(&self, filter: &ArticleFilter) -> anyhow::Result<Vec<Article>> {
        let mut query = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT id, title, summary, source, published_at, url, topic, location
            FROM articles
            WHERE 1 = 1
            "#,
        );

        if let Some(text) = filter.text.as_deref().filter(|t| !t.is_empty()) {
            let pattern = format!("%{}%", escape_like(text));
            query
                .push(" AND (title LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR summary LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR topic LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }

        if let Some(since) = filter.since {
            query
                .push(" AND published_at >= ")
                .push_bind(format_timestamp(since));
        }

        if let Some(source) = filter.source.as_deref() {
            query.push(" AND source = ").push_bind(source.to_string());
        }

        if !filter.ignored_sources.is_empty() {
            query.push(" AND source NOT IN (");
            let mut separated = query.separated(", ");
            for source in &filter.ignored_sources {
                separated.push_bind(source.clone());
            }
            separated.push_unseparated(")");
        }

        if !filter.ignored_articles.is_empty() {
            query.push(" AND id NOT IN (");
            let mut separated = query.separated(", ");
            for id in &filter.ignored_articles {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
        }

        query.push(" ORDER BY published_at DESC, id DESC");

        let articles = query
            .build_query_as::<Article>()
            .fetch_all(&self.pool)
            .await?;
        Ok(articles)
    }

    pub async fn get_article(&self, article_id: i64) -> anyhow::Result<Option<Article>> {
        let article = sqlx::query_as::<_, Article>(
            r#"
            SELECT id, title, summary, source, published_at, url, topic, location
            FROM articles
            WHERE id = ?
            "#,
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(article)
    }

    pub async fn count_articles(&self) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    pub async fn list_sources(&self) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT source FROM articles ORDER BY source")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(source,)| source).collect())
    }

    /// Articles the user saved under `tag`, most recently saved first.
    pub async fn saved_articles(&self, user_id: i64, tag: SaveTag) -> anyhow::Result<Vec<Article>> {
        let articles = sqlx::query_as::<_, Article>(
            r#"
            SELECT a.id, a.title, a.summary, a.source, a.published_at, a.url, a.topic, a.location
            FROM articles a
            JOIN saved_articles s ON s.article_id = a.id
            WHERE s.user_id = ? AND s.tag = ?
            ORDER BY s.created_at DESC, s.rowid DESC
            "#,
        )
        .bind(user_id)
        .bind(tag.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(articles)
    }

    pub async fn recently_viewed(&self, user_id: i64, limit: i64) -> anyhow::Result<Vec<ViewedArticle>> {
        let rows = sqlx::query_as::<_, ViewedArticle>(
            r#"
            SELECT a.id, a.title, a.summary, a.source, a.published_at, a.url, a.topic, a.location,
                   v.viewed_at
            FROM viewed_articles v
            JOIN articles a ON a.id = v.article_id
            WHERE v.user_id = ?
            ORDER BY v.viewed_at DESC, a.id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Append `query` to the user's search history. Empty queries are not recorded.
    pub async fn record_search(&self, user_id: i64, query: &str) -> anyhow::Result<bool> {
        if query.is_empty() {
            return Ok(false);
        }
        sqlx::query("INSERT INTO search_history (user_id, query, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(query)
            .bind(format_timestamp(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    pub async fn search_history(&self, user_id: i64, limit: i64) -> anyhow::Result<Vec<SearchEntry>> {
        let rows = sqlx::query_as::<_, SearchEntry>(
            r#"
            SELECT query, created_at
            FROM search_history
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn save_search(&self, user_id: i64, query: &str) -> anyhow::Result<Option<i64>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(None);
        }
        let done = sqlx::query("INSERT INTO saved_searches (user_id, query, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(query)
            .bind(format_timestamp(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(Some(done.last_insert_rowid()))
    }

    pub async fn saved_searches(&self, user_id: i64) -> anyhow::Result<Vec<SavedSearch>> {
        let rows = sqlx::query_as::<_, SavedSearch>(
            r#"
            SELECT id, query, created_at
            FROM saved_searches
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Remove a saved search owned by the user. Returns whether a row was removed.
    pub async fn remove_saved_search(&self, user_id: i64, search_id: i64) -> anyhow::Result<bool> {
        let affected = sqlx::query("DELETE FROM saved_searches WHERE id = ? AND user_id = ?")
            .bind(search_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }
}
