//! Per-user ignore, save and view state layered over the shared article store.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::db::{format_timestamp, Database};

/// The caller on whose behalf an operation runs.
///
/// Built by the HTTP layer from request headers and passed down explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    email: String,
    display_name: String,
}

impl Identity {
    /// Returns `None` when the email is blank. A missing display name
    /// falls back to the email.
    pub fn new(email: &str, display_name: Option<&str>) -> Option<Self> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return None;
        }
        let display_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| email.clone());
        Some(Self {
            email,
            display_name,
        })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveTag {
    Later,
    Important,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown tag: {0}")]
pub struct UnknownTag(String);

impl SaveTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveTag::Later => "later",
            SaveTag::Important => "important",
        }
    }
}

impl FromStr for SaveTag {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "later" => Ok(SaveTag::Later),
            "important" => Ok(SaveTag::Important),
            other => Err(UnknownTag(other.to_string())),
        }
    }
}

impl fmt::Display for SaveTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreferenceAction {
    ViewArticle { article_id: i64 },
    Save { article_id: i64, tag: SaveTag },
    Unsave { article_id: i64, tag: SaveTag },
    IgnoreArticle { article_id: i64 },
    UnignoreArticle { article_id: i64 },
    IgnoreSource { source: String },
    UnignoreSource { source: String },
}

impl PreferenceAction {
    /// Name recorded in the activity log.
    pub fn name(&self) -> &'static str {
        match self {
            PreferenceAction::ViewArticle { .. } => "view_article",
            PreferenceAction::Save { tag: SaveTag::Later, .. } => "save_later",
            PreferenceAction::Save { tag: SaveTag::Important, .. } => "save_important",
            PreferenceAction::Unsave { tag: SaveTag::Later, .. } => "unsave_later",
            PreferenceAction::Unsave { tag: SaveTag::Important, .. } => "unsave_important",
            PreferenceAction::IgnoreArticle { .. } => "ignore_article",
            PreferenceAction::UnignoreArticle { .. } => "unignore_article",
            PreferenceAction::IgnoreSource { .. } => "ignore_source",
            PreferenceAction::UnignoreSource { .. } => "unignore_source",
        }
    }

    fn payload(&self) -> serde_json::Value {
        match self {
            PreferenceAction::ViewArticle { article_id }
            | PreferenceAction::Save { article_id, .. }
            | PreferenceAction::Unsave { article_id, .. }
            | PreferenceAction::IgnoreArticle { article_id }
            | PreferenceAction::UnignoreArticle { article_id } => json!(article_id),
            PreferenceAction::IgnoreSource { source }
            | PreferenceAction::UnignoreSource { source } => json!(source),
        }
    }
}

/// Everything the overlay knows about one user at the time of reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferenceSnapshot {
    pub ignored_sources: BTreeSet<String>,
    pub ignored_articles: BTreeSet<i64>,
    pub saved: BTreeMap<i64, BTreeSet<SaveTag>>,
    pub viewed: BTreeMap<i64, DateTime<Utc>>,
}

impl PreferenceSnapshot {
    pub fn saved_with(&self, tag: SaveTag) -> BTreeSet<i64> {
        self.saved
            .iter()
            .filter(|(_, tags)| tags.contains(&tag))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn viewed_ids(&self) -> BTreeSet<i64> {
        self.viewed.keys().copied().collect()
    }
}

impl Database {
    /// Apply one preference change and append it to the activity log in the
    /// same transaction.
    pub async fn apply_preference(&self, user_id: i64, action: &PreferenceAction) -> anyhow::Result<()> {
        let now = format_timestamp(Utc::now());
        let mut tx = self.pool().begin().await?;

        match action {
            PreferenceAction::ViewArticle { article_id } => {
                sqlx::query(
                    r#"
                    INSERT INTO viewed_articles (user_id, article_id, viewed_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(user_id, article_id) DO UPDATE SET viewed_at = excluded.viewed_at
                    "#,
                )
                .bind(user_id)
                .bind(article_id)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            }
            PreferenceAction::Save { article_id, tag } => {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO saved_articles (user_id, article_id, tag, created_at)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(user_id)
                .bind(article_id)
                .bind(tag.as_str())
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            }
            PreferenceAction::Unsave { article_id, tag } => {
                sqlx::query(
                    "DELETE FROM saved_articles WHERE user_id = ? AND article_id = ? AND tag = ?",
                )
                .bind(user_id)
                .bind(article_id)
                .bind(tag.as_str())
                .execute(&mut *tx)
                .await?;
            }
            PreferenceAction::IgnoreArticle { article_id } => {
                sqlx::query("INSERT OR IGNORE INTO ignored_articles (user_id, article_id) VALUES (?, ?)")
                    .bind(user_id)
                    .bind(article_id)
                    .execute(&mut *tx)
                    .await?;
            }
            PreferenceAction::UnignoreArticle { article_id } => {
                sqlx::query("DELETE FROM ignored_articles WHERE user_id = ? AND article_id = ?")
                    .bind(user_id)
                    .bind(article_id)
                    .execute(&mut *tx)
                    .await?;
            }
            PreferenceAction::IgnoreSource { source } => {
                sqlx::query("INSERT OR IGNORE INTO ignored_sources (user_id, source) VALUES (?, ?)")
                    .bind(user_id)
                    .bind(source)
                    .execute(&mut *tx)
                    .await?;
            }
            PreferenceAction::UnignoreSource { source } => {
                sqlx::query("DELETE FROM ignored_sources WHERE user_id = ? AND source = ?")
                    .bind(user_id)
                    .bind(source)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            "INSERT INTO activity_log (user_id, action, payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(action.name())
        .bind(action.payload().to_string())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Applied {} for user {}", action.name(), user_id);
        Ok(())
    }

    pub async fn ignored_sources(&self, user_id: i64) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT source FROM ignored_sources WHERE user_id = ? ORDER BY source")
                .bind(user_id)
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|(source,)| source).collect())
    }

    pub async fn ignored_articles(&self, user_id: i64) -> anyhow::Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT article_id FROM ignored_articles WHERE user_id = ? ORDER BY article_id",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn preference_snapshot(&self, user_id: i64) -> anyhow::Result<PreferenceSnapshot> {
        let mut snapshot = PreferenceSnapshot {
            ignored_sources: self.ignored_sources(user_id).await?.into_iter().collect(),
            ignored_articles: self.ignored_articles(user_id).await?.into_iter().collect(),
            ..Default::default()
        };

        let saved: Vec<(i64, String)> =
            sqlx::query_as("SELECT article_id, tag FROM saved_articles WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(self.pool())
                .await?;
        for (article_id, tag) in saved {
            // Rows written with a tag this build no longer knows are skipped
            if let Ok(tag) = tag.parse::<SaveTag>() {
                snapshot.saved.entry(article_id).or_default().insert(tag);
            }
        }

        let viewed: Vec<(i64, DateTime<Utc>)> =
            sqlx::query_as("SELECT article_id, viewed_at FROM viewed_articles WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(self.pool())
                .await?;
        snapshot.viewed = viewed.into_iter().collect();

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{create_test_db, insert, new_article};

    async fn activity(db: &Database, user_id: i64) -> Vec<(String, String)> {
        sqlx::query_as("SELECT action, payload FROM activity_log WHERE user_id = ? ORDER BY id")
            .bind(user_id)
            .fetch_all(db.pool())
            .await
            .unwrap()
    }

    mod identity_tests {
        use super::*;

        #[test]
        fn test_email_is_normalized() {
            let identity = Identity::new("  Anna@Example.COM ", Some(" Anna ")).unwrap();
            assert_eq!(identity.email(), "anna@example.com");
            assert_eq!(identity.display_name(), "Anna");
        }

        #[test]
        fn test_blank_email_is_rejected() {
            assert!(Identity::new("   ", Some("Anna")).is_none());
        }

        #[test]
        fn test_display_name_defaults_to_email() {
            let identity = Identity::new("anna@example.com", Some("  ")).unwrap();
            assert_eq!(identity.display_name(), "anna@example.com");
        }
    }

    mod tag_tests {
        use super::*;

        #[test]
        fn test_parse_tags() {
            assert_eq!("later".parse::<SaveTag>().unwrap(), SaveTag::Later);
            assert_eq!(" important ".parse::<SaveTag>().unwrap(), SaveTag::Important);
            assert!("favourite".parse::<SaveTag>().is_err());
            assert!("LATER".parse::<SaveTag>().is_err());
        }

        #[test]
        fn test_action_names() {
            let save = PreferenceAction::Save { article_id: 1, tag: SaveTag::Important };
            let unsave = PreferenceAction::Unsave { article_id: 1, tag: SaveTag::Later };
            assert_eq!(save.name(), "save_important");
            assert_eq!(unsave.name(), "unsave_later");
            assert_eq!(
                PreferenceAction::IgnoreSource { source: "CNN".to_string() }.payload(),
                json!("CNN")
            );
        }
    }

    mod save_tests {
        use super::*;

        #[tokio::test]
        async fn test_save_twice_keeps_one_entry() {
            let db = create_test_db().await;
            let action = PreferenceAction::Save { article_id: 5, tag: SaveTag::Later };

            db.apply_preference(1, &action).await.unwrap();
            db.apply_preference(1, &action).await.unwrap();

            let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM saved_articles")
                .fetch_one(db.pool())
                .await
                .unwrap();
            assert_eq!(count, 1);

            let snapshot = db.preference_snapshot(1).await.unwrap();
            assert_eq!(snapshot.saved_with(SaveTag::Later), BTreeSet::from([5]));
        }

        #[tokio::test]
        async fn test_save_then_unsave_leaves_nothing() {
            let db = create_test_db().await;
            db.apply_preference(1, &PreferenceAction::Save { article_id: 5, tag: SaveTag::Later })
                .await
                .unwrap();
            db.apply_preference(1, &PreferenceAction::Unsave { article_id: 5, tag: SaveTag::Later })
                .await
                .unwrap();

            let snapshot = db.preference_snapshot(1).await.unwrap();
            assert!(snapshot.saved.is_empty());
        }

        #[tokio::test]
        async fn test_unsave_removes_only_that_tag() {
            let db = create_test_db().await;
            db.apply_preference(1, &PreferenceAction::Save { article_id: 5, tag: SaveTag::Later })
                .await
                .unwrap();
            db.apply_preference(1, &PreferenceAction::Save { article_id: 5, tag: SaveTag::Important })
                .await
                .unwrap();
            db.apply_preference(1, &PreferenceAction::Unsave { article_id: 5, tag: SaveTag::Later })
                .await
                .unwrap();

            let snapshot = db.preference_snapshot(1).await.unwrap();
            assert_eq!(snapshot.saved[&5], BTreeSet::from([SaveTag::Important]));
            assert!(snapshot.saved_with(SaveTag::Later).is_empty());
        }

        #[tokio::test]
        async fn test_unsave_missing_is_noop() {
            let db = create_test_db().await;
            let result = db
                .apply_preference(1, &PreferenceAction::Unsave { article_id: 42, tag: SaveTag::Important })
                .await;
            assert!(result.is_ok());
        }

        #[tokio::test]
        async fn test_saved_articles_listing() {
            let db = create_test_db().await;
            let now = Utc::now();
            let first = insert(&db, new_article("https://a/1", "First", "BBC", "Cits", now)).await;
            let second = insert(&db, new_article("https://a/2", "Second", "BBC", "Cits", now)).await;

            db.apply_preference(1, &PreferenceAction::Save { article_id: first, tag: SaveTag::Later })
                .await
                .unwrap();
            db.apply_preference(1, &PreferenceAction::Save { article_id: second, tag: SaveTag::Later })
                .await
                .unwrap();
            db.apply_preference(1, &PreferenceAction::Save { article_id: first, tag: SaveTag::Important })
                .await
                .unwrap();

            let later: Vec<i64> = db
                .saved_articles(1, SaveTag::Later)
                .await
                .unwrap()
                .into_iter()
                .map(|a| a.id)
                .collect();
            assert_eq!(later, vec![second, first]);

            let important = db.saved_articles(1, SaveTag::Important).await.unwrap();
            assert_eq!(important.len(), 1);
            assert_eq!(important[0].id, first);
            assert!(db.saved_articles(2, SaveTag::Later).await.unwrap().is_empty());
        }
    }

    mod ignore_tests {
        use super::*;

        #[tokio::test]
        async fn test_ignore_is_idempotent() {
            let db = create_test_db().await;
            let ignore = PreferenceAction::IgnoreSource { source: "CNN".to_string() };
            db.apply_preference(1, &ignore).await.unwrap();
            db.apply_preference(1, &ignore).await.unwrap();
            db.apply_preference(1, &PreferenceAction::IgnoreArticle { article_id: 3 })
                .await
                .unwrap();
            db.apply_preference(1, &PreferenceAction::IgnoreArticle { article_id: 3 })
                .await
                .unwrap();

            assert_eq!(db.ignored_sources(1).await.unwrap(), vec!["CNN"]);
            assert_eq!(db.ignored_articles(1).await.unwrap(), vec![3]);
            assert!(db.ignored_sources(2).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_unignore() {
            let db = create_test_db().await;
            db.apply_preference(1, &PreferenceAction::IgnoreSource { source: "CNN".to_string() })
                .await
                .unwrap();
            db.apply_preference(1, &PreferenceAction::IgnoreArticle { article_id: 3 })
                .await
                .unwrap();
            db.apply_preference(1, &PreferenceAction::UnignoreSource { source: "CNN".to_string() })
                .await
                .unwrap();
            db.apply_preference(1, &PreferenceAction::UnignoreArticle { article_id: 3 })
                .await
                .unwrap();
            db.apply_preference(1, &PreferenceAction::UnignoreSource { source: "BBC".to_string() })
                .await
                .unwrap();

            let snapshot = db.preference_snapshot(1).await.unwrap();
            assert!(snapshot.ignored_sources.is_empty());
            assert!(snapshot.ignored_articles.is_empty());
        }
    }

    mod view_tests {
        use super::*;

        #[tokio::test]
        async fn test_repeat_view_updates_timestamp() {
            let db = create_test_db().await;
            let id = insert(&db, new_article("https://a/1", "One", "BBC", "Cits", Utc::now())).await;
            let view = PreferenceAction::ViewArticle { article_id: id };

            db.apply_preference(1, &view).await.unwrap();
            let first = db.preference_snapshot(1).await.unwrap().viewed[&id];

            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            db.apply_preference(1, &view).await.unwrap();
            let snapshot = db.preference_snapshot(1).await.unwrap();

            assert_eq!(snapshot.viewed.len(), 1);
            assert!(snapshot.viewed[&id] > first);
            assert_eq!(snapshot.viewed_ids(), BTreeSet::from([id]));
        }

        #[tokio::test]
        async fn test_recently_viewed_order() {
            let db = create_test_db().await;
            let now = Utc::now();
            let a = insert(&db, new_article("https://a/1", "A", "BBC", "Cits", now)).await;
            let b = insert(&db, new_article("https://a/2", "B", "BBC", "Cits", now)).await;

            db.apply_preference(1, &PreferenceAction::ViewArticle { article_id: a })
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            db.apply_preference(1, &PreferenceAction::ViewArticle { article_id: b })
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            db.apply_preference(1, &PreferenceAction::ViewArticle { article_id: a })
                .await
                .unwrap();

            let viewed = db.recently_viewed(1, 30).await.unwrap();
            let ids: Vec<i64> = viewed.iter().map(|v| v.article.id).collect();
            assert_eq!(ids, vec![a, b]);
        }
    }

    mod activity_tests {
        use super::*;

        #[tokio::test]
        async fn test_every_action_is_logged() {
            let db = create_test_db().await;
            db.apply_preference(7, &PreferenceAction::Save { article_id: 2, tag: SaveTag::Important })
                .await
                .unwrap();
            db.apply_preference(7, &PreferenceAction::IgnoreSource { source: "Fox News".to_string() })
                .await
                .unwrap();

            let log = activity(&db, 7).await;
            assert_eq!(
                log,
                vec![
                    ("save_important".to_string(), "2".to_string()),
                    ("ignore_source".to_string(), "\"Fox News\"".to_string()),
                ]
            );
        }
    }
}
