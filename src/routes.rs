use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::db::{Article, Database, SavedSearch, SearchEntry, ViewedArticle, HISTORY_LIMIT, RECENTLY_VIEWED_LIMIT};
use crate::fetcher::{Fetcher, RefreshSummary};
use crate::preferences::{Identity, PreferenceAction, PreferenceSnapshot, SaveTag};
use crate::query::{self, ArticleListing, ListParams, ListRequest};

/// Header carrying the authenticated user's email, set by the auth proxy.
pub const USER_EMAIL_HEADER: &str = "x-user-email";
/// Optional header carrying the user's display name.
pub const USER_NAME_HEADER: &str = "x-user-name";

pub struct AppState {
    pub db: Arc<Database>,
    pub fetcher: Arc<Fetcher>,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("authentication required")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("refresh already in progress")]
    RefreshInProgress,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::RefreshInProgress => StatusCode::CONFLICT,
            AppError::Internal(e) => {
                warn!("Request failed: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, format!("Error: {}", self)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let email = header_value(parts, USER_EMAIL_HEADER).ok_or(AppError::Unauthorized)?;
        Identity::new(email, header_value(parts, USER_NAME_HEADER)).ok_or(AppError::Unauthorized)
    }
}

fn header_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

async fn user_id(state: &AppState, identity: &Identity) -> Result<i64, AppError> {
    Ok(state.db.get_or_create_user(identity).await?)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/compare", get(compare))
        .route("/sources", get(sources))
        .route("/preferences", get(preferences))
        .route("/history", get(history))
        .route("/saved/:tag", get(saved))
        .route("/article/:id", get(open_article))
        .route("/save", post(save_article))
        .route("/unsave", post(unsave_article))
        .route("/ignore-article", post(ignore_article))
        .route("/unignore-article", post(unignore_article))
        .route("/ignore-source", post(ignore_source))
        .route("/unignore-source", post(unignore_source))
        .route("/save-search", post(save_search))
        .route("/remove-saved-search", post(remove_saved_search))
        .route("/refresh", post(refresh))
        .route("/refresh/status", get(refresh_status))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Read handlers
pub async fn index(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(params): Query<ListParams>,
) -> Result<Json<ArticleListing>, AppError> {
    let user_id = user_id(&state, &identity).await?;
    let request = ListRequest::from(params);
    let listing = query::list_articles(&state.db, user_id, &request, Utc::now()).await?;
    Ok(Json(listing))
}

#[derive(Deserialize)]
pub struct CompareQuery {
    #[serde(default)]
    pub topic: String,
}

pub async fn compare(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(params): Query<CompareQuery>,
) -> Result<Json<BTreeMap<String, Vec<Article>>>, AppError> {
    let user_id = user_id(&state, &identity).await?;
    let grouped = query::compare_sources(&state.db, user_id, &params.topic).await?;
    Ok(Json(grouped))
}

pub async fn sources(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(state.db.list_sources().await?))
}

pub async fn preferences(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<PreferenceSnapshot>, AppError> {
    let user_id = user_id(&state, &identity).await?;
    Ok(Json(state.db.preference_snapshot(user_id).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct History {
    pub searches: Vec<SearchEntry>,
    pub saved_searches: Vec<SavedSearch>,
    pub viewed: Vec<ViewedArticle>,
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<History>, AppError> {
    let user_id = user_id(&state, &identity).await?;
    Ok(Json(History {
        searches: state.db.search_history(user_id, HISTORY_LIMIT).await?,
        saved_searches: state.db.saved_searches(user_id).await?,
        viewed: state.db.recently_viewed(user_id, RECENTLY_VIEWED_LIMIT).await?,
    }))
}

fn parse_tag(raw: &str) -> Result<SaveTag, AppError> {
    raw.parse::<SaveTag>()
        .map_err(|e| AppError::BadRequest(e.to_string()))
}

pub async fn saved(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(tag): Path<String>,
) -> Result<Json<Vec<Article>>, AppError> {
    let tag = parse_tag(&tag)?;
    let user_id = user_id(&state, &identity).await?;
    Ok(Json(state.db.saved_articles(user_id, tag).await?))
}

/// Record the view and send the reader on to the original article.
pub async fn open_article(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(article_id): Path<i64>,
) -> Result<Redirect, AppError> {
    let user_id = user_id(&state, &identity).await?;
    let article = state
        .db
        .get_article(article_id)
        .await?
        .ok_or(AppError::NotFound)?;

    state
        .db
        .apply_preference(user_id, &PreferenceAction::ViewArticle { article_id })
        .await?;

    Ok(Redirect::to(&article.url))
}

// Preference handlers
#[derive(Deserialize)]
pub struct SaveForm {
    pub article_id: i64,
    pub tag: String,
}

#[derive(Deserialize)]
pub struct ArticleForm {
    pub article_id: i64,
}

#[derive(Deserialize)]
pub struct SourceForm {
    pub source: String,
}

async fn apply(
    state: &AppState,
    identity: &Identity,
    action: PreferenceAction,
) -> Result<Json<PreferenceSnapshot>, AppError> {
    let user_id = user_id(state, identity).await?;
    state.db.apply_preference(user_id, &action).await?;
    Ok(Json(state.db.preference_snapshot(user_id).await?))
}

pub async fn save_article(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Form(form): Form<SaveForm>,
) -> Result<Json<PreferenceSnapshot>, AppError> {
    let tag = parse_tag(&form.tag)?;
    let action = PreferenceAction::Save {
        article_id: form.article_id,
        tag,
    };
    apply(&state, &identity, action).await
}

pub async fn unsave_article(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Form(form): Form<SaveForm>,
) -> Result<Json<PreferenceSnapshot>, AppError> {
    let tag = parse_tag(&form.tag)?;
    let action = PreferenceAction::Unsave {
        article_id: form.article_id,
        tag,
    };
    apply(&state, &identity, action).await
}

pub async fn ignore_article(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Form(form): Form<ArticleForm>,
) -> Result<Json<PreferenceSnapshot>, AppError> {
    let action = PreferenceAction::IgnoreArticle {
        article_id: form.article_id,
    };
    apply(&state, &identity, action).await
}

pub async fn unignore_article(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Form(form): Form<ArticleForm>,
) -> Result<Json<PreferenceSnapshot>, AppError> {
    let action = PreferenceAction::UnignoreArticle {
        article_id: form.article_id,
    };
    apply(&state, &identity, action).await
}

fn source_name(form: SourceForm) -> Result<String, AppError> {
    let source = form.source.trim();
    if source.is_empty() {
        return Err(AppError::BadRequest("source must not be empty".to_string()));
    }
    Ok(source.to_string())
}

pub async fn ignore_source(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Form(form): Form<SourceForm>,
) -> Result<Json<PreferenceSnapshot>, AppError> {
    let action = PreferenceAction::IgnoreSource {
        source: source_name(form)?,
    };
    apply(&state, &identity, action).await
}

pub async fn unignore_source(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Form(form): Form<SourceForm>,
) -> Result<Json<PreferenceSnapshot>, AppError> {
    let action = PreferenceAction::UnignoreSource {
        source: source_name(form)?,
    };
    apply(&state, &identity, action).await
}

// Saved searches
#[derive(Deserialize)]
pub struct SaveSearchForm {
    #[serde(default)]
    pub query: String,
}

#[derive(Deserialize)]
pub struct RemoveSearchForm {
    pub search_id: i64,
}

pub async fn save_search(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Form(form): Form<SaveSearchForm>,
) -> Result<Json<Vec<SavedSearch>>, AppError> {
    let user_id = user_id(&state, &identity).await?;
    state.db.save_search(user_id, &form.query).await?;
    Ok(Json(state.db.saved_searches(user_id).await?))
}

pub async fn remove_saved_search(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Form(form): Form<RemoveSearchForm>,
) -> Result<Json<Vec<SavedSearch>>, AppError> {
    let user_id = user_id(&state, &identity).await?;
    state.db.remove_saved_search(user_id, form.search_id).await?;
    Ok(Json(state.db.saved_searches(user_id).await?))
}

// Ingestion
pub async fn refresh(State(state): State<Arc<AppState>>) -> Result<Json<RefreshSummary>, AppError> {
    state
        .fetcher
        .refresh_all_feeds()
        .await?
        .map(Json)
        .ok_or(AppError::RefreshInProgress)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshStatus {
    pub refreshing: bool,
}

pub async fn refresh_status(State(state): State<Arc<AppState>>) -> Json<RefreshStatus> {
    Json(RefreshStatus {
        refreshing: state.fetcher.is_refreshing(),
    })
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}
