use crate::{
    app::App,
    errors::AppError,
    identity::{extract_bearer_token, validate_token, viewer_from_headers},
    questions::QuestionStore,
    semantic::{
        self, EmbeddingCache, Pagination, ProviderKind, SearchHit, SearchParams, SearchService,
        SimilarQuestion, TextEmbedder,
    },
};
use anyhow::Context;
use axum::{
    extract::{Path, Query, Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::signal;

pub struct AppState<S: ?Sized, E> {
    pub service: Arc<SearchService<S, E>>,
    pub cache: Arc<EmbeddingCache>,
    pub auth_token: Option<Arc<str>>,
    /// Attach underlying errors to degraded responses
    pub debug_errors: bool,
}

impl<S: ?Sized, E> AppState<S, E> {
    fn debug(&self, diagnostic: Option<String>) -> Option<String> {
        if self.debug_errors {
            diagnostic
        } else {
            None
        }
    }
}

pub fn router<S, E>(state: Arc<AppState<S, E>>) -> Router
where
    S: QuestionStore + ?Sized + 'static,
    E: TextEmbedder + 'static,
{
    let token = state.auth_token.clone();

    Router::new()
        .route("/api/questions/:id/similar", get(similar::<S, E>))
        .route("/api/search", get(search::<S, E>))
        .route_layer(middleware::from_fn_with_state(token, require_token))
        .route("/api/health", get(health::<S, E>))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("shutting down");
}

async fn start_app(app: App) -> anyhow::Result<()> {
    let sweep_every = Duration::from_secs(app.config.semantic_search.cache.sweep_interval_secs);
    let sweeper = semantic::spawn_sweeper(app.cache.clone(), sweep_every);

    let state = Arc::new(AppState {
        service: app.service.clone(),
        cache: app.cache.clone(),
        auth_token: app.config.auth_token.as_deref().map(Arc::from),
        debug_errors: app.config.debug_errors,
    });

    if state.auth_token.is_none() {
        log::warn!("no auth_token configured, identity headers are trusted from any caller");
    }

    let listen_addr = &app.config.listen_addr;
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    log::info!("listening on {listen_addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    Ok(())
}

pub fn start_daemon(app: App) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(app))
}

#[derive(Debug)]
pub struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::NotFound => axum::http::StatusCode::NOT_FOUND,
            AppError::Unauthorized => axum::http::StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => axum::http::StatusCode::BAD_REQUEST,
            AppError::Other(_) => {
                log::error!("{self:?}");
                axum::http::StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn require_token(
    State(token): State<Option<Arc<str>>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = token.as_deref() {
        let authorized = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(extract_bearer_token)
            .is_some_and(|provided| validate_token(provided, expected));

        if !authorized {
            return HttpError(AppError::Unauthorized).into_response();
        }
    }

    next.run(request).await
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimilarRequest {
    pub limit: Option<usize>,
    pub threshold: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct SimilarResponse {
    pub similar: Vec<SimilarQuestion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

async fn similar<S, E>(
    State(state): State<Arc<AppState<S, E>>>,
    Path(id): Path<u64>,
    Query(request): Query<SimilarRequest>,
    headers: HeaderMap,
) -> Result<Json<SimilarResponse>, HttpError>
where
    S: QuestionStore + ?Sized + 'static,
    E: TextEmbedder + 'static,
{
    if let Some(threshold) = request.threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(AppError::BadRequest("threshold must be between 0 and 1".to_string()).into());
        }
    }

    let viewer = viewer_from_headers(&headers);
    log::debug!("similar to {id} for {viewer}");
    let outcome = state
        .service
        .similar_questions(id, viewer, request.limit, request.threshold)
        .await?;

    Ok(Json(SimilarResponse {
        similar: outcome.similar,
        message: outcome.message,
        debug: state.debug(outcome.diagnostic),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub pagination: Pagination,
    pub used_vector: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

async fn search<S, E>(
    State(state): State<Arc<AppState<S, E>>>,
    Query(params): Query<SearchParams>,
    headers: HeaderMap,
) -> Result<Json<SearchResponse>, HttpError>
where
    S: QuestionStore + ?Sized + 'static,
    E: TextEmbedder + 'static,
{
    if let Some(weight) = params.vector_weight {
        if !(0.0..=1.0).contains(&weight) {
            return Err(AppError::BadRequest("vectorWeight must be between 0 and 1".to_string()).into());
        }
    }

    let viewer = viewer_from_headers(&headers);
    let page = state.service.search(params, viewer).await?;

    Ok(Json(SearchResponse {
        results: page.results,
        pagination: page.pagination,
        used_vector: page.used_vector,
        message: page.message,
        debug: state.debug(page.diagnostic),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub questions: usize,
    pub cache_entries: usize,
    pub provider: ProviderKind,
    pub embeddings_available: bool,
}

async fn health<S, E>(State(state): State<Arc<AppState<S, E>>>) -> Result<Json<HealthResponse>, HttpError>
where
    S: QuestionStore + ?Sized + 'static,
    E: TextEmbedder + 'static,
{
    let questions = tokio::task::block_in_place(|| state.service.store().all_ids())?.len();
    let embedder = state.service.embedder();

    Ok(Json(HealthResponse {
        status: "ok",
        questions,
        cache_entries: state.cache.len(),
        provider: embedder.provider(),
        embeddings_available: embedder.is_available(),
    }))
}
