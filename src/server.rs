use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::{api_router, AppState, SharedState};
use crate::broadcast::EventBroadcaster;
use crate::config::Config;
use crate::db::{DbHandle, JobDb};
use crate::fetcher::{GitHubFetcher, RepositoryFetcher};
use crate::llm::{LanguageModel, OpenAiClient};
use crate::pipeline::{PipelineRunner, RetryPolicy};
use crate::qa::QuestionService;
use crate::stages::default_stages;

const FETCH_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire the whole service together from configuration: store, fetcher,
/// pipeline, broadcaster, and the question service.
pub fn build_state(config: &Config) -> anyhow::Result<SharedState> {
    let db = DbHandle::new(
        JobDb::new(Path::new(&config.database_path))
            .with_context(|| format!("Failed to open database at {}", config.database_path))?,
    );

    let fetcher: Arc<dyn RepositoryFetcher> = Arc::new(GitHubFetcher::new(
        config.github_token.clone(),
        FETCH_HTTP_TIMEOUT,
    )?);
    if config.github_token.is_none() {
        tracing::warn!("GITHUB_TOKEN not set, using unauthenticated GitHub rate limits");
    }

    let broadcaster = EventBroadcaster::new(db.clone());
    let runner = PipelineRunner::new(
        db.clone(),
        broadcaster.clone(),
        default_stages(fetcher),
        config.max_concurrent_analyses,
        RetryPolicy {
            max_attempts: config.stage_max_attempts,
            backoff: config.stage_retry_backoff,
        },
        config.stage_timeout,
    );

    // Without a key the ask endpoint reports upstream failure; analysis
    // itself does not touch the model.
    if config.openai_api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY not set, /repo/{{id}}/ask will fail");
    }
    let llm: Arc<dyn LanguageModel> = Arc::new(OpenAiClient::new(
        config.openai_api_key.clone().unwrap_or_default(),
        config.openai_model.clone(),
        config.openai_api_url.clone(),
        config.ask_timeout,
    )?);
    let qa = QuestionService::new(db.clone(), llm, config.context_budget_bytes);

    Ok(Arc::new(AppState {
        db,
        runner,
        broadcaster,
        qa,
    }))
}

pub fn build_router(state: SharedState, permissive_cors: bool) -> Router {
    let router = api_router().with_state(state);
    if permissive_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let state = build_state(&config)?;
    let app = build_router(state, config.is_development());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, environment = %config.environment, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_config(db_path: &str) -> Config {
        Config {
            database_path: db_path.to_string(),
            port: 0,
            environment: "development".to_string(),
            github_token: None,
            openai_api_key: None,
            openai_model: crate::llm::DEFAULT_OPENAI_MODEL.to_string(),
            openai_api_url: None,
            max_concurrent_analyses: 2,
            stage_timeout: Duration::from_secs(5),
            stage_max_attempts: 2,
            stage_retry_backoff: Duration::from_millis(10),
            ask_timeout: Duration::from_secs(5),
            context_budget_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_build_state_and_router_serve_health() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("jobs.db");
        let state = build_state(&test_config(db_path.to_str().unwrap())).unwrap();
        let app = build_router(state, true);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_permissive_cors_in_development() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("jobs.db");
        let state = build_state(&test_config(db_path.to_str().unwrap())).unwrap();
        let app = build_router(state, true);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response
            .headers()
            .contains_key("access-control-allow-origin"));
    }
}
