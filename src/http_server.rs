use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::models::{CorpusStatus, SearchCandidate, SearchRequest};
use crate::search::SearchService;

#[derive(Clone)]
pub struct ServerState {
    pub service: Arc<SearchService>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct SearchReply {
    pub status: &'static str,
    pub results: Vec<SearchCandidate>,
    pub total: usize,
    pub time: f64,
}

#[derive(Debug, Serialize)]
pub struct CorporaReply {
    pub status: &'static str,
    pub corpora: Vec<CorpusStatus>,
}

#[derive(Debug, Serialize)]
pub struct ErrorReply {
    pub status: &'static str,
    pub message: String,
}

fn error_reply(message: String) -> (StatusCode, Json<ErrorReply>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorReply {
            status: "error",
            message,
        }),
    )
}

pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/corpora", get(list_corpora))
        .route("/api/search", post(handle_search))
        .route("/api/reload", post(handle_reload))
        .layer(cors)
        .with_state(state)
}

/// Serve the search API until the process is stopped.
pub async fn start_server(addr: SocketAddr, service: Arc<SearchService>) -> anyhow::Result<()> {
    let app = router(ServerState { service });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn list_corpora(State(state): State<ServerState>) -> impl IntoResponse {
    Json(CorporaReply {
        status: "success",
        corpora: state.service.status(),
    })
}

async fn handle_search(
    State(state): State<ServerState>,
    Json(request): Json<SearchRequest>,
) -> axum::response::Response {
    let service = state.service.clone();
    // Embedding and scoring are blocking work
    let outcome = tokio::task::spawn_blocking(move || service.search(&request)).await;

    match outcome {
        Ok(Ok(response)) => Json(SearchReply {
            status: "success",
            results: response.results,
            total: response.total,
            time: response.time,
        })
        .into_response(),
        Ok(Err(e)) => {
            log::error!("Search failed: {}", e);
            error_reply(e.to_string()).into_response()
        }
        Err(e) => {
            log::error!("Search task panicked: {}", e);
            error_reply("internal error".to_string()).into_response()
        }
    }
}

async fn handle_reload(State(state): State<ServerState>) -> axum::response::Response {
    let service = state.service.clone();
    match tokio::task::spawn_blocking(move || service.reload_all()).await {
        Ok(corpora) => {
            log::info!("Reloaded {} corpora", corpora.len());
            Json(CorporaReply {
                status: "success",
                corpora,
            })
            .into_response()
        }
        Err(e) => {
            log::error!("Reload task panicked: {}", e);
            error_reply("internal error".to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CorpusConfig, SearchConfig};
    use crate::db::Catalog;
    use crate::embeddings::Embedder;
    use crate::error::EmbedError;
    use crate::models::{DocumentRecord, FileType};
    use crate::vector_index::export_index;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tempfile::tempdir;
    use tower::ServiceExt;

    struct UnitEmbedder;

    impl Embedder for UnitEmbedder {
        fn model_name(&self) -> &str {
            "unit"
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct DownEmbedder;

    impl Embedder for DownEmbedder {
        fn model_name(&self) -> &str {
            "down"
        }

        fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Err(EmbedError::Request("connection refused".to_string()))
        }
    }

    fn corpus(dir: &std::path::Path) -> CorpusConfig {
        let config = CorpusConfig {
            key: "novels".to_string(),
            name: "Local_Novels".to_string(),
            root: dir.join("novels"),
            catalog: dir.join("novels.sqlite"),
            index: dir.join("novels.nsvi"),
            file_type: FileType::Text,
            extensions: vec!["txt".to_string()],
        };
        let mut catalog = Catalog::open(&config.catalog).unwrap();
        catalog
            .upsert_many(&[
                DocumentRecord {
                    filepath: "/novels/match.txt".to_string(),
                    filename: "match.txt".to_string(),
                    file_type: FileType::Text,
                    mtime: 1_700_000_000.0,
                    preview: "close".to_string(),
                    embedding: vec![1.0, 0.0],
                },
                DocumentRecord {
                    filepath: "/novels/other.txt".to_string(),
                    filename: "other.txt".to_string(),
                    file_type: FileType::Text,
                    mtime: 1_700_000_100.0,
                    preview: "far".to_string(),
                    embedding: vec![0.0, 1.0],
                },
            ])
            .unwrap();
        export_index(&catalog, &config.index).unwrap();
        config
    }

    fn app(dir: &std::path::Path, embedder: Arc<dyn Embedder>) -> Router {
        let service =
            SearchService::new(vec![corpus(dir)], embedder, SearchConfig::default());
        router(ServerState {
            service: Arc::new(service),
        })
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempdir().unwrap();
        let request = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(app(dir.path(), Arc::new(UnitEmbedder)), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_corpora_listing() {
        let dir = tempdir().unwrap();
        let request = Request::builder()
            .uri("/api/corpora")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(app(dir.path(), Arc::new(UnitEmbedder)), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["corpora"][0]["key"], "novels");
        assert_eq!(body["corpora"][0]["available"], true);
        assert_eq!(body["corpora"][0]["ntotal"], 2);
    }

    #[tokio::test]
    async fn test_search_success() {
        let dir = tempdir().unwrap();
        let request = post_json(
            "/api/search",
            r#"{"query": "anything", "targetCorpusKeys": ["novels"], "min_score": 0.5}"#,
        );
        let (status, body) = call(app(dir.path(), Arc::new(UnitEmbedder)), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["total"], 1);
        let hit = &body["results"][0];
        assert_eq!(hit["filename"], "match.txt");
        assert_eq!(hit["type"], "text");
        assert_eq!(hit["source"], "Local_Novels");
        assert_eq!(hit["score_percent"], 100);
        assert!(body["time"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_search_blank_query() {
        let dir = tempdir().unwrap();
        let request = post_json("/api/search", r#"{"query": ""}"#);
        let (status, body) = call(app(dir.path(), Arc::new(DownEmbedder)), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);
        assert_eq!(body["results"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_search_embedder_failure() {
        let dir = tempdir().unwrap();
        let request = post_json("/api/search", r#"{"query": "dragon"}"#);
        let (status, body) = call(app(dir.path(), Arc::new(DownEmbedder)), request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("connection refused"));
    }

    #[tokio::test]
    async fn test_reload() {
        let dir = tempdir().unwrap();
        let request = post_json("/api/reload", "");
        let (status, body) = call(app(dir.path(), Arc::new(UnitEmbedder)), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["corpora"][0]["ntotal"], 2);
    }
}
