//! HTTP server exposing aggregated metrics.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::DEFAULT_SUBSET;
use crate::render::CONTENT_TYPE;
use crate::scrape::{ScrapeError, SharedScraper};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    scraper: SharedScraper,
}

/// Create the HTTP router.
fn create_router(scraper: SharedScraper) -> Router {
    let state = AppState { scraper };

    Router::new()
        .route("/", get(index_handler))
        .route("/metrics", get(metrics_handler))
        .route("/metrics/:subset", get(subset_handler))
        .route("/source", get(source_handler))
        .route("/analyze", get(analyze_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn metrics_response(body: String) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response()
}

fn error_response(err: ScrapeError) -> Response {
    let status = match &err {
        ScrapeError::UnknownSubset(_) => StatusCode::NOT_FOUND,
        ScrapeError::SubsetUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, format!("{}\n", err)).into_response()
}

async fn index_handler(State(state): State<AppState>) -> Html<String> {
    let mut page = String::from("<html><head><title>metric-gate</title></head><body>\n");
    page.push_str("<h1>metric-gate</h1>\n");
    page.push_str(&format!(
        "<p>Upstream: <code>{}</code></p>\n<ul>\n",
        state.scraper.upstream()
    ));
    page.push_str("<li><a href=\"/metrics\">/metrics</a></li>\n");
    for name in state
        .scraper
        .subset_names()
        .filter(|name| *name != DEFAULT_SUBSET)
    {
        page.push_str(&format!(
            "<li><a href=\"/metrics/{name}\">/metrics/{name}</a></li>\n"
        ));
    }
    page.push_str("<li><a href=\"/source\">/source</a></li>\n");
    page.push_str("<li><a href=\"/analyze\">/analyze</a></li>\n");
    page.push_str("<li><a href=\"/health\">/health</a></li>\n");
    page.push_str("</ul>\n</body></html>\n");
    Html(page)
}

/// Handler for `/metrics`: scrape now and render the default subset.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.scraper.scrape_and_render().await {
        Ok(body) => metrics_response(body),
        Err(e) => {
            error!(error = %e, "Scrape failed");
            error_response(e)
        }
    }
}

/// Handler for `/metrics/{subset}`: render the last published cycle.
async fn subset_handler(
    State(state): State<AppState>,
    Path(subset): Path<String>,
) -> Response {
    match state.scraper.render_subset(&subset) {
        Ok(body) => metrics_response(body),
        Err(e) => {
            warn!(subset = %subset, error = %e, "Subset not served");
            error_response(e)
        }
    }
}

/// Handler for `/source`: the upstream body as is.
async fn source_handler(State(state): State<AppState>) -> Response {
    let response = match state.scraper.fetch_upstream().await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Source fetch failed");
            return error_response(e);
        }
    };

    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
    let target = state.scraper.upstream().to_string();
    match response.bytes().await {
        Ok(body) => {
            let mut reply = (StatusCode::OK, body).into_response();
            if let Some(value) = content_type {
                reply.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            reply
        }
        Err(e) => error_response(ScrapeError::Fetch { target, source: e }),
    }
}

/// Handler for `/analyze`: cardinality report of the upstream.
async fn analyze_handler(State(state): State<AppState>) -> Response {
    match state.scraper.analyze_upstream().await {
        Ok(report) => (StatusCode::OK, report.to_string()).into_response(),
        Err(e) => {
            error!(error = %e, "Analyze failed");
            error_response(e)
        }
    }
}

async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// HTTP server configuration.
pub struct HttpServer {
    scraper: SharedScraper,
    listen_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(scraper: SharedScraper, listen_addr: SocketAddr) -> Self {
        Self {
            scraper,
            listen_addr,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let upstream = self.scraper.upstream().to_string();
        let router = create_router(self.scraper);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(
            addr = %self.listen_addr,
            upstream = %upstream,
            "HTTP server listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
