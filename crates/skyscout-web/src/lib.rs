//! Axum + Askama web layer for SkyScout: the JSON search API and a small
//! dashboard over search history and current deals.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use skyscout_core::{FilterBundle, SearchCriteria, SearchParams, SortMode};
use skyscout_search::{maybe_build_scheduler, SearchConfig, SearchPipeline};
use skyscout_store::{Deal, RouteStats};
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "skyscout-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SearchPipeline>,
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(pipeline: Arc<SearchPipeline>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            pipeline,
            workspace_root: workspace_root.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub origin: String,
    pub destination: String,
    pub departure_date: NaiveDate,
    #[serde(default)]
    pub return_date: Option<NaiveDate>,
    #[serde(default = "default_adults")]
    pub adults: u32,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub sort: SortMode,
    #[serde(default)]
    pub filters: FilterBundle,
}

fn default_adults() -> u32 {
    1
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone)]
struct DealRow {
    destination: String,
    airline: String,
    price: String,
    discount_percent: u8,
}

impl From<Deal> for DealRow {
    fn from(deal: Deal) -> Self {
        DealRow {
            price: format_price(deal.price, &deal.currency),
            destination: deal.destination,
            airline: deal.airline,
            discount_percent: deal.discount_percent,
        }
    }
}

#[derive(Debug, Clone)]
struct HistoryRow {
    route: String,
    search_count: u64,
    best_price: String,
}

impl From<RouteStats> for HistoryRow {
    fn from(stats: RouteStats) -> Self {
        HistoryRow {
            route: format!(
                "{} → {} on {}",
                stats.origin, stats.destination, stats.departure_date
            ),
            search_count: stats.search_count,
            best_price: match stats.best_price_seen {
                Some(price) => format_price(price, &stats.currency),
                None => "–".to_string(),
            },
        }
    }
}

fn format_price(minor: i64, currency: &str) -> String {
    let major = minor as f64 / 100.0;
    if currency == "EUR" {
        format!("€{major:.2}")
    } else {
        format!("{currency} {major:.2}")
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    deals: Vec<DealRow>,
    recent: Vec<HistoryRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/search", post(api_search_handler))
        .route("/api/history", get(api_history_handler))
        .route("/api/deals", get(api_deals_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("SKYSCOUT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let config = SearchConfig::from_env();
    let pipeline = Arc::new(SearchPipeline::from_config(&config).await?);
    let _scheduler = maybe_build_scheduler(pipeline.clone(), &config).await?;

    let state = AppState::new(pipeline, ".");
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<AppState>) -> Response {
    let deals = state.pipeline.deals().active(Utc::now()).await;
    let recent = state.pipeline.history().recent(8).await;
    render_html(IndexTemplate {
        deals: deals.into_iter().map(DealRow::from).collect(),
        recent: recent.into_iter().map(HistoryRow::from).collect(),
    })
}

async fn api_search_handler(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Response {
    let origin = req.origin.trim().to_ascii_uppercase();
    let destination = req.destination.trim().to_ascii_uppercase();
    if origin.is_empty() || destination.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "error": "origin and destination are required"
            })),
        )
            .into_response();
    }

    let params = SearchParams {
        origin,
        destination,
        departure_date: req.departure_date,
        return_date: req.return_date,
        adults: req.adults.max(1),
        max_results: req.max_results,
    };
    let mut criteria =
        SearchCriteria::for_route(&params.origin, &params.destination, params.departure_date);
    criteria.return_date = params.return_date;
    criteria.passengers = params.adults;
    criteria.filters = req.filters;

    let outcome = state.pipeline.run_search(&params, &criteria, req.sort).await;
    Json(outcome).into_response()
}

async fn api_history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let rows = state
        .pipeline
        .history()
        .recent(query.limit.unwrap_or(20))
        .await;
    Json(rows).into_response()
}

async fn api_deals_handler(State(state): State<AppState>) -> Response {
    let deals = state.pipeline.deals().active(Utc::now()).await;
    Json(deals).into_response()
}

async fn app_css_handler(State(state): State<AppState>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => (
            [(header::CONTENT_TYPE, "text/css; charset=utf-8")],
            css,
        )
            .into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Html("/* missing app.css */".to_string()),
        )
            .into_response(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use skyscout_search::{ProviderEntry, ProviderMode, ProviderRegistry};
    use skyscout_store::{DealStore, HistoryStore, HttpClientConfig, HttpFetcher};
    use std::path::Path;
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn fixture_state() -> AppState {
        let root = workspace_root();
        let registry = ProviderRegistry {
            providers: vec![ProviderEntry {
                id: "amadeus".into(),
                enabled: true,
                priority: 1,
                mode: ProviderMode::Fixture,
                base_url: String::new(),
                api_key_env: None,
                api_host: None,
                fixture: Some(root.join("fixtures/amadeus/sample/response.json")),
                airport_ids: Default::default(),
            }],
        };
        let pipeline = SearchPipeline::new(
            registry,
            Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap()),
            Arc::new(HistoryStore::new()),
            Arc::new(DealStore::new()),
        );
        AppState::new(Arc::new(pipeline), root)
    }

    fn search_body() -> String {
        serde_json::json!({
            "origin": "MAD",
            "destination": "BER",
            "departure_date": "2026-09-01",
            "sort": "cheapest"
        })
        .to_string()
    }

    #[tokio::test]
    async fn handler_smoke_get_index() {
        let app = app(fixture_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("SkyScout"));
    }

    #[tokio::test]
    async fn search_endpoint_returns_ranked_offers_and_records_history() {
        let app = app(fixture_state());

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/search")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(search_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let offers = json["offers"].as_array().unwrap();
        assert_eq!(offers.len(), 3);
        assert_eq!(offers[0]["price"], 18900);
        assert_eq!(json["summary"]["provider"], "amadeus");
        assert_eq!(json["summary"]["used_fallback"], false);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/history?limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let rows: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["best_price_seen"], 18900);
    }

    #[tokio::test]
    async fn search_endpoint_rejects_blank_routes() {
        let app = app(fixture_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/search")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "origin": "  ",
                            "destination": "BER",
                            "departure_date": "2026-09-01"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn deals_endpoint_reflects_the_deal_store() {
        let state = fixture_state();
        let app = app(state.clone());

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/deals")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let empty: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(empty.as_array().unwrap().is_empty());

        state.pipeline.refresh_deals().await.unwrap();

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/deals")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let deals: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(!deals.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_smoke_app_css() {
        let app = app(fixture_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/assets/static/app.css")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8(body.to_vec()).unwrap().contains("body"));
    }
}
