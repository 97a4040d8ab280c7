use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{IntroductionOptions, QueryError, QueryLayer, QuerySnapshot, TaxonomyFilter};

#[derive(Clone)]
pub struct AppState {
    pub layer: Arc<QueryLayer>,
}

impl AppState {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            layer: Arc::new(QueryLayer::new(data_dir)),
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("GIATAR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        Self::new(data_dir)
    }
}

#[derive(Debug, Deserialize)]
struct LookupQuery {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct IntroductionQuery {
    iso3_only: Option<bool>,
    native_inference: Option<bool>,
}

impl IntroductionQuery {
    fn options(&self, defaults: IntroductionOptions) -> IntroductionOptions {
        IntroductionOptions {
            iso3_only: self.iso3_only.unwrap_or(defaults.iso3_only),
            native_inference: self.native_inference.unwrap_or(defaults.native_inference),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NativeStatusQuery {
    /// Comma-separated ISO3 codes.
    iso3: String,
}

#[derive(Debug, Serialize)]
struct SpeciesDetail<'a> {
    key: String,
    name: Option<String>,
    entry: Option<&'a giatar_core::CanonicalSpeciesEntry>,
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = match &self {
            QueryError::UnknownSpecies(_) => StatusCode::NOT_FOUND,
            QueryError::InvalidIso3(_) => StatusCode::BAD_REQUEST,
            QueryError::Load(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "query failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/species", get(list_species_handler))
        .route("/species/lookup", get(lookup_handler))
        .route("/species/taxonomy", get(taxonomy_handler))
        .route("/species/{species}", get(species_handler))
        .route("/species/{species}/first-introductions", get(first_introductions_handler))
        .route("/species/{species}/introductions", get(all_introductions_handler))
        .route("/species/{species}/native-ranges", get(native_ranges_handler))
        .route("/species/{species}/native-status", get(native_status_handler))
        .route("/species/{species}/ecology", get(ecology_handler))
        .route("/species/{species}/hosts-vectors", get(hosts_vectors_handler))
        .route("/reload", post(reload_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("GIATAR_QUERY_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, data_dir = %state.layer.data_dir().display(), "query server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(AppState::from_env(), port_from_env()).await
}

async fn snapshot(state: &AppState) -> Result<Arc<QuerySnapshot>, QueryError> {
    state.layer.snapshot().await
}

async fn list_species_handler(State(state): State<Arc<AppState>>) -> Result<Response, QueryError> {
    let snap = snapshot(&state).await?;
    Ok(Json(snap.list_species()).into_response())
}

async fn lookup_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LookupQuery>,
) -> Result<Response, QueryError> {
    let snap = snapshot(&state).await?;
    let key = snap.resolve(&query.name)?;
    Ok(Json(json!({ "name": query.name, "key": key })).into_response())
}

async fn taxonomy_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<TaxonomyFilter>,
) -> Result<Response, QueryError> {
    let snap = snapshot(&state).await?;
    Ok(Json(snap.species_by_taxonomy(&filter)).into_response())
}

async fn species_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(species): AxumPath<String>,
) -> Result<Response, QueryError> {
    let snap = snapshot(&state).await?;
    let key = snap.resolve(&species)?;
    let detail = SpeciesDetail {
        key: key.to_string(),
        name: snap.name_for_key(&key),
        entry: snap.species_entry(&key),
    };
    Ok(Json(detail).into_response())
}

async fn first_introductions_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(species): AxumPath<String>,
    Query(query): Query<IntroductionQuery>,
) -> Result<Response, QueryError> {
    let snap = snapshot(&state).await?;
    let key = snap.resolve(&species)?;
    let rows = snap.first_introductions(&key, query.options(IntroductionOptions::first_introductions()));
    Ok(Json(rows).into_response())
}

async fn all_introductions_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(species): AxumPath<String>,
    Query(query): Query<IntroductionQuery>,
) -> Result<Response, QueryError> {
    let snap = snapshot(&state).await?;
    let key = snap.resolve(&species)?;
    let rows = snap.all_introductions(&key, query.options(IntroductionOptions::all_introductions()));
    Ok(Json(rows).into_response())
}

async fn native_ranges_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(species): AxumPath<String>,
) -> Result<Response, QueryError> {
    let snap = snapshot(&state).await?;
    let key = snap.resolve(&species)?;
    Ok(Json(snap.native_ranges(&key)).into_response())
}

async fn native_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(species): AxumPath<String>,
    Query(query): Query<NativeStatusQuery>,
) -> Result<Response, QueryError> {
    let snap = snapshot(&state).await?;
    let key = snap.resolve(&species)?;
    let codes = query
        .iso3
        .split(',')
        .filter(|code| !code.trim().is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    Ok(Json(snap.native_status(&key, &codes)?).into_response())
}

async fn ecology_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(species): AxumPath<String>,
) -> Result<Response, QueryError> {
    let snap = snapshot(&state).await?;
    let key = snap.resolve(&species)?;
    Ok(Json(snap.ecology(&key)).into_response())
}

async fn hosts_vectors_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(species): AxumPath<String>,
) -> Result<Response, QueryError> {
    let snap = snapshot(&state).await?;
    let key = snap.resolve(&species)?;
    Ok(Json(snap.hosts_and_vectors(&key)).into_response())
}

async fn reload_handler(State(state): State<Arc<AppState>>) -> Result<Response, QueryError> {
    state.layer.invalidate().await;
    let snap = state.layer.load().await?;
    Ok(Json(json!({ "run_id": snap.run_id(), "species": snap.species_count() })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::data_dir;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn species_list_and_lookup() {
        let dir = data_dir().await;
        let app = app(AppState::new(dir.path()));

        let (status, body) = get_json(app.clone(), "/species").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(3));

        let (status, body) = get_json(app.clone(), "/species/lookup?name=Foo%20barus").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["key"], "100");

        let (status, body) = get_json(app, "/species/Nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("Nope"));
    }

    #[tokio::test]
    async fn introductions_honour_query_flags() {
        let dir = data_dir().await;
        let app = app(AppState::new(dir.path()));

        let (status, body) = get_json(app.clone(), "/species/Foo%20bar/first-introductions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(3));

        let (_, body) = get_json(app.clone(), "/species/100/first-introductions?iso3_only=true").await;
        assert_eq!(body.as_array().map(Vec::len), Some(2));
        assert_eq!(body[1]["native"], true);

        let (_, body) = get_json(app, "/species/100/introductions?native_inference=false").await;
        assert_eq!(body.as_array().map(Vec::len), Some(4));
    }

    #[tokio::test]
    async fn native_status_validates_codes() {
        let dir = data_dir().await;
        let app = app(AppState::new(dir.path()));

        let (status, body) = get_json(app.clone(), "/species/100/native-status?iso3=ESP,DEU").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["native"], true);
        assert_eq!(body[0]["evidence"], "bioregion");
        assert_eq!(body[1]["native"], Value::Null);

        let (status, _) = get_json(app, "/species/100/native-status?iso3=ES").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn subtables_and_taxonomy_routes() {
        let dir = data_dir().await;
        let app = app(AppState::new(dir.path()));

        let (_, body) = get_json(app.clone(), "/species/100/hosts-vectors").await;
        assert_eq!(body["cabi_hosts"][0]["Plant name"], "Vitis vinifera");

        let (_, body) = get_json(app.clone(), "/species/200/ecology").await;
        assert!(body.get("daisie_habitats").is_some());

        let (_, body) = get_json(app, "/species/taxonomy?kingdom=Animalia").await;
        assert_eq!(body, json!(["200"]));
    }

    #[tokio::test]
    async fn reload_reports_the_fresh_snapshot() {
        let dir = data_dir().await;
        let app = app(AppState::new(dir.path()));
        let resp = app
            .oneshot(Request::builder().method("POST").uri("/reload").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["run_id"], "run-1");
        assert_eq!(body["species"], 3);
    }
}
