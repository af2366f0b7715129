// server.rs - HTTP front end
//
//   POST /generate                     multipart `image` -> environment summary
//   POST /explore?environment_id=..    optional goal JSON -> trajectory
//   POST /map?environment_id=..        trajectory JSON -> semantic map
//   GET  /health
//   /environments/*                    persisted environment files
//   /                                  static UI

use axum::{
    body::Bytes,
    extract::{
        DefaultBodyLimit, Multipart, Query, State,
        multipart::{MultipartError, MultipartRejection},
        rejection::QueryRejection,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tower_http::services::ServeDir;

use crate::agent::{ExplorationAgent, ExplorationState, Goal};
use crate::config::Settings;
use crate::environment::{Environment, EnvironmentGenerator, NavigationMap, PhysicsData, Pose};
use crate::error::{GenexError, Result};
use crate::mapping::MappingTask;

pub struct AppState {
    settings: Settings,
    generator: EnvironmentGenerator,
    /// Exploration advances the agent's random state
    agent: Mutex<ExplorationAgent>,
    mapping: MappingTask,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        Self {
            generator: EnvironmentGenerator::new(&settings),
            agent: Mutex::new(ExplorationAgent::new(&settings)),
            mapping: MappingTask::new(&settings),
            settings,
        }
    }

    /// Storage directory of an environment. Ids are limited to
    /// `[A-Za-z0-9_-]` so they cannot leave the storage root.
    fn environment_dir(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(GenexError::EnvironmentNotFound(format!("invalid environment id {id:?}")));
        }
        Ok(self.settings.storage.environments_dir.join(id))
    }

    fn load(&self, id: &str) -> Result<Environment> {
        self.generator.load_environment(&self.environment_dir(id)?)
    }
}

pub fn router(settings: Settings) -> Router {
    let environments = ServeDir::new(&settings.storage.environments_dir);
    let ui = ServeDir::new(&settings.server.ui_dir).append_index_html_on_directories(true);
    let body_limit = settings.server.max_upload_mb * 1024 * 1024;
    let state = Arc::new(AppState::new(settings));

    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/explore", post(explore))
        .route("/map", post(create_map))
        .nest_service("/environments", environments)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        .fallback_service(ui)
}

/// Every failure is reported as 500 with a `detail` message
#[derive(Debug)]
pub struct ApiError(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(detail = %self.0, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "detail": self.0 }))).into_response()
    }
}

impl From<GenexError> for ApiError {
    fn from(e: GenexError) -> Self {
        Self(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self(format!("worker failed: {e}"))
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self(format!("Unsupported input: {}", e.body_text()))
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(e: MultipartRejection) -> Self {
        Self(format!("Unsupported input: {}", e.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self(e.body_text())
    }
}

/// Run CPU-bound pipeline work off the async workers
async fn run_blocking<T, F>(f: F) -> std::result::Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

#[derive(Deserialize)]
struct EnvironmentQuery {
    environment_id: String,
}

#[derive(Serialize)]
struct PanoramaInfo {
    width: usize,
    height: usize,
    url: String,
}

#[derive(Serialize)]
struct DepthStats {
    min: f32,
    max: f32,
    mean: f32,
}

/// Environment as returned over HTTP; the pixel arrays are served as files
#[derive(Serialize)]
struct EnvironmentSummary<'a> {
    id: &'a str,
    pose: Pose,
    panorama: PanoramaInfo,
    depth_map: DepthStats,
    physics_data: &'a PhysicsData,
    navigation_map: &'a NavigationMap,
}

fn summarize(env: &Environment) -> Result<Value> {
    let (h, w, _) = env.panorama.dim();
    let n = env.depth_map.len().max(1) as f32;
    let summary = EnvironmentSummary {
        id: &env.id,
        pose: env.pose,
        panorama: PanoramaInfo { width: w, height: h, url: format!("/environments/{}/panorama.png", env.id) },
        depth_map: DepthStats {
            min: env.depth_map.iter().copied().fold(f32::INFINITY, f32::min),
            max: env.depth_map.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            mean: env.depth_map.sum() / n,
        },
        physics_data: &env.physics_data,
        navigation_map: &env.navigation_map,
    };
    Ok(serde_json::to_value(summary)?)
}

async fn health() -> &'static str {
    "OK"
}

async fn generate(
    State(state): State<Arc<AppState>>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> std::result::Result<Json<Value>, ApiError> {
    let mut multipart = multipart?;
    let mut image = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("image") {
            image = Some(field.bytes().await?);
            break;
        }
    }
    let bytes = image.ok_or_else(|| GenexError::UnsupportedInput("multipart field `image` is missing".into()))?;
    tracing::info!(bytes = bytes.len(), "generate request");

    let environment = run_blocking(move || {
        let env = state.generator.generate_from_bytes(&bytes)?;
        state.generator.save_environment(&env, &state.environment_dir(&env.id)?)?;
        summarize(&env)
    })
    .await?;

    Ok(Json(json!({ "status": "success", "environment": environment })))
}

async fn explore(
    State(state): State<Arc<AppState>>,
    query: std::result::Result<Query<EnvironmentQuery>, QueryRejection>,
    body: Bytes,
) -> std::result::Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let goal = parse_goal(&body)?;
    tracing::info!(id = %query.environment_id, goal = goal.is_some(), "explore request");

    let trajectory = run_blocking(move || {
        let env = state.load(&query.environment_id)?;
        let mut agent = state.agent.lock().unwrap_or_else(PoisonError::into_inner);
        agent.explore(&env, goal.as_ref())
    })
    .await?;

    Ok(Json(json!({ "status": "success", "trajectory": trajectory })))
}

/// Empty body or `null` means no goal
fn parse_goal(body: &[u8]) -> Result<Option<Goal>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: Value = serde_json::from_slice(body).map_err(|e| GenexError::InvalidGoal(e.to_string()))?;
    if value.is_null() {
        return Ok(None);
    }
    Goal::from_value(&value).map(Some)
}

async fn create_map(
    State(state): State<Arc<AppState>>,
    query: std::result::Result<Query<EnvironmentQuery>, QueryRejection>,
    body: Bytes,
) -> std::result::Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    tracing::info!(id = %query.environment_id, "map request");

    let map = run_blocking(move || {
        let trajectory: Vec<ExplorationState> = serde_json::from_slice(&body)?;
        let env = state.load(&query.environment_id)?;
        let map = state.mapping.create_map(&env, &trajectory)?;
        Ok(serde_json::to_value(map)?)
    })
    .await?;

    Ok(Json(json!({ "status": "success", "map": map })))
}
