use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::handle::DatabaseHandle;
use crate::db::schema::SchemaDescriptor;
use crate::db::SchemaReadError;
use crate::ingest::IngestError;
use crate::pipeline::{FailureKind, QueryResponse};
use crate::web::state::AppState;

type ApiError = (StatusCode, String);

const UPLOAD_FIELD: &str = "db_file";

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub tables: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DatabaseList {
    pub databases: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub database_count: usize,
    pub llm_backend: String,
    pub llm_model: String,
}

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub endpoints: Vec<&'static str>,
}

pub async fn service_info() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        endpoints: vec![
            "POST /api/databases",
            "GET /api/databases",
            "DELETE /api/databases/{name}",
            "GET /api/databases/{name}/schema",
            "POST /api/databases/{name}/query",
            "GET /api/status",
        ],
    })
}

pub async fn upload_database(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<DatabaseInfo>), ApiError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read upload: {}", e)))?;
        upload = Some((file_name, bytes.to_vec()));
    }

    let (file_name, bytes) = upload.ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!("Missing '{}' file field", UPLOAD_FIELD),
        )
    })?;
    info!("Received upload {} ({} bytes)", file_name, bytes.len());

    let store_state = Arc::clone(&state);
    let name = tokio::task::spawn_blocking(move || store_state.ingest.store(&file_name, &bytes))
        .await
        .map_err(|e| {
            error!("Upload task failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Upload failed".to_string())
        })?
        .map_err(ingest_error)?;

    if let Err(e) = state.registry.register(&name).await {
        error!("Failed to open uploaded database {}: {}", name, e);
        if let Err(cleanup) = state.ingest.remove(&name) {
            warn!("Failed to remove {}: {}", name, cleanup);
        }
        return Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
    }

    let tables = match checkout(&state, &name).await?.inspect_schema(0).await {
        Ok(schema) => schema.table_names().into_iter().map(str::to_string).collect(),
        Err(SchemaReadError::NoUserTables) => {
            warn!("Uploaded database {} has no tables", name);
            Vec::new()
        }
        Err(e) => return Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    };

    Ok((StatusCode::CREATED, Json(DatabaseInfo { name, tables })))
}

pub async fn list_databases(State(state): State<Arc<AppState>>) -> Json<DatabaseList> {
    Json(DatabaseList {
        databases: state.registry.names().await,
    })
}

pub async fn delete_database(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let registered = state.registry.remove(&name).await;
    let removed = state.ingest.remove(&name).map_err(ingest_error)?;

    if registered || removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(&name))
    }
}

pub async fn get_schema(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SchemaDescriptor>, ApiError> {
    let handle = checkout(&state, &name).await?;
    handle
        .inspect_schema(state.config.query.sample_rows)
        .await
        .map(Json)
        .map_err(|e| {
            error!("Failed to read schema of {}: {}", name, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })
}

/// Runs the full question pipeline. The pipeline is cancelled if the client goes away.
pub async fn query_database(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(payload): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    if payload.question.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Question must not be empty".to_string()));
    }
    let handle = checkout(&state, &name).await?;

    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let max_retries = payload
        .max_retries
        .unwrap_or_else(|| state.pipeline.default_max_retries());

    let result = state
        .pipeline
        .answer_question(&handle, payload.question.trim(), max_retries, &cancel)
        .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(failed) if failed.error_kind == FailureKind::SchemaRead => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Err(_) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    Ok((status, Json(QueryResponse::from(result))).into_response())
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.startup_time)
        .num_seconds();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        database_count: state.registry.names().await.len(),
        llm_backend: state.config.llm.backend.clone(),
        llm_model: state.config.llm.model.clone(),
    })
}

async fn checkout(state: &AppState, name: &str) -> Result<DatabaseHandle, ApiError> {
    let pool = state.registry.pool(name).await.ok_or_else(|| not_found(name))?;
    DatabaseHandle::checkout(name, &pool).await.map_err(|e| {
        error!("Failed to get connection for {}: {}", name, e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

fn not_found(name: &str) -> ApiError {
    (StatusCode::NOT_FOUND, format!("Database '{}' not found", name))
}

fn ingest_error(err: IngestError) -> ApiError {
    match err {
        IngestError::IoError(e) => {
            error!("Failed to store upload: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to store upload".to_string())
        }
        other => (StatusCode::BAD_REQUEST, other.to_string()),
    }
}
