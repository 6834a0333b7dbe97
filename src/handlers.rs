use crate::errors::AppError;
use crate::models::{AcceptResponse, ClearedResponse, PostObservation, SaveErrorRecord, SaveResponse, StatsResponse};
use crate::orchestrator::{AcceptOutcome, SaveOutcome};
use crate::settings::{Settings, SettingsUpdate};
use crate::state::AppState;
use crate::storage::{get_value, keys};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::Value;
use tracing::{info, warn};

pub async fn accept_observation(
    State(state): State<AppState>,
    Json(payload): Json<PostObservation>,
) -> Result<Json<AcceptResponse>, AppError> {
    match state.orchestrator.accept_observation(payload).await {
        AcceptOutcome::Accepted { post_count, save } => Ok(Json(AcceptResponse {
            status: "accepted".to_string(),
            post_count,
            save: save.map(to_save_response),
        })),
        AcceptOutcome::Duplicate => Ok(Json(AcceptResponse {
            status: "duplicate".to_string(),
            post_count: state.orchestrator.stats().await.post_count,
            save: None,
        })),
        AcceptOutcome::Rejected => Err(AppError::bad_request("authorKey must not be empty")),
    }
}

pub async fn save(State(state): State<AppState>) -> Json<SaveResponse> {
    Json(to_save_response(state.orchestrator.force_save().await))
}

pub async fn flush(State(state): State<AppState>) -> StatusCode {
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        let outcome = orchestrator.flush_on_unload().await;
        info!("unload flush finished: {outcome:?}");
    });
    StatusCode::ACCEPTED
}

pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(state.orchestrator.stats().await)
}

pub async fn get_settings(State(state): State<AppState>) -> Result<Json<Settings>, AppError> {
    Ok(Json(Settings::load(state.storage.as_ref()).await?))
}

pub async fn update_settings(
    State(state): State<AppState>,
    Json(payload): Json<SettingsUpdate>,
) -> Result<Json<Settings>, AppError> {
    let changes = payload.into_changes()?;
    changes.apply(state.storage.as_ref()).await?;

    let settings = Settings::load(state.storage.as_ref()).await?;
    state.orchestrator.apply_settings(&settings).await;
    Ok(Json(settings))
}

pub async fn get_csv(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let csv = get_value(state.storage.as_ref(), keys::ACCUMULATED_CSV)
        .await?
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default();
    Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], csv))
}

pub async fn get_last_error(State(state): State<AppState>) -> Result<Json<Option<SaveErrorRecord>>, AppError> {
    let record = match get_value(state.storage.as_ref(), keys::LAST_SAVE_ERROR).await? {
        Some(Value::Null) | None => None,
        Some(value) => serde_json::from_value(value)
            .inspect_err(|err| warn!("ignoring unreadable save error record: {err}"))
            .ok(),
    };
    Ok(Json(record))
}

pub async fn clear_processed(State(state): State<AppState>) -> Result<Json<ClearedResponse>, AppError> {
    let cleared = state.orchestrator.clear_processed().await?;
    Ok(Json(ClearedResponse { cleared }))
}

fn to_save_response(outcome: SaveOutcome) -> SaveResponse {
    let status = match &outcome {
        SaveOutcome::Saved { .. } => "saved",
        SaveOutcome::Disabled => "disabled",
        SaveOutcome::Empty => "empty",
        SaveOutcome::InFlight => "inFlight",
        SaveOutcome::Failed { .. } => "failed",
    };
    let mut response = SaveResponse {
        success: matches!(outcome, SaveOutcome::Saved { .. }),
        status: status.to_string(),
        error: None,
        hash: None,
        rows: None,
    };
    match outcome {
        SaveOutcome::Saved { hash, rows, .. } => {
            response.hash = Some(hash);
            response.rows = Some(rows);
        }
        SaveOutcome::Failed { message } => response.error = Some(message),
        _ => {}
    }
    response
}
