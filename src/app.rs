use crate::handlers;
use crate::state::AppState;
use axum::{routing::{delete, get, post}, Router};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/observations", post(handlers::accept_observation))
        .route("/api/save", post(handlers::save))
        .route("/api/flush", post(handlers::flush))
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/settings", get(handlers::get_settings).put(handlers::update_settings))
        .route("/api/csv", get(handlers::get_csv))
        .route("/api/last-error", get(handlers::get_last_error))
        .route("/api/processed", delete(handlers::clear_processed))
        .with_state(state)
}
