use axum::{
    routing::{delete, get, post},
    Router,
};

use super::handlers;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(handlers::status))
        .route("/provision", post(handlers::provision))
        .route("/provision", delete(handlers::deprovision))
        .route("/connection", delete(handlers::disconnect))
}
