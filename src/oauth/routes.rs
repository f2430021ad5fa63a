use axum::{routing::get, Router};

use super::handlers;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/oauth/install", get(handlers::install))
        .route("/oauth/callback", get(handlers::callback))
}
