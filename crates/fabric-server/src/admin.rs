//! Admin HTTP API over the config store.
//!
//! - `GET <prefix>/admin/config/{section}`: one section, or `all`
//! - `POST <prefix>/admin/updateconfig`: form field `configuration` holding
//!   `{ "<section>": {...} }`

use axum::{
    Form, Router,
    extract::{Path, State},
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::ConfigStore;

#[derive(Debug, Deserialize)]
struct UpdateForm {
    configuration: Option<String>,
}

/// Routes for the admin API, mounted under `prefix`.
pub fn router(store: ConfigStore, prefix: &str) -> Router {
    let prefix = normalize_prefix(prefix);
    Router::new()
        .route(&format!("{prefix}/admin/config/{{section}}"), get(get_config))
        .route(&format!("{prefix}/admin/updateconfig"), post(update_config))
        .with_state(store)
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

async fn get_config(
    State(store): State<ConfigStore>,
    Path(section): Path<String>,
) -> impl IntoResponse {
    let config = if section == "all" {
        Some(store.sections())
    } else {
        store.section(&section)
    };
    match config {
        Some(config) => Json(json!({ "section": section, "config": config })),
        None => Json(json!({ "error": "Invalid Section" })),
    }
}

async fn update_config(
    State(store): State<ConfigStore>,
    Form(form): Form<UpdateForm>,
) -> impl IntoResponse {
    let Some(configuration) = form.configuration else {
        return Json(json!({ "error": "No configuration specified" }));
    };

    let result = serde_json::from_str(&configuration)
        .map_err(|e| e.to_string())
        .and_then(|patch| store.update(patch).map_err(|e| e.to_string()));
    match result {
        Ok(changed) => {
            info!("Configuration updated: {}", changed.join(", "));
            Json(json!({ "status": "Success" }))
        }
        Err(e) => {
            warn!("Configuration update failed: {e}");
            Json(json!({ "error": "Error in Updating" }))
        }
    }
}
