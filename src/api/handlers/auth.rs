//! Token check endpoint

use axum::Json;
use serde_json::{json, Value};

/// Reached only behind the auth middleware, so a 200 tells the client its
/// stored token is still valid.
pub async fn check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
