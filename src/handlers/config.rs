use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Public view of the configuration. The upstream API key is replaced by a
/// flag saying whether one is configured.
fn redacted_config(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port,
            "ws_path": config.server.ws_path
        },
        "upstream": {
            "url": config.upstream.url,
            "api_key_configured": config.upstream.api_key_configured(),
            "model": config.upstream.model,
            "system_instruction": config.upstream.system_instruction,
            "connect_timeout_secs": config.upstream.connect_timeout_secs
        },
        "audio": {
            "capture_rate": config.audio.capture_rate,
            "frame_duration_ms": config.audio.frame_duration_ms,
            "frame_samples": config.audio.frame_samples(),
            "playback_rate": config.audio.playback_rate,
            "drain_idle_ms": config.audio.drain_idle_ms
        },
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "heartbeat_interval_secs": config.performance.heartbeat_interval_secs,
            "client_timeout_secs": config.performance.client_timeout_secs
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted_config(&config)
    })))
}

/// Partial runtime update. Changes apply to sessions opened afterwards;
/// running sessions keep the settings they started with.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted_config(&current_config)
    })))
}
