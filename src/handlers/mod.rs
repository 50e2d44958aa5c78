pub mod config;

pub use config::*;

use crate::{health, websocket};
use actix_web::web;

/// Register every route of the relay server.
///
/// Shared by `main` and the integration tests so both serve the same surface.
pub fn configure(cfg: &mut web::ServiceConfig, ws_path: &str) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(get_config))
            .route("/config", web::put().to(update_config)),
    )
    .route("/health", web::get().to(health::health_check))
    .route(ws_path, web::get().to(websocket::relay_websocket));
}
