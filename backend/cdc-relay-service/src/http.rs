use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use std::sync::Arc;

use crate::metrics;
use crate::supervisor::ControllerRegistry;

async fn ready(registry: web::Data<Arc<ControllerRegistry>>) -> impl Responder {
    if registry.all_running() {
        HttpResponse::Ok().body("READY")
    } else {
        HttpResponse::ServiceUnavailable().json(registry.snapshot())
    }
}

async fn collections(registry: web::Data<Arc<ControllerRegistry>>) -> impl Responder {
    HttpResponse::Ok().json(registry.snapshot())
}

async fn prometheus_metrics() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::gather_text())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(|| async { "OK" }))
        .route("/ready", web::get().to(ready))
        .route("/metrics", web::get().to(prometheus_metrics))
        .route("/collections", web::get().to(collections));
}

/// Bind the operational HTTP server; the caller drives the returned future.
pub fn server(registry: Arc<ControllerRegistry>, port: u16) -> std::io::Result<Server> {
    let registry = web::Data::new(registry);
    Ok(HttpServer::new(move || {
        App::new()
            .app_data(registry.clone())
            .configure(configure)
    })
    .workers(1)
    .disable_signals()
    .bind(("0.0.0.0", port))?
    .run())
}
