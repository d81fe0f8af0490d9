use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use kameo::actor::ActorRef;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

use crate::actors::{GetSystemHealth, HealthMonitorActor, HealthStatus};

#[derive(Clone)]
struct ServerState {
    registry: Arc<Registry>,
    health: Option<ActorRef<HealthMonitorActor>>,
}

/// Serve /metrics and /health until the server stops
pub async fn start_metrics_server(
    registry: Arc<Registry>,
    health: Option<ActorRef<HealthMonitorActor>>,
    port: u16,
) -> std::io::Result<()> {
    tracing::info!("📊 Starting metrics server on http://0.0.0.0:{}/metrics", port);

    let state = ServerState { registry, health };

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

/// Run the server on its own thread and runtime so it never competes with
/// the subscriber runtimes for worker threads
pub fn spawn_metrics_server(
    registry: Arc<Registry>,
    health: Option<ActorRef<HealthMonitorActor>>,
    port: u16,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build metrics server runtime");
                return;
            }
        };
        rt.block_on(async {
            if let Err(e) = start_metrics_server(registry, health, port).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    })
}

async fn metrics_handler(state: web::Data<ServerState>) -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

async fn health_handler(state: web::Data<ServerState>) -> impl Responder {
    let Some(monitor) = &state.health else {
        return HttpResponse::Ok().json(serde_json::json!({
            "status": "healthy",
            "service": "user-event-relay"
        }));
    };

    match monitor.ask(GetSystemHealth).await {
        Ok(health) => {
            let unhealthy = matches!(health.overall_status, HealthStatus::Unhealthy(_));
            let body = serde_json::json!({
                "service": "user-event-relay",
                "health": health,
            });
            if unhealthy {
                HttpResponse::ServiceUnavailable().json(body)
            } else {
                HttpResponse::Ok().json(body)
            }
        }
        Err(e) => {
            tracing::error!(error = ?e, "Health monitor did not answer");
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "status": "unknown",
                "service": "user-event-relay"
            }))
        }
    }
}
