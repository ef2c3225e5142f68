//! HTTP surface: `GET /metrics` in the Prometheus text format and `GET /healthz`.

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use log::{error, info};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;

fn build_router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .route("/healthz", get(handle_health))
        .with_state(registry)
}

/// Gathering runs the blocking tado scrape, so it is moved off the async workers.
async fn handle_metrics(State(registry): State<Registry>) -> Response {
    match tokio::task::spawn_blocking(move || encode(&registry)).await {
        Ok(Ok(body)) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Ok(Err(e)) => {
            error!("Encoding metrics failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("encoding metrics failed: {}", e)).into_response()
        }
        Err(e) => {
            error!("Metrics collection task failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics collection failed".to_string()).into_response()
        }
    }
}

async fn handle_health() -> &'static str {
    "ok"
}

fn encode(registry: &Registry) -> prometheus::Result<Vec<u8>> {
    let families = registry.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&families, &mut buf)?;
    Ok(buf)
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn serve(addr: SocketAddr, registry: Registry) -> Result<(), String> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("binding {} failed: {}", addr, e))?;
    serve_on(listener, registry, shutdown_signal()).await
}

pub async fn serve_on(
    listener: TcpListener,
    registry: Registry,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), String> {
    if let Ok(local) = listener.local_addr() {
        info!("Serving metrics on http://{}/metrics", local);
    }
    axum::serve(listener, build_router(registry))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| format!("HTTP server failed: {}", e))?;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            // Without a signal handler the server can only be killed.
            error!("Listening for Ctrl-C failed: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectorSettings, TadoCollector};
    use crate::metrics::{ExporterMetrics, TadoMetrics};
    use crate::models::tado::{HomeId, Zone, ZoneId, ZoneType};
    use crate::upstream::fake::{FakeHome, FakeUpstream};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn registry_with_fake() -> (Registry, Arc<FakeUpstream>) {
        let home = FakeHome {
            zones: vec![Zone {
                id: Some(ZoneId(10)),
                name: Some("Bedroom".into()),
                r#type: Some(ZoneType::Heating),
                ..Default::default()
            }],
            zone_states: [(ZoneId(10), Default::default())].into_iter().collect(),
            ..Default::default()
        };
        let fake = Arc::new(FakeUpstream::with_homes(vec![(HomeId(1), home)]));
        let collector = TadoCollector::new(
            Arc::clone(&fake),
            CollectorSettings::default(),
            TadoMetrics::new().unwrap(),
            ExporterMetrics::new().unwrap(),
        );
        let registry = Registry::new();
        registry.register(Box::new(collector)).unwrap();
        (registry, fake)
    }

    fn fetch(url: String) -> (u16, String) {
        let mut response = ureq::get(&url).call().expect("request succeeds");
        let status = response.status().as_u16();
        let body = response.body_mut().read_to_string().expect("utf-8 body");
        (status, body)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serves_metrics_and_health() {
        let (registry, fake) = registry_with_fake();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_on(listener, registry, async {
            let _ = stopped.await;
        }));

        let (status, body) = tokio::task::spawn_blocking(move || fetch(format!("http://{addr}/metrics")))
            .await
            .unwrap();
        assert_eq!(status, 200);
        let bedroom_window = concat!(
            "tado_zone_window_open",
            r#"{home_id="1",zone_id="10",zone_name="Bedroom",zone_type="HEATING"} 0"#
        );
        assert!(body.contains(bedroom_window), "{body}");
        assert!(body.contains("tado_exporter_authentication_valid 1"));
        assert_eq!(fake.calls(), 5);

        let (status, body) = tokio::task::spawn_blocking(move || fetch(format!("http://{addr}/healthz")))
            .await
            .unwrap();
        assert_eq!((status, body.as_str()), (200, "ok"));
        assert_eq!(fake.calls(), 5);

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[test]
    fn encodes_text_exposition() {
        let (registry, _) = registry_with_fake();
        let text = String::from_utf8(encode(&registry).unwrap()).unwrap();
        assert!(text.contains("# TYPE tado_exporter_scrape_duration_seconds histogram"));
        assert!(text.contains("# HELP tado_zone_window_open"));
    }
}
