use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;

const STORE_SECONDS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];
const BATCH_SIZES: &[f64] = &[
    1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0,
];

/// Install the global Prometheus recorder. Histograms ending in `_batch_size` count events,
/// everything else is in seconds.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets(STORE_SECONDS)?
        .set_buckets_for_metric(Matcher::Suffix("_batch_size".to_owned()), BATCH_SIZES)?
        .install_recorder()
}

/// Install the recorder and expose it on `/metrics`, next to `/_liveness`.
pub fn setup_metrics_router(liveness: HealthRegistry) -> Result<Router, BuildError> {
    Ok(metrics_router(setup_metrics_recorder()?, liveness))
}

fn metrics_router(recorder: PrometheusHandle, liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/metrics", get(move || std::future::ready(recorder.render())))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
}

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn get_path(router: Router, path: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn serves_metrics_and_liveness() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let liveness = HealthRegistry::new("liveness");

        let router = metrics_router(handle, liveness.clone());
        let metrics = get_path(router.clone(), "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"), "{metrics}");

        // Nothing registered yet.
        let live = get_path(router.clone(), "/_liveness").await;
        assert!(live.starts_with("HTTP/1.1 500"), "{live}");

        let missing = get_path(router, "/ingest").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");
    }
}
