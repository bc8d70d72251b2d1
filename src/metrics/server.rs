//! HTTP server for Prometheus metrics endpoint

use super::Metrics;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// HTTP server that exposes Prometheus metrics
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics server listening on http://{}/metrics", self.addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = metrics.clone();
                    async move { Ok::<_, Infallible>(handle_request(&req, &metrics)) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

fn handle_request<B>(req: &Request<B>, metrics: &Metrics) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => match metrics.render() {
            Ok(text) => respond(StatusCode::OK, TEXT_FORMAT, text),
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    "Failed to encode metrics",
                )
            }
        },
        "/health" | "/healthz" => respond(StatusCode::OK, "text/plain", "OK"),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[test]
    fn test_routes() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(handle_request(&get("/metrics"), &metrics).status(), StatusCode::OK);
        assert_eq!(handle_request(&get("/health"), &metrics).status(), StatusCode::OK);
        assert_eq!(
            handle_request(&get("/nope"), &metrics).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_metrics_content_type() {
        let metrics = Metrics::new().unwrap();
        let response = handle_request(&get("/metrics"), &metrics);
        assert_eq!(
            response.headers()[hyper::header::CONTENT_TYPE],
            TEXT_FORMAT
        );
    }
}
