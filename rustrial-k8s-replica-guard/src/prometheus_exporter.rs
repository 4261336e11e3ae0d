use http_body_util::Full;
use hyper::{
    Request, Response, StatusCode,
    body::Bytes,
    header::{CONTENT_TYPE, HeaderValue},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::{convert::Infallible, net::SocketAddr};
use tokio::net::TcpListener;

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::default());
    *response.status_mut() = code;
    response
}

async fn serve_req<B>(
    req: Request<B>,
    registry: Registry,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() != "/metrics" {
        return Ok(status(StatusCode::NOT_FOUND));
    }
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut result = Vec::new();
    match encoder.encode(&metric_families, &mut result) {
        Ok(_) => {
            let mut response = Response::new(Full::new(Bytes::from(result)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
            Ok(response)
        }
        Err(e) => {
            error!("{}", e);
            Ok(status(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

/// Serve the metrics of `registry` on `http://{addr}/metrics`.
///
/// Only returns if the listener fails.
pub(crate) async fn start_prometheus_metrics_server(
    addr: SocketAddr,
    registry: Registry,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    debug!("Listening on http://{}", addr);
    loop {
        let (stream, _) = listener.accept().await?;
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| serve_req(req, registry.clone()));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection failed: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use prometheus::IntCounter;

    fn registry() -> Registry {
        let registry = Registry::new();
        let counter = IntCounter::new("replica_guard_test_total", "test counter").unwrap();
        counter.inc();
        registry.register(Box::new(counter)).unwrap();
        registry
    }

    #[tokio::test]
    async fn metrics_are_rendered_as_text() {
        let req = Request::builder().uri("/metrics").body(()).unwrap();
        let response = serve_req(req, registry()).await.unwrap();
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(
            prometheus::TEXT_FORMAT,
            response.headers()[CONTENT_TYPE].to_str().unwrap()
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("replica_guard_test_total 1"), "{}", body);
    }

    #[tokio::test]
    async fn other_paths_are_not_found() {
        let req = Request::builder().uri("/healthz").body(()).unwrap();
        let response = serve_req(req, registry()).await.unwrap();
        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }
}
