use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, Version};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_rustls::TlsAcceptor;
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use http_science::errors::{ErrorCategory, ForwardError};
use http_science::forward::{CapturedRequest, Forwarder};
use http_science::tls::{build_connector, TlsSettings};

fn forwarder(timeout: Duration) -> Forwarder {
    let tls = build_connector(&TlsSettings {
        skip_verify: true,
        ..TlsSettings::default()
    })
    .unwrap();
    Forwarder::new(tls, timeout)
}

fn request(method: Method, uri: &str, body: &'static str) -> CapturedRequest {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    CapturedRequest {
        method,
        uri: uri.parse().unwrap(),
        version: Version::HTTP_11,
        headers,
        body: Bytes::from_static(body.as_bytes()),
    }
}

fn cleanup() -> Vec<String> {
    ["Date", "Content-Length", "Transfer-Encoding"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}

#[tokio::test]
async fn forwards_method_path_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/items/7"))
        .and(query_param("dry_run", "true"))
        .and(header("content-type", "application/json"))
        .and(body_string(r#"{"name":"x"}"#))
        .respond_with(ResponseTemplate::new(202).set_body_string("accepted"))
        .expect(1)
        .mount(&server)
        .await;

    let response = forwarder(Duration::from_secs(5))
        .forward(
            &request(Method::PUT, "/v1/items/7?dry_run=true", r#"{"name":"x"}"#),
            &server.uri(),
            &cleanup(),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 202);
    assert_eq!(&response.body[..], b"accepted");
    assert!(response.dump.starts_with("HTTP/1.1 202 Accepted\r\n"));
    assert!(response.dump.ends_with("\r\n\r\naccepted"));
}

#[tokio::test]
async fn cleanup_headers_are_stripped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Version", "42")
                .set_body_string("hello"),
        )
        .mount(&server)
        .await;

    let response = forwarder(Duration::from_secs(5))
        .forward(&request(Method::GET, "/", ""), &server.uri(), &cleanup())
        .await
        .unwrap();

    assert!(response.headers.get("date").is_none());
    assert!(response.headers.get("content-length").is_none());
    assert_eq!(response.headers.get("x-version").unwrap(), "42");
    let dump = response.dump.to_ascii_lowercase();
    assert!(!dump.contains("date:"));
    assert!(!dump.contains("content-length:"));
    assert!(dump.contains("x-version: 42"));
}

#[tokio::test]
async fn slow_targets_time_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let err = forwarder(Duration::from_millis(100))
        .forward(&request(Method::GET, "/", ""), &server.uri(), &cleanup())
        .await
        .unwrap_err();
    assert!(matches!(err, ForwardError::Timeout { .. }));
    assert_eq!(err.category(), ErrorCategory::TimeoutError);
}

#[tokio::test]
async fn refused_connections_are_network_errors() {
    let err = forwarder(Duration::from_secs(2))
        .forward(&request(Method::GET, "/", ""), "http://127.0.0.1:9", &cleanup())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NetworkError);
}

#[tokio::test]
async fn malformed_targets_are_target_errors() {
    let err = forwarder(Duration::from_secs(2))
        .forward(&request(Method::GET, "/", ""), "localhost:not_a_port", &cleanup())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::TargetError);
}

/// Starts an HTTPS server with a self-signed certificate for `localhost`.
/// It answers every request with `secure <path>`.
async fn self_signed_target() -> String {
    let certs = rustls_pemfile::certs(&mut &include_bytes!("fixtures/localhost.crt")[..])
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut &include_bytes!("fixtures/localhost.key")[..])
        .unwrap()
        .unwrap();
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let service = service_fn(|req: Request<Body>| async move {
                    let body = format!("secure {}", req.uri().path());
                    Ok::<_, Infallible>(Response::new(Body::from(body)))
                });
                let _ = Http::new().serve_connection(tls, service).await;
            });
        }
    });
    format!("https://localhost:{}", port)
}

#[tokio::test]
async fn https_targets_with_untrusted_certificates_are_accepted() {
    let target = self_signed_target().await;

    let response = forwarder(Duration::from_secs(5))
        .forward(&request(Method::GET, "/v1/secure", ""), &target, &cleanup())
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"secure /v1/secure");
}

#[tokio::test]
async fn https_to_a_plain_http_server_is_a_tls_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let target = server.uri().replacen("http://", "https://", 1);

    let err = forwarder(Duration::from_secs(5))
        .forward(&request(Method::GET, "/", ""), &target, &cleanup())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::TlsError);
}
