use serde_json::json;
use serial_test::serial;
use std::io::Read;
use std::sync::{Arc, Once};
use tokio::sync::mpsc;
use tokio::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use http_science::compare::{CompareMode, ResponseComparator};
use http_science::config::DEFAULT_IGNORED_HEADERS;
use http_science::errors::JobError;
use http_science::forward::{Forwarder, EXPERIMENT_SENTINEL};
use http_science::gate::ConcurrencyGate;
use http_science::listener::Listener;
use http_science::metrics::{register_metrics, GATE_REJECTIONS_TOTAL};
use http_science::results::{MemorySink, Results};
use http_science::science::CorrectnessTest;
use http_science::tls::{build_connector, TlsSettings};

static INIT_METRICS: Once = Once::new();

fn init_metrics() {
    INIT_METRICS.call_once(|| {
        register_metrics().expect("Failed to register metrics");
    });
}

struct Harness {
    listener: Listener,
    results: Arc<Results>,
    _fatal_rx: mpsc::UnboundedReceiver<JobError>,
}

impl Harness {
    fn start(control_url: &str, experiment_url: &str, mode: CompareMode, permits: i64) -> Self {
        init_metrics();
        let tls = build_connector(&TlsSettings {
            skip_verify: true,
            ..TlsSettings::default()
        })
        .unwrap();
        let strip: Vec<String> = DEFAULT_IGNORED_HEADERS
            .iter()
            .map(|h| h.to_string())
            .collect();
        let results = Arc::new(Results::for_correctness(Box::new(MemorySink::new())));
        let (fatal, fatal_rx) = mpsc::unbounded_channel();

        let handler = CorrectnessTest {
            control_url: control_url.to_string(),
            experiment_url: experiment_url.to_string(),
            forwarder: Forwarder::new(tls, Duration::from_secs(5)),
            comparator: ResponseComparator::new(&strip, mode),
            strip,
            results: Arc::clone(&results),
            gate: ConcurrencyGate::new(permits),
            fatal: fatal.clone(),
        };
        let listener =
            Listener::bind("127.0.0.1:0".parse().unwrap(), Arc::new(handler), fatal).unwrap();

        Self {
            listener,
            results,
            _fatal_rx: fatal_rx,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.listener.local_addr(), path)
    }

    async fn replay(&self, path: &str) {
        let response = reqwest::get(self.url(path)).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "OK");
    }

    async fn finish(self) -> (Arc<Results>, String) {
        self.listener.in_flight().drained().await;
        self.listener.shutdown().await.unwrap();
        let mut log = String::new();
        self.results
            .seal()
            .unwrap()
            .unwrap()
            .read_to_string(&mut log)
            .unwrap();
        (self.results, log)
    }
}

async fn serve(body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/things"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    server
}

async fn serve_json(value: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(value))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn differing_bodies_are_recorded_as_one_diff() {
    let control = serve("control").await;
    let experiment = serve("exp").await;
    let harness = Harness::start(&control.uri(), &experiment.uri(), CompareMode::Strict, -1);

    harness.replay("/v1/things").await;
    let (results, log) = harness.finish().await;

    assert_eq!(results.requests(), 1);
    assert_eq!(results.diffs(), 1);
    assert_eq!(results.codes().len(), 1);
    assert_eq!(results.codes()[&200][&200], 1);
    assert!(log.starts_with("=== diff ===\nGET /v1/things HTTP/1.1\r\n"));
    assert!(log.contains("control"));
    assert!(log.contains("exp"));
    assert!(log.ends_with("============\n"));
}

#[tokio::test]
async fn identical_responses_never_count_as_diffs() {
    let control = serve("same").await;
    let experiment = serve("same").await;
    let harness = Harness::start(&control.uri(), &experiment.uri(), CompareMode::Strict, -1);

    for _ in 0..5 {
        harness.replay("/v1/things").await;
    }
    let (results, log) = harness.finish().await;

    assert_eq!(results.requests(), 5);
    assert_eq!(results.diffs(), 0);
    assert!(results.codes().is_empty());
    assert!(log.is_empty());
}

#[tokio::test]
async fn unreachable_experiment_becomes_sentinel() {
    let control = serve("control").await;
    let harness = Harness::start(
        &control.uri(),
        "localhost:not_a_port",
        CompareMode::Strict,
        -1,
    );

    harness.replay("/v1/things").await;
    let (results, log) = harness.finish().await;

    assert_eq!(results.diffs(), 1);
    let codes = results.codes();
    assert_eq!(codes.len(), 1);
    assert_eq!(codes[&-1].len(), 1);
    assert_eq!(codes[&-1][&200], 1);
    assert!(log.contains(EXPERIMENT_SENTINEL));
}

#[tokio::test]
async fn weak_mode_ignores_array_order() {
    let control = serve_json(json!({"a": [1, 2, 3]})).await;
    let experiment = serve_json(json!({"a": [3, 2, 1]})).await;

    let weak = Harness::start(&control.uri(), &experiment.uri(), CompareMode::Weak, -1);
    weak.replay("/v1/things").await;
    let (results, _) = weak.finish().await;
    assert_eq!(results.diffs(), 0);

    let strict = Harness::start(&control.uri(), &experiment.uri(), CompareMode::Strict, -1);
    strict.replay("/v1/things").await;
    let (results, _) = strict.finish().await;
    assert_eq!(results.diffs(), 1);
}

#[tokio::test]
async fn key_order_and_formatting_do_not_matter() {
    let control = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"a":1,"b":{"c":true}}"#))
        .mount(&control)
        .await;
    let experiment = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("{ \"b\": { \"c\": true },\n \"a\": 1.0 }"),
        )
        .mount(&experiment)
        .await;

    let harness = Harness::start(&control.uri(), &experiment.uri(), CompareMode::Strict, -1);
    harness.replay("/").await;
    let (results, _) = harness.finish().await;
    assert_eq!(results.diffs(), 0);
}

#[tokio::test]
async fn volatile_headers_are_ignored() {
    let control = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Request-Id", "aaa")
                .set_body_string("ok"),
        )
        .mount(&control)
        .await;
    let experiment = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Request-Id", "bbb")
                .set_body_string("ok"),
        )
        .mount(&experiment)
        .await;

    let harness = Harness::start(&control.uri(), &experiment.uri(), CompareMode::Strict, -1);
    harness.replay("/").await;
    let (results, _) = harness.finish().await;
    assert_eq!(results.diffs(), 0);
}

#[tokio::test]
async fn other_header_differences_are_diffs() {
    let control = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Cache-Control", "no-cache")
                .set_body_string("ok"),
        )
        .mount(&control)
        .await;
    let experiment = serve_json(json!("ok")).await;

    let harness = Harness::start(&control.uri(), &experiment.uri(), CompareMode::Strict, -1);
    harness.replay("/").await;
    let (results, log) = harness.finish().await;
    assert_eq!(results.diffs(), 1);
    assert!(!log.to_ascii_lowercase().contains("date:"));
    assert!(!log.to_ascii_lowercase().contains("content-length:"));
}

#[tokio::test]
async fn status_differences_are_histogrammed_by_experiment_then_control() {
    let control = serve("x").await;
    let experiment = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("x"))
        .mount(&experiment)
        .await;

    let harness = Harness::start(&control.uri(), &experiment.uri(), CompareMode::Strict, -1);
    harness.replay("/v1/things").await;
    harness.replay("/v1/things").await;
    let (results, _) = harness.finish().await;
    assert_eq!(results.codes()[&503][&200], 2);
}

#[tokio::test]
#[serial]
async fn admission_gate_caps_in_flight_requests() {
    let slow = |body: &'static str| {
        ResponseTemplate::new(200)
            .set_body_string(body)
            .set_delay(Duration::from_millis(800))
    };
    let control = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(slow("same"))
        .mount(&control)
        .await;
    let experiment = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(slow("same"))
        .mount(&experiment)
        .await;

    let harness = Harness::start(&control.uri(), &experiment.uri(), CompareMode::Strict, 2);
    let rejected_before = GATE_REJECTIONS_TOTAL.get();

    let url = harness.url("/");
    let sends = (0..6).map(|_| {
        let url = url.clone();
        tokio::spawn(async move { reqwest::get(url).await.unwrap().status() })
    });
    for send in sends.collect::<Vec<_>>() {
        assert_eq!(send.await.unwrap(), 200);
    }
    let (results, _) = harness.finish().await;

    let admitted = results.requests();
    assert!((1..=2).contains(&admitted), "admitted {}", admitted);
    assert_eq!(GATE_REJECTIONS_TOTAL.get() - rejected_before, 6 - admitted);
    let forwarded = control.received_requests().await.unwrap().len() as u64;
    assert_eq!(forwarded, admitted);
}

#[tokio::test]
async fn request_body_reaches_both_targets() {
    let control = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/things"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&control)
        .await;
    let experiment = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/things"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&experiment)
        .await;

    let harness = Harness::start(&control.uri(), &experiment.uri(), CompareMode::Strict, -1);
    let response = reqwest::Client::new()
        .post(harness.url("/v1/things"))
        .body("name=widget")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let (results, _) = harness.finish().await;
    assert_eq!(results.diffs(), 0);

    for server in [&control, &experiment] {
        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, b"name=widget");
    }
}
