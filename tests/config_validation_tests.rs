//! Integration tests for job payload parsing and validation.

use std::time::Duration;

use http_science::config::{ConfigError, JobConfig, JobKind, DEFAULT_IGNORED_HEADERS};
use http_science::config_validation::ValidationError;
use http_science::gate::UNLIMITED;

fn validation_error(payload: &str) -> ValidationError {
    match JobConfig::from_arg(payload) {
        Err(ConfigError::Invalid(e)) => e,
        other => panic!("expected a validation error, got {:?}", other.map(|c| c.kind)),
    }
}

#[test]
fn test_full_correctness_payload() {
    let config = JobConfig::from_arg(
        r#"{
            "job_type": "correctness",
            "source": "file:///data/replay/api",
            "control_url": "https://control.internal:443",
            "experiment_url": "https://experiment.internal:443",
            "diff_loc": "/data/diffs/api.log",
            "weak_equal": true,
            "ignored_headers": ["X-Trace-Id", "ETag"],
            "concurrency": 8,
            "reqs": 5000,
            "job_number": 2,
            "total_jobs": 4,
            "methods": "GET,POST",
            "start_before": "2016/05/01:13",
            "email": "oncall@example.com",
            "disallow_url_regex": ["^/health"],
            "putback_url": "http://jobs.internal/v1/jobs/17",
            "forward_timeout": "5s",
            "skip_tls_verify": false
        }"#,
    )
    .unwrap();

    assert_eq!(
        config.kind,
        JobKind::Correctness {
            control_url: "https://control.internal:443".to_string(),
            experiment_url: "https://experiment.internal:443".to_string(),
            diff_loc: "/data/diffs/api.log".to_string(),
            weak_equal: true,
        }
    );
    assert_eq!(config.source, "file:///data/replay/api/");
    assert_eq!(config.speed, 10_000);
    assert_eq!(config.gate_permits(), 8);
    assert_eq!(config.reqs, 5000);
    assert_eq!((config.job_number, config.total_jobs), (2, 4));
    assert_eq!(config.methods, vec!["GET", "POST"]);
    assert_eq!(config.forward_timeout, Duration::from_secs(5));
    assert!(!config.tls.skip_verify);
    assert_eq!(
        config.ignored_headers().len(),
        DEFAULT_IGNORED_HEADERS.len() + 2
    );
    assert_eq!(config.diff_loc(), Some("/data/diffs/api.log"));
}

#[test]
fn test_minimal_load_payload() {
    let config = JobConfig::from_arg(
        r#"{"job_type": "load", "source": "/data/replay", "load_url": "http://load:8080", "speed": 250}"#,
    )
    .unwrap();
    assert_eq!(config.kind.label(), "load");
    assert_eq!(config.speed, 250);
    assert_eq!(config.gate_permits(), UNLIMITED);
    assert_eq!(config.diff_loc(), None);
}

#[test]
fn test_zero_counts_mean_unset() {
    let config = JobConfig::from_arg(
        r#"{"job_type": "load", "source": "/d", "load_url": "http://l:1", "speed": 0, "reqs": 0,
            "job_number": 0, "total_jobs": 0}"#,
    )
    .unwrap();
    assert_eq!(config.speed, 100);
    assert_eq!(config.reqs, 1000);
    assert_eq!((config.job_number, config.total_jobs), (1, 1));
}

#[test]
fn test_missing_job_type() {
    let err = validation_error(r#"{"source": "/d"}"#);
    assert!(err.to_string().contains("job_type"));
}

#[test]
fn test_missing_source() {
    let err = validation_error(r#"{"job_type": "load", "load_url": "http://l:1"}"#);
    assert!(matches!(err, ValidationError::RequiredField { ref field } if field == "source"));
}

#[test]
fn test_correctness_with_speed() {
    let err = validation_error(
        r#"{"job_type": "correctness", "source": "/d", "control_url": "http://c:1",
            "experiment_url": "http://e:1", "diff_loc": "/o", "speed": 50}"#,
    );
    assert!(err.to_string().contains("use concurrency"));
}

#[test]
fn test_bad_start_before() {
    let err = validation_error(
        r#"{"job_type": "load", "source": "/d", "load_url": "http://l:1", "start_before": "2016-05-01T13"}"#,
    );
    assert!(err.to_string().contains("yyyy/mm/dd:hh"));
}

#[test]
fn test_bad_regex() {
    let err = validation_error(
        r#"{"job_type": "load", "source": "/d", "load_url": "http://l:1", "allow_url_regex": ["(unclosed"]}"#,
    );
    assert!(err.to_string().contains("allow_url_regex"));
}

#[test]
fn test_bad_method() {
    let err = validation_error(
        r#"{"job_type": "load", "source": "/d", "load_url": "http://l:1", "methods": "GET,FETCH"}"#,
    );
    assert!(err.to_string().contains("FETCH"));
}

#[test]
fn test_bad_listen_addr() {
    let err = validation_error(
        r#"{"job_type": "load", "source": "/d", "load_url": "http://l:1", "listen_addr": "localhost"}"#,
    );
    assert!(err.to_string().contains("listen_addr"));
}

#[test]
fn test_zero_forward_timeout() {
    let err = validation_error(
        r#"{"job_type": "load", "source": "/d", "load_url": "http://l:1", "forward_timeout": "0s"}"#,
    );
    assert!(err.to_string().contains("forward_timeout"));
}

#[test]
fn test_missing_payload_file() {
    assert!(matches!(
        JobConfig::from_arg("/definitely/not/a/payload.yaml"),
        Err(ConfigError::Read(_))
    ));
}
