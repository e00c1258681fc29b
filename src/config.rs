use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config_validation::{
    CutoffValidator, DurationValidator, HttpMethodValidator, RangeValidator, RegexListValidator,
    UrlValidator, ValidationContext, ValidationError,
};
use crate::gate::UNLIMITED;
use crate::tls::TlsSettings;
use crate::utils::{dedup_case_insensitive, split_escaped_list};

/// Headers that vary between otherwise identical responses. Always ignored
/// when comparing and stripped from forwarded responses.
pub const DEFAULT_IGNORED_HEADERS: &[&str] =
    &["Date", "Content-Length", "Transfer-Encoding", "X-Request-Id"];

/// Cutoff used when `start_before` is not given: replays everything.
pub const OPEN_CUTOFF: &str = "9999/99/99:99";

pub const DEFAULT_SPEED: u64 = 100;
pub const CONCURRENCY_SPEED: u64 = 10_000;
pub const DEFAULT_REQS: u64 = 1000;
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_GENERATOR: &str = "gor";
pub const DEFAULT_FORWARD_TIMEOUT: &str = "30s";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read payload file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse payload file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid payload: {0}")]
    Invalid(#[from] ValidationError),
}

/// The job payload as submitted. Zero counts are treated as unset.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Payload {
    pub job_type: Option<String>,
    pub source: Option<String>,

    pub control_url: Option<String>,
    pub experiment_url: Option<String>,
    pub diff_loc: Option<String>,
    pub weak_equal: bool,
    pub ignored_headers: Vec<String>,

    pub load_url: Option<String>,

    pub speed: Option<u64>,
    pub concurrency: Option<u64>,
    pub reqs: Option<u64>,
    pub job_number: Option<u64>,
    pub total_jobs: Option<u64>,
    pub methods: Option<String>,
    pub start_before: Option<String>,
    pub email: Option<String>,
    pub allow_url_regex: Vec<String>,
    pub disallow_url_regex: Vec<String>,
    pub putback_url: Option<String>,

    pub listen_addr: Option<String>,
    pub generator: Option<String>,
    pub forward_timeout: Option<String>,
    pub skip_tls_verify: Option<bool>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub metrics_addr: Option<String>,
    pub work_dir: Option<String>,
}

/// What a job does with the replayed traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    /// Forward every request to one target.
    Load { load_url: String },

    /// Forward every request to control and experiment and record divergence.
    Correctness {
        control_url: String,
        experiment_url: String,
        diff_loc: String,
        weak_equal: bool,
    },
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::Load { .. } => "load",
            JobKind::Correctness { .. } => "correctness",
        }
    }
}

/// A validated job. Read-only for the whole run.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub kind: JobKind,
    /// Traffic root prefix, always ending in `/`.
    pub source: String,
    /// Extra header names to ignore, on top of [`DEFAULT_IGNORED_HEADERS`].
    pub extra_ignored_headers: Vec<String>,
    /// Replay speed as a percentage of recorded speed.
    pub speed: u64,
    pub concurrency: Option<u64>,
    pub reqs: u64,
    pub job_number: u64,
    pub total_jobs: u64,
    pub methods: Vec<String>,
    pub start_before: String,
    pub email: Option<String>,
    pub allow_url_regex: Vec<String>,
    pub disallow_url_regex: Vec<String>,
    pub putback_url: Option<String>,
    pub listen_addr: SocketAddr,
    pub generator: String,
    pub forward_timeout: Duration,
    pub tls: TlsSettings,
    pub metrics_addr: Option<SocketAddr>,
    pub work_dir: PathBuf,
}

impl Payload {
    /// Parses a payload given either inline as a JSON object or as the path
    /// of a YAML/JSON file.
    pub fn from_arg(arg: &str) -> Result<Self, ConfigError> {
        let trimmed = arg.trim_start();
        if trimmed.starts_with('{') {
            Ok(serde_json::from_str(trimmed)?)
        } else {
            let content = std::fs::read_to_string(arg)?;
            Ok(serde_yaml::from_str(&content)?)
        }
    }

    /// Checks every rule and fills in defaults. All problems are reported
    /// together.
    pub fn validate(self) -> Result<JobConfig, ConfigError> {
        let mut ctx = ValidationContext::new();

        let source = ctx.require("source", self.source.as_deref()).map(|s| {
            if s.ends_with('/') {
                s.to_string()
            } else {
                format!("{}/", s)
            }
        });

        let concurrency = self.concurrency.filter(|&c| c > 0);
        let speed = self.speed.filter(|&s| s > 0);

        let kind = match self.job_type.as_deref().map(str::trim) {
            Some("load") => {
                if speed.is_some() && concurrency.is_some() {
                    ctx.add_error(ValidationError::Conflict {
                        first: "speed".to_string(),
                        second: "concurrency".to_string(),
                        message: "set one of them, not both".to_string(),
                    });
                }
                ctx.require("load_url", self.load_url.as_deref())
                    .and_then(|url| ctx.check(UrlValidator::validate("load_url", url)).map(|_| url))
                    .map(|url| JobKind::Load {
                        load_url: url.to_string(),
                    })
            }
            Some("correctness") => {
                if speed.is_some() {
                    ctx.add_error(ValidationError::Conflict {
                        first: "job_type".to_string(),
                        second: "speed".to_string(),
                        message: "correctness jobs can't set speed, use concurrency".to_string(),
                    });
                }
                let control = ctx
                    .require("control_url", self.control_url.as_deref())
                    .and_then(|url| {
                        ctx.check(UrlValidator::validate("control_url", url))
                            .map(|_| url)
                    });
                let experiment = ctx
                    .require("experiment_url", self.experiment_url.as_deref())
                    .and_then(|url| {
                        ctx.check(UrlValidator::validate("experiment_url", url))
                            .map(|_| url)
                    });
                let diff_loc = ctx.require("diff_loc", self.diff_loc.as_deref());
                match (control, experiment, diff_loc) {
                    (Some(control), Some(experiment), Some(diff_loc)) => {
                        Some(JobKind::Correctness {
                            control_url: control.to_string(),
                            experiment_url: experiment.to_string(),
                            diff_loc: diff_loc.to_string(),
                            weak_equal: self.weak_equal,
                        })
                    }
                    _ => None,
                }
            }
            other => {
                ctx.add_error(ValidationError::InvalidEnum {
                    field: "job_type".to_string(),
                    value: other.unwrap_or("").to_string(),
                    expected: "load, correctness".to_string(),
                });
                None
            }
        };

        let speed = if concurrency.is_some() {
            CONCURRENCY_SPEED
        } else {
            speed.unwrap_or(DEFAULT_SPEED)
        };
        let reqs = self.reqs.filter(|&r| r > 0).unwrap_or(DEFAULT_REQS);

        let (job_number, total_jobs) = match (
            self.job_number.filter(|&n| n > 0),
            self.total_jobs.filter(|&n| n > 0),
        ) {
            (None, None) => (1, 1),
            (Some(job), Some(total)) => {
                ctx.check(RangeValidator::validate_u64(job, 1, total, "job_number"));
                (job, total)
            }
            (job, total) => {
                ctx.add_error(ValidationError::Conflict {
                    first: "job_number".to_string(),
                    second: "total_jobs".to_string(),
                    message: format!(
                        "both or neither must be set, got job_number {:?}, total_jobs {:?}",
                        job, total
                    ),
                });
                (1, 1)
            }
        };

        let methods = dedup_case_insensitive(
            split_escaped_list(self.methods.as_deref().unwrap_or("GET"))
                .into_iter()
                .map(|m| m.to_uppercase()),
        );
        if methods.is_empty() {
            ctx.add_error(ValidationError::RequiredField {
                field: "methods".to_string(),
            });
        }
        for method in &methods {
            ctx.check(HttpMethodValidator::validate(method));
        }

        let start_before = self
            .start_before
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| OPEN_CUTOFF.to_string());
        ctx.check(CutoffValidator::validate(&start_before));

        ctx.check(RegexListValidator::validate(
            "allow_url_regex",
            &self.allow_url_regex,
        ));
        ctx.check(RegexListValidator::validate(
            "disallow_url_regex",
            &self.disallow_url_regex,
        ));

        let putback_url = self.putback_url.filter(|u| !u.is_empty());
        if let Some(url) = &putback_url {
            ctx.check(UrlValidator::validate("putback_url", url));
        }

        let listen_addr = ctx.check(parse_addr(
            "listen_addr",
            self.listen_addr.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR),
        ));
        let metrics_addr = match self.metrics_addr.as_deref().filter(|a| !a.is_empty()) {
            Some(addr) => ctx.check(parse_addr("metrics_addr", addr)),
            None => None,
        };

        let forward_timeout = ctx.check(DurationValidator::validate_positive(
            "forward_timeout",
            self.forward_timeout
                .as_deref()
                .unwrap_or(DEFAULT_FORWARD_TIMEOUT),
        ));

        let client_cert_path = self.client_cert_path.filter(|p| !p.is_empty());
        let client_key_path = self.client_key_path.filter(|p| !p.is_empty());
        if client_cert_path.is_some() != client_key_path.is_some() {
            ctx.add_error(ValidationError::Conflict {
                first: "client_cert_path".to_string(),
                second: "client_key_path".to_string(),
                message: "client certificate and key must be provided together".to_string(),
            });
        }

        let generator = self
            .generator
            .filter(|g| !g.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_GENERATOR.to_string());

        ctx.into_result()?;

        // Every `None` below was recorded as an error above.
        match (source, kind, listen_addr, forward_timeout) {
            (Some(source), Some(kind), Some(listen_addr), Some(forward_timeout)) => Ok(JobConfig {
                kind,
                source,
                extra_ignored_headers: dedup_case_insensitive(&self.ignored_headers),
                speed,
                concurrency,
                reqs,
                job_number,
                total_jobs,
                methods,
                start_before,
                email: self.email.filter(|e| !e.is_empty()),
                allow_url_regex: self.allow_url_regex,
                disallow_url_regex: self.disallow_url_regex,
                putback_url,
                listen_addr,
                generator,
                forward_timeout,
                tls: TlsSettings {
                    skip_verify: self.skip_tls_verify.unwrap_or(true),
                    client_cert_path,
                    client_key_path,
                },
                metrics_addr,
                work_dir: self
                    .work_dir
                    .filter(|d| !d.is_empty())
                    .map(PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir),
            }),
            _ => Err(ValidationError::FieldError {
                field: "payload".to_string(),
                message: "incomplete payload".to_string(),
            }
            .into()),
        }
    }
}

fn parse_addr(field: &str, addr: &str) -> Result<SocketAddr, ValidationError> {
    addr.parse().map_err(|e| ValidationError::InvalidFormat {
        field: field.to_string(),
        message: format!("'{}' is not a socket address: {}", addr, e),
    })
}

impl JobConfig {
    /// Loads and validates the payload named by the first CLI argument.
    pub fn from_arg(arg: &str) -> Result<Self, ConfigError> {
        Payload::from_arg(arg)?.validate()
    }

    /// Headers ignored by the comparison and stripped from responses.
    pub fn ignored_headers(&self) -> Vec<String> {
        dedup_case_insensitive(
            DEFAULT_IGNORED_HEADERS
                .iter()
                .copied()
                .chain(self.extra_ignored_headers.iter().map(String::as_str)),
        )
    }

    /// Permit count for the admission gate.
    pub fn gate_permits(&self) -> i64 {
        self.concurrency
            .map(|c| i64::try_from(c).unwrap_or(i64::MAX))
            .unwrap_or(UNLIMITED)
    }

    pub fn diff_loc(&self) -> Option<&str> {
        match &self.kind {
            JobKind::Correctness { diff_loc, .. } => Some(diff_loc),
            JobKind::Load { .. } => None,
        }
    }

    /// Logs the effective configuration.
    pub fn log_summary(&self) {
        match &self.kind {
            JobKind::Load { load_url } => {
                info!(job_type = "load", load_url = %load_url, "Job target");
            }
            JobKind::Correctness {
                control_url,
                experiment_url,
                diff_loc,
                weak_equal,
            } => {
                info!(
                    job_type = "correctness",
                    control_url = %control_url,
                    experiment_url = %experiment_url,
                    diff_loc = %diff_loc,
                    weak_equal = weak_equal,
                    ignored_headers = ?self.ignored_headers(),
                    "Job targets"
                );
            }
        }
        info!(
            source = %self.source,
            speed = self.speed,
            concurrency = ?self.concurrency,
            reqs = self.reqs,
            job_number = self.job_number,
            total_jobs = self.total_jobs,
            methods = ?self.methods,
            start_before = %self.start_before,
            listen_addr = %self.listen_addr,
            forward_timeout = ?self.forward_timeout,
            skip_tls_verify = self.tls.skip_verify,
            mtls = self.tls.client_cert_path.is_some(),
            "Starting replay job"
        );
    }
}
