use std::sync::{Arc, Mutex};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use http_science::config::JobConfig;
use http_science::driver::run_job;
use http_science::errors::JobError;
use http_science::finalize::finalize;
use http_science::generator::{GorGenerator, TrafficGenerator};
use http_science::metrics::{gather_metrics_string, register_metrics, start_metrics_server};
use http_science::storage::store_for;

/// Prints helpful payload documentation.
fn print_payload_help() {
    eprintln!("Usage: http-science '<json payload>' | <payload.yaml>");
    eprintln!();
    eprintln!("Required fields:");
    eprintln!("  job_type            - load or correctness");
    eprintln!("  source              - Root of the yyyy/mm/dd/hh traffic tree (path or file:// URI)");
    eprintln!("    correctness jobs:");
    eprintln!("      control_url     - Baseline target (http:// or https://)");
    eprintln!("      experiment_url  - Target under test (http:// or https://)");
    eprintln!("      diff_loc        - Where the diff log is written");
    eprintln!("    load jobs:");
    eprintln!("      load_url        - Target (http:// or https://)");
    eprintln!();
    eprintln!("Optional fields:");
    eprintln!("  reqs                - Requests to replay before stopping (default: 1000)");
    eprintln!("  speed               - Replay speed in percent, load jobs only (default: 100)");
    eprintln!("  concurrency         - Max in-flight requests; replays at full speed, excludes speed");
    eprintln!("  methods             - Comma-separated methods to replay (default: GET)");
    eprintln!("  weak_equal          - Ignore JSON array order when comparing (default: false)");
    eprintln!("  ignored_headers     - Extra header names ignored when comparing");
    eprintln!("  job_number/total_jobs - Shard of the traffic files to replay (default: 1/1)");
    eprintln!("  start_before        - Only replay hours up to yyyy/mm/dd:hh");
    eprintln!("  allow_url_regex     - Only replay URLs matching these regexes");
    eprintln!("  disallow_url_regex  - Skip URLs matching these regexes");
    eprintln!("  putback_url         - Receives the JSON job report via PUT");
    eprintln!("  email               - Included in the job report");
    eprintln!();
    eprintln!("Runtime fields:");
    eprintln!("  listen_addr         - Address of the replay listener (default: 127.0.0.1:8000)");
    eprintln!("  generator           - Traffic generator binary (default: gor)");
    eprintln!("  forward_timeout     - Per-forward timeout: 500ms, 30s, 1m (default: 30s)");
    eprintln!("  skip_tls_verify     - Skip target certificate verification (default: true)");
    eprintln!("  client_cert_path    - Client certificate for mTLS towards targets");
    eprintln!("  client_key_path     - Client key for mTLS towards targets");
    eprintln!("  metrics_addr        - Serve Prometheus metrics on this address");
    eprintln!("  work_dir            - Local scratch directory (default: system temp dir)");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RUST_LOG            - Log filter (default: info)");
    eprintln!("  LOG_FORMAT          - Set to json for JSON logs");
    eprintln!("  METRIC_NAMESPACE    - Prometheus metric namespace (default: http_science)");
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

async fn run(config: JobConfig) -> Result<(), JobError> {
    register_metrics()?;
    let registry = Arc::new(Mutex::new(prometheus::default_registry().clone()));
    if let Some(addr) = config.metrics_addr {
        let registry = registry.clone();
        tokio::spawn(async move {
            start_metrics_server(addr, registry).await;
        });
    }

    let source_store = store_for(&config.source)?;
    let output_store = store_for(config.diff_loc().unwrap_or(&config.source))?;

    config.log_summary();
    let generator_config = config.clone();
    let run = run_job(&config, source_store, move |addr| {
        Arc::new(GorGenerator::from_config(&generator_config, addr)) as Arc<dyn TrafficGenerator>
    })
    .await?;

    finalize(&config, run, output_store.as_ref()).await?;

    info!(
        "\n--- FINAL METRICS ---\n{}--- END OF FINAL METRICS ---",
        gather_metrics_string(&registry)
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();

    let Some(arg) = std::env::args().nth(1) else {
        print_payload_help();
        std::process::exit(1);
    };

    let config = match JobConfig::from_arg(&arg) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, payload = %arg, "Invalid job payload");
            eprintln!();
            print_payload_help();
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!(error = %e, "Job failed");
        std::process::exit(1);
    }
}
