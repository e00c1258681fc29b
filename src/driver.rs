//! The replay pipeline: discovery feeds files to the traffic generator until
//! the request target is met or the files run out.

use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::compare::{CompareMode, ResponseComparator};
use crate::config::{JobConfig, JobKind};
use crate::errors::JobError;
use crate::forward::Forwarder;
use crate::gate::ConcurrencyGate;
use crate::generator::TrafficGenerator;
use crate::listener::{InFlight, Listener, ReplayHandler};
use crate::locator::FileLocator;
use crate::metrics::FILES_REPLAYED_TOTAL;
use crate::results::{FileSink, Results};
use crate::science::{CorrectnessTest, LoadTest};
use crate::storage::ObjectStore;
use crate::tls::build_connector;

/// Capacity of the channel between discovery and replay.
pub const FILE_QUEUE_CAPACITY: usize = 10;

/// Why a replay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOutcome {
    /// The number of counted requests reached the job's `reqs`.
    TargetReached,
    /// Every file of this shard was replayed first.
    RanOutOfFiles,
    /// The run stopped on an error after it started recording results.
    Failed,
}

impl fmt::Display for ReplayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayOutcome::TargetReached => write!(f, "target reached"),
            ReplayOutcome::RanOutOfFiles => write!(f, "ran out of files"),
            ReplayOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Feeds discovered files to the generator one at a time.
pub struct ReplayDriver {
    pub generator: Arc<dyn TrafficGenerator>,
    pub results: Arc<Results>,
    pub in_flight: Arc<InFlight>,
    pub reqs: u64,
    pub kind: JobKind,
}

impl ReplayDriver {
    /// Runs until the target is met or `files` is exhausted, then waits for
    /// in-flight requests to finish. An error on `fatal` ends the run.
    pub async fn run(
        &self,
        mut files: mpsc::Receiver<PathBuf>,
        mut fatal: mpsc::UnboundedReceiver<JobError>,
    ) -> Result<ReplayOutcome, JobError> {
        let outcome = loop {
            let next = tokio::select! {
                biased;
                Some(e) = fatal.recv() => return Err(e),
                next = files.recv() => next,
            };
            let Some(file) = next else {
                break ReplayOutcome::RanOutOfFiles;
            };

            let replayed = tokio::select! {
                biased;
                Some(e) = fatal.recv() => {
                    remove_local(&file).await;
                    return Err(e);
                }
                replayed = self.generator.replay(&file) => replayed,
            };
            remove_local(&file).await;
            replayed?;
            FILES_REPLAYED_TOTAL.inc();

            self.log_progress(&file);
            if self.results.requests() >= self.reqs {
                break ReplayOutcome::TargetReached;
            }
        };
        drop(files);

        self.in_flight.drained().await;
        if let Ok(e) = fatal.try_recv() {
            return Err(e);
        }
        info!(outcome = %outcome, requests = self.results.requests(), "Replay finished");
        Ok(outcome)
    }

    fn log_progress(&self, file: &Path) {
        let requests = self.results.requests();
        let file = file.display().to_string();
        match &self.kind {
            JobKind::Load { load_url } => {
                info!(
                    load_url = %load_url,
                    requests = requests,
                    target = self.reqs,
                    file = %file,
                    "replay-progress"
                );
            }
            JobKind::Correctness {
                control_url,
                experiment_url,
                ..
            } => {
                info!(
                    control_url = %control_url,
                    experiment_url = %experiment_url,
                    requests = requests,
                    diffs = self.results.diffs(),
                    target = self.reqs,
                    file = %file,
                    "replay-progress"
                );
            }
        }
    }
}

async fn remove_local(file: &Path) {
    if let Err(e) = tokio::fs::remove_file(file).await {
        warn!(file = %file.display(), error = %e, "Failed to remove replayed file");
    }
}

/// A replay that got as far as recording results.
///
/// `outcome` holds the error that ended the run early, if any. The results
/// recorded up to that point are still in `results` and must be finalized.
pub struct JobRun {
    pub outcome: Result<ReplayOutcome, JobError>,
    pub results: Arc<Results>,
    pub elapsed: Duration,
}

/// Runs a whole job: starts the listener, discovers and replays traffic and
/// stops the listener once every request has been handled.
///
/// `make_generator` receives the address the listener is bound to. An `Err`
/// means the job failed before any request was handled; failures after that
/// point are returned in [`JobRun::outcome`].
pub async fn run_job<F>(
    config: &JobConfig,
    store: Arc<dyn ObjectStore>,
    make_generator: F,
) -> Result<JobRun, JobError>
where
    F: FnOnce(SocketAddr) -> Arc<dyn TrafficGenerator>,
{
    let start = Instant::now();
    let forwarder = Forwarder::new(build_connector(&config.tls)?, config.forward_timeout);
    let strip = config.ignored_headers();
    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

    let (results, handler): (Arc<Results>, Arc<dyn ReplayHandler>) = match &config.kind {
        JobKind::Correctness {
            control_url,
            experiment_url,
            weak_equal,
            ..
        } => {
            let log_path = config.work_dir.join(format!(
                "http-science-diffs-{}-{}.log",
                std::process::id(),
                config.job_number
            ));
            let sink = FileSink::create(&log_path).map_err(JobError::DiffLog)?;
            let results = Arc::new(Results::for_correctness(Box::new(sink)));
            let handler = CorrectnessTest {
                control_url: control_url.clone(),
                experiment_url: experiment_url.clone(),
                forwarder,
                comparator: ResponseComparator::new(&strip, CompareMode::from_weak(*weak_equal)),
                strip,
                results: Arc::clone(&results),
                gate: ConcurrencyGate::new(config.gate_permits()),
                fatal: fatal_tx.clone(),
            };
            (results, Arc::new(handler))
        }
        JobKind::Load { load_url } => {
            let results = Arc::new(Results::for_load());
            let handler = LoadTest {
                load_url: load_url.clone(),
                forwarder,
                strip,
                results: Arc::clone(&results),
            };
            (results, Arc::new(handler))
        }
    };

    let listener = Listener::bind(config.listen_addr, handler, fatal_tx)?;
    let generator = make_generator(listener.local_addr());

    let locator = FileLocator::from_config(config, store)?;
    let (files_tx, files_rx) = mpsc::channel(FILE_QUEUE_CAPACITY);
    let discovery = tokio::spawn(locator.run(files_tx));

    let driver = ReplayDriver {
        generator,
        results: Arc::clone(&results),
        in_flight: listener.in_flight(),
        reqs: config.reqs,
        kind: config.kind.clone(),
    };
    let outcome = driver.run(files_rx, fatal_rx).await;

    let stopped = listener.shutdown().await;
    let discovered = match discovery.await {
        Ok(discovered) => discovered.map_err(JobError::from),
        Err(e) => Err(JobError::from(e)),
    };
    let outcome = outcome.and_then(|outcome| {
        stopped?;
        discovered?;
        Ok(outcome)
    });

    Ok(JobRun {
        outcome,
        results,
        elapsed: start.elapsed(),
    })
}
