//! End-of-job reporting: persists the diff log and sends the job report.

use serde::Serialize;
use std::io::Read;
use tracing::{error, info, warn};

use crate::config::{JobConfig, JobKind};
use crate::driver::{JobRun, ReplayOutcome};
use crate::errors::JobError;
use crate::results::{Codes, Results};
use crate::storage::ObjectStore;

/// Summary of a finished job, sent to the putback URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job_type: String,
    pub requests: u64,
    pub diffs: u64,
    pub codes: Codes,
    pub outcome: ReplayOutcome,
    pub elapsed_secs: f64,
    pub diff_loc: Option<String>,
    pub email: Option<String>,
}

/// Logs the results, writes the diff log to `diff_loc` through `store` and
/// notifies the putback URL.
///
/// A run that ended on an error is finalized too, so the diffs recorded before
/// the failure are kept; its error is returned once that is done. The only
/// exception is a broken diff log, which is not persisted. Failing to persist
/// the diff log is fatal. A failed putback is only logged.
pub async fn finalize(
    config: &JobConfig,
    run: JobRun,
    store: &dyn ObjectStore,
) -> Result<JobReport, JobError> {
    let JobRun {
        outcome,
        results,
        elapsed,
    } = run;
    let (outcome, failure) = match outcome {
        Ok(outcome) => (outcome, None),
        Err(e) => {
            error!(error = %e, "Replay stopped early, finalizing partial results");
            (ReplayOutcome::Failed, Some(e))
        }
    };

    let snapshot = results.snapshot();
    info!(
        requests = snapshot.requests,
        elapsed_secs = elapsed.as_secs_f64(),
        outcome = %outcome,
        "Job finished"
    );

    if let JobKind::Correctness {
        diff_loc,
        weak_equal,
        ..
    } = &config.kind
    {
        info!(
            diffs = snapshot.diffs,
            codes = ?snapshot.codes,
            weak_equal = weak_equal,
            "Correctness results"
        );
        if matches!(failure, Some(JobError::DiffLog(_))) {
            warn!(diff_loc = %diff_loc, "Diff log is broken, not persisting it");
        } else {
            persist_diff_log(&results, diff_loc, store).await?;
        }
    }

    let report = JobReport {
        job_type: config.kind.label().to_string(),
        requests: snapshot.requests,
        diffs: snapshot.diffs,
        codes: snapshot.codes,
        outcome,
        elapsed_secs: elapsed.as_secs_f64(),
        diff_loc: config.diff_loc().map(str::to_string),
        email: config.email.clone(),
    };

    if let Some(url) = &config.putback_url {
        match send_putback(url, &report).await {
            Ok(()) => info!(url = %url, "Sent job report"),
            Err(e) => warn!(url = %url, error = %e, "Failed to send job report"),
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(report),
    }
}

async fn persist_diff_log(
    results: &Results,
    diff_loc: &str,
    store: &dyn ObjectStore,
) -> Result<(), JobError> {
    let mut data = Vec::new();
    if let Some(mut log) = results.seal().map_err(JobError::DiffLog)? {
        log.read_to_end(&mut data).map_err(JobError::DiffLog)?;
    }
    store
        .write(diff_loc, &data)
        .await
        .map_err(|source| JobError::Persist {
            location: diff_loc.to_string(),
            source,
        })?;
    info!(diff_loc = %diff_loc, bytes = data.len(), "Diff log written");
    Ok(())
}

async fn send_putback(url: &str, report: &JobReport) -> Result<(), reqwest::Error> {
    reqwest::Client::new()
        .put(url)
        .json(report)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
