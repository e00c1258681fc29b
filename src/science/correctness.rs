use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::compare::ResponseComparator;
use crate::errors::JobError;
use crate::forward::{CapturedRequest, ForwardedResponse, Forwarder, Side};
use crate::gate::ConcurrencyGate;
use crate::listener::{FatalSender, ReplayHandler};
use crate::metrics::{
    FORWARD_ERRORS_TOTAL, GATE_REJECTIONS_TOTAL, REPLAY_DIFFS_TOTAL, REPLAY_REQUESTS_TOTAL,
};
use crate::results::Results;

/// Sends each replayed request to control and experiment and records any
/// divergence between the two responses.
pub struct CorrectnessTest {
    pub control_url: String,
    pub experiment_url: String,
    pub forwarder: Forwarder,
    pub comparator: ResponseComparator,
    /// Headers removed from both responses before they are compared or dumped.
    pub strip: Vec<String>,
    pub results: Arc<Results>,
    pub gate: Arc<ConcurrencyGate>,
    pub fatal: FatalSender,
}

impl CorrectnessTest {
    async fn forward(&self, request: &CapturedRequest, side: Side) -> ForwardedResponse {
        let target = match side {
            Side::Control => &self.control_url,
            Side::Experiment | Side::Load => &self.experiment_url,
        };
        match self.forwarder.forward(request, target, &self.strip).await {
            Ok(response) => response,
            Err(e) => {
                let category = e.category();
                warn!(
                    side = side.label(),
                    category = category.label(),
                    error = %e,
                    "Forwarding failed"
                );
                FORWARD_ERRORS_TOTAL
                    .with_label_values(&[side.label(), category.label()])
                    .inc();
                ForwardedResponse::sentinel(side)
            }
        }
    }
}

#[async_trait]
impl ReplayHandler for CorrectnessTest {
    async fn handle(&self, request: CapturedRequest) {
        let Some(_permit) = self.gate.try_acquire() else {
            GATE_REJECTIONS_TOTAL.inc();
            debug!(path = %request.uri, "No concurrency permit left, dropping request");
            return;
        };

        let (control, experiment) = tokio::join!(
            self.forward(&request, Side::Control),
            self.forward(&request, Side::Experiment)
        );

        if self.comparator.equal(&control, &experiment) {
            self.results.record_request();
        } else {
            debug!(
                path = %request.uri,
                control_status = control.status,
                experiment_status = experiment.status,
                "Responses differ"
            );
            if let Err(e) = self
                .results
                .record_diff(&request.dump(), &control, &experiment)
            {
                error!(error = %e, "Failed to write diff record");
                let _ = self.fatal.send(JobError::DiffLog(e));
                return;
            }
            REPLAY_DIFFS_TOTAL.inc();
        }
        REPLAY_REQUESTS_TOTAL
            .with_label_values(&["correctness"])
            .inc();
    }
}
