use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::forward::{CapturedRequest, Forwarder, Side};
use crate::listener::ReplayHandler;
use crate::metrics::{FORWARD_ERRORS_TOTAL, REPLAY_REQUESTS_TOTAL};
use crate::results::Results;

/// Sends each replayed request to a single target and counts the successes.
pub struct LoadTest {
    pub load_url: String,
    pub forwarder: Forwarder,
    pub strip: Vec<String>,
    pub results: Arc<Results>,
}

#[async_trait]
impl ReplayHandler for LoadTest {
    async fn handle(&self, request: CapturedRequest) {
        match self
            .forwarder
            .forward(&request, &self.load_url, &self.strip)
            .await
        {
            Ok(_) => {
                self.results.record_request();
                REPLAY_REQUESTS_TOTAL.with_label_values(&["load"]).inc();
            }
            Err(e) => {
                let category = e.category();
                warn!(category = category.label(), error = %e, "Forwarding failed");
                FORWARD_ERRORS_TOTAL
                    .with_label_values(&[Side::Load.label(), category.label()])
                    .inc();
            }
        }
    }
}
