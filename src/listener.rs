//! The embedded HTTP server the traffic generator replays against.
//!
//! Every request is buffered and handed to a [`ReplayHandler`]; the generator
//! always gets `200 OK` with body `OK`, whatever happened downstream.

use async_trait::async_trait;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::errors::JobError;
use crate::forward::CapturedRequest;
use crate::metrics::IN_FLIGHT_REQUESTS;

/// Channel on which request handlers and the server report errors that must
/// end the job.
pub type FatalSender = mpsc::UnboundedSender<JobError>;

/// What the listener does with each replayed request.
#[async_trait]
pub trait ReplayHandler: Send + Sync + 'static {
    async fn handle(&self, request: CapturedRequest);
}

/// Counts requests being handled and lets the driver wait until there are none.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        IN_FLIGHT_REQUESTS.inc();
        InFlightGuard {
            in_flight: Arc::clone(self),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves once no request is being handled.
    pub async fn drained(&self) {
        loop {
            let idle = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        IN_FLIGHT_REQUESTS.dec();
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

/// A running listener.
pub struct Listener {
    local_addr: SocketAddr,
    in_flight: Arc<InFlight>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl Listener {
    /// Binds `addr` and starts serving. A server failure after startup is
    /// reported on `fatal`.
    pub fn bind(
        addr: SocketAddr,
        handler: Arc<dyn ReplayHandler>,
        fatal: FatalSender,
    ) -> Result<Self, JobError> {
        let in_flight = InFlight::new();

        let service_in_flight = Arc::clone(&in_flight);
        let make_svc = make_service_fn(move |_conn| {
            let handler = Arc::clone(&handler);
            let in_flight = Arc::clone(&service_in_flight);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let handler = Arc::clone(&handler);
                    let in_flight = Arc::clone(&in_flight);
                    async move { Ok::<_, Infallible>(serve_one(req, handler, in_flight).await) }
                }))
            }
        });

        let server = Server::try_bind(&addr)
            .map_err(JobError::Listener)?
            .serve(make_svc);
        let local_addr = server.local_addr();
        info!(addr = %local_addr, "Replay listener started");

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = server.with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let server = tokio::spawn(async move {
            if let Err(e) = server.await {
                error!(error = %e, "Replay listener failed");
                let _ = fatal.send(JobError::Listener(e));
            }
        });

        Ok(Self {
            local_addr,
            in_flight,
            shutdown,
            server,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn in_flight(&self) -> Arc<InFlight> {
        Arc::clone(&self.in_flight)
    }

    /// Stops accepting requests and waits for open connections to finish.
    pub async fn shutdown(self) -> Result<(), JobError> {
        let _ = self.shutdown.send(());
        self.server.await?;
        info!(addr = %self.local_addr, "Replay listener stopped");
        Ok(())
    }
}

async fn serve_one(
    req: Request<Body>,
    handler: Arc<dyn ReplayHandler>,
    in_flight: Arc<InFlight>,
) -> Response<Body> {
    let guard = in_flight.enter();
    match CapturedRequest::capture(req).await {
        Ok(request) => {
            // Handling runs on its own task so a generator that hangs up early
            // can't cancel a comparison halfway.
            let handled = tokio::spawn(async move {
                let _guard = guard;
                handler.handle(request).await;
            });
            if let Err(e) = handled.await {
                error!(error = %e, "Replay handler panicked");
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to read replayed request");
        }
    }
    Response::new(Body::from("OK"))
}
