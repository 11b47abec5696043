//! Offloaded computation channel for the derivation engine.
//!
//! One long-lived worker task per computation domain, reached over a typed
//! request/response channel. Each call carries a correlation id; responses
//! are matched back to their callers through a pending map, so out-of-order
//! completion is safe. A fault inside the worker rejects only the matching
//! call; callers fall back to the in-process derivation path (`derive.rs`)
//! on any rejection.

use crate::derive::{derive_remittance_rates, DeriveRequest, DeriveResponse};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const CHANNEL_DEPTH: usize = 64;

#[derive(Debug)]
enum CalcOp {
    DeriveRemittanceRates(DeriveRequest),
}

#[derive(Debug)]
struct RequestEnvelope {
    correlation_id: u64,
    op: CalcOp,
}

#[derive(Debug)]
struct ResponseEnvelope {
    correlation_id: u64,
    result: Result<DeriveResponse, String>,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<DeriveResponse, String>>>>;

pub struct CalcWorker {
    req_tx: mpsc::Sender<RequestEnvelope>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    worker: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl CalcWorker {
    /// Spawn the worker task and its response dispatcher.
    pub fn spawn() -> Arc<Self> {
        let (req_tx, mut req_rx) = mpsc::channel::<RequestEnvelope>(CHANNEL_DEPTH);
        let (resp_tx, mut resp_rx) = mpsc::channel::<ResponseEnvelope>(CHANNEL_DEPTH);
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));

        let worker = tokio::spawn(async move {
            while let Some(envelope) = req_rx.recv().await {
                let result = match envelope.op {
                    CalcOp::DeriveRemittanceRates(request) => {
                        // A faulty input must reject this call, never kill
                        // the channel.
                        catch_unwind(AssertUnwindSafe(|| derive_remittance_rates(&request)))
                            .map_err(|_| "derivation panicked".to_string())
                    }
                };
                let response = ResponseEnvelope {
                    correlation_id: envelope.correlation_id,
                    result,
                };
                if resp_tx.send(response).await.is_err() {
                    break;
                }
            }
            debug!("calc worker loop exited");
        });

        let dispatcher = {
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                while let Some(response) = resp_rx.recv().await {
                    match pending.lock().remove(&response.correlation_id) {
                        Some(reply) => {
                            // Caller may have given up; dropped receivers
                            // are fine.
                            let _ = reply.send(response.result);
                        }
                        None => warn!(
                            correlation_id = response.correlation_id,
                            "orphaned calc response"
                        ),
                    }
                }
            })
        };

        Arc::new(Self {
            req_tx,
            pending,
            next_id: AtomicU64::new(0),
            worker,
            dispatcher,
        })
    }

    /// Run one derivation pass on the worker. Rejects with a descriptive
    /// error if the worker is unavailable or reports a fault for this call.
    pub async fn invoke(&self, request: DeriveRequest) -> Result<DeriveResponse> {
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, reply_tx);

        let envelope = RequestEnvelope {
            correlation_id,
            op: CalcOp::DeriveRemittanceRates(request),
        };
        if self.req_tx.send(envelope).await.is_err() {
            self.pending.lock().remove(&correlation_id);
            bail!("calc worker unavailable");
        }

        match reply_rx.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(message)) => bail!("calc worker fault: {}", message),
            Err(_) => bail!("calc worker shut down before responding"),
        }
    }

    /// Terminate the worker and purge every unresolved call. Pending
    /// callers observe a closed channel instead of hanging.
    pub fn shutdown(&self) {
        self.worker.abort();
        self.dispatcher.abort();
        self.pending.lock().clear();
        debug!("calc worker shut down");
    }
}

impl Drop for CalcWorker {
    fn drop(&mut self) {
        self.worker.abort();
        self.dispatcher.abort();
    }
}
