//! Worker-pool broker (C6): a controller task owning the TCP listener and
//! N worker tasks, connected by a `pend` (controller->worker) and `yield`
//! (worker->controller) channel pair per worker, with correlation-id-based
//! request/reply (`ask`/`say`). Grounded line-for-line on
//! `copyparty/broker_mpw.py`'s `MpWorker.main`/`ask`/`say`; transport
//! reduced from OS-process `multiprocessing.Queue` to in-process
//! `tokio::sync::mpsc`/`oneshot`, per the Process Model Decision in
//! SPEC_FULL.md §1.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::BrokerFatal;

/// One IPC message: `(correlation_id, destination, argument_list)`.
/// `correlation_id == 0` means fire-and-forget.
#[derive(Debug, Clone)]
pub struct Msg {
    pub corr_id: u64,
    pub dest: String,
    pub args: Vec<Arg>,
}

/// A loosely-typed IPC argument, wide enough for every destination this
/// crate's registry actually uses.
#[derive(Debug, Clone)]
pub enum Arg {
    Unit,
    Bool(bool),
    Int(i64),
    Text(String),
}

type PendingTable = Mutex<HashMap<u64, oneshot::Sender<Vec<Arg>>>>;

/// Worker-side endpoint: sends on `yield_tx`, receives control messages on
/// `pend_rx`, and owns the pending-reply table for its own outbound `ask`
/// calls.
pub struct WorkerHandle {
    pub id: usize,
    pend_rx: mpsc::Receiver<Msg>,
    yield_tx: mpsc::Sender<Msg>,
    pending: Arc<PendingTable>,
    next_corr_id: Arc<AtomicU64>,
}

/// Controller-side endpoint for one worker: sends on `pend_tx`, receives on
/// `yield_rx`.
pub struct ControllerWorkerLink {
    pub id: usize,
    pend_tx: mpsc::Sender<Msg>,
    yield_rx: mpsc::Receiver<Msg>,
}

/// Builds a connected `(WorkerHandle, ControllerWorkerLink)` pair, the
/// in-process equivalent of spawning one more OS worker process with its
/// two `multiprocessing.Queue`s in `broker_mpw.py`.
pub fn spawn_worker_channels(id: usize) -> (WorkerHandle, ControllerWorkerLink) {
    let (pend_tx, pend_rx) = mpsc::channel(64);
    let (yield_tx, yield_rx) = mpsc::channel(64);

    let worker = WorkerHandle {
        id,
        pend_rx,
        yield_tx,
        pending: Arc::new(Mutex::new(HashMap::new())),
        next_corr_id: Arc::new(AtomicU64::new(1)),
    };
    let link = ControllerWorkerLink {
        id,
        pend_tx,
        yield_rx,
    };
    (worker, link)
}

/// A named, type-erased operation a worker can invoke on itself via a
/// dotted `dest` path (spec.md §4.6: "Resolve `dest` by stepwise attribute
/// lookup ... invoke the resolved operation"). This crate flattens the
/// attribute chain into a single registry key rather than walking nested
/// objects, since the worker side has no nested service tree worth
/// modeling generically.
pub type Operation = Arc<dyn Fn(Vec<Arg>) -> Vec<Arg> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Registry {
    ops: HashMap<String, Operation>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { ops: HashMap::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, op: Operation) {
        self.ops.insert(name.into(), op);
    }

    fn resolve(&self, dest: &str) -> Option<&Operation> {
        self.ops.get(dest)
    }
}

impl WorkerHandle {
    /// Fire-and-forget or reply send to the controller. `corr_id = 0` for
    /// fire-and-forget, nonzero + `dest = "retq"` to answer a prior `ask`.
    pub async fn say(&self, dest: impl Into<String>, args: Vec<Arg>, corr_id: u64) {
        let _ = self
            .yield_tx
            .send(Msg {
                corr_id,
                dest: dest.into(),
                args,
            })
            .await;
    }

    /// Sends a request to the controller and returns a receiver that
    /// resolves once the matching `retq` arrives. Registers the pending
    /// slot *before* sending, so a reply racing the registration can never
    /// be lost.
    pub async fn ask(&self, dest: impl Into<String>, args: Vec<Arg>) -> oneshot::Receiver<Vec<Arg>> {
        let corr_id = self.next_corr_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(corr_id, tx);
        self.say(dest, args, corr_id).await;
        rx
    }

    /// Runs this worker's control-plane loop until `shutdown` or the
    /// channel closes. `asrv` is reloaded in place on `reload`/
    /// `reload_sessions`; `registry` resolves any other `dest`.
    pub async fn run_control_loop(
        mut self,
        asrv: Arc<crate::authsrv::AuthSrv>,
        registry: Registry,
        draining: Arc<std::sync::atomic::AtomicBool>,
    ) -> Result<(), BrokerFatal> {
        while let Some(Msg { corr_id, dest, args }) = self.pend_rx.recv().await {
            match dest.as_str() {
                "retq" => {
                    let mut pending = self.pending.lock().await;
                    match pending.remove(&corr_id) {
                        Some(slot) => {
                            let _ = slot.send(args);
                        }
                        None => {
                            return Err(BrokerFatal(format!(
                                "worker {} got retq for unknown correlation id {}",
                                self.id, corr_id
                            )))
                        }
                    }
                }
                "shutdown" => {
                    draining.store(true, Ordering::Relaxed);
                    tracing::info!(worker = self.id, "mpw.shutdown: ok bye");
                    return Ok(());
                }
                "reload" => {
                    tracing::info!(worker = self.id, "mpw.asrv reloading");
                    asrv.reload();
                    tracing::info!(worker = self.id, "mpw.asrv reloaded");
                }
                "reload_sessions" => {
                    asrv.load_sessions();
                }
                other => match registry.resolve(other) {
                    Some(op) => {
                        let rv = op(args);
                        if corr_id != 0 {
                            self.say("retq", rv, corr_id).await;
                        }
                    }
                    None => {
                        return Err(BrokerFatal(format!(
                            "worker {} got unresolvable dest {:?}",
                            self.id, other
                        )))
                    }
                },
            }
        }
        Ok(())
    }
}

/// Controller-side broker: owns one `ControllerWorkerLink` per worker and a
/// pending-reply table for its own `ask` calls issued *to* workers (used
/// for future bidirectional control-plane calls; this crate currently only
/// exercises controller->worker fire-and-forget for `shutdown`/`reload`).
pub struct Controller {
    links: Vec<ControllerWorkerLink>,
}

impl Controller {
    pub fn new(links: Vec<ControllerWorkerLink>) -> Self {
        Controller { links }
    }

    /// Broadcasts `dest` with no payload to every worker, fire-and-forget.
    pub async fn broadcast(&self, dest: &str) {
        for link in &self.links {
            let _ = link.pend_tx.send(Msg {
                corr_id: 0,
                dest: dest.to_string(),
                args: Vec::new(),
            }).await;
        }
    }

    /// Drains one control message from worker `id`'s `yield` channel, if
    /// any is pending; the controller forwards `(0, "log", ...)` straight
    /// into `tracing` (see SPEC_FULL.md §4.6) and treats anything else as a
    /// request needing a reply it does not yet have a handler for.
    pub async fn poll_one(&mut self, id: usize) -> Option<Msg> {
        self.links.iter_mut().find(|l| l.id == id)?.yield_rx.recv().await
    }

    pub fn pend_sender(&self, id: usize) -> Option<mpsc::Sender<Msg>> {
        self.links.iter().find(|l| l.id == id).map(|l| l.pend_tx.clone())
    }
}
