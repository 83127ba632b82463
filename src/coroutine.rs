//! Suspendable script execution context.
//!
//! Rhai has no coroutines, so suspension is realized as a channel
//! rendezvous: the script body runs on a pooled worker thread and every
//! yielding host function sends a [`HostRequest`] to the driver, then
//! blocks until the driver resumes it with a [`ResumeValue`]. Exactly one
//! continuation is pending at any time; the driver and the script thread
//! alternate, so the pair never runs concurrently.
//!
//! Worker threads are reused across streams, so each thread's lazily
//! constructed engine (see [`crate::engine`]) amortizes over many script
//! bodies instead of being rebuilt per stream.
//!
//! Dropping the driver-side endpoints disconnects the channels: a script
//! blocked at a yield point unblocks with a terminal error and its thread
//! exits. A torn-down context is never resumed.

use crate::config::FilterConfig;
use crate::error::ScriptError;
use crate::handles::{BodyHandle, HeaderMapHandle, HeaderTable, StreamHandle};
use crate::upstream::{CallRequest, CallResult};
use bytes::Bytes;
use rhai::{Dynamic, EvalAltResult, Scope};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Idle worker threads kept parked for reuse; beyond this, a finished
/// worker exits instead of parking.
const MAX_IDLE_WORKERS: usize = 8;

/// Reuses script threads across streams. A worker runs one script body at
/// a time (blocking through its suspensions), then parks itself for the
/// next one, so its thread-local engine is constructed once.
#[derive(Debug, Default)]
struct ScriptThreadPool {
    idle: Mutex<Vec<Sender<Job>>>,
}

fn pool() -> &'static ScriptThreadPool {
    static POOL: OnceLock<ScriptThreadPool> = OnceLock::new();
    POOL.get_or_init(ScriptThreadPool::default)
}

impl ScriptThreadPool {
    fn execute(&'static self, job: Job) -> Result<(), ScriptError> {
        let mut job = job;
        loop {
            let parked = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
            match parked {
                Some(worker) => match worker.send(job) {
                    Ok(()) => return Ok(()),
                    // The worker is gone; reclaim the job and try another.
                    Err(mpsc::SendError(reclaimed)) => job = reclaimed,
                },
                None => return self.spawn_worker(job),
            }
        }
    }

    fn spawn_worker(&'static self, job: Job) -> Result<(), ScriptError> {
        let (tx, rx) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("script-worker".to_string())
            .spawn(move || {
                job();
                loop {
                    {
                        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
                        if idle.len() >= MAX_IDLE_WORKERS {
                            break;
                        }
                        idle.push(tx.clone());
                    }
                    match rx.recv() {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                }
            })
            .map_err(|e| ScriptError::runtime(format!("failed to spawn script thread: {e}")))?;
        Ok(())
    }
}

/// A yield point: what the script is waiting on
#[derive(Debug)]
pub(crate) enum HostRequest {
    /// Full body requested; host should buffer until end of stream
    GetBody,
    /// Next body chunk requested; host must not buffer
    NextBodyChunk,
    /// Trailers requested
    GetTrailers,
    /// Side-channel HTTP call
    HttpCall(CallRequest),
    /// Immediate response; terminates the script
    Respond {
        headers: HeaderTable,
        body: Option<Bytes>,
    },
}

/// Value a suspended script resumes with
#[derive(Debug)]
pub(crate) enum ResumeValue {
    /// Full body, or the empty indication
    Body(Option<BodyHandle>),
    /// One body chunk, or the end-of-stream sentinel
    Chunk(Option<Vec<u8>>),
    /// Trailers, or the empty indication
    Trailers(Option<HeaderMapHandle>),
    /// Upstream call outcome
    Call(CallResult),
    /// The host accepted an immediate response
    Responded,
    /// The pending request was invalid; raised as a script error
    Fault(String),
}

/// Message from the script thread to the driver
#[derive(Debug)]
pub(crate) enum ScriptEvent {
    /// The script suspended at a yield point
    Request(HostRequest),
    /// The script body returned (or faulted)
    Done(Result<(), ScriptError>),
}

/// Script-side channel endpoints, embedded in every [`StreamHandle`]
#[derive(Debug, Clone)]
pub(crate) struct HostPort {
    inner: Arc<PortInner>,
}

#[derive(Debug)]
struct PortInner {
    request_tx: Mutex<Sender<ScriptEvent>>,
    resume_rx: Mutex<Receiver<ResumeValue>>,
}

const DETACHED: &str = "stream destroyed: script host is no longer reachable";

impl HostPort {
    fn new(request_tx: Sender<ScriptEvent>, resume_rx: Receiver<ResumeValue>) -> Self {
        Self {
            inner: Arc::new(PortInner {
                request_tx: Mutex::new(request_tx),
                resume_rx: Mutex::new(resume_rx),
            }),
        }
    }

    /// Suspend at a yield point: hand `request` to the driver and block
    /// until it resumes us.
    pub(crate) fn call(&self, request: HostRequest) -> Result<ResumeValue, Box<EvalAltResult>> {
        {
            let tx = self
                .inner
                .request_tx
                .lock()
                .map_err(|_| Box::<EvalAltResult>::from(DETACHED.to_string()))?;
            tx.send(ScriptEvent::Request(request))
                .map_err(|_| Box::<EvalAltResult>::from(DETACHED.to_string()))?;
        }
        let rx = self
            .inner
            .resume_rx
            .lock()
            .map_err(|_| Box::<EvalAltResult>::from(DETACHED.to_string()))?;
        match rx.recv() {
            Ok(ResumeValue::Fault(message)) => Err(message.into()),
            Ok(value) => Ok(value),
            Err(_) => Err(DETACHED.to_string().into()),
        }
    }

    fn send_done(&self, result: Result<(), ScriptError>) {
        if let Ok(tx) = self.inner.request_tx.lock() {
            // Nobody listening means the stream is already gone.
            let _ = tx.send(ScriptEvent::Done(result));
        }
    }
}

/// Driver-side endpoints of one script execution context
#[derive(Debug)]
pub(crate) struct Coroutine {
    events: Option<Receiver<ScriptEvent>>,
    resume_tx: Option<Sender<ResumeValue>>,
}

impl Coroutine {
    /// Start `entry` on a pooled worker thread with the stream handle as
    /// its only argument. The script runs until its first yield point.
    pub(crate) fn spawn(
        config: Arc<FilterConfig>,
        entry: &'static str,
        headers: HeaderMapHandle,
    ) -> Result<Self, ScriptError> {
        let (event_tx, event_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel();
        let port = HostPort::new(event_tx, resume_rx);
        let handle = StreamHandle::new(port.clone(), headers);

        pool().execute(Box::new(move || {
            let outcome = crate::engine::with_engine(|engine| {
                let mut scope = Scope::new();
                engine.call_fn::<Dynamic>(&mut scope, config.ast(), entry, (handle,))
            });
            let result = match outcome {
                Ok(_) => Ok(()),
                // respond() terminates the script on purpose
                Err(e) if matches!(*e, EvalAltResult::ErrorTerminated(..)) => Ok(()),
                Err(e) => Err(ScriptError::from(e)),
            };
            trace!(entry, ok = result.is_ok(), "script body finished");
            port.send_done(result);
        }))?;

        Ok(Self {
            events: Some(event_rx),
            resume_tx: Some(resume_tx),
        })
    }

    /// Block until the script suspends at a yield point or finishes
    pub(crate) fn next_event(&mut self) -> Result<ScriptEvent, ScriptError> {
        match &self.events {
            Some(rx) => rx.recv().map_err(|_| {
                ScriptError::panic("script thread terminated without reporting a result")
            }),
            None => Err(ScriptError::runtime("execution context already shut down")),
        }
    }

    /// Resume the suspended script with `value`. Errors surface through
    /// the next event, so a failed send is not reported here.
    pub(crate) fn resume(&mut self, value: ResumeValue) {
        if let Some(tx) = &self.resume_tx {
            let _ = tx.send(value);
        }
    }

    /// Disconnect both channels; unblocks and terminates the script thread
    pub(crate) fn shutdown(&mut self) {
        self.events = None;
        self.resume_tx = None;
    }
}
