//! Per-stream script driver: bridges proxy events to script resumption.
//!
//! One driver exists per in-flight direction. It owns the execution
//! context, the current state, and the handle registry, and it translates
//! asynchronous proxy events (body chunks, trailers, upstream-call
//! completion) into resumptions of the suspended script. Only one
//! resumption can be pending at a time; events that do not match the
//! current waiting state are discarded with a debug log.

use crate::config::FilterConfig;
use crate::coroutine::{Coroutine, HostRequest, ResumeValue, ScriptEvent};
use crate::error::Result;
use crate::filter::{
    FilterCallbacks, FilterDataStatus, FilterHeadersStatus, FilterTrailersStatus,
};
use crate::handles::{BodyHandle, HandleRegistry, HeaderMapHandle, SharedHeaders};
use crate::upstream::{CallHandle, CallResult, ClusterManager};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Driver state; advances only on proxy events or call completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Executing, or finished executing
    Running,
    /// Suspended in chunk iteration; each data event resumes once
    WaitForBodyChunk,
    /// Suspended until the full body is buffered
    WaitForBody,
    /// Suspended until trailers arrive or the stream ends without them
    WaitForTrailers,
    /// Suspended on an in-flight upstream call
    HttpCall,
    /// Terminal: an immediate response was sent; later events are discarded
    Responded,
}

/// Drives one script body over one stream direction
pub struct StreamDriver {
    coroutine: Coroutine,
    callbacks: Arc<dyn FilterCallbacks>,
    clusters: Arc<dyn ClusterManager>,
    registry: HandleRegistry,
    trailers: Option<SharedHeaders>,
    state: State,
    end_stream: bool,
    headers_continued: bool,
    coroutine_done: bool,
    http_call: Option<CallHandle>,
    destroyed: bool,
}

impl fmt::Debug for StreamDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDriver")
            .field("state", &self.state)
            .field("end_stream", &self.end_stream)
            .field("coroutine_done", &self.coroutine_done)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl StreamDriver {
    /// Spawn the execution context for `entry` with the stream's headers
    pub fn new(
        config: &Arc<FilterConfig>,
        entry: &'static str,
        headers: SharedHeaders,
        end_stream: bool,
        callbacks: Arc<dyn FilterCallbacks>,
    ) -> Result<Self> {
        let registry = HandleRegistry::new();
        let headers_handle = HeaderMapHandle::new(registry.guard(), headers, "headers");
        let coroutine = Coroutine::spawn(Arc::clone(config), entry, headers_handle)?;
        Ok(Self {
            coroutine,
            callbacks,
            clusters: config.clusters(),
            registry,
            trailers: None,
            state: State::Running,
            end_stream,
            headers_continued: false,
            coroutine_done: false,
            http_call: None,
            destroyed: false,
        })
    }

    /// Current state (mainly for tests and diagnostics)
    pub fn state(&self) -> State {
        self.state
    }

    /// Run the script until it returns, suspends, or responds. Tells the
    /// proxy whether to continue header emission or pause.
    pub fn start(&mut self) -> Result<FilterHeadersStatus> {
        debug_assert!(!self.destroyed, "start() on a destroyed driver");
        self.pump()?;
        Ok(match self.state {
            State::Running => {
                self.headers_continued = true;
                FilterHeadersStatus::Continue
            }
            _ => FilterHeadersStatus::StopIteration,
        })
    }

    /// Inject a body chunk arriving from the proxy
    pub fn on_data(&mut self, data: Bytes, end_stream: bool) -> Result<FilterDataStatus> {
        if self.destroyed {
            debug!("data event after destroy discarded");
            return Ok(FilterDataStatus::Continue);
        }
        if self.state == State::Responded {
            trace!("data event after respond discarded");
            return Ok(FilterDataStatus::StopIterationNoBuffer);
        }
        self.end_stream |= end_stream;

        match self.state {
            State::WaitForBodyChunk => {
                self.resume(ResumeValue::Chunk(Some(data.to_vec())))?;
            }
            State::WaitForBody if self.end_stream => {
                // The final chunk is not yet in the proxy buffer; append it
                // so the script sees the whole body.
                self.callbacks.add_data(data);
                let body = self.full_body_resume();
                self.resume(body)?;
            }
            State::WaitForTrailers if self.end_stream => {
                // Stream ended on data: no trailers will arrive.
                self.resume(ResumeValue::Trailers(None))?;
            }
            _ => {}
        }

        self.maybe_continue();
        Ok(match self.state {
            State::HttpCall | State::WaitForBody => FilterDataStatus::StopIterationAndBuffer,
            State::Responded => FilterDataStatus::StopIterationNoBuffer,
            _ => FilterDataStatus::Continue,
        })
    }

    /// Inject trailers arriving from the proxy; implies end of body data
    pub fn on_trailers(&mut self, trailers: SharedHeaders) -> Result<FilterTrailersStatus> {
        if self.destroyed {
            debug!("trailers event after destroy discarded");
            return Ok(FilterTrailersStatus::Continue);
        }
        if self.state == State::Responded {
            trace!("trailers event after respond discarded");
            return Ok(FilterTrailersStatus::StopIteration);
        }
        self.end_stream = true;
        self.trailers = Some(trailers);

        match self.state {
            State::WaitForBodyChunk => {
                self.resume(ResumeValue::Chunk(None))?;
            }
            State::WaitForBody => {
                let body = self.full_body_resume();
                self.resume(body)?;
            }
            _ => {}
        }
        if self.state == State::WaitForTrailers {
            let handle = self.trailers_handle();
            self.resume(ResumeValue::Trailers(handle))?;
        }

        self.maybe_continue();
        Ok(match self.state {
            State::HttpCall | State::Responded => FilterTrailersStatus::StopIteration,
            _ => FilterTrailersStatus::Continue,
        })
    }

    /// Inject the outcome of the in-flight upstream call
    pub fn on_call_result(&mut self, result: CallResult) -> Result<()> {
        if self.destroyed || self.state != State::HttpCall {
            debug!(state = ?self.state, "call result without a waiting call discarded");
            return Ok(());
        }
        let handle = match self.http_call.take() {
            Some(handle) => handle,
            None => {
                debug!("call result with no call handle discarded");
                return Ok(());
            }
        };
        if handle.is_cancelled() {
            debug!(call_id = handle.id(), "result for cancelled call discarded");
            return Ok(());
        }
        self.resume(ResumeValue::Call(result))?;
        self.maybe_continue();
        Ok(())
    }

    /// Tear the driver down: cancel any outstanding call, invalidate every
    /// exposed handle, and terminate the execution context. Idempotent.
    pub fn on_destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(call) = self.http_call.take() {
            call.cancel();
        }
        self.registry.mark_dead();
        self.coroutine.shutdown();
        trace!("driver destroyed");
    }

    /// Resume the suspended script and run it to its next yield point.
    /// Exactly one resumption may be pending; the rendezvous enforces it.
    fn resume(&mut self, value: ResumeValue) -> Result<()> {
        debug_assert!(
            !matches!(self.state, State::Running if !self.coroutine_done),
            "resume while the script is running"
        );
        self.state = State::Running;
        self.coroutine.resume(value);
        self.pump()
    }

    /// Serve host requests until the script suspends or finishes
    fn pump(&mut self) -> Result<()> {
        loop {
            match self.coroutine.next_event()? {
                ScriptEvent::Done(result) => {
                    self.coroutine_done = true;
                    return result;
                }
                ScriptEvent::Request(request) => {
                    if let Some(waiting) = self.serve(request)? {
                        trace!(state = ?waiting, "script suspended");
                        self.state = waiting;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Answer one host request inline, or return the state to suspend in
    fn serve(&mut self, request: HostRequest) -> Result<Option<State>> {
        match request {
            HostRequest::GetBody => {
                if self.end_stream {
                    let body = self.full_body_resume();
                    self.coroutine.resume(body);
                    Ok(None)
                } else {
                    Ok(Some(State::WaitForBody))
                }
            }
            HostRequest::NextBodyChunk => {
                if self.end_stream {
                    self.coroutine.resume(ResumeValue::Chunk(None));
                    Ok(None)
                } else {
                    Ok(Some(State::WaitForBodyChunk))
                }
            }
            HostRequest::GetTrailers => {
                if self.trailers.is_some() {
                    let handle = self.trailers_handle();
                    self.coroutine.resume(ResumeValue::Trailers(handle));
                    Ok(None)
                } else if self.end_stream {
                    self.coroutine.resume(ResumeValue::Trailers(None));
                    Ok(None)
                } else {
                    Ok(Some(State::WaitForTrailers))
                }
            }
            HostRequest::HttpCall(request) => match self.clusters.issue_call(request) {
                Ok(handle) => {
                    self.http_call = Some(handle);
                    Ok(Some(State::HttpCall))
                }
                Err(e) => {
                    // Delivered as a failure result; recoverable by the script.
                    self.coroutine.resume(ResumeValue::Call(CallResult::Failure {
                        reason: e.to_string(),
                    }));
                    Ok(None)
                }
            },
            HostRequest::Respond { headers, body } => {
                if self.headers_continued {
                    self.coroutine.resume(ResumeValue::Fault(
                        "respond() cannot be used after headers have been continued".to_string(),
                    ));
                    return Ok(None);
                }
                self.coroutine.resume(ResumeValue::Responded);
                self.callbacks.respond(headers, body);
                Ok(Some(State::Responded))
            }
        }
    }

    /// The full-body resume value: the buffered body, or the empty
    /// indication when nothing was buffered
    fn full_body_resume(&self) -> ResumeValue {
        let body = self.callbacks.buffered_body().filter(|b| !b.is_empty());
        ResumeValue::Body(body.map(|b| BodyHandle::new(self.registry.guard(), b)))
    }

    fn trailers_handle(&self) -> Option<HeaderMapHandle> {
        self.trailers
            .as_ref()
            .map(|t| HeaderMapHandle::new(self.registry.guard(), Arc::clone(t), "trailers"))
    }

    /// Resume paused header iteration once the script has finished
    fn maybe_continue(&mut self) {
        if self.coroutine_done && self.state == State::Running && !self.headers_continued {
            self.headers_continued = true;
            self.callbacks.continue_iteration();
        }
    }
}

impl Drop for StreamDriver {
    fn drop(&mut self) {
        self.on_destroy();
    }
}
