//! The pipeline filter: one script driver per direction.
//!
//! The embedding proxy installs one [`FilterCallbacks`] implementation per
//! direction and forwards its lifecycle events (`decode_*` for the request
//! path, `encode_*` for the response path). Script faults fail open: the
//! affected direction passes through unmodified from then on.

use crate::config::FilterConfig;
use crate::driver::StreamDriver;
use crate::error::ScriptError;
use crate::handles::{HeaderTable, SharedHeaders};
use crate::upstream::CallResult;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Verdict for a headers event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHeadersStatus {
    /// Continue header emission
    Continue,
    /// Pause until the driver resumes iteration
    StopIteration,
}

/// Verdict for a data event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDataStatus {
    /// Forward the chunk
    Continue,
    /// Pause and buffer this chunk for later inspection
    StopIterationAndBuffer,
    /// Pause without buffering
    StopIterationNoBuffer,
}

/// Verdict for a trailers event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTrailersStatus {
    /// Continue trailer emission
    Continue,
    /// Pause until the driver resumes iteration
    StopIteration,
}

/// Stream direction through the filter pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Request path (decode)
    Request,
    /// Response path (encode)
    Response,
}

/// Direction-specific adapter over the proxy's native stream callbacks.
///
/// One implementation is installed per direction so driver logic stays
/// symmetric across decode and encode.
pub trait FilterCallbacks: Send + Sync + fmt::Debug {
    /// Append data to the proxy's buffered body for this direction
    fn add_data(&self, data: Bytes);

    /// The currently buffered body, if any
    fn buffered_body(&self) -> Option<Bytes>;

    /// Resume iteration previously paused by a StopIteration verdict
    fn continue_iteration(&self);

    /// Send an immediate response; stops further filter iteration
    fn respond(&self, headers: HeaderTable, body: Option<Bytes>);
}

/// The scriptable stream filter. Owns at most one driver per direction,
/// created on the first header event for that direction.
pub struct Filter {
    config: Arc<FilterConfig>,
    decoder_callbacks: Option<Arc<dyn FilterCallbacks>>,
    encoder_callbacks: Option<Arc<dyn FilterCallbacks>>,
    request_driver: Option<StreamDriver>,
    response_driver: Option<StreamDriver>,
    destroyed: bool,
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("script", &self.config.source_name())
            .field("request_driver", &self.request_driver)
            .field("response_driver", &self.response_driver)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl Filter {
    /// Create a filter backed by `config`
    pub fn new(config: Arc<FilterConfig>) -> Self {
        Self {
            config,
            decoder_callbacks: None,
            encoder_callbacks: None,
            request_driver: None,
            response_driver: None,
            destroyed: false,
        }
    }

    /// Install the request-path adapter
    pub fn set_decoder_callbacks(&mut self, callbacks: Arc<dyn FilterCallbacks>) {
        self.decoder_callbacks = Some(callbacks);
    }

    /// Install the response-path adapter
    pub fn set_encoder_callbacks(&mut self, callbacks: Arc<dyn FilterCallbacks>) {
        self.encoder_callbacks = Some(callbacks);
    }

    /// Request headers arrived
    pub fn decode_headers(
        &mut self,
        headers: SharedHeaders,
        end_stream: bool,
    ) -> FilterHeadersStatus {
        let entry = self.config.request_entry();
        let callbacks = self.decoder_callbacks.clone();
        Self::do_headers(
            &self.config,
            &mut self.request_driver,
            callbacks,
            entry,
            headers,
            end_stream,
            Direction::Request,
        )
    }

    /// Request body chunk arrived
    pub fn decode_data(&mut self, data: Bytes, end_stream: bool) -> FilterDataStatus {
        Self::do_data(&mut self.request_driver, data, end_stream, Direction::Request)
    }

    /// Request trailers arrived
    pub fn decode_trailers(&mut self, trailers: SharedHeaders) -> FilterTrailersStatus {
        Self::do_trailers(&mut self.request_driver, trailers, Direction::Request)
    }

    /// Response headers arrived
    pub fn encode_headers(
        &mut self,
        headers: SharedHeaders,
        end_stream: bool,
    ) -> FilterHeadersStatus {
        let entry = self.config.response_entry();
        let callbacks = self.encoder_callbacks.clone();
        Self::do_headers(
            &self.config,
            &mut self.response_driver,
            callbacks,
            entry,
            headers,
            end_stream,
            Direction::Response,
        )
    }

    /// Response body chunk arrived
    pub fn encode_data(&mut self, data: Bytes, end_stream: bool) -> FilterDataStatus {
        Self::do_data(&mut self.response_driver, data, end_stream, Direction::Response)
    }

    /// Response trailers arrived
    pub fn encode_trailers(&mut self, trailers: SharedHeaders) -> FilterTrailersStatus {
        Self::do_trailers(&mut self.response_driver, trailers, Direction::Response)
    }

    /// Inject the outcome of the upstream call issued on `direction`
    pub fn on_call_result(&mut self, direction: Direction, result: CallResult) {
        let slot = match direction {
            Direction::Request => &mut self.request_driver,
            Direction::Response => &mut self.response_driver,
        };
        let Some(driver) = slot.as_mut() else {
            debug!(?direction, "call result without an active driver discarded");
            return;
        };
        if let Err(e) = driver.on_call_result(result) {
            Self::fail_open(slot, direction, e);
        }
    }

    /// Stream teardown: cancel outstanding calls on both drivers and
    /// invalidate every exposed handle. Idempotent.
    pub fn on_destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(driver) = self.request_driver.as_mut() {
            driver.on_destroy();
        }
        if let Some(driver) = self.response_driver.as_mut() {
            driver.on_destroy();
        }
    }

    fn do_headers(
        config: &Arc<FilterConfig>,
        slot: &mut Option<StreamDriver>,
        callbacks: Option<Arc<dyn FilterCallbacks>>,
        entry: Option<&'static str>,
        headers: SharedHeaders,
        end_stream: bool,
        direction: Direction,
    ) -> FilterHeadersStatus {
        // No entry function for this direction: the pipeline behaves as a
        // no-op filter.
        let Some(entry) = entry else {
            return FilterHeadersStatus::Continue;
        };
        let Some(callbacks) = callbacks else {
            warn!(?direction, "no stream callbacks installed; bypassing script");
            return FilterHeadersStatus::Continue;
        };

        match StreamDriver::new(config, entry, headers, end_stream, callbacks) {
            Ok(driver) => {
                *slot = Some(driver);
                match slot.as_mut().map(StreamDriver::start) {
                    Some(Ok(status)) => status,
                    Some(Err(e)) => {
                        Self::fail_open(slot, direction, e);
                        FilterHeadersStatus::Continue
                    }
                    None => FilterHeadersStatus::Continue,
                }
            }
            Err(e) => {
                error!(?direction, error = %e, "failed to start script");
                FilterHeadersStatus::Continue
            }
        }
    }

    fn do_data(
        slot: &mut Option<StreamDriver>,
        data: Bytes,
        end_stream: bool,
        direction: Direction,
    ) -> FilterDataStatus {
        let Some(driver) = slot.as_mut() else {
            return FilterDataStatus::Continue;
        };
        match driver.on_data(data, end_stream) {
            Ok(status) => status,
            Err(e) => {
                Self::fail_open(slot, direction, e);
                FilterDataStatus::Continue
            }
        }
    }

    fn do_trailers(
        slot: &mut Option<StreamDriver>,
        trailers: SharedHeaders,
        direction: Direction,
    ) -> FilterTrailersStatus {
        let Some(driver) = slot.as_mut() else {
            return FilterTrailersStatus::Continue;
        };
        match driver.on_trailers(trailers) {
            Ok(status) => status,
            Err(e) => {
                Self::fail_open(slot, direction, e);
                FilterTrailersStatus::Continue
            }
        }
    }

    /// A script fault ends script involvement for this direction; the
    /// stream itself keeps flowing unmodified.
    fn fail_open(slot: &mut Option<StreamDriver>, direction: Direction, e: ScriptError) {
        error!(?direction, error = %e, "script fault; passing stream through unmodified");
        if let Some(mut driver) = slot.take() {
            driver.on_destroy();
        }
    }
}
