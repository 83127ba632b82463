//! # inkfilter
//!
//! A scriptable HTTP stream filter for embedding in a proxy's
//! request/response pipeline. An operator-supplied Rhai script can
//! inspect and mutate in-flight headers, bodies and trailers, issue
//! side-channel HTTP calls to configured upstream clusters, and
//! synthesize direct responses, all while the proxy's own I/O and flow
//! control keep running beneath it.
//!
//! ## How it works
//!
//! Scripts look synchronous (`stream.body()` returns the whole body) but
//! run over a partially delivered stream: each script body executes as a
//! suspendable context that yields at blocking points and is resumed by
//! proxy events. A per-direction [`StreamDriver`] owns that context and
//! the state machine around it; every object exposed into script scope is
//! lifetime-guarded so access after stream teardown fails cleanly instead
//! of reaching freed stream state.
//!
//! ## Script surface
//!
//! ```rhai
//! fn on_request(stream) {
//!     let auth = stream.http_call("auth", #{
//!         ":method": "GET", ":path": "/check", ":authority": "auth",
//!     }, (), 250);
//!     if auth.error != () || auth.headers[":status"] != "200" {
//!         stream.respond(#{":status": "403"}, "denied");
//!     }
//!     stream.headers().set("x-checked", "1");
//! }
//! ```
//!
//! Entry points are selected by convention: `on_request` runs on the
//! request path, `on_response` on the response path; a missing entry
//! bypasses that direction entirely. Script faults fail open.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod config;
mod coroutine;
pub mod driver;
pub mod engine;
pub mod error;
pub mod filter;
pub mod handles;
pub mod upstream;

pub use config::{FilterConfig, REQUEST_ENTRY, RESPONSE_ENTRY};
pub use driver::{State, StreamDriver};
pub use engine::ScriptSource;
pub use error::{Result, ScriptError};
pub use filter::{
    Direction, Filter, FilterCallbacks, FilterDataStatus, FilterHeadersStatus,
    FilterTrailersStatus,
};
pub use handles::{shared_headers, HandleRegistry, HeaderTable, LifetimeGuard, SharedHeaders};
pub use upstream::{
    CallError, CallHandle, CallRequest, CallResult, ClusterManager, ConfiguredClusters,
    PendingCall,
};

/// Prelude with commonly used types
pub mod prelude {
    pub use crate::config::FilterConfig;
    pub use crate::engine::ScriptSource;
    pub use crate::error::{Result, ScriptError};
    pub use crate::filter::{
        Direction, Filter, FilterCallbacks, FilterDataStatus, FilterHeadersStatus,
        FilterTrailersStatus,
    };
    pub use crate::handles::{shared_headers, HeaderTable, SharedHeaders};
    pub use crate::upstream::{CallResult, ClusterManager, ConfiguredClusters};
}
