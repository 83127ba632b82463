//! Upstream-call collaborator: side-channel HTTP calls issued by scripts.
//!
//! The filter never performs network I/O itself. A [`ClusterManager`]
//! accepts a [`CallRequest`] and hands back a cancellable [`CallHandle`];
//! the embedding proxy dispatches the call and injects the outcome through
//! [`crate::Filter::on_call_result`].

use crate::handles::HeaderTable;
use bytes::Bytes;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// One side-channel HTTP request
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Name of the configured upstream cluster
    pub cluster: String,
    /// Request headers; `:method`, `:path` and `:authority` are required
    pub headers: HeaderTable,
    /// Optional request body
    pub body: Option<Vec<u8>>,
    /// Call timeout
    pub timeout: Duration,
}

/// Outcome of a side-channel HTTP call
#[derive(Debug, Clone)]
pub enum CallResult {
    /// The call completed with a response
    Success {
        /// Response headers
        headers: HeaderTable,
        /// Optional response body
        body: Option<Bytes>,
    },
    /// The call failed (reset, timeout, connect failure, ...)
    Failure {
        /// Failure reason, delivered to the script
        reason: String,
    },
}

/// Errors reported when a call cannot be issued at all
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The named cluster is not configured; no network activity happened
    #[error("unknown cluster '{0}': no such cluster is configured")]
    UnknownCluster(String),

    /// The manager rejected the call
    #[error("upstream call rejected: {0}")]
    Rejected(String),
}

/// Handle to one in-flight call. Cancellation is idempotent and guarantees
/// the outcome is never delivered to the issuing script.
#[derive(Debug, Clone)]
pub struct CallHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl CallHandle {
    /// Create a handle with the given id
    pub fn new(id: u64) -> Self {
        Self {
            id,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Call identifier assigned by the manager
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel the call; safe to invoke more than once
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!(call_id = self.id, "upstream call cancelled");
        }
    }

    /// Whether the call has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Issues side-channel calls on behalf of scripts
pub trait ClusterManager: Send + Sync + fmt::Debug {
    /// Accept a call for dispatch, or fail immediately without any network
    /// activity (e.g. when the cluster is unknown)
    fn issue_call(&self, request: CallRequest) -> Result<CallHandle, CallError>;
}

/// A call accepted by [`ConfiguredClusters`], waiting for dispatch
#[derive(Debug)]
pub struct PendingCall {
    /// Handle shared with the issuing driver
    pub handle: CallHandle,
    /// The request to dispatch
    pub request: CallRequest,
}

/// Cluster manager backed by a static set of configured cluster names.
///
/// Accepted calls are parked for the embedder, which dispatches them and
/// feeds the outcome back through the filter. Calls to unknown clusters
/// fail immediately.
#[derive(Debug)]
pub struct ConfiguredClusters {
    clusters: HashSet<String>,
    next_id: AtomicU64,
    pending: Mutex<Vec<PendingCall>>,
}

impl ConfiguredClusters {
    /// Create a manager knowing the given cluster names
    pub fn new<I, S>(clusters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            clusters: clusters.into_iter().map(Into::into).collect(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Drain the calls accepted since the last drain, skipping any that
    /// were cancelled in the meantime
    pub fn take_pending(&self) -> Vec<PendingCall> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending
            .drain(..)
            .filter(|call| !call.handle.is_cancelled())
            .collect()
    }

    /// Number of parked calls, cancelled ones included
    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl ClusterManager for ConfiguredClusters {
    fn issue_call(&self, request: CallRequest) -> Result<CallHandle, CallError> {
        if !self.clusters.contains(&request.cluster) {
            return Err(CallError::UnknownCluster(request.cluster));
        }
        let handle = CallHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(call_id = handle.id(), cluster = %request.cluster, "upstream call accepted");
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push(PendingCall {
            handle: handle.clone(),
            request,
        });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(cluster: &str) -> CallRequest {
        CallRequest {
            cluster: cluster.to_string(),
            headers: HeaderTable::new(),
            body: None,
            timeout: Duration::from_millis(250),
        }
    }

    #[test]
    fn unknown_cluster_fails_immediately() {
        let manager = ConfiguredClusters::new(["auth"]);
        let err = manager.issue_call(call("nope")).unwrap_err();
        assert!(err.to_string().contains("unknown cluster 'nope'"));
        assert_eq!(manager.pending_len(), 0);
    }

    #[test]
    fn accepted_calls_are_parked_until_drained() {
        let manager = ConfiguredClusters::new(["auth"]);
        let handle = manager.issue_call(call("auth")).unwrap();
        assert_eq!(manager.pending_len(), 1);

        let pending = manager.take_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].handle.id(), handle.id());
        assert_eq!(manager.pending_len(), 0);
    }

    #[test]
    fn cancelled_calls_are_never_dispatched() {
        let manager = ConfiguredClusters::new(["auth"]);
        let handle = manager.issue_call(call("auth")).unwrap();
        handle.cancel();
        handle.cancel(); // idempotent
        assert!(handle.is_cancelled());
        assert!(manager.take_pending().is_empty());
    }
}
