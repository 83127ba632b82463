//! Filter configuration: compile-once scripts and entry-point resolution.

use crate::engine::{self, ScriptSource};
use crate::error::{Result, ScriptError};
use crate::filter::Filter;
use crate::upstream::ClusterManager;
use rhai::AST;
use std::sync::Arc;
use tracing::debug;

/// Entry function invoked on the request path
pub const REQUEST_ENTRY: &str = "on_request";
/// Entry function invoked on the response path
pub const RESPONSE_ENTRY: &str = "on_response";

/// Global configuration for the filter.
///
/// The script is compiled once at configuration load; the resulting AST is
/// immutable and shared by every [`Filter`] built from this configuration.
/// Script evaluation itself always happens on a per-thread engine, see
/// [`crate::engine`].
#[derive(Debug)]
pub struct FilterConfig {
    source_name: String,
    ast: Arc<AST>,
    has_request_entry: bool,
    has_response_entry: bool,
    clusters: Arc<dyn ClusterManager>,
}

impl FilterConfig {
    /// Compile `source` and resolve the entry points.
    ///
    /// A script may define `on_request`, `on_response`, or both; a missing
    /// entry bypasses that direction entirely.
    pub async fn new(
        source: ScriptSource,
        clusters: Arc<dyn ClusterManager>,
    ) -> Result<Arc<Self>> {
        let source_name = source.name();
        let code = source.get_code().await?;

        let ast = engine::with_engine(|e| e.compile(&code))
            .map_err(|e| ScriptError::compilation(e.to_string()))?;

        let has_request_entry = ast.iter_functions().any(|f| f.name == REQUEST_ENTRY);
        let has_response_entry = ast.iter_functions().any(|f| f.name == RESPONSE_ENTRY);
        debug!(
            script = %source_name,
            request = has_request_entry,
            response = has_response_entry,
            "script compiled"
        );

        Ok(Arc::new(Self {
            source_name,
            ast: Arc::new(ast),
            has_request_entry,
            has_response_entry,
            clusters,
        }))
    }

    /// Entry function for the request path, when the script defines one
    pub fn request_entry(&self) -> Option<&'static str> {
        self.has_request_entry.then_some(REQUEST_ENTRY)
    }

    /// Entry function for the response path, when the script defines one
    pub fn response_entry(&self) -> Option<&'static str> {
        self.has_response_entry.then_some(RESPONSE_ENTRY)
    }

    /// Script name for diagnostics
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// The upstream-call collaborator
    pub fn clusters(&self) -> Arc<dyn ClusterManager> {
        Arc::clone(&self.clusters)
    }

    pub(crate) fn ast(&self) -> &AST {
        &self.ast
    }

    /// Build a pipeline filter backed by this configuration
    pub fn create_filter(self: &Arc<Self>) -> Filter {
        Filter::new(Arc::clone(self))
    }
}
