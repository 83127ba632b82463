//! Script sources and per-thread engine construction.
//!
//! Engines are never shared across threads: each thread that evaluates a
//! script gets its own lazily constructed [`rhai::Engine`] through
//! [`with_engine`]. Compiled ASTs are portable between these engines, so a
//! script is still compiled exactly once per configuration.

use crate::error::{Result, ScriptError};
use crate::handles;
use rhai::Engine;
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Script source (inline or file-based)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptSource {
    /// Inline script code
    Inline {
        /// Script code
        code: String,
        /// Optional name for diagnostics
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// File-based script
    File {
        /// Path to script file
        path: PathBuf,
    },
}

impl ScriptSource {
    /// Create inline script source
    pub fn inline<S: Into<String>>(code: S) -> Self {
        Self::Inline {
            code: code.into(),
            name: None,
        }
    }

    /// Create inline script with name
    pub fn inline_named<S: Into<String>, N: Into<String>>(code: S, name: N) -> Self {
        Self::Inline {
            code: code.into(),
            name: Some(name.into()),
        }
    }

    /// Create file-based script source
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self::File { path: path.into() }
    }

    /// Get script code (loads from file if needed)
    pub async fn get_code(&self) -> Result<String> {
        match self {
            Self::Inline { code, .. } => Ok(code.clone()),
            Self::File { path } => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ScriptError::Io {
                    message: format!("failed to read script file {:?}: {}", path, e),
                }),
        }
    }

    /// Get a descriptive name for this script
    pub fn name(&self) -> String {
        match self {
            Self::Inline { name, .. } => name.clone().unwrap_or_else(|| "inline".to_string()),
            Self::File { path } => path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

/// Run `f` with this thread's script engine, constructing it on first use.
pub(crate) fn with_engine<R>(f: impl FnOnce(&Engine) -> R) -> R {
    thread_local! {
        static ENGINE: OnceCell<Engine> = const { OnceCell::new() };
    }
    ENGINE.with(|cell| f(cell.get_or_init(build_engine)))
}

/// Build a fully configured engine: safety limits, stream handle types,
/// and script utility functions.
fn build_engine() -> Engine {
    let mut engine = Engine::new();

    // Configure engine for safety and performance
    engine.set_max_expr_depths(25, 10); // Reasonable depth limits
    engine.set_max_operations(100_000); // Prevent runaway loops
    engine.set_max_string_size(1024 * 1024); // 1MB string limit
    engine.set_max_array_size(10_000); // Array size limit
    engine.set_max_map_size(10_000); // Map size limit

    handles::register_stream_types(&mut engine);
    register_util_functions(&mut engine);

    debug!("script engine constructed for current thread");
    engine
}

/// Register utility functions available to all scripts
fn register_util_functions(engine: &mut Engine) {
    // String utilities
    engine.register_fn("base64_encode", |s: &str| -> String {
        use base64::{engine::general_purpose, Engine as _};
        general_purpose::STANDARD.encode(s.as_bytes())
    });

    engine.register_fn("base64_decode", |s: &str| -> String {
        use base64::{engine::general_purpose, Engine as _};
        general_purpose::STANDARD
            .decode(s.as_bytes())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_default()
    });

    // Utility functions
    engine.register_fn("unix_time", || -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    });

    engine.register_fn("uuid", || -> String { uuid::Uuid::new_v4().to_string() });

    // Logging (for debugging scripts)
    engine.register_fn("log_debug", |msg: &str| {
        debug!(script_log = msg);
    });

    engine.register_fn("log_info", |msg: &str| {
        tracing::info!(script_log = msg);
    });

    engine.register_fn("log_warn", |msg: &str| {
        warn!(script_log = msg);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_source_name_and_code() {
        let source = ScriptSource::inline_named("1 + 1", "adder");
        assert_eq!(source.name(), "adder");

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        assert_eq!(rt.block_on(source.get_code()).unwrap(), "1 + 1");
    }

    #[test]
    fn missing_file_source_fails() {
        let source = ScriptSource::file("/nonexistent/script.rhai");
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        assert!(rt.block_on(source.get_code()).is_err());
    }

    #[test]
    fn util_functions_are_registered() {
        let encoded = with_engine(|engine| {
            engine
                .eval::<String>(r#"base64_decode(base64_encode("hello"))"#)
                .unwrap()
        });
        assert_eq!(encoded, "hello");
    }

    #[test]
    fn runaway_scripts_are_cut_off() {
        let result = with_engine(|engine| engine.eval::<i64>("let x = 0; loop { x += 1; }"));
        assert!(result.is_err());
    }

    #[test]
    fn source_deserializes_from_inline_and_file_forms() {
        let inline: ScriptSource = serde_json::from_str(r#"{"code": "1"}"#).unwrap();
        assert!(matches!(inline, ScriptSource::Inline { .. }));
        let file: ScriptSource = serde_json::from_str(r#"{"path": "/tmp/x.rhai"}"#).unwrap();
        assert!(matches!(file, ScriptSource::File { .. }));
    }
}
