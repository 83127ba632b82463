//! Error types for script loading, compilation, and execution.

/// Result type alias using [`ScriptError`]
pub type Result<T, E = ScriptError> = std::result::Result<T, E>;

/// Errors raised while loading, compiling, or running a stream script.
///
/// A `Runtime` or `Panic` error terminates script involvement for the
/// affected direction; the stream itself keeps flowing unmodified.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    /// Script failed to parse or compile at configuration load
    #[error("script compilation error: {message}")]
    Compilation {
        /// Error message (includes position when the parser reports one)
        message: String,
    },

    /// Script raised a runtime fault
    #[error("script runtime error: {message}")]
    Runtime {
        /// Error message
        message: String,
    },

    /// The script thread terminated without reporting a result
    #[error("script execution panicked: {message}")]
    Panic {
        /// Panic message
        message: String,
    },

    /// Access through a handle whose owning stream has been destroyed
    #[error("stale {what} handle: the owning stream has been destroyed")]
    StaleHandle {
        /// Which handle was accessed
        what: &'static str,
    },

    /// A script-supplied header table could not be converted
    #[error("malformed header table: {message}")]
    MalformedHeaderTable {
        /// Error message
        message: String,
    },

    /// Reading a script source failed
    #[error("script IO error: {message}")]
    Io {
        /// Error message
        message: String,
    },
}

impl ScriptError {
    /// Create a compilation error
    pub fn compilation<S: Into<String>>(message: S) -> Self {
        Self::Compilation {
            message: message.into(),
        }
    }

    /// Create a runtime error
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create a panic error
    pub fn panic<S: Into<String>>(message: S) -> Self {
        Self::Panic {
            message: message.into(),
        }
    }

    /// Create a malformed header table error
    pub fn malformed_headers<S: Into<String>>(message: S) -> Self {
        Self::MalformedHeaderTable {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ScriptError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<Box<rhai::EvalAltResult>> for ScriptError {
    fn from(err: Box<rhai::EvalAltResult>) -> Self {
        Self::Runtime {
            message: err.to_string(),
        }
    }
}
