//! Unified error type for ffpilot.
//!
//! Every failure a run can report funnels into [`Error`]. Callers that need
//! to react to the *kind* of failure rather than the exact variant use
//! [`Error::category`].

use std::time::Duration;

/// Unified error type covering all failure modes of a transcode run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The command could not be turned into an invocation (no output, bad
    /// filter description, builder misuse, run already in progress).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required binary could not be located.
    #[error("{tool} not found; is it installed and in PATH?")]
    ToolNotFound {
        /// Name of the missing tool.
        tool: String,
    },

    /// The operating system refused to start the process.
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        /// Name of the tool being started.
        tool: String,
        /// The underlying spawn error.
        source: std::io::Error,
    },

    /// The process exited with a non-zero code.
    #[error("{} exited with code {}{}", .tool, .code, diagnostic_suffix(.diagnostic))]
    Exited {
        /// Name of the tool that failed.
        tool: String,
        /// Exit code reported by the operating system.
        code: i32,
        /// Diagnostic text extracted from the tool's stderr.
        diagnostic: String,
    },

    /// The process was terminated by a signal.
    #[error("{tool} was killed with signal {signal}")]
    Killed {
        /// Name of the tool that was killed.
        tool: String,
        /// Signal name, e.g. `SIGKILL`.
        signal: String,
    },

    /// The stream feeding the process's stdin failed.
    #[error("Input stream error: {0}")]
    InputStream(String),

    /// The stream receiving the process's stdout failed.
    #[error("Output stream error: {0}")]
    OutputStream(String),

    /// The run exceeded its configured deadline.
    #[error("{tool} ran into a timeout ({after:?})")]
    Timeout {
        /// Name of the tool that was stopped.
        tool: String,
        /// The configured deadline.
        after: Duration,
    },

    /// A post-processing step failed after a successful transcode.
    #[error("Post-processing error [{tool}]: {message}")]
    PostProcess {
        /// The post-processing tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Reading media metadata failed.
    #[error("Probe error: {0}")]
    Probe(String),

    /// Reading a capability catalog failed.
    #[error("Capability error: {0}")]
    Capability(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

fn diagnostic_suffix(diagnostic: &str) -> String {
    if diagnostic.is_empty() {
        String::new()
    } else {
        format!(": {diagnostic}")
    }
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Detected before spawning; the command itself is unusable.
    Configuration,
    /// A required binary is missing.
    Resolution,
    /// The process failed to start, exited non-zero, or was killed.
    Process,
    /// An attached input or output stream failed.
    Stream,
    /// The run hit its deadline.
    Timeout,
    /// The transcode succeeded but post-processing failed.
    PostProcess,
    /// Metadata or catalog output could not be read.
    Probe,
    /// Any other I/O failure.
    Io,
}

impl Error {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) => ErrorCategory::Configuration,
            Error::ToolNotFound { .. } => ErrorCategory::Resolution,
            Error::Spawn { .. } | Error::Exited { .. } | Error::Killed { .. } => {
                ErrorCategory::Process
            }
            Error::InputStream(_) | Error::OutputStream(_) => ErrorCategory::Stream,
            Error::Timeout { .. } => ErrorCategory::Timeout,
            Error::PostProcess { .. } => ErrorCategory::PostProcess,
            Error::Probe(_) | Error::Capability(_) => ErrorCategory::Probe,
            Error::Io { .. } => ErrorCategory::Io,
        }
    }

    /// Convenience constructor for [`Error::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Convenience constructor for [`Error::ToolNotFound`].
    pub fn tool_not_found(tool: impl Into<String>) -> Self {
        Error::ToolNotFound { tool: tool.into() }
    }

    /// Convenience constructor for [`Error::Exited`] without diagnostic text.
    pub fn exited(tool: impl Into<String>, code: i32) -> Self {
        Error::Exited {
            tool: tool.into(),
            code,
            diagnostic: String::new(),
        }
    }

    /// Convenience constructor for [`Error::Killed`].
    pub fn killed(tool: impl Into<String>, signal: impl Into<String>) -> Self {
        Error::Killed {
            tool: tool.into(),
            signal: signal.into(),
        }
    }

    /// Convenience constructor for [`Error::PostProcess`].
    pub fn post_process(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::PostProcess {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Attach stderr diagnostic text to a non-zero exit error.
    ///
    /// Every other variant is returned unchanged: only a normal exit with a
    /// failure code carries the tool's own explanation.
    pub fn with_diagnostic(self, text: impl Into<String>) -> Self {
        match self {
            Error::Exited { tool, code, .. } => Error::Exited {
                tool,
                code,
                diagnostic: text.into(),
            },
            other => other,
        }
    }

    /// Whether this error was raised before any process was spawned.
    pub fn is_pre_spawn(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Configuration | ErrorCategory::Resolution
        )
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
