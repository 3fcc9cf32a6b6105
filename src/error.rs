//! Error taxonomy for the engine (spec §7).
//!
//! Every error produced by a `Run` carries the originating node's name and
//! the phase it failed in, so a caller can tell `classify/prep` apart from
//! `classify/exec` without parsing a message string.

use std::fmt;

/// Which phase of a node's lifecycle an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InputValidation,
    Prep,
    Exec,
    OutputValidation,
    Post,
    Routing,
    Engine,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::InputValidation => "input-validation",
            Phase::Prep => "prep",
            Phase::Exec => "exec",
            Phase::OutputValidation => "output-validation",
            Phase::Post => "post",
            Phase::Routing => "routing",
            Phase::Engine => "engine",
        };
        write!(f, "{s}")
    }
}

/// The error kind, independent of the node/phase it occurred in. Mirrors
/// spec §7's taxonomy table one-for-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputValidation,
    OutputValidation,
    PhaseExecution,
    ExecFailure,
    Timeout,
    Cancelled,
    Routing,
    DepthExceeded,
    ValidatorFailure,
    PluginCall,
}

/// A single validator violation, collected by `Graph::validate` (§4.4).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationIssue {
    #[error("node name '{0}' is used more than once in the graph")]
    DuplicateName(String),
    #[error("node '{0}' routes action '{1}' to an undefined successor")]
    DanglingEdge(String, String),
    #[error(
        "edge {from} -{action}-> {to} is type-incompatible: output type {output_ty} cannot flow into input type {input_ty}"
    )]
    TypeMismatch {
        from: String,
        action: String,
        to: String,
        output_ty: String,
        input_ty: String,
    },
}

/// The unified error type returned by `Graph::run` and every engine-facing
/// operation.
#[derive(Debug, thiserror::Error)]
pub enum PocketError {
    #[error("node '{node}' rejected input during {phase}: {message}")]
    InputValidation {
        node: String,
        phase: Phase,
        message: String,
    },

    #[error("node '{node}' produced an invalid output during {phase}: {message}")]
    OutputValidation {
        node: String,
        phase: Phase,
        message: String,
    },

    #[error("node '{node}' failed during {phase}: {message}")]
    PhaseExecution {
        node: String,
        phase: Phase,
        message: String,
    },

    #[error("node '{node}' exec failed after exhausting retry budget: {message}")]
    ExecFailure {
        node: String,
        phase: Phase,
        message: String,
    },

    #[error("node '{node}' exec timed out after {elapsed_ms}ms")]
    Timeout {
        node: String,
        phase: Phase,
        elapsed_ms: u64,
    },

    #[error("node '{node}' observed cancellation during {phase}")]
    Cancelled { node: String, phase: Phase },

    #[error("node '{node}' post returned action '{action}' with no matching successor")]
    Routing {
        node: String,
        phase: Phase,
        action: String,
    },

    #[error("run exceeded max-depth ({max_depth}) at node '{node}'; the graph likely cycles")]
    DepthExceeded { node: String, max_depth: usize },

    #[error("graph failed static validation with {} issue(s): {}", .issues.len(), join_issues(.issues))]
    ValidatorFailure { issues: Vec<ValidationIssue> },

    #[error("plugin call into node '{node}' failed: {message}")]
    PluginCall {
        node: String,
        phase: Phase,
        message: String,
    },
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl PocketError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PocketError::InputValidation { .. } => ErrorKind::InputValidation,
            PocketError::OutputValidation { .. } => ErrorKind::OutputValidation,
            PocketError::PhaseExecution { .. } => ErrorKind::PhaseExecution,
            PocketError::ExecFailure { .. } => ErrorKind::ExecFailure,
            PocketError::Timeout { .. } => ErrorKind::Timeout,
            PocketError::Cancelled { .. } => ErrorKind::Cancelled,
            PocketError::Routing { .. } => ErrorKind::Routing,
            PocketError::DepthExceeded { .. } => ErrorKind::DepthExceeded,
            PocketError::ValidatorFailure { .. } => ErrorKind::ValidatorFailure,
            PocketError::PluginCall { .. } => ErrorKind::PluginCall,
        }
    }

    /// Whether this error is the retryable kind fed into the fallback/retry
    /// pipeline around Exec (ExecFailure and Timeout; see spec §7).
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ExecFailure | ErrorKind::Timeout)
    }

    pub fn node(&self) -> Option<&str> {
        match self {
            PocketError::InputValidation { node, .. }
            | PocketError::OutputValidation { node, .. }
            | PocketError::PhaseExecution { node, .. }
            | PocketError::ExecFailure { node, .. }
            | PocketError::Timeout { node, .. }
            | PocketError::Cancelled { node, .. }
            | PocketError::Routing { node, .. }
            | PocketError::PluginCall { node, .. } => Some(node),
            PocketError::DepthExceeded { node, .. } => Some(node),
            PocketError::ValidatorFailure { .. } => None,
        }
    }
}

/// Result alias used throughout the engine.
pub type PocketResult<T> = Result<T, PocketError>;
