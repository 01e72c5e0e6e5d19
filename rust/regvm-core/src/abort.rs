//! VM-level aborts: the structured exception that unwinds script execution.

use std::any::Any;

use strum::Display;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum AbortKind {
    #[strum(serialize = "abort")]
    Other,
    #[strum(serialize = "null pointer")]
    NullPointer,
    #[strum(serialize = "bad argument")]
    BadArgument,
    #[strum(serialize = "too many parameters")]
    TooManyParameters,
    #[strum(serialize = "function not compiled")]
    NotCompiled,
    #[strum(serialize = "host panic")]
    HostPanic,
}

/// An abort raised by host or script code, with the textual stack trace built
/// up as it crosses call boundaries.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct VmAbort {
    pub kind: AbortKind,
    pub message: String,
    pub stacktrace: String,
    printed: bool,
}

impl VmAbort {
    pub fn new(kind: AbortKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let stacktrace = format!("{message}\n");
        Self {
            kind,
            message,
            stacktrace,
            printed: false,
        }
    }

    /// Convert a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "host function panicked".to_string()
        };
        Self::new(AbortKind::HostPanic, message)
    }

    /// Append a "Called from" line for a frame the abort unwinds through.
    pub fn push_frame(&mut self, name: &str) {
        self.stacktrace.push_str("Called from ");
        self.stacktrace.push_str(name);
        self.stacktrace.push('\n');
    }

    /// Report the message once, the first time the abort crosses a native
    /// boundary.
    pub fn maybe_print_message(&mut self) {
        if self.printed {
            return;
        }
        self.printed = true;
        tracing::warn!(kind = %self.kind, "{}", self.message);
    }

    pub fn message_printed(&self) -> bool {
        self.printed
    }
}
