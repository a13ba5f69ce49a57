//! Terminal outcomes of a correlated request.

use serde_json::Value;

/// How a `send_and_await` call ended when no transport error occurred.
///
/// Timeout and shutdown are ordinary results, not errors: the HTTP layer
/// maps them to its own status codes.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The correlated reply payload
    Response(Value),
    /// No reply arrived before the deadline
    TimedOut,
    /// The relay stopped while the request was pending
    Shutdown,
}

impl Outcome {
    /// Whether a reply was received
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response(_))
    }

    /// Reply payload, if any
    pub fn into_response(self) -> Option<Value> {
        match self {
            Self::Response(value) => Some(value),
            Self::TimedOut | Self::Shutdown => None,
        }
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Response(_) => "response",
            Self::TimedOut => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Value delivered through a waiter's one-shot slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Response(Value),
    Shutdown,
}

impl From<Resolution> for Outcome {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Response(value) => Self::Response(value),
            Resolution::Shutdown => Self::Shutdown,
        }
    }
}
