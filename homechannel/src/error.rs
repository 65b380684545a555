//! Error taxonomy shared by client-facing errors
//!
//! | Kind           | Examples                                             | Retry? |
//! |----------------|------------------------------------------------------|--------|
//! | Transport      | signaling open/timeout, poll timeout, transport open | yes    |
//! | Authentication | agent offline, wrong password, bad answer signature  | no     |
//! | Protocol       | malformed envelope, reserved-name collision          | no     |
//! | Resource       | registry full, session not found or expired          | no     |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Authentication,
    Protocol,
    Resource,
}

impl ErrorKind {
    /// Whether retrying the whole attempt may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transport)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Authentication => write!(f, "authentication"),
            Self::Protocol => write!(f, "protocol"),
            Self::Resource => write!(f, "resource"),
        }
    }
}
