// Copyright 2025 Sandflow (https://github.com/sandflow)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Error types shared across the pipeline.
//!
//! One closed enum is the common currency between crates; each variant maps
//! to one failure class of the surrounding component. Only the server
//! binary converts these into process exit codes or HTTP statuses.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SandflowError>;

/// Pipeline-wide error kinds.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandflowError {
    /// Invalid or missing configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Store failure after the retry budget is exhausted.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Shared cache failure; UVE mirror and subscriptions degrade.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Framing violation on a producer connection.
    #[error("frame error: {0}")]
    Frame(String),

    /// Malformed or out-of-order handshake.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// TLS authentication failure.
    #[error("auth error: {0}")]
    Auth(String),

    /// Query start_time precedes the family's analytics epoch.
    #[error("start time {start_usec} is below the retention epoch {epoch_usec}")]
    BelowRetention { start_usec: u64, epoch_usec: u64 },

    /// The planner cannot satisfy the where clause with the available indexes.
    #[error("unsupported predicate: {0}")]
    UnsupportedPredicate(String),

    /// Query deadline expired; partial stats are attached to the response.
    #[error("query timed out")]
    QueryTimeout,

    /// Operation cancelled by the caller.
    #[error("cancelled")]
    Cancelled,

    /// Queue high watermark reached.
    #[error("overloaded")]
    Overloaded,

    /// Encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O failure (stringified to keep the enum cloneable).
    #[error("io error: {0}")]
    Io(String),

    /// Invariant violation that is a bug, not an operational condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SandflowError {
    fn from(e: std::io::Error) -> Self {
        SandflowError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for SandflowError {
    fn from(e: serde_json::Error) -> Self {
        SandflowError::Serialization(e.to_string())
    }
}

impl SandflowError {
    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SandflowError::StoreUnavailable(_) | SandflowError::CacheUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SandflowError::StoreUnavailable("down".into()).is_transient());
        assert!(!SandflowError::Config("bad".into()).is_transient());
        assert!(!SandflowError::QueryTimeout.is_transient());
    }

    #[test]
    fn test_below_retention_message() {
        let e = SandflowError::BelowRetention {
            start_usec: 100,
            epoch_usec: 200,
        };
        assert!(e.to_string().contains("100"));
        assert!(e.to_string().contains("200"));
    }
}
