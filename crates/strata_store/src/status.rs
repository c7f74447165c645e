//! RPC-visible status codes and their retry classification.
//!
//! Internal plumbing uses `anyhow`; anything that crosses an RPC seam or is
//! reported per-row carries a `StatusCode` so callers can classify failures
//! without string matching.

use serde::{Deserialize, Serialize};

/// Status carried in every RPC response and per-row result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    /// Transient transport failures: retry with backoff.
    RpcTimeout,
    ConnectError,
    SendBufferFull,
    /// The contacted server no longer serves the key: refresh routing.
    KeyNotInRange,
    /// Remote side is up but refusing: retry, counts against server health.
    ServerUnavailable,
    ServerShutdown,
    TabletNotReady,
    /// Terminal, user-visible.
    NotFound,
    SnapshotNotExist,
    BadParam,
    TableExist,
    TableNotFound,
    TableNotEnabled,
    NotPermission,
    TxnFail,
    /// Terminal, operator-visible: meta corruption or a refused state edge.
    MetaCorrupt,
    InvalidTransition,
    /// Flow-control rejection: immediate callback, caller retries.
    Busy,
    /// Client-side task deadline expired.
    Timeout,
}

impl StatusCode {
    /// Whether the client request pipeline should retry this error.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            StatusCode::RpcTimeout
                | StatusCode::ConnectError
                | StatusCode::SendBufferFull
                | StatusCode::KeyNotInRange
                | StatusCode::ServerUnavailable
                | StatusCode::ServerShutdown
                | StatusCode::TabletNotReady
        )
    }

    /// Whether this error should invalidate the meta cache entry that routed it.
    pub fn is_routing_stale(self) -> bool {
        matches!(self, StatusCode::KeyNotInRange | StatusCode::ConnectError)
    }

    /// Terminal errors are returned to the caller without retry.
    pub fn is_terminal(self) -> bool {
        !self.is_retryable() && self != StatusCode::Ok && self != StatusCode::Busy
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_stale_codes_are_retryable() {
        for code in [StatusCode::KeyNotInRange, StatusCode::ConnectError] {
            assert!(code.is_routing_stale());
            assert!(code.is_retryable());
        }
        assert!(!StatusCode::NotFound.is_routing_stale());
    }

    #[test]
    fn terminal_codes_never_retry() {
        for code in [
            StatusCode::NotFound,
            StatusCode::SnapshotNotExist,
            StatusCode::BadParam,
            StatusCode::TableExist,
            StatusCode::TableNotFound,
            StatusCode::NotPermission,
            StatusCode::TxnFail,
        ] {
            assert!(code.is_terminal());
            assert!(!code.is_retryable());
        }
        assert!(!StatusCode::Busy.is_terminal());
        assert!(!StatusCode::Ok.is_terminal());
    }
}
