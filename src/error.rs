// Error taxonomy for cluster routing

use crate::protocol::RespError;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the cluster engine.
///
/// Server error replies travel inside `Server` with their payload
/// verbatim; redirection directives (MOVED, ASK) and loading states are
/// classified out of that payload by the dispatcher, never surfaced as
/// distinct variants.
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("cluster has no nodes")]
    NoNodes,

    #[error("cluster has no state")]
    NoState,

    #[error("pool is closed")]
    PoolClosed,

    #[error("connection pool timeout")]
    PoolTimeout,

    #[error("keys do not hash to the same slot")]
    CrossSlot,

    #[error("transaction aborted")]
    TxFailed,

    /// Protocol-level error reply from a server, payload verbatim
    #[error("{0}")]
    Server(String),

    #[error("protocol error: {0}")]
    Resp(#[from] RespError),

    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    #[error("operation timed out")]
    Timeout,
}

impl From<io::Error> for ClusterError {
    fn from(err: io::Error) -> Self {
        ClusterError::Io(Arc::new(err))
    }
}

/// Kind of a server-issued redirection directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// Permanent: the slot moved, refresh the map
    Moved,
    /// Transient: valid for one command when prefixed by ASKING
    Ask,
}

/// A parsed redirection directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    pub addr: String,
}

impl ClusterError {
    /// Parse a MOVED/ASK directive out of a server error reply.
    /// Format: "MOVED 3999 127.0.0.1:6381" / "ASK 3999 127.0.0.1:6381"
    pub fn redirect(&self) -> Option<Redirect> {
        let ClusterError::Server(msg) = self else {
            return None;
        };
        let mut parts = msg.split_whitespace();
        let kind = match parts.next() {
            Some("MOVED") => RedirectKind::Moved,
            Some("ASK") => RedirectKind::Ask,
            _ => return None,
        };
        let slot = parts.next()?.parse::<u16>().ok()?;
        let addr = parts.next()?;
        Some(Redirect {
            kind,
            slot,
            addr: addr.to_string(),
        })
    }

    /// True for a server reply announcing the node is hot-loading data
    pub fn is_loading(&self) -> bool {
        matches!(self, ClusterError::Server(msg) if msg.starts_with("LOADING"))
    }

    /// Errors worth retrying against another node: transport failures
    /// and the server states that resolve on their own. LOADING is not
    /// among them; it is only acted on by read-only routing, anywhere
    /// else it surfaces to the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClusterError::Io(_) | ClusterError::Timeout | ClusterError::PoolTimeout => true,
            ClusterError::Server(msg) => {
                msg.starts_with("READONLY")
                    || msg.starts_with("CLUSTERDOWN")
                    || msg.starts_with("TRYAGAIN")
            }
            _ => false,
        }
    }

    /// True for protocol-level error replies. These belong to the
    /// command that provoked them and are never retried.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ClusterError::Server(_))
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
