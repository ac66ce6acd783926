use std::sync::Arc;

use thiserror::Error;

/// Errors produced by the proxy core.
///
/// Clonable on purpose: a single transport failure on a backend connection
/// fans out to every request still queued behind it.
#[derive(Debug, Error, Clone)]
pub enum ProxyError {
    // protocol
    #[error("bad resp CRLF end")]
    BadCrlfEnd,
    #[error("bad resp bytes len")]
    BadBulkBytesLen,
    #[error("bad resp bytes len, too long")]
    BadBulkBytesLenTooLong,
    #[error("bad resp array len")]
    BadArrayLen,
    #[error("bad resp array len, too long")]
    BadArrayLenTooLong,
    #[error("bad resp type {0:#04x}")]
    BadRespType(u8),
    #[error("bad resp integer")]
    BadInteger,
    #[error("bad multi-bulk len")]
    BadMultiBulkLen,
    #[error("bad multi-bulk content, should be bulkbytes")]
    BadMultiBulkContent,
    #[error("too much pending data in session buffer")]
    TooMuchPendingData,
    #[error("use of failed decoder")]
    FailedDecoder,
    #[error("use of failed encoder")]
    FailedEncoder,

    // policy
    #[error("bad command length, too short or too long")]
    BadOpStrLen,
    #[error("command '{0}' not allowed")]
    CommandNotAllowed(String),

    // transport
    #[error("backend io: {0}")]
    Io(Arc<std::io::Error>),
    #[error("dial backend {0} timed out")]
    DialTimeout(String),
    #[error("read backend {0} timed out")]
    ReadTimeout(String),
    #[error("write backend {0} timed out")]
    WriteTimeout(String),
    #[error("backend auth rejected: {0}")]
    AuthRejected(String),
    #[error("backend connection reset")]
    ConnReset,
    #[error("migrate key failed: {0}")]
    MigrateFailed(String),
    #[error("discarded request")]
    DiscardedRequest,

    // administrative
    #[error("use of closed router")]
    ClosedRouter,
    #[error("use of invalid slot id")]
    InvalidSlotId,
    #[error("slot is not ready")]
    SlotNotReady,
}

impl ProxyError {
    /// Render this error the way it is written to a RESP client.
    pub fn to_reply(&self) -> String {
        format!("ERR {}", self)
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Arc::new(err))
    }
}

impl PartialEq for ProxyError {
    fn eq(&self, other: &Self) -> bool {
        use ProxyError::*;
        match (self, other) {
            (Io(a), Io(b)) => a.kind() == b.kind(),
            (BadRespType(a), BadRespType(b)) => a == b,
            (CommandNotAllowed(a), CommandNotAllowed(b)) => a == b,
            (DialTimeout(a), DialTimeout(b)) => a == b,
            (ReadTimeout(a), ReadTimeout(b)) => a == b,
            (WriteTimeout(a), WriteTimeout(b)) => a == b,
            (AuthRejected(a), AuthRejected(b)) => a == b,
            (MigrateFailed(a), MigrateFailed(b)) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl Eq for ProxyError {}

pub type Result<T> = std::result::Result<T, ProxyError>;
