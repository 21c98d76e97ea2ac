//! Typed errors for the proxy engine's component boundaries.
//!
//! Internal plumbing within a single module is free to use `anyhow`, as the
//! teacher code does throughout. `ProxyError` exists for the handful of
//! places where a caller needs to match on *kind* to decide whether an
//! error is fatal, session-local, or merely logged and ignored (see
//! spec.md §7).

/// One variant per row of the error-kind table in spec.md §7.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Unrecoverable: the process cannot start.
    #[error("fatal configuration error: {0}")]
    ConfigFatal(String),

    /// A single socket's read/write failed. Only that session is affected.
    #[error("transient I/O error: {0}")]
    TransientIo(#[from] std::io::Error),

    /// Bad HTTP framing on one message. The session closes without
    /// tagging or scanning that message.
    #[error("malformed HTTP framing: {0}")]
    ProtocolMalformed(String),

    /// Key generation or X.509 signing failed for one host.
    #[error("certificate generation failed for {host}: {source}")]
    Crypto {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    /// The cert-cache file could not be read or written. The in-memory
    /// cache remains authoritative; this is logged, not propagated.
    #[error("cert cache persistence error: {0}")]
    Persist(#[source] anyhow::Error),

    /// The tracer-event queue was full; the oldest event was dropped.
    #[error("tracer event queue overflowed, dropped {dropped} events so far")]
    StoreBackpressure { dropped: u64 },
}

impl ProxyError {
    /// Whether this error should terminate the whole process rather than
    /// just the session or operation that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::ConfigFatal(_))
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
