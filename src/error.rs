use crate::interleave::InterleaveError;
use crate::store::ConnectionId;

/// Failures raised while handling one connection.
///
/// None of these are fatal to the process; only [`BridgeError::Authorization`]
/// closes the socket.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("unknown event type `{0}`")]
    UnknownEvent(String),
    #[error("{event} received on connection {connection} {detail}")]
    ProtocolOrder {
        connection: ConnectionId,
        event: &'static str,
        detail: &'static str,
    },
    #[error("account id `{received}` is not authorized")]
    Authorization { received: String },
    #[error("duplicate end of call {call_id}: {detail}")]
    DuplicateEnd { call_id: String, detail: &'static str },
    #[error("upstream i/o failed while {context}: {source}")]
    UpstreamIo {
        context: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("socket error: {0}")]
    Socket(String),
}

impl BridgeError {
    pub(crate) fn upstream(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        BridgeError::UpstreamIo {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Whether the connection has to be closed after this error.
    pub fn closes_connection(&self) -> bool {
        matches!(self, BridgeError::Authorization { .. })
    }
}

impl From<InterleaveError> for BridgeError {
    fn from(e: InterleaveError) -> Self {
        BridgeError::upstream("interleaving tracks", e)
    }
}
