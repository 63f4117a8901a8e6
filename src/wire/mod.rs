use serde::Serialize;

pub mod protocol;

/// Serialises a frame for the wire.
///
/// Our frame types always encode; a failure here is a programming error, so
/// it is logged and the frame dropped rather than propagated to paths that
/// treat send failure as a dead socket.
pub fn encode<T: Serialize>(frame: &T) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(s) => Some(s),
        Err(error) => {
            tracing::error!(%error, "failed to encode frame");
            None
        },
    }
}
