//! Protocol messages the routing node exchanges on its own behalf.
//!
//! Thin helpers that build and read the `mmrp.*` envelopes, keeping payload
//! layout out of the routing code.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, TRACK_ROUTE};
use crate::error::MeshError;

/// Sent to a peer right after connecting to it.
pub const HANDSHAKE_TYPE: &str = "mmrp.handshake";

/// Sent back along the return route when an envelope could not be delivered.
pub const SEND_ERROR_TYPE: &str = "mmrp.sendError";

/// Who the sender of a handshake is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub cluster_id: String,
    pub identity: String,
    pub is_relay: bool,
    pub is_client: bool,
}

impl HandshakePayload {
    /// Build the handshake envelope addressed to `route`.
    ///
    /// Route tracking is on so the receiver learns the path back to us.
    pub fn into_envelope(self, route: Vec<String>) -> Result<Envelope, MeshError> {
        let payload = serde_json::to_vec(&self)?;
        Ok(Envelope::new(HANDSHAKE_TYPE, [payload])?
            .with_route(route)
            .with_flags(TRACK_ROUTE))
    }

    /// Read the payload of a received handshake envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, MeshError> {
        let frame = envelope
            .messages()
            .first()
            .ok_or_else(|| MeshError::Malformed("handshake without payload".into()))?;
        Ok(serde_json::from_slice(frame)?)
    }
}

/// Build the error report for an envelope that could not be sent.
///
/// Messages: the error text, the original message type, then the original
/// messages. Returns `None` when there is no way back or the failed envelope
/// is itself an error report.
pub fn send_error_envelope(failed: &Envelope, error: &MeshError) -> Option<Envelope> {
    if failed.return_route().is_empty() || failed.message_type() == SEND_ERROR_TYPE {
        return None;
    }

    let mut messages = vec![
        Bytes::from(error.to_string()),
        Bytes::from(failed.message_type().to_string()),
    ];
    messages.extend(failed.messages().iter().cloned());

    let envelope = Envelope::new(SEND_ERROR_TYPE, messages)
        .ok()?
        .with_route(failed.return_route().to_vec());
    Some(envelope)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> HandshakePayload {
        HandshakePayload {
            cluster_id: "east".into(),
            identity: "east/42-0".into(),
            is_relay: false,
            is_client: true,
        }
    }

    #[test]
    fn test_handshake_envelope() {
        let env = payload().into_envelope(vec!["east".into()]).unwrap();
        assert_eq!(env.message_type(), HANDSHAKE_TYPE);
        assert_eq!(env.route(), &["east".to_string()]);
        assert!(env.is_flagged(TRACK_ROUTE));

        let parsed = HandshakePayload::from_envelope(&env).unwrap();
        assert_eq!(parsed, payload());
    }

    #[test]
    fn test_handshake_without_payload_is_rejected() {
        let env = Envelope::new(HANDSHAKE_TYPE, Vec::<Bytes>::new()).unwrap();
        assert!(HandshakePayload::from_envelope(&env).is_err());

        let garbage = Envelope::new(HANDSHAKE_TYPE, ["not json"]).unwrap();
        assert!(matches!(
            HandshakePayload::from_envelope(&garbage),
            Err(MeshError::Serialization(_))
        ));
    }

    #[test]
    fn test_send_error_envelope() {
        let failed = Envelope::new("game.move", ["e2e4"])
            .unwrap()
            .with_route(["nowhere"])
            .with_return_route(["b", "x"]);
        let err = MeshError::Unreachable("nowhere".into());

        let report = send_error_envelope(&failed, &err).unwrap();
        assert_eq!(report.message_type(), SEND_ERROR_TYPE);
        assert_eq!(report.route(), &["b".to_string(), "x".to_string()]);
        assert_eq!(report.messages().len(), 3);
        assert_eq!(&report.messages()[0][..], err.to_string().as_bytes());
        assert_eq!(&report.messages()[1][..], b"game.move");
        assert_eq!(&report.messages()[2][..], b"e2e4");
    }

    #[test]
    fn test_no_error_of_error() {
        let err = MeshError::Unreachable("x".into());
        let no_way_back = Envelope::new("a", ["x"]).unwrap().with_route(["b"]);
        assert!(send_error_envelope(&no_way_back, &err).is_none());

        let report = Envelope::new(SEND_ERROR_TYPE, ["x"])
            .unwrap()
            .with_return_route(["b"]);
        assert!(send_error_envelope(&report, &err).is_none());
    }
}
