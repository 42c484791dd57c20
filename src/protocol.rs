//! Signaling wire messages exchanged with the remote peer.
//!
//! The relay never talks to the signaling transport itself; the embedding
//! adapter hands inbound messages to [`PeerRelay::add_ice_message`] and
//! forwards outbound ones from the sdp/candidate callbacks. The JSON shapes
//! are fixed: `{"type":"offer","sdp":...}`, `{"type":"answer","sdp":...}` and
//! `{"type":"candidate","candidate":{"sdpMid":...,"sdpMLineIndex":...,
//! "candidate":...}}`.
//!
//! [`PeerRelay::add_ice_message`]: crate::relay::PeerRelay::add_ice_message

use serde::{Deserialize, Serialize};

/// A trickled ICE candidate as it appears on the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    pub sdp_mid: String,
    pub sdp_m_line_index: u32,
    /// The candidate line itself, e.g. `candidate:... 1 udp ... typ host`.
    pub candidate: String,
}

/// One signaling message, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IceMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: CandidateInit },
}

impl IceMessage {
    /// Label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            IceMessage::Offer { .. } => "offer",
            IceMessage::Answer { .. } => "answer",
            IceMessage::Candidate { .. } => "candidate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_wire_shape() {
        let msg = IceMessage::Offer {
            sdp: "v=0...".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0...");
    }

    #[test]
    fn candidate_wire_shape_uses_camel_case_keys() {
        let msg = IceMessage::Candidate {
            candidate: CandidateInit {
                sdp_mid: "0".into(),
                sdp_m_line_index: 0,
                candidate: "candidate:1 1 udp 2130706431 10.0.0.2 51000 typ host".into(),
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "candidate");
        assert_eq!(json["candidate"]["sdpMid"], "0");
        assert_eq!(json["candidate"]["sdpMLineIndex"], 0);
        assert!(
            json["candidate"]["candidate"]
                .as_str()
                .unwrap()
                .starts_with("candidate:")
        );
    }

    #[test]
    fn parses_remote_messages() {
        let offer: IceMessage = serde_json::from_str(r#"{"type":"offer","sdp":"x"}"#).unwrap();
        assert_eq!(offer, IceMessage::Offer { sdp: "x".into() });

        let cand: IceMessage = serde_json::from_str(
            r#"{"type":"candidate","candidate":{"sdpMid":"0","sdpMLineIndex":0,"candidate":"candidate:foo"}}"#,
        )
        .unwrap();
        let IceMessage::Candidate { candidate } = cand else {
            panic!("expected candidate");
        };
        assert_eq!(candidate.candidate, "candidate:foo");
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(serde_json::from_str::<IceMessage>(r#"{"type":"bye"}"#).is_err());
    }
}
