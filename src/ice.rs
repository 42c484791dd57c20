//! Types at the seam between the relay core and the ICE stack.
//!
//! The relay never touches the stack directly; it drives an [`IceSession`]
//! and consumes the [`IceEvent`]s the session queues. The production binding
//! is [`Str0mSession`](crate::session::Str0mSession); tests script their own.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::BoxError;
use crate::protocol::CandidateInit;

/// One STUN/TURN server entry, shaped like an RTCIceServer.
///
/// The list is value-typed configuration: the relay copies it into the
/// session on every offer, so mutating the stored list never affects an
/// active negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// ICE connection state as reported to the embedding adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    /// The relay counts as connected exactly in these two states.
    pub fn is_connected(self) -> bool {
        matches!(self, IceState::Connected | IceState::Completed)
    }

    /// States that make the offerer force an immediate ICE restart.
    pub fn is_lost(self) -> bool {
        matches!(
            self,
            IceState::Failed | IceState::Disconnected | IceState::Closed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IceState::New => "new",
            IceState::Checking => "checking",
            IceState::Connected => "connected",
            IceState::Completed => "completed",
            IceState::Disconnected => "disconnected",
            IceState::Failed => "failed",
            IceState::Closed => "closed",
        }
    }
}

impl fmt::Display for IceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate gathering progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

impl GatheringState {
    pub fn as_str(self) -> &'static str {
        match self {
            GatheringState::New => "new",
            GatheringState::Gathering => "gathering",
            GatheringState::Complete => "complete",
        }
    }
}

impl fmt::Display for GatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Connecting,
    Open,
    Closed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::New => "new",
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address and kind of one side of the selected candidate pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedCandidate {
    pub addr: String,
    pub kind: String,
}

/// Selected-candidate snapshot delivered by [`IceSession::request_stats`].
/// Either side may be missing or stale between reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub local: Option<SelectedCandidate>,
    pub remote: Option<SelectedCandidate>,
}

/// Everything the stack reports back to the relay, already marshalled onto
/// the relay's own task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceEvent {
    StateChanged(IceState),
    GatheringChanged(GatheringState),
    /// A local candidate ready to be trickled to the remote peer.
    LocalCandidate(CandidateInit),
    ChannelStateChanged(ChannelState),
    /// Inbound data-channel payload (keepalive frames included).
    ChannelData(Vec<u8>),
    Stats(SessionStats),
}

/// The ICE/DTLS/SCTP stack as the relay sees it.
///
/// One session per relay lifetime. The session owns the single data channel:
/// the first `create_offer` creates it, later offers reuse it under an ICE
/// restart. All methods are synchronous and non-blocking; long-running work
/// surfaces later through [`poll_event`].
///
/// [`poll_event`]: IceSession::poll_event
pub trait IceSession {
    /// Create an offer (offerer only). Creates the data channel on first
    /// call; flags an ICE restart and reuses the channel on later calls.
    /// Restarts candidate gathering against `servers`.
    fn create_offer(&mut self, servers: &[IceServer]) -> Result<String, BoxError>;

    /// Install a remote offer and produce the local answer (answerer only).
    /// Restarts candidate gathering against `servers`.
    fn accept_offer(&mut self, sdp: &str, servers: &[IceServer]) -> Result<String, BoxError>;

    /// Install the remote answer to our outstanding offer (offerer only).
    fn accept_answer(&mut self, sdp: &str) -> Result<(), BoxError>;

    /// Add a trickled remote candidate.
    fn add_remote_candidate(&mut self, candidate: &CandidateInit) -> Result<(), BoxError>;

    /// Best-effort binary send on the data channel. `false` when the channel
    /// is absent or not open; the payload is gone either way.
    fn send_channel(&mut self, payload: &[u8]) -> bool;

    fn channel_open(&self) -> bool;

    /// Ask for a fresh [`IceEvent::Stats`]. Answered asynchronously and
    /// possibly from stale observations.
    fn request_stats(&mut self);

    /// Drain the next queued event, if any.
    fn poll_event(&mut self) -> Option<IceEvent>;

    /// Stop the session. Idempotent; no events are queued afterwards.
    fn close(&mut self);
}
