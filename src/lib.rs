//! Per-peer relay core for a peer-to-peer game networking adapter.
//!
//! For each remote player the embedding adapter creates one [`PeerRelay`].
//! The relay establishes an ICE/DTLS/SCTP peer connection carrying a single
//! unreliable, unordered data channel and bridges it to a loopback UDP
//! socket the game talks to. Signaling (SDP and trickled candidates) flows
//! through the adapter as [`IceMessage`]s; liveness is watched with an
//! in-band PING/PONG probe that forces an ICE restart when the path dies
//! quietly.

pub mod ice;
pub mod keepalive;
mod net;
pub mod protocol;
pub mod relay;
pub mod session;
mod stun;

use std::sync::OnceLock;

use str0m::config::{CryptoProvider, DtlsCert, DtlsCertOptions};

pub use ice::{IceEvent, IceServer, IceSession, IceState};
pub use net::detect_host_addr;
pub use protocol::{CandidateInit, IceMessage};
pub use relay::{PeerRelay, RelayCallbacks, RelayHandle, RelayOptions, RelayStatus};
pub use session::Str0mSession;

/// Errors out of fallible setup paths. In-session faults are logged and
/// absorbed instead.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Initialise the str0m crypto provider (safe to call multiple times).
pub fn init_crypto() {
    CryptoProvider::from_feature_flags().install_process_default();
}

/// Return a lazily-generated DTLS certificate that is reused across all
/// relays. This avoids the ~100-140 ms key-generation cost on every
/// [`PeerRelay::new`] call; the certificate is not an identity here.
static SHARED_CERT: OnceLock<DtlsCert> = OnceLock::new();

pub fn shared_dtls_cert() -> &'static DtlsCert {
    SHARED_CERT.get_or_init(|| {
        let provider = CryptoProvider::from_feature_flags();
        DtlsCert::new(provider, DtlsCertOptions::default())
    })
}
