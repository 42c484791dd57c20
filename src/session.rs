//! Production [`IceSession`] binding over the sans-IO str0m stack.
//!
//! The session owns the wire UDP socket and the `Rtc` instance. The relay's
//! run loop drives it: inbound wire datagrams go through
//! [`Str0mSession::handle_wire_input`], timeouts through
//! [`Str0mSession::handle_timeout`], and [`Str0mSession::poll_until_timeout`]
//! drains outgoing packets and converts stack events into [`IceEvent`]s.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use str0m::{
    Candidate, DtlsCertConfig, Event, IceConnectionState, Input, Output, Rtc, RtcConfig,
    change::{SdpAnswer, SdpOffer, SdpPendingOffer},
    channel::{ChannelConfig, ChannelId, Reliability},
    config::DtlsCert,
    net::{Protocol, Receive},
};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::BoxError;
use crate::ice::{
    ChannelState, GatheringState, IceEvent, IceServer, IceSession, IceState, SelectedCandidate,
    SessionStats,
};
use crate::protocol::CandidateInit;
use crate::stun;

/// Label of the single data channel carrying game traffic.
const CHANNEL_LABEL: &str = "game";

/// The one application m-line in the SDP.
const SDP_MID: &str = "0";

/// How long a gathering round waits for outstanding STUN transactions.
const GATHER_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval reported once the session has died.
const DEAD_POLL: Duration = Duration::from_secs(3600);

struct StunQuery {
    server: SocketAddr,
    txid: stun::TransactionId,
}

pub struct Str0mSession {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    channel_id: Option<ChannelId>,
    channel_open: bool,
    pending_offer: Option<SdpPendingOffer>,
    events: VecDeque<IceEvent>,
    gathering: GatheringState,
    gather_urls: Vec<String>,
    pending_stun: Vec<StunQuery>,
    gather_deadline: Option<Instant>,
    local_candidates: Vec<CandidateInit>,
    remote_candidates: Vec<Candidate>,
    last_wire_peer: Option<SocketAddr>,
    dead: bool,
}

impl Str0mSession {
    /// Bind the wire socket on an ephemeral port of `bind_addr` and set up
    /// the stack with the given DTLS certificate. The bind address doubles
    /// as the advertised host candidate.
    pub async fn bind(bind_addr: IpAddr, cert: DtlsCert) -> Result<Self, BoxError> {
        let socket = UdpSocket::bind(SocketAddr::new(bind_addr, 0)).await?;
        let local_addr = socket.local_addr()?;

        let rtc = RtcConfig::new()
            .set_dtls_cert_config(DtlsCertConfig::PregeneratedCert(cert))
            .build();

        debug!(%local_addr, "wire socket bound");

        let mut session = Self {
            rtc,
            socket,
            local_addr,
            channel_id: None,
            channel_open: false,
            pending_offer: None,
            events: VecDeque::new(),
            gathering: GatheringState::New,
            gather_urls: Vec::new(),
            pending_stun: Vec::new(),
            gather_deadline: None,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            last_wire_peer: None,
            dead: false,
        };

        let host = Candidate::host(local_addr, "udp")?;
        session.push_local_candidate(host);
        Ok(session)
    }

    pub fn wire_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Whether a gathering round is waiting to be driven (DNS + STUN sends).
    pub(crate) fn gather_pending(&self) -> bool {
        !self.gather_urls.is_empty()
    }

    fn push_local_candidate(&mut self, candidate: Candidate) {
        if let Some(added) = self.rtc.add_local_candidate(candidate) {
            let init = CandidateInit {
                sdp_mid: SDP_MID.into(),
                sdp_m_line_index: 0,
                candidate: added.to_sdp_string(),
            };
            self.announce_candidate(init);
        }
    }

    fn announce_candidate(&mut self, init: CandidateInit) {
        // Re-gathering after a restart can rediscover the same mapping.
        if self.local_candidates.contains(&init) {
            return;
        }
        self.local_candidates.push(init.clone());
        self.events.push_back(IceEvent::LocalCandidate(init));
    }

    fn set_gathering(&mut self, state: GatheringState) {
        if self.gathering != state {
            self.gathering = state;
            self.events.push_back(IceEvent::GatheringChanged(state));
        }
    }

    /// Queue a gathering round against `servers`. The actual DNS resolution
    /// and STUN sends happen in [`Str0mSession::drive_gathering`] so that
    /// offer/answer handling stays non-blocking.
    fn start_gathering(&mut self, servers: &[IceServer]) {
        self.gather_urls = servers
            .iter()
            .flat_map(|s| s.urls.iter().cloned())
            .collect();
        self.pending_stun.clear();
        self.gather_deadline = None;
        // A restart goes back through gathering even with no servers.
        self.gathering = GatheringState::New;
        self.set_gathering(GatheringState::Gathering);
        if self.gather_urls.is_empty() {
            self.set_gathering(GatheringState::Complete);
        }
    }

    /// Resolve the queued server urls and fire one Binding request each.
    pub(crate) async fn drive_gathering(&mut self, now: Instant) {
        let urls = std::mem::take(&mut self.gather_urls);
        for url in urls {
            let Some(target) = IceUrl::parse(&url) else {
                warn!(%url, "unrecognized ice server url, skipping");
                continue;
            };
            let IceUrl::Stun { host, port } = target else {
                debug!(%url, "turn/tls server configured, relay allocation not performed");
                continue;
            };
            let resolved = match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!(%url, "resolving stun server failed: {e}");
                    continue;
                }
            };
            let Some(addr) = resolved
                .into_iter()
                .find(|a| a.is_ipv4() == self.local_addr.is_ipv4())
            else {
                warn!(%url, "no address family match for stun server");
                continue;
            };
            let txid = stun::new_transaction_id();
            if let Err(e) = self.socket.send_to(&stun::binding_request(&txid), addr).await {
                warn!(%url, server = %addr, "stun request send failed: {e}");
                continue;
            }
            trace!(%url, server = %addr, "sent stun binding request");
            self.pending_stun.push(StunQuery { server: addr, txid });
        }

        if self.pending_stun.is_empty() {
            self.set_gathering(GatheringState::Complete);
        } else {
            self.gather_deadline = Some(now + GATHER_TIMEOUT);
        }
    }

    /// Drain stack output. Transmits go out on the wire socket, events are
    /// queued for [`IceSession::poll_event`]. Returns the next poll instant.
    pub(crate) async fn poll_until_timeout(&mut self) -> Instant {
        loop {
            if self.dead {
                return Instant::now() + DEAD_POLL;
            }
            match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => {
                    return self.gather_deadline.map_or(t, |g| t.min(g));
                }
                Ok(Output::Transmit(t)) => {
                    if let Err(e) = self.socket.send_to(&t.contents, t.destination).await {
                        warn!(dest = %t.destination, "wire send failed: {e}");
                    }
                }
                Ok(Output::Event(event)) => self.fan_in(event),
                Err(e) => {
                    self.fail(&format!("poll_output: {e}"));
                    return Instant::now() + DEAD_POLL;
                }
            }
        }
    }

    /// Feed one inbound wire datagram. STUN gathering responses are consumed
    /// here; everything else is handed to the stack.
    pub(crate) fn handle_wire_input(&mut self, now: Instant, source: SocketAddr, buf: &[u8]) {
        if self.claim_stun_response(source, buf) {
            return;
        }
        let receive = match Receive::new(Protocol::Udp, source, self.local_addr, buf) {
            Ok(r) => r,
            Err(e) => {
                trace!(%source, len = buf.len(), "unparseable wire packet: {e}");
                return;
            }
        };
        self.last_wire_peer = Some(source);
        if let Err(e) = self.rtc.handle_input(Input::Receive(now, receive)) {
            debug!(%source, "stack rejected wire input: {e}");
        }
    }

    /// Drive stack time forward; also expires a stuck gathering round.
    pub(crate) fn handle_timeout(&mut self, now: Instant) {
        if let Some(deadline) = self.gather_deadline
            && now >= deadline
        {
            if !self.pending_stun.is_empty() {
                debug!(
                    outstanding = self.pending_stun.len(),
                    "stun gathering timed out"
                );
                self.pending_stun.clear();
            }
            self.gather_deadline = None;
            self.set_gathering(GatheringState::Complete);
        }
        if self.dead {
            return;
        }
        if let Err(e) = self.rtc.handle_input(Input::Timeout(now)) {
            self.fail(&format!("timeout input: {e}"));
        }
    }

    fn claim_stun_response(&mut self, source: SocketAddr, buf: &[u8]) -> bool {
        let Some(idx) = self.pending_stun.iter().position(|q| q.server == source) else {
            return false;
        };
        let Some(mapped) = stun::parse_binding_response(buf, &self.pending_stun[idx].txid) else {
            return false;
        };
        self.pending_stun.swap_remove(idx);
        debug!(server = %source, %mapped, "stun mapped address");
        if mapped != self.local_addr {
            // Announced to the remote side only; we always send from the
            // base, so the local agent does not need the srflx entry.
            match Candidate::server_reflexive(mapped, self.local_addr, "udp") {
                Ok(c) => {
                    let init = CandidateInit {
                        sdp_mid: SDP_MID.into(),
                        sdp_m_line_index: 0,
                        candidate: c.to_sdp_string(),
                    };
                    self.announce_candidate(init);
                }
                Err(e) => debug!("srflx candidate rejected: {e}"),
            }
        }
        if self.pending_stun.is_empty() {
            self.gather_deadline = None;
            self.set_gathering(GatheringState::Complete);
        }
        true
    }

    fn fan_in(&mut self, event: Event) {
        match event {
            Event::Connected => {
                self.events
                    .push_back(IceEvent::StateChanged(IceState::Connected));
            }
            Event::IceConnectionStateChange(state) => {
                self.events
                    .push_back(IceEvent::StateChanged(map_ice_state(state)));
            }
            Event::ChannelOpen(cid, label) => {
                debug!(?cid, %label, "data channel open");
                // The answerer learns the channel id here.
                if self.channel_id.is_none() {
                    self.channel_id = Some(cid);
                }
                if self.channel_id == Some(cid) {
                    self.channel_open = true;
                    self.events
                        .push_back(IceEvent::ChannelStateChanged(ChannelState::Open));
                }
            }
            Event::ChannelData(cd) => {
                if self.channel_id == Some(cd.id) {
                    self.events.push_back(IceEvent::ChannelData(cd.data));
                }
            }
            Event::ChannelClose(cid) => {
                if self.channel_id == Some(cid) {
                    self.channel_open = false;
                    self.events
                        .push_back(IceEvent::ChannelStateChanged(ChannelState::Closed));
                }
            }
            other => trace!("stack event: {other:?}"),
        }
    }

    fn fail(&mut self, what: &str) {
        if self.dead {
            return;
        }
        warn!("ice stack failed, session is dead: {what}");
        self.dead = true;
        self.events
            .push_back(IceEvent::StateChanged(IceState::Failed));
    }
}

impl IceSession for Str0mSession {
    fn create_offer(&mut self, servers: &[IceServer]) -> Result<String, BoxError> {
        if self.dead {
            return Err("session is dead".into());
        }
        let restart = self.channel_id.is_some();
        let mut api = self.rtc.sdp_api();
        if restart {
            let _ = api.ice_restart(true);
        } else {
            let cid = api.add_channel_with_config(ChannelConfig {
                label: CHANNEL_LABEL.into(),
                ordered: false,
                reliability: Reliability::MaxRetransmits { retransmits: 0 },
                ..Default::default()
            });
            self.channel_id = Some(cid);
        }
        let (offer, pending) = api.apply().ok_or("no sdp changes to apply")?;
        self.pending_offer = Some(pending);

        if !restart {
            self.events
                .push_back(IceEvent::ChannelStateChanged(ChannelState::Connecting));
        }
        self.start_gathering(servers);
        if restart {
            // Re-trickle what we already know; the remote side re-pairs
            // against the fresh credentials.
            for init in self.local_candidates.clone() {
                self.events.push_back(IceEvent::LocalCandidate(init));
            }
        }
        Ok(offer.to_sdp_string())
    }

    fn accept_offer(&mut self, sdp: &str, servers: &[IceServer]) -> Result<String, BoxError> {
        if self.dead {
            return Err("session is dead".into());
        }
        let offer = SdpOffer::from_sdp_string(sdp)?;
        let answer = self.rtc.sdp_api().accept_offer(offer)?;
        self.start_gathering(servers);
        Ok(answer.to_sdp_string())
    }

    fn accept_answer(&mut self, sdp: &str) -> Result<(), BoxError> {
        if self.dead {
            return Err("session is dead".into());
        }
        let pending = self
            .pending_offer
            .take()
            .ok_or("no pending offer to accept an answer for")?;
        let answer = SdpAnswer::from_sdp_string(sdp)?;
        self.rtc.sdp_api().accept_answer(pending, answer)?;
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &CandidateInit) -> Result<(), BoxError> {
        if self.dead {
            return Err("session is dead".into());
        }
        let parsed = Candidate::from_sdp_string(&candidate.candidate)?;
        self.remote_candidates.push(parsed.clone());
        self.rtc.add_remote_candidate(parsed);
        Ok(())
    }

    fn send_channel(&mut self, payload: &[u8]) -> bool {
        if self.dead || !self.channel_open {
            return false;
        }
        let Some(cid) = self.channel_id else {
            return false;
        };
        let Some(mut channel) = self.rtc.channel(cid) else {
            return false;
        };
        match channel.write(true, payload) {
            Ok(_) => true,
            Err(e) => {
                trace!("channel write failed: {e}");
                false
            }
        }
    }

    fn channel_open(&self) -> bool {
        self.channel_open && !self.dead
    }

    fn request_stats(&mut self) {
        if self.dead {
            return;
        }
        // A sans-IO stack has no stats oracle; report what the wire shows.
        let local = Some(SelectedCandidate {
            addr: self.local_addr.to_string(),
            kind: "host".into(),
        });
        let remote = self.last_wire_peer.map(|peer| {
            let kind = self
                .remote_candidates
                .iter()
                .find(|c| c.addr() == peer)
                .map(|c| c.kind().to_string())
                .unwrap_or_else(|| "prflx".into());
            SelectedCandidate {
                addr: peer.to_string(),
                kind,
            }
        });
        self.events
            .push_back(IceEvent::Stats(SessionStats { local, remote }));
    }

    fn poll_event(&mut self) -> Option<IceEvent> {
        self.events.pop_front()
    }

    fn close(&mut self) {
        if self.rtc.is_alive() {
            self.rtc.disconnect();
        }
        self.dead = true;
        self.events.clear();
    }
}

fn map_ice_state(state: IceConnectionState) -> IceState {
    match state {
        IceConnectionState::New => IceState::New,
        IceConnectionState::Checking => IceState::Checking,
        IceConnectionState::Connected => IceState::Connected,
        IceConnectionState::Completed => IceState::Completed,
        IceConnectionState::Disconnected => IceState::Disconnected,
        _ => IceState::Failed,
    }
}

enum IceUrl {
    Stun { host: String, port: u16 },
    Other,
}

impl IceUrl {
    /// Parse `stun:host[:port]` (optionally with `?transport=` junk).
    /// `turn:`/`turns:`/`stuns:` are recognized but not gathered from.
    fn parse(url: &str) -> Option<Self> {
        let (scheme, rest) = url.split_once(':')?;
        match scheme {
            "stun" => {
                let rest = rest.split('?').next().unwrap_or(rest);
                let (host, port) = match rest.rsplit_once(':') {
                    Some((h, p)) => (h, p.parse().ok()?),
                    None => (rest, 3478),
                };
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return None;
                }
                Some(IceUrl::Stun {
                    host: host.to_string(),
                    port,
                })
            }
            "stuns" | "turn" | "turns" => Some(IceUrl::Other),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stun_urls() {
        let Some(IceUrl::Stun { host, port }) = IceUrl::parse("stun:stun.example.org:3479") else {
            panic!("expected stun url");
        };
        assert_eq!(host, "stun.example.org");
        assert_eq!(port, 3479);

        let Some(IceUrl::Stun { host, port }) = IceUrl::parse("stun:10.0.0.1") else {
            panic!("expected stun url");
        };
        assert_eq!(host, "10.0.0.1");
        assert_eq!(port, 3478);
    }

    #[test]
    fn turn_urls_are_recognized_but_not_gathered() {
        assert!(matches!(
            IceUrl::parse("turn:turn.example.org:3478?transport=udp"),
            Some(IceUrl::Other)
        ));
        assert!(IceUrl::parse("http://example.org").is_none());
        assert!(IceUrl::parse("stun:").is_none());
    }
}
