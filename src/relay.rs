//! The per-peer relay: one instance per remote player.
//!
//! A relay bridges a loopback UDP socket that the local game speaks to and
//! an unreliable, unordered data channel to the remote player. It owns the
//! whole lifecycle: offer/answer, trickled candidates, keepalive probing,
//! ICE restart on failure, and teardown.
//!
//! All state lives on the relay's own tokio task. The embedding adapter
//! talks to it through a [`RelayHandle`] and receives transitions through
//! [`RelayCallbacks`]; both signaling directions carry [`IceMessage`]s.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::BoxError;
use crate::ice::{
    ChannelState, GatheringState, IceEvent, IceServer, IceSession, IceState, SessionStats,
};
use crate::keepalive::{self, DEFAULT_CHECK_INTERVAL, Frame, LivenessMonitor, PING, PONG, TickAction};
use crate::protocol::IceMessage;
use crate::session::Str0mSession;

/// Game datagrams are drained one at a time into a buffer of this size;
/// payloads are bounded by the MTU across the peer link anyway.
const GAME_READ_BUFFER: usize = 2048;

/// Wire datagrams can be full-size UDP.
const WIRE_READ_BUFFER: usize = 65535;

/// Construction inputs. Immutable for the relay's lifetime except for the
/// server list, which [`PeerRelay::set_ice_servers`] replaces.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub remote_player_id: i64,
    pub remote_player_login: String,
    /// Port on loopback where the game receives peer traffic.
    pub game_udp_port: u16,
    /// The offerer initiates offers and ICE restarts; the answerer only
    /// responds.
    pub is_offerer: bool,
    pub ice_servers: Vec<IceServer>,
    /// Address to bind the wire socket to and advertise as host candidate.
    pub bind_addr: IpAddr,
    /// Interval between liveness checks (offerer only).
    pub check_interval: Duration,
}

impl RelayOptions {
    pub fn new(
        remote_player_id: i64,
        remote_player_login: impl Into<String>,
        game_udp_port: u16,
        is_offerer: bool,
    ) -> Self {
        Self {
            remote_player_id,
            remote_player_login: remote_player_login.into(),
            game_udp_port,
            is_offerer,
            ice_servers: Vec::new(),
            bind_addr: crate::net::detect_host_addr(),
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// Callbacks into the embedding adapter. All optional. They fire on the
/// relay's task; keep them cheap and hand real work to a channel.
#[derive(Default)]
pub struct RelayCallbacks {
    /// Every reported ICE state, as its wire string.
    pub on_ice_state: Option<Box<dyn FnMut(&str) + Send>>,
    /// Edge-triggered connected flag.
    pub on_connected: Option<Box<dyn FnMut(bool) + Send>>,
    /// A local candidate to trickle to the remote peer.
    pub on_candidate: Option<Box<dyn FnMut(IceMessage) + Send>>,
    /// A local offer or answer to forward to the remote peer.
    pub on_sdp: Option<Box<dyn FnMut(IceMessage) + Send>>,
    /// The data channel opened.
    pub on_channel_open: Option<Box<dyn FnMut() + Send>>,
}

/// Point-in-time snapshot for the adapter's status surface.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub remote_player_id: i64,
    pub remote_player_login: String,
    pub local_game_udp_port: u16,
    pub ice: IceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct IceStatus {
    pub offerer: bool,
    pub state: String,
    pub gathering_state: String,
    pub datachannel_state: String,
    pub connected: bool,
    pub loc_cand_addr: String,
    pub rem_cand_addr: String,
    pub loc_cand_type: String,
    pub rem_cand_type: String,
    /// Seconds from construction to the first connect; 0 while not
    /// connected.
    pub time_to_connected: f64,
}

/// Commands accepted by the relay task.
pub enum RelayCommand {
    IceMessage(IceMessage),
    SetIceServers(Vec<IceServer>),
    Status(oneshot::Sender<RelayStatus>),
    Shutdown,
}

/// Cheap cloneable handle to a running relay. Dropping every handle shuts
/// the relay down.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayCommand>,
    local_udp_port: u16,
}

impl RelayHandle {
    /// The loopback UDP port the game must send to. Stable for the relay's
    /// lifetime.
    pub fn local_udp_port(&self) -> u16 {
        self.local_udp_port
    }

    /// Feed a signaling message from the remote peer.
    pub fn add_ice_message(&self, msg: IceMessage) {
        if self.tx.send(RelayCommand::IceMessage(msg)).is_err() {
            debug!("relay is gone, dropping signaling message");
        }
    }

    /// Replace the server list used by the next offer.
    pub fn set_ice_servers(&self, servers: Vec<IceServer>) {
        let _ = self.tx.send(RelayCommand::SetIceServers(servers));
    }

    /// Snapshot of the relay state; `None` when the relay is gone.
    pub async fn status(&self) -> Option<RelayStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(RelayCommand::Status(tx)).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(RelayCommand::Shutdown);
    }
}

pub struct PeerRelay<S = Str0mSession> {
    remote_player_id: i64,
    remote_player_login: String,
    is_offerer: bool,
    game_udp_addr: SocketAddr,
    game_socket: UdpSocket,
    local_udp_port: u16,
    session: S,
    callbacks: RelayCallbacks,
    ice_servers: Vec<IceServer>,
    liveness: LivenessMonitor,
    ice_state: IceState,
    gathering_state: GatheringState,
    channel_state: ChannelState,
    connected: bool,
    stats: SessionStats,
    connect_start: Instant,
    connect_duration: Option<Duration>,
    closing: bool,
}

impl PeerRelay<Str0mSession> {
    /// Bind the sockets, set up the ICE session and (for the offerer)
    /// create the first offer. Bind failure is fatal; the adapter discards
    /// and recreates.
    pub async fn new(options: RelayOptions, callbacks: RelayCallbacks) -> Result<Self, BoxError> {
        crate::init_crypto();
        let session =
            Str0mSession::bind(options.bind_addr, crate::shared_dtls_cert().clone()).await?;
        let game_socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        Self::with_session(options, callbacks, session, game_socket, Instant::now())
    }

    /// Construct and hand the relay to its own task, returning the handle
    /// the adapter keeps.
    pub async fn spawn(
        options: RelayOptions,
        callbacks: RelayCallbacks,
    ) -> Result<RelayHandle, BoxError> {
        Ok(Self::new(options, callbacks).await?.start())
    }

    pub fn start(self) -> RelayHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RelayHandle {
            tx,
            local_udp_port: self.local_udp_port,
        };
        tokio::spawn(self.run(rx));
        handle
    }

    /// The relay's event loop: wire socket, game socket, adapter commands
    /// and the liveness timer, all on this one task.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RelayCommand>) {
        let mut wire_buf = vec![0u8; WIRE_READ_BUFFER];
        let mut game_buf = vec![0u8; GAME_READ_BUFFER];

        info!(
            peer = self.remote_player_id,
            login = %self.remote_player_login,
            "relay event loop started"
        );

        enum Driven {
            Cmd(Option<RelayCommand>),
            Wire(std::io::Result<(usize, SocketAddr)>),
            Game(std::io::Result<(usize, SocketAddr)>),
            StackTimeout,
            LivenessTick,
        }

        loop {
            let stack_deadline = self.session.poll_until_timeout().await;
            while let Some(event) = self.session.poll_event() {
                self.handle_ice_event(event, Instant::now());
            }
            if self.closing {
                break;
            }
            if self.session.gather_pending() {
                self.session.drive_gathering(Instant::now()).await;
                continue; // re-drain outputs and events
            }

            let now = Instant::now();
            if let Some(deadline) = self.liveness.deadline()
                && deadline <= now
            {
                self.on_liveness_tick(now);
                continue;
            }

            let stack_wait = stack_deadline.saturating_duration_since(now);
            let liveness_deadline = self.liveness.deadline();
            let liveness_sleep = tokio::time::Instant::from_std(
                liveness_deadline.unwrap_or(now + Duration::from_secs(3600)),
            );

            let driven = tokio::select! {
                biased;

                cmd = commands.recv() => Driven::Cmd(cmd),
                r = self.session.socket().recv_from(&mut wire_buf) => Driven::Wire(r),
                r = self.game_socket.recv_from(&mut game_buf) => Driven::Game(r),
                _ = tokio::time::sleep_until(liveness_sleep), if liveness_deadline.is_some() => {
                    Driven::LivenessTick
                }
                _ = tokio::time::sleep(stack_wait) => Driven::StackTimeout,
            };

            match driven {
                Driven::Cmd(None) => {
                    debug!(peer = self.remote_player_id, "all handles dropped");
                    self.close();
                    break;
                }
                Driven::Cmd(Some(cmd)) => match cmd {
                    RelayCommand::IceMessage(msg) => self.add_ice_message(msg),
                    RelayCommand::SetIceServers(servers) => self.set_ice_servers(servers),
                    RelayCommand::Status(tx) => {
                        let _ = tx.send(self.status());
                    }
                    RelayCommand::Shutdown => {
                        self.close();
                        break;
                    }
                },
                Driven::Wire(Ok((n, source))) => {
                    self.session
                        .handle_wire_input(Instant::now(), source, &wire_buf[..n]);
                }
                Driven::Wire(Err(e)) => {
                    if e.kind() == std::io::ErrorKind::ConnectionReset {
                        trace!("wire recv connection reset (ignoring)");
                    } else {
                        warn!(peer = self.remote_player_id, "wire recv failed: {e}");
                    }
                    self.session.handle_timeout(Instant::now());
                }
                Driven::Game(Ok((n, _))) => self.on_game_datagram(&game_buf[..n]),
                Driven::Game(Err(e)) => {
                    warn!(peer = self.remote_player_id, "game socket recv failed: {e}");
                }
                Driven::StackTimeout => self.session.handle_timeout(Instant::now()),
                Driven::LivenessTick => self.on_liveness_tick(Instant::now()),
            }
        }

        info!(peer = self.remote_player_id, "relay event loop finished");
    }
}

impl<S: IceSession> PeerRelay<S> {
    /// Assemble a relay over an already-bound game socket and an arbitrary
    /// [`IceSession`] binding.
    pub fn with_session(
        options: RelayOptions,
        callbacks: RelayCallbacks,
        session: S,
        game_socket: UdpSocket,
        now: Instant,
    ) -> Result<Self, BoxError> {
        let local_udp_port = game_socket.local_addr()?.port();
        info!(
            peer = options.remote_player_id,
            login = %options.remote_player_login,
            offerer = options.is_offerer,
            port = local_udp_port,
            "relay listening on local udp port"
        );

        let mut relay = Self {
            remote_player_id: options.remote_player_id,
            remote_player_login: options.remote_player_login,
            is_offerer: options.is_offerer,
            game_udp_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, options.game_udp_port)),
            game_socket,
            local_udp_port,
            session,
            callbacks,
            ice_servers: options.ice_servers,
            liveness: LivenessMonitor::new(options.check_interval),
            ice_state: IceState::New,
            gathering_state: GatheringState::New,
            channel_state: ChannelState::New,
            connected: false,
            stats: SessionStats::default(),
            connect_start: now,
            connect_duration: None,
            closing: false,
        };

        if relay.is_offerer {
            relay.create_offer(now);
        }
        Ok(relay)
    }

    /// The loopback UDP port the game must send to.
    pub fn local_udp_port(&self) -> u16 {
        self.local_udp_port
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Replace the stored server list. Takes effect on the next offer; an
    /// active negotiation is untouched.
    pub fn set_ice_servers(&mut self, servers: Vec<IceServer>) {
        debug!(
            peer = self.remote_player_id,
            count = servers.len(),
            "ice server list replaced"
        );
        self.ice_servers = servers;
    }

    /// Ingest one signaling message from the remote peer. Malformed or
    /// role-mismatched messages are logged and skipped; the session
    /// continues either way.
    pub fn add_ice_message(&mut self, msg: IceMessage) {
        debug!(
            peer = self.remote_player_id,
            kind = msg.kind(),
            "signaling message received"
        );
        match msg {
            IceMessage::Offer { sdp } => {
                if self.is_offerer {
                    warn!(
                        peer = self.remote_player_id,
                        "ignoring remote offer in offerer role"
                    );
                    return;
                }
                match self.session.accept_offer(&sdp, &self.ice_servers) {
                    Ok(answer) => {
                        info!(peer = self.remote_player_id, "created answer");
                        self.emit_sdp(IceMessage::Answer { sdp: answer });
                    }
                    Err(e) => {
                        error!(
                            peer = self.remote_player_id,
                            "installing remote offer failed: {e}"
                        );
                    }
                }
            }
            IceMessage::Answer { sdp } => {
                if !self.is_offerer {
                    warn!(
                        peer = self.remote_player_id,
                        "ignoring remote answer in answerer role"
                    );
                    return;
                }
                if let Err(e) = self.session.accept_answer(&sdp) {
                    error!(
                        peer = self.remote_player_id,
                        "installing remote answer failed: {e}"
                    );
                }
            }
            IceMessage::Candidate { candidate } => {
                if let Err(e) = self.session.add_remote_candidate(&candidate) {
                    error!(
                        peer = self.remote_player_id,
                        "adding remote candidate failed: {e}"
                    );
                }
            }
        }
    }

    /// Snapshot of the relay as the adapter's status surface reports it.
    pub fn status(&self) -> RelayStatus {
        let cand = |side: &Option<crate::ice::SelectedCandidate>| match side {
            Some(c) => (c.addr.clone(), c.kind.clone()),
            None => (String::new(), String::new()),
        };
        let (loc_cand_addr, loc_cand_type) = cand(&self.stats.local);
        let (rem_cand_addr, rem_cand_type) = cand(&self.stats.remote);

        RelayStatus {
            remote_player_id: self.remote_player_id,
            remote_player_login: self.remote_player_login.clone(),
            local_game_udp_port: self.local_udp_port,
            ice: IceStatus {
                offerer: self.is_offerer,
                state: self.ice_state.as_str().into(),
                gathering_state: self.gathering_state.as_str().into(),
                datachannel_state: self.channel_state.as_str().into(),
                connected: self.connected,
                loc_cand_addr,
                rem_cand_addr,
                loc_cand_type,
                rem_cand_type,
                time_to_connected: if self.connected {
                    self.connect_duration.map_or(0.0, |d| d.as_secs_f64())
                } else {
                    0.0
                },
            },
        }
    }

    /// Dispatch one event from the ICE stack. The run loop (or a test)
    /// calls this on the relay's own task.
    pub fn handle_ice_event(&mut self, event: IceEvent, now: Instant) {
        match event {
            IceEvent::StateChanged(state) => self.apply_ice_state(state, now),
            IceEvent::GatheringChanged(state) => {
                debug!(peer = self.remote_player_id, state = %state, "gathering state");
                self.gathering_state = state;
            }
            IceEvent::LocalCandidate(candidate) => {
                debug!(
                    peer = self.remote_player_id,
                    candidate = %candidate.candidate,
                    "local candidate"
                );
                if !self.closing
                    && let Some(cb) = self.callbacks.on_candidate.as_mut()
                {
                    cb(IceMessage::Candidate { candidate });
                }
            }
            IceEvent::ChannelStateChanged(state) => {
                debug!(peer = self.remote_player_id, state = %state, "data channel state");
                self.channel_state = state;
                if state == ChannelState::Open
                    && !self.closing
                    && let Some(cb) = self.callbacks.on_channel_open.as_mut()
                {
                    cb();
                }
            }
            IceEvent::ChannelData(payload) => self.on_channel_message(payload, now),
            IceEvent::Stats(stats) => {
                // Sides update independently and may be stale in between.
                if stats.local.is_some() {
                    self.stats.local = stats.local;
                }
                if stats.remote.is_some() {
                    self.stats.remote = stats.remote;
                }
            }
        }
    }

    /// One datagram from the game. Dropped until ICE completes so nothing
    /// queues up ahead of the channel.
    pub fn on_game_datagram(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        if !self.connected {
            trace!(
                peer = self.remote_player_id,
                len = payload.len(),
                "dropping game datagram until ice connects"
            );
            return;
        }
        if !self.session.send_channel(payload) {
            trace!(
                peer = self.remote_player_id,
                len = payload.len(),
                "data channel dropped outbound datagram"
            );
        }
    }

    /// The liveness timer fired.
    pub fn on_liveness_tick(&mut self, now: Instant) {
        if !self.is_offerer || self.closing {
            return;
        }
        match self.liveness.tick(self.connected, now) {
            TickAction::Restart => {
                info!(
                    peer = self.remote_player_id,
                    "connection check: not connected, sending offer"
                );
                self.create_offer(now);
            }
            TickAction::Ping { restart } => {
                if restart {
                    info!(
                        peer = self.remote_player_id,
                        "connection check: keepalive lost, sending offer"
                    );
                    self.create_offer(now);
                }
                if self.session.send_channel(PING) {
                    self.liveness.record_ping_sent(now);
                }
            }
        }
    }

    /// Next liveness check, if one is armed. Never armed on answerers.
    pub fn liveness_deadline(&self) -> Option<Instant> {
        self.liveness.deadline()
    }

    /// Stop everything. No callbacks fire past this point.
    pub fn close(&mut self) {
        if self.closing {
            return;
        }
        info!(
            peer = self.remote_player_id,
            login = %self.remote_player_login,
            "closing relay"
        );
        self.closing = true;
        self.liveness.stop();
        self.session.close();
    }

    fn create_offer(&mut self, now: Instant) {
        if !self.is_offerer || self.closing {
            return;
        }
        match self.session.create_offer(&self.ice_servers) {
            Ok(sdp) => {
                info!(peer = self.remote_player_id, "created offer");
                self.emit_sdp(IceMessage::Offer { sdp });
            }
            Err(e) => {
                error!(peer = self.remote_player_id, "creating offer failed: {e}");
            }
        }
        // The restart gets a full check interval before the next verdict.
        self.liveness.schedule(now);
    }

    fn apply_ice_state(&mut self, state: IceState, now: Instant) {
        debug!(peer = self.remote_player_id, state = %state, "ice state changed");
        self.ice_state = state;
        if self.closing {
            return;
        }

        self.set_connected(state.is_connected(), now);
        self.session.request_stats();

        if let Some(cb) = self.callbacks.on_ice_state.as_mut() {
            cb(state.as_str());
        }

        if self.is_offerer && state.is_lost() {
            warn!(
                peer = self.remote_player_id,
                "connection lost, forcing reconnect immediately"
            );
            self.create_offer(now);
        }
    }

    fn set_connected(&mut self, connected: bool, now: Instant) {
        if connected == self.connected {
            return;
        }
        self.connected = connected;
        if connected {
            let duration = *self
                .connect_duration
                .get_or_insert_with(|| now.saturating_duration_since(self.connect_start));
            info!(
                peer = self.remote_player_id,
                login = %self.remote_player_login,
                after = ?duration,
                "connected"
            );
            self.liveness.reset();
        } else {
            info!(
                peer = self.remote_player_id,
                login = %self.remote_player_login,
                "disconnected"
            );
        }
        if let Some(cb) = self.callbacks.on_connected.as_mut() {
            cb(connected);
        }
    }

    fn on_channel_message(&mut self, payload: Vec<u8>, now: Instant) {
        match keepalive::classify(&payload) {
            // Keepalive frames never reach the game, matching role or not.
            Some(Frame::Pong) => {
                if self.is_offerer {
                    trace!(peer = self.remote_player_id, "pong received");
                    self.liveness.record_pong(now);
                }
            }
            Some(Frame::Ping) => {
                if !self.is_offerer && !self.session.send_channel(PONG) {
                    trace!(peer = self.remote_player_id, "could not answer ping");
                }
            }
            None => {
                if let Err(e) = self.game_socket.try_send_to(&payload, self.game_udp_addr) {
                    warn!(
                        peer = self.remote_player_id,
                        dest = %self.game_udp_addr,
                        "forwarding to game failed: {e}"
                    );
                }
            }
        }
    }

    fn emit_sdp(&mut self, msg: IceMessage) {
        if !self.closing
            && let Some(cb) = self.callbacks.on_sdp.as_mut()
        {
            cb(msg);
        }
    }
}
