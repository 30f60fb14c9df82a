/**
 * coordinator/mod.rs
 *
 * Game Coordinator client:
 * - server registration and heartbeat
 * - public server listing
 * - joining a server by join key, directly or through STUN
 *
 * Everything here runs on the caller's thread, driven by `tick`. Only the
 * blocking connect() calls happen on worker threads (see tcp_connect).
 */

mod join;
mod protocol;
mod session;
mod stun;
mod tcp_connect;
mod types;

pub use join::{JoinCallback, JoinError, JoinTable, PendingJoin, RecentTokens};
pub use protocol::{
    ClientMessage, PacketType, ProtocolError, ServerMessage, StunRequest, COORDINATOR_VERSION,
    PACKET_STUN_CLIENT_STUN, STUN_VERSION,
};
pub use session::{Backoff, PacketStream, StreamError};
pub use stun::{supported_families, ProbeResult, ProbeState, StunSessions};
pub use tcp_connect::{AttemptId, ConnectError, ConnectOutcome, ConnectRequest, ConnectorRegistry};
pub use types::{
    AddressFamily, ConnectionType, JoinState, ServerGameType, ServerRegistration, SessionStatus,
};

use crate::config::CoordinatorConfig;
use crate::game_info::{GameInfo, GameInfoProvider};
use crate::gamelist::GameList;
use crate::packet::{Packet, PacketError};
use std::net::TcpStream;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Finished tokens remembered per session, oldest forgotten first
const FINISHED_TOKEN_LIMIT: usize = 256;

/// Faults that end the Coordinator session. Anything referring to state we
/// do not have means both sides disagree, so the whole session is dropped.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("unsolicited {0:?}")]
    Unsolicited(PacketType),

    #[error("CONNECTING for unknown join key {0}")]
    UnknownJoinKey(String),

    #[error("token {0} is already assigned")]
    DuplicateToken(String),

    #[error("instruction for unknown token {0}")]
    UnknownToken(String),

    #[error("STUN already requested for token {0}")]
    DuplicateStunRequest(String),

    #[error("no usable STUN probe for token {token} ({family})")]
    UnknownStunProbe { token: String, family: AddressFamily },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// What an in-flight connect is for. Carries the session generation it was
/// started in; results from an older session are dropped.
#[derive(Debug, Clone)]
enum Purpose {
    Session { generation: u64 },
    StunProbe { generation: u64, token: String, family: AddressFamily },
    Direct { generation: u64, token: String },
    StunPeer { generation: u64, token: String, family: AddressFamily },
}

enum Session {
    Disconnected,
    Connecting,
    Connected(PacketStream),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ConnectFailed,
    Lost,
    Desync,
    Shutdown,
}

/// Set once `register` was called; the session then stays up by itself
struct ServerRole {
    game_type: ServerGameType,
    local_port: u16,
    provider: Box<dyn GameInfoProvider>,
}

type RegistrationObserver = Box<dyn FnMut(&ServerRegistration)>;
type IncomingHandler = Box<dyn FnMut(TcpStream)>;

/// The single connection to the Game Coordinator, and everything hanging
/// off it: pending joins, STUN probes, registration and the server list.
pub struct CoordinatorClient {
    config: CoordinatorConfig,
    connectors: ConnectorRegistry<Purpose>,
    session: Session,
    generation: u64,
    /// Packets queued while the session is still connecting
    outbox: Vec<Packet>,
    backoff: Backoff,

    joins: JoinTable,
    stun: StunSessions,
    families: Vec<AddressFamily>,
    /// Tokens that reached a local result this session
    finished_tokens: RecentTokens,

    server: Option<ServerRole>,
    registration: ServerRegistration,
    on_registration: Option<RegistrationObserver>,
    on_incoming: Option<IncomingHandler>,

    game_list: GameList,
    /// LISTING requests whose reply has not ended yet
    listings_pending: u32,
}

impl CoordinatorClient {
    pub fn new(config: CoordinatorConfig) -> Self {
        let families = supported_families(config.enable_ipv6);
        Self {
            connectors: ConnectorRegistry::new(),
            session: Session::Disconnected,
            generation: 0,
            outbox: Vec::new(),
            backoff: Backoff::new(config.reconnect_min(), config.reconnect_max()),
            joins: JoinTable::new(),
            stun: StunSessions::new(config.stun_host.clone(), config.stun_port),
            families,
            finished_tokens: RecentTokens::new(FINISHED_TOKEN_LIMIT),
            server: None,
            registration: ServerRegistration::default(),
            on_registration: None,
            on_incoming: None,
            game_list: GameList::new(config.revision.clone()),
            listings_pending: 0,
            config,
        }
    }

    /// Open the session unless it is already open or opening
    pub fn connect(&mut self) {
        if !matches!(self.session, Session::Disconnected) {
            return;
        }

        info!(
            host = %self.config.coordinator_host,
            port = self.config.coordinator_port,
            "connecting to Game Coordinator"
        );
        self.session = Session::Connecting;
        self.connectors.start(
            ConnectRequest::new(self.config.coordinator_host.clone(), self.config.coordinator_port),
            Purpose::Session { generation: self.generation },
        );
    }

    /// Advertise our server. The session is kept alive, re-registering
    /// after every reconnect, and UPDATEs are sent on the configured interval.
    pub fn register<P>(&mut self, game_type: ServerGameType, local_port: u16, provider: P)
    where
        P: GameInfoProvider + 'static,
    {
        self.server = Some(ServerRole {
            game_type,
            local_port,
            provider: Box::new(provider),
        });
        self.registration = ServerRegistration::default();
        self.notify_registration();
        self.connect();
        self.send_register();
    }

    /// Ask for all public servers. Results land in `game_list`.
    pub fn get_listing(&mut self) {
        self.connect();
        // Overlapping requests share one refresh round
        if self.listings_pending == 0 {
            self.game_list.begin_refresh();
        }
        self.listings_pending += 1;
        self.send(ClientMessage::Listing);
    }

    /// Negotiate a connection to the server behind `join_key`. `callback`
    /// fires exactly once, from within a later `tick`. A request for a key
    /// still waiting on its token takes over the CONNECT already sent.
    pub fn connect_to_server<F>(&mut self, join_key: &str, callback: F)
    where
        F: FnOnce(Result<TcpStream, JoinError>) + 'static,
    {
        if let Some(previous) = self.joins.insert(PendingJoin::new(join_key, Box::new(callback))) {
            warn!(join_key, "join request superseded by a newer one");
            previous.deliver(Err(JoinError::Superseded));
            return;
        }
        self.connect();
        self.send(ClientMessage::Connect {
            join_key: join_key.to_string(),
        });
    }

    /// Called whenever the join key or connection type changes
    pub fn set_registration_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&ServerRegistration) + 'static,
    {
        self.on_registration = Some(Box::new(observer));
    }

    /// Receives peers that reached our server through STUN
    pub fn set_incoming_handler<F>(&mut self, handler: F)
    where
        F: FnMut(TcpStream) + 'static,
    {
        self.on_incoming = Some(Box::new(handler));
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// One pass of the main loop: reap connects, read and handle packets,
    /// send heartbeats, flush output. Never blocks.
    pub fn tick_at(&mut self, now: Instant) {
        for (purpose, outcome) in self.connectors.poll() {
            self.on_connect_outcome(purpose, outcome, now);
        }

        if matches!(self.session, Session::Disconnected) && self.server.is_some() && self.backoff.is_due(now) {
            info!("connection with Game Coordinator lost; reconnecting");
            self.connect();
            self.send_register();
        }

        self.receive_packets(now);
        self.send_heartbeat(now);

        if let Session::Connected(stream) = &mut self.session {
            if let Err(e) = stream.flush() {
                warn!(error = %e, "failed to send to Game Coordinator");
                self.close_session(now, CloseReason::Lost);
            }
        }
    }

    /// Kill every in-flight connect and tear the session down. Pending joins
    /// fail with `JoinError::Shutdown`; nothing reconnects afterwards.
    pub fn shutdown(&mut self) {
        self.connectors.kill_all();
        self.server = None;
        self.close_session(Instant::now(), CloseReason::Shutdown);
    }

    pub fn status(&self) -> SessionStatus {
        match self.session {
            Session::Disconnected => SessionStatus::Disconnected,
            Session::Connecting => SessionStatus::Connecting,
            Session::Connected(_) => SessionStatus::Connected,
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.registration.connection_type
    }

    pub fn registration(&self) -> &ServerRegistration {
        &self.registration
    }

    pub fn game_list(&self) -> &GameList {
        &self.game_list
    }

    pub fn game_list_mut(&mut self) -> &mut GameList {
        &mut self.game_list
    }

    pub fn is_listing(&self) -> bool {
        self.listings_pending > 0
    }

    pub fn joins(&self) -> &JoinTable {
        &self.joins
    }

    pub fn stun_sessions(&self) -> &StunSessions {
        &self.stun
    }

    /// Connects started and not yet reaped
    pub fn in_flight_connects(&self) -> usize {
        self.connectors.in_flight()
    }

    fn send(&mut self, msg: ClientMessage) {
        trace!(packet = ?msg.packet_type(), "queueing packet");
        let packet = msg.to_packet();
        match &mut self.session {
            Session::Connected(stream) => {
                if let Err(e) = stream.send(packet) {
                    error!(error = %e, "dropping unsendable packet");
                }
            }
            _ => self.outbox.push(packet),
        }
    }

    fn current_game_info(&self) -> Option<GameInfo> {
        let server = self.server.as_ref()?;
        let mut info = server.provider.game_info();
        info.join_key = self.registration.join_key.clone();
        Some(info)
    }

    fn send_register(&mut self) {
        let Some(info) = self.current_game_info() else {
            return;
        };
        let Some(server) = &self.server else {
            return;
        };
        let msg = ClientMessage::Register {
            game_type: server.game_type,
            local_port: server.local_port,
            info,
        };
        self.send(msg);
    }

    fn send_heartbeat(&mut self, now: Instant) {
        if !matches!(self.session, Session::Connected(_)) || !self.registration.is_registered() {
            return;
        }
        let due = self.registration.next_update.map_or(false, |at| now >= at);
        if !due {
            return;
        }
        if let Some(info) = self.current_game_info() {
            debug!("sending server update");
            self.send(ClientMessage::Update { info });
            self.registration.next_update = Some(now + self.config.update_interval());
        }
    }

    /// Tell the Coordinator a strategy we ran for `token` failed
    fn send_connect_failed(&mut self, token: &str) {
        if let Some(join) = self.joins.get_mut(token) {
            join.state = JoinState::TokenAssigned;
        }
        self.send(ClientMessage::ConnectFailed {
            token: token.to_string(),
        });
    }

    fn notify_registration(&mut self) {
        if let Some(observer) = self.on_registration.as_mut() {
            observer(&self.registration);
        }
    }

    fn receive_packets(&mut self, now: Instant) {
        let received = match &mut self.session {
            Session::Connected(stream) => stream.receive(),
            _ => return,
        };

        let packets = match received {
            Ok(packets) => packets,
            Err(StreamError::Closed) => {
                info!("Game Coordinator closed the connection");
                self.close_session(now, CloseReason::Lost);
                return;
            }
            Err(e) => {
                warn!(error = %e, "lost connection to Game Coordinator");
                self.close_session(now, CloseReason::Lost);
                return;
            }
        };

        for packet in packets {
            if let Err(e) = self.handle_packet(packet, now) {
                warn!(error = %e, "Game Coordinator session out of sync, closing");
                self.close_session(now, CloseReason::Desync);
                return;
            }
        }
    }

    fn handle_packet(&mut self, mut packet: Packet, now: Instant) -> Result<(), CoordinatorError> {
        let msg = ServerMessage::decode(&mut packet)?;
        trace!(packet = ?msg.packet_type(), "received packet");

        match msg {
            ServerMessage::RegisterAck { join_key, connection_type } => {
                if self.server.is_none() {
                    return Err(CoordinatorError::Unsolicited(PacketType::ServerRegisterAck));
                }
                info!(%join_key, %connection_type, "Game Coordinator registered our server");
                self.registration.join_key = join_key;
                self.registration.connection_type = connection_type;
                self.registration.next_update = Some(now);
                self.notify_registration();
            }

            ServerMessage::Listing { servers } => {
                if self.listings_pending == 0 {
                    return Err(CoordinatorError::Unsolicited(PacketType::ServerListing));
                }
                if servers.is_empty() {
                    self.listings_pending -= 1;
                    if self.listings_pending == 0 {
                        let removed = self.game_list.remove_expired();
                        info!(servers = self.game_list.len(), removed, "server listing complete");
                    }
                } else {
                    for info in servers {
                        self.game_list.add_or_refresh(info);
                    }
                }
            }

            ServerMessage::Connecting { token, join_key } => {
                self.joins.assign_token(&join_key, &token)?;
                debug!(%token, %join_key, "Game Coordinator is brokering our join");
            }

            ServerMessage::ConnectFailed { token } => {
                // The Coordinator is done with the token either way
                if self.finished_tokens.remove(&token) {
                    debug!(%token, "ignoring CONNECT_FAILED for finished token");
                    return Ok(());
                }
                let join = self.joins.remove_token(&token);
                // As a server, tokens are only known through our own probes
                if join.is_none() && !self.stun.has_token(&token) && !self.registration.is_registered() {
                    return Err(CoordinatorError::UnknownToken(token));
                }
                self.stun.close(&token, None);
                if let Some(join) = join {
                    warn!(%token, join_key = %join.join_key, "Game Coordinator could not connect us");
                    join.deliver(Err(JoinError::CoordinatorGaveUp));
                }
            }

            ServerMessage::DirectConnect { token, host, port } => {
                if self.finished_tokens.contains(&token) {
                    return Ok(());
                }
                let join = self
                    .joins
                    .get_mut(&token)
                    .ok_or_else(|| CoordinatorError::UnknownToken(token.clone()))?;
                join.state = JoinState::DirectConnecting;

                debug!(%token, %host, port, "direct connect");
                self.connectors.start(
                    ConnectRequest::new(host, port),
                    Purpose::Direct {
                        generation: self.generation,
                        token,
                    },
                );
            }

            ServerMessage::StunRequest { token } => {
                if self.finished_tokens.contains(&token) {
                    return Ok(());
                }
                if !self.joins.contains_token(&token) && !self.registration.is_registered() {
                    return Err(CoordinatorError::UnknownToken(token));
                }
                if self.stun.has_token(&token) {
                    return Err(CoordinatorError::DuplicateStunRequest(token));
                }
                if let Some(join) = self.joins.get_mut(&token) {
                    join.state = JoinState::StunProbing;
                }

                for family in self.families.clone() {
                    let request = self.stun.begin_probe(&token, family);
                    self.connectors.start(
                        request,
                        Purpose::StunProbe {
                            generation: self.generation,
                            token: token.clone(),
                            family,
                        },
                    );
                }
            }

            ServerMessage::StunConnect { token, family, host, port } => {
                if self.finished_tokens.contains(&token) {
                    return Ok(());
                }
                let local_addr = self.stun.begin_peer_connect(&token, family)?;
                if let Some(join) = self.joins.get_mut(&token) {
                    join.state = JoinState::StunConnecting(family);
                }

                debug!(%token, %family, %host, port, %local_addr, "connecting to STUN peer");
                self.connectors.start(
                    ConnectRequest::new(host, port).bind(local_addr),
                    Purpose::StunPeer {
                        generation: self.generation,
                        token,
                        family,
                    },
                );
            }
        }

        Ok(())
    }

    fn on_connect_outcome(&mut self, purpose: Purpose, outcome: ConnectOutcome, now: Instant) {
        match purpose {
            Purpose::Session { generation } => {
                if generation != self.generation || !matches!(self.session, Session::Connecting) {
                    trace!("dropping stale Game Coordinator connection");
                    return;
                }
                let stream = match outcome {
                    ConnectOutcome::Connected(stream) => PacketStream::new(stream),
                    ConnectOutcome::Failed(e) => {
                        warn!(error = %e, "could not connect to Game Coordinator");
                        self.close_session(now, CloseReason::ConnectFailed);
                        return;
                    }
                };
                match stream {
                    Ok(mut stream) => {
                        info!("connected to Game Coordinator");
                        for packet in self.outbox.drain(..) {
                            if let Err(e) = stream.send(packet) {
                                error!(error = %e, "dropping unsendable packet");
                            }
                        }
                        self.session = Session::Connected(stream);
                        self.backoff.reset();
                    }
                    Err(e) => {
                        warn!(error = %e, "could not set up Game Coordinator socket");
                        self.close_session(now, CloseReason::ConnectFailed);
                    }
                }
            }

            Purpose::StunProbe { generation, token, family } => {
                if generation != self.generation {
                    return;
                }
                let result = match outcome {
                    ConnectOutcome::Connected(socket) => self.stun.on_connected(&token, family, socket),
                    ConnectOutcome::Failed(e) => {
                        warn!(%token, %family, error = %e, "STUN probe failed");
                        self.stun.on_failed(&token, family)
                    }
                };
                if result == ProbeResult::AllFailed && !self.finished_tokens.contains(&token) {
                    warn!(%token, "all STUN probes failed");
                    self.send_connect_failed(&token);
                }
            }

            Purpose::Direct { generation, token } => {
                if generation != self.generation || !self.joins.contains_token(&token) {
                    return;
                }
                match outcome {
                    ConnectOutcome::Connected(stream) => self.finish_connected(&token, stream),
                    ConnectOutcome::Failed(e) => {
                        warn!(%token, error = %e, "direct connect failed");
                        self.send_connect_failed(&token);
                    }
                }
            }

            Purpose::StunPeer { generation, token, family } => {
                let parked = matches!(self.stun.state(&token, family), Some(ProbeState::Parked(_)));
                if generation != self.generation || !parked {
                    trace!(%token, %family, "dropping stale STUN peer connection");
                    return;
                }
                match outcome {
                    ConnectOutcome::Connected(stream) => self.finish_connected(&token, stream),
                    ConnectOutcome::Failed(e) => {
                        warn!(%token, %family, error = %e, "STUN peer connect failed");
                        self.stun.close(&token, Some(family));
                        self.send_connect_failed(&token);
                    }
                }
            }
        }
    }

    /// A strategy produced a socket: close the token's probes and hand the
    /// socket to whoever waits for it.
    fn finish_connected(&mut self, token: &str, stream: TcpStream) {
        self.stun.close(token, None);
        self.finished_tokens.insert(token);

        let peer = stream.peer_addr().ok();
        if let Some(join) = self.joins.remove_token(token) {
            info!(token, join_key = %join.join_key, ?peer, "connected to server");
            join.deliver(Ok(stream));
        } else if let Some(handler) = self.on_incoming.as_mut() {
            info!(token, ?peer, "client connected through STUN");
            handler(stream);
        } else {
            debug!(token, "no one waiting for connection, closing");
        }
    }

    fn close_session(&mut self, now: Instant, reason: CloseReason) {
        self.session = Session::Disconnected;
        self.generation += 1;
        self.outbox.clear();
        self.listings_pending = 0;

        let join_error = if reason == CloseReason::Shutdown {
            JoinError::Shutdown
        } else {
            JoinError::SessionLost
        };
        for join in self.joins.drain() {
            debug!(join_key = %join.join_key, "failing join, session closed");
            join.deliver(Err(join_error.clone()));
        }

        self.stun.close_all();
        self.finished_tokens.clear();

        let was_registered = self.registration != ServerRegistration::default();
        self.registration = ServerRegistration::default();
        if was_registered {
            self.notify_registration();
        }

        if self.server.is_some() && reason != CloseReason::Shutdown {
            let delay = self.backoff.schedule(now);
            warn!(?reason, ?delay, "Game Coordinator session closed, reconnecting later");
        } else {
            debug!(?reason, "Game Coordinator session closed");
        }
    }
}

impl Drop for CoordinatorClient {
    fn drop(&mut self) {
        self.connectors.kill_all();
    }
}
