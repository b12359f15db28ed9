//! Session lifecycle orchestration
//!
//! [`SessionController`] is the single owner of peer and local session
//! state. Caller commands, transport events and the heartbeat timer all
//! funnel through one `select!` loop, so no state transition is ever
//! applied concurrently. Collaborators get a [`SessionHandle`] for
//! commands and an event channel for notifications.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::heartbeat::HeartbeatMonitor;
use crate::player::{PeerState, Player, PlayerId, PlayerRegistry};
use crate::protocol::Message;
use crate::timesync::{RoundTripSample, TimeSyncEngine};
use crate::transport::{PeerHandle, Transport, TransportEvent, TransportPeerState};

use super::state::{LocalSessionState, SessionPhase};

/// Streams with this name prefix carry a file transfer; anything else is
/// treated as live audio
pub const AUDIO_FILE_STREAM_PREFIX: &str = "audio-file/";

/// Policy for electing the clock reference peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeServerPolicy {
    /// The first peer to accept an invitation becomes the reference
    #[default]
    FirstSynced,
    /// The local device is always the reference; accepted peers are asked
    /// to run the exchange against us
    LocalDevice,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Start advertising on startup
    pub advertise: bool,
    /// Start browsing on startup
    pub browse: bool,
    /// Invite peers as soon as they are discovered
    pub auto_invite: bool,
    /// Interval between heartbeat ticks
    pub heartbeat_interval: Duration,
    /// Round-trip samples required to complete a clock sync
    pub sync_samples: usize,
    /// Samples with a round trip above this multiple of the median are
    /// dropped before averaging
    pub sync_outlier_factor: f64,
    /// Sync fails if fewer than 2 samples arrive within this window
    pub sync_timeout: Duration,
    pub time_server_policy: TimeServerPolicy,
    /// Directory where received audio files are written
    pub audio_file_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            advertise: true,
            browse: true,
            auto_invite: true,
            heartbeat_interval: Duration::from_secs(2),
            sync_samples: 5,
            sync_outlier_factor: 2.0,
            sync_timeout: Duration::from_secs(10),
            time_server_policy: TimeServerPolicy::default(),
            audio_file_dir: std::env::temp_dir(),
        }
    }
}

/// Commands accepted by the session loop
#[derive(Debug)]
pub enum SessionCommand {
    Startup,
    Shutdown,
    StartAdvertising,
    StopAdvertising,
    StartBrowsing,
    StopBrowsing,
    /// Deliver a message to the given players, or to every attached peer
    /// when `to` is empty
    SendMessage {
        message: Message,
        to: Vec<PlayerId>,
        reliable: bool,
    },
    SendAudioFile {
        path: PathBuf,
        to: PlayerId,
    },
    /// Re-run the clock sync exchange against the given peer
    RequestTimeSync { to: PlayerId },
    ResetLocalSession,
}

/// Events emitted to the UI/audio collaborators
#[derive(Debug)]
pub enum SessionEvent {
    LocalStateChanged(LocalSessionState),
    PeerStateChanged {
        player_id: PlayerId,
        state: PeerState,
    },
    FlashChanged {
        player_id: PlayerId,
        value: f64,
    },
    SoundChanged {
        player_id: PlayerId,
        value: f64,
    },
    ColorChanged {
        player_id: PlayerId,
        value: f64,
    },
    SongInfo {
        player_id: PlayerId,
        info: Map<String, Value>,
    },
    ActionRequest {
        player_id: PlayerId,
        kind: String,
        body: Map<String, Value>,
    },
    /// The last attached peer left; the local session dropped out of the
    /// connected phase
    AllDisconnected,
    /// A live audio stream opened by a peer, forwarded verbatim
    AudioStream {
        player_id: PlayerId,
        chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    },
    /// A transferred audio file finished writing to disk
    AudioFileReceived {
        player_id: PlayerId,
        path: PathBuf,
    },
    /// A non-fatal error scoped to one peer or operation
    Error(String),
}

/// Handle to communicate with the running session
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    pub local_player_id: PlayerId,
    registry: PlayerRegistry,
}

impl SessionHandle {
    fn command(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.command_tx
            .send(cmd)
            .map_err(|_| SessionError::ChannelClosed)
    }

    pub fn startup(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::Startup)
    }

    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::Shutdown)
    }

    pub fn start_advertising(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::StartAdvertising)
    }

    pub fn stop_advertising(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::StopAdvertising)
    }

    pub fn start_browsing(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::StartBrowsing)
    }

    pub fn stop_browsing(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::StopBrowsing)
    }

    pub fn send_message(
        &self,
        message: Message,
        to: Vec<PlayerId>,
        reliable: bool,
    ) -> Result<(), SessionError> {
        self.command(SessionCommand::SendMessage {
            message,
            to,
            reliable,
        })
    }

    pub fn send_audio_file(&self, path: PathBuf, to: PlayerId) -> Result<(), SessionError> {
        self.command(SessionCommand::SendAudioFile { path, to })
    }

    pub fn request_time_sync(&self, to: PlayerId) -> Result<(), SessionError> {
        self.command(SessionCommand::RequestTimeSync { to })
    }

    pub fn reset_local_session(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::ResetLocalSession)
    }

    /// Snapshot of every known player, for UI display
    pub fn players(&self) -> Vec<Player> {
        self.registry.all()
    }
}

/// Owns all peer and local session state; runs as a single task
pub struct SessionController<T: Transport> {
    config: SessionConfig,
    transport: T,
    registry: PlayerRegistry,
    local_player_id: PlayerId,
    local_state: LocalSessionState,
    timesync: TimeSyncEngine,
    heartbeat: HeartbeatMonitor,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    /// The peer elected as clock reference, if any
    time_server: Option<PlayerId>,
    /// Peers running a timestamp exchange against us, with echo counts
    sync_clients: HashMap<PlayerId, usize>,
    /// In-flight audio transfer tasks; aborted on shutdown
    transfer_tasks: Vec<JoinHandle<()>>,
}

impl<T: Transport> SessionController<T> {
    pub fn new(
        display_name: &str,
        transport: T,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let registry = PlayerRegistry::new();
        let local_player_id = registry.register_local(display_name);
        let heartbeat = HeartbeatMonitor::new(config.heartbeat_interval);
        let timesync = TimeSyncEngine::new(
            config.sync_samples,
            config.sync_outlier_factor,
            config.sync_timeout.as_secs_f64(),
        );

        let controller = Self {
            config,
            transport,
            registry,
            local_player_id,
            local_state: LocalSessionState::new(),
            timesync,
            heartbeat,
            event_tx,
            time_server: None,
            sync_clients: HashMap::new(),
            transfer_tasks: Vec::new(),
        };
        (controller, event_rx)
    }

    pub fn local_player_id(&self) -> PlayerId {
        self.local_player_id
    }

    pub fn local_state(&self) -> LocalSessionState {
        self.local_state
    }

    /// Shared registry clone, for UI snapshot access
    pub fn registry(&self) -> PlayerRegistry {
        self.registry.clone()
    }

    /// The frozen clock delta in seconds, if a sync ever completed
    pub fn time_delta(&self) -> Option<f64> {
        self.timesync.delta()
    }

    /// Local wall-clock time adjusted by the frozen delta
    pub fn current_time(&self) -> f64 {
        self.timesync.current_time(now_secs())
    }

    /// Spawn the session loop, consuming the controller
    pub fn start(self, transport_events: mpsc::UnboundedReceiver<TransportEvent>) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            command_tx,
            local_player_id: self.local_player_id,
            registry: self.registry.clone(),
        };
        tokio::spawn(self.run(command_rx, transport_events));
        handle
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut ticker = tokio::time::interval(self.heartbeat.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("Command channel closed; session loop ending");
                        break;
                    }
                },
                event = transport_rx.recv() => match event {
                    Some(event) => self.handle_transport_event(event, now_secs()),
                    None => {
                        warn!("Transport event channel closed; session loop ending");
                        break;
                    }
                },
                _ = ticker.tick() => self.heartbeat_tick(now_secs()),
            }
        }

        self.shutdown();
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Startup => self.startup(),
            SessionCommand::Shutdown => self.shutdown(),
            SessionCommand::StartAdvertising => self.start_advertising(),
            SessionCommand::StopAdvertising => self.stop_advertising(),
            SessionCommand::StartBrowsing => self.start_browsing(),
            SessionCommand::StopBrowsing => self.stop_browsing(),
            SessionCommand::SendMessage {
                message,
                to,
                reliable,
            } => self.send_message(message, &to, reliable),
            SessionCommand::SendAudioFile { path, to } => self.send_audio_file(path, to),
            SessionCommand::RequestTimeSync { to } => self.request_time_sync(to, now_secs()),
            SessionCommand::ResetLocalSession => self.reset_local_session(),
        }
    }

    // === Local session lifecycle ===

    fn startup(&mut self) {
        if self.local_state.is_created() {
            debug!("Startup ignored; session already created");
            return;
        }
        info!("Session starting for local player {}", self.local_player_id);

        // Stable identity survives; session-scoped handles and states do not
        self.registry.reset_sessions();
        self.local_state.phase = SessionPhase::Created;
        self.emit_local_state();

        if self.config.advertise {
            self.start_advertising();
        }
        if self.config.browse {
            self.start_browsing();
        }
    }

    fn shutdown(&mut self) {
        if !self.local_state.is_created() {
            debug!("Shutdown ignored; no session");
            return;
        }
        info!("Session shutting down");

        // Cancel in-flight work before tearing down transport state, so no
        // late completion mutates a torn-down session
        self.timesync.cancel();
        self.time_server = None;
        self.sync_clients.clear();
        for task in self.transfer_tasks.drain(..) {
            task.abort();
        }

        for player in self.registry.remote_peers() {
            if matches!(
                player.state,
                PeerState::Invited
                    | PeerState::InviteAccepted
                    | PeerState::SyncingTime
                    | PeerState::Connected
                    | PeerState::Stale
            ) {
                self.transition(player.player_id, PeerState::Disconnected);
            }
        }

        self.stop_advertising();
        self.stop_browsing();
        self.local_state.phase = SessionPhase::NotCreated;
        self.emit_local_state();
    }

    fn reset_local_session(&mut self) {
        info!("Resetting local session");
        self.shutdown();
        self.startup();
    }

    fn start_advertising(&mut self) {
        if !self.local_state.is_created() {
            warn!("Cannot start advertising; session not created");
            return;
        }
        if self.local_state.advertising {
            debug!("Already advertising");
            return;
        }
        match self.transport.start_advertising() {
            Ok(()) => {
                info!("Advertising started");
                self.local_state.advertising = true;
                self.emit_local_state();
            }
            Err(e) => {
                warn!("Failed to start advertising: {}", e);
                self.emit(SessionEvent::Error(e.to_string()));
            }
        }
    }

    fn stop_advertising(&mut self) {
        if !self.local_state.advertising {
            return;
        }
        self.transport.stop_advertising();
        info!("Advertising stopped");
        self.local_state.advertising = false;
        self.emit_local_state();
    }

    fn start_browsing(&mut self) {
        if !self.local_state.is_created() {
            warn!("Cannot start browsing; session not created");
            return;
        }
        if self.local_state.browsing {
            debug!("Already browsing");
            return;
        }
        match self.transport.start_browsing() {
            Ok(()) => {
                info!("Browsing started");
                self.local_state.browsing = true;
                self.emit_local_state();
            }
            Err(e) => {
                warn!("Failed to start browsing: {}", e);
                self.emit(SessionEvent::Error(e.to_string()));
            }
        }
    }

    fn stop_browsing(&mut self) {
        if !self.local_state.browsing {
            return;
        }
        self.transport.stop_browsing();
        info!("Browsing stopped");
        self.local_state.browsing = false;
        self.emit_local_state();
    }

    // === Transport events ===

    fn handle_transport_event(&mut self, event: TransportEvent, now: f64) {
        match event {
            TransportEvent::PeerFound {
                handle,
                display_name,
            } => self.handle_peer_found(handle, display_name),
            TransportEvent::PeerStateChanged { handle, state } => {
                self.handle_peer_state_changed(handle, state, now)
            }
            TransportEvent::DataReceived { handle, bytes } => {
                self.handle_data(handle, bytes, now)
            }
            TransportEvent::StreamReceived {
                handle,
                name,
                chunks,
            } => self.handle_stream_received(handle, name, chunks),
        }
    }

    fn handle_peer_found(&mut self, handle: PeerHandle, display_name: String) {
        let player = self.registry.upsert_by_name(&display_name);
        let id = player.player_id;

        match player.state {
            PeerState::Discovered | PeerState::Disconnected | PeerState::InviteDeclined => {
                info!("Discovered peer {} via {}", display_name, handle);
                // An attached peer keeps its live handle; only an unattached
                // one binds the newly advertised handle
                self.registry.set_handle(id, Some(handle.clone()));
                if player.state == PeerState::Discovered {
                    // Fresh or re-found record; announce it
                    self.emit(SessionEvent::PeerStateChanged {
                        player_id: id,
                        state: PeerState::Discovered,
                    });
                } else {
                    self.transition(id, PeerState::Discovered);
                }
                if self.config.auto_invite {
                    self.invite_peer(id, &handle);
                }
            }
            other => debug!(
                "Peer {} rediscovered while {}; ignoring",
                display_name, other
            ),
        }
    }

    fn invite_peer(&mut self, id: PlayerId, handle: &PeerHandle) {
        match self.transport.invite(handle) {
            Ok(()) => {
                debug!("Invited peer {}", handle);
                self.transition(id, PeerState::Invited);
            }
            Err(e) => {
                // Peer stays Discovered; no automatic retry
                let err = SessionError::InviteFailed(handle.to_string(), e.to_string());
                warn!("{}", err);
                self.emit(SessionEvent::Error(err.to_string()));
            }
        }
    }

    fn handle_peer_state_changed(
        &mut self,
        handle: PeerHandle,
        state: TransportPeerState,
        now: f64,
    ) {
        let Some(player) = self.registry.find_by_handle(&handle) else {
            warn!("State change for unknown handle {}; ignoring", handle);
            return;
        };
        let id = player.player_id;

        match state {
            TransportPeerState::Connecting => {
                debug!("Peer {} connecting", player.display_name);
            }
            TransportPeerState::Connected => match player.state {
                // Discovered covers the advertiser side, where the remote
                // device invited us and the transport connects directly
                PeerState::Invited | PeerState::Discovered => {
                    self.transition(id, PeerState::InviteAccepted);
                    self.begin_peer_sync(id, &handle, now);
                }
                PeerState::Stale => {
                    self.registry.touch_liveness(id, now);
                    self.transition(id, PeerState::Connected);
                }
                other => debug!(
                    "Transport connected for peer {} in state {}; ignoring",
                    player.display_name, other
                ),
            },
            TransportPeerState::NotConnected => match player.state {
                PeerState::Invited => self.transition(id, PeerState::InviteDeclined),
                PeerState::InviteAccepted
                | PeerState::SyncingTime
                | PeerState::Connected
                | PeerState::Stale => self.transition(id, PeerState::Disconnected),
                other => debug!(
                    "Transport disconnected for peer {} in state {}; ignoring",
                    player.display_name, other
                ),
            },
        }
    }

    // === Clock sync ===

    fn begin_peer_sync(&mut self, id: PlayerId, handle: &PeerHandle, now: f64) {
        self.transition(id, PeerState::SyncingTime);

        match self.config.time_server_policy {
            TimeServerPolicy::LocalDevice => {
                // We are the reference; ask the peer to probe against us
                self.sync_clients.insert(id, 0);
                let request = Message::TimeSync {
                    value: self.config.sync_samples as f64,
                };
                self.send_to_handles(request, std::slice::from_ref(handle), true);
            }
            TimeServerPolicy::FirstSynced => {
                if self.time_server.is_none() && self.timesync.delta().is_none() {
                    self.elect_and_probe(id, handle, now);
                } else if self.timesync.in_progress() {
                    debug!("Sync already in progress; peer {} waits", id);
                } else {
                    // Time base already established; nothing to sample
                    self.registry.touch_liveness(id, now);
                    self.transition(id, PeerState::Connected);
                }
            }
        }
    }

    fn elect_and_probe(&mut self, id: PlayerId, handle: &PeerHandle, now: f64) {
        info!("Elected {} as time server", id);
        self.time_server = Some(id);
        self.registry.clear_latency_samples(id);
        self.timesync.begin(id, now);
        self.send_probe(handle, now);
    }

    fn send_probe(&mut self, handle: &PeerHandle, now: f64) {
        self.timesync.note_probe(now);
        self.send_to_handles(
            Message::Timestamp { value: now },
            std::slice::from_ref(handle),
            true,
        );
    }

    fn handle_timestamp(&mut self, id: PlayerId, handle: &PeerHandle, value: f64, now: f64) {
        if self.time_server == Some(id) && self.timesync.take_pending(value) {
            // Echo of one of our probes
            self.registry.push_latency_sample(
                id,
                RoundTripSample {
                    sent_at: value,
                    received_at: now,
                },
            );
            if self.timesync.record_echo(value, now) {
                info!(
                    "Time sync with {} complete; delta={:.4}s",
                    id,
                    self.timesync.delta().unwrap_or(0.0)
                );
                self.registry.touch_liveness(id, now);
                self.transition(id, PeerState::Connected);
                self.promote_waiting_peers(now);
            } else {
                self.send_probe(handle, now);
            }
        } else {
            // The peer is sampling against us; echo the value unchanged
            self.send_to_handles(
                Message::Timestamp { value },
                std::slice::from_ref(handle),
                true,
            );
            let count = {
                let entry = self.sync_clients.entry(id).or_insert(0);
                *entry += 1;
                *entry
            };
            if count >= self.config.sync_samples {
                self.sync_clients.remove(&id);
                if self.registry.get(id).map(|p| p.state) == Some(PeerState::SyncingTime) {
                    self.registry.touch_liveness(id, now);
                    self.transition(id, PeerState::Connected);
                }
            }
        }
    }

    fn handle_timesync_request(&mut self, id: PlayerId, handle: &PeerHandle, now: f64) {
        if self.config.time_server_policy == TimeServerPolicy::LocalDevice {
            warn!(
                "Peer {} offered to act as time reference but local policy keeps the reference here; ignoring",
                id
            );
            return;
        }
        if self.timesync.delta().is_some() || self.timesync.in_progress() {
            debug!("Ignoring time sync offer from {}; time base already in hand", id);
            return;
        }
        self.elect_and_probe(id, handle, now);
    }

    /// Caller-issued re-invocation of the sampling exchange
    ///
    /// Recovery path for a peer parked in `SyncingTime` after a timeout,
    /// and the way to resample an already connected peer. Cancels any open
    /// window and elects this peer instead.
    fn request_time_sync(&mut self, id: PlayerId, now: f64) {
        let handle = match self.registry.get(id) {
            Some(player)
                if matches!(
                    player.state,
                    PeerState::SyncingTime | PeerState::Connected | PeerState::Stale
                ) =>
            {
                match player.peer_handle {
                    Some(handle) => handle,
                    None => {
                        let err = SessionError::UnknownPeer(id.to_string());
                        warn!("Cannot request time sync: {}", err);
                        self.emit(SessionEvent::Error(err.to_string()));
                        return;
                    }
                }
            }
            Some(player) => {
                warn!(
                    "Cannot sync against peer {} in state {}",
                    id, player.state
                );
                return;
            }
            None => {
                let err = SessionError::UnknownPeer(id.to_string());
                warn!("Cannot request time sync: {}", err);
                self.emit(SessionEvent::Error(err.to_string()));
                return;
            }
        };

        self.transition(id, PeerState::SyncingTime);
        match self.config.time_server_policy {
            TimeServerPolicy::LocalDevice => {
                self.sync_clients.insert(id, 0);
                let request = Message::TimeSync {
                    value: self.config.sync_samples as f64,
                };
                self.send_to_handles(request, std::slice::from_ref(&handle), true);
            }
            TimeServerPolicy::FirstSynced => {
                self.timesync.cancel();
                self.elect_and_probe(id, &handle, now);
            }
        }
    }

    /// Peers parked in `SyncingTime` while a window was open can connect
    /// once the local time base is frozen
    fn promote_waiting_peers(&mut self, now: f64) {
        for player in self.registry.remote_peers() {
            let id = player.player_id;
            if player.state == PeerState::SyncingTime
                && self.time_server != Some(id)
                && !self.sync_clients.contains_key(&id)
            {
                self.registry.touch_liveness(id, now);
                self.transition(id, PeerState::Connected);
            }
        }
    }

    // === Inbound data ===

    fn handle_data(&mut self, handle: PeerHandle, bytes: Vec<u8>, now: f64) {
        let Some(player) = self.registry.find_by_handle(&handle) else {
            warn!("Data from unknown handle {}; dropping", handle);
            return;
        };
        let id = player.player_id;

        let message = match Message::decode(&bytes) {
            Ok(m) => m,
            Err(e) => {
                // Dropped; sender state unaffected
                warn!(
                    "Dropping malformed message from {}: {}",
                    player.display_name, e
                );
                self.emit(SessionEvent::Error(e.to_string()));
                return;
            }
        };

        // Any message from a stale peer restores it
        if player.state == PeerState::Stale {
            self.registry.touch_liveness(id, now);
            self.transition(id, PeerState::Connected);
        }

        match message {
            Message::Timestamp { value } => self.handle_timestamp(id, &handle, value, now),
            Message::TimeSync { .. } => self.handle_timesync_request(id, &handle, now),
            Message::Heartbeat { value } => {
                self.registry.record_heartbeat_received(id, value, now);
                // A heartbeating peer considers itself connected
                if self.registry.get(id).map(|p| p.state) == Some(PeerState::SyncingTime) {
                    self.transition(id, PeerState::Connected);
                }
            }
            Message::Flash { value } => {
                self.emit(SessionEvent::FlashChanged {
                    player_id: id,
                    value,
                });
            }
            Message::Sound { value } => {
                self.emit(SessionEvent::SoundChanged {
                    player_id: id,
                    value,
                });
            }
            Message::Color { value } => {
                self.emit(SessionEvent::ColorChanged {
                    player_id: id,
                    value,
                });
            }
            Message::SongInfo(info) => {
                self.emit(SessionEvent::SongInfo {
                    player_id: id,
                    info,
                });
            }
            Message::ActionRequest { kind, body } => {
                self.emit(SessionEvent::ActionRequest {
                    player_id: id,
                    kind,
                    body,
                });
            }
            Message::Raw { kind, body } => {
                debug!("Forwarding unrecognized message kind `{}`", kind);
                self.emit(SessionEvent::ActionRequest {
                    player_id: id,
                    kind,
                    body,
                });
            }
        }
    }

    // === Streams ===

    fn handle_stream_received(
        &mut self,
        handle: PeerHandle,
        name: String,
        chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let Some(player) = self.registry.find_by_handle(&handle) else {
            warn!("Stream `{}` from unknown handle {}; dropping", name, handle);
            return;
        };
        let id = player.player_id;

        if let Some(raw_name) = name.strip_prefix(AUDIO_FILE_STREAM_PREFIX) {
            // Keep only the final path component of the advertised name
            let file_name = Path::new(raw_name)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "audio".to_string());
            let path = self.config.audio_file_dir.join(file_name);

            info!(
                "Receiving audio file `{}` from {}",
                name, player.display_name
            );
            let event_tx = self.event_tx.clone();
            let task = tokio::spawn(async move {
                match write_stream_to_file(&path, chunks).await {
                    Ok(()) => {
                        let _ = event_tx.send(SessionEvent::AudioFileReceived {
                            player_id: id,
                            path,
                        });
                    }
                    Err(e) => {
                        warn!("Audio file receive failed: {}", e);
                        let _ = event_tx.send(SessionEvent::Error(e.to_string()));
                    }
                }
            });
            self.transfer_tasks.push(task);
        } else {
            debug!(
                "Forwarding audio stream `{}` from {}",
                name, player.display_name
            );
            self.emit(SessionEvent::AudioStream {
                player_id: id,
                chunks,
            });
        }
    }

    fn send_audio_file(&mut self, path: PathBuf, to: PlayerId) {
        let Some(handle) = self.registry.get(to).and_then(|p| p.peer_handle) else {
            let err = SessionError::UnknownPeer(to.to_string());
            warn!("Cannot send audio file: {}", err);
            self.emit(SessionEvent::Error(err.to_string()));
            return;
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio".to_string());
        let stream_name = format!("{AUDIO_FILE_STREAM_PREFIX}{file_name}");

        match self.transport.open_output_stream(&handle, &stream_name) {
            Ok(tx) => {
                info!("Sending audio file {} to {}", path.display(), handle);
                let event_tx = self.event_tx.clone();
                let task = tokio::spawn(async move {
                    if let Err(e) = stream_file(path, tx).await {
                        warn!("Audio file send failed: {}", e);
                        let _ = event_tx.send(SessionEvent::Error(e.to_string()));
                    }
                });
                self.transfer_tasks.push(task);
            }
            Err(e) => {
                warn!("Failed to open output stream: {}", e);
                self.emit(SessionEvent::Error(e.to_string()));
            }
        }
    }

    // === Sending ===

    fn send_message(&mut self, message: Message, to: &[PlayerId], reliable: bool) {
        let mut handles = Vec::new();
        if to.is_empty() {
            for player in self.registry.remote_peers() {
                if matches!(player.state, PeerState::Connected | PeerState::Stale) {
                    if let Some(handle) = player.peer_handle {
                        handles.push(handle);
                    }
                }
            }
        } else {
            for id in to {
                match self.registry.get(*id).and_then(|p| p.peer_handle) {
                    Some(handle) => handles.push(handle),
                    None => warn!("No active handle for player {}; skipping send", id),
                }
            }
        }

        if handles.is_empty() {
            debug!("No recipients for `{}` message", message.kind());
            return;
        }
        self.send_to_handles(message, &handles, reliable);
    }

    fn send_to_handles(&mut self, message: Message, handles: &[PeerHandle], reliable: bool) {
        let bytes = match message.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!("Failed to encode `{}` message: {}", message.kind(), e);
                self.emit(SessionEvent::Error(e.to_string()));
                return;
            }
        };
        if let Err(e) = self.transport.send(&bytes, handles, reliable) {
            // Reported, never retried; the caller decides
            warn!("Send of `{}` failed: {}", message.kind(), e);
            self.emit(SessionEvent::Error(e.to_string()));
        }
    }

    // === Heartbeat ===

    fn heartbeat_tick(&mut self, now: f64) {
        if !self.local_state.is_created() {
            return;
        }

        if self.timesync.is_timed_out(now) {
            if let Some(reference) = self.timesync.reference() {
                let err = SessionError::SyncTimeout(reference.to_string());
                warn!("{}", err);
                self.emit(SessionEvent::Error(err.to_string()));
            }
            // The peer remains SyncingTime; clearing the election lets a
            // later peer become the reference
            self.timesync.cancel();
            self.time_server = None;
        }

        let tick = self.heartbeat.tick(&self.registry.remote_peers(), now);

        if !tick.send_to.is_empty() {
            let value = self.timesync.current_time(now);
            for id in &tick.send_to {
                let Some(handle) = self.registry.get(*id).and_then(|p| p.peer_handle) else {
                    continue;
                };
                self.send_to_handles(Message::Heartbeat { value }, &[handle], false);
                self.registry.record_heartbeat_sent(*id, now);
            }
        }

        for id in tick.stale {
            warn!("Peer {} missed its heartbeat window; marking stale", id);
            self.transition(id, PeerState::Stale);
        }
        for id in tick.disconnect {
            warn!("Peer {} stale past the grace period; disconnecting", id);
            self.transition(id, PeerState::Disconnected);
        }
    }

    // === State transitions ===

    /// Sole writer of peer connection state
    fn transition(&mut self, player_id: PlayerId, state: PeerState) {
        let old = self.registry.get(player_id).map(|p| p.state);
        if old == Some(state) {
            return;
        }
        self.registry.set_state(player_id, state);
        debug!("Peer {} state: {:?} -> {}", player_id, old, state);
        self.emit(SessionEvent::PeerStateChanged { player_id, state });

        match state {
            PeerState::Connected => {
                if self.local_state.phase == SessionPhase::Created {
                    self.local_state.phase = SessionPhase::Connected;
                    self.emit_local_state();
                }
            }
            PeerState::Disconnected => {
                self.registry.set_handle(player_id, None);
                self.sync_clients.remove(&player_id);
                if self.time_server == Some(player_id) && self.timesync.in_progress() {
                    self.timesync.cancel();
                    self.time_server = None;
                }
                self.check_all_disconnected();
            }
            _ => {}
        }
    }

    fn check_all_disconnected(&mut self) {
        if self.local_state.phase != SessionPhase::Connected {
            return;
        }
        let attached = self
            .registry
            .remote_peers()
            .iter()
            .any(|p| matches!(p.state, PeerState::Connected | PeerState::Stale));
        if !attached {
            info!("All peers disconnected");
            self.local_state.phase = SessionPhase::Created;
            self.emit_local_state();
            self.emit(SessionEvent::AllDisconnected);
        }
    }

    fn emit_local_state(&self) {
        debug!("Local session state: {}", self.local_state);
        self.emit(SessionEvent::LocalStateChanged(self.local_state));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Seconds since the UNIX epoch
fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

async fn write_stream_to_file(
    path: &Path,
    mut chunks: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<(), SessionError> {
    let mut file = tokio::fs::File::create(path).await?;
    while let Some(chunk) = chunks.recv().await {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn stream_file(
    path: PathBuf,
    tx: mpsc::UnboundedSender<Vec<u8>>,
) -> Result<(), SessionError> {
    let mut file = tokio::fs::File::open(&path).await?;
    let mut buf = vec![0u8; 8192];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if tx.send(buf[..n].to_vec()).is_err() {
            // Receiver side closed the stream early
            break;
        }
    }
    Ok(())
}
