//! WebSocket Game Server
//!
//! Async WebSocket server for match connections.
//! Handles authentication, match creation and joins, move routing and
//! leaderboard reads.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::game::state::PlayerId;
use crate::network::auth::{after_authenticate, authenticate, AuthConfig};
use crate::network::protocol::{
    AuthRequest, AuthResult, ClientMessage, ErrorCode, JoinResult, MatchDataIn, ServerError,
    ServerMessage,
};
use crate::network::session::{Presence, SessionConfig, SessionError, SessionId, SessionManager};
use crate::ranking::profile::ProfileStore;
use crate::ranking::reporter::ResultReporter;
use crate::ranking::store::{RankingError, RankingStore};

/// Leaderboard page size when the client sends none.
const DEFAULT_LEADERBOARD_LIMIT: usize = 10;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Clients silent for longer than this are dropped.
    pub idle_client_timeout: Duration,
    /// How often the idle-client sweep runs.
    pub cleanup_interval: Duration,
    /// Settings for every new session.
    pub session: SessionConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_client_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            session: SessionConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Load from `XOXO_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, GameServerError> {
        let mut config = Self::default();
        if let Some(addr) = env_parse::<SocketAddr>("XOXO_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(max) = env_parse::<usize>("XOXO_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(rate) = env_parse::<u32>("XOXO_TICK_RATE")? {
            if rate == 0 {
                return Err(GameServerError::InvalidConfig("XOXO_TICK_RATE must be positive".into()));
            }
            config.session.tick_rate = rate;
        }
        if let Some(secs) = env_parse::<u64>("XOXO_IDLE_CLIENT_SECS")? {
            config.idle_client_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, GameServerError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| GameServerError::InvalidConfig(format!("{name}={raw}"))),
        Err(_) => Ok(None),
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,

    /// Bad configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Connected client state.
struct ConnectedClient {
    /// Player identifier (after auth).
    player_id: Option<PlayerId>,
    /// Display name (after auth).
    display_name: Option<String>,
    /// Current match.
    session_id: Option<SessionId>,
    /// Connection time.
    connected_at: Instant,
    /// Last activity.
    last_activity: Instant,
}

/// State shared by every connection task.
struct ServerContext {
    config: ServerConfig,
    auth: AuthConfig,
    sessions: Arc<SessionManager>,
    rankings: Arc<dyn RankingStore>,
    profiles: Arc<dyn ProfileStore>,
    leaderboard_id: String,
    clients: RwLock<BTreeMap<SocketAddr, ConnectedClient>>,
}

impl ServerContext {
    /// Authenticated identity and current match of a client.
    async fn identity(&self, addr: &SocketAddr) -> Option<(PlayerId, String, Option<SessionId>)> {
        let clients = self.clients.read().await;
        let client = clients.get(addr)?;
        let player_id = client.player_id?;
        let name = client.display_name.clone().unwrap_or_else(|| player_id.short());
        Some((player_id, name, client.session_id))
    }

    async fn set_session(&self, addr: &SocketAddr, session_id: Option<SessionId>) {
        if let Some(client) = self.clients.write().await.get_mut(addr) {
            client.session_id = session_id;
        }
    }

    /// Leave the client's current match, if any.
    async fn leave_current(&self, addr: &SocketAddr, player_id: PlayerId, session_id: SessionId) {
        self.depart(addr, player_id, session_id).await;
        self.set_session(addr, None).await;
    }

    /// Withdraw the presence that arrived on `addr`. A player who has since
    /// joined from another connection keeps their seat and registration.
    async fn depart(&self, addr: &SocketAddr, player_id: PlayerId, session_id: SessionId) {
        if let Some(handle) = self.sessions.get_session(&session_id).await {
            match handle.presence_left(player_id, *addr).await {
                Ok(_) => {}
                Err(SessionError::StaleConnection) => return,
                Err(e) => debug!("Leave for {} in match {} ignored: {}", player_id.short(), session_id, e),
            }
        }
        self.sessions.unregister_player(&player_id, &session_id).await;
    }
}

/// The game server.
pub struct GameServer {
    ctx: Arc<ServerContext>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(
        config: ServerConfig,
        auth: AuthConfig,
        reporter: Arc<ResultReporter>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let ctx = ServerContext {
            config,
            auth,
            rankings: Arc::clone(reporter.rankings()),
            leaderboard_id: reporter.leaderboard_id().to_string(),
            sessions: Arc::new(SessionManager::new(Some(reporter))),
            profiles,
            clients: RwLock::new(BTreeMap::new()),
        };

        Self { ctx: Arc::new(ctx), shutdown_tx }
    }

    /// Session registry.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.ctx.sessions
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, GameServerError> {
        Ok(TcpListener::bind(&self.ctx.config.bind_addr).await?)
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);

        let cleanup_ctx = self.ctx.clone();
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_ctx).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.ctx.clients.read().await.len();
                            if clients_count >= self.ctx.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                tokio::spawn(async move {
                                    if let Err(e) = Self::reject_connection(stream).await {
                                        debug!("Rejection notice to {} failed: {}", addr, e);
                                    }
                                });
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        self.ctx.sessions.shutdown_all().await;

        Ok(())
    }

    /// Tell a client over the connection limit why, then close.
    async fn reject_connection(stream: TcpStream) -> Result<(), GameServerError> {
        let mut ws = accept_async(stream).await?;
        let notice = ServerMessage::error(
            ErrorCode::ServerOverloaded,
            GameServerError::ConnectionLimitReached.to_string(),
        )
        .to_json()
        .map_err(|e| GameServerError::Internal(e.to_string()))?;
        ws.send(Message::Text(notice)).await?;
        ws.close(None).await?;
        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ctx = self.ctx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            ctx.clients.write().await.insert(addr, ConnectedClient {
                player_id: None,
                display_name: None,
                session_id: None,
                connected_at: Instant::now(),
                last_activity: Instant::now(),
            });

            let mut sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::error(
                                            ErrorCode::InvalidInput,
                                            "Invalid message format",
                                        )).await;
                                        continue;
                                    }
                                };

                                if let Some(client) = ctx.clients.write().await.get_mut(&addr) {
                                    client.last_activity = Instant::now();
                                }

                                Self::handle_client_message(&ctx, addr, client_msg, &msg_tx).await;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                let _ = msg_tx.send(ServerMessage::error(
                                    ErrorCode::InvalidInput,
                                    "Binary frames are not supported",
                                )).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            let removed = ctx.clients.write().await.remove(&addr);
            if let Some(ConnectedClient { player_id: Some(player_id), session_id: Some(session_id), .. }) = removed {
                ctx.depart(&addr, player_id, session_id).await;
            }

            // Let queued frames (including a shutdown notice) flush.
            drop(msg_tx);
            if tokio::time::timeout(Duration::from_secs(1), &mut sender_task).await.is_err() {
                sender_task.abort();
            }

            info!("Client {} cleaned up", addr);
        });
    }

    /// Handle a client message.
    async fn handle_client_message(
        ctx: &Arc<ServerContext>,
        addr: SocketAddr,
        msg: ClientMessage,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        match msg {
            ClientMessage::Auth(auth) => {
                Self::handle_auth(ctx, addr, auth, sender).await;
            }
            ClientMessage::CreateMatch => {
                Self::handle_create_match(ctx, addr, sender).await;
            }
            ClientMessage::JoinMatch { match_id } => {
                Self::handle_join_match(ctx, addr, match_id, sender).await;
            }
            ClientMessage::MatchData(data) => {
                Self::handle_match_data(ctx, addr, data, sender).await;
            }
            ClientMessage::LeaveMatch => {
                if let Some((player_id, _, Some(session_id))) = ctx.identity(&addr).await {
                    ctx.leave_current(&addr, player_id, session_id).await;
                }
            }
            ClientMessage::ListLeaderboard { limit, cursor } => {
                Self::handle_list_leaderboard(ctx, addr, limit, cursor, sender).await;
            }
            ClientMessage::Ping { timestamp } => {
                let _ = sender.send(ServerMessage::Pong {
                    timestamp,
                    server_time: Utc::now().timestamp_millis().max(0) as u64,
                }).await;
            }
        }
    }

    /// Handle authentication.
    async fn handle_auth(
        ctx: &Arc<ServerContext>,
        addr: SocketAddr,
        auth: AuthRequest,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let identity = match authenticate(&auth, &ctx.auth) {
            Ok(identity) => identity,
            Err(e) => {
                debug!("Client {} failed auth: {}", addr, e);
                let _ = sender.send(ServerMessage::AuthResult(AuthResult {
                    success: false,
                    player_id: None,
                    display_name: None,
                    error: Some(e.to_string()),
                    code: Some(e.code()),
                    server_version: ctx.config.version.clone(),
                })).await;
                return;
            }
        };

        let profile = after_authenticate(ctx.profiles.as_ref(), &identity).await;

        if let Some(client) = ctx.clients.write().await.get_mut(&addr) {
            client.player_id = Some(profile.id);
            client.display_name = Some(profile.name.clone());
        }

        let _ = sender.send(ServerMessage::AuthResult(AuthResult {
            success: true,
            player_id: Some(profile.id.to_uuid_string()),
            display_name: Some(profile.name.clone()),
            error: None,
            code: None,
            server_version: ctx.config.version.clone(),
        })).await;

        debug!("Client {} authenticated as {} ({})", addr, profile.name, profile.id.short());
    }

    /// Handle match creation.
    async fn handle_create_match(
        ctx: &Arc<ServerContext>,
        addr: SocketAddr,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        if ctx.identity(&addr).await.is_none() {
            let _ = sender.send(ServerMessage::error(ErrorCode::NotAuthenticated, "Authenticate first")).await;
            return;
        }

        let handle = ctx.sessions.create_session(ctx.config.session.clone()).await;
        let _ = sender.send(ServerMessage::MatchCreated { match_id: handle.id() }).await;
    }

    /// Handle a join attempt: seat, answer, then confirm presence.
    async fn handle_join_match(
        ctx: &Arc<ServerContext>,
        addr: SocketAddr,
        match_id: Uuid,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let Some((player_id, display_name, current)) = ctx.identity(&addr).await else {
            let _ = sender.send(ServerMessage::error(ErrorCode::NotAuthenticated, "Authenticate first")).await;
            return;
        };

        let reject = |code: ErrorCode, message: String| {
            ServerMessage::JoinResult(JoinResult {
                match_id,
                success: false,
                mark: None,
                error: Some(ServerError::new(code, message)),
            })
        };

        if let Some(current) = current.filter(|current| *current != match_id) {
            let still_open = ctx
                .sessions
                .get_session(&current)
                .await
                .is_some_and(|handle| !handle.is_closed());
            if still_open {
                let _ = sender.send(reject(ErrorCode::AlreadyInMatch, format!("Already in match {current}"))).await;
                return;
            }
            // Previous match closed on its own; the client is free again.
            ctx.set_session(&addr, None).await;
        }

        // The registry spans every connection the player holds.
        if let Some(other) = ctx.sessions.get_player_session(&player_id).await {
            if other.id() != match_id && !other.is_closed() {
                let _ = sender.send(reject(ErrorCode::AlreadyInMatch, format!("Already in match {}", other.id()))).await;
                return;
            }
        }

        let Some(handle) = ctx.sessions.get_session(&match_id).await else {
            let _ = sender.send(reject(ErrorCode::MatchNotFound, "Match not found".to_string())).await;
            return;
        };

        let mark = match handle.join_request(player_id).await {
            Ok(mark) => mark,
            Err(e) => {
                let _ = sender.send(reject(e.code(), e.to_string())).await;
                return;
            }
        };

        ctx.set_session(&addr, Some(match_id)).await;
        ctx.sessions.register_player(player_id, match_id).await;
        let _ = sender.send(ServerMessage::JoinResult(JoinResult {
            match_id,
            success: true,
            mark: Some(mark),
            error: None,
        })).await;

        let presence = Presence { player_id, display_name, connection: addr, sender: sender.clone() };
        if let Err(e) = handle.presence_joined(presence).await {
            warn!("Presence for {} in match {} rejected: {}", player_id.short(), match_id, e);
            let _ = sender.send(ServerMessage::error(e.code(), e.to_string())).await;
        }
    }

    /// Route match data to the session.
    async fn handle_match_data(
        ctx: &Arc<ServerContext>,
        addr: SocketAddr,
        data: MatchDataIn,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let Some((player_id, _, current)) = ctx.identity(&addr).await else {
            let _ = sender.send(ServerMessage::error(ErrorCode::NotAuthenticated, "Authenticate first")).await;
            return;
        };

        if current != Some(data.match_id) {
            let _ = sender.send(ServerMessage::error(ErrorCode::NotInMatch, "Not in this match")).await;
            return;
        }

        let Some(handle) = ctx.sessions.get_session(&data.match_id).await else {
            let _ = sender.send(ServerMessage::error(ErrorCode::SessionClosed, "Match is closed")).await;
            return;
        };

        match handle.send_message(player_id, data).await {
            Ok(()) => {}
            // The session already told the sender privately.
            Err(SessionError::Match(_) | SessionError::MalformedMove(_) | SessionError::UnsupportedOpCode(_)) => {}
            Err(e) => {
                let _ = sender.send(ServerMessage::error(e.code(), e.to_string())).await;
            }
        }
    }

    /// Handle a leaderboard read.
    async fn handle_list_leaderboard(
        ctx: &Arc<ServerContext>,
        addr: SocketAddr,
        limit: Option<usize>,
        cursor: Option<String>,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let limit = limit.unwrap_or(DEFAULT_LEADERBOARD_LIMIT);
        let page = ctx.rankings.list_top(&ctx.leaderboard_id, limit, cursor.as_deref()).await;

        let reply = match page {
            Ok(mut page) => {
                if let Some((player_id, _, _)) = ctx.identity(&addr).await {
                    page.owner_record = ctx
                        .rankings
                        .get_record(&ctx.leaderboard_id, &player_id)
                        .await
                        .unwrap_or_else(|e| {
                            warn!("Owner record lookup failed for {}: {}", player_id.short(), e);
                            None
                        });
                }
                ServerMessage::Leaderboard(page)
            }
            Err(RankingError::InvalidCursor) => ServerMessage::error(ErrorCode::InvalidInput, "Invalid cursor"),
            Err(e) => {
                error!("Leaderboard read failed: {}", e);
                ServerMessage::error(ErrorCode::LeaderboardUnavailable, e.to_string())
            }
        };
        let _ = sender.send(reply).await;
    }

    /// Drop clients that have gone quiet.
    async fn run_cleanup_loop(ctx: Arc<ServerContext>) {
        let mut interval = interval(ctx.config.cleanup_interval);

        loop {
            interval.tick().await;

            let now = Instant::now();
            let idle_timeout = ctx.config.idle_client_timeout;

            let to_remove: Vec<_> = {
                let clients = ctx.clients.read().await;
                clients.iter()
                    .filter(|(_, c)| now.duration_since(c.last_activity) > idle_timeout)
                    .map(|(addr, _)| *addr)
                    .collect()
            };

            for addr in to_remove {
                let removed = ctx.clients.write().await.remove(&addr);
                if let Some(client) = removed {
                    if let (Some(player_id), Some(session_id)) = (client.player_id, client.session_id) {
                        ctx.depart(&addr, player_id, session_id).await;
                    }
                    info!(
                        "Removed idle client {} (connected {}s)",
                        addr, client.connected_at.elapsed().as_secs()
                    );
                }
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.ctx.clients.read().await.len()
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.ctx.sessions.session_count().await
    }
}
