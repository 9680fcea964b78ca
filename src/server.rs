//! Server root: accepts connections, enforces IP bans and the session
//! cap, and dispatches inbound frames to the store, the user registry
//! and the matchmaker.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsAcceptor;

use crate::game::GameMode;
use crate::services::bans::{BanStatus, BanTable};
use crate::services::matchmaking::Matchmaker;
use crate::services::store::{BanEntry, Store};
use crate::services::users::UserRegistry;
use crate::session::models::auth::{
    encode_good_auth, AuthFailure, LoginRequest, RegistrationFailure,
};
use crate::session::models::game::Command;
use crate::session::models::history::{
    decode_replay_request, encode_match_history, BanMessage,
};
use crate::session::models::social::{
    decode_username_payload, decode_uuid_payload, encode_relation_update, encode_user_list,
    ExternalUser, FriendDecision, MatchMessage, TextMessage,
};
use crate::session::packet::{Frame, FrameKind};
use crate::session::{Session, SessionRef};
use crate::utils::types::{SessionId, UserId};

/// Default cap on concurrently connected sessions
pub const DEFAULT_MAX_SESSIONS: usize = 1600;

/// Budget for completing a TLS handshake after accept
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Table of live sessions keyed by session id. Held strongly here and
/// by the user registry; both drop on disconnect.
#[derive(Default)]
pub struct SessionMap {
    inner: Mutex<HashMap<SessionId, SessionRef>>,
}

impl SessionMap {
    pub fn new() -> SessionMap {
        SessionMap::default()
    }

    pub fn insert(&self, session: SessionRef) {
        self.inner.lock().insert(session.id(), session);
    }

    pub fn remove(&self, session_id: SessionId) {
        self.inner.lock().remove(&session_id);
    }

    pub fn get(&self, session_id: SessionId) -> Option<SessionRef> {
        self.inner.lock().get(&session_id).cloned()
    }

    /// Delivers to a session by id; silently dropped when the session
    /// no longer exists.
    pub fn deliver(&self, session_id: SessionId, frame: Frame) {
        if let Some(session) = self.get(session_id) {
            session.deliver(frame);
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }
}

pub struct Server {
    pub sessions: Arc<SessionMap>,
    pub registry: Arc<UserRegistry>,
    pub matchmaker: Arc<Matchmaker>,
    pub store: Arc<dyn Store>,
    pub bans: Arc<BanTable>,
    next_session_id: AtomicU64,
    max_sessions: usize,
    identity: String,
}

impl Server {
    pub fn new(
        sessions: Arc<SessionMap>,
        registry: Arc<UserRegistry>,
        matchmaker: Arc<Matchmaker>,
        store: Arc<dyn Store>,
        bans: Arc<BanTable>,
        max_sessions: usize,
        identity: String,
    ) -> Arc<Server> {
        Arc::new(Server {
            sessions,
            registry,
            matchmaker,
            store,
            bans,
            next_session_id: AtomicU64::new(1),
            max_sessions,
            identity,
        })
    }

    /// Identity line shown by the admin console.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Accepts connections until the shutdown signal fires.
    pub async fn listen(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: TlsAcceptor,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        server.handle_accept(acceptor, stream, addr).await;
                    });
                }
                Err(err) => {
                    error!("Accept failed: {}", err);
                }
            }
        }
    }

    async fn handle_accept(
        self: Arc<Self>,
        acceptor: TlsAcceptor,
        stream: TcpStream,
        addr: SocketAddr,
    ) {
        let tls = match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(err)) => {
                debug!("TLS handshake with {} failed: {}", addr, err);
                return;
            }
            Err(_) => {
                debug!("TLS handshake with {} timed out", addr);
                return;
            }
        };

        match self.bans.check(addr.ip()) {
            BanStatus::Banned(entry) => {
                let banned = BanMessage {
                    until: entry.until,
                    reason: entry.reason,
                };
                send_and_close(tls, banned.encode()).await;
                return;
            }
            BanStatus::Expired => {
                // The in-memory entry is gone; drop the store's too
                self.store.unban_ip(addr.ip()).await;
            }
            BanStatus::Clear => {}
        }

        if self.sessions.count() >= self.max_sessions {
            send_and_close(tls, Frame::empty(FrameKind::ServerFull)).await;
            return;
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::AcqRel);
        debug!("Accepted session {} from {}", session_id, addr);

        Session::spawn(session_id, addr.ip(), tls, self.clone());
    }

    /// Detaches a closed session from every subsystem.
    pub(crate) async fn remove_session(&self, session: &SessionRef) {
        self.sessions.remove(session.id());

        for mode in crate::game::ALL_MODES {
            self.matchmaker.cancel(session, mode, false).await;
        }

        self.registry.disconnect(session);
    }

    /// Frame dispatch, invoked from the session's read loop after
    /// validation and rate limiting.
    pub(crate) async fn on_message(self: &Arc<Self>, session: &SessionRef, frame: Frame) {
        use FrameKind::*;

        match frame.kind {
            LoginRequest => self.handle_login(session, frame).await,
            RegistrationRequest => self.handle_registration(session, frame).await,

            FetchFriends => {
                let Some(user_id) = self.auth_gate(session) else {
                    return;
                };
                let friends = self.store.fetch_friends(user_id).await;
                session.deliver(encode_user_list(FriendList, &friends));
            }
            FetchFriendRequests => {
                let Some(user_id) = self.auth_gate(session) else {
                    return;
                };
                let requests = self.store.fetch_friend_requests(user_id).await;
                session.deliver(encode_user_list(FriendRequestList, &requests));
            }
            FetchBlocks => {
                let Some(user_id) = self.auth_gate(session) else {
                    return;
                };
                let blocks = self.store.fetch_blocks(user_id).await;
                session.deliver(encode_user_list(BlockList, &blocks));
            }

            SendFriendRequest => self.handle_friend_request(session, frame).await,
            RespondFriendRequest => self.handle_friend_response(session, frame).await,
            RemoveFriend => self.handle_remove_friend(session, frame).await,
            BlockUser => self.handle_block(session, frame).await,
            UnblockUser => self.handle_unblock(session, frame).await,

            DirectTextMessage => {
                let Some(_) = self.auth_gate(session) else {
                    return;
                };
                let Ok(message) = TextMessage::decode(frame.payload) else {
                    self.bad_message(session);
                    return;
                };
                let Some(data) = session.data() else {
                    return;
                };
                self.registry.direct_message(&data, message, session);
            }
            MatchTextMessage => {
                let Some(_) = self.auth_gate(session) else {
                    return;
                };
                let Ok(raw) = TextMessage::decode(frame.payload) else {
                    self.bad_message(session);
                    return;
                };
                let Some(data) = session.data() else {
                    return;
                };
                let message = MatchMessage {
                    user_id: data.user_id,
                    sender_username: data.username,
                    text: raw.text,
                };
                self.matchmaker.send_match_message(session, message).await;
            }

            QueueMatch => {
                if self.auth_gate(session).is_none() {
                    return;
                }
                let Some(mode) = mode_of(&frame) else {
                    session.deliver(Frame::empty(BadQueue));
                    return;
                };
                self.matchmaker.enqueue(session, mode).await;
            }
            CancelMatch => {
                if self.auth_gate(session).is_none() {
                    return;
                }
                let Some(mode) = mode_of(&frame) else {
                    session.deliver(Frame::empty(BadQueue));
                    return;
                };
                self.matchmaker.cancel(session, mode, true).await;
            }
            SendCommand => {
                if self.auth_gate(session).is_none() {
                    return;
                }
                let Ok(command) = Command::decode(frame.payload) else {
                    self.bad_message(session);
                    return;
                };
                self.matchmaker.route_to_match(session, command).await;
            }
            ForfeitMatch => {
                if self.auth_gate(session).is_none() {
                    return;
                }
                self.matchmaker.forfeit(session).await;
            }

            FetchMatchHistory => {
                let Some(user_id) = self.auth_gate(session) else {
                    return;
                };
                let Some(mode) = mode_of(&frame) else {
                    self.bad_message(session);
                    return;
                };

                if !session.has_matches(mode) {
                    session.deliver(Frame::empty(NoNewMatches));
                    return;
                }

                let rows = self.store.fetch_match_history(user_id, mode).await;
                session.deliver(encode_match_history(mode, &rows));
                session.set_has_matches(false, mode);
            }
            MatchReplayRequest => {
                if self.auth_gate(session).is_none() {
                    return;
                }
                let Ok(match_id) = decode_replay_request(frame.payload) else {
                    self.bad_message(session);
                    return;
                };
                match self.store.fetch_replay(match_id).await {
                    Some(replay) => session.deliver(replay.encode()),
                    None => session.deliver(Frame::empty(NoReplay)),
                }
            }

            // Anything else is a client-bound kind arriving backwards
            _ => {}
        }
    }

    async fn handle_login(self: &Arc<Self>, session: &SessionRef, frame: Frame) {
        if session.is_authenticated() {
            session.deliver(AuthFailure::CurrentlyAuthenticated.frame());
            return;
        }

        // The address may have been banned since accept
        if self.reject_if_banned(session).await {
            return;
        }

        let Ok(request) = LoginRequest::decode(frame.payload) else {
            session.deliver(AuthFailure::BadCredentials.frame());
            return;
        };

        match self.store.authenticate(request, session.addr()).await {
            Ok(auth) => {
                // GoodAuth precedes any match-in-progress resync
                session.deliver(encode_good_auth(&auth.data.elos));
                self.registry.on_login(auth, session).await;
            }
            Err(reason) => session.deliver(reason.frame()),
        }
    }

    async fn handle_registration(self: &Arc<Self>, session: &SessionRef, frame: Frame) {
        if session.is_authenticated() {
            session.deliver(RegistrationFailure::CurrentlyAuthenticated.frame());
            return;
        }

        // One registration attempt per connection
        if session.has_registered() {
            session.deliver(RegistrationFailure::ServerError.frame());
            return;
        }
        session.set_registered();

        if self.reject_if_banned(session).await {
            return;
        }

        let Ok(request) = LoginRequest::decode(frame.payload) else {
            session.deliver(RegistrationFailure::InvalidUsername.frame());
            return;
        };

        match self.store.register_account(request, session.addr()).await {
            Ok(()) => session.deliver(Frame::empty(FrameKind::GoodRegistration)),
            Err(reason) => session.deliver(reason.frame()),
        }
    }

    async fn handle_friend_request(self: &Arc<Self>, session: &SessionRef, frame: Frame) {
        let Some(user_id) = self.auth_gate(session) else {
            return;
        };
        let Ok(username) = decode_username_payload(frame.payload) else {
            self.bad_message(session);
            return;
        };

        if let Some(target) = self.store.send_friend_request(user_id, username).await {
            // The target learns who is asking
            if let Some(sender) = self.external_of(session) {
                self.registry.deliver_to_user(
                    target.user_id,
                    encode_relation_update(FrameKind::NotifyFriendRequest, &sender),
                );
            }
        }
    }

    async fn handle_friend_response(self: &Arc<Self>, session: &SessionRef, frame: Frame) {
        let Some(user_id) = self.auth_gate(session) else {
            return;
        };
        let Ok(decision) = FriendDecision::decode(frame.payload) else {
            self.bad_message(session);
            return;
        };

        let other = self
            .store
            .respond_friend_request(user_id, decision.user_id, decision.accept)
            .await;

        if let (Some(other), true) = (other, decision.accept) {
            self.registry.cache_friend_added(user_id, other.user_id);

            session.deliver(encode_relation_update(
                FrameKind::NotifyFriendAdded,
                &other,
            ));
            if let Some(me) = self.external_of(session) {
                self.registry.deliver_to_user(
                    other.user_id,
                    encode_relation_update(FrameKind::NotifyFriendAdded, &me),
                );
            }
        }
    }

    async fn handle_remove_friend(self: &Arc<Self>, session: &SessionRef, frame: Frame) {
        let Some(user_id) = self.auth_gate(session) else {
            return;
        };
        let Ok(other_id) = decode_uuid_payload(frame.payload) else {
            self.bad_message(session);
            return;
        };

        if let Some(other) = self.store.remove_friend(user_id, other_id).await {
            self.registry.cache_friend_removed(user_id, other.user_id);

            session.deliver(encode_relation_update(
                FrameKind::NotifyFriendRemoved,
                &other,
            ));
            if let Some(me) = self.external_of(session) {
                self.registry.deliver_to_user(
                    other.user_id,
                    encode_relation_update(FrameKind::NotifyFriendRemoved, &me),
                );
            }
        }
    }

    async fn handle_block(self: &Arc<Self>, session: &SessionRef, frame: Frame) {
        let Some(user_id) = self.auth_gate(session) else {
            return;
        };
        let Ok(username) = decode_username_payload(frame.payload) else {
            self.bad_message(session);
            return;
        };

        if let Some(target) = self.store.block_user(user_id, username).await {
            self.registry.cache_block_added(user_id, target.user_id);
            session.deliver(encode_relation_update(FrameKind::NotifyBlocked, &target));
        }
    }

    async fn handle_unblock(self: &Arc<Self>, session: &SessionRef, frame: Frame) {
        let Some(user_id) = self.auth_gate(session) else {
            return;
        };
        let Ok(other_id) = decode_uuid_payload(frame.payload) else {
            self.bad_message(session);
            return;
        };

        if let Some(other) = self.store.unblock_user(user_id, other_id).await {
            self.registry.cache_block_removed(user_id, other.user_id);
            session.deliver(encode_relation_update(FrameKind::NotifyUnblocked, &other));
        }
    }

    /// Console command: ban an account and evict any live session.
    pub async fn ban_user(&self, username: String, minutes: i64, reason: String) {
        let until = Utc::now() + ChronoDuration::minutes(minutes);

        let banned = self
            .store
            .ban_user(username.clone(), until, reason.clone())
            .await;

        match banned {
            Some(user_id) => {
                let frame = BanMessage { until, reason }.encode();
                self.registry.evict_user(user_id, frame);
                info!("Banned user {} until {}", username, until);
            }
            None => warn!("BanUser: no account named {}", username),
        }
    }

    /// Console command: ban an address at both layers.
    pub async fn ban_ip(&self, addr: std::net::IpAddr, minutes: i64) {
        let until = Utc::now() + ChronoDuration::minutes(minutes);

        self.store.ban_ip(addr, until).await;
        self.bans.insert(
            addr,
            BanEntry {
                until,
                reason: String::new(),
            },
        );
        info!("Banned address {} until {}", addr, until);
    }

    /// Gate shared by every post-auth kind.
    fn auth_gate(&self, session: &SessionRef) -> Option<UserId> {
        if !session.is_authenticated() {
            session.deliver(Frame::empty(FrameKind::Unauthorized));
            return None;
        }
        session.data().map(|data| data.user_id)
    }

    fn external_of(&self, session: &SessionRef) -> Option<ExternalUser> {
        session.data().map(|data| ExternalUser {
            user_id: data.user_id,
            username: data.username,
        })
    }

    fn bad_message(&self, session: &SessionRef) {
        session.deliver(Frame::empty(FrameKind::BadMessage));
        session.close_session();
    }

    async fn reject_if_banned(&self, session: &SessionRef) -> bool {
        match self.bans.check(session.addr()) {
            BanStatus::Banned(entry) => {
                let banned = BanMessage {
                    until: entry.until,
                    reason: entry.reason,
                };
                session.deliver(banned.encode());
                session.close_session();
                true
            }
            BanStatus::Expired => {
                self.store.unban_ip(session.addr()).await;
                false
            }
            BanStatus::Clear => false,
        }
    }
}

fn mode_of(frame: &Frame) -> Option<GameMode> {
    frame.payload.first().copied().and_then(GameMode::from_byte)
}

/// Writes one frame to a not-yet-sessioned connection and closes it,
/// used for Banned and ServerFull rejections.
async fn send_and_close(
    mut tls: tokio_rustls::server::TlsStream<TcpStream>,
    frame: Frame,
) {
    let mut buf = BytesMut::new();
    frame.write(&mut buf);

    if let Err(err) = tls.write_all(&buf).await {
        debug!("Failed writing rejection frame: {}", err);
    }
    let _ = tls.shutdown().await;
}
