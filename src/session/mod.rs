//! Client sessions: one encrypted connection with a framed read loop,
//! a serialized write loop and a heartbeat, plus the per-session rate
//! limit and authentication state.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tokio_rustls::server::TlsStream;
use tokio_util::codec::FramedWrite;

use crate::game::{GameMode, MODE_COUNT};
use crate::server::Server;
use crate::services::store::UserData;
use crate::session::packet::{Frame, FrameCodec, FrameHeader, FrameKind, HEADER_SIZE};
use crate::session::ratelimit::{frame_cost, TokenBucket};
use crate::utils::types::SessionId;

pub mod models;
pub mod packet;
pub mod ratelimit;

/// Seconds allowed between a header arriving and its body, and for one
/// frame write to complete
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat cadence and the window a PingResponse must arrive in
pub const PING_INTERVAL: Duration = Duration::from_secs(90);
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on frames waiting to be written; a client that lets
/// this build up is not reading and gets disconnected
pub const MAX_MESSAGE_BACKLOG: usize = 50;

pub type SessionRef = Arc<Session>;

/// One live client connection.
pub struct Session {
    id: SessionId,
    addr: IpAddr,

    /// Cleared exactly once when the session begins closing
    live: AtomicBool,
    /// Set on login, never cleared for the connection's lifetime
    authenticated: AtomicBool,
    /// Latch limiting each connection to one registration attempt
    registered: AtomicBool,
    /// Set between a Ping write and the matching PingResponse
    awaiting_pong: AtomicBool,

    data: Mutex<Option<UserData>>,
    /// Per-mode flag for skipping history fetches with no new results
    has_new_matches: Mutex<[bool; MODE_COUNT]>,
    limiter: Mutex<TokenBucket>,

    outbound: mpsc::Sender<Frame>,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Creates the session and spawns its transport tasks.
    pub fn spawn(
        id: SessionId,
        addr: IpAddr,
        stream: TlsStream<TcpStream>,
        server: Arc<Server>,
    ) -> SessionRef {
        let (outbound, outbound_rx) = mpsc::channel(MAX_MESSAGE_BACKLOG);
        let (closed, _) = watch::channel(false);

        let session = Arc::new(Session {
            id,
            addr,
            live: AtomicBool::new(true),
            authenticated: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            awaiting_pong: AtomicBool::new(false),
            data: Mutex::new(None),
            has_new_matches: Mutex::new([true; MODE_COUNT]),
            limiter: Mutex::new(TokenBucket::new(Instant::now())),
            outbound,
            closed,
        });

        // Registration must precede the transport tasks
        server.sessions.insert(session.clone());

        tokio::spawn(Session::run(session.clone(), server, stream, outbound_rx));

        session
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn set_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    /// Binds authenticated user data to the session.
    pub fn set_data(&self, data: UserData) {
        *self.data.lock() = Some(data);
        self.authenticated.store(true, Ordering::Release);
    }

    pub fn data(&self) -> Option<UserData> {
        self.data.lock().clone()
    }

    /// Updates the cached elo for a ranked mode after a match records.
    pub fn update_elo(&self, ranked_index: usize, new_elo: i32) {
        if let Some(data) = self.data.lock().as_mut() {
            data.elos[ranked_index] = new_elo;
        }
    }

    pub fn has_matches(&self, mode: GameMode) -> bool {
        self.has_new_matches.lock()[mode as usize]
    }

    pub fn set_has_matches(&self, value: bool, mode: GameMode) {
        self.has_new_matches.lock()[mode as usize] = value;
    }

    /// Charges the frame against the token bucket, returning whether
    /// it may be dispatched.
    pub fn spend_tokens(&self, header: &FrameHeader) -> bool {
        self.limiter
            .lock()
            .try_spend(frame_cost(header), Instant::now())
    }

    /// Enqueues an outbound frame. Writes preserve `deliver` call
    /// order. Exceeding the backlog closes the session.
    pub fn deliver(&self, frame: Frame) {
        if !self.is_live() {
            return;
        }

        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Session write backlog exceeded (SID: {})", self.id);
                self.close_session();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Begins closing the session. Idempotent; later `deliver` calls
    /// are no-ops.
    pub fn close_session(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            let _ = self.closed.send(true);
        }
    }

    /// Drives the connection until it closes, then detaches the
    /// session from the server.
    async fn run(
        session: SessionRef,
        server: Arc<Server>,
        stream: TlsStream<TcpStream>,
        outbound_rx: mpsc::Receiver<Frame>,
    ) {
        let (reader, writer) = tokio::io::split(stream);
        let writer = FramedWrite::new(writer, FrameCodec);

        tokio::join!(
            session.clone().read_loop(server.clone(), reader),
            Session::write_loop(session.clone(), writer, outbound_rx),
            session.clone().heartbeat(),
        );

        server.remove_session(&session).await;
        debug!("Session stopped (SID: {})", session.id);
    }

    /// Reads frames strictly sequentially: a new header is not
    /// solicited until the previous body has been dispatched.
    async fn read_loop(
        self: SessionRef,
        server: Arc<Server>,
        mut reader: ReadHalf<TlsStream<TcpStream>>,
    ) {
        let mut closed = self.closed.subscribe();
        let mut header_buf = [0u8; HEADER_SIZE];

        loop {
            // A quiet connection is indistinguishable from an idle
            // client, so the header read itself has no timer; the
            // heartbeat covers dead peers
            let read = tokio::select! {
                _ = closed.changed() => return,
                read = reader.read_exact(&mut header_buf) => read,
            };
            if read.is_err() {
                self.close_session();
                return;
            }

            let header = match FrameHeader::parse(&header_buf) {
                Some(header) if header.valid_server() => header,
                // Fail fast on misbehaving clients; an honest client
                // can simply reconnect
                _ => {
                    self.deliver(Frame::empty(FrameKind::BadMessage));
                    self.close_session();
                    return;
                }
            };

            // The body must follow promptly once a header announces it
            let mut body = vec![0u8; header.length as usize];
            if header.length > 0 {
                let read = tokio::select! {
                    _ = closed.changed() => return,
                    read = timeout(READ_TIMEOUT, reader.read_exact(&mut body)) => read,
                };
                match read {
                    Ok(Ok(_)) => {}
                    _ => {
                        self.close_session();
                        return;
                    }
                }
            }

            let frame = Frame::new(header.kind, body.into());

            // Heartbeat frames are consumed inside the session
            if frame.kind == FrameKind::PingResponse {
                self.awaiting_pong.store(false, Ordering::Release);
                continue;
            }
            if frame.kind == FrameKind::Ping {
                self.deliver(Frame::empty(FrameKind::PingResponse));
                continue;
            }

            if !self.spend_tokens(&header) {
                self.deliver(Frame::empty(FrameKind::RateLimited));
                continue;
            }

            server.on_message(&self, frame).await;
        }
    }

    /// Writes queued frames one at a time; a new write begins only
    /// after the previous one completed.
    async fn write_loop(
        session: SessionRef,
        mut writer: FramedWrite<tokio::io::WriteHalf<TlsStream<TcpStream>>, FrameCodec>,
        mut outbound_rx: mpsc::Receiver<Frame>,
    ) {
        let mut closed = session.closed.subscribe();

        loop {
            let frame = tokio::select! {
                _ = closed.changed() => break,
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            match timeout(WRITE_TIMEOUT, writer.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!("Session write failed (SID: {}): {}", session.id, err);
                    session.close_session();
                    break;
                }
                Err(_) => {
                    // Peer is reading too slowly
                    session.close_session();
                    break;
                }
            }
        }

        // Flush anything queued just before the close was requested,
        // e.g. a BadMessage or PingTimeout frame
        while let Ok(frame) = outbound_rx.try_recv() {
            if timeout(WRITE_TIMEOUT, writer.send(frame)).await.is_err() {
                break;
            }
        }

        let mut stream = writer.into_inner();
        let _ = stream.shutdown().await;
    }

    /// Pings the client every interval and closes the session when a
    /// response does not arrive within the timeout.
    async fn heartbeat(self: SessionRef) {
        let mut closed = self.closed.subscribe();

        loop {
            tokio::select! {
                _ = closed.changed() => return,
                _ = sleep(PING_INTERVAL) => {}
            }

            self.deliver(Frame::empty(FrameKind::Ping));
            self.awaiting_pong.store(true, Ordering::Release);

            tokio::select! {
                _ = closed.changed() => return,
                _ = sleep(PING_TIMEOUT) => {}
            }

            if self.awaiting_pong.load(Ordering::Acquire) {
                error!("Session ping timed out (SID: {})", self.id);
                self.deliver(Frame::empty(FrameKind::PingTimeout));
                self.close_session();
                return;
            }
        }
    }
}


#[cfg(test)]
mod test {
    use super::test_support::detached;
    use super::MAX_MESSAGE_BACKLOG;
    use crate::game::GameMode;
    use crate::services::store::UserData;
    use crate::session::packet::{Frame, FrameKind};
    use uuid::Uuid;

    #[tokio::test]
    async fn backlog_overflow_closes_session() {
        let (session, _rx) = detached(1);

        for _ in 0..MAX_MESSAGE_BACKLOG {
            session.deliver(Frame::empty(FrameKind::Ping));
        }
        assert!(session.is_live());

        // One more frame than the backlog allows
        session.deliver(Frame::empty(FrameKind::Ping));
        assert!(!session.is_live());
    }

    #[tokio::test]
    async fn deliver_after_close_is_noop() {
        let (session, mut rx) = detached(2);
        session.close_session();
        session.close_session(); // idempotent

        session.deliver(Frame::empty(FrameKind::Ping));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn auth_binding() {
        let (session, _rx) = detached(3);
        assert!(!session.is_authenticated());

        session.set_data(UserData {
            user_id: Uuid::new_v4(),
            username: "alice".to_string(),
            elos: [1500],
        });
        assert!(session.is_authenticated());

        session.update_elo(0, 1516);
        assert_eq!(session.data().unwrap().elos[0], 1516);
    }

    #[tokio::test]
    async fn history_flags_per_mode() {
        let (session, _rx) = detached(4);
        assert!(session.has_matches(GameMode::RankedTwoPlayer));

        session.set_has_matches(false, GameMode::RankedTwoPlayer);
        assert!(!session.has_matches(GameMode::RankedTwoPlayer));
        assert!(session.has_matches(GameMode::ClassicTwoPlayer));
    }
}
