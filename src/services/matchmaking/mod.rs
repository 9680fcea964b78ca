//! Matchmaker: routes queue requests to per-mode strategies, spawns
//! match runtimes and routes in-match traffic to them.

pub mod strategy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::game::maps::MapRepository;
use crate::game::{GameMode, ALL_MODES};
use crate::server::SessionMap;
use crate::services::game::{Match, MatchPlayer, MatchRef, MatchResult, MatchSettings};
use crate::services::store::{MatchRecord, Store};
use crate::services::users::UserRegistry;
use crate::session::models::game::{encode_match_starting, Command};
use crate::session::models::social::MatchMessage;
use crate::session::packet::{Frame, FrameKind};
use crate::session::SessionRef;
use crate::utils::elo::{elo_updates, DEFAULT_ELO};
use crate::utils::types::{MatchId, UserId};

use strategy::{QueuedPlayer, ReadyGroup, Strategy};

/// Cadence of the strategy tick loop
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Clock settings shared by every mode: twenty minutes plus one second
/// per successful move
pub const INITIAL_TIME_MS: u64 = 1_200_000;
pub const INCREMENT_MS: u64 = 1_000;

pub struct Matchmaker {
    strategies: Vec<Mutex<Strategy>>,
    /// Strong map keeping live matches reachable per user
    user_match: Mutex<HashMap<UserId, MatchRef>>,
    /// Users waiting in some queue, by mode
    queued: Mutex<HashMap<UserId, GameMode>>,
    live_matches: Mutex<HashMap<MatchId, MatchRef>>,
    next_match_id: AtomicU64,
    shutting_down: AtomicBool,

    maps: Arc<MapRepository>,
    sessions: Arc<SessionMap>,
    registry: Arc<UserRegistry>,
    store: Arc<dyn Store>,
}

impl Matchmaker {
    pub fn new(
        maps: Arc<MapRepository>,
        sessions: Arc<SessionMap>,
        registry: Arc<UserRegistry>,
        store: Arc<dyn Store>,
    ) -> Arc<Matchmaker> {
        let strategies = ALL_MODES
            .iter()
            .map(|mode| {
                Mutex::new(if mode.is_ranked() {
                    Strategy::ranked()
                } else {
                    Strategy::casual(mode.players() as usize)
                })
            })
            .collect();

        Arc::new(Matchmaker {
            strategies,
            user_match: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            live_matches: Mutex::new(HashMap::new()),
            next_match_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            maps,
            sessions,
            registry,
            store,
        })
    }

    /// Adds a player to a mode's queue. Rejected while in a match or
    /// queued anywhere.
    pub async fn enqueue(self: &Arc<Self>, session: &SessionRef, mode: GameMode) {
        let Some(data) = session.data() else {
            session.deliver(Frame::empty(FrameKind::BadQueue));
            return;
        };
        let user_id = data.user_id;

        if self.user_match.lock().contains_key(&user_id) {
            session.deliver(Frame::empty(FrameKind::BadQueue));
            return;
        }

        {
            let mut queued = self.queued.lock();
            if queued.contains_key(&user_id) {
                drop(queued);
                session.deliver(Frame::empty(FrameKind::BadQueue));
                return;
            }
            queued.insert(user_id, mode);
        }

        let elo = mode
            .ranked_index()
            .map(|index| data.elos[index])
            .unwrap_or(DEFAULT_ELO);

        let groups = self.strategies[mode as usize].lock().enqueue(
            QueuedPlayer {
                session: session.clone(),
                user_id,
                elo,
            },
            Instant::now(),
        );

        self.create_matches(groups, mode).await;
    }

    /// Removes a player from a mode's queue. A user-initiated cancel
    /// of an already started match answers BadCancel: the game must be
    /// forfeited instead.
    pub async fn cancel(&self, session: &SessionRef, mode: GameMode, by_user: bool) {
        let Some(data) = session.data() else {
            return;
        };
        let user_id = data.user_id;

        self.queued.lock().remove(&user_id);
        self.strategies[mode as usize].lock().cancel(user_id);

        if by_user && self.user_match.lock().contains_key(&user_id) {
            session.deliver(Frame::empty(FrameKind::BadCancel));
        }
    }

    /// Forwards a decoded command to the sender's active match.
    pub async fn route_to_match(&self, session: &SessionRef, command: Command) {
        let Some(data) = session.data() else {
            session.deliver(Frame::empty(FrameKind::NoMatchFound));
            return;
        };

        let active = self.user_match.lock().get(&data.user_id).cloned();
        match active {
            Some(active) => {
                active
                    .receive_command(data.user_id, session.id(), command)
                    .await
            }
            None => session.deliver(Frame::empty(FrameKind::NoMatchFound)),
        }
    }

    /// Concedes the sender's active match. The forfeiting user is
    /// released immediately so they may queue again.
    pub async fn forfeit(&self, session: &SessionRef) {
        let Some(data) = session.data() else {
            return;
        };

        let active = self.user_match.lock().remove(&data.user_id);
        let Some(active) = active else {
            return;
        };

        active.forfeit(data.user_id, session.id()).await;
        self.registry.notify_match_finished(data.user_id);
    }

    /// Fans an in-match text message out through the sender's match.
    pub async fn send_match_message(&self, session: &SessionRef, message: MatchMessage) {
        let sender = message.user_id;
        let active = self.user_match.lock().get(&sender).cloned();
        match active {
            Some(active) => active.match_message(sender, message.encode()).await,
            None => session.deliver(Frame::empty(FrameKind::NoMatchFound)),
        }
    }

    /// Periodic pass over every strategy; ranked windows widen here.
    pub async fn tick_all(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        for mode in ALL_MODES {
            let groups = self.strategies[mode as usize].lock().tick(now);
            self.create_matches(groups, mode).await;
        }
    }

    /// Shuts down every live match; no further results are recorded.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);

        let matches: Vec<MatchRef> = self.live_matches.lock().values().cloned().collect();
        for active in matches {
            active.shutdown().await;
        }
    }

    async fn create_matches(self: &Arc<Self>, groups: Vec<ReadyGroup>, mode: GameMode) {
        for group in groups {
            self.create_match(group, mode).await;
        }
    }

    async fn create_match(self: &Arc<Self>, group: ReadyGroup, mode: GameMode) {
        // The queue marks drop now that the strategy released them
        {
            let mut queued = self.queued.lock();
            for member in &group {
                queued.remove(&member.user_id);
            }
        }

        // A member who disconnected while queued aborts the match;
        // the rest return to rest and must queue again
        let all_live = group.iter().all(|member| member.session.is_live());
        if !all_live {
            for member in &group {
                if member.session.is_live() {
                    member.session.deliver(Frame::empty(FrameKind::QueueDropped));
                }
            }
            return;
        }

        let Some(map) = self.maps.random_map(mode) else {
            warn!("No maps available for mode {:?}", mode);
            for member in &group {
                member
                    .session
                    .deliver(Frame::empty(FrameKind::MatchCreationError));
            }
            return;
        };

        let settings = MatchSettings {
            map,
            initial_time_ms: INITIAL_TIME_MS,
            increment_ms: INCREMENT_MS,
            mode,
        };

        let mut players = Vec::with_capacity(group.len());
        for (player_id, member) in group.iter().enumerate() {
            let username = member
                .session
                .data()
                .map(|data| data.username)
                .unwrap_or_default();
            players.push(MatchPlayer {
                session_id: member.session.id(),
                user_id: member.user_id,
                username,
                alive: true,
            });

            member
                .session
                .deliver(encode_match_starting(player_id as u8));
        }

        let match_id = self.next_match_id.fetch_add(1, Ordering::AcqRel);
        info!(
            "Starting match {} ({:?}, {} players)",
            match_id,
            mode,
            players.len()
        );

        let active = Match::new(settings, players, self.sessions.clone());

        // The conclusion callback runs inside the match domain; the
        // teardown work hops onto its own task
        let matchmaker = self.clone();
        active
            .set_results_callback(Box::new(move |result| {
                let matchmaker = matchmaker.clone();
                tokio::spawn(async move {
                    matchmaker.on_match_finished(match_id, result).await;
                });
            }))
            .await;

        {
            let mut user_match = self.user_match.lock();
            for member in &group {
                user_match.insert(member.user_id, active.clone());
                self.registry.notify_match_start(member.user_id, &active);
            }
        }

        self.live_matches.lock().insert(match_id, active.clone());

        active.start().await;
    }

    /// Conclusion teardown: release the players, settle ratings and
    /// hand the record to the store.
    async fn on_match_finished(self: &Arc<Self>, match_id: MatchId, result: MatchResult) {
        self.live_matches.lock().remove(&match_id);

        {
            let mut user_match = self.user_match.lock();
            for user_id in &result.user_ids {
                user_match.remove(user_id);
            }
        }

        // Ratings settle before the registry may evict sessionless
        // users
        let (elo_changes, new_elos) = self.settle_elos(&result);

        for user_id in &result.user_ids {
            self.registry.notify_match_finished(*user_id);
        }
        self.registry.flag_new_matches(&result.user_ids, result.mode);

        let record = MatchRecord {
            match_id,
            mode: result.mode,
            finished_at: Utc::now(),
            descriptor: result.descriptor.clone(),
            initial_time_ms: result.initial_time_ms,
            increment_ms: result.increment_ms,
            user_ids: result.user_ids.clone(),
            elimination_order: result.elimination_order.clone(),
            move_history: result.move_history,
            elo_changes,
            new_elos,
        };

        self.store.record_match(record).await;
    }

    /// Computes and applies rating changes for ranked results; casual
    /// results settle to zero deltas.
    fn settle_elos(&self, result: &MatchResult) -> (Vec<i32>, Vec<i32>) {
        let Some(ranked_index) = result.mode.ranked_index() else {
            let unchanged: Vec<i32> = result
                .user_ids
                .iter()
                .map(|user_id| {
                    self.registry
                        .user_data(*user_id)
                        .map(|data| data.elos[0])
                        .unwrap_or(DEFAULT_ELO)
                })
                .collect();
            return (vec![0; result.user_ids.len()], unchanged);
        };

        let initial: Vec<i32> = result
            .user_ids
            .iter()
            .map(|user_id| {
                self.registry
                    .user_data(*user_id)
                    .map(|data| data.elos[ranked_index])
                    .unwrap_or(DEFAULT_ELO)
            })
            .collect();

        let updated = elo_updates(&initial, &result.elimination_order);

        for (player, user_id) in result.user_ids.iter().enumerate() {
            self.registry
                .update_elo(*user_id, ranked_index, updated[player]);
        }

        let changes = updated
            .iter()
            .zip(initial.iter())
            .map(|(after, before)| after - before)
            .collect();

        (changes, updated)
    }

    #[cfg(test)]
    pub(crate) fn live_match_count(&self) -> usize {
        self.live_matches.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn is_in_match(&self, user_id: UserId) -> bool {
        self.user_match.lock().contains_key(&user_id)
    }
}

#[cfg(test)]
mod test {
    use super::Matchmaker;
    use crate::game::maps::{test_maps, MapRepository};
    use crate::game::GameMode;
    use crate::server::SessionMap;
    use crate::services::store::{MemoryStore, Store, UserData};
    use crate::services::users::UserRegistry;
    use crate::session::packet::{Frame, FrameKind};
    use crate::session::test_support::detached;
    use crate::session::SessionRef;
    use crate::utils::types::UserId;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Fixture {
        matchmaker: Arc<Matchmaker>,
        sessions: Arc<SessionMap>,
    }

    fn fixture() -> Fixture {
        let maps = Arc::new(MapRepository::from_maps(vec![
            test_maps::open_two_player(GameMode::ClassicTwoPlayer),
            test_maps::open_two_player(GameMode::RankedTwoPlayer),
        ]));
        let sessions = Arc::new(SessionMap::new());
        let registry = Arc::new(UserRegistry::new());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

        Fixture {
            matchmaker: Matchmaker::new(maps, sessions.clone(), registry, store),
            sessions,
        }
    }

    fn player(
        fixture: &Fixture,
        id: u64,
        name: &str,
    ) -> (SessionRef, mpsc::Receiver<Frame>, UserId) {
        let (session, rx) = detached(id);
        let user_id = Uuid::new_v4();
        session.set_data(UserData {
            user_id,
            username: name.to_string(),
            elos: [1500],
        });
        fixture.sessions.insert(session.clone());
        (session, rx, user_id)
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<FrameKind> {
        let mut kinds = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            kinds.push(frame.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn two_casual_players_get_matched() {
        let fixture = fixture();
        let (alice, mut alice_rx, alice_id) = player(&fixture, 1, "alice");
        let (bob, mut bob_rx, bob_id) = player(&fixture, 2, "bob");

        fixture
            .matchmaker
            .enqueue(&alice, GameMode::ClassicTwoPlayer)
            .await;
        assert!(drain(&mut alice_rx).is_empty());

        fixture
            .matchmaker
            .enqueue(&bob, GameMode::ClassicTwoPlayer)
            .await;

        // Seat assignment follows queue order, then the match starts
        let alice_kinds = drain(&mut alice_rx);
        assert_eq!(alice_kinds[0], FrameKind::MatchStarting);
        assert!(alice_kinds.contains(&FrameKind::StaticMatchData));
        assert!(alice_kinds.contains(&FrameKind::PlayerView));
        assert_eq!(drain(&mut bob_rx)[0], FrameKind::MatchStarting);

        assert_eq!(fixture.matchmaker.live_match_count(), 1);
        assert!(fixture.matchmaker.is_in_match(alice_id));
        assert!(fixture.matchmaker.is_in_match(bob_id));
    }

    #[tokio::test]
    async fn queueing_twice_or_while_matched_is_rejected() {
        let fixture = fixture();
        let (alice, mut alice_rx, _) = player(&fixture, 1, "alice");

        fixture
            .matchmaker
            .enqueue(&alice, GameMode::ClassicTwoPlayer)
            .await;
        fixture
            .matchmaker
            .enqueue(&alice, GameMode::ClassicFivePlayer)
            .await;
        assert!(drain(&mut alice_rx).contains(&FrameKind::BadQueue));

        // Fill the original queue to start the match
        let (bob, _bob_rx, _) = player(&fixture, 2, "bob");
        fixture
            .matchmaker
            .enqueue(&bob, GameMode::ClassicTwoPlayer)
            .await;
        drain(&mut alice_rx);

        fixture
            .matchmaker
            .enqueue(&alice, GameMode::ClassicTwoPlayer)
            .await;
        assert!(drain(&mut alice_rx).contains(&FrameKind::BadQueue));
    }

    #[tokio::test]
    async fn cancel_leaves_the_queue_and_flags_started_matches() {
        let fixture = fixture();
        let (alice, mut alice_rx, _) = player(&fixture, 1, "alice");
        let (bob, mut bob_rx, _) = player(&fixture, 2, "bob");

        fixture
            .matchmaker
            .enqueue(&alice, GameMode::ClassicTwoPlayer)
            .await;
        fixture
            .matchmaker
            .cancel(&alice, GameMode::ClassicTwoPlayer, true)
            .await;
        assert!(drain(&mut alice_rx).is_empty());

        // Bob alone cannot form a match now
        fixture
            .matchmaker
            .enqueue(&bob, GameMode::ClassicTwoPlayer)
            .await;
        assert_eq!(fixture.matchmaker.live_match_count(), 0);

        // Once in a match, cancelling answers BadCancel
        fixture
            .matchmaker
            .enqueue(&alice, GameMode::ClassicTwoPlayer)
            .await;
        assert_eq!(fixture.matchmaker.live_match_count(), 1);
        drain(&mut bob_rx);

        fixture
            .matchmaker
            .cancel(&bob, GameMode::ClassicTwoPlayer, true)
            .await;
        assert!(drain(&mut bob_rx).contains(&FrameKind::BadCancel));
    }

    #[tokio::test]
    async fn dead_session_aborts_match_with_queue_dropped() {
        let fixture = fixture();
        let (alice, _alice_rx, _) = player(&fixture, 1, "alice");
        let (bob, mut bob_rx, _) = player(&fixture, 2, "bob");

        fixture
            .matchmaker
            .enqueue(&alice, GameMode::ClassicTwoPlayer)
            .await;
        alice.close_session();

        fixture
            .matchmaker
            .enqueue(&bob, GameMode::ClassicTwoPlayer)
            .await;

        assert!(drain(&mut bob_rx).contains(&FrameKind::QueueDropped));
        assert_eq!(fixture.matchmaker.live_match_count(), 0);
    }

    #[tokio::test]
    async fn forfeit_releases_players_and_records_the_match() {
        let fixture = fixture();
        let (alice, mut alice_rx, alice_id) = player(&fixture, 1, "alice");
        let (bob, mut bob_rx, bob_id) = player(&fixture, 2, "bob");

        fixture
            .matchmaker
            .enqueue(&alice, GameMode::ClassicTwoPlayer)
            .await;
        fixture
            .matchmaker
            .enqueue(&bob, GameMode::ClassicTwoPlayer)
            .await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        fixture.matchmaker.forfeit(&bob).await;
        assert!(drain(&mut bob_rx).contains(&FrameKind::ForfeitMatch));
        assert!(drain(&mut alice_rx).contains(&FrameKind::Victory));

        // The forfeiter is free immediately; the remaining teardown
        // runs on its own task
        assert!(!fixture.matchmaker.is_in_match(bob_id));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!fixture.matchmaker.is_in_match(alice_id));
        assert_eq!(fixture.matchmaker.live_match_count(), 0);
    }

    #[tokio::test]
    async fn routing_without_a_match_reports_no_match() {
        let fixture = fixture();
        let (alice, mut alice_rx, _) = player(&fixture, 1, "alice");

        let command = crate::session::models::game::Command {
            sender: 0,
            kind: crate::session::models::game::CommandKind::Move,
            tank_id: 0,
            payload: 0,
            payload2: 0,
            sequence_number: 1,
        };
        fixture.matchmaker.route_to_match(&alice, command).await;

        assert!(drain(&mut alice_rx).contains(&FrameKind::NoMatchFound));
    }
}
