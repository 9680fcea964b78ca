//! Match runtime: one per live match. Owns the game instance, the
//! per-player command queues and the clocks, and drives the turn state
//! machine until one player remains.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};

use crate::game::instance::GameInstance;
use crate::game::maps::{GameMap, MapDescriptor};
use crate::game::vision::PlayerView;
use crate::game::{GameMode, GamePhase, TURN_FUEL};
use crate::server::SessionMap;
use crate::session::models::game::{
    encode_player_view, Command, CommandHead, CommandKind, StaticMatchData,
};
use crate::session::models::social::ExternalUser;
use crate::session::packet::{Frame, FrameKind};
use crate::utils::types::{PlayerId, SessionId, UserId};

/// Commands a player may hold queued; excess is dropped to protect the
/// match from floods
pub const MAX_QUEUE_SIZE: usize = 8;

pub type MatchRef = Arc<Match>;

/// Parameters a match is created from.
#[derive(Clone)]
pub struct MatchSettings {
    pub map: Arc<GameMap>,
    pub initial_time_ms: u64,
    pub increment_ms: u64,
    pub mode: GameMode,
}

/// Record of a finished match handed to the results callback.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub mode: GameMode,
    pub descriptor: MapDescriptor,
    pub initial_time_ms: u64,
    pub increment_ms: u64,
    pub move_history: Vec<CommandHead>,
    /// Indexed by player id
    pub user_ids: Vec<UserId>,
    /// Indexed by player id, 0 = first eliminated; the survivor holds
    /// the highest value
    pub elimination_order: Vec<u8>,
}

/// One participant as known to the runtime.
#[derive(Debug, Clone)]
pub struct MatchPlayer {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub username: String,
    pub alive: bool,
}

type ResultsCallback = Box<dyn FnOnce(MatchResult) + Send>;

/// Queue entry ordered by ascending sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedCommand(Command);

impl Ord for QueuedCommand {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let a = &self.0;
        let b = &other.0;
        a.sequence_number.cmp(&b.sequence_number).then_with(|| {
            (a.sender, a.kind as u8, a.tank_id, a.payload, a.payload2).cmp(&(
                b.sender,
                b.kind as u8,
                b.tank_id,
                b.payload,
                b.payload2,
            ))
        })
    }
}

impl PartialOrd for QueuedCommand {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Public handle. All state lives behind one async mutex, the match's
/// serialization domain; timer tasks hold only weak references.
pub struct Match {
    state: Mutex<MatchRuntime>,
    /// Mirror of the runtime's turn id, read at command post time to
    /// detect work that raced a turn change
    turn_counter: AtomicU32,
}

struct MatchRuntime {
    phase: GamePhase,
    current_player: PlayerId,
    current_fuel: u8,
    remaining_players: u8,
    tanks_placed: u16,
    elim_counter: u8,
    turn_id: u32,
    turn_claimed: bool,
    expiry: Instant,
    shutdown: bool,

    players: Vec<MatchPlayer>,
    queues: Vec<BinaryHeap<Reverse<QueuedCommand>>>,
    time_left: Vec<Duration>,
    increment: Duration,

    game: GameInstance,
    views: Vec<Option<PlayerView>>,
    result: MatchResult,

    sessions: Arc<SessionMap>,
    results_cb: Option<ResultsCallback>,
}

impl Match {
    pub fn new(
        settings: MatchSettings,
        players: Vec<MatchPlayer>,
        sessions: Arc<SessionMap>,
    ) -> MatchRef {
        let n = players.len();
        let game = GameInstance::new(&settings.map);

        let result = MatchResult {
            mode: settings.mode,
            descriptor: settings.map.descriptor.clone(),
            initial_time_ms: settings.initial_time_ms,
            increment_ms: settings.increment_ms,
            move_history: Vec::new(),
            user_ids: players.iter().map(|player| player.user_id).collect(),
            elimination_order: vec![0; n],
        };

        Arc::new(Match {
            state: Mutex::new(MatchRuntime {
                phase: GamePhase::Setup,
                current_player: 0,
                current_fuel: TURN_FUEL,
                remaining_players: n as u8,
                tanks_placed: 0,
                elim_counter: 0,
                turn_id: 0,
                turn_claimed: false,
                expiry: Instant::now(),
                shutdown: false,
                players,
                queues: (0..n).map(|_| BinaryHeap::new()).collect(),
                time_left: vec![Duration::from_millis(settings.initial_time_ms); n],
                increment: Duration::from_millis(settings.increment_ms),
                game,
                views: vec![None; n],
                result,
                sessions,
                results_cb: None,
            }),
            turn_counter: AtomicU32::new(0),
        })
    }

    /// Must be installed before `start`.
    pub async fn set_results_callback(&self, callback: ResultsCallback) {
        self.state.lock().await.results_cb = Some(callback);
    }

    /// Sends the static data and initial views, then arms the first
    /// turn.
    pub async fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().await;

        let static_data = state.static_data().encode();
        for player in 0..state.players.len() {
            state.send_to_player(player as PlayerId, static_data.clone());
        }

        state.broadcast_views();
        state.advance(self);
    }

    /// Enqueues a client command. The caller's session id is used for
    /// replies when the sender is not a participant.
    pub async fn receive_command(
        self: &Arc<Self>,
        user_id: UserId,
        origin: SessionId,
        command: Command,
    ) {
        // Post time snapshot: a turn change between here and holding
        // the lock marks the command stale
        let posted_turn = self.turn_counter.load(Ordering::Acquire);
        self.receive_command_at(user_id, origin, command, posted_turn)
            .await;
    }

    pub(crate) async fn receive_command_at(
        self: &Arc<Self>,
        user_id: UserId,
        origin: SessionId,
        mut command: Command,
        posted_turn: u32,
    ) {
        let mut state = self.state.lock().await;

        let Some(player) = state.player_of(user_id) else {
            state.sessions.deliver(origin, Frame::empty(FrameKind::GameEnded));
            return;
        };

        if state.phase == GamePhase::Concluded {
            state.send_to_player(player, Frame::empty(FrameKind::GameEnded));
            return;
        }

        if posted_turn != state.turn_id {
            state.send_to_player(player, Frame::empty(FrameKind::StaleMove));
            return;
        }

        // The sender field is bound server-side; clients cannot spoof
        command.sender = player;

        if state.queues[player as usize].len() < MAX_QUEUE_SIZE {
            state.queues[player as usize].push(Reverse(QueuedCommand(command)));
        } else {
            return;
        }

        if player == state.current_player {
            if state.turn_claimed {
                state.send_to_player(player, Frame::empty(FrameKind::StaleMove));
                return;
            }
            state.claim_and_apply();
            state.advance(self);
        }
    }

    /// Concedes the match for the given user.
    pub async fn forfeit(self: &Arc<Self>, user_id: UserId, origin: SessionId) {
        let mut state = self.state.lock().await;

        let Some(player) = state.player_of(user_id) else {
            state.sessions.deliver(origin, Frame::empty(FrameKind::GameEnded));
            return;
        };

        if state.phase == GamePhase::Concluded {
            state.send_to_player(player, Frame::empty(FrameKind::GameEnded));
            return;
        }

        state.handle_elimination(player, FrameKind::ForfeitMatch);
        state.advance(self);
    }

    /// Rebinds a reconnecting user to a new session and resends the
    /// match state. Commands queued on the old socket are discarded so
    /// stale intent does not replay.
    pub async fn sync_player(self: &Arc<Self>, session_id: SessionId, user_id: UserId) {
        let mut state = self.state.lock().await;

        if state.phase == GamePhase::Concluded {
            state.sessions.deliver(session_id, Frame::empty(FrameKind::GameEnded));
            return;
        }

        let Some(player) = state.player_of(user_id) else {
            state.sessions.deliver(session_id, Frame::empty(FrameKind::GameEnded));
            return;
        };

        state.players[player as usize].session_id = session_id;
        state.queues[player as usize].clear();

        let static_data = state.static_data().encode();
        state.sessions.deliver(session_id, static_data);

        if let Some(view) = &state.views[player as usize] {
            let mut view = view.clone();
            // Refresh the running turn's clock for the reconnect
            let remaining = state.expiry.saturating_duration_since(Instant::now());
            view.timers_ms = state
                .time_left
                .iter()
                .map(|left| left.as_millis() as i64)
                .collect();
            view.timers_ms[state.current_player as usize] = remaining.as_millis() as i64;
            state.sessions.deliver(session_id, encode_player_view(&view));
        }
    }

    /// Fans a pre-encoded match text frame out to the other
    /// participants.
    pub async fn match_message(&self, sender: UserId, frame: Frame) {
        let state = self.state.lock().await;
        for player in &state.players {
            if player.user_id != sender {
                state.sessions.deliver(player.session_id, frame.clone());
            }
        }
    }

    /// Stops all further activity; no more frames are produced.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.shutdown = true;
        state.results_cb = None;
    }

    /// Entry point of the spawned per-turn timer, after its expiry.
    async fn handle_turn_timeout(self: Arc<Self>, turn_id: u32) {
        let mut state = self.state.lock().await;

        // A stale timer lost the race to a command or a later turn
        if state.turn_id != turn_id || state.turn_claimed || state.shutdown {
            return;
        }
        if state.phase == GamePhase::Concluded {
            return;
        }

        state.turn_claimed = true;
        let timed_out = state.current_player;
        state.handle_elimination(timed_out, FrameKind::TimedOut);
        state.advance(&self);
    }

    #[cfg(test)]
    async fn with_state<T>(&self, read: impl FnOnce(&MatchRuntime) -> T) -> T {
        read(&*self.state.lock().await)
    }
}

impl MatchRuntime {
    fn player_of(&self, user_id: UserId) -> Option<PlayerId> {
        self.players
            .iter()
            .position(|player| player.user_id == user_id)
            .map(|index| index as PlayerId)
    }

    fn send_to_player(&self, player: PlayerId, frame: Frame) {
        self.sessions
            .deliver(self.players[player as usize].session_id, frame);
    }

    fn static_data(&self) -> StaticMatchData {
        StaticMatchData {
            players: self
                .players
                .iter()
                .map(|player| ExternalUser {
                    user_id: player.user_id,
                    username: player.username.clone(),
                })
                .collect(),
            placement_mask: self.game.placement_mask().to_vec(),
        }
    }

    /// Arms turns until the match waits on a player or concludes.
    fn advance(&mut self, this: &MatchRef) {
        loop {
            if self.shutdown || self.phase == GamePhase::Concluded {
                return;
            }

            self.turn_id = self.turn_id.wrapping_add(1);
            self.turn_claimed = false;
            this.turn_counter.store(self.turn_id, Ordering::Release);

            // Setup completes once every remaining player has placed
            // their tanks
            if self.phase == GamePhase::Setup
                && self.tanks_placed
                    >= u16::from(self.remaining_players)
                        * u16::from(self.game.tanks_per_player())
            {
                self.phase = GamePhase::Play;
                self.current_player = 0;
                self.current_fuel = TURN_FUEL;
                self.broadcast_views();
            }

            if self.remaining_players <= 1 {
                self.conclude();
                return;
            }

            if !self.players[self.current_player as usize].alive {
                self.current_player = (self.current_player + 1) % self.players.len() as u8;
                self.broadcast_views();
                continue;
            }

            self.arm_timer(this);

            if !self.queues[self.current_player as usize].is_empty() {
                self.claim_and_apply();
                continue;
            }

            return;
        }
    }

    fn arm_timer(&mut self, this: &MatchRef) {
        self.expiry = Instant::now() + self.time_left[self.current_player as usize];

        let expiry = self.expiry;
        let turn_id = self.turn_id;
        let weak = Arc::downgrade(this);
        tokio::spawn(async move {
            sleep_until(expiry).await;
            if let Some(active) = weak.upgrade() {
                active.handle_turn_timeout(turn_id).await;
            }
        });
    }

    /// Claims the current turn for the head of the current player's
    /// queue and applies it, charging the clock either way.
    fn claim_and_apply(&mut self) {
        let now = Instant::now();
        self.turn_claimed = true;

        let player = self.current_player;
        let Some(Reverse(QueuedCommand(command))) = self.queues[player as usize].pop() else {
            return;
        };

        // Time spent deciding comes off the clock before validation
        let remaining = self.expiry.saturating_duration_since(now);
        self.time_left[player as usize] = remaining;

        if !self.apply_command(&command) {
            self.send_to_player(player, Frame::empty(FrameKind::FailedMove));
            return;
        }

        self.time_left[player as usize] += self.increment;
        self.result.move_history.push(command.head());

        if self.phase == GamePhase::Setup {
            // Placement turns burn no fuel
            self.current_player = (player + 1) % self.players.len() as u8;
            self.broadcast_views();
            return;
        }

        self.current_fuel -= 1;
        if self.current_fuel == 0 {
            self.current_player = (player + 1) % self.players.len() as u8;
            self.current_fuel = TURN_FUEL;
        }
        self.broadcast_views();
    }

    /// Validates and applies a command against the game rules.
    /// Returns whether the command was valid; invalid commands mutate
    /// nothing.
    fn apply_command(&mut self, command: &Command) -> bool {
        if self.phase == GamePhase::Setup && command.kind != CommandKind::Place {
            return false;
        }

        let tank_exists = command.tank_id < self.game.tank_count();

        match command.kind {
            CommandKind::Move => {
                if !tank_exists || !self.owned_live_tank(command) {
                    return false;
                }
                self.game.move_tank(command.tank_id, command.payload != 0);
                true
            }
            CommandKind::RotateTank => {
                if !tank_exists || !self.owned_live_tank(command) {
                    return false;
                }
                self.game.rotate_tank(command.tank_id, command.payload);
                true
            }
            CommandKind::RotateBarrel => {
                if !tank_exists || !self.owned_live_tank(command) {
                    return false;
                }
                self.game.rotate_barrel(command.tank_id, command.payload);
                true
            }
            CommandKind::Fire => {
                if !tank_exists || !self.owned_live_tank(command) {
                    return false;
                }
                if !self.game.tank(command.tank_id).loaded {
                    return false;
                }
                self.game.fire_tank(command.tank_id);
                true
            }
            CommandKind::Load => {
                if !tank_exists || !self.owned_live_tank(command) {
                    return false;
                }
                if self.game.tank(command.tank_id).loaded {
                    return false;
                }
                self.game.load_tank(command.tank_id);
                true
            }
            CommandKind::Place => {
                if self.phase != GamePhase::Setup {
                    return false;
                }

                let (x, y) = (command.payload, command.payload2);
                let direction = command.tank_id;
                if direction >= 8 {
                    return false;
                }
                if !self.game.player(command.sender).can_place() {
                    return false;
                }
                if !self.game.check_placement(x, y, command.sender) {
                    return false;
                }

                self.game.place_tank(x, y, command.sender, direction);
                self.tanks_placed += 1;
                true
            }
            CommandKind::NoOp => false,
        }
    }

    fn owned_live_tank(&self, command: &Command) -> bool {
        let tank = self.game.tank(command.tank_id);
        tank.alive() && tank.owner == command.sender
    }

    /// Moves within a failed move / valid move are judged against the
    /// grid; elimination removes a player entirely.
    fn handle_elimination(&mut self, player: PlayerId, reason: FrameKind) {
        if !self.players[player as usize].alive {
            return;
        }

        self.queues[player as usize].clear();

        self.remaining_players -= 1;
        self.time_left[player as usize] = Duration::ZERO;
        self.players[player as usize].alive = false;
        self.result.elimination_order[player as usize] = self.elim_counter;
        self.elim_counter += 1;

        self.send_to_player(player, Frame::empty(reason));

        // Pending placements no longer count towards setup completion
        if self.phase == GamePhase::Setup {
            self.tanks_placed -= u16::from(self.game.player(player).tanks_placed);
        }

        self.game.destroy_player_tanks(player);

        self.broadcast_views();

        if player == self.current_player {
            self.current_player = (self.current_player + 1) % self.players.len() as u8;
            self.current_fuel = TURN_FUEL;
        }
    }

    /// Recomputes and sends every live player's view. A player seen
    /// with zero live tanks during Play is implicitly eliminated here.
    fn broadcast_views(&mut self) {
        for index in 0..self.players.len() {
            if !self.players[index].alive {
                continue;
            }

            let (mut view, live_tanks) = self.game.compute_view(index as PlayerId);

            if live_tanks == 0 && self.phase != GamePhase::Setup {
                self.remaining_players -= 1;
                self.players[index].alive = false;
                self.result.elimination_order[index] = self.elim_counter;
                self.elim_counter += 1;
                self.send_to_player(index as PlayerId, Frame::empty(FrameKind::Eliminated));
            }

            view.current_player = self.current_player;
            view.current_fuel = self.current_fuel;
            view.phase = self.phase;
            view.timers_ms = self
                .time_left
                .iter()
                .map(|left| left.as_millis() as i64)
                .collect();

            self.send_to_player(index as PlayerId, encode_player_view(&view));
            self.views[index] = Some(view);
        }
    }

    /// One player remains: record their survival, congratulate them
    /// and hand the result off.
    fn conclude(&mut self) {
        if self.shutdown {
            return;
        }

        self.phase = GamePhase::Concluded;

        let winner = self
            .players
            .iter()
            .position(|player| player.alive)
            .map(|index| index as PlayerId);

        if let Some(winner) = winner {
            self.result.elimination_order[winner as usize] = self.elim_counter;
            self.send_to_player(winner, Frame::empty(FrameKind::Victory));
        }

        debug!("Match concluded (winner: {:?})", winner);

        if let Some(callback) = self.results_cb.take() {
            callback(self.result.clone());
        }
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> GamePhase {
        self.phase
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> (PlayerId, u8) {
        (self.current_player, self.current_fuel)
    }

    #[cfg(test)]
    pub(crate) fn clock_of(&self, player: PlayerId) -> Duration {
        self.time_left[player as usize]
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self, player: PlayerId) -> usize {
        self.queues[player as usize].len()
    }

    #[cfg(test)]
    pub(crate) fn is_alive(&self, player: PlayerId) -> bool {
        self.players[player as usize].alive
    }
}

#[cfg(test)]
mod test {
    use super::{Match, MatchPlayer, MatchRef, MatchResult, MatchSettings};
    use crate::game::grid::CellKind;
    use crate::game::maps::{test_maps, GameMap, MapDescriptor};
    use crate::game::{GameMode, GamePhase, NO_PLAYER, TURN_FUEL};
    use crate::server::SessionMap;
    use crate::session::models::game::{Command, CommandKind};
    use crate::session::packet::{Frame, FrameKind};
    use crate::session::test_support::detached;
    use crate::session::SessionRef;
    use crate::utils::types::{SessionId, UserId};
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Fixture {
        active: MatchRef,
        sessions: Arc<SessionMap>,
        players: Vec<(SessionRef, mpsc::Receiver<Frame>, UserId)>,
        result: Arc<Mutex<Option<MatchResult>>>,
    }

    async fn start_match(map: GameMap, initial_time_ms: u64) -> Fixture {
        let sessions = Arc::new(SessionMap::new());
        let count = map.descriptor.num_players as usize;

        let mut players = Vec::with_capacity(count);
        let mut match_players = Vec::with_capacity(count);
        for index in 0..count {
            let (session, rx) = detached(index as SessionId + 1);
            sessions.insert(session.clone());
            let user_id = Uuid::new_v4();
            match_players.push(MatchPlayer {
                session_id: session.id(),
                user_id,
                username: format!("player{}", index),
                alive: true,
            });
            players.push((session, rx, user_id));
        }

        let settings = MatchSettings {
            map: Arc::new(map),
            initial_time_ms,
            increment_ms: 1_000,
            mode: GameMode::ClassicTwoPlayer,
        };

        let active = Match::new(settings, match_players, sessions.clone());

        let result = Arc::new(Mutex::new(None));
        let result_slot = result.clone();
        active
            .set_results_callback(Box::new(move |outcome| {
                *result_slot.lock() = Some(outcome);
            }))
            .await;

        active.start().await;

        Fixture {
            active,
            sessions,
            players,
            result,
        }
    }

    /// Open 8x8 map, one tank per player, columns 0 and 1 masked for
    /// the two seats so tanks start adjacent.
    fn duel_map() -> GameMap {
        let width = 8u8;
        let height = 8u8;
        let total = width as usize * height as usize;

        let mut mask = vec![NO_PLAYER; total];
        for y in 0..height as usize {
            mask[y * width as usize] = 0;
            mask[y * width as usize + 1] = 1;
        }

        GameMap {
            descriptor: MapDescriptor {
                filename: "duel.env".to_string(),
                width,
                height,
                tanks_per_player: 1,
                num_players: 2,
                mode: 0,
            },
            kinds: vec![CellKind::Open; total],
            mask,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<FrameKind> {
        let mut kinds = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            kinds.push(frame.kind);
        }
        kinds
    }

    fn place(sender: u8, dir: u8, x: u8, y: u8, seq: u16) -> Command {
        Command {
            sender,
            kind: CommandKind::Place,
            tank_id: dir,
            payload: x,
            payload2: y,
            sequence_number: seq,
        }
    }

    fn action(kind: CommandKind, tank_id: u8, payload: u8, seq: u16) -> Command {
        Command {
            sender: 0,
            kind,
            tank_id,
            payload,
            payload2: 0,
            sequence_number: seq,
        }
    }

    async fn send(fixture: &Fixture, player: usize, command: Command) {
        let (session, _, user_id) = &fixture.players[player];
        fixture
            .active
            .receive_command(*user_id, session.id(), command)
            .await;
    }

    /// Runs both seats through setup on the standard two tank map.
    async fn complete_setup(fixture: &Fixture) {
        send(fixture, 0, place(0, 2, 0, 0, 1)).await;
        send(fixture, 1, place(1, 6, 7, 0, 1)).await;
        send(fixture, 0, place(0, 2, 0, 1, 2)).await;
        send(fixture, 1, place(1, 6, 7, 1, 2)).await;
    }

    #[tokio::test]
    async fn start_sends_static_data_and_views() {
        let mut fixture =
            start_match(test_maps::open_two_player(GameMode::ClassicTwoPlayer), 60_000).await;

        for (_, rx, _) in fixture.players.iter_mut() {
            let kinds = drain(rx);
            assert_eq!(kinds[0], FrameKind::StaticMatchData);
            assert!(kinds.contains(&FrameKind::PlayerView));
        }

        let (phase, cursor) = fixture
            .active
            .with_state(|state| (state.phase(), state.cursor()))
            .await;
        assert_eq!(phase, GamePhase::Setup);
        assert_eq!(cursor.0, 0);
    }

    #[tokio::test]
    async fn placement_rotates_seats_and_promotes_to_play() {
        let fixture =
            start_match(test_maps::open_two_player(GameMode::ClassicTwoPlayer), 60_000).await;

        send(&fixture, 0, place(0, 2, 0, 0, 1)).await;
        let cursor = fixture.active.with_state(|state| state.cursor()).await;
        assert_eq!(cursor.0, 1);

        complete_setup_rest(&fixture).await;

        let (phase, cursor) = fixture
            .active
            .with_state(|state| (state.phase(), state.cursor()))
            .await;
        assert_eq!(phase, GamePhase::Play);
        assert_eq!(cursor, (0, TURN_FUEL));
    }

    async fn complete_setup_rest(fixture: &Fixture) {
        send(fixture, 1, place(1, 6, 7, 0, 1)).await;
        send(fixture, 0, place(0, 2, 0, 1, 2)).await;
        send(fixture, 1, place(1, 6, 7, 1, 2)).await;
    }

    #[tokio::test]
    async fn illegal_placement_fails_without_advancing() {
        let mut fixture =
            start_match(test_maps::open_two_player(GameMode::ClassicTwoPlayer), 60_000).await;

        // Masked for seat 1, not seat 0
        send(&fixture, 0, place(0, 2, 7, 0, 1)).await;

        let kinds = drain(&mut fixture.players[0].1);
        assert!(kinds.contains(&FrameKind::FailedMove));

        let (phase, cursor) = fixture
            .active
            .with_state(|state| (state.phase(), state.cursor()))
            .await;
        assert_eq!(phase, GamePhase::Setup);
        // Still seat 0's turn
        assert_eq!(cursor.0, 0);
    }

    #[tokio::test]
    async fn fuel_cycle_during_play() {
        let fixture =
            start_match(test_maps::open_two_player(GameMode::ClassicTwoPlayer), 60_000).await;
        complete_setup(&fixture).await;

        // Three valid commands burn the fuel and pass the turn
        send(&fixture, 0, action(CommandKind::Move, 0, 0, 3)).await;
        let cursor = fixture.active.with_state(|state| state.cursor()).await;
        assert_eq!(cursor, (0, TURN_FUEL - 1));

        send(&fixture, 0, action(CommandKind::Move, 0, 0, 4)).await;
        send(&fixture, 0, action(CommandKind::Move, 0, 0, 5)).await;

        let cursor = fixture.active.with_state(|state| state.cursor()).await;
        assert_eq!(cursor, (1, TURN_FUEL));
    }

    #[tokio::test]
    async fn invalid_command_keeps_the_turn() {
        let mut fixture =
            start_match(test_maps::open_two_player(GameMode::ClassicTwoPlayer), 60_000).await;
        complete_setup(&fixture).await;
        drain(&mut fixture.players[0].1);

        // Seat 0 commanding seat 1's tank is rejected outright
        send(&fixture, 0, action(CommandKind::Move, 2, 0, 3)).await;

        let kinds = drain(&mut fixture.players[0].1);
        assert!(kinds.contains(&FrameKind::FailedMove));

        let cursor = fixture.active.with_state(|state| state.cursor()).await;
        assert_eq!(cursor, (0, TURN_FUEL));
    }

    #[tokio::test]
    async fn queued_commands_dispatch_in_sequence_order() {
        let fixture =
            start_match(test_maps::open_two_player(GameMode::ClassicTwoPlayer), 60_000).await;
        complete_setup(&fixture).await;

        // Seat 1 queues out of order while seat 0 holds the turn
        let mut late = action(CommandKind::RotateTank, 2, 0, 7);
        late.sender = 1;
        send(&fixture, 1, late).await;
        let mut early = action(CommandKind::RotateBarrel, 2, 0, 5);
        early.sender = 1;
        send(&fixture, 1, early).await;

        assert_eq!(
            fixture.active.with_state(|state| state.queue_len(1)).await,
            2
        );

        // Seat 0 spends its fuel, then seat 1's queue drains in order
        send(&fixture, 0, action(CommandKind::Move, 0, 0, 1)).await;
        send(&fixture, 0, action(CommandKind::Move, 0, 0, 2)).await;
        send(&fixture, 0, action(CommandKind::Move, 0, 0, 3)).await;

        let history = fixture
            .active
            .with_state(|state| state.result.move_history.clone())
            .await;
        let tail: Vec<CommandKind> = history
            .iter()
            .rev()
            .take(2)
            .map(|head| head.kind)
            .collect();
        // Reversed tail: the rotate-barrel (seq 5) applied before the
        // rotate-tank (seq 7)
        assert_eq!(tail, vec![CommandKind::RotateTank, CommandKind::RotateBarrel]);

        let cursor = fixture.active.with_state(|state| state.cursor()).await;
        assert_eq!(cursor, (1, TURN_FUEL - 2));
    }

    #[tokio::test]
    async fn command_posted_against_stale_turn_rejected() {
        let mut fixture =
            start_match(test_maps::open_two_player(GameMode::ClassicTwoPlayer), 60_000).await;

        let stale_turn = fixture.active.turn_counter.load(Ordering::Acquire) - 1;
        let (session, _, user_id) = &fixture.players[0];
        fixture
            .active
            .receive_command_at(*user_id, session.id(), place(0, 2, 0, 0, 1), stale_turn)
            .await;

        let kinds = drain(&mut fixture.players[0].1);
        assert!(kinds.contains(&FrameKind::StaleMove));

        // Nothing was enqueued or applied
        assert_eq!(
            fixture.active.with_state(|state| state.queue_len(0)).await,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clock_expiry_eliminates_the_current_player() {
        let mut fixture =
            start_match(test_maps::open_two_player(GameMode::ClassicTwoPlayer), 50).await;
        complete_setup(&fixture).await;

        // Nobody moves; seat 0's clock (50 ms plus two placement
        // increments) runs out
        tokio::time::sleep(Duration::from_secs(3)).await;

        let kinds = drain(&mut fixture.players[0].1);
        assert!(kinds.contains(&FrameKind::TimedOut));

        let kinds = drain(&mut fixture.players[1].1);
        assert!(kinds.contains(&FrameKind::Victory));

        let result = fixture.result.lock().clone().expect("match concluded");
        assert_eq!(result.elimination_order, vec![0, 1]);

        let phase = fixture.active.with_state(|state| state.phase()).await;
        assert_eq!(phase, GamePhase::Concluded);
    }

    #[tokio::test]
    async fn forfeit_concedes_and_concludes() {
        let mut fixture =
            start_match(test_maps::open_two_player(GameMode::ClassicTwoPlayer), 60_000).await;
        complete_setup(&fixture).await;

        let (session, _, user_id) = &fixture.players[1];
        fixture.active.forfeit(*user_id, session.id()).await;

        assert!(drain(&mut fixture.players[1].1).contains(&FrameKind::ForfeitMatch));
        assert!(drain(&mut fixture.players[0].1).contains(&FrameKind::Victory));

        let result = fixture.result.lock().clone().expect("match concluded");
        assert_eq!(result.elimination_order, vec![1, 0]);

        // The match answers GameEnded from now on
        send(&fixture, 0, action(CommandKind::Move, 0, 0, 9)).await;
        assert!(drain(&mut fixture.players[0].1).contains(&FrameKind::GameEnded));
    }

    #[tokio::test]
    async fn destroying_the_last_tank_implicitly_eliminates() {
        let mut fixture = start_match(duel_map(), 60_000).await;

        // Adjacent single tanks: seat 0 at (0,0) aiming east, seat 1
        // at (1,0)
        send(&fixture, 0, place(0, 2, 0, 0, 1)).await;
        send(&fixture, 1, place(1, 6, 1, 0, 1)).await;

        // Fire, reload, fire: two damage
        send(&fixture, 0, action(CommandKind::Fire, 0, 0, 2)).await;
        send(&fixture, 0, action(CommandKind::Load, 0, 0, 3)).await;
        send(&fixture, 0, action(CommandKind::Fire, 0, 0, 4)).await;

        // Seat 1 waits out its turn rotating
        let mut spin = action(CommandKind::RotateBarrel, 1, 0, 2);
        spin.sender = 1;
        for seq in 2..5 {
            let mut command = spin;
            command.sequence_number = seq;
            send(&fixture, 1, command).await;
        }

        // The killing shot
        send(&fixture, 0, action(CommandKind::Load, 0, 0, 5)).await;
        send(&fixture, 0, action(CommandKind::Fire, 0, 0, 6)).await;

        assert!(drain(&mut fixture.players[1].1).contains(&FrameKind::Eliminated));
        assert!(drain(&mut fixture.players[0].1).contains(&FrameKind::Victory));

        let result = fixture.result.lock().clone().expect("match concluded");
        assert_eq!(result.elimination_order, vec![1, 0]);
    }

    #[tokio::test]
    async fn reconnect_sync_rebinds_and_drops_queued_intent() {
        let mut fixture =
            start_match(test_maps::open_two_player(GameMode::ClassicTwoPlayer), 60_000).await;
        complete_setup(&fixture).await;

        // Seat 1 queues a command on the old socket
        let mut queued = action(CommandKind::RotateTank, 2, 0, 4);
        queued.sender = 1;
        send(&fixture, 1, queued).await;
        assert_eq!(
            fixture.active.with_state(|state| state.queue_len(1)).await,
            1
        );

        // Reconnect on a fresh session
        let (new_session, mut new_rx) = detached(99);
        fixture.sessions.insert(new_session.clone());
        let user_id = fixture.players[1].2;
        fixture.active.sync_player(new_session.id(), user_id).await;

        let kinds = drain(&mut new_rx);
        assert_eq!(
            kinds,
            vec![FrameKind::StaticMatchData, FrameKind::PlayerView]
        );
        assert_eq!(
            fixture.active.with_state(|state| state.queue_len(1)).await,
            0
        );

        // Unknown users are told the game is over for them
        let (stranger, mut stranger_rx) = detached(100);
        fixture.sessions.insert(stranger.clone());
        fixture
            .active
            .sync_player(stranger.id(), Uuid::new_v4())
            .await;
        assert!(drain(&mut stranger_rx).contains(&FrameKind::GameEnded));
    }

    #[tokio::test]
    async fn clocks_gain_increment_on_valid_moves() {
        let fixture =
            start_match(test_maps::open_two_player(GameMode::ClassicTwoPlayer), 60_000).await;
        complete_setup(&fixture).await;

        let (before, idle_before) = fixture
            .active
            .with_state(|state| (state.clock_of(0), state.clock_of(1)))
            .await;
        send(&fixture, 0, action(CommandKind::Move, 0, 0, 3)).await;
        let (after, idle_after) = fixture
            .active
            .with_state(|state| (state.clock_of(0), state.clock_of(1)))
            .await;

        // A near-instant decision nets most of the increment
        assert!(after > before);
        assert!(after <= before + Duration::from_millis(1_000));

        // The idle opponent's clock is untouched
        assert_eq!(idle_before, idle_after);
    }

    #[tokio::test]
    async fn eliminated_player_is_dead_to_the_match() {
        let mut fixture =
            start_match(test_maps::open_two_player(GameMode::ClassicTwoPlayer), 60_000).await;

        // Forfeit during setup: pending placements stop counting
        let (session, _, user_id) = &fixture.players[0];
        fixture.active.forfeit(*user_id, session.id()).await;

        assert!(!fixture.active.with_state(|state| state.is_alive(0)).await);
        assert!(drain(&mut fixture.players[1].1).contains(&FrameKind::Victory));
    }
}
