//! Persistent store contract.
//!
//! The store proper (accounts, social graph, bans, match history,
//! replays) lives outside this server; the trait below is the contract
//! the core consumes. `MemoryStore` is the reference implementation
//! backing the standalone server and the tests.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::game::maps::MapDescriptor;
use crate::game::{GameMode, RANKED_MODES_COUNT};
use crate::session::models::auth::{AuthFailure, LoginRequest, RegistrationFailure};
use crate::session::models::history::{MatchReplay, MatchResultRow};
use crate::session::models::social::ExternalUser;
use crate::session::models::valid_username_bytes;
use crate::utils::elo::DEFAULT_ELO;
use crate::utils::hashing::{self, HASH_LENGTH, SALT_LENGTH};
use crate::utils::types::{MatchId, UserId};

/// Cached account identity attached to an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserData {
    pub user_id: UserId,
    pub username: String,
    /// Rating per ranked mode
    pub elos: [i32; RANKED_MODES_COUNT],
}

/// Everything a successful authentication hands back to the server.
#[derive(Debug, Clone)]
pub struct AuthSuccess {
    pub data: UserData,
    pub friends: HashSet<UserId>,
    pub blocks: HashSet<UserId>,
}

/// One ban registry entry.
#[derive(Debug, Clone)]
pub struct BanEntry {
    pub until: DateTime<Utc>,
    pub reason: String,
}

/// A finished match as handed to the store, including the rating
/// changes computed at conclusion time.
#[derive(Debug, Clone)]
pub struct MatchRecord {
    pub match_id: MatchId,
    pub mode: GameMode,
    pub finished_at: DateTime<Utc>,
    pub descriptor: MapDescriptor,
    pub initial_time_ms: u64,
    pub increment_ms: u64,
    /// Indexed by player id
    pub user_ids: Vec<UserId>,
    /// Indexed by player id, 0 = first eliminated
    pub elimination_order: Vec<u8>,
    pub move_history: Vec<crate::session::models::game::CommandHead>,
    /// Indexed by player id; zeroes for casual modes
    pub elo_changes: Vec<i32>,
    /// Indexed by player id; new ratings after the change
    pub new_elos: Vec<i32>,
}

/// Contract the core consumes; implementations resolve against the
/// actual persistence backend.
pub trait Store: Send + Sync {
    fn authenticate(
        &self,
        request: LoginRequest,
        client_ip: IpAddr,
    ) -> BoxFuture<'_, Result<AuthSuccess, AuthFailure>>;

    fn register_account(
        &self,
        request: LoginRequest,
        client_ip: IpAddr,
    ) -> BoxFuture<'_, Result<(), RegistrationFailure>>;

    fn record_match(&self, record: MatchRecord) -> BoxFuture<'_, ()>;

    fn load_bans(&self) -> BoxFuture<'_, HashMap<IpAddr, BanEntry>>;
    fn ban_ip(&self, ip: IpAddr, until: DateTime<Utc>) -> BoxFuture<'_, ()>;
    fn unban_ip(&self, ip: IpAddr) -> BoxFuture<'_, ()>;
    /// Returns the banned account's id so live sessions can be evicted
    fn ban_user(
        &self,
        username: String,
        until: DateTime<Utc>,
        reason: String,
    ) -> BoxFuture<'_, Option<UserId>>;
    fn unban_user(&self, username: String) -> BoxFuture<'_, Option<UserId>>;

    fn fetch_friends(&self, user: UserId) -> BoxFuture<'_, Vec<ExternalUser>>;
    fn fetch_friend_requests(&self, user: UserId) -> BoxFuture<'_, Vec<ExternalUser>>;
    fn fetch_blocks(&self, user: UserId) -> BoxFuture<'_, Vec<ExternalUser>>;

    /// Registers a pending request, returning the target for
    /// notification delivery when one was recorded.
    fn send_friend_request(
        &self,
        from: UserId,
        to_username: String,
    ) -> BoxFuture<'_, Option<ExternalUser>>;
    /// Resolves a pending request. Returns the requester when a
    /// request existed.
    fn respond_friend_request(
        &self,
        user: UserId,
        other: UserId,
        accept: bool,
    ) -> BoxFuture<'_, Option<ExternalUser>>;
    fn remove_friend(&self, user: UserId, other: UserId) -> BoxFuture<'_, Option<ExternalUser>>;
    fn block_user(&self, user: UserId, username: String) -> BoxFuture<'_, Option<ExternalUser>>;
    fn unblock_user(&self, user: UserId, other: UserId) -> BoxFuture<'_, Option<ExternalUser>>;

    fn fetch_match_history(
        &self,
        user: UserId,
        mode: GameMode,
    ) -> BoxFuture<'_, Vec<MatchResultRow>>;
    fn fetch_replay(&self, match_id: MatchId) -> BoxFuture<'_, Option<MatchReplay>>;
}

#[derive(Debug, Clone)]
struct Account {
    data: UserData,
    salt: [u8; SALT_LENGTH],
    stored_hash: [u8; HASH_LENGTH],
    friends: HashSet<UserId>,
    /// Pending inbound friend requests
    requests: HashSet<UserId>,
    blocks: HashSet<UserId>,
    history: Vec<(GameMode, MatchResultRow)>,
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<UserId, Account>,
    by_name: HashMap<String, UserId>,
    bans: HashMap<IpAddr, BanEntry>,
    replays: HashMap<MatchId, MatchReplay>,
}

/// In-memory store used by the standalone server and the tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Creates an account directly from a plain password, deriving the
    /// wire hash exactly the way a client would. Startup seeding only.
    pub fn seed_account(&self, username: &str, password: &str) -> Option<UserId> {
        let wire_hash = hashing::client_hash(password).ok()?;
        self.insert_account(username, &wire_hash).ok()
    }

    fn insert_account(
        &self,
        username: &str,
        wire_hash: &[u8; HASH_LENGTH],
    ) -> Result<UserId, RegistrationFailure> {
        Self::insert_account_inner(&self.state, username, wire_hash)
    }

    fn insert_account_inner(
        state: &Arc<Mutex<MemoryState>>,
        username: &str,
        wire_hash: &[u8; HASH_LENGTH],
    ) -> Result<UserId, RegistrationFailure> {
        if !valid_username_bytes(username.as_bytes()) {
            return Err(RegistrationFailure::InvalidUsername);
        }

        let salt = hashing::generate_salt();
        let stored_hash =
            hashing::derive(wire_hash, &salt).map_err(|_| RegistrationFailure::ServerError)?;

        let mut state = state.lock();
        if state.by_name.contains_key(username) {
            return Err(RegistrationFailure::NotUnique);
        }

        let user_id = Uuid::new_v4();
        state.by_name.insert(username.to_string(), user_id);
        state.accounts.insert(
            user_id,
            Account {
                data: UserData {
                    user_id,
                    username: username.to_string(),
                    elos: [DEFAULT_ELO; RANKED_MODES_COUNT],
                },
                salt,
                stored_hash,
                friends: HashSet::new(),
                requests: HashSet::new(),
                blocks: HashSet::new(),
                history: Vec::new(),
            },
        );

        Ok(user_id)
    }

    fn external(account: &Account) -> ExternalUser {
        ExternalUser {
            user_id: account.data.user_id,
            username: account.data.username.clone(),
        }
    }
}

impl Store for MemoryStore {
    fn authenticate(
        &self,
        request: LoginRequest,
        _client_ip: IpAddr,
    ) -> BoxFuture<'_, Result<AuthSuccess, AuthFailure>> {
        let state = self.state.clone();
        async move {
            // The KDF is deliberately expensive; keep it off the
            // runtime workers
            let outcome = tokio::task::spawn_blocking(move || {
                let (salt, stored, success) = {
                    let state = state.lock();
                    let Some(user_id) = state.by_name.get(&request.username) else {
                        return Err(AuthFailure::BadCredentials);
                    };
                    let account = &state.accounts[user_id];
                    (
                        account.salt,
                        account.stored_hash,
                        AuthSuccess {
                            data: account.data.clone(),
                            friends: account.friends.clone(),
                            blocks: account.blocks.clone(),
                        },
                    )
                };

                if hashing::verify(&request.hash, &salt, &stored) {
                    Ok(success)
                } else {
                    Err(AuthFailure::BadCredentials)
                }
            })
            .await;

            match outcome {
                Ok(result) => result,
                Err(_) => Err(AuthFailure::ServerError),
            }
        }
        .boxed()
    }

    fn register_account(
        &self,
        request: LoginRequest,
        _client_ip: IpAddr,
    ) -> BoxFuture<'_, Result<(), RegistrationFailure>> {
        let state = self.state.clone();
        async move {
            // Account creation runs the KDF too; keep it off the
            // runtime workers
            let outcome = tokio::task::spawn_blocking(move || {
                MemoryStore::insert_account_inner(&state, &request.username, &request.hash)
            })
            .await;

            match outcome {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(RegistrationFailure::ServerError),
            }
        }
        .boxed()
    }

    fn record_match(&self, record: MatchRecord) -> BoxFuture<'_, ()> {
        async move {
            let mut state = self.state.lock();

            let replay = MatchReplay {
                match_id: record.match_id,
                initial_time_ms: record.initial_time_ms,
                increment_ms: record.increment_ms,
                descriptor: record.descriptor.clone(),
                players: record
                    .user_ids
                    .iter()
                    .map(|user_id| {
                        state
                            .accounts
                            .get(user_id)
                            .map(MemoryStore::external)
                            .unwrap_or_else(|| ExternalUser {
                                user_id: *user_id,
                                username: String::new(),
                            })
                    })
                    .collect(),
                moves: record.move_history.clone(),
            };
            state.replays.insert(record.match_id, replay);

            for (player, user_id) in record.user_ids.iter().enumerate() {
                let row = MatchResultRow {
                    match_id: record.match_id as i64,
                    finished_at: record.finished_at,
                    placement: u16::from(record.elimination_order[player]),
                    elo_change: record.elo_changes.get(player).copied().unwrap_or(0),
                };

                if let Some(account) = state.accounts.get_mut(user_id) {
                    account.history.push((record.mode, row));

                    // The rating write-back shares the record call so
                    // results and ratings land together
                    if let (Some(index), Some(new_elo)) = (
                        record.mode.ranked_index(),
                        record.new_elos.get(player),
                    ) {
                        account.data.elos[index] = *new_elo;
                    }
                }
            }
        }
        .boxed()
    }

    fn load_bans(&self) -> BoxFuture<'_, HashMap<IpAddr, BanEntry>> {
        async move { self.state.lock().bans.clone() }.boxed()
    }

    fn ban_ip(&self, ip: IpAddr, until: DateTime<Utc>) -> BoxFuture<'_, ()> {
        async move {
            self.state.lock().bans.insert(
                ip,
                BanEntry {
                    until,
                    reason: String::new(),
                },
            );
        }
        .boxed()
    }

    fn unban_ip(&self, ip: IpAddr) -> BoxFuture<'_, ()> {
        async move {
            self.state.lock().bans.remove(&ip);
        }
        .boxed()
    }

    fn ban_user(
        &self,
        username: String,
        until: DateTime<Utc>,
        reason: String,
    ) -> BoxFuture<'_, Option<UserId>> {
        async move {
            let state = self.state.lock();
            let user_id = state.by_name.get(&username).copied();
            // The ban itself is user-keyed in the real store; here the
            // id is simply handed back for session eviction
            let _ = (until, reason);
            user_id
        }
        .boxed()
    }

    fn unban_user(&self, username: String) -> BoxFuture<'_, Option<UserId>> {
        async move { self.state.lock().by_name.get(&username).copied() }.boxed()
    }

    fn fetch_friends(&self, user: UserId) -> BoxFuture<'_, Vec<ExternalUser>> {
        async move {
            let state = self.state.lock();
            let Some(account) = state.accounts.get(&user) else {
                return Vec::new();
            };
            account
                .friends
                .iter()
                .filter_map(|id| state.accounts.get(id).map(MemoryStore::external))
                .collect()
        }
        .boxed()
    }

    fn fetch_friend_requests(&self, user: UserId) -> BoxFuture<'_, Vec<ExternalUser>> {
        async move {
            let state = self.state.lock();
            let Some(account) = state.accounts.get(&user) else {
                return Vec::new();
            };
            account
                .requests
                .iter()
                .filter_map(|id| state.accounts.get(id).map(MemoryStore::external))
                .collect()
        }
        .boxed()
    }

    fn fetch_blocks(&self, user: UserId) -> BoxFuture<'_, Vec<ExternalUser>> {
        async move {
            let state = self.state.lock();
            let Some(account) = state.accounts.get(&user) else {
                return Vec::new();
            };
            account
                .blocks
                .iter()
                .filter_map(|id| state.accounts.get(id).map(MemoryStore::external))
                .collect()
        }
        .boxed()
    }

    fn send_friend_request(
        &self,
        from: UserId,
        to_username: String,
    ) -> BoxFuture<'_, Option<ExternalUser>> {
        async move {
            let mut state = self.state.lock();
            let target_id = *state.by_name.get(&to_username)?;
            if target_id == from {
                return None;
            }

            let sender_blocks = state.accounts.get(&from)?.blocks.contains(&target_id);
            let target = state.accounts.get(&target_id)?;
            if sender_blocks
                || target.blocks.contains(&from)
                || target.friends.contains(&from)
            {
                return None;
            }

            let external = MemoryStore::external(target);
            state
                .accounts
                .get_mut(&target_id)
                .expect("target account present")
                .requests
                .insert(from);
            Some(external)
        }
        .boxed()
    }

    fn respond_friend_request(
        &self,
        user: UserId,
        other: UserId,
        accept: bool,
    ) -> BoxFuture<'_, Option<ExternalUser>> {
        async move {
            let mut state = self.state.lock();
            if !state.accounts.get_mut(&user)?.requests.remove(&other) {
                return None;
            }

            if accept {
                state.accounts.get_mut(&user)?.friends.insert(other);
                state.accounts.get_mut(&other)?.friends.insert(user);
            }

            state.accounts.get(&other).map(MemoryStore::external)
        }
        .boxed()
    }

    fn remove_friend(&self, user: UserId, other: UserId) -> BoxFuture<'_, Option<ExternalUser>> {
        async move {
            let mut state = self.state.lock();
            if !state.accounts.get_mut(&user)?.friends.remove(&other) {
                return None;
            }
            if let Some(account) = state.accounts.get_mut(&other) {
                account.friends.remove(&user);
            }
            state.accounts.get(&other).map(MemoryStore::external)
        }
        .boxed()
    }

    fn block_user(&self, user: UserId, username: String) -> BoxFuture<'_, Option<ExternalUser>> {
        async move {
            let mut state = self.state.lock();
            let target_id = *state.by_name.get(&username)?;
            if target_id == user {
                return None;
            }

            // Blocking severs any existing relation in both directions
            {
                let account = state.accounts.get_mut(&user)?;
                account.blocks.insert(target_id);
                account.friends.remove(&target_id);
                account.requests.remove(&target_id);
            }
            if let Some(target) = state.accounts.get_mut(&target_id) {
                target.friends.remove(&user);
                target.requests.remove(&user);
            }

            state.accounts.get(&target_id).map(MemoryStore::external)
        }
        .boxed()
    }

    fn unblock_user(&self, user: UserId, other: UserId) -> BoxFuture<'_, Option<ExternalUser>> {
        async move {
            let mut state = self.state.lock();
            if !state.accounts.get_mut(&user)?.blocks.remove(&other) {
                return None;
            }
            state.accounts.get(&other).map(MemoryStore::external)
        }
        .boxed()
    }

    fn fetch_match_history(
        &self,
        user: UserId,
        mode: GameMode,
    ) -> BoxFuture<'_, Vec<MatchResultRow>> {
        async move {
            let state = self.state.lock();
            let Some(account) = state.accounts.get(&user) else {
                return Vec::new();
            };
            account
                .history
                .iter()
                .filter(|(row_mode, _)| *row_mode == mode)
                .map(|(_, row)| *row)
                .collect()
        }
        .boxed()
    }

    fn fetch_replay(&self, match_id: MatchId) -> BoxFuture<'_, Option<MatchReplay>> {
        async move { self.state.lock().replays.get(&match_id).cloned() }.boxed()
    }
}

#[cfg(test)]
mod test {
    use super::{MemoryStore, Store};
    use crate::session::models::auth::{AuthFailure, LoginRequest, RegistrationFailure};
    use crate::utils::hashing::client_hash;
    use std::net::{IpAddr, Ipv4Addr};

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn login(username: &str, password: &str) -> LoginRequest {
        LoginRequest {
            hash: client_hash(password).unwrap(),
            username: username.to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_then_authenticate() {
        let store = MemoryStore::new();
        store
            .register_account(login("alice", "hunter2"), localhost())
            .await
            .unwrap();

        let success = store
            .authenticate(login("alice", "hunter2"), localhost())
            .await
            .unwrap();
        assert_eq!(success.data.username, "alice");

        let failure = store
            .authenticate(login("alice", "wrong"), localhost())
            .await
            .unwrap_err();
        assert_eq!(failure, AuthFailure::BadCredentials);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_registration_rejected() {
        let store = MemoryStore::new();
        store
            .register_account(login("bob", "pw"), localhost())
            .await
            .unwrap();
        let err = store
            .register_account(login("bob", "pw2"), localhost())
            .await
            .unwrap_err();
        assert_eq!(err, RegistrationFailure::NotUnique);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn friend_request_flow() {
        let store = MemoryStore::new();
        let alice = store.seed_account("alice", "pw").unwrap();
        let bob = store.seed_account("bob", "pw").unwrap();

        let target = store
            .send_friend_request(alice, "bob".to_string())
            .await
            .unwrap();
        assert_eq!(target.user_id, bob);

        let requests = store.fetch_friend_requests(bob).await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].user_id, alice);

        let requester = store
            .respond_friend_request(bob, alice, true)
            .await
            .unwrap();
        assert_eq!(requester.user_id, alice);

        assert_eq!(store.fetch_friends(alice).await.len(), 1);
        assert_eq!(store.fetch_friends(bob).await.len(), 1);
        assert!(store.fetch_friend_requests(bob).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn block_severs_relations() {
        let store = MemoryStore::new();
        let alice = store.seed_account("alice", "pw").unwrap();
        let bob = store.seed_account("bob", "pw").unwrap();

        store.send_friend_request(alice, "bob".to_string()).await;
        store.respond_friend_request(bob, alice, true).await;

        store.block_user(alice, "bob".to_string()).await.unwrap();
        assert!(store.fetch_friends(alice).await.is_empty());
        assert!(store.fetch_friends(bob).await.is_empty());
        assert_eq!(store.fetch_blocks(alice).await.len(), 1);

        // A blocked user cannot request again
        assert!(store
            .send_friend_request(bob, "alice".to_string())
            .await
            .is_none());

        store.unblock_user(alice, bob).await.unwrap();
        assert!(store.fetch_blocks(alice).await.is_empty());
    }
}
