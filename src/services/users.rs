//! Registry coupling live sessions to persistent user identities and
//! to each user's active match.
//!
//! Users are held while referenced: a User with neither a live session
//! nor a live match is evicted.

use std::collections::{HashMap, HashSet};
use std::sync::Weak;

use log::debug;
use parking_lot::Mutex;

use crate::game::GameMode;
use crate::services::game::{Match, MatchRef};
use crate::services::store::{AuthSuccess, UserData};
use crate::session::packet::{Frame, FrameKind};
use crate::session::models::social::TextMessage;
use crate::session::SessionRef;
use crate::utils::types::{SessionId, UserId};

/// Registry entry: identity data, the current session (strong) and a
/// back-reference to the current match (weak, the matchmaker holds the
/// strong side).
struct User {
    data: UserData,
    session: Option<SessionRef>,
    current_match: Weak<Match>,
    friends: HashSet<UserId>,
    blocks: HashSet<UserId>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    /// Reverse lookup for disconnects
    sessions: HashMap<SessionId, UserId>,
}

#[derive(Default)]
pub struct UserRegistry {
    inner: Mutex<Inner>,
}

impl UserRegistry {
    pub fn new() -> UserRegistry {
        UserRegistry::default()
    }

    /// Binds a freshly authenticated session to its user, replacing
    /// (and closing) any previous session. When the user still has a
    /// live match the new session is resynced into it.
    pub async fn on_login(&self, auth: AuthSuccess, session: &SessionRef) {
        let user_id = auth.data.user_id;

        let (old_session, resync) = {
            let mut inner = self.inner.lock();

            let user = inner.users.entry(user_id).or_insert_with(|| User {
                data: auth.data.clone(),
                session: None,
                current_match: Weak::new(),
                friends: HashSet::new(),
                blocks: HashSet::new(),
            });

            user.data = auth.data.clone();
            user.friends = auth.friends;
            user.blocks = auth.blocks;

            let old_session = user.session.replace(session.clone());
            let resync = user.current_match.upgrade();

            inner.sessions.insert(session.id(), user_id);

            (old_session, resync)
        };

        if let Some(old) = old_session {
            if old.id() != session.id() {
                debug!(
                    "Replacing session {} with {} for {}",
                    old.id(),
                    session.id(),
                    auth.data.username
                );
                old.close_session();
            }
        }

        session.set_data(auth.data);

        if let Some(active) = resync {
            session.deliver(Frame::empty(FrameKind::MatchInProgress));
            active.sync_player(session.id(), user_id).await;
        }
    }

    /// Unbinds a disconnecting session. A no-op when a newer login has
    /// already replaced it. Users with no remaining match are evicted.
    pub fn disconnect(&self, session: &SessionRef) {
        let mut inner = self.inner.lock();

        let Some(user_id) = inner.sessions.remove(&session.id()) else {
            return;
        };
        let Some(user) = inner.users.get_mut(&user_id) else {
            return;
        };

        match &user.session {
            Some(current) if current.id() == session.id() => {}
            _ => return,
        }

        user.session = None;

        if user.current_match.upgrade().is_none() {
            inner.users.remove(&user_id);
        }
    }

    pub fn notify_match_start(&self, user_id: UserId, active: &MatchRef) {
        if let Some(user) = self.inner.lock().users.get_mut(&user_id) {
            user.current_match = std::sync::Arc::downgrade(active);
        }
    }

    /// Clears the match back-reference; evicts the user when no
    /// session remains (they may have logged out mid-match).
    pub fn notify_match_finished(&self, user_id: UserId) {
        let mut inner = self.inner.lock();
        let Some(user) = inner.users.get_mut(&user_id) else {
            return;
        };

        user.current_match = Weak::new();

        let gone = match &user.session {
            Some(session) => !session.is_live(),
            None => true,
        };
        if gone {
            inner.users.remove(&user_id);
        }
    }

    pub fn session_of(&self, user_id: UserId) -> Option<SessionRef> {
        self.inner.lock().users.get(&user_id)?.session.clone()
    }

    pub fn user_data(&self, user_id: UserId) -> Option<UserData> {
        Some(self.inner.lock().users.get(&user_id)?.data.clone())
    }

    /// Delivers a frame to a user's current session, if any.
    pub fn deliver_to_user(&self, user_id: UserId, frame: Frame) {
        if let Some(session) = self.session_of(user_id) {
            session.deliver(frame);
        }
    }

    /// Routes a direct message, honouring blocks in both directions.
    /// An offline recipient is reported back with FriendOffline.
    pub fn direct_message(&self, sender: &UserData, message: TextMessage, origin: &SessionRef) {
        let recipient_id = message.user_id;

        let (blocked, recipient_session) = {
            let inner = self.inner.lock();

            let sender_blocks = inner
                .users
                .get(&sender.user_id)
                .map_or(false, |user| user.blocks.contains(&recipient_id));
            let recipient = inner.users.get(&recipient_id);
            let recipient_blocks =
                recipient.map_or(false, |user| user.blocks.contains(&sender.user_id));

            (
                sender_blocks || recipient_blocks,
                recipient.and_then(|user| user.session.clone()),
            )
        };

        if blocked {
            return;
        }

        match recipient_session {
            Some(session) if session.is_live() => {
                let outbound = TextMessage {
                    user_id: sender.user_id,
                    text: message.text,
                };
                session.deliver(outbound.encode(FrameKind::DirectTextMessage));
            }
            _ => {
                let offline = crate::session::models::social::encode_uuid_payload(
                    FrameKind::FriendOffline,
                    &recipient_id,
                );
                origin.deliver(offline);
            }
        }
    }

    /// Marks fresh history for every participant of a recorded match.
    pub fn flag_new_matches(&self, user_ids: &[UserId], mode: GameMode) {
        let inner = self.inner.lock();
        for user_id in user_ids {
            if let Some(user) = inner.users.get(user_id) {
                if let Some(session) = &user.session {
                    session.set_has_matches(true, mode);
                }
            }
        }
    }

    /// Applies a recorded rating change to the cached identity.
    pub fn update_elo(&self, user_id: UserId, ranked_index: usize, new_elo: i32) {
        let mut inner = self.inner.lock();
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.data.elos[ranked_index] = new_elo;
            if let Some(session) = &user.session {
                session.update_elo(ranked_index, new_elo);
            }
        }
    }

    /// Closes any live session of a banned user.
    pub fn evict_user(&self, user_id: UserId, frame: Frame) {
        if let Some(session) = self.session_of(user_id) {
            session.deliver(frame);
            session.close_session();
        }
    }

    // Relation cache maintenance, mirroring the store after social
    // operations succeed

    pub fn cache_friend_added(&self, a: UserId, b: UserId) {
        let mut inner = self.inner.lock();
        if let Some(user) = inner.users.get_mut(&a) {
            user.friends.insert(b);
        }
        if let Some(user) = inner.users.get_mut(&b) {
            user.friends.insert(a);
        }
    }

    pub fn cache_friend_removed(&self, a: UserId, b: UserId) {
        let mut inner = self.inner.lock();
        if let Some(user) = inner.users.get_mut(&a) {
            user.friends.remove(&b);
        }
        if let Some(user) = inner.users.get_mut(&b) {
            user.friends.remove(&a);
        }
    }

    pub fn cache_block_added(&self, user_id: UserId, target: UserId) {
        let mut inner = self.inner.lock();
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.blocks.insert(target);
            user.friends.remove(&target);
        }
        if let Some(other) = inner.users.get_mut(&target) {
            other.friends.remove(&user_id);
        }
    }

    pub fn cache_block_removed(&self, user_id: UserId, target: UserId) {
        let mut inner = self.inner.lock();
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.blocks.remove(&target);
        }
    }

    #[cfg(test)]
    pub(crate) fn user_count(&self) -> usize {
        self.inner.lock().users.len()
    }
}

#[cfg(test)]
mod test {
    use super::UserRegistry;
    use crate::services::store::{AuthSuccess, UserData};
    use crate::session::test_support::detached;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn auth(user_id: Uuid, name: &str) -> AuthSuccess {
        AuthSuccess {
            data: UserData {
                user_id,
                username: name.to_string(),
                elos: [1500],
            },
            friends: HashSet::new(),
            blocks: HashSet::new(),
        }
    }

    #[tokio::test]
    async fn login_binds_session() {
        let registry = UserRegistry::new();
        let (session, _rx) = detached(1);
        let user_id = Uuid::new_v4();

        registry.on_login(auth(user_id, "alice"), &session).await;

        assert!(session.is_authenticated());
        assert_eq!(registry.session_of(user_id).unwrap().id(), 1);
        assert_eq!(registry.user_data(user_id).unwrap().username, "alice");
    }

    #[tokio::test]
    async fn relogin_replaces_and_closes_old_session() {
        let registry = UserRegistry::new();
        let user_id = Uuid::new_v4();

        let (first, _rx1) = detached(1);
        registry.on_login(auth(user_id, "alice"), &first).await;

        let (second, _rx2) = detached(2);
        registry.on_login(auth(user_id, "alice"), &second).await;

        assert!(!first.is_live());
        assert_eq!(registry.session_of(user_id).unwrap().id(), 2);

        // The old session's disconnect must not unbind the new one
        registry.disconnect(&first);
        assert_eq!(registry.session_of(user_id).unwrap().id(), 2);
    }

    #[tokio::test]
    async fn disconnect_evicts_matchless_user() {
        let registry = UserRegistry::new();
        let user_id = Uuid::new_v4();
        let (session, _rx) = detached(1);

        registry.on_login(auth(user_id, "alice"), &session).await;
        assert_eq!(registry.user_count(), 1);

        registry.disconnect(&session);
        assert_eq!(registry.user_count(), 0);
    }

    #[tokio::test]
    async fn blocked_direct_message_dropped() {
        let registry = UserRegistry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (alice_session, _arx) = detached(1);
        let (bob_session, mut brx) = detached(2);

        registry.on_login(auth(alice, "alice"), &alice_session).await;
        let mut bob_auth = auth(bob, "bob");
        bob_auth.blocks.insert(alice);
        registry.on_login(bob_auth, &bob_session).await;

        let message = crate::session::models::social::TextMessage {
            user_id: bob,
            text: b"hi".to_vec(),
        };
        registry.direct_message(
            &registry.user_data(alice).unwrap(),
            message,
            &alice_session,
        );

        assert!(brx.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_recipient_reported() {
        let registry = UserRegistry::new();
        let alice = Uuid::new_v4();
        let (alice_session, mut arx) = detached(1);
        registry.on_login(auth(alice, "alice"), &alice_session).await;

        let message = crate::session::models::social::TextMessage {
            user_id: Uuid::new_v4(),
            text: b"anyone there".to_vec(),
        };
        registry.direct_message(
            &registry.user_data(alice).unwrap(),
            message,
            &alice_session,
        );

        let frame = arx.try_recv().unwrap();
        assert_eq!(frame.kind, crate::session::packet::FrameKind::FriendOffline);
    }
}
