//! Matching strategies, one per game mode: casual modes form matches
//! first-come-first-served, the ranked mode pairs by elo bucket with
//! time-based relaxation.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::time::Instant;

use crate::session::SessionRef;
use crate::utils::elo::ELO_FLOOR;
use crate::utils::types::UserId;

/// Elo at or above this lands in the overflow bucket
pub const MAX_ELO_BUCKET: i32 = 3000;
/// Buckets below the overflow bucket
pub const NUM_BUCKETS: usize = 100;
/// Width of one bucket in rating points
pub const BUCKET_SIZE: i32 = (MAX_ELO_BUCKET - ELO_FLOOR) / NUM_BUCKETS as i32;
/// Search radius never exceeds this rating distance
pub const MAX_ELO_DIFF: i32 = 400;
pub const MAX_BUCKETS_DIFF: u64 = (MAX_ELO_DIFF / BUCKET_SIZE) as u64;
/// Waiting this long widens the search by one bucket
pub const BUCKET_INCREMENT_TIME: std::time::Duration = std::time::Duration::from_secs(15);

/// One queued player as strategies see them.
#[derive(Clone)]
pub struct QueuedPlayer {
    pub session: SessionRef,
    pub user_id: UserId,
    pub elo: i32,
}

struct RankedEntry {
    player: QueuedPlayer,
    enqueued_at: Instant,
}

/// A group of players ready to start a match together.
pub type ReadyGroup = Vec<QueuedPlayer>;

/// Capability set every mode implements: enqueue, cancel, tick.
/// Variants over inheritance; the matchmaker never cares which.
pub enum Strategy {
    CasualFifo(CasualFifo),
    RankedBuckets(RankedBuckets),
}

impl Strategy {
    pub fn casual(need: usize) -> Strategy {
        Strategy::CasualFifo(CasualFifo {
            need,
            queue: VecDeque::new(),
            lookup: HashSet::new(),
        })
    }

    pub fn ranked() -> Strategy {
        Strategy::RankedBuckets(RankedBuckets {
            buckets: (0..=NUM_BUCKETS).map(|_| VecDeque::new()).collect(),
            lookup: HashMap::new(),
        })
    }

    /// Idempotent enqueue. Returns any match groups formed right away.
    pub fn enqueue(&mut self, player: QueuedPlayer, now: Instant) -> Vec<ReadyGroup> {
        match self {
            Strategy::CasualFifo(casual) => casual.enqueue(player),
            Strategy::RankedBuckets(ranked) => {
                ranked.enqueue(player, now);
                Vec::new()
            }
        }
    }

    /// Idempotent removal of a queued player.
    pub fn cancel(&mut self, user_id: UserId) {
        match self {
            Strategy::CasualFifo(casual) => casual.cancel(user_id),
            Strategy::RankedBuckets(ranked) => ranked.cancel(user_id),
        }
    }

    /// Periodic pass; ranked matching relaxes its windows here.
    pub fn tick(&mut self, now: Instant) -> Vec<ReadyGroup> {
        match self {
            Strategy::CasualFifo(_) => Vec::new(),
            Strategy::RankedBuckets(ranked) => ranked.try_form_matches(now),
        }
    }
}

/// FIFO deque with a lookup set; forms a match whenever `need` players
/// are waiting.
pub struct CasualFifo {
    need: usize,
    queue: VecDeque<QueuedPlayer>,
    lookup: HashSet<UserId>,
}

impl CasualFifo {
    fn enqueue(&mut self, player: QueuedPlayer) -> Vec<ReadyGroup> {
        if !self.lookup.insert(player.user_id) {
            return Vec::new();
        }
        self.queue.push_back(player);

        let mut groups = Vec::new();
        while self.queue.len() >= self.need {
            let group: ReadyGroup = self.queue.drain(..self.need).collect();
            for member in &group {
                self.lookup.remove(&member.user_id);
            }
            groups.push(group);
        }
        groups
    }

    fn cancel(&mut self, user_id: UserId) {
        if self.lookup.remove(&user_id) {
            self.queue.retain(|player| player.user_id != user_id);
        }
    }
}

/// Bucketed two player matching: the elo range is cut into fixed
/// buckets plus an overflow bucket, pairs form inside a bucket
/// immediately and a lone waiter searches outward one bucket per
/// elapsed increment, preferring lower neighbours.
pub struct RankedBuckets {
    buckets: Vec<VecDeque<RankedEntry>>,
    lookup: HashMap<UserId, usize>,
}

impl RankedBuckets {
    fn bucket_index(elo: i32) -> usize {
        if elo >= MAX_ELO_BUCKET {
            NUM_BUCKETS
        } else if elo < ELO_FLOOR {
            0
        } else {
            ((elo - ELO_FLOOR) / BUCKET_SIZE) as usize
        }
    }

    fn enqueue(&mut self, player: QueuedPlayer, now: Instant) {
        if self.lookup.contains_key(&player.user_id) {
            return;
        }

        let index = Self::bucket_index(player.elo);
        self.lookup.insert(player.user_id, index);
        self.buckets[index].push_back(RankedEntry {
            player,
            enqueued_at: now,
        });
    }

    fn cancel(&mut self, user_id: UserId) {
        if let Some(index) = self.lookup.remove(&user_id) {
            self.buckets[index].retain(|entry| entry.player.user_id != user_id);
        }
    }

    fn take_front(&mut self, bucket: usize) -> QueuedPlayer {
        let entry = self.buckets[bucket]
            .pop_front()
            .expect("bucket checked non-empty");
        self.lookup.remove(&entry.player.user_id);
        entry.player
    }

    /// Highest buckets match first so the strongest waiting players
    /// get the first pick of opponents.
    fn try_form_matches(&mut self, now: Instant) -> Vec<ReadyGroup> {
        let mut groups = Vec::new();

        for index in (0..self.buckets.len()).rev() {
            // In-bucket pairs match without waiting
            while self.buckets[index].len() >= 2 {
                let first = self.take_front(index);
                let second = self.take_front(index);
                groups.push(vec![first, second]);
            }

            let Some(oldest) = self.buckets[index].front() else {
                continue;
            };

            // The window grows with the oldest entry's waiting time,
            // so a fresh joiner may match someone further out than
            // their own wait would allow
            let waited = now.saturating_duration_since(oldest.enqueued_at);
            let delta = (waited.as_secs() / BUCKET_INCREMENT_TIME.as_secs())
                .min(MAX_BUCKETS_DIFF) as usize;
            if delta == 0 {
                continue;
            }

            for radius in 1..=delta {
                let lower = index.checked_sub(radius);
                if let Some(lower) = lower {
                    if !self.buckets[lower].is_empty() {
                        let lonely = self.take_front(index);
                        let partner = self.take_front(lower);
                        groups.push(vec![lonely, partner]);
                        break;
                    }
                }

                let upper = index + radius;
                if upper <= NUM_BUCKETS && !self.buckets[upper].is_empty() {
                    let lonely = self.take_front(index);
                    let partner = self.take_front(upper);
                    groups.push(vec![lonely, partner]);
                    break;
                }
            }
        }

        groups
    }
}

#[cfg(test)]
mod test {
    use super::{
        QueuedPlayer, RankedBuckets, Strategy, BUCKET_INCREMENT_TIME, MAX_BUCKETS_DIFF,
        NUM_BUCKETS,
    };
    use crate::session::test_support::detached;
    use crate::utils::types::UserId;
    use tokio::time::Instant;
    use uuid::Uuid;

    fn player(id: u64, elo: i32) -> (QueuedPlayer, UserId) {
        let (session, _rx) = detached(id);
        std::mem::forget(_rx);
        let user_id = Uuid::new_v4();
        (
            QueuedPlayer {
                session,
                user_id,
                elo,
            },
            user_id,
        )
    }

    #[tokio::test]
    async fn casual_forms_groups_in_order() {
        let mut strategy = Strategy::casual(3);
        let now = Instant::now();

        let (first, first_id) = player(1, 0);
        let (second, _) = player(2, 0);
        let (third, _) = player(3, 0);

        assert!(strategy.enqueue(first.clone(), now).is_empty());
        // Re-enqueueing the same user is a no-op
        assert!(strategy.enqueue(first, now).is_empty());
        assert!(strategy.enqueue(second, now).is_empty());

        let groups = strategy.enqueue(third, now);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[0][0].user_id, first_id);
    }

    #[tokio::test]
    async fn casual_cancel_removes_from_queue() {
        let mut strategy = Strategy::casual(2);
        let now = Instant::now();

        let (first, first_id) = player(1, 0);
        let (second, second_id) = player(2, 0);

        strategy.enqueue(first, now);
        strategy.cancel(first_id);

        let groups = strategy.enqueue(second, now);
        assert!(groups.is_empty());
        // The cancelled player must not appear in a later group
        let (third, _) = player(3, 0);
        let groups = strategy.enqueue(third, now);
        assert_eq!(groups.len(), 1);
        assert!(groups[0].iter().all(|member| member.user_id != first_id));
        assert!(groups[0].iter().any(|member| member.user_id == second_id));
    }

    #[test]
    fn bucket_indexing() {
        assert_eq!(RankedBuckets::bucket_index(499), 0);
        assert_eq!(RankedBuckets::bucket_index(500), 0);
        assert_eq!(RankedBuckets::bucket_index(524), 0);
        assert_eq!(RankedBuckets::bucket_index(525), 1);
        assert_eq!(RankedBuckets::bucket_index(2999), NUM_BUCKETS - 1);
        assert_eq!(RankedBuckets::bucket_index(3000), NUM_BUCKETS);
        assert_eq!(RankedBuckets::bucket_index(9000), NUM_BUCKETS);
    }

    #[tokio::test]
    async fn ranked_pairs_within_bucket_immediately() {
        let mut strategy = Strategy::ranked();
        let now = Instant::now();

        let (first, _) = player(1, 1500);
        let (second, _) = player(2, 1510);
        strategy.enqueue(first, now);
        strategy.enqueue(second, now);

        let groups = strategy.tick(now);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[tokio::test]
    async fn ranked_relaxes_over_time() {
        let mut strategy = Strategy::ranked();
        let start = Instant::now();

        // Two buckets apart: 1500 -> bucket 40, 1560 -> bucket 42
        let (first, _) = player(1, 1500);
        let (second, _) = player(2, 1560);
        strategy.enqueue(first, start);
        strategy.enqueue(second, start);

        // Not enough waiting time: no match
        assert!(strategy.tick(start).is_empty());
        assert!(strategy
            .tick(start + BUCKET_INCREMENT_TIME)
            .is_empty());

        // After two increments the window spans the gap
        let groups = strategy.tick(start + 2 * BUCKET_INCREMENT_TIME);
        assert_eq!(groups.len(), 1);
    }

    #[tokio::test]
    async fn ranked_window_is_capped() {
        let mut strategy = Strategy::ranked();
        let start = Instant::now();

        // 500 and 3000 are a hundred buckets apart, far past the cap
        let (first, _) = player(1, 500);
        let (second, _) = player(2, 3000);
        strategy.enqueue(first, start);
        strategy.enqueue(second, start);

        let long_wait = start + (MAX_BUCKETS_DIFF as u32 + 10) * BUCKET_INCREMENT_TIME;
        assert!(strategy.tick(long_wait).is_empty());
    }

    #[tokio::test]
    async fn ranked_prefers_lower_neighbour() {
        let mut strategy = Strategy::ranked();
        let start = Instant::now();
        let tick_time = start + BUCKET_INCREMENT_TIME;

        // Lonely and the lower neighbour have waited a full increment;
        // the upper neighbour is fresh and initiates nothing itself
        let (lonely, lonely_id) = player(1, 1550);
        let (below, below_id) = player(2, 1525);
        let (above, _) = player(3, 1575);
        strategy.enqueue(lonely, start);
        strategy.enqueue(below, start);
        strategy.enqueue(above, tick_time);

        let groups = strategy.tick(tick_time);
        assert_eq!(groups.len(), 1);
        assert!(groups[0].iter().any(|member| member.user_id == lonely_id));
        assert!(groups[0].iter().any(|member| member.user_id == below_id));
    }

    #[tokio::test]
    async fn ranked_cancel() {
        let mut strategy = Strategy::ranked();
        let now = Instant::now();

        let (first, first_id) = player(1, 1500);
        let (second, _) = player(2, 1505);
        strategy.enqueue(first, now);
        strategy.enqueue(second, now);
        strategy.cancel(first_id);

        assert!(strategy.tick(now).is_empty());
    }
}
