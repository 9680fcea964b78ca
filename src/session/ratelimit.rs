//! Per-session token bucket.

use tokio::time::Instant;

use crate::session::packet::{FrameHeader, FrameKind};

/// Tokens restored per second
pub const TOKENS_REFILL_RATE: u64 = 10;

/// Bucket capacity: bursts of up to ten times the refill rate
pub const MAX_TOKENS: u64 = 10 * TOKENS_REFILL_RATE;

/// Cost in tokens of one inbound frame. Database-heavy requests are
/// weighted far above gameplay traffic; text costs scale with size.
pub fn frame_cost(header: &FrameHeader) -> u64 {
    use FrameKind::*;
    match header.kind {
        // Fetches, rarely needed per connection
        FetchFriends | FetchFriendRequests | FetchBlocks => 20,

        // Requests that touch other users through the store
        SendFriendRequest => 20,
        RespondFriendRequest => 5,
        RemoveFriend | BlockUser | UnblockUser => 20,

        // History lookups involve heavy store queries
        FetchMatchHistory | MatchReplayRequest => 20,

        // Text scales with payload size
        DirectTextMessage | MatchTextMessage => 2 + u64::from(header.length) / 100,

        // Gameplay
        QueueMatch => 2,
        CancelMatch => 1,
        SendCommand => 4,
        ForfeitMatch => 1,

        _ => 0,
    }
}

/// Linear-refill bucket: `tokens_after(dt) <= min(MAX_TOKENS,
/// tokens_before + floor(dt * RATE))` and the level never goes
/// negative.
pub struct TokenBucket {
    tokens: u64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(now: Instant) -> TokenBucket {
        TokenBucket {
            tokens: MAX_TOKENS,
            last_update: now,
        }
    }

    /// Refills for the elapsed time, then attempts to spend `cost`.
    /// Returns whether the frame may proceed.
    pub fn try_spend(&mut self, cost: u64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        let refill = (elapsed * TOKENS_REFILL_RATE as f64) as u64;
        self.tokens = (self.tokens + refill).min(MAX_TOKENS);
        self.last_update = now;

        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub fn tokens(&self) -> u64 {
        self.tokens
    }
}

#[cfg(test)]
mod test {
    use super::{frame_cost, TokenBucket, MAX_TOKENS, TOKENS_REFILL_RATE};
    use crate::session::packet::{FrameHeader, FrameKind};
    use std::time::Duration;
    use tokio::time::Instant;

    fn header(kind: FrameKind, length: u32) -> FrameHeader {
        FrameHeader { kind, length }
    }

    #[test]
    fn costs() {
        assert_eq!(frame_cost(&header(FrameKind::FetchFriends, 0)), 20);
        assert_eq!(frame_cost(&header(FrameKind::QueueMatch, 1)), 2);
        assert_eq!(frame_cost(&header(FrameKind::SendCommand, 7)), 4);
        assert_eq!(frame_cost(&header(FrameKind::Ping, 0)), 0);
        // Text cost scales with payload size
        assert_eq!(frame_cost(&header(FrameKind::DirectTextMessage, 17)), 2);
        assert_eq!(frame_cost(&header(FrameKind::DirectTextMessage, 250)), 4);
    }

    #[test]
    fn bucket_spends_and_refuses() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(now);

        assert!(bucket.try_spend(MAX_TOKENS, now));
        assert_eq!(bucket.tokens(), 0);
        // Empty bucket refuses without going negative
        assert!(!bucket.try_spend(1, now));
        assert_eq!(bucket.tokens(), 0);
    }

    #[test]
    fn bucket_refills_linearly() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(start);
        assert!(bucket.try_spend(MAX_TOKENS, start));

        let later = start + Duration::from_secs(3);
        assert!(bucket.try_spend(3 * TOKENS_REFILL_RATE, later));
        assert_eq!(bucket.tokens(), 0);
    }

    #[test]
    fn bucket_caps_at_max() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(start);
        assert!(bucket.try_spend(5, start));

        // A long idle period cannot overfill the bucket
        let much_later = start + Duration::from_secs(3600);
        assert!(!bucket.try_spend(MAX_TOKENS + 1, much_later));
        assert_eq!(bucket.tokens(), MAX_TOKENS);
    }

    proptest::proptest! {
        /// tokens_after(dt) <= min(MAX_TOKENS, tokens_before + floor(dt * RATE))
        #[test]
        fn refill_linearity(spend in 0u64..=MAX_TOKENS, wait_ms in 0u64..60_000) {
            let start = Instant::now();
            let mut bucket = TokenBucket::new(start);
            assert!(bucket.try_spend(spend, start));
            let before = bucket.tokens();

            let later = start + Duration::from_millis(wait_ms);
            bucket.try_spend(0, later);

            let bound = (before + wait_ms * TOKENS_REFILL_RATE / 1000).min(MAX_TOKENS);
            proptest::prop_assert!(bucket.tokens() <= bound);
        }
    }

    #[test]
    fn refill_is_floored() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(start);
        assert!(bucket.try_spend(MAX_TOKENS, start));

        // 0.05s restores half a token, which floors to zero
        let barely = start + Duration::from_millis(50);
        assert!(!bucket.try_spend(1, barely));
    }
}
