//! In-memory IP ban table, populated from the store at startup and
//! consulted at accept and at auth time.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::Utc;
use parking_lot::Mutex;

use crate::services::store::BanEntry;

/// Outcome of a ban lookup.
pub enum BanStatus {
    /// Active ban; connection must be rejected
    Banned(BanEntry),
    /// A ban existed but has lapsed; the caller should drop the store
    /// entry too
    Expired,
    Clear,
}

#[derive(Default)]
pub struct BanTable {
    inner: Mutex<HashMap<IpAddr, BanEntry>>,
}

impl BanTable {
    pub fn new() -> BanTable {
        BanTable::default()
    }

    pub fn load(&self, bans: HashMap<IpAddr, BanEntry>) {
        *self.inner.lock() = bans;
    }

    /// Checks an address, removing lapsed entries as they are found.
    pub fn check(&self, addr: IpAddr) -> BanStatus {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get(&addr) else {
            return BanStatus::Clear;
        };

        if Utc::now() < entry.until {
            BanStatus::Banned(entry.clone())
        } else {
            inner.remove(&addr);
            BanStatus::Expired
        }
    }

    pub fn insert(&self, addr: IpAddr, entry: BanEntry) {
        self.inner.lock().insert(addr, entry);
    }
}
