//! Ban List
//!
//! Source addresses that are refused during the accept phase. Entries are
//! IP networks; a bare address is treated as a single-host network. Bans may
//! be permanent or expire after a duration.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::Context;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A banned network (or single host)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BanEntry(IpNet);

impl BanEntry {
    pub fn network(&self) -> IpNet {
        self.0
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.0.contains(&ip)
    }
}

impl From<IpAddr> for BanEntry {
    fn from(ip: IpAddr) -> Self {
        Self(IpNet::from(ip))
    }
}

impl From<IpNet> for BanEntry {
    fn from(net: IpNet) -> Self {
        Self(net.trunc())
    }
}

impl FromStr for BanEntry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains('/') {
            let net = s
                .parse::<IpNet>()
                .with_context(|| format!("Invalid ban network: {}", s))?;
            Ok(Self::from(net))
        } else {
            let ip = s
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid ban address: {}", s))?;
            Ok(Self::from(ip))
        }
    }
}

impl TryFrom<String> for BanEntry {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BanEntry> for String {
    fn from(entry: BanEntry) -> Self {
        entry.to_string()
    }
}

impl fmt::Display for BanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Single hosts print without the prefix length
        if self.0.prefix_len() == self.0.max_prefix_len() {
            write!(f, "{}", self.0.addr())
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, Clone)]
struct Ban {
    entry: BanEntry,
    banned_until: Option<Instant>,
}

impl Ban {
    fn is_active(&self, now: Instant) -> bool {
        self.banned_until.map_or(true, |until| now < until)
    }

    fn time_until_unban(&self, now: Instant) -> Option<Duration> {
        self.banned_until
            .and_then(|until| until.checked_duration_since(now))
    }
}

/// Decision from a ban list check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BanDecision {
    Allow,
    Block {
        entry: BanEntry,
        /// `None` for a permanent ban
        time_until_unban: Option<Duration>,
    },
}

/// Set of rejected source addresses
#[derive(Debug, Clone, Default)]
pub struct BanList {
    bans: Vec<Ban>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ban list of permanent entries
    pub fn from_entries(entries: impl IntoIterator<Item = BanEntry>) -> Self {
        let mut list = Self::new();
        for entry in entries {
            list.ban(entry);
        }
        list
    }

    /// Ban permanently
    pub fn ban(&mut self, entry: BanEntry) {
        self.insert(entry, None);
        info!("Banned {}", entry);
    }

    /// Ban until `duration` has elapsed
    pub fn ban_for(&mut self, entry: BanEntry, duration: Duration) {
        self.insert(entry, Some(Instant::now() + duration));
        info!("Banned {} for {:?}", entry, duration);
    }

    fn insert(&mut self, entry: BanEntry, banned_until: Option<Instant>) {
        // Re-banning replaces the previous expiry
        if let Some(existing) = self.bans.iter_mut().find(|ban| ban.entry == entry) {
            existing.banned_until = banned_until;
        } else {
            self.bans.push(Ban {
                entry,
                banned_until,
            });
        }
    }

    /// Remove an entry, returning whether it was present
    pub fn unban(&mut self, entry: BanEntry) -> bool {
        let before = self.bans.len();
        self.bans.retain(|ban| ban.entry != entry);
        let removed = self.bans.len() != before;
        if removed {
            info!("Unbanned {}", entry);
        }
        removed
    }

    /// Check a source address against every active entry
    pub fn check(&self, ip: IpAddr) -> BanDecision {
        let now = Instant::now();
        self.bans
            .iter()
            .find(|ban| ban.is_active(now) && ban.entry.contains(ip))
            .map_or(BanDecision::Allow, |ban| BanDecision::Block {
                entry: ban.entry,
                time_until_unban: ban.time_until_unban(now),
            })
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        matches!(self.check(ip), BanDecision::Block { .. })
    }

    /// Currently active entries
    pub fn entries(&self) -> Vec<BanEntry> {
        let now = Instant::now();
        self.bans
            .iter()
            .filter(|ban| ban.is_active(now))
            .map(|ban| ban.entry)
            .collect()
    }

    /// Drop expired entries
    pub fn cleanup_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.bans.len();
        self.bans.retain(|ban| ban.is_active(now));
        let removed = before - self.bans.len();
        if removed > 0 {
            debug!("Cleaned up {} expired ban entries", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
