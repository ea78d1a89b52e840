//! Penalty side effects: IP blacklisting and user flags.
//!
//! Every penalty is a monotone extension: the stored expiry becomes the later
//! of the existing one and the new one. Each flag is written on its own, so
//! extending a lock never touches a ban set by another request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::key::{Category, SequenceKey};
use crate::error::{Result, TierguardError};

/// Which penalties a recorded event may apply when it lands on a penalizing tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyFlags {
    /// Blacklist the IP (IP sequences only)
    pub blacklist: bool,
    /// Mark the user suspicious (user sequences only)
    pub suspicious: bool,
    /// Ban the user (user sequences only)
    pub ban: bool,
    /// Lock the user (user sequences only)
    pub lock: bool,
    /// The IP came from an unverified source; blacklist entries are marked unreliable
    pub untrusted_ip: bool,
}

impl PenaltyFlags {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn blacklist() -> Self {
        Self {
            blacklist: true,
            ..Self::default()
        }
    }

    /// Check the flags make sense for a category.
    pub fn validate_for(&self, category: Category) -> Result<()> {
        let misplaced = match category {
            Category::Ip => self.suspicious || self.ban || self.lock,
            Category::User => self.blacklist,
        };
        if misplaced {
            return Err(TierguardError::InvalidSpec(format!(
                "penalty flags {:?} do not apply to {} events",
                self, category
            )));
        }
        Ok(())
    }
}

/// A single kind of penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PenaltyKind {
    Blacklist,
    Suspicious,
    Ban,
    Lock,
}

/// Sink for penalty side effects.
#[async_trait]
pub trait PenaltySink: Send + Sync {
    async fn blacklist_ip(&self, ip: &str, reliable: bool, until: DateTime<Utc>) -> Result<()>;

    async fn mark_user_suspicious(&self, user_id: i64, until: DateTime<Utc>) -> Result<()>;

    async fn ban_user(&self, user_id: i64, until: DateTime<Utc>) -> Result<()>;

    async fn lock_user(&self, user_id: i64, until: DateTime<Utc>) -> Result<()>;

    /// Apply every penalty `flags` selects for the sequence `key`.
    ///
    /// Returns the kinds that were applied, in application order.
    async fn apply(
        &self,
        key: &SequenceKey,
        flags: PenaltyFlags,
        until: DateTime<Utc>,
    ) -> Result<Vec<PenaltyKind>> {
        let mut applied = Vec::new();
        match key.category {
            Category::Ip => {
                if flags.blacklist {
                    self.blacklist_ip(&key.identifier, !flags.untrusted_ip, until).await?;
                    applied.push(log_applied(key, PenaltyKind::Blacklist, until));
                }
            }
            Category::User => {
                if flags.suspicious {
                    self.mark_user_suspicious(user_id(key)?, until).await?;
                    applied.push(log_applied(key, PenaltyKind::Suspicious, until));
                }
                if flags.ban {
                    self.ban_user(user_id(key)?, until).await?;
                    applied.push(log_applied(key, PenaltyKind::Ban, until));
                }
                if flags.lock {
                    self.lock_user(user_id(key)?, until).await?;
                    applied.push(log_applied(key, PenaltyKind::Lock, until));
                }
            }
        }
        Ok(applied)
    }
}

fn log_applied(key: &SequenceKey, kind: PenaltyKind, until: DateTime<Utc>) -> PenaltyKind {
    info!(key = %key, penalty = ?kind, until = %until, "Penalty applied");
    kind
}

fn user_id(key: &SequenceKey) -> Result<i64> {
    key.identifier
        .parse()
        .map_err(|_| TierguardError::InvalidSpec(format!("user identifier is not an integer: {}", key.identifier)))
}

/// An IP blacklist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub expires_at: DateTime<Utc>,
    pub reliable: bool,
}

/// Penalty flags on a user record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFlags {
    pub suspicious_until: Option<DateTime<Utc>>,
    pub banned_until: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
}

fn extend(slot: &mut Option<DateTime<Utc>>, until: DateTime<Utc>) {
    *slot = Some(slot.map_or(until, |existing| existing.max(until)));
}

/// In-memory penalty sink.
#[derive(Debug, Default)]
pub struct MemoryPenaltySink {
    blacklist: DashMap<String, BlacklistEntry>,
    users: DashMap<i64, UserFlags>,
}

impl MemoryPenaltySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blacklist_entry(&self, ip: &str) -> Option<BlacklistEntry> {
        self.blacklist.get(ip).map(|e| *e)
    }

    pub fn user_flags(&self, user_id: i64) -> Option<UserFlags> {
        self.users.get(&user_id).map(|f| *f)
    }

    /// Whether the IP is blacklisted at `now`.
    pub fn is_blacklisted(&self, ip: &str, now: DateTime<Utc>) -> bool {
        self.blacklist_entry(ip).is_some_and(|e| e.expires_at > now)
    }

    fn update_user(&self, user_id: i64, update: impl FnOnce(&mut UserFlags)) {
        let mut flags = self.users.entry(user_id).or_default();
        update(flags.value_mut());
    }
}

#[async_trait]
impl PenaltySink for MemoryPenaltySink {
    async fn blacklist_ip(&self, ip: &str, reliable: bool, until: DateTime<Utc>) -> Result<()> {
        self.blacklist
            .entry(ip.to_string())
            .and_modify(|entry| {
                entry.expires_at = entry.expires_at.max(until);
                entry.reliable |= reliable;
            })
            .or_insert(BlacklistEntry {
                expires_at: until,
                reliable,
            });
        Ok(())
    }

    async fn mark_user_suspicious(&self, user_id: i64, until: DateTime<Utc>) -> Result<()> {
        self.update_user(user_id, |flags| extend(&mut flags.suspicious_until, until));
        Ok(())
    }

    async fn ban_user(&self, user_id: i64, until: DateTime<Utc>) -> Result<()> {
        self.update_user(user_id, |flags| extend(&mut flags.banned_until, until));
        Ok(())
    }

    async fn lock_user(&self, user_id: i64, until: DateTime<Utc>) -> Result<()> {
        self.update_user(user_id, |flags| extend(&mut flags.locked_until, until));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_blacklist_never_shortens() {
        let sink = MemoryPenaltySink::new();
        let now = Utc::now();

        sink.blacklist_ip("1.2.3.4", true, now + Duration::seconds(3600)).await.unwrap();
        sink.blacklist_ip("1.2.3.4", false, now + Duration::seconds(60)).await.unwrap();

        let entry = sink.blacklist_entry("1.2.3.4").unwrap();
        assert_eq!(entry.expires_at, now + Duration::seconds(3600));
        assert!(entry.reliable);
        assert!(sink.is_blacklisted("1.2.3.4", now));
    }

    #[tokio::test]
    async fn test_user_flags_are_independent() {
        let sink = MemoryPenaltySink::new();
        let now = Utc::now();

        sink.ban_user(7, now + Duration::seconds(600)).await.unwrap();
        sink.lock_user(7, now + Duration::seconds(60)).await.unwrap();
        sink.ban_user(7, now + Duration::seconds(30)).await.unwrap();

        let flags = sink.user_flags(7).unwrap();
        assert_eq!(flags.banned_until, Some(now + Duration::seconds(600)));
        assert_eq!(flags.locked_until, Some(now + Duration::seconds(60)));
        assert_eq!(flags.suspicious_until, None);
    }

    #[tokio::test]
    async fn test_apply_dispatches_by_category() {
        let sink = MemoryPenaltySink::new();
        let until = Utc::now() + Duration::seconds(120);
        let flags = PenaltyFlags {
            suspicious: true,
            lock: true,
            ..PenaltyFlags::none()
        };

        let applied = sink.apply(&SequenceKey::user(5, 1), flags, until).await.unwrap();
        assert_eq!(applied, vec![PenaltyKind::Suspicious, PenaltyKind::Lock]);

        let flags = sink.user_flags(5).unwrap();
        assert_eq!(flags.suspicious_until, Some(until));
        assert_eq!(flags.locked_until, Some(until));
        assert_eq!(flags.banned_until, None);
    }

    #[tokio::test]
    async fn test_apply_untrusted_ip_marks_unreliable() {
        let sink = MemoryPenaltySink::new();
        let until = Utc::now() + Duration::seconds(120);
        let key = SequenceKey::ip("10.1.1.1".parse().unwrap(), 0, 64);
        let flags = PenaltyFlags {
            untrusted_ip: true,
            ..PenaltyFlags::blacklist()
        };

        sink.apply(&key, flags, until).await.unwrap();
        assert!(!sink.blacklist_entry("10.1.1.1").unwrap().reliable);
    }

    #[tokio::test]
    async fn test_apply_ignores_flags_of_other_category() {
        let sink = MemoryPenaltySink::new();
        let until = Utc::now() + Duration::seconds(120);
        let everything = PenaltyFlags {
            blacklist: true,
            suspicious: true,
            ban: true,
            lock: true,
            untrusted_ip: false,
        };

        let applied = sink
            .apply(&SequenceKey::ip("10.2.2.2".parse().unwrap(), 0, 64), everything, until)
            .await
            .unwrap();
        assert_eq!(applied, vec![PenaltyKind::Blacklist]);

        let applied = sink.apply(&SequenceKey::user(3, 0), everything, until).await.unwrap();
        assert_eq!(applied, vec![PenaltyKind::Suspicious, PenaltyKind::Ban, PenaltyKind::Lock]);
        assert!(sink.blacklist_entry("3").is_none());
    }

    #[test]
    fn test_validate_for_rejects_misplaced_flags() {
        assert!(PenaltyFlags::blacklist().validate_for(Category::Ip).is_ok());
        assert!(PenaltyFlags::blacklist().validate_for(Category::User).is_err());

        let ban = PenaltyFlags {
            ban: true,
            ..PenaltyFlags::none()
        };
        assert!(ban.validate_for(Category::User).is_ok());
        assert!(ban.validate_for(Category::Ip).is_err());
    }
}
