//! Sequence key generation and handling.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr};

/// The class of actor an event sequence is tracked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// A client IP address (or IPv6 prefix)
    Ip,
    /// An authenticated or targeted user ID
    User,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Ip => "ip",
            Category::User => "user",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The actor an event is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Ip(IpAddr),
    User(i64),
}

impl Identifier {
    pub fn category(&self) -> Category {
        match self {
            Identifier::Ip(_) => Category::Ip,
            Identifier::User(_) => Category::User,
        }
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identifier::Ip(ip) => write!(f, "{}", ip),
            Identifier::User(id) => write!(f, "{}", id),
        }
    }
}

/// A key that uniquely identifies one event sequence.
///
/// IPv4 addresses are keyed exactly. IPv6 addresses are keyed by their
/// network prefix so that a client rotating through its own /64 still
/// lands on a single sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceKey {
    pub category: Category,
    /// Canonical identifier string (IP, IPv6 prefix, or user ID)
    pub identifier: String,
    pub event_type: u32,
}

impl SequenceKey {
    /// Create a key for a user sequence.
    pub fn user(user_id: i64, event_type: u32) -> Self {
        Self {
            category: Category::User,
            identifier: user_id.to_string(),
            event_type,
        }
    }

    /// Create a key for an IP sequence, bucketing IPv6 by `ipv6_prefix_len`.
    pub fn ip(ip: IpAddr, event_type: u32, ipv6_prefix_len: u8) -> Self {
        Self {
            category: Category::Ip,
            identifier: bucket_ip(ip, ipv6_prefix_len),
            event_type,
        }
    }

    /// Create a key for any identifier.
    pub fn new(identifier: &Identifier, event_type: u32, ipv6_prefix_len: u8) -> Self {
        match identifier {
            Identifier::Ip(ip) => Self::ip(*ip, event_type, ipv6_prefix_len),
            Identifier::User(id) => Self::user(*id, event_type),
        }
    }

    /// Convert the key to a string representation.
    ///
    /// This is useful for logging and for string-keyed stores.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}/event:{}", self.category, self.identifier, self.event_type)
    }
}

impl std::fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Canonical bucket string for an IP address.
pub fn bucket_ip(ip: IpAddr, ipv6_prefix_len: u8) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return v4.to_string();
            }
            let prefix = ipv6_prefix_len.min(128);
            if prefix == 128 {
                return v6.to_string();
            }
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            let network = Ipv6Addr::from(u128::from(v6) & mask);
            format!("{}/{}", network, prefix)
        }
    }
}
