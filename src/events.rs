//! Connection events and the bounded migration history

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::path::PathKey;

/// What caused a path change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationTrigger {
    /// The peer's packets started arriving from a new address
    PeerAddressChange,
    /// Local decision to move, e.g. an interface switch
    LocalProbe,
    /// Client moving to the server's preferred address
    PreferredAddress,
}

impl fmt::Display for MigrationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationTrigger::PeerAddressChange => write!(f, "peer address change"),
            MigrationTrigger::LocalProbe => write!(f, "local probe"),
            MigrationTrigger::PreferredAddress => write!(f, "preferred address"),
        }
    }
}

/// Events surfaced by a connection; informational only
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    HandshakeCompleted {
        path: PathKey,
    },
    PathValidated {
        path: PathKey,
        rtt: Duration,
    },
    MigrationCompleted {
        from: PathKey,
        to: PathKey,
        trigger: MigrationTrigger,
        migration: u64,
    },
    ValidationFailed {
        path: PathKey,
        attempts: u32,
    },
    StreamDataReceived {
        path: PathKey,
        stream_id: u64,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
}

/// One completed migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// 1-based, counts every migration of the connection
    pub number: u64,
    pub from: PathKey,
    pub to: PathKey,
    pub trigger: MigrationTrigger,
    /// Time since the connection was established
    pub elapsed_ms: u64,
}

/// Append-only log of migrations keeping the most recent `capacity` entries
#[derive(Debug, Clone)]
pub struct MigrationHistory {
    records: VecDeque<MigrationRecord>,
    capacity: usize,
    total: u64,
}

impl MigrationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            total: 0,
        }
    }

    /// Append a migration, returning its number
    pub fn record(
        &mut self,
        from: PathKey,
        to: PathKey,
        trigger: MigrationTrigger,
        elapsed: Duration,
    ) -> u64 {
        self.total += 1;
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(MigrationRecord {
            number: self.total,
            from,
            to,
            trigger,
            elapsed_ms: elapsed.as_millis() as u64,
        });
        self.total
    }

    /// Total migrations, including records that fell out of the log
    pub fn migration_count(&self) -> u64 {
        self.total
    }

    pub fn last(&self) -> Option<&MigrationRecord> {
        self.records.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MigrationRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(port: u16) -> PathKey {
        PathKey::new("10.0.0.1:443".parse().unwrap(), format!("192.0.2.1:{}", port).parse().unwrap())
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = MigrationHistory::new(2);
        for port in 1..=5u16 {
            history.record(key(port), key(port + 1), MigrationTrigger::PeerAddressChange, Duration::ZERO);
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.migration_count(), 5);
        let numbers: Vec<u64> = history.iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![4, 5]);
        assert_eq!(history.last().unwrap().to, key(6));
    }

    #[test]
    fn test_record_serializes() {
        let mut history = MigrationHistory::new(4);
        history.record(key(1), key(2), MigrationTrigger::LocalProbe, Duration::from_millis(1500));
        let json = serde_json::to_value(history.last().unwrap()).unwrap();
        assert_eq!(json["trigger"], "local_probe");
        assert_eq!(json["elapsed_ms"], 1500);
        assert_eq!(json["to"]["remote"], "192.0.2.1:2");
    }
}
