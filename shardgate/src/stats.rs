//! Operation counters
//!
//! Three counter sets are kept: global, sharded and unsharded. Each is split
//! by op kind. Inserts count once per document through `got_insert`; every
//! other op counts once per operation through `got_op`.

use crate::request::OpKind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Which counter set an operation lands in besides the global one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Sharded,
    Unsharded,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Sharded => "sharded",
            Scope::Unsharded => "unsharded",
        }
    }
}

#[derive(Debug, Default)]
pub struct OpCounters {
    query: AtomicU64,
    insert: AtomicU64,
    update: AtomicU64,
    delete: AtomicU64,
    getmore: AtomicU64,
    command: AtomicU64,
}

/// Point-in-time copy of an `OpCounters`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCountersSnapshot {
    pub query: u64,
    pub insert: u64,
    pub update: u64,
    pub delete: u64,
    pub getmore: u64,
    pub command: u64,
}

impl OpCounters {
    /// Count one operation; inserts are ignored here
    pub fn got_op(&self, kind: OpKind, is_command: bool) {
        let counter = match kind {
            OpKind::Query if is_command => &self.command,
            OpKind::Query => &self.query,
            OpKind::GetMore => &self.getmore,
            OpKind::Update => &self.update,
            OpKind::Delete => &self.delete,
            OpKind::Insert => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one inserted document
    pub fn got_insert(&self) {
        self.insert.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OpCountersSnapshot {
        OpCountersSnapshot {
            query: self.query.load(Ordering::Relaxed),
            insert: self.insert.load(Ordering::Relaxed),
            update: self.update.load(Ordering::Relaxed),
            delete: self.delete.load(Ordering::Relaxed),
            getmore: self.getmore.load(Ordering::Relaxed),
            command: self.command.load(Ordering::Relaxed),
        }
    }
}

/// Global plus per-strategy counters for one router
#[derive(Debug, Default)]
pub struct RouterStats {
    global: OpCounters,
    sharded: OpCounters,
    unsharded: OpCounters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStatsSnapshot {
    pub global: OpCountersSnapshot,
    pub sharded: OpCountersSnapshot,
    pub unsharded: OpCountersSnapshot,
}

impl RouterStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn scoped(&self, scope: Scope) -> &OpCounters {
        match scope {
            Scope::Sharded => &self.sharded,
            Scope::Unsharded => &self.unsharded,
        }
    }

    pub fn got_op(&self, scope: Scope, kind: OpKind, is_command: bool) {
        if kind == OpKind::Insert {
            return;
        }
        self.global.got_op(kind, is_command);
        self.scoped(scope).got_op(kind, is_command);

        let op = if is_command { "command" } else { kind.as_str() };
        metrics::counter!(
            "shardgate_ops_total",
            "scope" => scope.as_str(),
            "op" => op
        )
        .increment(1);
    }

    pub fn got_insert(&self, scope: Scope) {
        self.global.got_insert();
        self.scoped(scope).got_insert();
        metrics::counter!(
            "shardgate_ops_total",
            "scope" => scope.as_str(),
            "op" => "insert"
        )
        .increment(1);
    }

    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            global: self.global.snapshot(),
            sharded: self.sharded.snapshot(),
            unsharded: self.unsharded.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_counted_separately() {
        let stats = RouterStats::new();
        stats.got_op(Scope::Unsharded, OpKind::Query, true);
        stats.got_op(Scope::Unsharded, OpKind::Query, false);
        stats.got_op(Scope::Sharded, OpKind::Update, false);

        let snap = stats.snapshot();
        assert_eq!(snap.global.command, 1);
        assert_eq!(snap.global.query, 1);
        assert_eq!(snap.global.update, 1);
        assert_eq!(snap.unsharded.command, 1);
        assert_eq!(snap.sharded.update, 1);
        assert_eq!(snap.sharded.query, 0);
    }

    #[test]
    fn test_inserts_counted_per_document() {
        let stats = RouterStats::new();
        stats.got_op(Scope::Sharded, OpKind::Insert, false);
        for _ in 0..3 {
            stats.got_insert(Scope::Sharded);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.global.insert, 3);
        assert_eq!(snap.sharded.insert, 3);
        assert_eq!(snap.unsharded.insert, 0);
    }
}
