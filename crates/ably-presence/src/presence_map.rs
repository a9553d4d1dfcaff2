//! Members present on a channel, reconciled by the presence SYNC protocol.

use std::collections::{HashMap, HashSet};

use crate::types::{MemberKey, PresenceAction, PresenceMessage, PresenceQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    NotStarted,
    InProgress,
    Complete,
}

#[derive(Debug)]
pub(crate) struct PresenceMap {
    /// Latest record per member, stored with action `Present`.
    members: HashMap<MemberKey, PresenceMessage>,
    /// LEAVEs seen during a SYNC, kept so an older SYNC entry for the same
    /// member cannot bring it back. Dropped when the SYNC ends.
    absent: HashMap<MemberKey, PresenceMessage>,
    /// Members known when the SYNC started that nothing has mentioned since.
    residual: HashSet<MemberKey>,
    /// Members entered by this connection, by client id.
    local_members: HashMap<String, PresenceMessage>,
    sync_state: SyncState,
    last_sync_serial: Option<String>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
            absent: HashMap::new(),
            residual: HashSet::new(),
            local_members: HashMap::new(),
            sync_state: SyncState::NotStarted,
            last_sync_serial: None,
        }
    }

    pub fn sync_complete(&self) -> bool {
        self.sync_state == SyncState::Complete
    }

    pub fn sync_in_progress(&self) -> bool {
        self.sync_state == SyncState::InProgress
    }

    pub fn last_sync_serial(&self) -> Option<&str> {
        self.last_sync_serial.as_deref()
    }

    pub fn set_sync_serial(&mut self, serial: Option<String>) {
        self.last_sync_serial = serial;
    }

    /// Begin a SYNC session. A session already in progress is continued, so
    /// its residual set survives a re-attach.
    pub fn start_sync(&mut self) {
        if self.sync_in_progress() {
            return;
        }
        self.residual = self.members.keys().cloned().collect();
        self.absent.clear();
        self.last_sync_serial = None;
        self.sync_state = SyncState::InProgress;
    }

    /// Finish the SYNC session. Members that were present before it started
    /// and were neither reconfirmed nor updated are removed; the returned
    /// LEAVE events (oldest key first) report them.
    pub fn end_sync(&mut self, timestamp: Option<i64>) -> Vec<PresenceMessage> {
        let mut stale: Vec<MemberKey> = self.residual.drain().collect();
        stale.sort();
        let leaves = stale
            .into_iter()
            .filter_map(|key| self.members.remove(&key))
            .map(|member| PresenceMessage {
                id: None,
                action: PresenceAction::Leave,
                timestamp: timestamp.or(member.timestamp),
                ..member
            })
            .collect();
        self.absent.clear();
        self.last_sync_serial = None;
        self.sync_state = SyncState::Complete;
        leaves
    }

    /// Apply one presence record. Returns the event to broadcast (with its
    /// original action), or `None` when the record is older than what the
    /// map already holds.
    pub fn put(&mut self, message: PresenceMessage) -> Option<PresenceMessage> {
        let key = message.member_key();
        if self.sync_in_progress() {
            self.residual.remove(&key);
        }
        let existing = self.members.get(&key).or_else(|| self.absent.get(&key));
        if existing.is_some_and(|e| !message.is_newer_than(e)) {
            return None;
        }

        match message.action {
            PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                self.absent.remove(&key);
                self.members.insert(
                    key,
                    PresenceMessage {
                        action: PresenceAction::Present,
                        ..message.clone()
                    },
                );
            }
            PresenceAction::Leave | PresenceAction::Absent => {
                self.members.remove(&key);
                if self.sync_in_progress() {
                    self.absent.insert(key, message.clone());
                }
            }
        }
        Some(message)
    }

    /// Track a member entered by this connection.
    pub fn track_local(&mut self, message: &PresenceMessage) {
        match message.action {
            PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                self.local_members
                    .insert(message.client_id.clone(), message.clone());
            }
            PresenceAction::Leave | PresenceAction::Absent => {
                self.local_members.remove(&message.client_id);
            }
        }
    }

    /// Members entered by this connection, ordered by client id.
    pub fn local_members(&self) -> Vec<PresenceMessage> {
        let mut local: Vec<PresenceMessage> = self.local_members.values().cloned().collect();
        local.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        local
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Snapshot of current members matching `query`, ordered by key.
    pub fn members(&self, query: &PresenceQuery) -> Vec<PresenceMessage> {
        let mut members: Vec<PresenceMessage> = self
            .members
            .values()
            .filter(|m| query.matches(m))
            .cloned()
            .collect();
        members.sort_by(|a, b| {
            (a.client_id.as_str(), a.connection_id.as_str())
                .cmp(&(b.client_id.as_str(), b.connection_id.as_str()))
        });
        members
    }

    /// Forget every member, local ones included.
    pub fn reset(&mut self) {
        self.local_members.clear();
        self.members.clear();
        self.absent.clear();
        self.residual.clear();
        self.last_sync_serial = None;
        self.sync_state = SyncState::NotStarted;
    }
}

impl Default for PresenceMap {
    fn default() -> Self {
        Self::new()
    }
}
