//! Registry of known updates
//!
//! A cloneable handle over shared state. Every collaborator that needs the
//! registry gets its own handle; there is no process-wide instance.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::models::{UpdateEvent, UpdateInfo, UpdateOrigin, UpdateStatus};

/// Buffered events per subscriber
const EVENT_CAPACITY: usize = 256;

/// Authoritative collection of remote and local updates
#[derive(Clone)]
pub struct UpdateRegistry {
    updates: Arc<RwLock<HashMap<String, UpdateInfo>>>,
    events: broadcast::Sender<UpdateEvent>,
}

impl UpdateRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            updates: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Insert an update, or refresh the manifest-owned fields of an existing one.
    ///
    /// Returns `true` when the id was not known before. The stored status and
    /// origin of an existing entry are kept.
    pub fn add(&self, update: UpdateInfo) -> bool {
        let id = update.id.clone();
        let inserted = Self::upsert(&mut self.updates.write(), update);

        if inserted {
            debug!("Added update {}", id);
            self.publish(UpdateEvent::StatusChanged(id));
        }
        inserted
    }

    fn upsert(updates: &mut HashMap<String, UpdateInfo>, update: UpdateInfo) -> bool {
        match updates.get_mut(&update.id) {
            Some(existing) => {
                existing.timestamp = update.timestamp;
                existing.metadata = update.metadata;
                if update.origin == UpdateOrigin::Remote {
                    existing.available_online = true;
                }
                false
            }
            None => {
                updates.insert(update.id.clone(), update);
                true
            }
        }
    }

    /// Merge a freshly fetched manifest batch.
    ///
    /// Every entry is added or refreshed, then remote entries missing from the
    /// batch are flagged as no longer offered. Nothing is deleted and local
    /// entries are left alone. Returns `true` if any id was new.
    ///
    /// The whole batch is applied under one write lock; readers see either
    /// the previous or the merged registry. Events are published afterwards.
    pub fn merge(&self, entries: Vec<UpdateInfo>) -> bool {
        let online: HashSet<String> = entries.iter().map(|e| e.id.clone()).collect();
        let mut changed = Vec::new();
        let mut newly_discovered = false;

        {
            let mut updates = self.updates.write();
            for entry in entries {
                let id = entry.id.clone();
                if Self::upsert(&mut updates, entry) {
                    newly_discovered = true;
                    changed.push(id);
                }
            }

            for update in updates.values_mut() {
                if update.origin != UpdateOrigin::Remote {
                    continue;
                }
                let available = online.contains(&update.id);
                if update.available_online != available {
                    update.available_online = available;
                    debug!("Availability of {} changed", update.id);
                    changed.push(update.id.clone());
                }
            }
        }

        for id in changed {
            self.publish(UpdateEvent::StatusChanged(id));
        }
        info!(
            "Merged {} manifest entries (new updates: {})",
            online.len(),
            newly_discovered
        );
        newly_discovered
    }

    /// Look up an update by id
    pub fn get(&self, id: &str) -> Option<UpdateInfo> {
        self.updates.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.updates.read().contains_key(id)
    }

    /// Snapshot of all updates, newest first.
    ///
    /// Equal timestamps are ordered by id ascending.
    pub fn list(&self) -> Vec<UpdateInfo> {
        let mut updates: Vec<UpdateInfo> = self.updates.read().values().cloned().collect();
        updates.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        updates
    }

    pub fn len(&self) -> usize {
        self.updates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.read().is_empty()
    }

    /// Store a status reported by the download/verify/install pipeline
    pub fn set_status(&self, id: &str, status: UpdateStatus) -> bool {
        let updated = match self.updates.write().get_mut(id) {
            Some(update) => {
                update.status = status;
                true
            }
            None => false,
        };

        if updated {
            self.publish(UpdateEvent::StatusChanged(id.to_string()));
        }
        updated
    }

    /// Delete an update
    pub fn remove(&self, id: &str) -> Option<UpdateInfo> {
        let removed = self.updates.write().remove(id);
        if removed.is_some() {
            info!("Removed update {}", id);
            self.publish(UpdateEvent::Removed(id.to_string()));
        }
        removed
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: UpdateEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Receive future events
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }
}

impl Default for UpdateRegistry {
    fn default() -> Self {
        Self::new()
    }
}
