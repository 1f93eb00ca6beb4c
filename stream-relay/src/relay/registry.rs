//! In-memory registry of relay streams.
//!
//! All reads and writes go through one lock, so every operation is atomic
//! with respect to every other. Status writes are transition-checked: when a
//! manual stop and a monitor race to stop the same stream, the second writer
//! gets a conflict instead of overwriting the first.
//!
//! Every accepted status write is published as a stream update while the
//! write lock is still held, so subscribers see updates in commit order.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::state::{StopReason, StreamStatus};
use crate::events::{EventBus, SupervisorEvent};
use crate::process::ProcessHandle;
use crate::{Error, Result};

const ENTITY: &str = "stream";

/// A stream record as owned by the registry.
#[derive(Debug)]
struct StreamRecord {
    id: String,
    source_ref: String,
    target_ref: String,
    status: StreamStatus,
    error: Option<String>,
    stop_reason: Option<StopReason>,
    process: Option<ProcessHandle>,
    monitor_claimed: bool,
    /// Cancelled when the record leaves the running states.
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StreamRecord {
    fn summary(&self) -> StreamSummary {
        StreamSummary {
            id: self.id.clone(),
            source_ref: self.source_ref.clone(),
            target_ref: self.target_ref.clone(),
            status: self.status,
            error: self.error.clone(),
            stop_reason: self.stop_reason,
            pid: self.process.as_ref().and_then(ProcessHandle::pid),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time copy of a stream record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub id: String,
    pub source_ref: String,
    pub target_ref: String,
    pub status: StreamStatus,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A status write that went through.
#[derive(Debug)]
pub struct Transition {
    pub from: StreamStatus,
    pub to: StreamStatus,
    /// The worker handle, detached from the record when it stopped.
    pub process: Option<ProcessHandle>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    records: HashMap<String, StreamRecord>,
    /// Every id ever handed out, including removed ones.
    issued: HashSet<String>,
}

impl RegistryInner {
    fn record_mut(&mut self, id: &str) -> Result<&mut StreamRecord> {
        self.records
            .get_mut(id)
            .ok_or_else(|| Error::not_found(ENTITY, id))
    }

    fn next_id(&mut self) -> String {
        loop {
            let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
            if self.issued.insert(id.clone()) {
                return id;
            }
        }
    }
}

/// Concurrency-safe store of stream records keyed by id.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    inner: RwLock<RegistryInner>,
    events: EventBus,
}

impl StreamRegistry {
    /// Registry publishing to a bus of its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry publishing its status changes on `events`.
    pub fn with_events(events: EventBus) -> Self {
        Self {
            inner: RwLock::default(),
            events,
        }
    }

    /// Insert a `Starting` record without a process and announce it.
    ///
    /// The id is generated here and is never handed out again;
    /// `target_for` derives the target reference from it.
    pub fn create(
        &self,
        source_ref: impl Into<String>,
        target_for: impl FnOnce(&str) -> String,
    ) -> StreamSummary {
        let mut inner = self.inner.write();
        let id = inner.next_id();
        let now = Utc::now();
        let record = StreamRecord {
            target_ref: target_for(&id),
            id: id.clone(),
            source_ref: source_ref.into(),
            status: StreamStatus::Starting,
            error: None,
            stop_reason: None,
            process: None,
            monitor_claimed: false,
            cancel: CancellationToken::new(),
            created_at: now,
            updated_at: now,
        };
        let summary = record.summary();
        inner.records.insert(id, record);
        debug!(stream_id = %summary.id, source = %summary.source_ref, "Stream record created");
        self.events.publish(SupervisorEvent::stream_update(
            &summary.id,
            StreamStatus::Starting,
            None,
        ));
        summary
    }

    /// Attach the worker handle to a running record.
    pub fn attach_process(&self, id: &str, handle: ProcessHandle) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner.record_mut(id)?;
        if !record.status.holds_process() {
            return Err(Error::InvalidStateTransition {
                from: record.status.to_string(),
                to: "attached".to_string(),
            });
        }
        if record.process.is_some() {
            return Err(Error::InvalidStateTransition {
                from: "attached".to_string(),
                to: "attached".to_string(),
            });
        }
        record.process = Some(handle);
        record.updated_at = Utc::now();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<StreamSummary> {
        self.inner
            .read()
            .records
            .get(id)
            .map(StreamRecord::summary)
            .ok_or_else(|| Error::not_found(ENTITY, id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().records.contains_key(id)
    }

    pub fn status(&self, id: &str) -> Option<StreamStatus> {
        self.inner.read().records.get(id).map(|r| r.status)
    }

    /// Snapshot of all records, oldest first.
    pub fn list(&self) -> Vec<StreamSummary> {
        let mut records: Vec<_> = self
            .inner
            .read()
            .records
            .values()
            .map(StreamRecord::summary)
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Ids of every record that is not yet `Stopped`.
    pub fn running_ids(&self) -> Vec<String> {
        self.inner
            .read()
            .records
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn count_with_status(&self, status: StreamStatus) -> usize {
        self.inner
            .read()
            .records
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move a record forward and publish the update.
    ///
    /// Backward moves, same-status writes and anything out of `Stopped` are
    /// rejected with [`Error::InvalidStateTransition`] and change nothing.
    /// Moving to `Stopped` detaches the process handle and cancels the
    /// record's token.
    pub fn set_status(
        &self,
        id: &str,
        status: StreamStatus,
        error: Option<String>,
    ) -> Result<Transition> {
        self.transition(id, status, error, None)
    }

    /// Move a record to `Stopped`, recording why.
    pub fn mark_stopped(
        &self,
        id: &str,
        reason: StopReason,
        error: Option<String>,
    ) -> Result<Transition> {
        self.transition(id, StreamStatus::Stopped, error, Some(reason))
    }

    fn transition(
        &self,
        id: &str,
        to: StreamStatus,
        error: Option<String>,
        reason: Option<StopReason>,
    ) -> Result<Transition> {
        let mut inner = self.inner.write();
        let record = inner.record_mut(id)?;
        let from = record.status;
        record.status = from.transition_to(to)?;
        record.updated_at = Utc::now();
        if error.is_some() {
            record.error = error.clone();
        }

        let process = if to.is_terminal() {
            record.stop_reason = reason;
            record.cancel.cancel();
            record.process.take()
        } else {
            None
        };

        debug!(stream_id = %id, %from, %to, "Stream status changed");
        self.events
            .publish(SupervisorEvent::stream_update(id, to, error));
        drop(inner);
        Ok(Transition { from, to, process })
    }

    /// Detach the process handle without touching the status.
    pub fn clear_process(&self, id: &str) -> Result<Option<ProcessHandle>> {
        let mut inner = self.inner.write();
        let record = inner.record_mut(id)?;
        Ok(record.process.take())
    }

    /// Reserve the single monitor slot of a running record.
    ///
    /// Returns the record's cancellation token, which fires when the record
    /// stops or is removed.
    pub fn claim_monitor(&self, id: &str) -> Result<CancellationToken> {
        let mut inner = self.inner.write();
        let record = inner.record_mut(id)?;
        if record.status.is_terminal() || record.monitor_claimed {
            return Err(Error::InvalidStateTransition {
                from: record.status.to_string(),
                to: "monitored".to_string(),
            });
        }
        record.monitor_claimed = true;
        Ok(record.cancel.clone())
    }

    /// Delete a stopped record. Its id stays retired.
    pub fn remove(&self, id: &str) -> Result<StreamSummary> {
        let mut inner = self.inner.write();
        let record = inner.record_mut(id)?;
        if !record.status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: record.status.to_string(),
                to: "removed".to_string(),
            });
        }
        let record = inner
            .records
            .remove(id)
            .ok_or_else(|| Error::not_found(ENTITY, id))?;
        record.cancel.cancel();
        Ok(record.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSubscription;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn target(id: &str) -> String {
        format!("rtsp://localhost:8554/{id}")
    }

    #[test]
    fn test_create_starts_without_process() {
        let registry = StreamRegistry::new();
        let summary = registry.create("rtmp://host/a", target);

        assert_eq!(summary.status, StreamStatus::Starting);
        assert_eq!(summary.id.len(), 8);
        assert_eq!(summary.target_ref, target(&summary.id));
        assert_eq!(summary.pid, None);
        assert_eq!(registry.get(&summary.id).unwrap(), summary);
    }

    #[test]
    fn test_get_unknown() {
        let registry = StreamRegistry::new();
        assert!(registry.get("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_forward_transitions() {
        let registry = StreamRegistry::new();
        let id = registry.create("rtmp://host/a", target).id;

        let t = registry.set_status(&id, StreamStatus::Active, None).unwrap();
        assert_eq!((t.from, t.to), (StreamStatus::Starting, StreamStatus::Active));

        let t = registry
            .mark_stopped(&id, StopReason::UnexpectedExit, Some("Process exited (code 1)".into()))
            .unwrap();
        assert_eq!(t.to, StreamStatus::Stopped);

        let summary = registry.get(&id).unwrap();
        assert_eq!(summary.error.as_deref(), Some("Process exited (code 1)"));
        assert_eq!(summary.stop_reason, Some(StopReason::UnexpectedExit));
    }

    #[test]
    fn test_rejected_writes_leave_record_unchanged() {
        let registry = StreamRegistry::new();
        let id = registry.create("rtmp://host/a", target).id;
        registry.set_status(&id, StreamStatus::Active, None).unwrap();

        let err = registry.set_status(&id, StreamStatus::Starting, None).unwrap_err();
        assert!(err.is_conflict());
        let err = registry.set_status(&id, StreamStatus::Active, None).unwrap_err();
        assert!(err.is_conflict());

        registry
            .mark_stopped(&id, StopReason::Requested, None)
            .unwrap();
        let before = registry.get(&id).unwrap();

        let err = registry
            .mark_stopped(&id, StopReason::UnexpectedExit, Some("late".into()))
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(registry.get(&id).unwrap(), before);
    }

    #[test]
    fn test_stop_cancels_token_and_blocks_monitor_claim() {
        let registry = StreamRegistry::new();
        let id = registry.create("rtmp://host/a", target).id;

        let token = registry.claim_monitor(&id).unwrap();
        assert!(registry.claim_monitor(&id).unwrap_err().is_conflict());
        assert!(!token.is_cancelled());

        registry.mark_stopped(&id, StopReason::Requested, None).unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_clear_process_keeps_status() {
        let registry = StreamRegistry::new();
        let id = registry.create("rtmp://host/a", target).id;

        assert!(registry.clear_process(&id).unwrap().is_none());
        assert_eq!(registry.status(&id), Some(StreamStatus::Starting));
        assert!(registry.clear_process("missing").unwrap_err().is_not_found());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_attach_refused_once_stopped() {
        use crate::process::{CommandSpec, ProcessSpawner, TokioSpawner};
        use std::time::Duration;

        let registry = StreamRegistry::new();
        let id = registry.create("rtmp://host/a", target).id;
        let spawned = TokioSpawner
            .spawn(&CommandSpec::new("sh", "test").args(["-c", "sleep 30"]))
            .unwrap();

        registry.mark_stopped(&id, StopReason::Requested, None).unwrap();
        let err = registry
            .attach_process(&id, spawned.handle.clone())
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(registry.get(&id).unwrap().pid, None);

        spawned.handle.terminate(Duration::from_secs(2)).await;
    }

    #[test]
    fn test_claim_monitor_on_stopped_record() {
        let registry = StreamRegistry::new();
        let id = registry.create("rtmp://host/a", target).id;
        registry.mark_stopped(&id, StopReason::SpawnFailed, Some("boom".into())).unwrap();
        assert!(registry.claim_monitor(&id).is_err());
    }

    #[test]
    fn test_remove_only_stopped() {
        let registry = StreamRegistry::new();
        let id = registry.create("rtmp://host/a", target).id;

        assert!(registry.remove(&id).unwrap_err().is_conflict());
        registry.mark_stopped(&id, StopReason::Requested, None).unwrap();
        registry.remove(&id).unwrap();

        assert!(!registry.contains(&id));
        assert!(registry.is_empty());
        assert!(registry.remove(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_list_and_counts() {
        let registry = StreamRegistry::new();
        let a = registry.create("rtmp://host/a", target).id;
        let b = registry.create("rtmp://host/b", target).id;
        registry.set_status(&a, StreamStatus::Active, None).unwrap();

        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.count_with_status(StreamStatus::Active), 1);
        assert_eq!(registry.count_with_status(StreamStatus::Starting), 1);

        registry.mark_stopped(&b, StopReason::Requested, None).unwrap();
        assert_eq!(registry.running_ids(), vec![a]);
    }

    #[test]
    fn test_concurrent_stop_has_single_winner() {
        let registry = Arc::new(StreamRegistry::new());
        let id = registry.create("rtmp://host/a", target).id;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                let id = id.clone();
                thread::spawn(move || {
                    let reason = if i % 2 == 0 {
                        StopReason::Requested
                    } else {
                        StopReason::UnexpectedExit
                    };
                    registry.mark_stopped(&id, reason, None).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    fn published(sub: &mut EventSubscription) -> HashMap<String, Vec<StreamStatus>> {
        let mut seen: HashMap<String, Vec<StreamStatus>> = HashMap::new();
        for event in sub.drain() {
            if let SupervisorEvent::StreamUpdate { id, status, .. } = event {
                seen.entry(id).or_default().push(status);
            }
        }
        seen
    }

    #[test]
    fn test_accepted_writes_are_published() {
        let events = EventBus::new();
        let mut sub = events.subscribe();
        let registry = StreamRegistry::with_events(events);
        let id = registry.create("rtmp://host/a", target).id;

        registry.set_status(&id, StreamStatus::Active, None).unwrap();
        registry.set_status(&id, StreamStatus::Active, None).unwrap_err();
        registry
            .mark_stopped(&id, StopReason::RuntimeFailure, Some("boom".into()))
            .unwrap();
        registry.mark_stopped(&id, StopReason::Requested, None).unwrap_err();

        let updates = sub.drain();
        assert_eq!(
            updates,
            vec![
                SupervisorEvent::stream_update(&id, StreamStatus::Starting, None),
                SupervisorEvent::stream_update(&id, StreamStatus::Active, None),
                SupervisorEvent::stream_update(&id, StreamStatus::Stopped, Some("boom".into())),
            ]
        );
    }

    #[test]
    fn test_promotion_racing_stop_never_publishes_after_stopped() {
        let events = EventBus::with_capacity(4096);
        let mut sub = events.subscribe();
        let registry = Arc::new(StreamRegistry::with_events(events));
        let ids: Vec<String> = (0..300)
            .map(|_| registry.create("rtmp://host/a", target).id)
            .collect();

        let promoter = {
            let registry = registry.clone();
            let ids = ids.clone();
            thread::spawn(move || {
                for id in &ids {
                    let _ = registry.set_status(id, StreamStatus::Active, None);
                }
            })
        };
        let stopper = {
            let registry = registry.clone();
            let ids = ids.clone();
            thread::spawn(move || {
                for id in &ids {
                    let _ = registry.mark_stopped(id, StopReason::Requested, None);
                }
            })
        };
        promoter.join().unwrap();
        stopper.join().unwrap();

        let seen = published(&mut sub);
        let full = [StreamStatus::Starting, StreamStatus::Active, StreamStatus::Stopped];
        let skipped = [StreamStatus::Starting, StreamStatus::Stopped];
        for id in &ids {
            let history = seen[id].as_slice();
            assert!(history == full || history == skipped, "{id}: {history:?}");
        }
    }

    #[test]
    fn test_ids_unique_across_removals() {
        let registry = StreamRegistry::new();
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let id = registry.create("rtmp://host/a", target).id;
            assert!(seen.insert(id.clone()));
            registry.mark_stopped(&id, StopReason::Requested, None).unwrap();
            registry.remove(&id).unwrap();
        }
    }

    fn status_strategy() -> impl Strategy<Value = StreamStatus> {
        prop_oneof![
            Just(StreamStatus::Starting),
            Just(StreamStatus::Active),
            Just(StreamStatus::Stopped),
        ]
    }

    proptest! {
        #[test]
        fn prop_observed_history_is_legal(writes in proptest::collection::vec(status_strategy(), 0..16)) {
            let registry = StreamRegistry::new();
            let id = registry.create("rtmp://host/a", target).id;
            let mut history = vec![StreamStatus::Starting];

            for status in writes {
                if registry.set_status(&id, status, None).is_ok() {
                    history.push(registry.status(&id).unwrap());
                }
            }

            let full = [StreamStatus::Starting, StreamStatus::Active, StreamStatus::Stopped];
            let skipped = [StreamStatus::Starting, StreamStatus::Stopped];
            prop_assert!(full.starts_with(&history) || history == skipped);
        }
    }
}
