mod availability;
mod booking;
mod compaction;
mod conflict;
mod error;
pub mod interval;
mod preset;
mod queries;
mod template;

pub use error::SchedulerError;
pub use preset::{build_day_slots, Preset, PresetInfo, PresetRequest};

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::{BookingPolicy, SchedulerConfig};
use crate::directory::Directory;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSpecialistState = Arc<RwLock<SpecialistState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have before handling it.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!(events = batch.len(), "log flush failed: {e}");
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes of a failed batch
    // don't get attributed to the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Entity index ─────────────────────────────────────────

/// Reverse lookups maintained alongside the per-specialist state.
#[derive(Default)]
pub(super) struct EntityIndex {
    /// slot id / booking id → owning specialist
    owner: DashMap<Ulid, Ulid>,
    /// parent id → booking ids
    parent_bookings: DashMap<Ulid, Vec<Ulid>>,
}

impl EntityIndex {
    pub(super) fn owner_of(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.owner.get(entity_id).map(|e| *e.value())
    }

    pub(super) fn bookings_of_parent(&self, parent_id: &Ulid) -> Vec<Ulid> {
        self.parent_bookings
            .get(parent_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
    }

    fn add_booking(&self, booking: &Booking) {
        self.owner.insert(booking.id, booking.specialist_id);
        let mut ids = self.parent_bookings.entry(booking.parent_id).or_default();
        if !ids.contains(&booking.id) {
            ids.push(booking.id);
        }
    }
}

/// Apply a committed event to a specialist's state (caller holds the write lock).
fn apply_to_specialist(st: &mut SpecialistState, event: &Event, index: &EntityIndex) {
    match event {
        Event::SlotsCreated { slots, .. } => {
            for slot in slots {
                index.owner.insert(slot.id, st.id);
                st.insert_slot(slot.clone());
            }
        }
        Event::SlotDeleted { id, .. } => {
            st.remove_slot(*id);
            index.owner.remove(id);
        }
        Event::SlotOccupied { id, at, .. } => {
            if let Some(slot) = st.slot_mut(*id) {
                slot.occupy(*at);
            }
        }
        Event::SlotReleased { id, at, .. } => {
            if let Some(slot) = st.slot_mut(*id) {
                slot.release(*at);
            }
        }
        Event::TemplateReplaced { template } => {
            st.template = Some(template.clone());
        }
        Event::TemplateMaterialized { purged, slots, .. } => {
            for id in purged {
                st.remove_slot(*id);
                index.owner.remove(id);
            }
            for slot in slots {
                index.owner.insert(slot.id, st.id);
                st.insert_slot(slot.clone());
            }
        }
        Event::BookingCreated { booking } => {
            if let Some(slot_id) = booking.slot_id
                && let Some(slot) = st.slot_mut(slot_id)
            {
                slot.occupy(booking.created_at);
            }
            index.add_booking(booking);
            st.bookings.insert(booking.id, booking.clone());
        }
        Event::BookingTransitioned {
            id,
            to,
            released_slot,
            at,
            ..
        } => {
            if let Some(b) = st.bookings.get_mut(id) {
                b.status = *to;
                b.updated_at = *at;
            }
            if let Some(slot_id) = released_slot
                && let Some(slot) = st.slot_mut(*slot_id)
            {
                slot.release(*at);
            }
        }
        Event::BookingCompleted { id, outcome, at, .. } => {
            if let Some(b) = st.bookings.get_mut(id) {
                b.status = BookingStatus::Completed;
                b.outcome = Some(outcome.clone());
                b.updated_at = *at;
            }
        }
        Event::OutcomeAcknowledged { id, at, .. } => {
            if let Some(outcome) = st.bookings.get_mut(id).and_then(|b| b.outcome.as_mut()) {
                outcome.parent_acknowledged_at.get_or_insert(*at);
            }
        }
        Event::BookingRestored { booking } => {
            index.add_booking(booking);
            st.bookings.insert(booking.id, booking.clone());
        }
    }
}

// ── Transactions ─────────────────────────────────────────

/// Exclusive access to one specialist for a check-then-write sequence.
/// Holds the commit gate shared so compaction can't snapshot mid-commit.
pub(super) struct Txn {
    _gate: OwnedRwLockReadGuard<()>,
    pub(super) specialist_id: Ulid,
    state: OwnedRwLockWriteGuard<SpecialistState>,
}

impl Deref for Txn {
    type Target = SpecialistState;

    fn deref(&self) -> &SpecialistState {
        &self.state
    }
}

impl DerefMut for Txn {
    fn deref_mut(&mut self) -> &mut SpecialistState {
        &mut self.state
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedSpecialistState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) index: EntityIndex,
    /// Shared by every transaction, exclusive for compaction. Always taken
    /// before any specialist lock.
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) policy: BookingPolicy,
}

impl Engine {
    /// Replay the log at `wal_path` and start the group-commit writer.
    /// Must be called from within a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        directory: Arc<dyn Directory>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            index: EntityIndex::default(),
            commit_gate: Arc::new(RwLock::new(())),
            clock,
            directory,
            policy: BookingPolicy::default(),
        };

        // We're the sole owner of every Arc here, so try_write never contends.
        // blocking_write would panic inside the runtime.
        for event in &events {
            let rs = engine.specialist_or_insert(event.specialist_id());
            let mut guard = rs
                .try_write()
                .map_err(|_| io::Error::other("replay: specialist state locked"))?;
            apply_to_specialist(&mut guard, event, &engine.index);
        }

        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            specialists = engine.state.len(),
            "replayed scheduler log"
        );
        Ok(engine)
    }

    /// Build an engine from configuration, creating the data directory if needed.
    pub fn open(
        config: &SchedulerConfig,
        directory: Arc<dyn Directory>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let engine = Self::new(
            config.wal_path(),
            Arc::new(NotifyHub::new()),
            directory,
            clock,
        )?;
        Ok(engine.with_policy(config.policy))
    }

    pub fn with_policy(mut self, policy: BookingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> BookingPolicy {
        self.policy
    }

    pub(super) fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| SchedulerError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulerError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| SchedulerError::Storage(e.to_string()))
    }

    pub fn get_specialist(&self, id: &Ulid) -> Option<SharedSpecialistState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    fn specialist_or_insert(&self, id: Ulid) -> SharedSpecialistState {
        if let Some(rs) = self.get_specialist(&id) {
            return rs;
        }
        let rs = self
            .state
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(SpecialistState::new(id))))
            .value()
            .clone();
        metrics::gauge!(crate::observability::SPECIALISTS_ACTIVE).set(self.state.len() as f64);
        rs
    }

    /// Shared read access to one specialist; `None` if nothing was ever stored for them.
    pub(super) async fn read_specialist(
        &self,
        id: &Ulid,
    ) -> Option<OwnedRwLockReadGuard<SpecialistState>> {
        let rs = self.get_specialist(id)?;
        Some(rs.read_owned().await)
    }

    pub(super) async fn begin(&self, specialist_id: Ulid) -> Txn {
        let gate = self.commit_gate.clone().read_owned().await;
        let state = self.specialist_or_insert(specialist_id).write_owned().await;
        Txn {
            _gate: gate,
            specialist_id,
            state,
        }
    }

    /// Begin a transaction on whichever specialist owns `entity_id`.
    pub(super) async fn begin_for(
        &self,
        entity: &'static str,
        entity_id: Ulid,
    ) -> Result<Txn, SchedulerError> {
        let specialist_id = self
            .index
            .owner_of(&entity_id)
            .ok_or(SchedulerError::not_found(entity, entity_id))?;
        Ok(self.begin(specialist_id).await)
    }

    /// WAL-append + apply + notify. Nothing is applied if the append fails.
    pub(super) async fn commit(&self, txn: &mut Txn, event: Event) -> Result<(), SchedulerError> {
        self.wal_append(&event).await?;
        apply_to_specialist(&mut txn.state, &event, &self.index);
        self.notify.send(txn.specialist_id, &event);
        tracing::debug!(specialist = %txn.specialist_id, event = event.kind(), "committed");
        Ok(())
    }
}
