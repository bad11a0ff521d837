mod allocations;
mod bookings;
mod conflict;
mod error;
mod lifecycle;
mod payments;
mod queries;
mod resources;

pub use allocations::AllocationRequest;
pub use bookings::{BookingEdit, NewBooking};
pub use conflict::{Availability, ClaimCheck, Conflict, ConflictReason, availability, check_claims};
pub use error::EngineError;
pub use lifecycle::{Transition, can_edit, next_status};
pub use resources::{NewJeep, NewStaff};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::Clock;
use crate::limits::MAX_ACTOR_LEN;
use crate::model::*;
use crate::notify::{Notification, Notifier};
use crate::payment::{CardParityDecider, PaymentDecider};
use crate::wal::Wal;

pub type SharedBookingState = Arc<RwLock<BookingState>>;
pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
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

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first Append, drains whatever else is already queued, then
/// does a single fsync for the batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Flush what we have before compacting or reporting counts
                    deferred = Some(other);
                    break;
                }
            }
        }

        flush_and_respond(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-buffered bytes don't leak into
    // the next batch; every caller in this one is told it failed.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── Row application ──────────────────────────────────────

/// Apply an event to a booking row (no locking, caller holds the lock).
fn apply_to_booking(bs: &mut BookingState, event: &Event) {
    match event {
        Event::BookingEdited {
            package_id,
            requested_at,
            total_amount,
            notes,
            version,
            at,
            actor,
            ..
        } => {
            let b = &mut bs.booking;
            b.package_id = *package_id;
            b.requested_at = *requested_at;
            b.total_amount = *total_amount;
            b.notes = notes.clone();
            b.version = *version;
            b.audit.touch(*at, actor);
        }
        Event::BookingStatusChanged { status, at, actor, .. } => {
            bs.booking.status = *status;
            bs.booking.audit.touch(*at, actor);
        }
        Event::BookingWindowsChanged {
            edit_window_secs,
            payment_window_secs,
            at,
            actor,
            ..
        } => {
            bs.booking.edit_window_secs = *edit_window_secs;
            bs.booking.payment_window_secs = *payment_window_secs;
            bs.booking.audit.touch(*at, actor);
        }
        Event::BookingCancelled {
            released,
            expired_payment,
            at,
            actor,
            ..
        } => {
            bs.booking.status = BookingStatus::Cancelled;
            bs.booking.audit.touch(*at, actor);
            end_booking_rows(bs, released.map(|(id, _)| id), *expired_payment, *at, actor);
        }
        Event::BookingExpired {
            payment_id,
            released,
            at,
            ..
        } => {
            bs.booking.status = BookingStatus::Expired;
            bs.booking.audit.touch(*at, SYSTEM_ACTOR);
            end_booking_rows(bs, released.map(|(id, _)| id), *payment_id, *at, SYSTEM_ACTOR);
        }
        Event::AllocationCreated { allocation } => {
            bs.booking.status = BookingStatus::Allocated;
            bs.booking
                .audit
                .touch(allocation.audit.created_at, &allocation.audit.created_by);
            bs.allocations.push(allocation.clone());
        }
        Event::AllocationUpdated {
            id,
            resources,
            notes,
            at,
            actor,
            ..
        } => {
            if let Some(alloc) = bs.allocation_mut(*id) {
                alloc.resources = *resources;
                alloc.notes = notes.clone();
                alloc.audit.touch(*at, actor);
            }
        }
        Event::AllocationCancelled { id, at, actor, .. } => {
            if let Some(alloc) = bs.allocation_mut(*id) {
                alloc.status = AllocationStatus::Cancelled;
                alloc.audit.touch(*at, actor);
            }
            bs.booking.status = BookingStatus::ForwardedToCrew;
            bs.booking.audit.touch(*at, actor);
        }
        Event::PaymentRecorded {
            payment,
            booking_status,
            at,
            actor,
        } => {
            bs.upsert_payment(payment.clone());
            if bs.booking.status != *booking_status {
                bs.booking.status = *booking_status;
                bs.booking.audit.touch(*at, actor);
            }
        }
        // Row creation is handled at the DashMap level, not here
        Event::BookingCreated { .. }
        | Event::BookingSnapshot { .. }
        | Event::ResourceRegistered { .. }
        | Event::JeepStatusChanged { .. }
        | Event::DefaultDriverSet { .. } => {}
    }
}

/// Cancel the released allocation and expire the pending payment, if any.
fn end_booking_rows(
    bs: &mut BookingState,
    allocation: Option<Ulid>,
    payment: Option<Ulid>,
    at: Ms,
    actor: &str,
) {
    if let Some(alloc) = allocation.and_then(|id| bs.allocation_mut(id)) {
        alloc.status = AllocationStatus::Cancelled;
        alloc.audit.touch(at, actor);
    }
    if let Some(p) = payment.and_then(|id| bs.payment_mut(id)) {
        p.status = PaymentStatus::Expired;
        p.updated_at = at;
    }
}

/// Apply an event to a resource row (no locking, caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event) {
    match event {
        Event::JeepStatusChanged { status, .. } => {
            if let Some(jeep) = rs.jeep.as_mut() {
                jeep.status = *status;
            }
        }
        Event::DefaultDriverSet { driver_id, .. } => {
            if let Some(jeep) = rs.jeep.as_mut() {
                jeep.default_driver = *driver_id;
            }
        }
        Event::AllocationCreated { allocation } => {
            if allocation.resources.contains(rs.id) {
                rs.claim(allocation.id);
            }
        }
        Event::AllocationUpdated {
            id,
            previous,
            resources,
            ..
        } => {
            // A slot kept across the update keeps its claim and jeep status
            match (previous.contains(rs.id), resources.contains(rs.id)) {
                (true, false) => rs.release(*id),
                (false, true) => rs.claim(*id),
                _ => {}
            }
        }
        Event::AllocationCancelled { id, released, .. } => {
            if released.contains(rs.id) {
                rs.release(*id);
            }
        }
        Event::BookingCancelled { released, .. } | Event::BookingExpired { released, .. } => {
            if let Some((alloc, set)) = released
                && set.contains(rs.id)
            {
                rs.release(*alloc);
            }
        }
        Event::ResourceRegistered { .. }
        | Event::BookingCreated { .. }
        | Event::BookingEdited { .. }
        | Event::BookingStatusChanged { .. }
        | Event::BookingWindowsChanged { .. }
        | Event::PaymentRecorded { .. }
        | Event::BookingSnapshot { .. } => {}
    }
}

fn count_event(event: &Event) {
    metrics::counter!(
        crate::observability::TRANSITIONS_TOTAL,
        "event" => crate::observability::event_label(event)
    )
    .increment(1);
}

/// Audit identity for transitions nobody asked for (sweeper, compaction).
pub const SYSTEM_ACTOR: &str = "system";

// ── Locked resource rows ─────────────────────────────────

/// Write guards over a set of resource rows, acquired in ascending id order.
#[derive(Default)]
pub(crate) struct LockedResources {
    guards: Vec<OwnedRwLockWriteGuard<ResourceState>>,
}

impl LockedResources {
    pub(crate) fn get(&self, id: Ulid) -> Option<&ResourceState> {
        self.guards.iter().find(|g| g.id == id).map(|g| &**g)
    }

    fn get_mut(&mut self, id: Ulid) -> Option<&mut ResourceState> {
        self.guards.iter_mut().find(|g| g.id == id).map(|g| &mut **g)
    }
}

pub struct Engine {
    pub bookings: DashMap<Ulid, SharedBookingState>,
    pub resources: DashMap<Ulid, SharedResourceState>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    decider: Arc<dyn PaymentDecider>,
    default_edit_window_secs: u32,
    default_payment_window_secs: u32,
    /// Reverse lookup: allocation/payment id → booking id
    entity_to_booking: DashMap<Ulid, Ulid>,
    /// Normalized plate → jeep id
    plates: DashMap<String, Ulid>,
    /// Transaction reference → payment id
    tx_refs: DashMap<String, Ulid>,
    /// Held shared while a new row is inserted and logged, exclusively while
    /// a compaction snapshot is taken.
    row_gate: RwLock<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            bookings: DashMap::new(),
            resources: DashMap::new(),
            wal_tx,
            notify,
            clock,
            decider: Arc::new(CardParityDecider::default()),
            default_edit_window_secs: DEFAULT_EDIT_WINDOW_SECS,
            default_payment_window_secs: DEFAULT_PAYMENT_WINDOW_SECS,
            entity_to_booking: DashMap::new(),
            plates: DashMap::new(),
            tx_refs: DashMap::new(),
            row_gate: RwLock::new(()),
        };

        // We're the sole owner of every row here, so try_write always succeeds.
        // Never use blocking_write: this runs inside the runtime.
        for event in &events {
            match event {
                Event::ResourceRegistered { resource, .. } => {
                    engine
                        .resources
                        .insert(resource.id, Arc::new(RwLock::new(resource.clone())));
                }
                Event::BookingCreated { booking } => {
                    let bs = BookingState::new(booking.clone());
                    engine.bookings.insert(booking.id, Arc::new(RwLock::new(bs)));
                }
                Event::BookingSnapshot { state } => {
                    engine
                        .bookings
                        .insert(state.booking.id, Arc::new(RwLock::new(state.clone())));
                }
                other => {
                    if let Some(row) = other.booking_id().and_then(|id| engine.booking_row(&id))
                        && let Ok(mut guard) = row.try_write()
                    {
                        apply_to_booking(&mut guard, other);
                    }
                    for rid in other.resource_ids() {
                        if let Some(row) = engine.resource_row(&rid)
                            && let Ok(mut guard) = row.try_write()
                        {
                            apply_to_resource(&mut guard, other);
                        }
                    }
                }
            }
            engine.index_event(event);
        }

        if !events.is_empty() {
            tracing::info!(
                "replayed {} WAL events: {} bookings, {} resources",
                events.len(),
                engine.bookings.len(),
                engine.resources.len()
            );
        }
        Ok(engine)
    }

    /// Swap the payment outcome function (default: `CardParityDecider`).
    pub fn with_decider(mut self, decider: Arc<dyn PaymentDecider>) -> Self {
        self.decider = decider;
        self
    }

    /// Windows stamped on bookings created from now on.
    pub fn with_default_windows(mut self, edit_window_secs: u32, payment_window_secs: u32) -> Self {
        self.default_edit_window_secs = edit_window_secs;
        self.default_payment_window_secs = payment_window_secs;
        self
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Keep the lookup maps in step with committed events.
    fn index_event(&self, event: &Event) {
        match event {
            Event::ResourceRegistered { resource, .. } => {
                if let Some(jeep) = &resource.jeep {
                    self.plates.insert(normalize_plate(&jeep.plate), resource.id);
                }
            }
            Event::AllocationCreated { allocation } => {
                self.entity_to_booking
                    .insert(allocation.id, allocation.booking_id);
            }
            Event::PaymentRecorded { payment, .. } => {
                self.entity_to_booking.insert(payment.id, payment.booking_id);
                self.tx_refs.entry(payment.tx_ref.clone()).or_insert(payment.id);
            }
            Event::BookingSnapshot { state } => {
                let bid = state.booking.id;
                for alloc in &state.allocations {
                    self.entity_to_booking.insert(alloc.id, bid);
                }
                for p in &state.payments {
                    self.entity_to_booking.insert(p.id, bid);
                    self.tx_refs.entry(p.tx_ref.clone()).or_insert(p.id);
                }
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, then apply to every locked row the event touches.
    async fn commit(
        &self,
        booking: Option<&mut BookingState>,
        resources: &mut LockedResources,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.index_event(event);
        if let Some(bs) = booking {
            apply_to_booking(bs, event);
        }
        for rid in event.resource_ids() {
            if let Some(rs) = resources.get_mut(rid) {
                apply_to_resource(rs, event);
            }
        }
        count_event(event);
        Ok(())
    }

    async fn commit_booking(&self, bs: &mut BookingState, event: &Event) -> Result<(), EngineError> {
        self.commit(Some(bs), &mut LockedResources::default(), event)
            .await
    }

    /// Hand notifications to the notifier. A refusal is logged and counted; the
    /// transition it reports stays committed.
    pub(crate) fn deliver(&self, notifications: impl IntoIterator<Item = Notification>) {
        for n in notifications {
            let title = n.title.clone();
            if let Err(e) = self.notify.notify(n) {
                tracing::warn!("notification '{title}' not delivered: {e}");
                metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL).increment(1);
            }
        }
    }

    pub(crate) fn booking_row(&self, id: &Ulid) -> Option<SharedBookingState> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn resource_row(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn booking_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_booking.get(entity_id).map(|e| *e.value())
    }

    async fn lock_booking(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<BookingState>, EngineError> {
        let row = self.booking_row(id).ok_or(EngineError::NotFound(*id))?;
        Ok(row.write_owned().await)
    }

    /// Allocation or payment id → its booking's write guard.
    async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<BookingState>, EngineError> {
        let booking_id = self
            .booking_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.lock_booking(&booking_id).await
    }

    /// Acquire write locks in sorted order to prevent deadlocks. Callers that
    /// also lock a booking take it first.
    async fn lock_resources(
        &self,
        ids: impl IntoIterator<Item = Ulid>,
    ) -> Result<LockedResources, EngineError> {
        let mut ids: Vec<Ulid> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let row = self.resource_row(&id).ok_or(EngineError::NotFound(id))?;
            guards.push(row.write_owned().await);
        }
        Ok(LockedResources { guards })
    }

    /// Rewrite the WAL as a snapshot of current state.
    ///
    /// Holds the row gate and a read lock on every row until the writer has
    /// swapped files, so no commit can land in the old log after the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.row_gate.write().await;
        let now = self.now();

        let mut booking_ids: Vec<Ulid> = self.bookings.iter().map(|e| *e.key()).collect();
        booking_ids.sort();
        let mut resource_ids: Vec<Ulid> = self.resources.iter().map(|e| *e.key()).collect();
        resource_ids.sort();

        let mut booking_guards = Vec::with_capacity(booking_ids.len());
        for id in &booking_ids {
            if let Some(row) = self.booking_row(id) {
                booking_guards.push(row.read_owned().await);
            }
        }
        let mut resource_guards = Vec::with_capacity(resource_ids.len());
        for id in &resource_ids {
            if let Some(row) = self.resource_row(id) {
                resource_guards.push(row.read_owned().await);
            }
        }

        let mut events = Vec::with_capacity(booking_guards.len() + resource_guards.len());
        for rs in &resource_guards {
            events.push(Event::ResourceRegistered {
                resource: (**rs).clone(),
                at: now,
                actor: SYSTEM_ACTOR.to_string(),
            });
        }
        for bs in &booking_guards {
            events.push(Event::BookingSnapshot {
                state: (**bs).clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

// ── Input validation ─────────────────────────────────────

fn check_actor(actor: &str) -> Result<(), EngineError> {
    if actor.len() > MAX_ACTOR_LEN {
        return Err(EngineError::LimitExceeded("actor too long"));
    }
    Ok(())
}

fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn check_window(secs: u32) -> Result<(), EngineError> {
    if secs > crate::limits::MAX_WINDOW_SECS {
        return Err(EngineError::LimitExceeded("window too long"));
    }
    Ok(())
}

/// Uppercase with runs of whitespace collapsed to one space.
pub(crate) fn normalize_plate(plate: &str) -> String {
    plate
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}
