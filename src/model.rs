use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Money in minor currency units.
pub type Cents = i64;

pub const SECOND_MS: Ms = 1_000;
pub const MINUTE_MS: Ms = 60 * SECOND_MS;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

pub const DEFAULT_EDIT_WINDOW_SECS: u32 = 10;
pub const DEFAULT_PAYMENT_WINDOW_SECS: u32 = 20;
pub const DEFAULT_PAYMENT_METHOD: &str = "MOCK_PAYMENT";

// ── Status enums ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Requested,
    ForwardedToCrew,
    Allocated,
    ConfirmationSent,
    PendingPayment,
    Confirmed,
    Cancelled,
    Expired,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 8] = [
        BookingStatus::Requested,
        BookingStatus::ForwardedToCrew,
        BookingStatus::Allocated,
        BookingStatus::ConfirmationSent,
        BookingStatus::PendingPayment,
        BookingStatus::Confirmed,
        BookingStatus::Cancelled,
        BookingStatus::Expired,
    ];

    /// Confirmed, cancelled and expired bookings accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Confirmed | BookingStatus::Cancelled | BookingStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Requested => "REQUESTED",
            BookingStatus::ForwardedToCrew => "FORWARDED_TO_CREW",
            BookingStatus::Allocated => "ALLOCATED",
            BookingStatus::ConfirmationSent => "CONFIRMATION_SENT",
            BookingStatus::PendingPayment => "PENDING_PAYMENT",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStatus {
    Active,
    Cancelled,
}

impl AllocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStatus::Active => "ACTIVE",
            AllocationStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Expired => "EXPIRED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JeepStatus {
    Available,
    InUse,
    Allocated,
    Maintenance,
    UnderRepair,
    OutOfService,
}

impl JeepStatus {
    /// Statuses set by maintenance staff. They survive an allocation release.
    pub fn is_maintenance(self) -> bool {
        matches!(
            self,
            JeepStatus::Maintenance | JeepStatus::UnderRepair | JeepStatus::OutOfService
        )
    }

    /// Status a jeep falls back to once its allocation lets go of it.
    pub fn after_release(self) -> JeepStatus {
        if self.is_maintenance() {
            self
        } else {
            JeepStatus::Available
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JeepStatus::Available => "AVAILABLE",
            JeepStatus::InUse => "IN_USE",
            JeepStatus::Allocated => "ALLOCATED",
            JeepStatus::Maintenance => "MAINTENANCE",
            JeepStatus::UnderRepair => "UNDER_REPAIR",
            JeepStatus::OutOfService => "OUT_OF_SERVICE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Driver,
    Guide,
    Jeep,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Driver => "driver",
            ResourceKind::Guide => "guide",
            ResourceKind::Jeep => "jeep",
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────

/// Who touched a row last, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    pub created_at: Ms,
    pub updated_at: Ms,
    pub created_by: String,
    pub updated_by: String,
}

impl Audit {
    pub fn new(at: Ms, actor: &str) -> Self {
        Self {
            created_at: at,
            updated_at: at,
            created_by: actor.to_string(),
            updated_by: actor.to_string(),
        }
    }

    pub fn touch(&mut self, at: Ms, actor: &str) {
        self.updated_at = at;
        self.updated_by = actor.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub tourist_id: Ulid,
    pub package_id: Ulid,
    /// Requested trip start.
    pub requested_at: Ms,
    pub status: BookingStatus,
    pub edit_window_secs: u32,
    pub payment_window_secs: u32,
    /// Bumped only by tourist edits. Starts at 1.
    pub version: u32,
    pub total_amount: Cents,
    pub notes: Option<String>,
    pub audit: Audit,
}

impl Booking {
    /// Instant at which the tourist loses the right to edit or cancel.
    pub fn edit_window_expires(&self) -> Ms {
        self.audit.created_at + Ms::from(self.edit_window_secs) * SECOND_MS
    }

    pub fn payment_window_ms(&self) -> Ms {
        Ms::from(self.payment_window_secs) * SECOND_MS
    }
}

/// The driver/guide/jeep triple an allocation holds. Each slot is optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSet {
    pub driver_id: Option<Ulid>,
    pub guide_id: Option<Ulid>,
    pub jeep_id: Option<Ulid>,
}

impl ResourceSet {
    pub fn is_empty(&self) -> bool {
        self.driver_id.is_none() && self.guide_id.is_none() && self.jeep_id.is_none()
    }

    /// `(kind, id)` for every filled slot.
    pub fn entries(&self) -> impl Iterator<Item = (ResourceKind, Ulid)> + '_ {
        [
            (ResourceKind::Driver, self.driver_id),
            (ResourceKind::Guide, self.guide_id),
            (ResourceKind::Jeep, self.jeep_id),
        ]
        .into_iter()
        .filter_map(|(kind, id)| id.map(|id| (kind, id)))
    }

    pub fn ids(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.entries().map(|(_, id)| id)
    }

    pub fn contains(&self, id: Ulid) -> bool {
        self.ids().any(|r| r == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub resources: ResourceSet,
    pub status: AllocationStatus,
    pub notes: Option<String>,
    pub audit: Audit,
}

impl Allocation {
    pub fn is_active(&self) -> bool {
        self.status == AllocationStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub amount: Cents,
    pub method: String,
    pub status: PaymentStatus,
    pub tx_ref: String,
    pub paid_at: Option<Ms>,
    pub expires_at: Ms,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Payment {
    pub fn is_pending(&self) -> bool {
        self.status == PaymentStatus::Pending
    }

    /// A pending payment whose window has run out, as of `now`.
    pub fn is_overdue(&self, now: Ms) -> bool {
        self.is_pending() && now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JeepDetails {
    pub plate: String,
    pub capacity: u32,
    pub status: JeepStatus,
    pub default_driver: Option<Ulid>,
}

/// A driver, guide or jeep: anything an allocation can hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: Ulid,
    pub kind: ResourceKind,
    /// Staff full name, or jeep model.
    pub name: String,
    pub phone: Option<String>,
    /// Only set for jeeps.
    pub jeep: Option<JeepDetails>,
    /// The ACTIVE allocation currently holding this resource.
    pub claimed_by: Option<Ulid>,
}

impl ResourceState {
    pub fn jeep_status(&self) -> Option<JeepStatus> {
        self.jeep.as_ref().map(|j| j.status)
    }

    pub(crate) fn claim(&mut self, allocation_id: Ulid) {
        self.claimed_by = Some(allocation_id);
        if let Some(jeep) = self.jeep.as_mut() {
            jeep.status = JeepStatus::Allocated;
        }
    }

    pub(crate) fn release(&mut self, allocation_id: Ulid) {
        if self.claimed_by != Some(allocation_id) {
            return;
        }
        self.claimed_by = None;
        if let Some(jeep) = self.jeep.as_mut() {
            jeep.status = jeep.status.after_release();
        }
    }
}

/// A booking together with the rows that hang off it. One lock covers all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingState {
    pub booking: Booking,
    /// Every allocation ever made for this booking; at most one is ACTIVE.
    pub allocations: Vec<Allocation>,
    /// Payment attempts in creation order.
    pub payments: Vec<Payment>,
}

impl BookingState {
    pub fn new(booking: Booking) -> Self {
        Self {
            booking,
            allocations: Vec::new(),
            payments: Vec::new(),
        }
    }

    pub fn active_allocation(&self) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.is_active())
    }

    pub fn allocation(&self, id: Ulid) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.id == id)
    }

    pub fn allocation_mut(&mut self, id: Ulid) -> Option<&mut Allocation> {
        self.allocations.iter_mut().find(|a| a.id == id)
    }

    pub fn payment(&self, id: Ulid) -> Option<&Payment> {
        self.payments.iter().find(|p| p.id == id)
    }

    pub fn payment_mut(&mut self, id: Ulid) -> Option<&mut Payment> {
        self.payments.iter_mut().find(|p| p.id == id)
    }

    /// The PENDING or SUCCESS payment, if any. At most one exists.
    pub fn live_payment(&self) -> Option<&Payment> {
        self.payments
            .iter()
            .find(|p| matches!(p.status, PaymentStatus::Pending | PaymentStatus::Success))
    }

    pub fn latest_payment(&self) -> Option<&Payment> {
        self.payments.last()
    }

    /// Insert or replace a payment row by id.
    pub(crate) fn upsert_payment(&mut self, payment: Payment) {
        match self.payment_mut(payment.id) {
            Some(existing) => *existing = payment,
            None => self.payments.push(payment),
        }
    }
}

// ── WAL record format ────────────────────────────────────────────

/// One record per committed transition. Every row a transition touches is
/// described by a single event, so replay never sees half of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        resource: ResourceState,
        at: Ms,
        actor: String,
    },
    JeepStatusChanged {
        id: Ulid,
        status: JeepStatus,
    },
    DefaultDriverSet {
        jeep_id: Ulid,
        driver_id: Option<Ulid>,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingEdited {
        id: Ulid,
        package_id: Ulid,
        requested_at: Ms,
        total_amount: Cents,
        notes: Option<String>,
        version: u32,
        at: Ms,
        actor: String,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
        at: Ms,
        actor: String,
    },
    BookingWindowsChanged {
        id: Ulid,
        edit_window_secs: u32,
        payment_window_secs: u32,
        at: Ms,
        actor: String,
    },
    /// Booking cancelled by the tourist; any held resources and pending payment
    /// are released in the same record.
    BookingCancelled {
        id: Ulid,
        released: Option<(Ulid, ResourceSet)>,
        expired_payment: Option<Ulid>,
        at: Ms,
        actor: String,
    },
    AllocationCreated {
        allocation: Allocation,
    },
    AllocationUpdated {
        id: Ulid,
        booking_id: Ulid,
        previous: ResourceSet,
        resources: ResourceSet,
        notes: Option<String>,
        at: Ms,
        actor: String,
    },
    AllocationCancelled {
        id: Ulid,
        booking_id: Ulid,
        released: ResourceSet,
        at: Ms,
        actor: String,
    },
    /// Payment row written (created, reused, or settled) together with the
    /// booking status it leaves behind.
    PaymentRecorded {
        payment: Payment,
        booking_status: BookingStatus,
        at: Ms,
        actor: String,
    },
    /// Booking timed out. `payment_id` is the payment that expired with it, if any.
    BookingExpired {
        id: Ulid,
        payment_id: Option<Ulid>,
        released: Option<(Ulid, ResourceSet)>,
        at: Ms,
    },
    /// Compaction snapshot of a booking row and everything hanging off it.
    BookingSnapshot {
        state: BookingState,
    },
}

impl Event {
    /// The booking this event mutates, if any.
    pub fn booking_id(&self) -> Option<Ulid> {
        match self {
            Event::BookingCreated { booking } => Some(booking.id),
            Event::BookingEdited { id, .. }
            | Event::BookingStatusChanged { id, .. }
            | Event::BookingWindowsChanged { id, .. }
            | Event::BookingCancelled { id, .. }
            | Event::BookingExpired { id, .. } => Some(*id),
            Event::AllocationCreated { allocation } => Some(allocation.booking_id),
            Event::AllocationUpdated { booking_id, .. }
            | Event::AllocationCancelled { booking_id, .. } => Some(*booking_id),
            Event::PaymentRecorded { payment, .. } => Some(payment.booking_id),
            Event::BookingSnapshot { state } => Some(state.booking.id),
            Event::ResourceRegistered { .. }
            | Event::JeepStatusChanged { .. }
            | Event::DefaultDriverSet { .. } => None,
        }
    }

    /// Resource rows this event mutates (claims, releases, status changes).
    pub fn resource_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = match self {
            Event::JeepStatusChanged { id, .. } => vec![*id],
            Event::DefaultDriverSet { jeep_id, .. } => vec![*jeep_id],
            Event::AllocationCreated { allocation } => allocation.resources.ids().collect(),
            Event::AllocationUpdated {
                previous,
                resources,
                ..
            } => previous.ids().chain(resources.ids()).collect(),
            Event::AllocationCancelled { released, .. } => released.ids().collect(),
            Event::BookingCancelled { released, .. } | Event::BookingExpired { released, .. } => {
                released
                    .as_ref()
                    .map(|(_, set)| set.ids().collect())
                    .unwrap_or_default()
            }
            Event::ResourceRegistered { .. }
            | Event::BookingCreated { .. }
            | Event::BookingEdited { .. }
            | Event::BookingStatusChanged { .. }
            | Event::BookingWindowsChanged { .. }
            | Event::PaymentRecorded { .. }
            | Event::BookingSnapshot { .. } => Vec::new(),
        };
        ids.sort();
        ids.dedup();
        ids
    }
}

// ── Query result types ───────────────────────────────────────────

/// Booking projection with the edit-window fields computed at read time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingView {
    pub booking: Booking,
    pub can_edit: bool,
    pub edit_window_expires: Ms,
    pub allocation_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JeepInfo {
    pub id: Ulid,
    pub model: String,
    pub plate: String,
    pub capacity: u32,
    pub status: JeepStatus,
    pub default_driver: Option<Ulid>,
    pub claimed_by: Option<Ulid>,
}

/// Payment projection; `is_expired` flags a pending row whose window elapsed
/// but which the sweeper has not reached yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentView {
    pub payment: Payment,
    pub is_expired: bool,
}

/// Once-a-day snapshot of where things stand. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailyReport {
    pub generated_at: Ms,
    pub bookings_by_status: std::collections::BTreeMap<&'static str, usize>,
    pub successful_payments: usize,
    pub active_allocations: usize,
}
