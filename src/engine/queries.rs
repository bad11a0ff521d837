use ulid::Ulid;

use crate::model::*;

use super::lifecycle::can_edit;
use super::payments::is_abandoned;
use super::{Engine, EngineError, SharedBookingState, SharedResourceState};

fn booking_view(bs: &BookingState, now: Ms) -> BookingView {
    BookingView {
        booking: bs.booking.clone(),
        can_edit: can_edit(&bs.booking, now),
        edit_window_expires: bs.booking.edit_window_expires(),
        allocation_id: bs.active_allocation().map(|a| a.id),
    }
}

fn jeep_info(rs: &ResourceState) -> Option<JeepInfo> {
    let jeep = rs.jeep.as_ref()?;
    Some(JeepInfo {
        id: rs.id,
        model: rs.name.clone(),
        plate: jeep.plate.clone(),
        capacity: jeep.capacity,
        status: jeep.status,
        default_driver: jeep.default_driver,
        claimed_by: rs.claimed_by,
    })
}

fn payment_view(p: &Payment, now: Ms) -> PaymentView {
    PaymentView {
        payment: p.clone(),
        is_expired: p.is_overdue(now),
    }
}

impl Engine {
    /// Snapshot of the row handles. DashMap refs are never held across an await.
    fn booking_rows(&self) -> Vec<SharedBookingState> {
        let mut rows: Vec<(Ulid, SharedBookingState)> = self
            .bookings
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        rows.into_iter().map(|(_, row)| row).collect()
    }

    fn resource_rows(&self) -> Vec<SharedResourceState> {
        let mut rows: Vec<(Ulid, SharedResourceState)> = self
            .resources
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// Visit every booking row under a read lock, oldest first.
    async fn scan_bookings<T>(&self, mut f: impl FnMut(&BookingState) -> Option<T>) -> Vec<T> {
        let mut out = Vec::new();
        for row in self.booking_rows() {
            let guard = row.read().await;
            if let Some(item) = f(&guard) {
                out.push(item);
            }
        }
        out
    }

    async fn scan_allocations(&self, pred: impl Fn(&Allocation) -> bool) -> Vec<Allocation> {
        let mut out = Vec::new();
        for row in self.booking_rows() {
            let guard = row.read().await;
            out.extend(guard.allocations.iter().filter(|a| pred(a)).cloned());
        }
        out
    }

    // ── Bookings ─────────────────────────────────────────

    pub async fn get_booking(&self, id: Ulid) -> Result<BookingView, EngineError> {
        let row = self.booking_row(&id).ok_or(EngineError::NotFound(id))?;
        let guard = row.read().await;
        Ok(booking_view(&guard, self.now()))
    }

    pub async fn list_bookings(&self) -> Vec<BookingView> {
        let now = self.now();
        self.scan_bookings(|bs| Some(booking_view(bs, now))).await
    }

    pub async fn bookings_by_status(&self, status: BookingStatus) -> Vec<BookingView> {
        let now = self.now();
        self.scan_bookings(|bs| (bs.booking.status == status).then(|| booking_view(bs, now)))
            .await
    }

    pub async fn bookings_by_tourist(&self, tourist_id: Ulid) -> Vec<BookingView> {
        let now = self.now();
        self.scan_bookings(|bs| (bs.booking.tourist_id == tourist_id).then(|| booking_view(bs, now)))
            .await
    }

    // ── Resources ────────────────────────────────────────

    pub async fn get_resource(&self, id: Ulid) -> Result<ResourceState, EngineError> {
        let row = self.resource_row(&id).ok_or(EngineError::NotFound(id))?;
        let guard = row.read().await;
        Ok(guard.clone())
    }

    pub async fn get_jeep(&self, id: Ulid) -> Result<JeepInfo, EngineError> {
        let row = self.resource_row(&id).ok_or(EngineError::NotFound(id))?;
        let guard = row.read().await;
        jeep_info(&guard).ok_or(EngineError::NotFound(id))
    }

    pub async fn list_jeeps(&self) -> Vec<JeepInfo> {
        let mut out = Vec::new();
        for row in self.resource_rows() {
            if let Some(info) = jeep_info(&*row.read().await) {
                out.push(info);
            }
        }
        out
    }

    /// Jeeps that `create_allocation` would accept right now.
    pub async fn available_jeeps(&self) -> Vec<JeepInfo> {
        self.list_jeeps()
            .await
            .into_iter()
            .filter(|j| j.status == JeepStatus::Available && j.claimed_by.is_none())
            .collect()
    }

    // ── Allocations ──────────────────────────────────────

    pub async fn get_allocation(&self, id: Ulid) -> Result<Allocation, EngineError> {
        let booking_id = self.booking_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let row = self
            .booking_row(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = row.read().await;
        guard.allocation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// The booking's ACTIVE allocation, if it has one.
    pub async fn allocation_for_booking(
        &self,
        booking_id: Ulid,
    ) -> Result<Option<Allocation>, EngineError> {
        let row = self
            .booking_row(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = row.read().await;
        Ok(guard.active_allocation().cloned())
    }

    pub async fn allocations_by_driver(&self, driver_id: Ulid) -> Vec<Allocation> {
        self.scan_allocations(|a| a.resources.driver_id == Some(driver_id))
            .await
    }

    pub async fn allocations_by_guide(&self, guide_id: Ulid) -> Vec<Allocation> {
        self.scan_allocations(|a| a.resources.guide_id == Some(guide_id))
            .await
    }

    pub async fn allocations_by_jeep(&self, jeep_id: Ulid) -> Vec<Allocation> {
        self.scan_allocations(|a| a.resources.jeep_id == Some(jeep_id))
            .await
    }

    pub async fn list_allocations(&self) -> Vec<Allocation> {
        self.scan_allocations(|_| true).await
    }

    pub async fn active_allocations(&self) -> Vec<Allocation> {
        self.scan_allocations(Allocation::is_active).await
    }

    // ── Payments ─────────────────────────────────────────

    pub async fn get_payment(&self, id: Ulid) -> Result<PaymentView, EngineError> {
        let booking_id = self.booking_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let row = self
            .booking_row(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = row.read().await;
        guard
            .payment(id)
            .map(|p| payment_view(p, self.now()))
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn payments_by_booking(&self, booking_id: Ulid) -> Result<Vec<PaymentView>, EngineError> {
        let row = self
            .booking_row(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = row.read().await;
        let now = self.now();
        Ok(guard.payments.iter().map(|p| payment_view(p, now)).collect())
    }

    pub async fn payment_by_tx_ref(&self, tx_ref: &str) -> Option<PaymentView> {
        let payment_id = self.tx_refs.get(tx_ref).map(|e| *e.value())?;
        self.get_payment(payment_id).await.ok()
    }

    pub async fn pending_payments(&self) -> Vec<PaymentView> {
        let now = self.now();
        self.scan_bookings(|bs| {
            Some(
                bs.payments
                    .iter()
                    .filter(|p| p.is_pending())
                    .map(|p| payment_view(p, now))
                    .collect::<Vec<_>>(),
            )
        })
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    // ── Sweeper inputs ───────────────────────────────────

    /// PENDING payments whose window has closed as of `now`.
    pub async fn collect_overdue_payments(&self, now: Ms) -> Vec<Ulid> {
        self.scan_bookings(|bs| {
            Some(
                bs.payments
                    .iter()
                    .filter(|p| p.is_overdue(now))
                    .map(|p| p.id)
                    .collect::<Vec<_>>(),
            )
        })
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    /// PENDING_PAYMENT bookings left with nothing but failed or expired attempts.
    pub async fn collect_abandoned_bookings(&self, now: Ms) -> Vec<Ulid> {
        self.scan_bookings(|bs| is_abandoned(bs, now).then_some(bs.booking.id))
            .await
    }

    /// PENDING payments expiring within `lead` of `now`, as
    /// `(tourist, booking, payment)`.
    pub async fn collect_due_reminders(&self, now: Ms, lead: Ms) -> Vec<(Ulid, Ulid, Payment)> {
        self.scan_bookings(|bs| {
            Some(
                bs.payments
                    .iter()
                    .filter(|p| p.is_pending() && now < p.expires_at && p.expires_at <= now + lead)
                    .map(|p| (bs.booking.tourist_id, bs.booking.id, p.clone()))
                    .collect::<Vec<_>>(),
            )
        })
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    /// FORWARDED_TO_CREW bookings untouched for longer than `age`.
    pub async fn collect_stale_forwarded(&self, now: Ms, age: Ms) -> Vec<Ulid> {
        self.scan_bookings(|bs| {
            (bs.booking.status == BookingStatus::ForwardedToCrew
                && bs.booking.audit.updated_at < now - age)
                .then_some(bs.booking.id)
        })
        .await
    }

    pub async fn daily_report(&self) -> DailyReport {
        let mut report = DailyReport {
            generated_at: self.now(),
            bookings_by_status: BookingStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect(),
            ..Default::default()
        };
        for row in self.booking_rows() {
            let bs = row.read().await;
            *report
                .bookings_by_status
                .entry(bs.booking.status.as_str())
                .or_default() += 1;
            report.successful_payments += bs
                .payments
                .iter()
                .filter(|p| p.status == PaymentStatus::Success)
                .count();
            report.active_allocations += bs.allocations.iter().filter(|a| a.is_active()).count();
        }
        report
    }
}
