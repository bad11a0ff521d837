use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, Recipient};

use super::lifecycle::{self, Transition};
use super::{Engine, EngineError, check_actor, check_len, check_window, count_event};

/// A tourist's booking request.
#[derive(Debug, Clone, Default)]
pub struct NewBooking {
    pub tourist_id: Ulid,
    pub package_id: Ulid,
    pub requested_at: Ms,
    pub total_amount: Cents,
    pub notes: Option<String>,
}

/// Fields a tourist may change inside the edit window. `None` keeps the
/// current value.
#[derive(Debug, Clone, Default)]
pub struct BookingEdit {
    pub package_id: Option<Ulid>,
    pub requested_at: Option<Ms>,
    pub total_amount: Option<Cents>,
    pub notes: Option<String>,
    /// Reject the edit unless the booking is still at this version.
    pub expected_version: Option<u32>,
}

fn check_amount(amount: Option<Cents>) -> Result<(), EngineError> {
    match amount {
        Some(a) if a < 0 => Err(EngineError::LimitExceeded("negative amount")),
        _ => Ok(()),
    }
}

impl Engine {
    pub async fn create_booking(&self, req: NewBooking, actor: &str) -> Result<Booking, EngineError> {
        check_actor(actor)?;
        check_len(req.notes.as_deref(), MAX_BOOKING_NOTES_LEN, "booking notes too long")?;
        check_amount(Some(req.total_amount))?;

        let _gate = self.row_gate.read().await;
        let now = self.now();
        let booking = Booking {
            id: Ulid::new(),
            tourist_id: req.tourist_id,
            package_id: req.package_id,
            requested_at: req.requested_at,
            status: BookingStatus::Requested,
            edit_window_secs: self.default_edit_window_secs,
            payment_window_secs: self.default_payment_window_secs,
            version: 1,
            total_amount: req.total_amount,
            notes: req.notes,
            audit: Audit::new(now, actor),
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.wal_append(&event).await?;
        self.bookings.insert(
            booking.id,
            Arc::new(RwLock::new(BookingState::new(booking.clone()))),
        );
        count_event(&event);
        tracing::info!("booking {} created by {actor}", booking.id);

        self.deliver([Notification::new(
            Recipient::BookingOfficers,
            "New Booking Request",
            format!(
                "New booking request #{} from tourist {}",
                booking.id, booking.tourist_id
            ),
        )]);
        Ok(booking)
    }

    /// Tourist edit. Only inside the edit window, only while REQUESTED.
    pub async fn edit_booking(
        &self,
        id: Ulid,
        edit: BookingEdit,
        actor: &str,
    ) -> Result<Booking, EngineError> {
        check_actor(actor)?;
        check_len(edit.notes.as_deref(), MAX_BOOKING_NOTES_LEN, "booking notes too long")?;
        check_amount(edit.total_amount)?;

        let mut guard = self.lock_booking(&id).await?;
        let now = self.now();
        lifecycle::check_edit(&guard.booking, now)?;
        let b = &guard.booking;
        if let Some(expected) = edit.expected_version
            && expected != b.version
        {
            return Err(EngineError::StaleVersion {
                id,
                expected,
                actual: b.version,
            });
        }

        let event = Event::BookingEdited {
            id,
            package_id: edit.package_id.unwrap_or(b.package_id),
            requested_at: edit.requested_at.unwrap_or(b.requested_at),
            total_amount: edit.total_amount.unwrap_or(b.total_amount),
            notes: edit.notes.or_else(|| b.notes.clone()),
            version: b.version + 1,
            at: now,
            actor: actor.to_string(),
        };
        self.commit_booking(&mut guard, &event).await?;
        tracing::info!("booking {id} edited by {actor} (v{})", guard.booking.version);
        Ok(guard.booking.clone())
    }

    /// Tourist cancel. Releases the active allocation and retires a pending
    /// payment in the same record.
    pub async fn cancel_booking(&self, id: Ulid, actor: &str) -> Result<Booking, EngineError> {
        check_actor(actor)?;
        let mut guard = self.lock_booking(&id).await?;
        let now = self.now();
        lifecycle::check_cancel(&guard.booking, now)?;

        let released = guard.active_allocation().map(|a| (a.id, a.resources));
        let expired_payment = guard.payments.iter().find(|p| p.is_pending()).map(|p| p.id);
        let held: Vec<Ulid> = released
            .map(|(_, set)| set.ids().collect())
            .unwrap_or_default();
        let mut locked = self.lock_resources(held).await?;

        let event = Event::BookingCancelled {
            id,
            released,
            expired_payment,
            at: now,
            actor: actor.to_string(),
        };
        self.commit(Some(&mut *guard), &mut locked, &event).await?;
        drop(locked);
        let booking = guard.booking.clone();
        drop(guard);
        tracing::info!("booking {id} cancelled by {actor}");

        let mut notes = vec![Notification::new(
            Recipient::BookingOfficers,
            "Booking Cancelled",
            format!("Booking #{id} was cancelled by the tourist"),
        )];
        if let Some((_, set)) = released {
            notes.extend(staff_recipients(&set).map(|r| {
                Notification::new(
                    r,
                    "Assignment Cancelled",
                    format!("Booking #{id} was cancelled; you are no longer assigned"),
                )
            }));
        }
        self.deliver(notes);
        Ok(booking)
    }

    pub async fn forward_to_crew(&self, id: Ulid, actor: &str) -> Result<Booking, EngineError> {
        let booking = self.transition(id, Transition::Forward, actor).await?;
        self.deliver([Notification::new(
            Recipient::CrewManagers,
            "Booking Forwarded",
            format!("Booking #{id} has been forwarded for allocation"),
        )]);
        Ok(booking)
    }

    /// Hook for the step that tells the tourist their trip is allocated.
    pub async fn send_confirmation(&self, id: Ulid, actor: &str) -> Result<Booking, EngineError> {
        let booking = self.transition(id, Transition::SendConfirmation, actor).await?;
        self.deliver([Notification::new(
            Recipient::Tourist(booking.tourist_id),
            "Booking Confirmation",
            format!(
                "Booking #{id} is allocated. Complete payment within {} seconds of starting it.",
                booking.payment_window_secs
            ),
        )]);
        Ok(booking)
    }

    /// Single status change with no side rows.
    async fn transition(
        &self,
        id: Ulid,
        transition: Transition,
        actor: &str,
    ) -> Result<Booking, EngineError> {
        check_actor(actor)?;
        let mut guard = self.lock_booking(&id).await?;
        let from = guard.booking.status;
        let status = lifecycle::advance(&guard.booking, transition)?;
        let event = Event::BookingStatusChanged {
            id,
            status,
            at: self.now(),
            actor: actor.to_string(),
        };
        self.commit_booking(&mut guard, &event).await?;
        tracing::info!("booking {id}: {from} -> {status} by {actor}");
        Ok(guard.booking.clone())
    }

    pub async fn set_edit_window(&self, id: Ulid, secs: u32, actor: &str) -> Result<Booking, EngineError> {
        self.set_windows(id, Some(secs), None, actor).await
    }

    /// Applies to payment rows created afterwards; a pending row keeps its deadline.
    pub async fn set_payment_window(
        &self,
        id: Ulid,
        secs: u32,
        actor: &str,
    ) -> Result<Booking, EngineError> {
        self.set_windows(id, None, Some(secs), actor).await
    }

    async fn set_windows(
        &self,
        id: Ulid,
        edit: Option<u32>,
        payment: Option<u32>,
        actor: &str,
    ) -> Result<Booking, EngineError> {
        check_actor(actor)?;
        edit.map(check_window).transpose()?;
        payment.map(check_window).transpose()?;

        let mut guard = self.lock_booking(&id).await?;
        lifecycle::check_not_terminal(&guard.booking, "change windows of")?;
        let event = Event::BookingWindowsChanged {
            id,
            edit_window_secs: edit.unwrap_or(guard.booking.edit_window_secs),
            payment_window_secs: payment.unwrap_or(guard.booking.payment_window_secs),
            at: self.now(),
            actor: actor.to_string(),
        };
        self.commit_booking(&mut guard, &event).await?;
        tracing::info!(
            "booking {id}: windows edit={}s payment={}s set by {actor}",
            guard.booking.edit_window_secs,
            guard.booking.payment_window_secs
        );
        Ok(guard.booking.clone())
    }
}

/// Driver and guide of a resource set (jeeps get no notifications).
pub(super) fn staff_recipients(set: &ResourceSet) -> impl Iterator<Item = Recipient> + '_ {
    set.entries()
        .filter(|(kind, _)| *kind != ResourceKind::Jeep)
        .map(|(_, id)| Recipient::Staff(id))
}
