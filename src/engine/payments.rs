use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, Recipient};
use crate::payment::{PaymentRequest, new_tx_ref};

use super::bookings::staff_recipients;
use super::lifecycle::{self, Transition};
use super::{Engine, EngineError, SYSTEM_ACTOR, check_actor, check_len};

fn ensure_unpaid(bs: &BookingState) -> Result<(), EngineError> {
    if bs.payments.iter().any(|p| p.status == PaymentStatus::Success) {
        return Err(EngineError::AlreadyPaid(bs.booking.id));
    }
    Ok(())
}

impl Engine {
    /// The PENDING row to settle: the open one if its window still runs, else a
    /// fresh row. An open row past its window is left for the sweeper. The
    /// flag is true for a fresh row, whose tx ref is reserved until committed.
    fn pending_row(
        &self,
        bs: &BookingState,
        req: &PaymentRequest,
        now: Ms,
    ) -> Result<(Payment, bool), EngineError> {
        if let Some(open) = bs.payments.iter().find(|p| p.is_pending()) {
            if open.is_overdue(now) {
                return Err(EngineError::WindowExpired {
                    id: open.id,
                    expired_at: open.expires_at,
                });
            }
            return Ok((open.clone(), false));
        }
        let booking = &bs.booking;
        let id = Ulid::new();
        Ok((
            Payment {
                id,
                booking_id: booking.id,
                amount: req.amount.unwrap_or(booking.total_amount),
                method: req
                    .method
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PAYMENT_METHOD.to_string()),
                status: PaymentStatus::Pending,
                tx_ref: self.reserve_tx_ref(id, new_tx_ref),
                paid_at: None,
                expires_at: now + booking.payment_window_ms(),
                created_at: now,
                updated_at: now,
            },
            true,
        ))
    }

    /// Claim an unused tx ref for `payment_id`, drawing again on collision.
    pub(crate) fn reserve_tx_ref(&self, payment_id: Ulid, mut draw: impl FnMut() -> String) -> String {
        loop {
            let tx_ref = draw();
            match self.tx_refs.entry(tx_ref.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(payment_id);
                    return tx_ref;
                }
                Entry::Occupied(_) => tracing::debug!("tx ref {tx_ref} taken, drawing again"),
            }
        }
    }

    /// Commit a payment record, giving back a fresh row's tx ref if the WAL refuses it.
    async fn commit_payment(
        &self,
        bs: &mut BookingState,
        event: &Event,
        payment: &Payment,
        fresh: bool,
    ) -> Result<(), EngineError> {
        let result = self.commit_booking(bs, event).await;
        if result.is_err() && fresh {
            self.tx_refs.remove(&payment.tx_ref);
        }
        result
    }

    /// Open (or reuse) the PENDING payment row and move the booking to
    /// PENDING_PAYMENT. Calling it again while the row is open is a no-op.
    pub async fn initiate_payment(&self, booking_id: Ulid, actor: &str) -> Result<Payment, EngineError> {
        check_actor(actor)?;
        let mut guard = self.lock_booking(&booking_id).await?;
        ensure_unpaid(&guard)?;
        let status = lifecycle::advance(&guard.booking, Transition::InitiatePayment)?;
        let now = self.now();

        let (payment, fresh) = self.pending_row(&guard, &PaymentRequest::default(), now)?;
        if !fresh && guard.booking.status == status {
            tracing::debug!("payment {} already open for booking {booking_id}", payment.id);
            return Ok(payment);
        }

        let event = Event::PaymentRecorded {
            payment: payment.clone(),
            booking_status: status,
            at: now,
            actor: actor.to_string(),
        };
        self.commit_payment(&mut guard, &event, &payment, fresh).await?;
        tracing::info!(
            "payment {} opened for booking {booking_id}, expires at {}",
            payment.id,
            payment.expires_at
        );
        Ok(payment)
    }

    /// Attempt a payment. The decider's verdict settles the row in the same
    /// record that creates it, so a crash never leaves a half-processed attempt.
    pub async fn process_payment(
        &self,
        booking_id: Ulid,
        req: PaymentRequest,
        actor: &str,
    ) -> Result<Payment, EngineError> {
        check_actor(actor)?;
        check_len(req.method.as_deref(), MAX_METHOD_LEN, "payment method too long")?;
        check_len(req.card_number.as_deref(), MAX_CARD_NUMBER_LEN, "card number too long")?;
        if req.amount.is_some_and(|a| a < 0) {
            return Err(EngineError::LimitExceeded("negative amount"));
        }

        let mut guard = self.lock_booking(&booking_id).await?;
        ensure_unpaid(&guard)?;
        let pending_status = lifecycle::advance(&guard.booking, Transition::InitiatePayment)?;
        let now = self.now();
        let (mut payment, fresh) = self.pending_row(&guard, &req, now)?;

        let approved = self.decider.approve(&req);
        let booking_status = if approved {
            payment.status = PaymentStatus::Success;
            payment.paid_at = Some(now);
            BookingStatus::Confirmed
        } else {
            payment.status = PaymentStatus::Failed;
            pending_status
        };
        payment.updated_at = now;

        let event = Event::PaymentRecorded {
            payment: payment.clone(),
            booking_status,
            at: now,
            actor: actor.to_string(),
        };
        self.commit_payment(&mut guard, &event, &payment, fresh).await?;
        let tourist = guard.booking.tourist_id;
        drop(guard);

        metrics::counter!(
            crate::observability::PAYMENTS_TOTAL,
            "outcome" => payment.status.as_str()
        )
        .increment(1);

        if approved {
            tracing::info!("payment {} succeeded for booking {booking_id}", payment.id);
            self.deliver([
                Notification::new(
                    Recipient::Tourist(tourist),
                    "Payment Successful",
                    format!("Your payment for booking #{booking_id} has been processed successfully"),
                ),
                Notification::new(
                    Recipient::BookingOfficers,
                    "Payment Received",
                    format!("Payment received for booking #{booking_id}"),
                ),
            ]);
        } else {
            tracing::warn!("payment {} failed for booking {booking_id}", payment.id);
            self.deliver([Notification::new(
                Recipient::Tourist(tourist),
                "Payment Failed",
                format!("Payment for booking #{booking_id} has failed. Please try again."),
            )]);
        }
        Ok(payment)
    }

    /// Expire a PENDING payment along with its booking. Returns `false` (and
    /// changes nothing) when the payment is no longer pending, so repeated or
    /// racing calls are harmless.
    pub async fn expire_payment(&self, payment_id: Ulid) -> Result<bool, EngineError> {
        let mut guard = self.resolve_entity_write(&payment_id).await?;
        let payment = guard
            .payment(payment_id)
            .ok_or(EngineError::NotFound(payment_id))?;
        if !payment.is_pending() {
            tracing::debug!("payment {payment_id} is {}, nothing to expire", payment.status.as_str());
            return Ok(false);
        }
        let now = self.now();
        let booking_id = guard.booking.id;
        let tourist = guard.booking.tourist_id;

        if lifecycle::next_status(guard.booking.status, Transition::PaymentExpired).is_none() {
            // Booking already moved on; only the payment row is retired
            let mut retired = payment.clone();
            retired.status = PaymentStatus::Expired;
            retired.updated_at = now;
            let event = Event::PaymentRecorded {
                payment: retired,
                booking_status: guard.booking.status,
                at: now,
                actor: SYSTEM_ACTOR.to_string(),
            };
            self.commit_booking(&mut guard, &event).await?;
            tracing::info!("payment {payment_id} expired (booking {booking_id} left as is)");
            return Ok(true);
        }

        let released = self
            .expire_booking_locked(&mut guard, Some(payment_id), now)
            .await?;
        drop(guard);
        tracing::info!("payment {payment_id} expired; booking {booking_id} expired");

        let mut notes = vec![
            Notification::new(
                Recipient::Tourist(tourist),
                "Payment Expired",
                format!("Payment window has expired for booking #{booking_id}"),
            ),
            Notification::new(
                Recipient::CrewManagers,
                "Booking Expired",
                format!("Booking #{booking_id} has expired due to payment timeout"),
            ),
        ];
        notes.extend(released_notes(booking_id, released));
        self.deliver(notes);
        Ok(true)
    }

    /// Expire a PENDING_PAYMENT booking whose attempts all failed or expired
    /// and whose last payment window has run out. Returns whether it expired.
    pub async fn expire_abandoned_booking(&self, booking_id: Ulid) -> Result<bool, EngineError> {
        let mut guard = self.lock_booking(&booking_id).await?;
        let now = self.now();
        if !is_abandoned(&guard, now) {
            return Ok(false);
        }
        let tourist = guard.booking.tourist_id;
        let released = self.expire_booking_locked(&mut guard, None, now).await?;
        drop(guard);
        tracing::info!("booking {booking_id} expired after its last payment attempt lapsed");

        let mut notes = vec![
            Notification::new(
                Recipient::Tourist(tourist),
                "Booking Expired",
                format!("Booking #{booking_id} expired without a completed payment"),
            ),
            Notification::new(
                Recipient::CrewManagers,
                "Booking Expired",
                format!("Booking #{booking_id} has expired due to payment timeout"),
            ),
        ];
        notes.extend(released_notes(booking_id, released));
        self.deliver(notes);
        Ok(true)
    }

    /// Write the BookingExpired record under the booking lock the caller holds,
    /// releasing the active allocation's resources with it.
    async fn expire_booking_locked(
        &self,
        bs: &mut BookingState,
        payment_id: Option<Ulid>,
        now: Ms,
    ) -> Result<Option<ResourceSet>, EngineError> {
        let released = bs.active_allocation().map(|a| (a.id, a.resources));
        let held: Vec<Ulid> = released
            .map(|(_, set)| set.ids().collect())
            .unwrap_or_default();
        let mut locked = self.lock_resources(held).await?;
        let event = Event::BookingExpired {
            id: bs.booking.id,
            payment_id,
            released,
            at: now,
        };
        self.commit(Some(bs), &mut locked, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_EXPIRED_TOTAL).increment(1);
        Ok(released.map(|(_, set)| set))
    }
}

/// PENDING_PAYMENT, no open or settled payment, and the latest window is over.
pub(super) fn is_abandoned(bs: &BookingState, now: Ms) -> bool {
    if bs.booking.status != BookingStatus::PendingPayment || bs.live_payment().is_some() {
        return false;
    }
    bs.latest_payment().is_some_and(|p| now >= p.expires_at)
}

fn released_notes(booking_id: Ulid, released: Option<ResourceSet>) -> Vec<Notification> {
    let Some(set) = released else {
        return Vec::new();
    };
    staff_recipients(&set)
        .map(|r| {
            Notification::new(
                r,
                "Assignment Released",
                format!("Booking #{booking_id} expired; you are no longer assigned"),
            )
        })
        .collect()
}
