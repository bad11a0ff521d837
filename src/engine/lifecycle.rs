use crate::model::*;

use super::EngineError;

/// Named booking transitions. Cancellation and expiry carry extra rules and
/// are checked by their own functions below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Forward,
    Allocate,
    /// Allocation cancelled; the booking goes back in the crew's queue.
    Deallocate,
    SendConfirmation,
    InitiatePayment,
    PaymentSucceeded,
    PaymentExpired,
}

impl Transition {
    pub fn as_str(self) -> &'static str {
        match self {
            Transition::Forward => "forward",
            Transition::Allocate => "allocate",
            Transition::Deallocate => "deallocate",
            Transition::SendConfirmation => "send confirmation for",
            Transition::InitiatePayment => "initiate payment for",
            Transition::PaymentSucceeded => "confirm payment for",
            Transition::PaymentExpired => "expire",
        }
    }
}

/// Target status of `transition` from `from`, or `None` when it is not allowed.
pub fn next_status(from: BookingStatus, transition: Transition) -> Option<BookingStatus> {
    use BookingStatus::*;
    match (from, transition) {
        (Requested, Transition::Forward) => Some(ForwardedToCrew),
        (ForwardedToCrew, Transition::Allocate) => Some(Allocated),
        (Allocated, Transition::Deallocate) => Some(ForwardedToCrew),
        (Allocated, Transition::SendConfirmation) => Some(ConfirmationSent),
        (ConfirmationSent | PendingPayment, Transition::InitiatePayment) => Some(PendingPayment),
        (PendingPayment, Transition::PaymentSucceeded) => Some(Confirmed),
        (PendingPayment, Transition::PaymentExpired) => Some(Expired),
        _ => None,
    }
}

/// `next_status`, turning a refusal into `InvalidState`.
pub(super) fn advance(booking: &Booking, transition: Transition) -> Result<BookingStatus, EngineError> {
    next_status(booking.status, transition).ok_or(EngineError::InvalidState {
        id: booking.id,
        status: booking.status.as_str(),
        action: transition.as_str(),
    })
}

/// Whether the tourist may still edit the booking at `now`. The same function
/// backs `BookingView::can_edit` and the write path.
pub fn can_edit(booking: &Booking, now: Ms) -> bool {
    booking.status == BookingStatus::Requested && now < booking.edit_window_expires()
}

/// Edit guard. The window is checked before the status.
pub(super) fn check_edit(booking: &Booking, now: Ms) -> Result<(), EngineError> {
    let expires = booking.edit_window_expires();
    if now >= expires {
        return Err(EngineError::WindowExpired {
            id: booking.id,
            expired_at: expires,
        });
    }
    if booking.status != BookingStatus::Requested {
        return Err(EngineError::InvalidState {
            id: booking.id,
            status: booking.status.as_str(),
            action: "edit",
        });
    }
    Ok(())
}

/// Tourist cancel guard. A REQUESTED booking is only cancellable inside the edit
/// window; later non-terminal bookings always are.
pub(super) fn check_cancel(booking: &Booking, now: Ms) -> Result<(), EngineError> {
    if booking.status.is_terminal() {
        return Err(EngineError::InvalidState {
            id: booking.id,
            status: booking.status.as_str(),
            action: "cancel",
        });
    }
    let expires = booking.edit_window_expires();
    if booking.status == BookingStatus::Requested && now >= expires {
        return Err(EngineError::WindowExpired {
            id: booking.id,
            expired_at: expires,
        });
    }
    Ok(())
}

/// Admin window overrides apply to any booking still in flight.
pub(super) fn check_not_terminal(booking: &Booking, action: &'static str) -> Result<(), EngineError> {
    if booking.status.is_terminal() {
        return Err(EngineError::InvalidState {
            id: booking.id,
            status: booking.status.as_str(),
            action,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn booking(status: BookingStatus, created_at: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            tourist_id: Ulid::new(),
            package_id: Ulid::new(),
            requested_at: 0,
            status,
            edit_window_secs: 10,
            payment_window_secs: 20,
            version: 1,
            total_amount: 0,
            notes: None,
            audit: Audit::new(created_at, "tourist"),
        }
    }

    #[test]
    fn happy_path_walks_to_confirmed() {
        use BookingStatus::*;
        let path = [
            (Transition::Forward, ForwardedToCrew),
            (Transition::Allocate, Allocated),
            (Transition::SendConfirmation, ConfirmationSent),
            (Transition::InitiatePayment, PendingPayment),
            (Transition::InitiatePayment, PendingPayment),
            (Transition::PaymentSucceeded, Confirmed),
        ];
        let mut status = Requested;
        for (t, expected) in path {
            status = next_status(status, t).unwrap();
            assert_eq!(status, expected);
        }
    }

    #[test]
    fn terminal_statuses_accept_nothing() {
        let all = [
            Transition::Forward,
            Transition::Allocate,
            Transition::Deallocate,
            Transition::SendConfirmation,
            Transition::InitiatePayment,
            Transition::PaymentSucceeded,
            Transition::PaymentExpired,
        ];
        for status in BookingStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for t in all {
                assert_eq!(next_status(*status, t), None, "{status} {t:?}");
            }
        }
    }

    #[test]
    fn deallocate_regresses_to_forwarded() {
        assert_eq!(
            next_status(BookingStatus::Allocated, Transition::Deallocate),
            Some(BookingStatus::ForwardedToCrew)
        );
        assert_eq!(next_status(BookingStatus::ConfirmationSent, Transition::Deallocate), None);
    }

    #[test]
    fn advance_reports_current_status() {
        let b = booking(BookingStatus::Requested, 0);
        let err = advance(&b, Transition::Allocate).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState { status: "REQUESTED", action: "allocate", .. }
        ));
    }

    #[test]
    fn can_edit_is_exclusive_at_expiry() {
        let b = booking(BookingStatus::Requested, 1_000);
        assert!(can_edit(&b, 1_000));
        assert!(can_edit(&b, 10_999));
        assert!(!can_edit(&b, 11_000));
        assert!(!can_edit(&booking(BookingStatus::ForwardedToCrew, 1_000), 1_000));
    }

    #[test]
    fn edit_checks_window_before_status() {
        let forwarded = booking(BookingStatus::ForwardedToCrew, 0);
        assert!(matches!(
            check_edit(&forwarded, 5_000),
            Err(EngineError::InvalidState { .. })
        ));
        assert!(matches!(
            check_edit(&forwarded, 10_000),
            Err(EngineError::WindowExpired { expired_at: 10_000, .. })
        ));
        assert!(check_edit(&booking(BookingStatus::Requested, 0), 9_999).is_ok());
    }

    #[test]
    fn cancel_window_only_binds_requested() {
        assert!(matches!(
            check_cancel(&booking(BookingStatus::Requested, 0), 10_000),
            Err(EngineError::WindowExpired { .. })
        ));
        assert!(check_cancel(&booking(BookingStatus::Allocated, 0), 60_000).is_ok());
        assert!(check_cancel(&booking(BookingStatus::PendingPayment, 0), 60_000).is_ok());
        assert!(matches!(
            check_cancel(&booking(BookingStatus::Confirmed, 0), 0),
            Err(EngineError::InvalidState { .. })
        ));
    }
}
