use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use safarid::clock::ManualClock;
use safarid::engine::{AllocationRequest, Engine, EngineError, NewBooking, NewJeep, NewStaff};
use safarid::model::*;
use safarid::notify::{Notification, NotifyHub, Recipient};
use safarid::payment::{FixedDecider, PaymentRequest};
use safarid::sweeper;

const T0: Ms = 1_700_000_000_000;

// ── Test infrastructure ──────────────────────────────────────

struct Daemon {
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
    clock: Arc<ManualClock>,
    wal: std::path::PathBuf,
}

fn start(approve: bool) -> Daemon {
    let dir = std::env::temp_dir().join(format!("safarid_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let wal = dir.join("safarid.wal");

    let hub = Arc::new(NotifyHub::new());
    let clock = Arc::new(ManualClock::new(T0));
    let engine = Engine::new(wal.clone(), hub.clone(), clock.clone())
        .unwrap()
        .with_decider(Arc::new(FixedDecider(approve)));
    Daemon {
        engine: Arc::new(engine),
        hub,
        clock,
        wal,
    }
}

async fn recv_titled(rx: &mut broadcast::Receiver<Notification>, title: &str) -> Notification {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let n = rx.recv().await.unwrap();
            if n.title == title {
                return n;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no '{title}' notification"))
}

async fn crew(d: &Daemon) -> (Ulid, Ulid, Ulid) {
    let driver = assert_ok!(
        d.engine
            .register_driver(NewStaff { name: "Baraka".into(), phone: None }, "admin")
            .await
    );
    let guide = assert_ok!(
        d.engine
            .register_guide(NewStaff { name: "Amani".into(), phone: None }, "admin")
            .await
    );
    let jeep = assert_ok!(
        d.engine
            .register_jeep(
                NewJeep {
                    model: "Land Cruiser".into(),
                    plate: "KDA 101A".into(),
                    capacity: 7,
                    default_driver: Some(driver),
                },
                "admin",
            )
            .await
    );
    (driver, guide, jeep)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_to_confirmation_notifies_every_party() {
    let d = start(true);
    let (driver, guide, jeep) = crew(&d).await;
    let tourist = Ulid::new();

    let mut officers = d.hub.subscribe(Recipient::BookingOfficers);
    let mut managers = d.hub.subscribe(Recipient::CrewManagers);
    let mut tourist_rx = d.hub.subscribe(Recipient::Tourist(tourist));
    let mut driver_rx = d.hub.subscribe(Recipient::Staff(driver));

    let booking = assert_ok!(
        d.engine
            .create_booking(
                NewBooking {
                    tourist_id: tourist,
                    total_amount: 900_00,
                    ..Default::default()
                },
                "tourist",
            )
            .await
    );
    recv_titled(&mut officers, "New Booking Request").await;

    assert_ok!(d.engine.forward_to_crew(booking.id, "officer").await);
    recv_titled(&mut managers, "Booking Forwarded").await;

    let alloc = assert_ok!(
        d.engine
            .create_allocation(
                booking.id,
                AllocationRequest {
                    driver_id: Some(driver),
                    guide_id: Some(guide),
                    jeep_id: Some(jeep),
                    notes: Some("sunrise game drive".into()),
                },
                "crew",
            )
            .await
    );
    recv_titled(&mut officers, "Allocation Created").await;
    let assignment = recv_titled(&mut driver_rx, "New Assignment").await;
    assert!(assignment.body.contains(&booking.id.to_string()));

    assert_ok!(d.engine.send_confirmation(booking.id, "crew").await);
    recv_titled(&mut tourist_rx, "Booking Confirmation").await;

    assert_ok!(d.engine.initiate_payment(booking.id, "tourist").await);
    d.clock.advance(5 * SECOND_MS);
    let payment = assert_ok!(
        d.engine
            .process_payment(booking.id, PaymentRequest::default(), "tourist")
            .await
    );
    assert_eq!(payment.status, PaymentStatus::Success);
    recv_titled(&mut tourist_rx, "Payment Successful").await;
    recv_titled(&mut officers, "Payment Received").await;

    let view = assert_ok!(d.engine.get_booking(booking.id).await);
    assert_eq!(view.booking.status, BookingStatus::Confirmed);
    assert_eq!(view.allocation_id, Some(alloc.id));

    // A confirmed booking is out of the sweeper's reach
    d.clock.advance(HOUR_MS);
    assert_eq!(sweeper::sweep_expired_payments(&d.engine).await, 0);
    assert_eq!(
        assert_ok!(d.engine.get_booking(booking.id).await).booking.status,
        BookingStatus::Confirmed
    );
}

#[tokio::test]
async fn sweeper_expires_unpaid_booking_and_frees_crew() {
    let d = start(false);
    let (driver, _, jeep) = crew(&d).await;
    let tourist = Ulid::new();
    let mut tourist_rx = d.hub.subscribe(Recipient::Tourist(tourist));
    let mut driver_rx = d.hub.subscribe(Recipient::Staff(driver));

    let booking = assert_ok!(
        d.engine
            .create_booking(NewBooking { tourist_id: tourist, ..Default::default() }, "tourist")
            .await
    );
    assert_ok!(d.engine.forward_to_crew(booking.id, "officer").await);
    assert_ok!(
        d.engine
            .create_allocation(
                booking.id,
                AllocationRequest {
                    driver_id: Some(driver),
                    jeep_id: Some(jeep),
                    ..Default::default()
                },
                "crew",
            )
            .await
    );
    assert_ok!(d.engine.send_confirmation(booking.id, "crew").await);
    let payment = assert_ok!(d.engine.initiate_payment(booking.id, "tourist").await);

    d.clock.advance(19 * SECOND_MS);
    assert_eq!(sweeper::send_payment_reminders(&d.engine, 2 * MINUTE_MS).await, 1);
    recv_titled(&mut tourist_rx, "Payment Reminder").await;

    d.clock.set(T0 + 25 * SECOND_MS);
    assert_eq!(sweeper::sweep_expired_payments(&d.engine).await, 1);
    recv_titled(&mut tourist_rx, "Payment Expired").await;
    recv_titled(&mut driver_rx, "Assignment Released").await;

    let view = assert_ok!(d.engine.get_payment(payment.id).await);
    assert_eq!(view.payment.status, PaymentStatus::Expired);
    assert_eq!(assert_ok!(d.engine.get_jeep(jeep).await).status, JeepStatus::Available);

    // Tourist can no longer pay for it
    let err = assert_err!(
        d.engine
            .process_payment(booking.id, PaymentRequest::default(), "tourist")
            .await
    );
    assert!(matches!(err, EngineError::InvalidState { status: "EXPIRED", .. }));

    // The freed crew goes straight to the next booking, and survives a restart
    let next = assert_ok!(d.engine.create_booking(NewBooking::default(), "tourist").await);
    assert_ok!(d.engine.forward_to_crew(next.id, "officer").await);
    let realloc = assert_ok!(
        d.engine
            .create_allocation(
                next.id,
                AllocationRequest {
                    driver_id: Some(driver),
                    jeep_id: Some(jeep),
                    ..Default::default()
                },
                "crew",
            )
            .await
    );

    let restarted = assert_ok!(Engine::new(d.wal.clone(), Arc::new(NotifyHub::new()), d.clock.clone()));
    let jeep_after = assert_ok!(restarted.get_jeep(jeep).await);
    assert_eq!(jeep_after.claimed_by, Some(realloc.id));
    assert_eq!(
        assert_ok!(restarted.get_booking(booking.id).await).booking.status,
        BookingStatus::Expired
    );
}
