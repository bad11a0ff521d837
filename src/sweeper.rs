use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SweeperConfig;
use crate::engine::{Engine, EngineError};
use crate::model::{DailyReport, HOUR_MS, Ms};
use crate::notify::{Notification, Recipient};
use crate::observability::{
    ACTIVE_ALLOCATIONS, BOOKINGS_BY_STATUS, REMINDERS_SENT_TOTAL, SUCCESSFUL_PAYMENTS,
    SWEEP_ERRORS_TOTAL,
};

fn sweep_error(task: &'static str, e: &EngineError) {
    metrics::counter!(SWEEP_ERRORS_TOTAL, "task" => task, "error" => e.label()).increment(1);
}

/// Expire every overdue PENDING payment, then every abandoned PENDING_PAYMENT
/// booking. One failure does not stop the pass. Returns how many expired.
pub async fn sweep_expired_payments(engine: &Engine) -> usize {
    let now = engine.now();
    let mut expired = 0;

    for payment_id in engine.collect_overdue_payments(now).await {
        match engine.expire_payment(payment_id).await {
            Ok(true) => expired += 1,
            // Settled or expired by someone else since the scan
            Ok(false) => debug!("sweeper skip payment {payment_id}: no longer pending"),
            Err(e) => {
                warn!("sweeper failed to expire payment {payment_id}: {e}");
                sweep_error("expire_payment", &e);
            }
        }
    }

    for booking_id in engine.collect_abandoned_bookings(now).await {
        match engine.expire_abandoned_booking(booking_id).await {
            Ok(true) => expired += 1,
            Ok(false) => debug!("sweeper skip booking {booking_id}: no longer abandoned"),
            Err(e) => {
                warn!("sweeper failed to expire booking {booking_id}: {e}");
                sweep_error("expire_booking", &e);
            }
        }
    }
    expired
}

/// Remind tourists whose PENDING payment closes within `lead`. No state
/// changes, so a tourist may be reminded more than once.
pub async fn send_payment_reminders(engine: &Engine, lead: Ms) -> usize {
    let now = engine.now();
    let due = engine.collect_due_reminders(now, lead).await;
    let sent = due.len();
    let notes = due.into_iter().map(|(tourist, booking_id, payment)| {
        info!("payment reminder sent for booking {booking_id}");
        Notification::new(
            Recipient::Tourist(tourist),
            "Payment Reminder",
            format!(
                "Your payment of {} for booking #{booking_id} will expire soon",
                payment.amount
            ),
        )
    });
    engine.deliver(notes);
    metrics::counter!(REMINDERS_SENT_TOTAL, "kind" => "payment").increment(sent as u64);
    sent
}

/// Nudge crew managers about FORWARDED_TO_CREW bookings nobody allocated
/// within `age`.
pub async fn remind_stale_forwarded(engine: &Engine, age: Ms) -> usize {
    let stale = engine.collect_stale_forwarded(engine.now(), age).await;
    let hours = age / HOUR_MS;
    let notes: Vec<Notification> = stale
        .iter()
        .map(|booking_id| {
            info!("reminded crew managers about pending booking {booking_id}");
            Notification::new(
                Recipient::CrewManagers,
                "Pending Allocation Reminder",
                format!("Booking #{booking_id} has been pending allocation for over {hours} hours"),
            )
        })
        .collect();
    engine.deliver(notes);
    metrics::counter!(REMINDERS_SENT_TOTAL, "kind" => "stale_forwarded")
        .increment(stale.len() as u64);
    stale.len()
}

/// Log the current counts and publish them as gauges.
pub async fn daily_report(engine: &Engine) -> DailyReport {
    let report = engine.daily_report().await;
    for (status, count) in &report.bookings_by_status {
        metrics::gauge!(BOOKINGS_BY_STATUS, "status" => *status).set(*count as f64);
    }
    metrics::gauge!(ACTIVE_ALLOCATIONS).set(report.active_allocations as f64);
    metrics::gauge!(SUCCESSFUL_PAYMENTS).set(report.successful_payments as f64);

    match serde_json::to_string(&report) {
        Ok(json) => info!("daily report: {json}"),
        Err(e) => warn!("daily report not serializable: {e}"),
    }
    report
}

/// Compact the WAL whenever enough appends have piled up since the last time.
pub async fn run_compactor(engine: Arc<Engine>, every: Duration, threshold: u64) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => {
                warn!("WAL compaction failed: {e}");
                sweep_error("compact", &e);
            }
        }
    }
}

/// Start one interval task per sweep. Each runs until its handle is aborted.
pub fn spawn_sweeper(engine: Arc<Engine>, config: SweeperConfig) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(5);

    let e = engine.clone();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.expiry_every);
        loop {
            interval.tick().await;
            let expired = sweep_expired_payments(&e).await;
            if expired > 0 {
                info!("expiry sweep expired {expired} bookings/payments");
            }
        }
    }));

    let e = engine.clone();
    let lead = config.reminder_lead;
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.reminder_every);
        loop {
            interval.tick().await;
            send_payment_reminders(&e, lead).await;
        }
    }));

    let e = engine.clone();
    let stale_after = config.stale_after;
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.stale_every);
        loop {
            interval.tick().await;
            remind_stale_forwarded(&e, stale_after).await;
        }
    }));

    let e = engine.clone();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.report_every);
        // The first tick fires at once; skip it so the report lands a full period in
        interval.tick().await;
        loop {
            interval.tick().await;
            daily_report(&e).await;
        }
    }));

    handles.push(tokio::spawn(run_compactor(
        engine,
        config.compact_every,
        config.compact_threshold,
    )));
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{AllocationRequest, NewBooking, NewJeep, NewStaff};
    use crate::model::*;
    use crate::notify::{Notifier, NotifyError};
    use crate::payment::FixedDecider;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use ulid::Ulid;

    const T0: Ms = 1_700_000_000_000;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Notification>>);

    impl Recorder {
        fn titled(&self, title: &str) -> Vec<Notification> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|n| n.title == title)
                .cloned()
                .collect()
        }
    }

    impl Notifier for Recorder {
        fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(notification);
            Ok(())
        }
    }

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("safarid_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn setup(name: &str) -> (Arc<Engine>, Arc<ManualClock>, Arc<Recorder>) {
        let clock = Arc::new(ManualClock::new(T0));
        let notes = Arc::new(Recorder::default());
        let engine = Engine::new(test_wal_path(name), notes.clone(), clock.clone())
            .unwrap()
            .with_decider(Arc::new(FixedDecider(false)));
        (Arc::new(engine), clock, notes)
    }

    /// Walk a booking to PENDING_PAYMENT with a driver and jeep held.
    async fn pending_booking(engine: &Engine) -> (Ulid, Payment, Ulid, Ulid) {
        let driver = engine
            .register_driver(NewStaff { name: "Baraka".into(), phone: None }, "admin")
            .await
            .unwrap();
        let jeep = engine
            .register_jeep(
                NewJeep {
                    model: "Land Cruiser".into(),
                    plate: "KDA 101A".into(),
                    capacity: 7,
                    default_driver: None,
                },
                "admin",
            )
            .await
            .unwrap();
        let booking = engine
            .create_booking(
                NewBooking {
                    tourist_id: Ulid::new(),
                    total_amount: 450_00,
                    ..Default::default()
                },
                "tourist",
            )
            .await
            .unwrap();
        engine.forward_to_crew(booking.id, "officer").await.unwrap();
        engine
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
            .unwrap();
        engine.send_confirmation(booking.id, "crew").await.unwrap();
        let payment = engine.initiate_payment(booking.id, "tourist").await.unwrap();
        (booking.id, payment, driver, jeep)
    }

    #[tokio::test]
    async fn sweep_expires_overdue_payment_and_releases_resources() {
        let (engine, clock, notes) = setup("sweep_overdue.wal");
        let (booking_id, payment, driver, jeep) = pending_booking(&engine).await;

        clock.advance(10 * SECOND_MS);
        assert_eq!(sweep_expired_payments(&engine).await, 0);

        clock.set(T0 + 25 * SECOND_MS);
        assert_eq!(sweep_expired_payments(&engine).await, 1);

        let view = engine.get_booking(booking_id).await.unwrap();
        assert_eq!(view.booking.status, BookingStatus::Expired);
        let p = engine.get_payment(payment.id).await.unwrap();
        assert_eq!(p.payment.status, PaymentStatus::Expired);
        assert!(!p.is_expired);

        assert_eq!(engine.get_resource(driver).await.unwrap().claimed_by, None);
        let j = engine.get_jeep(jeep).await.unwrap();
        assert_eq!(j.status, JeepStatus::Available);
        assert!(engine.active_allocations().await.is_empty());

        assert_eq!(notes.titled("Payment Expired").len(), 1);
        assert_eq!(notes.titled("Booking Expired").len(), 1);
        assert_eq!(notes.titled("Assignment Released").len(), 1);

        // Second pass finds nothing
        assert_eq!(sweep_expired_payments(&engine).await, 0);
        assert_eq!(notes.titled("Payment Expired").len(), 1);
    }

    #[tokio::test]
    async fn sweep_expires_booking_after_failed_attempt() {
        let (engine, clock, _notes) = setup("sweep_abandoned.wal");
        let (booking_id, _, _, jeep) = pending_booking(&engine).await;

        let attempt = engine
            .process_payment(booking_id, Default::default(), "tourist")
            .await
            .unwrap();
        assert_eq!(attempt.status, PaymentStatus::Failed);

        clock.advance(19 * SECOND_MS);
        assert_eq!(sweep_expired_payments(&engine).await, 0);
        clock.advance(2 * SECOND_MS);
        assert_eq!(sweep_expired_payments(&engine).await, 1);

        let view = engine.get_booking(booking_id).await.unwrap();
        assert_eq!(view.booking.status, BookingStatus::Expired);
        assert_eq!(engine.get_jeep(jeep).await.unwrap().status, JeepStatus::Available);
    }

    #[tokio::test]
    async fn reminders_only_inside_lead_window() {
        let (engine, clock, notes) = setup("sweep_reminders.wal");
        let (booking_id, _, _, _) = pending_booking(&engine).await;

        // Expires at T0+20s; a 5s lead starts at T0+15s
        assert_eq!(send_payment_reminders(&engine, 5 * SECOND_MS).await, 0);
        clock.set(T0 + 16 * SECOND_MS);
        assert_eq!(send_payment_reminders(&engine, 5 * SECOND_MS).await, 1);
        clock.set(T0 + 20 * SECOND_MS);
        assert_eq!(send_payment_reminders(&engine, 5 * SECOND_MS).await, 0);

        let sent = notes.titled("Payment Reminder");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains(&booking_id.to_string()));
        assert!(sent[0].body.contains("45000"));
    }

    #[tokio::test]
    async fn stale_forwarded_bookings_nag_the_crew() {
        let (engine, clock, notes) = setup("sweep_stale.wal");
        let booking = engine
            .create_booking(NewBooking::default(), "tourist")
            .await
            .unwrap();
        engine.forward_to_crew(booking.id, "officer").await.unwrap();

        clock.advance(23 * HOUR_MS);
        assert_eq!(remind_stale_forwarded(&engine, 24 * HOUR_MS).await, 0);
        clock.advance(2 * HOUR_MS);
        assert_eq!(remind_stale_forwarded(&engine, 24 * HOUR_MS).await, 1);

        let sent = notes.titled("Pending Allocation Reminder");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, Recipient::CrewManagers);
        assert!(sent[0].body.ends_with("pending allocation for over 24 hours"));
    }

    #[tokio::test]
    async fn daily_report_counts() {
        let (engine, _clock, _notes) = setup("sweep_report.wal");
        pending_booking(&engine).await;
        engine
            .create_booking(NewBooking::default(), "tourist")
            .await
            .unwrap();

        let report = daily_report(&engine).await;
        assert_eq!(report.bookings_by_status["REQUESTED"], 1);
        assert_eq!(report.bookings_by_status["PENDING_PAYMENT"], 1);
        assert_eq!(report.bookings_by_status["CONFIRMED"], 0);
        assert_eq!(report.active_allocations, 1);
        assert_eq!(report.successful_payments, 0);
    }

    #[tokio::test]
    async fn compactor_waits_for_threshold() {
        let (engine, _clock, _notes) = setup("sweep_compactor.wal");
        pending_booking(&engine).await;
        assert!(engine.wal_appends_since_compact().await > 0);

        let task = tokio::spawn(run_compactor(engine.clone(), Duration::from_millis(10), 1));
        for _ in 0..100 {
            if engine.wal_appends_since_compact().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
