use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, Recipient};

use super::bookings::staff_recipients;
use super::conflict::check_claims;
use super::lifecycle::{self, Transition};
use super::{Engine, EngineError, check_actor, check_len};

/// Resources to assign. Unset slots are left empty (or emptied on update).
#[derive(Debug, Clone, Default)]
pub struct AllocationRequest {
    pub driver_id: Option<Ulid>,
    pub guide_id: Option<Ulid>,
    pub jeep_id: Option<Ulid>,
    pub notes: Option<String>,
}

impl AllocationRequest {
    pub fn resources(&self) -> ResourceSet {
        ResourceSet {
            driver_id: self.driver_id,
            guide_id: self.guide_id,
            jeep_id: self.jeep_id,
        }
    }
}

fn not_active(alloc: &Allocation, action: &'static str) -> EngineError {
    EngineError::InvalidState {
        id: alloc.id,
        status: alloc.status.as_str(),
        action,
    }
}

fn assignment_notes(booking_id: Ulid, set: &ResourceSet) -> Vec<Notification> {
    staff_recipients(set)
        .map(|r| {
            Notification::new(
                r,
                "New Assignment",
                format!("You have been assigned to booking #{booking_id}"),
            )
        })
        .collect()
}

impl Engine {
    /// Claim the requested resources for a forwarded booking. The allocation,
    /// the booking status and every claim land in one WAL record.
    pub async fn create_allocation(
        &self,
        booking_id: Ulid,
        req: AllocationRequest,
        actor: &str,
    ) -> Result<Allocation, EngineError> {
        check_actor(actor)?;
        check_len(req.notes.as_deref(), MAX_ALLOCATION_NOTES_LEN, "allocation notes too long")?;
        let set = req.resources();

        let mut guard = self.lock_booking(&booking_id).await?;
        lifecycle::advance(&guard.booking, Transition::Allocate)?;
        if let Some(active) = guard.active_allocation() {
            return Err(EngineError::AlreadyExists(active.id));
        }

        let mut locked = self.lock_resources(set.ids()).await?;
        let check = check_claims(&set, |id| locked.get(id), None)?;
        if let Some(conflict) = check.first_conflict() {
            metrics::counter!(
                crate::observability::ALLOCATION_CONFLICTS_TOTAL,
                "kind" => conflict.kind.as_str()
            )
            .increment(1);
            tracing::debug!("allocation for booking {booking_id} refused: {conflict}");
        }
        check.into_result()?;

        let allocation = Allocation {
            id: Ulid::new(),
            booking_id,
            resources: set,
            status: AllocationStatus::Active,
            notes: req.notes,
            audit: Audit::new(self.now(), actor),
        };
        let event = Event::AllocationCreated {
            allocation: allocation.clone(),
        };
        self.commit(Some(&mut *guard), &mut locked, &event).await?;
        drop(locked);
        drop(guard);
        tracing::info!("allocation {} created for booking {booking_id} by {actor}", allocation.id);

        let mut notes = vec![Notification::new(
            Recipient::BookingOfficers,
            "Allocation Created",
            format!("Booking #{booking_id} has been allocated"),
        )];
        notes.extend(assignment_notes(booking_id, &set));
        self.deliver(notes);
        Ok(allocation)
    }

    /// Swap the resources of an ACTIVE allocation. Everything is checked
    /// against the locked rows before anything changes; a refusal leaves the
    /// old resource set and jeep statuses exactly as they were.
    pub async fn update_allocation(
        &self,
        allocation_id: Ulid,
        req: AllocationRequest,
        actor: &str,
    ) -> Result<Allocation, EngineError> {
        check_actor(actor)?;
        check_len(req.notes.as_deref(), MAX_ALLOCATION_NOTES_LEN, "allocation notes too long")?;
        let set = req.resources();

        let mut guard = self.resolve_entity_write(&allocation_id).await?;
        let alloc = guard
            .allocation(allocation_id)
            .ok_or(EngineError::NotFound(allocation_id))?;
        if !alloc.is_active() {
            return Err(not_active(alloc, "update"));
        }
        let booking_id = alloc.booking_id;
        let previous = alloc.resources;

        let mut locked = self.lock_resources(previous.ids().chain(set.ids())).await?;
        check_claims(&set, |id| locked.get(id), Some(allocation_id))?.into_result()?;

        let event = Event::AllocationUpdated {
            id: allocation_id,
            booking_id,
            previous,
            resources: set,
            notes: req.notes,
            at: self.now(),
            actor: actor.to_string(),
        };
        self.commit(Some(&mut *guard), &mut locked, &event).await?;
        drop(locked);
        let updated = guard
            .allocation(allocation_id)
            .cloned()
            .ok_or(EngineError::NotFound(allocation_id))?;
        drop(guard);
        tracing::info!("allocation {allocation_id} updated by {actor}");

        let added = ResourceSet {
            driver_id: set.driver_id.filter(|id| !previous.contains(*id)),
            guide_id: set.guide_id.filter(|id| !previous.contains(*id)),
            jeep_id: None,
        };
        self.deliver(assignment_notes(booking_id, &added));
        Ok(updated)
    }

    /// Release the allocation's resources and put the booking back in the
    /// crew's queue.
    pub async fn cancel_allocation(
        &self,
        allocation_id: Ulid,
        actor: &str,
    ) -> Result<Allocation, EngineError> {
        check_actor(actor)?;
        let mut guard = self.resolve_entity_write(&allocation_id).await?;
        let alloc = guard
            .allocation(allocation_id)
            .ok_or(EngineError::NotFound(allocation_id))?;
        if !alloc.is_active() {
            return Err(not_active(alloc, "cancel"));
        }
        let booking_id = alloc.booking_id;
        let released = alloc.resources;
        lifecycle::advance(&guard.booking, Transition::Deallocate)?;

        let mut locked = self.lock_resources(released.ids()).await?;
        let event = Event::AllocationCancelled {
            id: allocation_id,
            booking_id,
            released,
            at: self.now(),
            actor: actor.to_string(),
        };
        self.commit(Some(&mut *guard), &mut locked, &event).await?;
        drop(locked);
        tracing::info!("allocation {allocation_id} cancelled by {actor}");

        guard
            .allocation(allocation_id)
            .cloned()
            .ok_or(EngineError::NotFound(allocation_id))
    }
}
