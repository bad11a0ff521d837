use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, check_actor, check_len, count_event, normalize_plate};

/// A driver or guide to register.
#[derive(Debug, Clone, Default)]
pub struct NewStaff {
    pub name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewJeep {
    pub model: String,
    pub plate: String,
    pub capacity: u32,
    pub default_driver: Option<Ulid>,
}

impl Engine {
    pub async fn register_driver(&self, staff: NewStaff, actor: &str) -> Result<Ulid, EngineError> {
        self.register_staff(ResourceKind::Driver, staff, actor).await
    }

    pub async fn register_guide(&self, staff: NewStaff, actor: &str) -> Result<Ulid, EngineError> {
        self.register_staff(ResourceKind::Guide, staff, actor).await
    }

    async fn register_staff(
        &self,
        kind: ResourceKind,
        staff: NewStaff,
        actor: &str,
    ) -> Result<Ulid, EngineError> {
        check_actor(actor)?;
        check_len(Some(&staff.name), MAX_NAME_LEN, "name too long")?;
        check_len(staff.phone.as_deref(), MAX_PHONE_LEN, "phone number too long")?;

        let resource = ResourceState {
            id: Ulid::new(),
            kind,
            name: staff.name,
            phone: staff.phone,
            jeep: None,
            claimed_by: None,
        };
        self.insert_resource(resource, actor).await
    }

    pub async fn register_jeep(&self, jeep: NewJeep, actor: &str) -> Result<Ulid, EngineError> {
        check_actor(actor)?;
        check_len(Some(&jeep.model), MAX_NAME_LEN, "jeep model too long")?;
        let plate = normalize_plate(&jeep.plate);
        if plate.is_empty() {
            return Err(EngineError::LimitExceeded("plate number is empty"));
        }
        check_len(Some(&plate), MAX_PLATE_LEN, "plate number too long")?;
        if jeep.capacity == 0 || jeep.capacity > MAX_JEEP_CAPACITY {
            return Err(EngineError::LimitExceeded("jeep capacity out of range"));
        }
        if let Some(driver) = jeep.default_driver {
            self.ensure_kind(driver, ResourceKind::Driver).await?;
        }

        let id = Ulid::new();
        match self.plates.entry(plate.clone()) {
            Entry::Occupied(_) => return Err(EngineError::DuplicatePlate(plate)),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let resource = ResourceState {
            id,
            kind: ResourceKind::Jeep,
            name: jeep.model,
            phone: None,
            jeep: Some(JeepDetails {
                plate: plate.clone(),
                capacity: jeep.capacity,
                status: JeepStatus::Available,
                default_driver: jeep.default_driver,
            }),
            claimed_by: None,
        };
        let result = self.insert_resource(resource, actor).await;
        if result.is_err() {
            self.plates.remove(&plate);
        }
        result
    }

    async fn insert_resource(&self, resource: ResourceState, actor: &str) -> Result<Ulid, EngineError> {
        let _gate = self.row_gate.read().await;
        let id = resource.id;
        let kind = resource.kind;
        let event = Event::ResourceRegistered {
            resource: resource.clone(),
            at: self.now(),
            actor: actor.to_string(),
        };
        self.wal_append(&event).await?;
        self.resources.insert(id, Arc::new(RwLock::new(resource)));
        self.index_event(&event);
        count_event(&event);
        tracing::info!("{} {id} registered by {actor}", kind.as_str());
        Ok(id)
    }

    /// Maintenance-side status change. ALLOCATED belongs to the allocation
    /// manager; AVAILABLE and IN_USE must agree with the jeep's claim.
    pub async fn set_jeep_status(
        &self,
        jeep_id: Ulid,
        status: JeepStatus,
        actor: &str,
    ) -> Result<(), EngineError> {
        check_actor(actor)?;
        let mut locked = self.lock_resources([jeep_id]).await?;
        let rs = locked.get(jeep_id).ok_or(EngineError::NotFound(jeep_id))?;
        let current = rs.jeep_status().ok_or(EngineError::NotFound(jeep_id))?;

        let refused = match status {
            JeepStatus::Allocated => Some("set ALLOCATED on"),
            JeepStatus::Available if rs.claimed_by.is_some() => Some("set AVAILABLE on claimed"),
            JeepStatus::InUse if rs.claimed_by.is_none() => Some("set IN_USE on unclaimed"),
            _ => None,
        };
        if let Some(action) = refused {
            return Err(EngineError::InvalidState {
                id: jeep_id,
                status: current.as_str(),
                action,
            });
        }
        if current == status {
            return Ok(());
        }

        let event = Event::JeepStatusChanged { id: jeep_id, status };
        self.commit(None, &mut locked, &event).await?;
        tracing::info!("jeep {jeep_id}: {} -> {} by {actor}", current.as_str(), status.as_str());
        Ok(())
    }

    pub async fn set_default_driver(
        &self,
        jeep_id: Ulid,
        driver_id: Option<Ulid>,
        actor: &str,
    ) -> Result<(), EngineError> {
        check_actor(actor)?;
        if let Some(driver) = driver_id {
            self.ensure_kind(driver, ResourceKind::Driver).await?;
        }
        let mut locked = self.lock_resources([jeep_id]).await?;
        let is_jeep = locked
            .get(jeep_id)
            .is_some_and(|rs| rs.kind == ResourceKind::Jeep);
        if !is_jeep {
            return Err(EngineError::NotFound(jeep_id));
        }

        let event = Event::DefaultDriverSet { jeep_id, driver_id };
        self.commit(None, &mut locked, &event).await?;
        tracing::info!("jeep {jeep_id}: default driver {driver_id:?} set by {actor}");
        Ok(())
    }

    /// Kind never changes after registration, so a read lock is enough.
    async fn ensure_kind(&self, id: Ulid, kind: ResourceKind) -> Result<(), EngineError> {
        let row = self.resource_row(&id).ok_or(EngineError::NotFound(id))?;
        if row.read().await.kind != kind {
            return Err(EngineError::NotFound(id));
        }
        Ok(())
    }
}
