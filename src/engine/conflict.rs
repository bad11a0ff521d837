use std::fmt;

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Claimed by another ACTIVE allocation.
    HeldBy(Ulid),
    /// Jeep is not in a status that can be handed out.
    JeepStatus(JeepStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub kind: ResourceKind,
    pub resource_id: Ulid,
    pub reason: ConflictReason,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            ConflictReason::HeldBy(alloc) => write!(
                f,
                "{} {} is held by allocation {alloc}",
                self.kind.as_str(),
                self.resource_id
            ),
            ConflictReason::JeepStatus(status) => write!(
                f,
                "jeep {} is {}",
                self.resource_id,
                status.as_str()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    NotRequested,
    Free,
    Conflict(ConflictReason),
}

/// Per-kind verdict for a requested driver/guide/jeep triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimCheck {
    pub requested: ResourceSet,
    pub driver: Availability,
    pub guide: Availability,
    pub jeep: Availability,
}

impl ClaimCheck {
    pub fn first_conflict(&self) -> Option<Conflict> {
        [
            (ResourceKind::Driver, self.requested.driver_id, self.driver),
            (ResourceKind::Guide, self.requested.guide_id, self.guide),
            (ResourceKind::Jeep, self.requested.jeep_id, self.jeep),
        ]
        .into_iter()
        .find_map(|(kind, id, availability)| match (id, availability) {
            (Some(resource_id), Availability::Conflict(reason)) => Some(Conflict {
                kind,
                resource_id,
                reason,
            }),
            _ => None,
        })
    }

    pub fn is_clear(&self) -> bool {
        self.first_conflict().is_none()
    }

    pub(super) fn into_result(self) -> Result<(), EngineError> {
        match self.first_conflict() {
            Some(conflict) => Err(EngineError::ResourceConflict(conflict)),
            None => Ok(()),
        }
    }
}

/// Can `rs` be claimed by an allocation? `exclude` is the allocation being
/// updated; its own claim does not count against it.
pub fn availability(rs: &ResourceState, exclude: Option<Ulid>) -> Availability {
    if let Some(holder) = rs.claimed_by
        && Some(holder) != exclude
    {
        return Availability::Conflict(ConflictReason::HeldBy(holder));
    }
    if let Some(status) = rs.jeep_status() {
        let kept = rs.claimed_by.is_some() && rs.claimed_by == exclude;
        let usable = status == JeepStatus::Available
            || (kept && matches!(status, JeepStatus::Allocated | JeepStatus::InUse));
        if !usable {
            return Availability::Conflict(ConflictReason::JeepStatus(status));
        }
    }
    Availability::Free
}

/// Evaluate every requested slot against the (locked) resource rows. Pure:
/// nothing is mutated. A missing row, or a row of the wrong kind, is `NotFound`.
pub fn check_claims<'a>(
    requested: &ResourceSet,
    lookup: impl Fn(Ulid) -> Option<&'a ResourceState>,
    exclude: Option<Ulid>,
) -> Result<ClaimCheck, EngineError> {
    let slot = |kind: ResourceKind, id: Option<Ulid>| -> Result<Availability, EngineError> {
        let Some(id) = id else {
            return Ok(Availability::NotRequested);
        };
        match lookup(id) {
            Some(rs) if rs.kind == kind => Ok(availability(rs, exclude)),
            _ => Err(EngineError::NotFound(id)),
        }
    };
    Ok(ClaimCheck {
        requested: *requested,
        driver: slot(ResourceKind::Driver, requested.driver_id)?,
        guide: slot(ResourceKind::Guide, requested.guide_id)?,
        jeep: slot(ResourceKind::Jeep, requested.jeep_id)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn staff(kind: ResourceKind) -> ResourceState {
        ResourceState {
            id: Ulid::new(),
            kind,
            name: "Wanjiru".into(),
            phone: None,
            jeep: None,
            claimed_by: None,
        }
    }

    fn jeep(status: JeepStatus) -> ResourceState {
        ResourceState {
            id: Ulid::new(),
            kind: ResourceKind::Jeep,
            name: "Land Cruiser".into(),
            phone: None,
            jeep: Some(JeepDetails {
                plate: "KDB 123C".into(),
                capacity: 7,
                status,
                default_driver: None,
            }),
            claimed_by: None,
        }
    }

    fn rows(list: &[&ResourceState]) -> HashMap<Ulid, ResourceState> {
        list.iter().map(|r| (r.id, (*r).clone())).collect()
    }

    #[test]
    fn free_resources_pass() {
        let d = staff(ResourceKind::Driver);
        let j = jeep(JeepStatus::Available);
        let map = rows(&[&d, &j]);
        let req = ResourceSet {
            driver_id: Some(d.id),
            guide_id: None,
            jeep_id: Some(j.id),
        };
        let check = check_claims(&req, |id| map.get(&id), None).unwrap();
        assert_eq!(check.driver, Availability::Free);
        assert_eq!(check.guide, Availability::NotRequested);
        assert_eq!(check.jeep, Availability::Free);
        assert!(check.is_clear());
    }

    #[test]
    fn claimed_driver_cites_holder() {
        let holder = Ulid::new();
        let mut d = staff(ResourceKind::Driver);
        d.claim(holder);
        let map = rows(&[&d]);
        let req = ResourceSet {
            driver_id: Some(d.id),
            ..Default::default()
        };
        let check = check_claims(&req, |id| map.get(&id), None).unwrap();
        assert_eq!(
            check.first_conflict(),
            Some(Conflict {
                kind: ResourceKind::Driver,
                resource_id: d.id,
                reason: ConflictReason::HeldBy(holder),
            })
        );

        // The holder itself may keep it
        let check = check_claims(&req, |id| map.get(&id), Some(holder)).unwrap();
        assert!(check.is_clear());
    }

    #[test]
    fn jeep_in_maintenance_is_unavailable() {
        let j = jeep(JeepStatus::UnderRepair);
        let map = rows(&[&j]);
        let req = ResourceSet {
            jeep_id: Some(j.id),
            ..Default::default()
        };
        let check = check_claims(&req, |id| map.get(&id), None).unwrap();
        assert_eq!(
            check.jeep,
            Availability::Conflict(ConflictReason::JeepStatus(JeepStatus::UnderRepair))
        );
    }

    #[test]
    fn kept_jeep_may_be_in_use() {
        let alloc = Ulid::new();
        let mut j = jeep(JeepStatus::Available);
        j.claim(alloc);
        j.jeep.as_mut().unwrap().status = JeepStatus::InUse;
        assert_eq!(availability(&j, Some(alloc)), Availability::Free);
        assert_eq!(
            availability(&j, None),
            Availability::Conflict(ConflictReason::HeldBy(alloc))
        );
    }

    #[test]
    fn kept_jeep_in_maintenance_conflicts() {
        let alloc = Ulid::new();
        let mut j = jeep(JeepStatus::Available);
        j.claim(alloc);
        j.jeep.as_mut().unwrap().status = JeepStatus::Maintenance;
        assert_eq!(
            availability(&j, Some(alloc)),
            Availability::Conflict(ConflictReason::JeepStatus(JeepStatus::Maintenance))
        );
    }

    #[test]
    fn wrong_kind_is_not_found() {
        let g = staff(ResourceKind::Guide);
        let map = rows(&[&g]);
        let req = ResourceSet {
            driver_id: Some(g.id),
            ..Default::default()
        };
        assert!(matches!(
            check_claims(&req, |id| map.get(&id), None),
            Err(EngineError::NotFound(id)) if id == g.id
        ));
    }

    #[test]
    fn missing_row_is_not_found() {
        let req = ResourceSet {
            guide_id: Some(Ulid::new()),
            ..Default::default()
        };
        let empty: HashMap<Ulid, ResourceState> = HashMap::new();
        assert!(matches!(
            check_claims(&req, |id| empty.get(&id), None),
            Err(EngineError::NotFound(_))
        ));
    }
}
