//! Exposure registry: entity policies, schedules and groups.
//!
//! Readers take an immutable [`RegistrySnapshot`] per request. Writers are
//! serialized, stage their change on a copy of the current snapshot, persist
//! it, and only then publish it. A failed write leaves both disk and memory
//! exactly as they were.

use crate::JsonStore;
use crate::ids::prefixed_id;
use clawbridge_core::{
    AccessLevel, DomainTables, EntityGroup, EntityPolicy, Schedule, entity_domain,
};
use clawbridge_error::{ClawbridgeResult, MediationError, MediationErrorKind};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Maximum group and schedule name length in characters.
const MAX_NAME_CHARS: usize = 100;

/// Immutable view of the registry at one point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, derive_getters::Getters)]
pub struct RegistrySnapshot {
    /// Policies by entity id
    #[serde(default)]
    policies: BTreeMap<String, EntityPolicy>,
    /// Schedules by id
    #[serde(default)]
    schedules: BTreeMap<String, Schedule>,
    /// Groups by id
    #[serde(default)]
    groups: BTreeMap<String, EntityGroup>,
    /// Incremented on every published change
    #[serde(skip)]
    version: u64,
}

impl RegistrySnapshot {
    /// Policy of an entity, if one was ever written.
    pub fn policy(&self, entity_id: &str) -> Option<&EntityPolicy> {
        self.policies.get(entity_id)
    }

    /// Policy of an entity if it is visible to clients.
    pub fn exposed_policy(&self, entity_id: &str) -> Option<&EntityPolicy> {
        self.policy(entity_id)
            .filter(|policy| policy.access_level().is_visible())
    }

    /// Effective access level; absence means `off`.
    pub fn access_level(&self, entity_id: &str) -> AccessLevel {
        self.policy(entity_id)
            .map(|policy| *policy.access_level())
            .unwrap_or_default()
    }

    /// All entities whose level is above `off`.
    pub fn exposed(&self) -> impl Iterator<Item = (&String, &EntityPolicy)> {
        self.policies
            .iter()
            .filter(|(_, policy)| policy.access_level().is_visible())
    }

    /// Schedule by id.
    pub fn schedule(&self, schedule_id: &str) -> Option<&Schedule> {
        self.schedules.get(schedule_id)
    }

    /// Ids of the groups an entity belongs to.
    pub fn groups_of(&self, entity_id: &str) -> Vec<String> {
        self.groups
            .values()
            .filter(|group| group.entities().contains(entity_id))
            .map(|group| group.id().clone())
            .collect()
    }
}

/// Operator listing view of one policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyView {
    /// Entity id
    pub entity_id: String,
    /// The stored policy
    #[serde(flatten)]
    pub policy: EntityPolicy,
    /// Groups the entity belongs to
    pub groups: Vec<String>,
}

/// Operator input for a new schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSchedule {
    /// Display name
    pub name: String,
    /// `HH:MM`
    pub start: String,
    /// `HH:MM`
    pub end: String,
    /// Weekdays `0 = Monday`; empty means every day
    #[serde(default)]
    pub days: Vec<u8>,
}

/// Operator input for a schedule change. Unset fields stay as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    /// New display name
    pub name: Option<String>,
    /// New start, `HH:MM`
    pub start: Option<String>,
    /// New end, `HH:MM`
    pub end: Option<String>,
    /// New weekday set
    pub days: Option<Vec<u8>>,
}

/// Operator input for a new group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGroup {
    /// Display name
    pub name: String,
    /// Members
    #[serde(default)]
    pub entities: BTreeSet<String>,
    /// Icon hint
    #[serde(default)]
    pub icon: Option<String>,
}

/// Operator input for a group change. Unset fields stay as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupUpdate {
    /// New display name
    pub name: Option<String>,
    /// New member set
    pub entities: Option<BTreeSet<String>>,
    /// New icon hint
    pub icon: Option<String>,
}

#[track_caller]
fn invalid(message: impl Into<String>) -> MediationError {
    MediationError::new(MediationErrorKind::InvalidPolicy(message.into()))
}

#[track_caller]
fn not_found(message: impl Into<String>) -> MediationError {
    MediationError::new(MediationErrorKind::NotFound(message.into()))
}

fn bounded_name(name: &str) -> Result<String, MediationError> {
    let name: String = name.trim().chars().take(MAX_NAME_CHARS).collect();
    if name.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    Ok(name)
}

fn parse_days(days: &[u8]) -> Result<Vec<u8>, MediationError> {
    if let Some(day) = days.iter().find(|d| **d > 6) {
        return Err(invalid(format!("weekday {} is outside 0..=6", day)));
    }
    Ok(days.to_vec())
}

fn parse_time(text: &str) -> Result<chrono::NaiveTime, MediationError> {
    Schedule::parse_time(text).map_err(|e| invalid(e.message))
}

/// Durable mapping from entity to access policy.
#[derive(Debug)]
pub struct ExposureRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    writer: Mutex<()>,
    store: JsonStore,
    tables: DomainTables,
}

impl ExposureRegistry {
    /// Load the registry from its store.
    ///
    /// Stored policies that violate the current domain tables (for example a
    /// `control` grant on a domain that has since become read-only) are
    /// downgraded to `read`, and references to missing schedules are dropped.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the document exists but cannot be read.
    #[instrument(skip_all, fields(path = %store.path().display()))]
    pub fn open(store: JsonStore, tables: DomainTables) -> ClawbridgeResult<Self> {
        let mut snapshot: RegistrySnapshot = store.load()?;
        let schedule_ids: BTreeSet<String> = snapshot.schedules.keys().cloned().collect();
        for (entity_id, policy) in snapshot.policies.iter_mut() {
            let ceiling = tables.max_level_for(entity_id);
            if *policy.access_level() > ceiling {
                warn!(entity_id = %entity_id, level = %policy.access_level(), "Downgrading grant on read-only domain");
                policy.set_access_level(ceiling);
            }
            if policy
                .schedule_id()
                .as_ref()
                .is_some_and(|id| !schedule_ids.contains(id))
            {
                warn!(entity_id = %entity_id, "Dropping reference to missing schedule");
                policy.clear_schedule();
            }
        }
        info!(
            policies = snapshot.policies.len(),
            schedules = snapshot.schedules.len(),
            groups = snapshot.groups.len(),
            "Exposure registry loaded"
        );
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
            store,
            tables,
        })
    }

    /// The current snapshot. Cheap; take one per request.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    /// Version of the current snapshot.
    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Domain tables the registry validates against.
    pub fn tables(&self) -> &DomainTables {
        &self.tables
    }

    /// Policy of one entity.
    pub fn get(&self, entity_id: &str) -> Option<EntityPolicy> {
        self.snapshot().policy(entity_id).cloned()
    }

    /// Every stored policy with its group membership.
    pub fn list_policies(&self) -> Vec<PolicyView> {
        let snapshot = self.snapshot();
        snapshot
            .policies
            .iter()
            .map(|(entity_id, policy)| PolicyView {
                entity_id: entity_id.clone(),
                policy: policy.clone(),
                groups: snapshot.groups_of(entity_id),
            })
            .collect()
    }

    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut RegistrySnapshot) -> ClawbridgeResult<T>,
    ) -> ClawbridgeResult<T> {
        let _writer = self.writer.lock();
        let mut next = RegistrySnapshot::clone(&self.snapshot());
        let out = change(&mut next)?;
        self.store.save(&next)?;
        next.version += 1;
        *self.current.write() = Arc::new(next);
        debug!("Registry snapshot published");
        Ok(out)
    }

    fn validate(
        &self,
        entity_id: &str,
        policy: &EntityPolicy,
        snapshot: &RegistrySnapshot,
    ) -> Result<(), MediationError> {
        let Some(domain) = entity_domain(entity_id) else {
            return Err(invalid(format!("'{}' is not a domain-qualified entity id", entity_id)));
        };
        if policy.access_level().can_invoke() && self.tables.is_read_only_domain(domain) {
            return Err(invalid(format!(
                "{} cannot be granted {}: domain {} is read-only",
                entity_id,
                policy.access_level(),
                domain
            )));
        }
        if let Some((param, _)) = policy.constraints().iter().find(|(_, c)| !c.is_valid()) {
            return Err(invalid(format!("constraint on {} has min above max", param)));
        }
        if let Some(schedule_id) = policy.schedule_id() {
            if !snapshot.schedules.contains_key(schedule_id) {
                return Err(invalid(format!("unknown schedule '{}'", schedule_id)));
            }
        }
        Ok(())
    }

    /// Write one entity's policy.
    ///
    /// # Errors
    ///
    /// `InvalidPolicy` for a `confirm`/`control` grant on a read-only domain, an
    /// incoherent constraint or an unknown schedule; a storage error when the
    /// write cannot be persisted.
    #[instrument(skip(self, policy), fields(level = %policy.access_level()))]
    pub fn set(&self, entity_id: &str, policy: EntityPolicy) -> ClawbridgeResult<()> {
        self.bulk_set(BTreeMap::from([(entity_id.to_string(), policy)]))
    }

    /// Write several policies as one atomic change.
    ///
    /// # Errors
    ///
    /// Fails as a whole if any single policy would fail [`set`](Self::set).
    #[instrument(skip_all, fields(count = policies.len()))]
    pub fn bulk_set(&self, policies: BTreeMap<String, EntityPolicy>) -> ClawbridgeResult<()> {
        self.mutate(|snapshot| {
            for (entity_id, mut policy) in policies {
                policy.normalize_annotation();
                self.validate(&entity_id, &policy, snapshot)?;
                snapshot.policies.insert(entity_id, policy);
            }
            Ok(())
        })?;
        info!("Policies updated");
        Ok(())
    }

    /// Remove an entity's policy. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the write cannot be persisted.
    #[instrument(skip(self))]
    pub fn delete(&self, entity_id: &str) -> ClawbridgeResult<bool> {
        if self.snapshot().policy(entity_id).is_none() {
            return Ok(false);
        }
        self.mutate(|snapshot| Ok(snapshot.policies.remove(entity_id).is_some()))
    }

    /// Create a schedule with a fresh `sch_` id.
    ///
    /// # Errors
    ///
    /// `InvalidPolicy` for an empty name, an unparsable time or a bad weekday.
    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub fn create_schedule(&self, draft: NewSchedule) -> ClawbridgeResult<Schedule> {
        let name = bounded_name(&draft.name)?;
        let start = parse_time(&draft.start)?;
        let end = parse_time(&draft.end)?;
        let days = parse_days(&draft.days)?;
        let schedule = self.mutate(|snapshot| {
            let mut id = prefixed_id("sch_", 6);
            while snapshot.schedules.contains_key(&id) {
                id = prefixed_id("sch_", 6);
            }
            let schedule = Schedule::new(id.clone(), name, start, end, days);
            snapshot.schedules.insert(id, schedule.clone());
            Ok(schedule)
        })?;
        info!(schedule_id = %schedule.id(), "Schedule created");
        Ok(schedule)
    }

    /// Change a schedule in place.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `InvalidPolicy` for bad input.
    #[instrument(skip(self, update))]
    pub fn update_schedule(&self, schedule_id: &str, update: ScheduleUpdate) -> ClawbridgeResult<Schedule> {
        let name = update.name.as_deref().map(bounded_name).transpose()?;
        let start = update.start.as_deref().map(parse_time).transpose()?;
        let end = update.end.as_deref().map(parse_time).transpose()?;
        let days = update.days.as_deref().map(parse_days).transpose()?;
        self.mutate(|snapshot| {
            let schedule = snapshot
                .schedules
                .get_mut(schedule_id)
                .ok_or_else(|| not_found(format!("schedule {}", schedule_id)))?;
            if let Some(name) = name {
                schedule.set_name(name);
            }
            let start = start.unwrap_or(*schedule.start());
            let end = end.unwrap_or(*schedule.end());
            schedule.set_window(start, end);
            if let Some(days) = days {
                schedule.set_days(days);
            }
            Ok(schedule.clone())
        })
    }

    /// Delete a schedule and clear every reference to it.
    ///
    /// Returns how many policies referenced it.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    #[instrument(skip(self))]
    pub fn delete_schedule(&self, schedule_id: &str) -> ClawbridgeResult<usize> {
        let cleared = self.mutate(|snapshot| {
            if snapshot.schedules.remove(schedule_id).is_none() {
                return Err(not_found(format!("schedule {}", schedule_id)).into());
            }
            let mut cleared = 0;
            for policy in snapshot.policies.values_mut() {
                if policy.schedule_id().as_deref() == Some(schedule_id) {
                    policy.clear_schedule();
                    cleared += 1;
                }
            }
            Ok(cleared)
        })?;
        info!(cleared, "Schedule deleted");
        Ok(cleared)
    }

    /// Attach a schedule to an entity, or detach with `None`.
    ///
    /// # Errors
    ///
    /// `InvalidPolicy` for an unknown schedule or a malformed entity id.
    #[instrument(skip(self))]
    pub fn assign_schedule(&self, entity_id: &str, schedule_id: Option<&str>) -> ClawbridgeResult<()> {
        self.mutate(|snapshot| {
            let mut policy = snapshot.policy(entity_id).cloned().unwrap_or_default();
            match schedule_id {
                Some(id) => policy = policy.with_schedule_id(id.to_string()),
                None => policy.clear_schedule(),
            }
            self.validate(entity_id, &policy, snapshot)?;
            snapshot.policies.insert(entity_id.to_string(), policy);
            Ok(())
        })
    }

    /// Every schedule.
    pub fn list_schedules(&self) -> Vec<Schedule> {
        self.snapshot().schedules.values().cloned().collect()
    }

    fn check_members(entities: &BTreeSet<String>) -> Result<(), MediationError> {
        match entities.iter().find(|id| entity_domain(id).is_none()) {
            Some(id) => Err(invalid(format!("'{}' is not a domain-qualified entity id", id))),
            None => Ok(()),
        }
    }

    /// Create a group with a fresh `grp_` id.
    ///
    /// # Errors
    ///
    /// `InvalidPolicy` for an empty name or malformed member ids.
    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub fn create_group(&self, draft: NewGroup) -> ClawbridgeResult<EntityGroup> {
        let name = bounded_name(&draft.name)?;
        Self::check_members(&draft.entities)?;
        let group = self.mutate(|snapshot| {
            let mut id = prefixed_id("grp_", 6);
            while snapshot.groups.contains_key(&id) {
                id = prefixed_id("grp_", 6);
            }
            let icon = draft.icon.filter(|icon| !icon.is_empty());
            let group = EntityGroup::new(id.clone(), name, draft.entities, icon);
            snapshot.groups.insert(id, group.clone());
            Ok(group)
        })?;
        info!(group_id = %group.id(), "Group created");
        Ok(group)
    }

    /// Change a group in place.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `InvalidPolicy` for bad input.
    #[instrument(skip(self, update))]
    pub fn update_group(&self, group_id: &str, update: GroupUpdate) -> ClawbridgeResult<EntityGroup> {
        let name = update.name.as_deref().map(bounded_name).transpose()?;
        if let Some(entities) = &update.entities {
            Self::check_members(entities)?;
        }
        self.mutate(|snapshot| {
            let group = snapshot
                .groups
                .get_mut(group_id)
                .ok_or_else(|| not_found(format!("group {}", group_id)))?;
            if let Some(name) = name {
                group.set_name(name);
            }
            if let Some(entities) = update.entities {
                group.set_entities(entities);
            }
            if let Some(icon) = update.icon {
                group.set_icon(Some(icon).filter(|icon| !icon.is_empty()));
            }
            Ok(group.clone())
        })
    }

    /// Delete a group. Member policies are left untouched.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    #[instrument(skip(self))]
    pub fn delete_group(&self, group_id: &str) -> ClawbridgeResult<()> {
        self.mutate(|snapshot| match snapshot.groups.remove(group_id) {
            Some(_) => Ok(()),
            None => Err(not_found(format!("group {}", group_id)).into()),
        })
    }

    /// Every group.
    pub fn list_groups(&self) -> Vec<EntityGroup> {
        self.snapshot().groups.values().cloned().collect()
    }

    /// Apply one access level to every member of a group, atomically.
    ///
    /// `off` switches existing member policies off and creates none. Returns
    /// the number of policies written.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown group; `InvalidPolicy`, with nothing applied,
    /// when any member cannot hold the level.
    #[instrument(skip(self), fields(level = %level))]
    pub fn set_group_access(&self, group_id: &str, level: AccessLevel) -> ClawbridgeResult<usize> {
        let written = self.mutate(|snapshot| {
            let members = snapshot
                .groups
                .get(group_id)
                .ok_or_else(|| not_found(format!("group {}", group_id)))?
                .entities()
                .clone();
            let mut written = 0;
            for entity_id in members {
                let mut policy = match (snapshot.policies.get(&entity_id), level) {
                    (Some(existing), _) => existing.clone(),
                    (None, AccessLevel::Off) => continue,
                    (None, _) => EntityPolicy::default(),
                };
                policy.set_access_level(level);
                self.validate(&entity_id, &policy, snapshot)?;
                snapshot.policies.insert(entity_id, policy);
                written += 1;
            }
            Ok(written)
        })?;
        info!(written, "Group access level applied");
        Ok(written)
    }
}
