//! Schedule evaluation against the gateway clock.

use crate::RegistrySnapshot;
use clawbridge_core::{Clock, GatewayTimezone};
use std::sync::Arc;
use tracing::{debug, warn};

/// Answers whether an entity may be controlled right now.
#[derive(Debug, Clone, derive_new::new)]
pub struct ScheduleEvaluator {
    timezone: GatewayTimezone,
    clock: Arc<dyn Clock>,
}

impl ScheduleEvaluator {
    /// Whether the schedule with this id admits a call now.
    ///
    /// `None` (no schedule attached) always admits. A reference to a schedule
    /// that no longer exists does not.
    pub fn is_allowed_now(&self, snapshot: &RegistrySnapshot, schedule_id: Option<&str>) -> bool {
        let Some(schedule_id) = schedule_id else {
            return true;
        };
        let Some(schedule) = snapshot.schedule(schedule_id) else {
            warn!(schedule_id, "Policy references a missing schedule, denying");
            return false;
        };
        let local = self.timezone.to_local(self.clock.now());
        let allowed = schedule.allows(local);
        debug!(schedule_id, %local, allowed, "Schedule evaluated");
        allowed
    }

    /// Timezone schedules are read in.
    pub fn timezone(&self) -> GatewayTimezone {
        self.timezone
    }
}
