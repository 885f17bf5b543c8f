//! Room model - one durable collaborative document

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::{Plan, RoomId, UserId};

/// A collaborative session holding one shared plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    /// Creator; informational only
    pub host_id: UserId,
    pub game: String,
    pub active_plan: Option<Plan>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(host_id: UserId, game: String, active_plan: Option<Plan>) -> Self {
        Self {
            id: RoomId::new(),
            host_id,
            game,
            active_plan,
            created_at: Utc::now().trunc_subsecs(6),
        }
    }

    /// A room "has a plan" only when the plan carries at least one phase
    pub fn has_plan(&self) -> bool {
        self.active_plan.as_ref().is_some_and(Plan::has_phases)
    }
}
