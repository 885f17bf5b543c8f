//! Plan model - the shared mutable document of a room
//!
//! The only mutation primitive the store understands is whole-plan
//! replacement. The editing helpers here are read-modify-write steps on a
//! local copy; the caller then replaces the full document. Each helper
//! returns `true` when the plan actually changed, and treats an
//! out-of-range phase index as a no-op.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::UserId;
use crate::error::{Error, Result};

/// A phase vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Keep,
    Reroll,
}

/// Generated mission document shared by all participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub title: String,
    pub game: String,
    pub raid: String,
    pub vibe: String,
    pub squad_size: u32,
    /// Execution order of the mission
    pub phases: Vec<Phase>,
}

/// One step of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub name: String,
    pub text: String,
    pub quip: String,
    /// Minutes
    pub time: u32,
    /// Image reference
    pub meme: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Role name -> participants claiming it (several may share a role)
    #[serde(default)]
    pub assignments: BTreeMap<String, Vec<UserId>>,
    /// One vote per participant, last write wins
    #[serde(default)]
    pub votes: BTreeMap<UserId, Vote>,
}

/// Freshly generated content for a phase reroll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseContent {
    pub name: String,
    pub text: String,
    pub quip: String,
    pub time: u32,
    pub meme: Option<String>,
}

impl Phase {
    pub fn new(content: PhaseContent, roles: Vec<String>) -> Self {
        Self {
            name: content.name,
            text: content.text,
            quip: content.quip,
            time: content.time,
            meme: content.meme,
            roles,
            assignments: BTreeMap::new(),
            votes: BTreeMap::new(),
        }
    }

    /// Vote tally as (keep, reroll)
    pub fn tally(&self) -> (usize, usize) {
        let keep = self.votes.values().filter(|v| **v == Vote::Keep).count();
        (keep, self.votes.len() - keep)
    }

    pub fn is_assigned(&self, role: &str, user: UserId) -> bool {
        self.assignments
            .get(role)
            .is_some_and(|users| users.contains(&user))
    }
}

impl Plan {
    /// Check a plan that came from outside before it is applied or stored.
    ///
    /// Assignments must name declared roles and list each participant once.
    pub fn validate(&self) -> Result<()> {
        for (index, phase) in self.phases.iter().enumerate() {
            for (role, users) in &phase.assignments {
                if !phase.roles.iter().any(|r| r == role) {
                    return Err(Error::InvalidPlan(format!(
                        "phase {} assigns undeclared role '{}'",
                        index, role
                    )));
                }
                let mut seen = Vec::with_capacity(users.len());
                for user in users {
                    if seen.contains(&user) {
                        return Err(Error::InvalidPlan(format!(
                            "phase {} lists a participant twice in role '{}'",
                            index, role
                        )));
                    }
                    seen.push(user);
                }
            }
        }
        Ok(())
    }

    /// A plan is considered present only when it has phases
    pub fn has_phases(&self) -> bool {
        !self.phases.is_empty()
    }

    /// Total mission time in minutes
    pub fn total_time(&self) -> u32 {
        self.phases.iter().map(|p| p.time).sum()
    }

    /// Replace one phase's generated content.
    ///
    /// Votes reset; roles and assignments survive the reroll.
    pub fn reroll_phase(&mut self, index: usize, content: PhaseContent) -> bool {
        let Some(phase) = self.phases.get_mut(index) else {
            return false;
        };
        phase.name = content.name;
        phase.text = content.text;
        phase.quip = content.quip;
        phase.time = content.time;
        phase.meme = content.meme;
        phase.votes.clear();
        true
    }

    /// Record `user`'s vote on a phase, overwriting any previous vote
    pub fn cast_vote(&mut self, index: usize, user: UserId, vote: Vote) -> bool {
        let Some(phase) = self.phases.get_mut(index) else {
            return false;
        };
        phase.votes.insert(user, vote) != Some(vote)
    }

    /// Add `user` to a role; repeated assignment is a no-op
    pub fn assign_role(&mut self, index: usize, role: &str, user: UserId) -> bool {
        let Some(phase) = self.phases.get_mut(index) else {
            return false;
        };
        if !phase.roles.iter().any(|r| r == role) {
            return false;
        }
        let users = phase.assignments.entry(role.to_string()).or_default();
        if users.contains(&user) {
            return false;
        }
        users.push(user);
        true
    }

    /// Remove `user` from a role
    pub fn unassign_role(&mut self, index: usize, role: &str, user: UserId) -> bool {
        let Some(phase) = self.phases.get_mut(index) else {
            return false;
        };
        let Some(users) = phase.assignments.get_mut(role) else {
            return false;
        };
        let before = users.len();
        users.retain(|u| *u != user);
        let changed = users.len() != before;
        if users.is_empty() {
            phase.assignments.remove(role);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(name: &str) -> PhaseContent {
        PhaseContent {
            name: name.to_string(),
            text: format!("{} text", name),
            quip: "no plan survives contact".to_string(),
            time: 5,
            meme: Some(format!("https://memes.example/{}.gif", name)),
        }
    }

    fn sample_plan() -> Plan {
        let roles = vec!["Tank".to_string(), "Healer".to_string()];
        Plan {
            title: "Operation Wipe".to_string(),
            game: "Destiny 2".to_string(),
            raid: "Vault of Glass".to_string(),
            vibe: "chaotic".to_string(),
            squad_size: 6,
            phases: vec![
                Phase::new(content("Entry"), roles.clone()),
                Phase::new(content("Boss"), roles.clone()),
                Phase::new(content("Loot"), roles),
            ],
        }
    }

    #[test]
    fn test_validate_rejects_bad_assignments() {
        let user = UserId::new();
        let mut plan = sample_plan();
        plan.assign_role(0, "Tank", user);
        assert!(plan.validate().is_ok());

        let mut undeclared = plan.clone();
        undeclared.phases[1]
            .assignments
            .insert("Bard".to_string(), vec![user]);
        assert!(matches!(undeclared.validate(), Err(Error::InvalidPlan(_))));

        let mut doubled = plan;
        doubled.phases[0]
            .assignments
            .insert("Tank".to_string(), vec![user, user]);
        assert!(matches!(doubled.validate(), Err(Error::InvalidPlan(_))));
    }

    #[test]
    fn test_plan_json_shape() {
        let plan = sample_plan();
        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["squadSize"], 6);
        assert_eq!(value["phases"].as_array().unwrap().len(), 3);

        let back: Plan = serde_json::from_value(value).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn test_phase_defaults_when_missing() {
        let json = r#"{"name":"Entry","text":"t","quip":"q","time":3,"meme":null}"#;
        let phase: Phase = serde_json::from_str(json).unwrap();
        assert!(phase.roles.is_empty());
        assert!(phase.votes.is_empty());
    }

    #[test]
    fn test_vote_idempotent_and_overwrites() {
        let mut plan = sample_plan();
        let user = UserId::new();

        assert!(plan.cast_vote(0, user, Vote::Keep));
        assert!(!plan.cast_vote(0, user, Vote::Keep));
        assert_eq!(plan.phases[0].votes.get(&user), Some(&Vote::Keep));
        assert_eq!(plan.phases[0].votes.len(), 1);

        assert!(plan.cast_vote(0, user, Vote::Reroll));
        assert_eq!(plan.phases[0].votes.get(&user), Some(&Vote::Reroll));
        assert_eq!(plan.phases[0].votes.len(), 1);
        assert_eq!(plan.phases[0].tally(), (0, 1));
    }

    #[test]
    fn test_reroll_keeps_roles_and_assignments() {
        let mut plan = sample_plan();
        let user = UserId::new();
        plan.assign_role(1, "Tank", user);
        plan.cast_vote(1, user, Vote::Reroll);

        assert!(plan.reroll_phase(1, content("Boss v2")));

        let phase = &plan.phases[1];
        assert_eq!(phase.name, "Boss v2");
        assert!(phase.votes.is_empty());
        assert!(phase.is_assigned("Tank", user));
        assert_eq!(phase.roles, vec!["Tank".to_string(), "Healer".to_string()]);
        // Other phases untouched
        assert_eq!(plan.phases[0].name, "Entry");
        assert_eq!(plan.phases[2].name, "Loot");
    }

    #[test]
    fn test_assign_is_idempotent() {
        let mut plan = sample_plan();
        let a = UserId::new();
        let b = UserId::new();

        assert!(plan.assign_role(0, "Healer", a));
        assert!(!plan.assign_role(0, "Healer", a));
        assert!(plan.assign_role(0, "Healer", b));
        assert_eq!(plan.phases[0].assignments["Healer"], vec![a, b]);

        // Unknown role is ignored
        assert!(!plan.assign_role(0, "Bard", a));
    }

    #[test]
    fn test_unassign() {
        let mut plan = sample_plan();
        let a = UserId::new();
        plan.assign_role(2, "Tank", a);

        assert!(plan.unassign_role(2, "Tank", a));
        assert!(!plan.phases[2].assignments.contains_key("Tank"));
        assert!(!plan.unassign_role(2, "Tank", a));
    }

    #[test]
    fn test_out_of_range_index_is_noop() {
        let mut plan = sample_plan();
        let before = plan.clone();
        let user = UserId::new();

        assert!(!plan.reroll_phase(7, content("Ghost")));
        assert!(!plan.cast_vote(3, user, Vote::Keep));
        assert!(!plan.assign_role(99, "Tank", user));
        assert!(!plan.unassign_role(99, "Tank", user));
        assert_eq!(plan, before);
    }

    #[test]
    fn test_total_time() {
        assert_eq!(sample_plan().total_time(), 15);
    }
}
