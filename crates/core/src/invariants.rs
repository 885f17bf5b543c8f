//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use std::collections::HashSet;

use crate::models::{ChatMessage, Plan};

/// Check a plan produced by a local edit. Plans from outside go through
/// [`Plan::validate`] instead.
pub fn assert_plan_invariants(plan: &Plan) {
    for (index, phase) in plan.phases.iter().enumerate() {
        // Assignments only reference declared roles
        for role in phase.assignments.keys() {
            debug_assert!(
                phase.roles.iter().any(|r| r == role),
                "Plan '{}' phase {} assigns undeclared role '{}'",
                plan.title,
                index,
                role
            );
        }

        // No participant claims the same role twice
        for (role, users) in &phase.assignments {
            let unique: HashSet<_> = users.iter().collect();
            debug_assert!(
                unique.len() == users.len(),
                "Plan '{}' phase {} has duplicate members in role '{}'",
                plan.title,
                index,
                role
            );
        }
    }
}

/// Validate that a chat view is sorted and free of duplicates
pub fn assert_chat_invariants(messages: &[ChatMessage]) {
    debug_assert!(
        messages
            .windows(2)
            .all(|w| w[0].created_at <= w[1].created_at),
        "Chat messages out of order"
    );

    let ids: HashSet<_> = messages.iter().map(|m| m.id).collect();
    debug_assert!(ids.len() == messages.len(), "Duplicate chat messages");
}
