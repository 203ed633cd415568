//! Milestone rules
//!
//! Decides which milestone kinds are due for a connection. Whether a due
//! milestone is actually appended is settled by the store (one row per
//! connection and kind), so evaluating the rules repeatedly is harmless.

use super::level::age_days;
use chrono::{DateTime, Utc};
use kindred_common::models::{Connection, ConnectionLevel, MilestoneKind};
use serde::{Deserialize, Serialize};

/// Days after which `week_streak` is due
pub const WEEK_STREAK_DAYS: i64 = 7;

/// Days after which `month_anniversary` is due
pub const MONTH_ANNIVERSARY_DAYS: i64 = 30;

/// Interaction event kinds counted by the lifecycle manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Message,
    CallCompleted,
}

/// Input to the milestone rules for one evaluation
#[derive(Debug, Clone, Copy)]
pub struct MilestoneCheck {
    /// Count before this evaluation
    pub previous_count: u64,
    /// Count after this evaluation
    pub interaction_count: u64,
    /// Interaction that triggered the evaluation, `None` for time-only refreshes
    pub interaction: Option<InteractionKind>,
    /// Level after this evaluation
    pub level: ConnectionLevel,
    pub now: DateTime<Utc>,
}

/// Milestone kinds due and not yet recorded on `connection`, in emission order
pub fn due_milestones(connection: &Connection, check: &MilestoneCheck) -> Vec<MilestoneKind> {
    let age = age_days(connection.connected_at, check.now);

    let candidates = [
        (
            MilestoneKind::FirstMessage,
            check.previous_count == 0 && check.interaction_count >= 1,
        ),
        (
            MilestoneKind::CallCompleted,
            check.interaction == Some(InteractionKind::CallCompleted),
        ),
        (MilestoneKind::WeekStreak, age >= WEEK_STREAK_DAYS),
        (MilestoneKind::MonthAnniversary, age >= MONTH_ANNIVERSARY_DAYS),
        (
            MilestoneKind::SharedInterestUnlocked,
            check.level >= ConnectionLevel::Established,
        ),
    ];

    candidates
        .into_iter()
        .filter(|(kind, due)| *due && !connection.has_milestone(*kind))
        .map(|(kind, _)| kind)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use kindred_common::models::{ConnectionStatus, Milestone, PairKey};
    use uuid::Uuid;

    fn connection(milestones: &[MilestoneKind]) -> Connection {
        let connected_at = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        Connection {
            id: Uuid::new_v4(),
            pair: PairKey::new(Uuid::new_v4(), Uuid::new_v4()).unwrap(),
            level: ConnectionLevel::New,
            interaction_count: 0,
            connected_at,
            last_interaction_at: None,
            milestones: milestones
                .iter()
                .map(|kind| Milestone {
                    kind: *kind,
                    achieved_at: connected_at,
                })
                .collect(),
            status: ConnectionStatus::Active,
            blocked_by: None,
        }
    }

    fn check(days: i64, previous: u64, count: u64, interaction: Option<InteractionKind>) -> MilestoneCheck {
        MilestoneCheck {
            previous_count: previous,
            interaction_count: count,
            interaction,
            level: ConnectionLevel::New,
            now: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap() + Duration::days(days),
        }
    }

    #[test]
    fn test_first_interaction_is_first_message() {
        let due = due_milestones(&connection(&[]), &check(0, 0, 1, Some(InteractionKind::Message)));
        assert_eq!(due, vec![MilestoneKind::FirstMessage]);
    }

    #[test]
    fn test_second_interaction_is_not_first_message() {
        let due = due_milestones(&connection(&[]), &check(0, 1, 2, Some(InteractionKind::Message)));
        assert!(due.is_empty());
    }

    #[test]
    fn test_recorded_milestones_are_not_due_again() {
        let recorded = [MilestoneKind::FirstMessage, MilestoneKind::WeekStreak];
        let due = due_milestones(&connection(&recorded), &check(8, 0, 1, Some(InteractionKind::Message)));
        assert!(due.is_empty());
    }

    #[test]
    fn test_time_boundaries() {
        let due = due_milestones(&connection(&[]), &check(31, 3, 3, None));
        assert_eq!(due, vec![MilestoneKind::WeekStreak, MilestoneKind::MonthAnniversary]);
    }

    #[test]
    fn test_call_and_established_level() {
        let mut input = check(0, 4, 5, Some(InteractionKind::CallCompleted));
        input.level = ConnectionLevel::Established;
        let due = due_milestones(&connection(&[]), &input);
        assert_eq!(
            due,
            vec![MilestoneKind::CallCompleted, MilestoneKind::SharedInterestUnlocked]
        );
    }
}
