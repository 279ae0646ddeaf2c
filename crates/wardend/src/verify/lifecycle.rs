//! Lifecycle transitions driven by check outcomes.

use time::OffsetDateTime;

use crate::store::{LifecycleUpdate, NodeStatus, UnifiedNode};

/// What one check did to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A pending node passed and became verified.
    Promoted,
    /// A pending node failed without exceeding the threshold.
    StillPending,
    /// A pending node's counter exceeded the threshold and it was archived.
    Archived,
    /// A verified node passed.
    Confirmed,
    /// A verified node failed without exceeding the threshold.
    StillVerified,
    /// A verified node's counter exceeded the threshold and it went back to
    /// pending.
    Demoted,
}

/// Transition plus the fields to write back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Transition taken.
    pub transition: Transition,
    /// Lifecycle fields after the transition.
    pub update: LifecycleUpdate,
}

/// Applies one check result to `node`.
///
/// `failures` is the node's current consecutive-failure count as read from
/// the store. A success resets it to zero; a failure adds one. A pending node
/// whose counter exceeds `threshold` is archived. A verified node whose
/// counter exceeds it is demoted to pending with a fresh counter instead. A
/// counter equal to the threshold keeps the node where it is, so a threshold
/// of zero acts on the first failure. Archived nodes are never evaluated and
/// yield `None`.
#[must_use]
pub fn evaluate(
    node: &UnifiedNode,
    failures: u32,
    success: bool,
    threshold: u32,
    now: OffsetDateTime,
) -> Option<Evaluation> {
    let next_failures = failures.saturating_add(1);
    let keep = |status, consecutive_failures| LifecycleUpdate {
        status,
        consecutive_failures,
        checked_at: now,
        promoted_at: node.promoted_at,
        archived_at: node.archived_at,
    };
    let evaluation = match (node.status, success) {
        (NodeStatus::Archived, _) => return None,
        (NodeStatus::Pending, true) => Evaluation {
            transition: Transition::Promoted,
            update: LifecycleUpdate {
                promoted_at: Some(now),
                ..keep(NodeStatus::Verified, 0)
            },
        },
        (NodeStatus::Pending, false) if next_failures > threshold => Evaluation {
            transition: Transition::Archived,
            update: LifecycleUpdate {
                archived_at: Some(now),
                ..keep(NodeStatus::Archived, next_failures)
            },
        },
        (NodeStatus::Pending, false) => Evaluation {
            transition: Transition::StillPending,
            update: keep(NodeStatus::Pending, next_failures),
        },
        (NodeStatus::Verified, true) => Evaluation {
            transition: Transition::Confirmed,
            update: keep(NodeStatus::Verified, 0),
        },
        (NodeStatus::Verified, false) if next_failures > threshold => Evaluation {
            transition: Transition::Demoted,
            update: keep(NodeStatus::Pending, 0),
        },
        (NodeStatus::Verified, false) => Evaluation {
            transition: Transition::StillVerified,
            update: keep(NodeStatus::Verified, next_failures),
        },
    };
    Some(evaluation)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn at(status: NodeStatus) -> UnifiedNode {
        UnifiedNode::pending("n", "trojan", "192.0.2.7", 443).with_status(status)
    }

    #[rstest]
    #[case(NodeStatus::Pending, 0, true, Transition::Promoted, NodeStatus::Verified, 0)]
    #[case(NodeStatus::Pending, 0, false, Transition::StillPending, NodeStatus::Pending, 1)]
    #[case(NodeStatus::Pending, 2, false, Transition::StillPending, NodeStatus::Pending, 3)]
    #[case(NodeStatus::Pending, 3, false, Transition::Archived, NodeStatus::Archived, 4)]
    #[case(NodeStatus::Pending, 2, true, Transition::Promoted, NodeStatus::Verified, 0)]
    #[case(NodeStatus::Verified, 1, true, Transition::Confirmed, NodeStatus::Verified, 0)]
    #[case(NodeStatus::Verified, 1, false, Transition::StillVerified, NodeStatus::Verified, 2)]
    #[case(NodeStatus::Verified, 2, false, Transition::StillVerified, NodeStatus::Verified, 3)]
    #[case(NodeStatus::Verified, 3, false, Transition::Demoted, NodeStatus::Pending, 0)]
    fn transitions_at_threshold_three(
        #[case] status: NodeStatus,
        #[case] failures: u32,
        #[case] success: bool,
        #[case] transition: Transition,
        #[case] next_status: NodeStatus,
        #[case] next_failures: u32,
    ) {
        let now = OffsetDateTime::now_utc();
        let evaluation = evaluate(&at(status), failures, success, 3, now).expect("evaluated");
        assert_eq!(evaluation.transition, transition);
        assert_eq!(evaluation.update.status, next_status);
        assert_eq!(evaluation.update.consecutive_failures, next_failures);
        assert_eq!(evaluation.update.checked_at, now);
    }

    #[test]
    fn promotion_and_archival_are_stamped() {
        let now = OffsetDateTime::now_utc();
        let promoted = evaluate(&at(NodeStatus::Pending), 0, true, 3, now).expect("evaluated");
        assert_eq!(promoted.update.promoted_at, Some(now));
        assert_eq!(promoted.update.archived_at, None);

        let archived = evaluate(&at(NodeStatus::Pending), 5, false, 3, now).expect("evaluated");
        assert_eq!(archived.update.archived_at, Some(now));
    }

    #[test]
    fn verified_nodes_are_never_archived_directly() {
        let now = OffsetDateTime::now_utc();
        for failures in 0..10 {
            let evaluation =
                evaluate(&at(NodeStatus::Verified), failures, false, 3, now).expect("evaluated");
            assert_ne!(evaluation.update.status, NodeStatus::Archived);
        }
    }

    #[test]
    fn counter_tracks_any_interleaving_below_threshold() {
        let now = OffsetDateTime::now_utc();
        let outcomes = [false, false, true, false, true, true, false, false, false, true];
        let mut node = at(NodeStatus::Verified);
        let mut failures = 0;
        for success in outcomes {
            let evaluation = evaluate(&node, failures, success, 100, now).expect("evaluated");
            let expected = if success { 0 } else { failures + 1 };
            assert_eq!(evaluation.update.consecutive_failures, expected);
            failures = evaluation.update.consecutive_failures;
            node.status = evaluation.update.status;
        }
    }

    #[rstest]
    #[case(NodeStatus::Pending, Transition::StillPending)]
    #[case(NodeStatus::Verified, Transition::StillVerified)]
    fn counter_equal_to_threshold_keeps_status(
        #[case] status: NodeStatus,
        #[case] transition: Transition,
    ) {
        let now = OffsetDateTime::now_utc();
        for threshold in [1, 2, 5] {
            let evaluation = evaluate(&at(status), threshold - 1, false, threshold, now)
                .expect("evaluated");
            assert_eq!(evaluation.transition, transition);
            assert_eq!(evaluation.update.status, status);
            assert_eq!(evaluation.update.consecutive_failures, threshold);
        }
    }

    #[rstest]
    #[case(NodeStatus::Pending, Transition::Archived)]
    #[case(NodeStatus::Verified, Transition::Demoted)]
    fn zero_threshold_acts_on_the_first_failure(
        #[case] status: NodeStatus,
        #[case] transition: Transition,
    ) {
        let now = OffsetDateTime::now_utc();
        let evaluation = evaluate(&at(status), 0, false, 0, now).expect("evaluated");
        assert_eq!(evaluation.transition, transition);
    }

    #[test]
    fn archived_nodes_are_skipped() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(evaluate(&at(NodeStatus::Archived), 0, true, 3, now), None);
    }
}
