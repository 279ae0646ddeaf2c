//! Iterative exclusion of nodes the engine refuses to load.
//!
//! A batch is checked as a whole. When the engine rejects it, the offending
//! nodes are located from the check output, excluded, and the remaining
//! candidates are checked again. A single malformed node therefore never
//! sinks the rest of the batch.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::PROBE_TARGET;
use super::document::{ProbeLayout, SYSTEM_OUTBOUNDS};
use super::parser::{ErrorParser, Exclusion};
use super::tags::probe_index;
use crate::store::{NodeKey, UnifiedNode};

/// Iterations allowed beyond one per node.
pub const ITERATION_MARGIN: usize = 5;

/// Dry-run validation of a rendered configuration.
pub trait ConfigCheck {
    /// Checks `document` without opening listeners.
    fn check(&self, document: &Value) -> Result<(), CheckError>;
}

/// Outcome of a rejected or impossible check.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckError {
    /// The engine refused the configuration.
    #[error("engine rejected configuration: {output}")]
    Rejected {
        /// Combined engine output.
        output: String,
    },
    /// The check could not be run at all.
    #[error("configuration check unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },
}

/// A node excluded from one probe run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokenNode {
    /// Position of the node in the list handed to validation. The probe
    /// manager drops duplicate identities first, so for probe sessions this
    /// is the index behind the node's `probe_<index>` tag, not its position
    /// in the caller's slice. Use `key` to find the node.
    pub index: usize,
    /// Display tag of the node.
    pub tag: String,
    /// Identity of the node.
    pub key: NodeKey,
    /// Why the engine refused it.
    pub error: String,
}

impl fmt::Display for BrokenNode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "#{} {}: {}", self.index, self.tag, self.error)
    }
}

fn summarise(broken: &[BrokenNode]) -> String {
    broken
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Nothing to validate.
    #[error("no nodes to validate")]
    NoNodes,
    /// Every node was excluded.
    #[error("all nodes broken: {}", summarise(.broken))]
    AllNodesBroken {
        /// Every excluded node and why.
        broken: Vec<BrokenNode>,
    },
    /// The engine rejected the batch without naming any remaining node.
    #[error("unrecoverable configuration error: {output}")]
    Unrecoverable {
        /// Engine output of the final check.
        output: String,
        /// Nodes excluded before giving up.
        broken: Vec<BrokenNode>,
    },
    /// The iteration bound was reached.
    #[error("validation gave up after {iterations} iterations")]
    IterationsExhausted {
        /// Iterations run.
        iterations: usize,
        /// Every node, all considered broken.
        broken: Vec<BrokenNode>,
    },
    /// The check could not be run.
    #[error("configuration check unavailable: {message}")]
    CheckUnavailable {
        /// Description of the failure.
        message: String,
    },
}

/// Accepted subset of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedNodes {
    /// Request indices of the accepted nodes, in request order.
    pub valid: Vec<usize>,
    /// Excluded nodes, in exclusion order.
    pub broken: Vec<BrokenNode>,
    /// Checks run before acceptance.
    pub iterations: usize,
}

impl ValidatedNodes {
    /// Accepted nodes paired with their request indices.
    pub fn accepted<'a>(
        &'a self,
        nodes: &'a [UnifiedNode],
    ) -> impl Iterator<Item = (usize, &'a UnifiedNode)> + 'a {
        self.valid
            .iter()
            .filter_map(|&index| nodes.get(index).map(|node| (index, node)))
    }
}

/// Finds the largest subset of `nodes` the engine accepts.
///
/// # Errors
///
/// Returns [`ValidationError::AllNodesBroken`] as soon as no candidate is
/// left, [`ValidationError::Unrecoverable`] when a rejection names no
/// remaining candidate, and [`ValidationError::IterationsExhausted`] after
/// `nodes.len() + ITERATION_MARGIN` checks.
pub fn validate_nodes(
    nodes: &[UnifiedNode],
    layout: &ProbeLayout,
    checker: &dyn ConfigCheck,
    parser: &dyn ErrorParser,
) -> Result<ValidatedNodes, ValidationError> {
    if nodes.is_empty() {
        return Err(ValidationError::NoNodes);
    }
    let mut candidates: Vec<usize> = (0..nodes.len()).collect();
    let mut broken = Vec::new();
    let limit = nodes.len() + ITERATION_MARGIN;

    for iteration in 1..=limit {
        if candidates.is_empty() {
            return Err(ValidationError::AllNodesBroken { broken });
        }
        let document = layout.render(
            candidates
                .iter()
                .filter_map(|&index| nodes.get(index).map(|node| (index, node))),
        );
        let output = match checker.check(&document) {
            Ok(()) => {
                debug!(
                    target: PROBE_TARGET,
                    iteration,
                    valid = candidates.len(),
                    broken = broken.len(),
                    "probe configuration accepted"
                );
                return Ok(ValidatedNodes {
                    valid: candidates,
                    broken,
                    iterations: iteration,
                });
            }
            Err(CheckError::Unavailable { message }) => {
                return Err(ValidationError::CheckUnavailable { message });
            }
            Err(CheckError::Rejected { output }) => output,
        };

        let excluded = exclusions_for(&candidates, nodes, parser.parse(&output), &mut broken);
        if excluded.is_empty() {
            warn!(
                target: PROBE_TARGET,
                iteration,
                output = %output.trim(),
                "engine rejection named no remaining node"
            );
            return Err(ValidationError::Unrecoverable { output, broken });
        }
        warn!(
            target: PROBE_TARGET,
            iteration,
            excluded = excluded.len(),
            remaining = candidates.len() - excluded.len(),
            "excluding nodes rejected by the engine"
        );
        candidates.retain(|index| !excluded.contains(index));
    }

    let broken = nodes
        .iter()
        .enumerate()
        .map(|(index, node)| BrokenNode {
            index,
            tag: node.tag.clone(),
            key: node.key(),
            error: format!("validation gave up after {limit} iterations"),
        })
        .collect();
    Err(ValidationError::IterationsExhausted {
        iterations: limit,
        broken,
    })
}

/// Maps parsed exclusions back to request indices, recording each new one.
fn exclusions_for(
    candidates: &[usize],
    nodes: &[UnifiedNode],
    exclusions: Vec<Exclusion>,
    broken: &mut Vec<BrokenNode>,
) -> BTreeSet<usize> {
    let mut excluded = BTreeSet::new();
    for exclusion in exclusions {
        let original = match &exclusion {
            Exclusion::Index { index, .. } => index
                .checked_sub(SYSTEM_OUTBOUNDS)
                .and_then(|position| candidates.get(position))
                .copied(),
            Exclusion::DuplicateTag { tag } => {
                probe_index(tag).filter(|index| candidates.contains(index))
            }
        };
        let Some(original) = original else {
            continue;
        };
        if !excluded.insert(original) {
            continue;
        }
        let Some(node) = nodes.get(original) else {
            continue;
        };
        broken.push(BrokenNode {
            index: original,
            tag: node.tag.clone(),
            key: node.key(),
            error: exclusion.reason(),
        });
    }
    excluded
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use rstest::{fixture, rstest};

    use super::*;
    use crate::probe::parser::EngineErrorParser;

    /// Rejects documents containing any outbound whose `type` is listed,
    /// reporting only the first offender like the engine does.
    struct ProtocolCheck {
        rejected: Vec<&'static str>,
        calls: RefCell<usize>,
    }

    impl ProtocolCheck {
        fn new(rejected: &[&'static str]) -> Self {
            Self {
                rejected: rejected.to_vec(),
                calls: RefCell::new(0),
            }
        }
    }

    impl ConfigCheck for ProtocolCheck {
        fn check(&self, document: &Value) -> Result<(), CheckError> {
            *self.calls.borrow_mut() += 1;
            let outbounds = document["outbounds"].as_array().cloned().unwrap_or_default();
            for (position, outbound) in outbounds.iter().enumerate() {
                let kind = outbound["type"].as_str().unwrap_or_default();
                if self.rejected.contains(&kind) {
                    return Err(CheckError::Rejected {
                        output: format!("outbounds[{position}]: unsupported protocol {kind}"),
                    });
                }
            }
            Ok(())
        }
    }

    #[fixture]
    fn layout() -> ProbeLayout {
        ProbeLayout::new(9090, 7890, "https://example.com/204")
    }

    fn batch(protocols: &[&str]) -> Vec<UnifiedNode> {
        protocols
            .iter()
            .enumerate()
            .map(|(index, protocol)| {
                let port = u16::try_from(10_000 + index).expect("port fits");
                UnifiedNode::pending(format!("node-{index}"), *protocol, "192.0.2.1", port)
            })
            .collect()
    }

    #[rstest]
    #[case(1)]
    #[case(7)]
    fn clean_batch_passes_first_time(layout: ProbeLayout, #[case] size: usize) {
        let nodes = batch(&vec!["trojan"; size]);
        let check = ProtocolCheck::new(&[]);
        let validated =
            validate_nodes(&nodes, &layout, &check, &EngineErrorParser).expect("valid batch");
        assert_eq!(validated.valid, (0..size).collect::<Vec<_>>());
        assert!(validated.broken.is_empty());
        assert_eq!(validated.iterations, 1);
    }

    #[rstest]
    #[case(0)]
    #[case(2)]
    #[case(4)]
    fn single_broken_node_is_excluded_within_two_checks(
        layout: ProbeLayout,
        #[case] broken_at: usize,
    ) {
        let mut protocols = vec!["trojan"; 5];
        if let Some(slot) = protocols.get_mut(broken_at) {
            *slot = "hysteria9";
        }
        let nodes = batch(&protocols);
        let check = ProtocolCheck::new(&["hysteria9"]);

        let validated =
            validate_nodes(&nodes, &layout, &check, &EngineErrorParser).expect("partial batch");

        assert!(validated.iterations <= 2);
        assert_eq!(validated.broken.len(), 1);
        let excluded = validated.broken.first().expect("one broken node");
        assert_eq!(excluded.index, broken_at);
        assert_eq!(excluded.tag, format!("node-{broken_at}"));
        assert!(!validated.valid.contains(&broken_at));
        assert_eq!(validated.valid.len(), 4);
    }

    #[rstest]
    fn offsets_account_for_earlier_exclusions(layout: ProbeLayout) {
        let nodes = batch(&["bad", "trojan", "bad", "trojan", "bad"]);
        let check = ProtocolCheck::new(&["bad"]);

        let validated =
            validate_nodes(&nodes, &layout, &check, &EngineErrorParser).expect("partial batch");

        assert_eq!(validated.valid, vec![1, 3]);
        let indices: Vec<_> = validated.broken.iter().map(|node| node.index).collect();
        assert_eq!(indices, vec![0, 2, 4]);
        assert_eq!(validated.iterations, 4);
    }

    #[rstest]
    #[case(1)]
    #[case(6)]
    fn fully_broken_batch_reports_every_node(layout: ProbeLayout, #[case] size: usize) {
        let nodes = batch(&vec!["bad"; size]);
        let check = ProtocolCheck::new(&["bad"]);

        let error = validate_nodes(&nodes, &layout, &check, &EngineErrorParser)
            .expect_err("nothing valid");

        let ValidationError::AllNodesBroken { broken } = &error else {
            panic!("expected AllNodesBroken, got {error:?}");
        };
        assert_eq!(broken.len(), size);
        assert!(error.to_string().contains("node-0"));
        assert_eq!(*check.calls.borrow(), size);
    }

    #[rstest]
    fn anonymous_rejection_is_unrecoverable(layout: ProbeLayout) {
        struct Opaque;
        impl ConfigCheck for Opaque {
            fn check(&self, _: &Value) -> Result<(), CheckError> {
                Err(CheckError::Rejected {
                    output: "FATAL[0000] read config: unexpected EOF".to_owned(),
                })
            }
        }
        let nodes = batch(&["trojan", "trojan"]);

        let error =
            validate_nodes(&nodes, &layout, &Opaque, &EngineErrorParser).expect_err("opaque error");

        assert!(matches!(
            error,
            ValidationError::Unrecoverable { ref broken, .. } if broken.is_empty()
        ));
    }

    #[rstest]
    fn group_outbound_errors_do_not_exclude_nodes(layout: ProbeLayout) {
        let nodes = batch(&["trojan", "trojan"]);
        let check = ProtocolCheck::new(&["urltest"]);

        let error =
            validate_nodes(&nodes, &layout, &check, &EngineErrorParser).expect_err("group error");

        assert!(matches!(error, ValidationError::Unrecoverable { .. }));
    }

    #[rstest]
    fn empty_request_is_rejected(layout: ProbeLayout) {
        let check = ProtocolCheck::new(&[]);
        assert_eq!(
            validate_nodes(&[], &layout, &check, &EngineErrorParser),
            Err(ValidationError::NoNodes)
        );
    }
}
