//! Static graph validation (C3, spec §4.4): reachability, name uniqueness,
//! dangling edges, and edge type-compatibility. Pure metadata inspection —
//! never executes a node body.

use crate::error::ValidationIssue;
use crate::node::Node;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Walks the reachable node set from `start` and collects every violation
/// instead of stopping at the first one, so callers see the whole picture
/// (spec §4.4, "Return a composite error enumerating every violation").
pub fn validate(nodes: &HashMap<String, Arc<Node>>, start: &str) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if !nodes.contains_key(start) {
        issues.push(ValidationIssue::DanglingEdge(
            "<start>".to_string(),
            start.to_string(),
        ));
        return issues;
    }

    // Name uniqueness is already enforced by the map's key space at graph
    // construction; we still re-check each node's self-reported name
    // against its registry key, since a caller could in principle build
    // the map by hand with a mismatched name.
    let mut seen_names: HashSet<&str> = HashSet::new();
    for (key, node) in nodes {
        if node.name() != key {
            issues.push(ValidationIssue::DuplicateName(node.name().to_string()));
        }
        if !seen_names.insert(node.name()) {
            issues.push(ValidationIssue::DuplicateName(node.name().to_string()));
        }
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(start);
    visited.insert(start);

    while let Some(current_name) = queue.pop_front() {
        let current = match nodes.get(current_name) {
            Some(n) => n,
            None => continue,
        };

        for (action, successor_name) in current.successors() {
            match nodes.get(successor_name) {
                None => {
                    issues.push(ValidationIssue::DanglingEdge(
                        current_name.to_string(),
                        action.clone(),
                    ));
                }
                Some(successor) => {
                    if !current.output_type().assignable_to(successor.input_type()) {
                        issues.push(ValidationIssue::TypeMismatch {
                            from: current_name.to_string(),
                            action: action.clone(),
                            to: successor_name.clone(),
                            output_ty: current.output_type().to_string(),
                            input_ty: successor.input_type().to_string(),
                        });
                    }
                    if visited.insert(successor_name.as_str()) {
                        queue.push_back(successor_name.as_str());
                    }
                }
            }
        }
    }

    issues
}
