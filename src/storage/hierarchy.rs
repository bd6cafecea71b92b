//! # Group Hierarchy
//!
//! Groups are `/`-separated paths rooted at `/`. Aggregation cascades from
//! the groups an execution touched up to the root, children strictly before
//! parents.

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::constants::ROOT_GROUP;
use crate::error::StoreResult;

/// Resolves a group's ancestor chain, leaf first, root last
#[async_trait]
pub trait GroupHierarchy: Send + Sync {
    async fn ancestors(&self, group_id: &str) -> StoreResult<Vec<String>>;
}

/// Hierarchy derived purely from the shape of the group path
#[derive(Debug, Clone, Copy, Default)]
pub struct PathGroupHierarchy;

#[async_trait]
impl GroupHierarchy for PathGroupHierarchy {
    async fn ancestors(&self, group_id: &str) -> StoreResult<Vec<String>> {
        Ok(ancestor_chain(group_id))
    }
}

/// Trailing slashes removed, leading slash enforced
pub fn normalize(group_id: &str) -> String {
    let trimmed = group_id.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return ROOT_GROUP.to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

pub fn parent_of(group_id: &str) -> Option<String> {
    let group = normalize(group_id);
    if group == ROOT_GROUP {
        return None;
    }
    match group.rfind('/') {
        Some(0) | None => Some(ROOT_GROUP.to_string()),
        Some(idx) => Some(group[..idx].to_string()),
    }
}

/// Number of path segments; the root has depth 0
pub fn depth(group_id: &str) -> usize {
    normalize(group_id)
        .split('/')
        .filter(|segment| !segment.is_empty())
        .count()
}

/// `["/a/b", "/a", "/"]` for `/a/b`
pub fn ancestor_chain(group_id: &str) -> Vec<String> {
    let mut chain = vec![normalize(group_id)];
    while let Some(parent) = chain.last().and_then(|g| parent_of(g)) {
        chain.push(parent);
    }
    chain
}

pub fn is_ancestor_or_self(ancestor: &str, group_id: &str) -> bool {
    let ancestor = normalize(ancestor);
    let group = normalize(group_id);
    if ancestor == ROOT_GROUP || ancestor == group {
        return true;
    }
    group
        .strip_prefix(ancestor.as_str())
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Union of two leaf sets with every leaf that is an ancestor of another
/// leaf removed. Result is sorted.
pub fn merge_group_leaves(existing: &[String], incoming: &[String]) -> Vec<String> {
    let all: BTreeSet<String> = existing
        .iter()
        .chain(incoming.iter())
        .map(|g| normalize(g))
        .collect();
    all.iter()
        .filter(|leaf| {
            !all
                .iter()
                .any(|other| other != *leaf && is_ancestor_or_self(leaf, other))
        })
        .cloned()
        .collect()
}

/// Every group on the path from any leaf to the root, each once, deepest
/// first. Within one depth groups are ordered by path.
pub fn rollup_order(chains: &[Vec<String>]) -> Vec<String> {
    let mut groups: Vec<String> = chains
        .iter()
        .flatten()
        .map(|g| normalize(g))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    groups.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));
    groups
}
