//! Desired vs. live listener diff.

use std::collections::BTreeSet;

use crate::types::ListenerKey;

/// Listeners to add and to drop so that the live set matches the desired
/// set observed when the plan was computed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub to_create: BTreeSet<ListenerKey>,
    pub to_remove: BTreeSet<ListenerKey>,
}

impl Plan {
    pub fn compute(desired: &BTreeSet<ListenerKey>, live: &BTreeSet<ListenerKey>) -> Self {
        Self {
            to_create: desired.difference(live).copied().collect(),
            to_remove: live.difference(desired).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_remove.is_empty()
    }
}
