/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Broadcast group membership, owned by the registry's home thread.

use std::collections::HashMap;

use crate::identifier::BroadcastChannelId;

/// Name → members. Membership is an ordered list; duplicates are not
/// expected but are not rejected either, and unregistering removes one
/// occurrence.
#[derive(Debug, Default)]
pub(crate) struct BroadcastChannelRegistry {
    groups: HashMap<String, Vec<BroadcastChannelId>>,
}

impl BroadcastChannelRegistry {
    pub(crate) fn register_channel(&mut self, name: &str, id: BroadcastChannelId) {
        self.groups.entry(name.to_string()).or_default().push(id);
    }

    /// Remove the first occurrence of `id` from `name`. Returns false if it
    /// was not a member.
    pub(crate) fn unregister_channel(&mut self, name: &str, id: &BroadcastChannelId) -> bool {
        let Some(members) = self.groups.get_mut(name) else {
            return false;
        };
        let Some(position) = members.iter().position(|member| member == id) else {
            return false;
        };
        members.remove(position);
        if members.is_empty() {
            self.groups.remove(name);
        }
        true
    }

    /// Every member of `name` except `source`, in registration order.
    pub(crate) fn recipients<'a>(
        &'a self,
        name: &str,
        source: &'a BroadcastChannelId,
    ) -> impl Iterator<Item = BroadcastChannelId> + 'a {
        self.groups
            .get(name)
            .into_iter()
            .flatten()
            .filter(move |member| *member != source)
            .copied()
    }

    pub(crate) fn members(&self, name: &str) -> Vec<BroadcastChannelId> {
        self.groups.get(name).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Locality;

    fn id() -> BroadcastChannelId {
        BroadcastChannelId::generate(Locality(1))
    }

    #[test]
    fn test_recipients_exclude_source() {
        let mut groups = BroadcastChannelRegistry::default();
        let (c1, c2, c3) = (id(), id(), id());
        for c in [c1, c2, c3] {
            groups.register_channel("x", c);
        }
        groups.register_channel("y", id());

        assert_eq!(groups.recipients("x", &c1).collect::<Vec<_>>(), vec![c2, c3]);
        assert_eq!(groups.recipients("x", &c2).collect::<Vec<_>>(), vec![c1, c3]);
        assert_eq!(groups.recipients("missing", &c1).count(), 0);
    }

    #[test]
    fn test_unregister_removes_first_match() {
        let mut groups = BroadcastChannelRegistry::default();
        let (c1, c2) = (id(), id());
        groups.register_channel("x", c1);
        groups.register_channel("x", c2);
        groups.register_channel("x", c1);

        assert!(groups.unregister_channel("x", &c1));
        assert_eq!(groups.members("x"), vec![c2, c1]);

        // Not a member: silent.
        assert!(!groups.unregister_channel("x", &id()));
        assert!(!groups.unregister_channel("nope", &c1));

        assert!(groups.unregister_channel("x", &c1));
        assert!(groups.unregister_channel("x", &c2));
        assert_eq!(groups.group_count(), 0);
    }
}
