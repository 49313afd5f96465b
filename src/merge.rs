//! Conflict resolution for failed compare-and-swap writes.
//!
//! When a write loses the race, the store re-reads the remote document and
//! asks the chosen [`ConflictStrategy`] for the payload of the next attempt.
//! Resolution is pure: inputs are borrowed and a fresh value is returned.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;
use crate::types::Content;

/// How to reconcile local work with a concurrently written document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Merge the local result into the remote document key by key.
    #[default]
    DeepMerge,
    /// Redo the mutation on top of the remote document.
    LatestWins,
    /// Drop local work and keep the remote document.
    IncomingWins,
}

/// The three documents involved in a conflict.
#[derive(Clone, Copy, Debug)]
pub struct Conflict<'a> {
    /// What the mutation was originally applied to.
    pub base: &'a Content,
    /// The mutation's output that failed to commit.
    pub local: &'a Content,
    /// The document as it currently exists remotely.
    pub remote: &'a Content,
}

/// Signature shared by every strategy.
pub type Resolver = fn(&Conflict<'_>, &dyn Fn(Content) -> Content) -> Content;

impl ConflictStrategy {
    pub const ALL: [ConflictStrategy; 3] = [
        ConflictStrategy::DeepMerge,
        ConflictStrategy::LatestWins,
        ConflictStrategy::IncomingWins,
    ];

    /// The resolver implementing this strategy.
    pub fn resolver(self) -> Resolver {
        match self {
            ConflictStrategy::DeepMerge => resolve_deep_merge,
            ConflictStrategy::LatestWins => resolve_latest_wins,
            ConflictStrategy::IncomingWins => resolve_incoming_wins,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictStrategy::DeepMerge => "deep_merge",
            ConflictStrategy::LatestWins => "latest_wins",
            ConflictStrategy::IncomingWins => "incoming_wins",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConflictStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| StoreError::Config(format!("Unknown conflict strategy: {}", s)))
    }
}

/// Produce the next write payload for a failed compare-and-swap.
pub fn resolve(
    strategy: ConflictStrategy,
    base: &Content,
    local: &Content,
    remote: &Content,
    mutate: &dyn Fn(Content) -> Content,
) -> Content {
    let conflict = Conflict {
        base,
        local,
        remote,
    };
    (strategy.resolver())(&conflict, mutate)
}

fn resolve_deep_merge(conflict: &Conflict<'_>, _mutate: &dyn Fn(Content) -> Content) -> Content {
    deep_merge(conflict.remote, conflict.local)
}

fn resolve_latest_wins(conflict: &Conflict<'_>, mutate: &dyn Fn(Content) -> Content) -> Content {
    mutate(conflict.remote.clone())
}

fn resolve_incoming_wins(conflict: &Conflict<'_>, _mutate: &dyn Fn(Content) -> Content) -> Content {
    conflict.remote.clone()
}

/// Which side wins when both documents hold a scalar under the same key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergePolicy {
    #[default]
    LocalWins,
    RemoteWins,
}

/// Merge `local` into `remote`, local scalars winning.
pub fn deep_merge(remote: &Content, local: &Content) -> Content {
    deep_merge_with(remote, local, MergePolicy::LocalWins)
}

/// Merge `local` into `remote` with an explicit leaf policy.
///
/// Nested objects present on both sides are merged recursively. Keys only in
/// `remote` are kept, keys only in `local` are added. Arrays and `null`
/// count as scalars.
pub fn deep_merge_with(remote: &Content, local: &Content, policy: MergePolicy) -> Content {
    let mut merged = remote.clone();

    for (key, local_value) in local {
        let next = match (merged.get(key), local_value) {
            (Some(Value::Object(remote_obj)), Value::Object(local_obj)) => {
                Value::Object(deep_merge_with(remote_obj, local_obj, policy))
            }
            (Some(remote_value), _) => match policy {
                MergePolicy::LocalWins => local_value.clone(),
                MergePolicy::RemoteWins => remote_value.clone(),
            },
            (None, _) => local_value.clone(),
        };
        merged.insert(key.clone(), next);
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn content(value: Value) -> Content {
        value.as_object().cloned().unwrap()
    }

    fn add_user(id: &'static str, name: &'static str) -> impl Fn(Content) -> Content {
        move |mut c: Content| {
            let users = c
                .entry("users")
                .or_insert_with(|| json!({}))
                .as_object_mut()
                .unwrap();
            users.insert(id.into(), json!({ "name": name }));
            c
        }
    }

    #[test]
    fn test_deep_merge_disjoint_keys() {
        let remote = content(json!({"users": {"1": {"name": "a"}}}));
        let local = content(json!({"users": {"2": {"name": "b"}}}));

        let merged = deep_merge(&remote, &local);
        assert_eq!(
            Value::Object(merged),
            json!({"users": {"1": {"name": "a"}, "2": {"name": "b"}}})
        );
    }

    #[test]
    fn test_deep_merge_local_scalar_wins() {
        let remote = content(json!({"settings": {"lang": "en", "tz": "UTC"}}));
        let local = content(json!({"settings": {"lang": "de"}}));

        let merged = deep_merge(&remote, &local);
        assert_eq!(
            Value::Object(merged),
            json!({"settings": {"lang": "de", "tz": "UTC"}})
        );
    }

    #[test]
    fn test_deep_merge_remote_policy() {
        let remote = content(json!({"a": 1, "b": {"c": 2}}));
        let local = content(json!({"a": 9, "b": {"c": 8, "d": 3}}));

        let merged = deep_merge_with(&remote, &local, MergePolicy::RemoteWins);
        assert_eq!(Value::Object(merged), json!({"a": 1, "b": {"c": 2, "d": 3}}));
    }

    #[test]
    fn test_deep_merge_object_replaces_scalar() {
        let remote = content(json!({"a": 1}));
        let local = content(json!({"a": {"nested": true}}));

        let merged = deep_merge(&remote, &local);
        assert_eq!(Value::Object(merged), json!({"a": {"nested": true}}));
    }

    #[test]
    fn test_arrays_are_leaves() {
        let remote = content(json!({"logs": [1, 2]}));
        let local = content(json!({"logs": [3]}));

        let merged = deep_merge(&remote, &local);
        assert_eq!(Value::Object(merged), json!({"logs": [3]}));
    }

    #[test]
    fn test_latest_wins_reapplies_mutation() {
        let base = Content::new();
        let mutate = add_user("2", "b");
        let local = mutate(base.clone());
        let remote = content(json!({"users": {"1": {"name": "a"}}}));

        let resolved = resolve(ConflictStrategy::LatestWins, &base, &local, &remote, &mutate);
        assert_eq!(
            Value::Object(resolved),
            json!({"users": {"1": {"name": "a"}, "2": {"name": "b"}}})
        );
    }

    #[test]
    fn test_incoming_wins_keeps_remote() {
        let base = Content::new();
        let mutate = add_user("2", "b");
        let local = mutate(base.clone());
        let remote = content(json!({"users": {"1": {"name": "a"}}}));

        let resolved = resolve(ConflictStrategy::IncomingWins, &base, &local, &remote, &mutate);
        assert_eq!(resolved, remote);
    }

    #[test]
    fn test_resolution_does_not_touch_inputs() {
        let base = content(json!({"k": 0}));
        let local = content(json!({"k": 1}));
        let remote = content(json!({"k": 2, "r": true}));
        let mutate = |mut c: Content| {
            c.insert("m".into(), json!(1));
            c
        };

        for strategy in ConflictStrategy::ALL {
            let _ = resolve(strategy, &base, &local, &remote, &mutate);
        }

        assert_eq!(Value::Object(base), json!({"k": 0}));
        assert_eq!(Value::Object(local), json!({"k": 1}));
        assert_eq!(Value::Object(remote), json!({"k": 2, "r": true}));
    }

    #[test]
    fn test_strategy_names() {
        for strategy in ConflictStrategy::ALL {
            assert_eq!(strategy.as_str().parse::<ConflictStrategy>().unwrap(), strategy);
        }
        assert!("merge".parse::<ConflictStrategy>().is_err());

        let parsed: ConflictStrategy = serde_json::from_str("\"latest_wins\"").unwrap();
        assert_eq!(parsed, ConflictStrategy::LatestWins);
    }

    fn arb_doc() -> impl Strategy<Value = Content> {
        let leaf = prop_oneof![
            any::<i32>().prop_map(Value::from),
            "[a-z]{0,4}".prop_map(Value::from),
        ];
        let value = leaf.prop_recursive(2, 16, 3, |inner| {
            prop::collection::btree_map("[a-d]", inner, 0..3)
                .prop_map(|m| Value::Object(m.into_iter().collect()))
        });
        prop::collection::btree_map("[a-d]", value, 0..4).prop_map(|m| m.into_iter().collect())
    }

    fn contains_all_keys(merged: &Content, side: &Content) -> bool {
        side.iter().all(|(key, value)| match (merged.get(key), value) {
            (Some(Value::Object(m)), Value::Object(s)) => contains_all_keys(m, s),
            (Some(_), _) => true,
            (None, _) => false,
        })
    }

    proptest! {
        #[test]
        fn prop_merge_keeps_every_key(remote in arb_doc(), local in arb_doc()) {
            let merged = deep_merge(&remote, &local);
            prop_assert!(contains_all_keys(&merged, &local));
            for key in remote.keys() {
                prop_assert!(merged.contains_key(key));
            }
        }

        #[test]
        fn prop_merge_into_self_is_identity(doc in arb_doc()) {
            prop_assert_eq!(deep_merge(&doc, &doc), doc);
        }
    }
}
