//! Derived views: grouping rows by key and ordering by creation time.

use std::collections::BTreeMap;

use jiff::Timestamp;

use crate::backend::RowId;

/// Something with a creation stamp and a tiebreaking id
pub trait Created {
    fn id(&self) -> RowId;
    fn created_at(&self) -> Option<Timestamp>;
}

/// Group `items` by `key`, keeping the input order within each group.
pub fn group_by_key<K, T, F>(items: impl IntoIterator<Item = T>, key: F) -> BTreeMap<K, Vec<T>>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut groups: BTreeMap<K, Vec<T>> = BTreeMap::new();
    for item in items {
        groups.entry(key(&item)).or_default().push(item);
    }
    groups
}

/// Sort by creation time, then id. Items without a stamp go last.
pub fn sort_by_creation<T: Created>(items: &mut [T]) {
    items.sort_by(|a, b| match (a.created_at(), b.created_at()) {
        (Some(x), Some(y)) => x.cmp(&y).then(a.id().cmp(&b.id())),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.id().cmp(&b.id()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: RowId,
        group: RowId,
        created_at: Option<Timestamp>,
    }

    impl Created for Item {
        fn id(&self) -> RowId {
            self.id
        }
        fn created_at(&self) -> Option<Timestamp> {
            self.created_at
        }
    }

    fn ts(s: &str) -> Option<Timestamp> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn test_group_by_key_preserves_order() {
        let items = vec![(1, "a"), (2, "b"), (1, "c"), (2, "d")];
        let groups = group_by_key(items, |(k, _)| *k);
        assert_eq!(groups[&1], vec![(1, "a"), (1, "c")]);
        assert_eq!(groups[&2], vec![(2, "b"), (2, "d")]);
    }

    #[test]
    fn test_sort_by_creation() {
        let mut items = vec![
            Item { id: 3, group: 1, created_at: ts("2024-03-01T00:00:00Z") },
            Item { id: 1, group: 1, created_at: None },
            Item { id: 4, group: 1, created_at: ts("2024-01-01T00:00:00Z") },
            Item { id: 2, group: 1, created_at: ts("2024-01-01T00:00:00Z") },
        ];
        sort_by_creation(&mut items);
        let ids: Vec<RowId> = items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![2, 4, 3, 1]);
        assert!(items.iter().all(|i| i.group == 1));
    }
}
