//! Diff/merge engine.
//!
//! Pure classification: reconciles two metadata listings into the ordered
//! sequence of actions that converges the receiver onto the sender. No I/O,
//! cannot fail.

use crate::model::{SyncItem, SyncOptions, SyncPair};

/// Merge two listings into one ordered `SyncPair` per distinct relative path.
///
/// Both listings are sorted by relative path and walked with a two-pointer
/// merge-join. Byte-wise lexicographic order on '/'-separated paths places
/// every directory before the paths it is a prefix of, so directory
/// creations never race their children; the apply step walks deletions in
/// reverse for the same reason.
pub fn merge(
    mut sender: Vec<SyncItem>,
    mut receiver: Vec<SyncItem>,
    opts: &SyncOptions,
) -> Vec<SyncPair> {
    sender.sort_by(|a, b| a.path.cmp(&b.path));
    receiver.sort_by(|a, b| a.path.cmp(&b.path));

    let mut pairs = Vec::with_capacity(sender.len().max(receiver.len()));
    let mut s_iter = sender.into_iter().peekable();
    let mut r_iter = receiver.into_iter().peekable();

    loop {
        let pair = match (s_iter.peek(), r_iter.peek()) {
            (Some(s), Some(r)) => match s.path.cmp(&r.path) {
                std::cmp::Ordering::Equal => {
                    SyncPair::new(s_iter.next(), r_iter.next(), opts)
                }
                std::cmp::Ordering::Less => SyncPair::new(s_iter.next(), None, opts),
                std::cmp::Ordering::Greater => SyncPair::new(None, r_iter.next(), opts),
            },
            (Some(_), None) => SyncPair::new(s_iter.next(), None, opts),
            (None, Some(_)) => SyncPair::new(None, r_iter.next(), opts),
            (None, None) => break,
        };
        pairs.push(pair);
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncStatus;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn statuses(pairs: &[SyncPair]) -> Vec<(String, SyncStatus)> {
        pairs
            .iter()
            .map(|p| (p.path().to_string(), p.status()))
            .collect()
    }

    #[test]
    fn test_merge_mixed_trees() {
        // Sender: a.txt, dir/, dir/b.txt; receiver: a.txt (same), c.txt.
        let sender = vec![
            SyncItem::file("a.txt", 10, 100),
            SyncItem::dir("dir"),
            SyncItem::file("dir/b.txt", 5, 200),
        ];
        let receiver = vec![
            SyncItem::file("a.txt", 10, 100),
            SyncItem::file("c.txt", 1, 50),
        ];
        let opts = SyncOptions {
            delete_extraneous: true,
            ..Default::default()
        };

        let pairs = merge(sender, receiver, &opts);
        assert_eq!(
            statuses(&pairs),
            vec![
                ("a.txt".to_string(), SyncStatus::InSync),
                ("c.txt".to_string(), SyncStatus::Delete),
                ("dir".to_string(), SyncStatus::Create),
                ("dir/b.txt".to_string(), SyncStatus::Create),
            ]
        );
    }

    #[test]
    fn test_merge_unsorted_input() {
        let sender = vec![
            SyncItem::file("z.txt", 1, 1),
            SyncItem::dir("a"),
            SyncItem::file("a/x.txt", 2, 2),
        ];
        let pairs = merge(sender, vec![], &SyncOptions::default());
        let paths: Vec<_> = pairs.iter().map(|p| p.path().to_string()).collect();
        assert_eq!(paths, vec!["a", "a/x.txt", "z.txt"]);
    }

    #[test]
    fn test_merge_type_conflict_surfaced() {
        let pairs = merge(
            vec![SyncItem::dir("x")],
            vec![SyncItem::file("x", 3, 3)],
            &SyncOptions::default(),
        );
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].status(), SyncStatus::TypeConflict);
    }

    #[test]
    fn test_merge_dir_precedes_sibling_with_smaller_separator() {
        // '.' sorts before '/', yet "dir" still precedes "dir/child".
        let sender = vec![
            SyncItem::file("dir.txt", 1, 1),
            SyncItem::dir("dir"),
            SyncItem::file("dir/child", 1, 1),
        ];
        let pairs = merge(sender, vec![], &SyncOptions::default());
        let paths: Vec<_> = pairs.iter().map(|p| p.path().to_string()).collect();
        assert_eq!(paths, vec!["dir", "dir.txt", "dir/child"]);
        let dir_idx = paths.iter().position(|p| p == "dir").unwrap();
        let child_idx = paths.iter().position(|p| p == "dir/child").unwrap();
        assert!(dir_idx < child_idx);
    }

    #[test]
    fn test_merge_empty_listings() {
        assert!(merge(vec![], vec![], &SyncOptions::default()).is_empty());
    }

    proptest! {
        /// Merge totality and ordering over arbitrary path sets: exactly one
        /// pair per distinct path, output sorted, every directory before the
        /// paths it prefixes.
        #[test]
        fn prop_merge_total_and_ordered(
            s_paths in proptest::collection::btree_set("[a-c]{1,2}(/[a-c]{1,2}){0,2}", 0..12),
            r_paths in proptest::collection::btree_set("[a-c]{1,2}(/[a-c]{1,2}){0,2}", 0..12),
        ) {
            let sender: Vec<_> = s_paths.iter()
                .map(|p| SyncItem::file(p.clone(), 1, 1))
                .collect();
            let receiver: Vec<_> = r_paths.iter()
                .map(|p| SyncItem::file(p.clone(), 1, 1))
                .collect();

            let pairs = merge(sender, receiver, &SyncOptions::default());

            let expected: BTreeSet<_> = s_paths.union(&r_paths).cloned().collect();
            let produced: Vec<_> = pairs.iter().map(|p| p.path().to_string()).collect();
            let produced_set: BTreeSet<_> = produced.iter().cloned().collect();

            prop_assert_eq!(produced.len(), expected.len());
            prop_assert_eq!(&produced_set, &expected);

            let mut sorted = produced.clone();
            sorted.sort();
            prop_assert_eq!(&produced, &sorted);

            for (path, status) in pairs.iter().map(|p| (p.path(), p.status())) {
                let expected_status = match (s_paths.contains(path), r_paths.contains(path)) {
                    (true, true) => SyncStatus::InSync,
                    (true, false) => SyncStatus::Create,
                    (false, true) => SyncStatus::Delete,
                    (false, false) => unreachable!(),
                };
                prop_assert_eq!(status, expected_status);
            }
        }
    }
}
