//! Property tests for the bulk result partition.

use std::collections::BTreeSet;

use gridrm_dms::{BatchResult, ErrorKind, ItemError, ItemSet, Items};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Step {
    Succeed(String, u32),
    Fail(String),
}

fn arb_item() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["/vo/a", "/vo/b", "/vo/c", "/vo/d", "/vo/e"])
        .prop_map(|s| s.to_string())
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (arb_item(), any::<u32>()).prop_map(|(item, v)| Step::Succeed(item, v)),
        arb_item().prop_map(Step::Fail),
    ]
}

fn apply(steps: &[Step]) -> BatchResult<u32> {
    let mut batch = BatchResult::new();
    for step in steps {
        match step {
            Step::Succeed(item, value) => {
                batch.succeed(item.clone(), *value);
            }
            Step::Fail(item) => batch.fail(item.clone(), ItemError::new(ErrorKind::NotFound, "gone")),
        }
    }
    batch
}

proptest! {
    #[test]
    fn prop_partition_is_disjoint_and_complete(steps in prop::collection::vec(arb_step(), 0..40)) {
        let batch = apply(&steps);
        let touched: BTreeSet<String> = steps
            .iter()
            .map(|s| match s {
                Step::Succeed(item, _) | Step::Fail(item) => item.clone(),
            })
            .collect();

        for item in batch.successful.keys() {
            prop_assert!(!batch.failed.contains_key(item));
        }
        prop_assert_eq!(batch.len(), touched.len());
        prop_assert!(batch.covers(touched.iter()));
    }

    #[test]
    fn prop_any_failure_dominates(steps in prop::collection::vec(arb_step(), 1..40)) {
        let batch = apply(&steps);
        for step in &steps {
            if let Step::Fail(item) = step {
                prop_assert!(batch.is_failed(item));
                prop_assert!(!batch.is_successful(item));
            }
        }
    }

    #[test]
    fn prop_merge_keeps_partition(
        left in prop::collection::vec(arb_step(), 0..20),
        right in prop::collection::vec(arb_step(), 0..20),
    ) {
        let mut merged = apply(&left);
        merged.merge(apply(&right));
        let combined: Vec<Step> = left.iter().chain(right.iter()).cloned().collect();
        let expected = apply(&combined);
        prop_assert_eq!(
            merged.failed.keys().collect::<Vec<_>>(),
            expected.failed.keys().collect::<Vec<_>>()
        );
        for item in merged.successful.keys() {
            prop_assert!(!merged.failed.contains_key(item));
        }
    }

    #[test]
    fn prop_normalize_dedups_ids(ids in prop::collection::vec(arb_item(), 1..20)) {
        let set = ItemSet::normalize(Items::from(ids.clone())).unwrap();
        let unique: BTreeSet<String> = ids.into_iter().collect();
        prop_assert_eq!(set.len(), unique.len());
        for id in &unique {
            prop_assert!(set.contains(id));
        }
    }
}
