//! Property tests for the tunable parameter model.

use std::collections::BTreeMap;

use proptest::prelude::*;

use ottobench::core::ParamValue;
use ottobench::tunables::{
    Cardinality, CovariantGroup, Tunable, TunableDef, TunableGroups, TunableKind,
};

fn int_def(lo: i64, hi: i64, default: i64, quantization: Option<f64>) -> TunableDef {
    TunableDef {
        kind: TunableKind::Int,
        description: None,
        default: ParamValue::Int(default),
        values: None,
        range: Some((lo as f64, hi as f64)),
        quantization,
        log: None,
        distribution: None,
        special: None,
        values_weights: None,
        special_weights: None,
        range_weight: None,
        meta: BTreeMap::new(),
    }
}

fn cat_def(labels: &[&str], default: &str) -> TunableDef {
    TunableDef {
        kind: TunableKind::Categorical,
        description: None,
        default: ParamValue::Text(default.to_string()),
        values: Some(labels.iter().map(|l| l.to_string()).collect()),
        range: None,
        quantization: None,
        log: None,
        distribution: None,
        special: None,
        values_weights: None,
        special_weights: None,
        range_weight: None,
        meta: BTreeMap::new(),
    }
}

fn sample_groups(x: i64, label: &str) -> TunableGroups {
    let mut kernel = CovariantGroup::new("kernel", 100);
    let mut tunable = Tunable::new("x", int_def(0, 100, 50, None)).unwrap();
    tunable.assign(x).unwrap();
    kernel.add(tunable).unwrap();
    let mut io = CovariantGroup::new("io", 10);
    let mut scheduler =
        Tunable::new("io_scheduler", cat_def(&["none", "bfq", "mq-deadline"], "none")).unwrap();
    scheduler.assign(label).unwrap();
    io.add(scheduler).unwrap();
    let mut groups = TunableGroups::new();
    groups.add_group(kernel).unwrap();
    groups.add_group(io).unwrap();
    groups
}

proptest! {
    /// For any sequence of legal assignments, the final value wins and
    /// stays valid.
    #[test]
    fn prop_last_assignment_wins(values in proptest::collection::vec(0i64..=100, 1..20)) {
        let mut tunable = Tunable::new("x", int_def(0, 100, 50, None)).unwrap();
        for value in &values {
            tunable.assign(*value).unwrap();
        }
        let last = *values.last().unwrap();
        prop_assert_eq!(tunable.value(), &ParamValue::Int(last));
        prop_assert!(tunable.is_valid(&ParamValue::Int(last)));
    }

    /// Out-of-range assignments never change the current value.
    #[test]
    fn prop_invalid_assignment_is_a_noop(
        good in 0i64..=100,
        bad in prop_oneof![-1000i64..0, 101i64..1000],
    ) {
        let mut tunable = Tunable::new("x", int_def(0, 100, 50, None)).unwrap();
        tunable.assign(good).unwrap();
        prop_assert!(tunable.assign(bad).is_err());
        prop_assert_eq!(tunable.value(), &ParamValue::Int(good));
    }

    /// JSON round-trip preserves definitions and current values.
    #[test]
    fn prop_groups_json_round_trip(x in 0i64..=100, label in 0usize..3) {
        let labels = ["none", "bfq", "mq-deadline"];
        let groups = sample_groups(x, labels[label]);
        let restored = TunableGroups::from_json(&groups.to_json()).unwrap();
        prop_assert_eq!(&groups, &restored);
        prop_assert_eq!(groups.space_hash(), restored.space_hash());
    }

    /// Quantized int tunables enumerate exactly the values that validate.
    #[test]
    fn prop_quantized_values_are_the_valid_set(step in 2i64..=10) {
        let tunable = Tunable::new("q", int_def(0, 30, 0, Some(step as f64))).unwrap();
        let grid: Vec<i64> = tunable
            .quantized_values()
            .unwrap()
            .filter_map(|v| v.as_i64())
            .collect();
        for value in 0..=30i64 {
            let expected = grid.contains(&value);
            prop_assert_eq!(tunable.is_valid(&ParamValue::Int(value)), expected);
        }
        prop_assert_eq!(tunable.cardinality(), Cardinality::Finite(grid.len() as u64));
    }
}

/// Integer range [0, 10] with step 3: the grid is exactly [0, 3, 6, 9] and
/// off-grid assignments are rejected.
#[test]
fn test_quantization_grid_and_rejection() {
    let mut tunable = Tunable::new("q", int_def(0, 10, 6, Some(3.0))).unwrap();
    let grid: Vec<i64> = tunable
        .quantized_values()
        .unwrap()
        .filter_map(|v| v.as_i64())
        .collect();
    assert_eq!(grid, vec![0, 3, 6, 9]);
    assert_eq!(tunable.value(), &ParamValue::Int(6));
    assert!(matches!(
        tunable.assign(4i64),
        Err(ottobench::core::Error::InvalidValue { .. })
    ));
}

#[test]
fn test_copies_do_not_share_state() {
    let groups = sample_groups(10, "bfq");
    let mut copy = groups.clone();
    let mut update = ottobench::core::ParamDict::new();
    update.insert("x".into(), ParamValue::Int(99));
    copy.assign(&update).unwrap();
    assert_eq!(groups.get("x").unwrap().0.value(), &ParamValue::Int(10));
    assert_eq!(copy.get("x").unwrap().0.value(), &ParamValue::Int(99));
}
