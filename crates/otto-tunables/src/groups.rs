//! The collection of covariant groups that makes up a configuration space.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use otto_core::{parts_hash_hex, Error, ParamDict, ParamValue, Result};

use crate::group::{CovariantGroup, GroupSnapshot};
use crate::tunable::Tunable;

/// Set of covariant tunable groups: the configuration space of an experiment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunableGroups {
    groups: BTreeMap<String, CovariantGroup>,
}

impl TunableGroups {
    pub fn new() -> Self {
        TunableGroups::default()
    }

    /// Add a group; group names are unique per experiment and a tunable
    /// belongs to exactly one group.
    pub fn add_group(&mut self, group: CovariantGroup) -> Result<()> {
        if self.groups.contains_key(group.name()) {
            return Err(Error::config(format!(
                "duplicate covariant group: {}",
                group.name()
            )));
        }
        for name in group.tunable_names() {
            if let Some(owner) = self.find_group_of(name) {
                return Err(Error::config(format!(
                    "tunable {name} already belongs to group {owner}"
                )));
            }
        }
        self.groups.insert(group.name().to_string(), group);
        Ok(())
    }

    fn find_group_of(&self, tunable_name: &str) -> Option<&str> {
        self.groups
            .values()
            .find(|g| g.get(tunable_name).is_some())
            .map(|g| g.name())
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn get_group(&self, name: &str) -> Option<&CovariantGroup> {
        self.groups.get(name)
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(CovariantGroup::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.values().all(CovariantGroup::is_empty)
    }

    /// Look up a tunable and the group that owns it.
    pub fn get(&self, name: &str) -> Option<(&Tunable, &str)> {
        self.groups
            .values()
            .find_map(|g| g.get(name).map(|t| (t, g.name())))
    }

    /// Iterate over all tunables with their group names.
    pub fn iter(&self) -> impl Iterator<Item = (&Tunable, &str)> {
        self.groups
            .values()
            .flat_map(|g| g.tunables().map(move |t| (t, g.name())))
    }

    /// Iterate mutably over all tunables.
    pub fn tunables_mut(&mut self) -> impl Iterator<Item = &mut Tunable> {
        self.groups.values_mut().flat_map(CovariantGroup::tunables_mut)
    }

    /// Select a subset of groups by name.
    pub fn subgroup(&self, names: &[String]) -> Result<TunableGroups> {
        let mut subset = TunableGroups::new();
        for name in names {
            let group = self.groups.get(name).ok_or_else(|| {
                Error::config(format!("unknown covariant group: {name}"))
            })?;
            subset.groups.insert(name.clone(), group.clone());
        }
        Ok(subset)
    }

    /// Merge another collection into this one; `other` wins on conflicts.
    pub fn merge(&mut self, other: &TunableGroups) -> Result<()> {
        for group in other.groups.values() {
            self.groups.remove(group.name());
            for name in group.tunable_names() {
                if let Some(owner) = self.find_group_of(name) {
                    return Err(Error::config(format!(
                        "tunable {name} already belongs to group {owner}"
                    )));
                }
            }
            self.groups.insert(group.name().to_string(), group.clone());
        }
        Ok(())
    }

    /// Assign values to tunables by name.
    pub fn assign(&mut self, params: &ParamDict) -> Result<()> {
        for (name, value) in params {
            let tunable = self
                .groups
                .values_mut()
                .find_map(|g| g.get_mut(name))
                .ok_or_else(|| Error::InvalidValue {
                    name: name.clone(),
                    value: value.to_string(),
                })?;
            tunable.assign(value.clone())?;
        }
        Ok(())
    }

    /// Produce a flat name -> value map combining the requested groups with a
    /// caller-supplied baseline; baseline values survive unless overwritten.
    /// Group names that are not part of this collection are ignored (they may
    /// belong to another environment).
    pub fn get_param_values(
        &self,
        group_names: &[String],
        into_params: &ParamDict,
    ) -> ParamDict {
        let mut params = into_params.clone();
        for name in group_names {
            if let Some(group) = self.groups.get(name) {
                for tunable in group.tunables() {
                    params.insert(tunable.name().to_string(), tunable.value().clone());
                }
            }
        }
        params
    }

    /// Flat map of all current tunable values.
    pub fn values(&self) -> ParamDict {
        self.iter()
            .map(|(t, _)| (t.name().to_string(), t.value().clone()))
            .collect()
    }

    /// Stable hash over the canonically sorted (name, kind, value) triples of
    /// the member tunables.
    pub fn space_hash(&self) -> String {
        let mut tunables: Vec<&Tunable> = self.iter().map(|(t, _)| t).collect();
        tunables.sort();
        parts_hash_hex(tunables.iter().flat_map(|t| {
            [
                t.name().to_string(),
                t.kind().to_string(),
                t.value().to_string(),
            ]
        }))
    }

    pub fn to_json(&self) -> serde_json::Value {
        let snapshots: BTreeMap<&str, GroupSnapshot> = self
            .groups
            .iter()
            .map(|(name, group)| (name.as_str(), group.to_snapshot()))
            .collect();
        serde_json::to_value(snapshots).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let snapshots: BTreeMap<String, GroupSnapshot> =
            serde_json::from_value(value.clone())?;
        let mut groups = TunableGroups::new();
        for (name, snapshot) in snapshots {
            groups.add_group(CovariantGroup::from_snapshot(&name, snapshot)?)?;
        }
        Ok(groups)
    }
}

impl Serialize for TunableGroups {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TunableGroups {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        TunableGroups::from_json(&value).map_err(D::Error::custom)
    }
}

impl fmt::Display for TunableGroups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for (tunable, _) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{tunable}")?;
            first = false;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunable::{TunableDef, TunableKind};

    fn int_tunable(name: &str, default: i64) -> Tunable {
        Tunable::new(
            name,
            TunableDef {
                kind: TunableKind::Int,
                description: None,
                default: ParamValue::Int(default),
                values: None,
                range: Some((0.0, 100.0)),
                quantization: None,
                log: None,
                distribution: None,
                special: None,
                values_weights: None,
                special_weights: None,
                range_weight: None,
                meta: BTreeMap::new(),
            },
        )
        .unwrap()
    }

    fn sample_groups() -> TunableGroups {
        let mut kernel = CovariantGroup::new("kernel", 100);
        kernel.add(int_tunable("sched_latency", 20)).unwrap();
        kernel.add(int_tunable("sched_granularity", 3)).unwrap();
        let mut vm = CovariantGroup::new("vm", 1000);
        vm.add(int_tunable("vm_mem_gb", 8)).unwrap();
        let mut groups = TunableGroups::new();
        groups.add_group(kernel).unwrap();
        groups.add_group(vm).unwrap();
        groups
    }

    #[test]
    fn test_unique_ownership() {
        let mut groups = sample_groups();
        let mut dup = CovariantGroup::new("other", 1);
        dup.add(int_tunable("vm_mem_gb", 1)).unwrap();
        assert!(groups.add_group(dup).is_err());
    }

    #[test]
    fn test_subgroup() {
        let groups = sample_groups();
        let sub = groups.subgroup(&["kernel".to_string()]).unwrap();
        assert_eq!(sub.len(), 2);
        assert!(sub.get("vm_mem_gb").is_none());
        assert!(groups.subgroup(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_merge_other_wins() {
        let mut groups = sample_groups();
        let mut vm = CovariantGroup::new("vm", 1000);
        let mut t = int_tunable("vm_mem_gb", 8);
        t.assign(16i64).unwrap();
        vm.add(t).unwrap();
        let mut other = TunableGroups::new();
        other.add_group(vm).unwrap();
        groups.merge(&other).unwrap();
        assert_eq!(
            groups.get("vm_mem_gb").unwrap().0.value(),
            &ParamValue::Int(16)
        );
    }

    #[test]
    fn test_get_param_values_keeps_baseline() {
        let groups = sample_groups();
        let mut baseline = ParamDict::new();
        baseline.insert("const_arg".into(), ParamValue::Text("x".into()));
        baseline.insert("sched_latency".into(), ParamValue::Int(-1));
        let params = groups.get_param_values(
            &["kernel".to_string(), "unknown".to_string()],
            &baseline,
        );
        // Baseline survives unless overwritten; unknown groups are ignored.
        assert_eq!(params.get("const_arg"), Some(&ParamValue::Text("x".into())));
        assert_eq!(params.get("sched_latency"), Some(&ParamValue::Int(20)));
        assert!(!params.contains_key("vm_mem_gb"));
    }

    #[test]
    fn test_assign_unknown_fails() {
        let mut groups = sample_groups();
        let mut params = ParamDict::new();
        params.insert("nope".into(), ParamValue::Int(1));
        assert!(groups.assign(&params).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let mut groups = sample_groups();
        let mut params = ParamDict::new();
        params.insert("sched_latency".into(), ParamValue::Int(42));
        groups.assign(&params).unwrap();
        let restored = TunableGroups::from_json(&groups.to_json()).unwrap();
        assert_eq!(groups, restored);
    }

    #[test]
    fn test_space_hash_tracks_values() {
        let mut groups = sample_groups();
        let before = groups.space_hash();
        assert_eq!(before, sample_groups().space_hash());
        let mut params = ParamDict::new();
        params.insert("sched_latency".into(), ParamValue::Int(42));
        groups.assign(&params).unwrap();
        assert_ne!(before, groups.space_hash());
    }
}
