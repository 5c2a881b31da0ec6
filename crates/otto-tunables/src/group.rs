//! A named set of tunables that co-vary, with an associated reconfiguration
//! cost.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use otto_core::{Error, ParamValue, Result};

use crate::tunable::{Tunable, TunableDef};

/// Serialized form of one covariant group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    #[serde(default)]
    pub cost: i64,
    pub params: BTreeMap<String, TunableEntry>,
}

/// Serialized form of one tunable inside a group: the definition plus the
/// current value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunableEntry {
    #[serde(flatten)]
    pub def: TunableDef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<ParamValue>,
}

/// A group of tunables that is reconfigured as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CovariantGroup {
    name: String,
    cost: i64,
    tunables: BTreeMap<String, Tunable>,
}

impl CovariantGroup {
    pub fn new(name: &str, cost: i64) -> Self {
        CovariantGroup {
            name: name.to_string(),
            cost,
            tunables: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cost(&self) -> i64 {
        self.cost
    }

    pub fn len(&self) -> usize {
        self.tunables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunables.is_empty()
    }

    /// Add a tunable; each tunable belongs to exactly one group.
    pub fn add(&mut self, tunable: Tunable) -> Result<()> {
        if self.tunables.contains_key(tunable.name()) {
            return Err(Error::config(format!(
                "duplicate tunable {} in group {}",
                tunable.name(),
                self.name
            )));
        }
        self.tunables.insert(tunable.name().to_string(), tunable);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tunable> {
        self.tunables.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tunable> {
        self.tunables.get_mut(name)
    }

    pub fn tunables(&self) -> impl Iterator<Item = &Tunable> {
        self.tunables.values()
    }

    pub fn tunables_mut(&mut self) -> impl Iterator<Item = &mut Tunable> {
        self.tunables.values_mut()
    }

    pub fn tunable_names(&self) -> impl Iterator<Item = &str> {
        self.tunables.keys().map(String::as_str)
    }

    pub fn to_snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            cost: self.cost,
            params: self
                .tunables
                .iter()
                .map(|(name, tunable)| {
                    (
                        name.clone(),
                        TunableEntry {
                            def: tunable.def().clone(),
                            current_value: Some(tunable.value().clone()),
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn from_snapshot(name: &str, snapshot: GroupSnapshot) -> Result<Self> {
        let mut group = CovariantGroup::new(name, snapshot.cost);
        for (tunable_name, entry) in snapshot.params {
            let mut tunable = Tunable::new(&tunable_name, entry.def)?;
            if let Some(value) = entry.current_value {
                tunable.assign(value)?;
            }
            group.add(tunable)?;
        }
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunable::TunableKind;

    fn tunable(name: &str) -> Tunable {
        Tunable::new(
            name,
            TunableDef {
                kind: TunableKind::Int,
                description: None,
                default: ParamValue::Int(1),
                values: None,
                range: Some((0.0, 10.0)),
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

    #[test]
    fn test_rejects_duplicates() {
        let mut group = CovariantGroup::new("kernel", 100);
        group.add(tunable("x")).unwrap();
        assert!(group.add(tunable("x")).is_err());
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut group = CovariantGroup::new("kernel", 100);
        group.add(tunable("x")).unwrap();
        group.get_mut("x").unwrap().assign(7i64).unwrap();
        let restored =
            CovariantGroup::from_snapshot("kernel", group.to_snapshot()).unwrap();
        assert_eq!(group, restored);
        assert_eq!(restored.get("x").unwrap().value(), &ParamValue::Int(7));
    }
}
