//! Random-search suggestion engines.

use rand::distributions::WeightedIndex;
use rand::prelude::Distribution as _;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use otto_core::{ParamDict, ParamValue, Result, Status};
use otto_tunables::{Cardinality, Tunable, TunableGroups, TunableKind};

use crate::optimizer::{
    OptimizationDirection, Optimizer, OptimizerConfig, OptimizerCore, SuggestError,
};

/// Uniform (optionally weighted) random sampler over the tunable space.
pub struct RandomOptimizer {
    core: OptimizerCore,
    rng: StdRng,
    best_signed: Option<f64>,
    best_config: Option<TunableGroups>,
}

impl RandomOptimizer {
    pub fn new(tunables: TunableGroups, config: &OptimizerConfig) -> Result<Self> {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(RandomOptimizer {
            core: OptimizerCore::new(tunables, config)?,
            rng,
            best_signed: None,
            best_config: None,
        })
    }

    /// Draw a fresh value for one tunable.
    fn sample(rng: &mut StdRng, tunable: &mut Tunable) -> Result<()> {
        let value = match tunable.kind() {
            TunableKind::Categorical => {
                let labels = tunable.categories().unwrap_or(&[]);
                let index = match tunable.values_weights() {
                    Some(weights) => match WeightedIndex::new(weights.iter().copied()) {
                        Ok(dist) => dist.sample(rng),
                        Err(_) => rng.gen_range(0..labels.len()),
                    },
                    None => rng.gen_range(0..labels.len()),
                };
                ParamValue::Text(labels[index].clone())
            }
            TunableKind::Int | TunableKind::Float => Self::sample_numeric(rng, tunable),
        };
        tunable.assign(value)?;
        Ok(())
    }

    fn sample_numeric(rng: &mut StdRng, tunable: &Tunable) -> ParamValue {
        // Weighted choice between the special values and the range itself.
        if let (specials @ [_, ..], Some(weights), Some(range_weight)) = (
            tunable.special(),
            tunable.special_weights(),
            tunable.range_weight(),
        ) {
            let all: Vec<f64> = weights.iter().copied().chain([range_weight]).collect();
            if let Ok(dist) = WeightedIndex::new(all) {
                let pick = dist.sample(rng);
                if pick < specials.len() {
                    let value = specials[pick];
                    return match tunable.kind() {
                        TunableKind::Int => ParamValue::Int(value as i64),
                        _ => ParamValue::Float(value),
                    };
                }
            }
        }

        let (lo, hi) = tunable.range().unwrap_or((0.0, 1.0));
        // Quantized tunables sample on the grid so the assignment validates.
        if tunable.quantization().is_some() {
            if let (Cardinality::Finite(count), Some(values)) =
                (tunable.cardinality(), tunable.quantized_values())
            {
                let index = rng.gen_range(0..count) as usize;
                if let Some(value) = values.into_iter().nth(index) {
                    return value;
                }
            }
        }
        match tunable.kind() {
            TunableKind::Int => ParamValue::Int(rng.gen_range(lo as i64..=hi as i64)),
            _ => {
                if tunable.is_log() && lo > 0.0 {
                    let exp = rng.gen_range(lo.log10()..=hi.log10());
                    ParamValue::Float(10f64.powf(exp).clamp(lo, hi))
                } else {
                    ParamValue::Float(rng.gen_range(lo..=hi))
                }
            }
        }
    }
}

impl Optimizer for RandomOptimizer {
    fn target(&self) -> &str {
        self.core.target()
    }

    fn direction(&self) -> OptimizationDirection {
        self.core.direction()
    }

    fn bulk_register(
        &mut self,
        configs: &[ParamDict],
        scores: &[Option<f64>],
        statuses: Option<&[Status]>,
    ) -> Result<bool> {
        let mut accepted = false;
        for (index, (params, score)) in configs.iter().zip(scores).enumerate() {
            let status = statuses
                .and_then(|s| s.get(index).copied())
                .unwrap_or(Status::Succeeded);
            let mut tunables = self.core.tunables().clone();
            if let Err(err) = tunables.assign(params) {
                warn!(%err, "skip malformed historical observation");
                continue;
            }
            let row = score.map(|value| {
                let mut row = ParamDict::new();
                row.insert(self.core.target().to_string(), ParamValue::Float(value));
                row
            });
            self.register(&tunables, status, row.as_ref())?;
            accepted = true;
        }
        info!(
            count = configs.len(),
            accepted, "bulk-registered historical observations"
        );
        Ok(accepted)
    }

    fn suggest(&mut self) -> std::result::Result<TunableGroups, SuggestError> {
        let mut tunables = self.core.tunables().clone();
        for tunable in tunables.tunables_mut() {
            Self::sample(&mut self.rng, tunable).map_err(|err| SuggestError::Internal {
                reason: err.to_string(),
            })?;
        }
        info!(iteration = self.core.iteration(), %tunables, "suggest");
        Ok(tunables)
    }

    fn register(
        &mut self,
        tunables: &TunableGroups,
        status: Status,
        score: Option<&ParamDict>,
    ) -> Result<Option<f64>> {
        let signed = self.core.signed_score(status, score)?;
        info!(
            iteration = self.core.iteration(),
            %status,
            score = ?signed,
            "register observation"
        );
        if let Some(signed) = signed {
            if self.best_signed.map_or(true, |best| signed < best) {
                self.best_signed = Some(signed);
                self.best_config = Some(tunables.clone());
            }
        }
        self.core.advance();
        Ok(signed)
    }

    fn best_observation(&self) -> Option<(f64, TunableGroups)> {
        match (self.best_signed, &self.best_config) {
            (Some(signed), Some(config)) => {
                Some((signed * self.core.direction().sign(), config.clone()))
            }
            _ => None,
        }
    }

    fn not_converged(&self) -> bool {
        self.core.not_converged()
    }
}

/// Deterministic variant of [`RandomOptimizer`] for tests and dry runs:
/// the seed defaults to a fixed value instead of entropy.
pub struct MockOptimizer {
    inner: RandomOptimizer,
}

impl MockOptimizer {
    pub const DEFAULT_SEED: u64 = 42;

    pub fn new(tunables: TunableGroups, config: &OptimizerConfig) -> Result<Self> {
        let mut config = config.clone();
        config.seed = Some(config.seed.unwrap_or(Self::DEFAULT_SEED));
        Ok(MockOptimizer {
            inner: RandomOptimizer::new(tunables, &config)?,
        })
    }
}

impl Optimizer for MockOptimizer {
    fn target(&self) -> &str {
        self.inner.target()
    }

    fn direction(&self) -> OptimizationDirection {
        self.inner.direction()
    }

    fn bulk_register(
        &mut self,
        configs: &[ParamDict],
        scores: &[Option<f64>],
        statuses: Option<&[Status]>,
    ) -> Result<bool> {
        self.inner.bulk_register(configs, scores, statuses)
    }

    fn suggest(&mut self) -> std::result::Result<TunableGroups, SuggestError> {
        self.inner.suggest()
    }

    fn register(
        &mut self,
        tunables: &TunableGroups,
        status: Status,
        score: Option<&ParamDict>,
    ) -> Result<Option<f64>> {
        self.inner.register(tunables, status, score)
    }

    fn best_observation(&self) -> Option<(f64, TunableGroups)> {
        self.inner.best_observation()
    }

    fn not_converged(&self) -> bool {
        self.inner.not_converged()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otto_tunables::{CovariantGroup, TunableDef};

    fn tunables() -> TunableGroups {
        let mut group = CovariantGroup::new("main", 1);
        group
            .add(
                Tunable::new(
                    "x",
                    TunableDef {
                        kind: TunableKind::Int,
                        description: None,
                        default: ParamValue::Int(0),
                        values: None,
                        range: Some((0.0, 100.0)),
                        quantization: None,
                        log: None,
                        distribution: None,
                        special: None,
                        values_weights: None,
                        special_weights: None,
                        range_weight: None,
                        meta: Default::default(),
                    },
                )
                .unwrap(),
            )
            .unwrap();
        group
            .add(
                Tunable::new(
                    "io_scheduler",
                    TunableDef {
                        kind: TunableKind::Categorical,
                        description: None,
                        default: ParamValue::Text("none".into()),
                        values: Some(vec!["none".into(), "bfq".into()]),
                        range: None,
                        quantization: None,
                        log: None,
                        distribution: None,
                        special: None,
                        values_weights: None,
                        special_weights: None,
                        range_weight: None,
                        meta: Default::default(),
                    },
                )
                .unwrap(),
            )
            .unwrap();
        let mut groups = TunableGroups::new();
        groups.add_group(group).unwrap();
        groups
    }

    fn config(max_iterations: u64) -> OptimizerConfig {
        OptimizerConfig {
            max_iterations: Some(max_iterations),
            seed: Some(7),
            ..Default::default()
        }
    }

    fn row(score: f64) -> ParamDict {
        let mut row = ParamDict::new();
        row.insert("score".into(), ParamValue::Float(score));
        row
    }

    #[test]
    fn test_suggestions_are_valid_assignments() {
        let mut opt = RandomOptimizer::new(tunables(), &config(10)).unwrap();
        for _ in 0..20 {
            let suggestion = opt.suggest().unwrap();
            let (x, _) = suggestion.get("x").unwrap();
            let value = x.value().as_f64().unwrap();
            assert!((0.0..=100.0).contains(&value));
        }
    }

    #[test]
    fn test_seeded_suggestions_repeat() {
        let mut a = RandomOptimizer::new(tunables(), &config(10)).unwrap();
        let mut b = RandomOptimizer::new(tunables(), &config(10)).unwrap();
        for _ in 0..5 {
            assert_eq!(a.suggest().unwrap(), b.suggest().unwrap());
        }
    }

    #[test]
    fn test_register_tracks_best_minimize() {
        let mut opt = RandomOptimizer::new(tunables(), &config(10)).unwrap();
        let space = tunables();
        opt.register(&space, Status::Succeeded, Some(&row(5.0))).unwrap();
        opt.register(&space, Status::Succeeded, Some(&row(3.0))).unwrap();
        opt.register(&space, Status::Succeeded, Some(&row(4.0))).unwrap();
        opt.register(&space, Status::Failed, None).unwrap();
        let (best, _) = opt.best_observation().unwrap();
        assert_eq!(best, 3.0);
    }

    #[test]
    fn test_register_tracks_best_maximize() {
        let config = OptimizerConfig {
            maximize: Some("score".into()),
            seed: Some(7),
            ..Default::default()
        };
        let mut opt = RandomOptimizer::new(tunables(), &config).unwrap();
        let space = tunables();
        let signed = opt
            .register(&space, Status::Succeeded, Some(&row(5.0)))
            .unwrap();
        // The modeling score is negated for maximization...
        assert_eq!(signed, Some(-5.0));
        opt.register(&space, Status::Succeeded, Some(&row(9.0))).unwrap();
        opt.register(&space, Status::Succeeded, Some(&row(7.0))).unwrap();
        // ...but the reported best is in user units.
        let (best, _) = opt.best_observation().unwrap();
        assert_eq!(best, 9.0);
    }

    #[test]
    fn test_inconsistent_observation() {
        let mut opt = RandomOptimizer::new(tunables(), &config(10)).unwrap();
        let space = tunables();
        assert!(opt.register(&space, Status::Succeeded, None).is_err());
        assert!(opt
            .register(&space, Status::Failed, Some(&row(1.0)))
            .is_err());
    }

    #[test]
    fn test_iteration_budget() {
        let mut opt = RandomOptimizer::new(tunables(), &config(2)).unwrap();
        let space = tunables();
        assert!(opt.not_converged());
        opt.register(&space, Status::Succeeded, Some(&row(1.0))).unwrap();
        assert!(opt.not_converged());
        opt.register(&space, Status::Succeeded, Some(&row(1.0))).unwrap();
        assert!(!opt.not_converged());
    }

    #[test]
    fn test_bulk_register_warm_start() {
        let mut opt = MockOptimizer::new(tunables(), &OptimizerConfig::default()).unwrap();
        let mut good = ParamDict::new();
        good.insert("x".into(), ParamValue::Int(10));
        let mut bad = ParamDict::new();
        bad.insert("x".into(), ParamValue::Int(90));
        let accepted = opt
            .bulk_register(
                &[good, bad],
                &[Some(0.25), None],
                Some(&[Status::Succeeded, Status::Failed]),
            )
            .unwrap();
        assert!(accepted);
        let (best, config) = opt.best_observation().unwrap();
        assert_eq!(best, 0.25);
        assert_eq!(
            config.get("x").unwrap().0.value(),
            &ParamValue::Int(10)
        );
    }
}
