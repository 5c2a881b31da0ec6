//! Scheduler-side environment that fabricates benchmark results.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use otto_core::{ParamDict, ParamValue, Result, Status};
use otto_tunables::{Tunable, TunableGroups};

use crate::environment::{CommonEnvConfig, EnvCore, EnvKind, Environment};

/// Noise half-width added to the synthetic benchmark value.
const NOISE_WIDTH: f64 = 0.2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockEnvConfig {
    #[serde(flatten)]
    pub common: CommonEnvConfig,
    /// Seed for the noise generator; noiseless when omitted.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Output range to shift the [0, 1] score into.
    #[serde(default)]
    pub range: Option<(f64, f64)>,
    /// Name of the produced metric.
    #[serde(default = "default_metric")]
    pub metric: String,
}

impl Default for MockEnvConfig {
    fn default() -> Self {
        MockEnvConfig {
            common: CommonEnvConfig::default(),
            seed: None,
            range: None,
            metric: default_metric(),
        }
    }
}

fn default_metric() -> String {
    "score".to_string()
}

/// Environment that computes a convex function of the tunables instead of
/// running a benchmark; the workhorse of driver and optimizer tests.
pub struct MockEnv {
    core: EnvCore,
    rng: Option<StdRng>,
    range: Option<(f64, f64)>,
    metric: String,
}

impl MockEnv {
    pub fn new(
        name: &str,
        config: MockEnvConfig,
        global_config: &ParamDict,
        tunables: &TunableGroups,
    ) -> Result<Self> {
        let core = EnvCore::new(name, &config.common, global_config, tunables)?;
        Ok(MockEnv {
            core,
            rng: config.seed.map(StdRng::seed_from_u64),
            range: config.range,
            metric: config.metric,
        })
    }

    /// Map the current value of a tunable onto [0, 1].
    fn normalized(tunable: &Tunable) -> f64 {
        let value = if tunable.is_categorical() {
            let labels = tunable.categories().unwrap_or(&[]);
            let index = labels
                .iter()
                .position(|l| Some(l.as_str()) == tunable.value().as_str())
                .unwrap_or(0);
            if labels.len() > 1 {
                index as f64 / (labels.len() - 1) as f64
            } else {
                0.0
            }
        } else {
            match (tunable.value().as_f64(), tunable.range()) {
                (Some(v), Some((lo, hi))) if hi > lo => (v - lo) / (hi - lo),
                _ => 0.0,
            }
        };
        value.clamp(0.0, 1.0)
    }
}

#[async_trait]
impl Environment for MockEnv {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn kind(&self) -> EnvKind {
        EnvKind::Mock
    }

    fn tunable_params(&self) -> &TunableGroups {
        self.core.tunable_params()
    }

    async fn setup_in(
        &mut self,
        tunables: &TunableGroups,
        global_config: &ParamDict,
        parent_params: &ParamDict,
    ) -> Result<bool> {
        self.core.setup_params(tunables, global_config, parent_params)?;
        self.core.set_ready(true);
        Ok(true)
    }

    async fn run(&mut self) -> (Status, Option<ParamDict>) {
        let (status, _) = self.core.status_of();
        if !status.is_ready() {
            return (status, None);
        }
        // Simple convex function of all tunable parameters.
        let tunables: Vec<f64> = self
            .core
            .tunable_params()
            .iter()
            .map(|(t, _)| Self::normalized(t).powi(2))
            .collect();
        let mut score = if tunables.is_empty() {
            0.0
        } else {
            tunables.iter().sum::<f64>() / tunables.len() as f64
        };
        if let Some(rng) = &mut self.rng {
            score += rng.gen_range(-NOISE_WIDTH..NOISE_WIDTH);
        }
        score = score.clamp(0.0, 1.0);
        if let Some((lo, hi)) = self.range {
            score = lo + score * (hi - lo);
        }
        info!(env = self.name(), score, "mock benchmark complete");
        let mut row = ParamDict::new();
        row.insert(self.metric.clone(), ParamValue::Float(score));
        (Status::Succeeded, Some(row))
    }

    async fn status(&self) -> (Status, Option<ParamDict>) {
        self.core.status_of()
    }

    async fn teardown(&mut self) {
        info!(env = self.name(), "teardown");
        self.core.set_ready(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otto_tunables::{CovariantGroup, TunableDef, TunableKind};

    fn tunables(value: i64) -> TunableGroups {
        let mut group = CovariantGroup::new("main", 1);
        let mut tunable = Tunable::new(
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
        .unwrap();
        tunable.assign(value).unwrap();
        group.add(tunable).unwrap();
        let mut groups = TunableGroups::new();
        groups.add_group(group).unwrap();
        groups
    }

    #[tokio::test]
    async fn test_run_before_setup_is_pending() {
        let tunables = tunables(0);
        let mut env = MockEnv::new(
            "mock",
            MockEnvConfig::default(),
            &ParamDict::new(),
            &tunables,
        )
        .unwrap();
        let (status, result) = env.run().await;
        assert_eq!(status, Status::Pending);
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_deterministic_score() {
        for _ in 0..2 {
            let tunables = tunables(100);
            let mut config = MockEnvConfig::default();
            config.range = Some((0.0, 100.0));
            let mut env = MockEnv::new("mock", config, &ParamDict::new(), &tunables).unwrap();
            assert!(env.setup(&tunables, &ParamDict::new()).await.unwrap());
            let (status, result) = env.run().await;
            assert_eq!(status, Status::Succeeded);
            // x at the top of its range and no noise: score is exactly 100.
            assert_eq!(
                result.unwrap().get("score").and_then(ParamValue::as_f64),
                Some(100.0)
            );
        }
    }

    #[tokio::test]
    async fn test_seeded_noise_is_reproducible() {
        let mut config = MockEnvConfig::default();
        config.seed = Some(42);
        let tunables = tunables(50);
        let mut first = None;
        for _ in 0..2 {
            let mut env =
                MockEnv::new("mock", config.clone(), &ParamDict::new(), &tunables).unwrap();
            env.setup(&tunables, &ParamDict::new()).await.unwrap();
            let (_, result) = env.run().await;
            let score = result.unwrap().get("score").and_then(ParamValue::as_f64);
            match first {
                None => first = Some(score),
                Some(prev) => assert_eq!(prev, score),
            }
        }
    }
}
