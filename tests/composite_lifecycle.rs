//! End-to-end behavior of composite environments under the driver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use ottobench::core::{ParamDict, ParamValue, Result, Status};
use ottobench::driver::ExperimentDriver;
use ottobench::env::{
    CommonEnvConfig, CompositeEnv, EnvCore, EnvKind, Environment, MockEnv, MockEnvConfig,
};
use ottobench::optimizer::{MockOptimizer, OptimizerConfig};
use ottobench::storage::{ExperimentScope, ExperimentSpec, MemoryStorage, Storage};
use ottobench::tunables::{CovariantGroup, Tunable, TunableDef, TunableGroups, TunableKind};

fn tunables() -> TunableGroups {
    let mut group = CovariantGroup::new("main", 1);
    group
        .add(
            Tunable::new(
                "x",
                TunableDef {
                    kind: TunableKind::Int,
                    description: None,
                    default: ParamValue::Int(50),
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
    let mut groups = TunableGroups::new();
    groups.add_group(group).unwrap();
    groups
}

/// Benchmark stand-in that fails on one specific invocation.
struct FlakyEnv {
    core: EnvCore,
    fail_on_run: usize,
    runs: Arc<AtomicUsize>,
    teardowns: Arc<AtomicUsize>,
}

impl FlakyEnv {
    fn boxed(
        fail_on_run: usize,
        runs: Arc<AtomicUsize>,
        teardowns: Arc<AtomicUsize>,
    ) -> Box<dyn Environment> {
        Box::new(FlakyEnv {
            core: EnvCore::new(
                "flaky",
                &CommonEnvConfig::default(),
                &ParamDict::new(),
                &TunableGroups::new(),
            )
            .unwrap(),
            fail_on_run,
            runs,
            teardowns,
        })
    }
}

#[async_trait]
impl Environment for FlakyEnv {
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
        self.core
            .setup_params(tunables, global_config, parent_params)?;
        self.core.set_ready(true);
        Ok(true)
    }

    async fn run(&mut self) -> (Status, Option<ParamDict>) {
        let attempt = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == self.fail_on_run {
            return (Status::Failed, None);
        }
        let mut row = ParamDict::new();
        row.insert("score".into(), ParamValue::Float(attempt as f64));
        (Status::Succeeded, Some(row))
    }

    async fn status(&self) -> (Status, Option<ParamDict>) {
        self.core.status_of()
    }

    async fn teardown(&mut self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.core.set_ready(false);
    }
}

/// Mock child wrapper that counts teardowns.
struct CountingMock {
    inner: MockEnv,
    teardowns: Arc<AtomicUsize>,
}

#[async_trait]
impl Environment for CountingMock {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> EnvKind {
        self.inner.kind()
    }

    fn tunable_params(&self) -> &TunableGroups {
        self.inner.tunable_params()
    }

    async fn setup_in(
        &mut self,
        tunables: &TunableGroups,
        global_config: &ParamDict,
        parent_params: &ParamDict,
    ) -> Result<bool> {
        self.inner
            .setup_in(tunables, global_config, parent_params)
            .await
    }

    async fn run(&mut self) -> (Status, Option<ParamDict>) {
        self.inner.run().await
    }

    async fn status(&self) -> (Status, Option<ParamDict>) {
        self.inner.status().await
    }

    async fn teardown(&mut self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.inner.teardown().await;
    }
}

/// Composite of two children where the second fails deterministically on
/// iteration 3: that trial is failed, the first child is torn down exactly
/// once at driver shutdown, and iteration 4 proceeds.
#[tokio::test]
async fn test_composite_child_failure_fails_only_that_trial() {
    let space = tunables();
    let first_teardowns = Arc::new(AtomicUsize::new(0));
    let flaky_runs = Arc::new(AtomicUsize::new(0));
    let flaky_teardowns = Arc::new(AtomicUsize::new(0));

    let first = Box::new(CountingMock {
        inner: MockEnv::new("warmup", MockEnvConfig::default(), &ParamDict::new(), &space)
            .unwrap(),
        teardowns: Arc::clone(&first_teardowns),
    });
    let second = FlakyEnv::boxed(3, Arc::clone(&flaky_runs), Arc::clone(&flaky_teardowns));
    let mut env = CompositeEnv::new(
        "root",
        &CommonEnvConfig::default(),
        &ParamDict::new(),
        &space,
        vec![first, second],
    )
    .unwrap();

    let spec = ExperimentSpec {
        experiment_id: "composite-exp".into(),
        root_env_hash: ottobench::driver::root_env_hash(&env),
        opt_target: "score".into(),
        param_space_hash: env.tunable_params().space_hash(),
        description: None,
        merge_experiments: Vec::new(),
    };
    let mut opt = MockOptimizer::new(
        space.clone(),
        &OptimizerConfig {
            max_iterations: Some(5),
            ..Default::default()
        },
    )
    .unwrap();
    let storage = MemoryStorage::new();
    let driver = ExperimentDriver::new("composite-exp", ParamDict::new());
    let best = driver.optimize(&mut env, &mut opt, &storage).await.unwrap();
    assert!(best.is_some());

    // Both children were torn down exactly once, at driver shutdown.
    assert_eq!(first_teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(flaky_teardowns.load(Ordering::SeqCst), 1);
    // All five iterations ran; only #3 failed.
    assert_eq!(flaky_runs.load(Ordering::SeqCst), 5);

    let scope = storage.experiment(spec).await.unwrap();
    let (_, _, statuses) = scope.load().await.unwrap();
    assert_eq!(statuses.len(), 5);
    assert_eq!(
        statuses,
        vec![
            Status::Succeeded,
            Status::Succeeded,
            Status::Failed,
            Status::Succeeded,
            Status::Succeeded,
        ]
    );
}

/// Teardown order: children are torn down in reverse declaration order.
#[tokio::test]
async fn test_composite_teardown_order() {
    let space = tunables();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    struct Ordered {
        core: EnvCore,
        tag: &'static str,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Environment for Ordered {
        fn name(&self) -> &str {
            self.tag
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
            self.core
                .setup_params(tunables, global_config, parent_params)?;
            self.core.set_ready(true);
            Ok(true)
        }
        async fn run(&mut self) -> (Status, Option<ParamDict>) {
            (Status::Succeeded, Some(ParamDict::new()))
        }
        async fn status(&self) -> (Status, Option<ParamDict>) {
            self.core.status_of()
        }
        async fn teardown(&mut self) {
            self.order.lock().unwrap().push(self.tag);
        }
    }

    let make = |tag: &'static str| -> Box<dyn Environment> {
        Box::new(Ordered {
            core: EnvCore::new(
                tag,
                &CommonEnvConfig::default(),
                &ParamDict::new(),
                &TunableGroups::new(),
            )
            .unwrap(),
            tag,
            order: Arc::clone(&order),
        })
    };
    let mut env = CompositeEnv::new(
        "root",
        &CommonEnvConfig::default(),
        &ParamDict::new(),
        &space,
        vec![make("c1"), make("c2"), make("c3")],
    )
    .unwrap();
    assert!(env.setup(&space, &ParamDict::new()).await.unwrap());
    env.teardown().await;
    assert_eq!(*order.lock().unwrap(), vec!["c3", "c2", "c1"]);
}
