//! From JSON configs to a finished experiment: the launcher path.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use ottobench::config::{ConfigBuilder, ConfigLoaderService, ConfigPaths};
use ottobench::core::{ParamDict, ParamValue};
use ottobench::driver::ExperimentDriver;
use ottobench::services::{LocalExecService, ServiceRegistry};

fn write(dir: &std::path::Path, name: &str, text: &str) {
    std::fs::write(dir.join(name), text).unwrap();
}

#[tokio::test]
async fn test_config_driven_experiment() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "tunables.jsonc",
        r#"{
            // one covariant group with a single knob
            "kernel": {
                "cost": 100,
                "params": {
                    "sched_latency_ns": {
                        "type": "int",
                        "default": 2000000,
                        "range": [100000, 10000000]
                    }
                }
            }
        }"#,
    );
    write(
        dir.path(),
        "environment.jsonc",
        r#"{
            "$schema": "https://example.com/schemas/environment.json",
            "class": "otto.env.composite",
            "name": "bench-root",
            "config": {
                "tunable_params": ["kernel"],
                "children": [
                    {
                        "class": "otto.env.mock",
                        "name": "bench",
                        "config": {"seed": 11, "range": [0, 100]}
                    }
                ]
            }
        }"#,
    );
    write(
        dir.path(),
        "optimizer.jsonc",
        r#"{
            "class": "otto.optimizer.mock",
            "config": {"max_iterations": 4, "seed": 5}
        }"#,
    );

    let paths = ConfigPaths::new(&[dir.path().to_path_buf()], None);
    let builder = ConfigBuilder::new(paths.clone());
    let tunables = builder
        .load_tunables(&["tunables.jsonc".to_string()])
        .unwrap();

    let cancel = CancellationToken::new();
    let mut registry = ServiceRegistry::with_cancel(cancel.clone());
    registry.register(Arc::new(ConfigLoaderService::new(paths)));
    registry.register(Arc::new(LocalExecService::new(None)));
    let registry = Arc::new(registry);

    let mut global_config = ParamDict::new();
    global_config.insert("experiment_id".into(), ParamValue::Text("cfg-e2e".into()));

    let mut env = builder
        .load_environment("environment.jsonc", &global_config, &tunables, &registry)
        .unwrap();
    let optimizer_value = builder.paths().load("optimizer.jsonc").unwrap();
    let mut optimizer = builder
        .build_optimizer(&optimizer_value, env.tunable_params())
        .unwrap();
    let storage = builder
        .build_storage(&serde_json::json!({"class": "otto.storage.memory", "config": {}}))
        .await
        .unwrap();

    let driver = ExperimentDriver::new("cfg-e2e", global_config).with_cancel(cancel);
    let best = driver
        .optimize(env.as_mut(), optimizer.as_mut(), storage.as_ref())
        .await
        .unwrap();
    let (score, config) = best.expect("mock benchmarks always succeed");
    assert!((0.0..=100.0).contains(&score));
    assert!(config.get("sched_latency_ns").is_some());
}
