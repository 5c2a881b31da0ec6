//! Instantiation of environments, services, optimizers, storage and tunables
//! from `{class, config}` objects.
//!
//! Dynamic class loading is replaced by registries of factory closures keyed
//! by the logical class name; an unknown name is a configuration error.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use otto_core::{Error, ParamDict, Result};
use otto_env::{
    CommonEnvConfig, CompositeEnv, Environment, FileShareEnv, FileShareEnvConfig, LocalEnv,
    LocalEnvConfig, MockEnv, MockEnvConfig, RemoteEnv, RemoteEnvConfig,
};
use otto_optimizer::{Optimizer, OptimizerConfig, OptimizerRegistry};
use otto_remote::{HostOpsConfig, HostOpsService};
use otto_services::{FileShareService, LocalExecService, Service, ServiceRegistry};
use otto_storage::{MemoryStorage, Storage};
use otto_tunables::{CovariantGroup, GroupSnapshot, TunableGroups};

use crate::loader::{ClassSpec, ConfigPaths};

/// Context handed to environment factories; carries everything a node needs
/// plus the builder itself for recursive instantiation.
pub struct EnvBuildContext<'a> {
    pub builder: &'a ConfigBuilder,
    pub global_config: &'a ParamDict,
    pub tunables: &'a TunableGroups,
    pub services: &'a Arc<ServiceRegistry>,
}

type EnvFactory = Box<
    dyn Fn(&EnvBuildContext<'_>, &str, &Value) -> Result<Box<dyn Environment>> + Send + Sync,
>;

type ServiceFactory =
    Box<dyn Fn(&ConfigBuilder, &Value) -> Result<Arc<dyn Service>> + Send + Sync>;

/// Builds the object graph out of parsed configuration values.
pub struct ConfigBuilder {
    paths: ConfigPaths,
    env_classes: HashMap<String, EnvFactory>,
    service_classes: HashMap<String, ServiceFactory>,
    optimizers: OptimizerRegistry,
}

impl ConfigBuilder {
    pub fn new(paths: ConfigPaths) -> Self {
        let mut builder = ConfigBuilder {
            paths,
            env_classes: HashMap::new(),
            service_classes: HashMap::new(),
            optimizers: OptimizerRegistry::with_builtin(),
        };
        builder.register_builtin_envs();
        builder.register_builtin_services();
        builder
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn optimizers_mut(&mut self) -> &mut OptimizerRegistry {
        &mut self.optimizers
    }

    pub fn register_env_class<F>(&mut self, class: &str, factory: F)
    where
        F: Fn(&EnvBuildContext<'_>, &str, &Value) -> Result<Box<dyn Environment>>
            + Send
            + Sync
            + 'static,
    {
        self.env_classes.insert(class.to_string(), Box::new(factory));
    }

    pub fn register_service_class<F>(&mut self, class: &str, factory: F)
    where
        F: Fn(&ConfigBuilder, &Value) -> Result<Arc<dyn Service>> + Send + Sync + 'static,
    {
        self.service_classes
            .insert(class.to_string(), Box::new(factory));
    }

    fn register_builtin_envs(&mut self) {
        self.register_env_class("otto.env.mock", |ctx, name, config| {
            let config: MockEnvConfig = from_config(config)?;
            Ok(Box::new(MockEnv::new(
                name,
                config,
                ctx.global_config,
                ctx.tunables,
            )?))
        });
        self.register_env_class("otto.env.local", |ctx, name, config| {
            let config: LocalEnvConfig = from_config(config)?;
            Ok(Box::new(LocalEnv::new(
                name,
                config,
                ctx.global_config,
                ctx.tunables,
                Arc::clone(ctx.services),
            )?))
        });
        self.register_env_class("otto.env.remote", |ctx, name, config| {
            let config: RemoteEnvConfig = from_config(config)?;
            Ok(Box::new(RemoteEnv::new(
                name,
                config,
                ctx.global_config,
                ctx.tunables,
                Arc::clone(ctx.services),
            )?))
        });
        self.register_env_class("otto.env.fileshare", |ctx, name, config| {
            let config: FileShareEnvConfig = from_config(config)?;
            Ok(Box::new(FileShareEnv::new(
                name,
                config,
                ctx.global_config,
                ctx.tunables,
                Arc::clone(ctx.services),
            )?))
        });
        self.register_env_class("otto.env.composite", |ctx, name, config| {
            let common: CommonEnvConfig = from_config(config)?;
            let mut children: Vec<Box<dyn Environment>> = Vec::new();
            for file in string_list(config.get("include_children"))? {
                let child_value = ctx.builder.paths.load(&file)?;
                for child in as_list(&child_value) {
                    children.push(ctx.builder.build_environment(child, ctx)?);
                }
            }
            if let Some(inline) = config.get("children").and_then(Value::as_array) {
                for child in inline {
                    children.push(ctx.builder.build_environment(child, ctx)?);
                }
            }
            Ok(Box::new(CompositeEnv::new(
                name,
                &common,
                ctx.global_config,
                ctx.tunables,
                children,
            )?))
        });
    }

    fn register_builtin_services(&mut self) {
        self.register_service_class("otto.service.local_exec", |_builder, config| {
            let temp_dir = config
                .get("temp_dir")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(Arc::new(LocalExecService::new(temp_dir)))
        });
        self.register_service_class("otto.service.fileshare", |_builder, config| {
            let share_root = config
                .get("share_root")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::config("fileshare service: missing share_root"))?;
            Ok(Arc::new(FileShareService::new(share_root)))
        });
        self.register_service_class("otto.service.host_ops", |_builder, config| {
            let config: HostOpsConfig = from_config(config)?;
            Ok(Arc::new(HostOpsService::new(config)?))
        });
    }

    /// Instantiate an environment from a `{class, name, config}` value.
    pub fn build_environment(
        &self,
        value: &Value,
        ctx: &EnvBuildContext<'_>,
    ) -> Result<Box<dyn Environment>> {
        let spec = ConfigPaths::class_spec(value)?;
        let factory = self.env_classes.get(&spec.class).ok_or_else(|| {
            Error::config(format!("unknown environment class: {}", spec.class))
        })?;
        let name = spec.name.as_deref().unwrap_or(spec.class.as_str());
        info!(class = spec.class, name, "build environment");
        factory(ctx, name, &spec.config)
    }

    /// Load and instantiate the root environment from a config file.
    pub fn load_environment(
        &self,
        file: &str,
        global_config: &ParamDict,
        tunables: &TunableGroups,
        services: &Arc<ServiceRegistry>,
    ) -> Result<Box<dyn Environment>> {
        let value = self.paths.load(file)?;
        let ctx = EnvBuildContext {
            builder: self,
            global_config,
            tunables,
            services,
        };
        self.build_environment(&value, &ctx)
    }

    /// Instantiate one service provider.
    pub fn build_service(&self, value: &Value) -> Result<Arc<dyn Service>> {
        let spec = ConfigPaths::class_spec(value)?;
        let factory = self.service_classes.get(&spec.class).ok_or_else(|| {
            Error::config(format!("unknown service class: {}", spec.class))
        })?;
        info!(class = spec.class, "build service");
        factory(self, &spec.config)
    }

    /// Assemble a service registry from a services config file: an array of
    /// class objects, or an object with `services` and `include_services`.
    pub fn load_services(
        &self,
        files: &[String],
        cancel: CancellationToken,
    ) -> Result<ServiceRegistry> {
        let mut registry = ServiceRegistry::with_cancel(cancel);
        self.load_services_into(files, &mut registry)?;
        Ok(registry)
    }

    /// Register config-file providers into an existing registry; they shadow
    /// anything registered before them.
    pub fn load_services_into(
        &self,
        files: &[String],
        registry: &mut ServiceRegistry,
    ) -> Result<()> {
        for file in files {
            let value = self.paths.load(file)?;
            self.register_services_from(&value, registry)?;
        }
        Ok(())
    }

    fn register_services_from(
        &self,
        value: &Value,
        registry: &mut ServiceRegistry,
    ) -> Result<()> {
        if let Some(object) = value.as_object() {
            if object.contains_key("services") || object.contains_key("include_services") {
                for file in string_list(object.get("include_services"))? {
                    let included = self.paths.load(&file)?;
                    self.register_services_from(&included, registry)?;
                }
                if let Some(inline) = object.get("services") {
                    for spec in as_list(inline) {
                        registry.register(self.build_service(spec)?);
                    }
                }
                return Ok(());
            }
        }
        for spec in as_list(value) {
            registry.register(self.build_service(spec)?);
        }
        Ok(())
    }

    /// Build the tunable space from a config value: a map of covariant group
    /// name to `{cost, params}`, plus optional `include_tunables` files.
    pub fn build_tunables(&self, value: &Value) -> Result<TunableGroups> {
        let mut groups = TunableGroups::new();
        self.merge_tunables_from(value, &mut groups)?;
        Ok(groups)
    }

    pub fn load_tunables(&self, files: &[String]) -> Result<TunableGroups> {
        let mut groups = TunableGroups::new();
        for file in files {
            let value = self.paths.load(file)?;
            self.merge_tunables_from(&value, &mut groups)?;
        }
        Ok(groups)
    }

    fn merge_tunables_from(&self, value: &Value, groups: &mut TunableGroups) -> Result<()> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::config("tunables config must be an object"))?;
        for (key, group_value) in object {
            if key == "include_tunables" {
                for file in string_list(Some(group_value))? {
                    let included = self.paths.load(&file)?;
                    self.merge_tunables_from(&included, groups)?;
                }
                continue;
            }
            let snapshot: GroupSnapshot = serde_json::from_value(group_value.clone())
                .map_err(|err| {
                    Error::config(format!("malformed tunable group {key}: {err}"))
                })?;
            groups.add_group(CovariantGroup::from_snapshot(key, snapshot)?)?;
        }
        Ok(())
    }

    /// Build an optimizer from a `{class, config}` value. Class names take
    /// the `otto.optimizer.` prefix or the bare variant name.
    pub fn build_optimizer(
        &self,
        value: &Value,
        tunables: &TunableGroups,
    ) -> Result<Box<dyn Optimizer>> {
        let spec = ConfigPaths::class_spec(value)?;
        let config: OptimizerConfig = from_config(&spec.config)?;
        let class = spec
            .class
            .strip_prefix("otto.optimizer.")
            .unwrap_or(&spec.class);
        self.optimizers.build(class, tunables, &config)
    }

    /// Build a storage backend from a `{class, config}` value.
    pub async fn build_storage(&self, value: &Value) -> Result<Box<dyn Storage>> {
        let spec = ConfigPaths::class_spec(value)?;
        match spec.class.as_str() {
            "otto.storage.memory" => Ok(Box::new(MemoryStorage::new())),
            #[cfg(feature = "sqlite")]
            "otto.storage.sql" => {
                let url = spec
                    .config
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or("sqlite::memory:");
                Ok(Box::new(otto_storage::SqlStorage::connect(url).await?))
            }
            other => Err(Error::config(format!("unknown storage class: {other}"))),
        }
    }
}

/// Deserialize a `config` sub-object, treating a JSON null as empty.
fn from_config<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T> {
    let value = match value {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(value)
        .map_err(|err| Error::config(format!("malformed config object: {err}")))
}

fn as_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn string_list(value: Option<&Value>) -> Result<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::config("expected a list of file names"))
            })
            .collect(),
        Some(other) => Err(Error::config(format!(
            "expected a file name or list of file names, got: {other}"
        ))),
    }
}
