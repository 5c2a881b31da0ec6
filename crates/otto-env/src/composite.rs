//! Composite environment: the ordered composition of child environments.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use otto_core::{ParamDict, Result, Status};
use otto_tunables::TunableGroups;

use crate::environment::{CommonEnvConfig, EnvCore, EnvKind, Environment};

/// An environment whose behavior is the ordered composition of children.
///
/// Setup short-circuits on the first failing child; run stops on the first
/// child whose status is not good and otherwise returns the last child's
/// result; teardown walks the children in reverse declaration order.
pub struct CompositeEnv {
    core: EnvCore,
    children: Vec<Box<dyn Environment>>,
}

impl CompositeEnv {
    pub fn new(
        name: &str,
        config: &CommonEnvConfig,
        global_config: &ParamDict,
        tunables: &TunableGroups,
        children: Vec<Box<dyn Environment>>,
    ) -> Result<Self> {
        if children.is_empty() {
            return Err(otto_core::Error::config(format!(
                "composite environment {name}: at least one child must be present"
            )));
        }
        let mut core = EnvCore::new(name, config, global_config, tunables)?;
        // The composite's configuration space is the union of its own groups
        // and everything its children consume.
        let mut space = core.tunable_params().clone();
        for child in &children {
            space.merge(child.tunable_params())?;
        }
        *core.tunable_params_mut() = space;
        Ok(CompositeEnv { core, children })
    }

    pub fn children(&self) -> &[Box<dyn Environment>] {
        &self.children
    }
}

#[async_trait]
impl Environment for CompositeEnv {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn kind(&self) -> EnvKind {
        EnvKind::Composite
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
        let mut all_ready = true;
        for child in &mut self.children {
            let ready = child
                .setup_in(tunables, global_config, self.core.params())
                .await?;
            if !ready {
                // Already-set-up children stay set up; they are torn down
                // when this composite's teardown runs.
                warn!(env = self.core.name(), child = child.name(), "child setup failed");
                all_ready = false;
                break;
            }
        }
        self.core.set_ready(all_ready);
        Ok(all_ready)
    }

    async fn run(&mut self) -> (Status, Option<ParamDict>) {
        let (status, _) = self.core.status_of();
        if !status.is_ready() {
            return (status, None);
        }
        info!(env = self.core.name(), children = self.children.len(), "run");
        let mut result = (status, None);
        for child in &mut self.children {
            debug!(child = child.name(), "child run");
            result = child.run().await;
            if !result.0.is_good() {
                warn!(child = child.name(), status = %result.0, "child run stopped the chain");
                break;
            }
        }
        result
    }

    async fn status(&self) -> (Status, Option<ParamDict>) {
        self.core.status_of()
    }

    async fn teardown(&mut self) {
        // Reverse declaration order; every child is torn down regardless of
        // its siblings.
        for child in self.children.iter_mut().rev() {
            child.teardown().await;
        }
        self.core.set_ready(false);
        info!(env = self.core.name(), "teardown complete");
    }
}
