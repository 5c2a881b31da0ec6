//! Name -> operation lookup composed from pluggable service providers.
//!
//! Services live in an arena and are addressed by integer handles; the
//! "parent" view of a service is the snapshot of the operation table at the
//! time it was registered, so providers registered later shadow earlier ones
//! while still being able to delegate to them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use otto_core::{Error, ParamDict, Result, Status};

/// Index of a service in the registry arena.
pub type ServiceHandle = usize;

/// A pluggable provider of named operations.
///
/// Every exported operation accepts a single flat parameter dict and returns
/// a status plus a dict that extends the input with any continuation handles.
#[async_trait]
pub trait Service: Send + Sync {
    /// Names of the operations this service exports.
    fn exports(&self) -> Vec<&'static str>;

    /// Invoke one of the exported operations.
    async fn invoke(
        &self,
        ctx: &ServiceContext<'_>,
        op: &str,
        params: &ParamDict,
    ) -> Result<(Status, ParamDict)>;
}

struct RegisteredService {
    service: Arc<dyn Service>,
    /// Operation table as it was when this service was registered.
    parent_ops: HashMap<String, ServiceHandle>,
}

/// Read-only after construction; the driver builds it once and shares it with
/// the environment tree.
pub struct ServiceRegistry {
    services: Vec<RegisteredService>,
    ops: HashMap<String, ServiceHandle>,
    cancel: CancellationToken,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry::with_cancel(CancellationToken::new())
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        ServiceRegistry {
            services: Vec::new(),
            ops: HashMap::new(),
            cancel,
        }
    }

    /// Token observed by long-running operations at every suspension point.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Add a provider; its exports shadow earlier providers of the same name.
    pub fn register(&mut self, service: Arc<dyn Service>) -> ServiceHandle {
        let handle = self.services.len();
        let parent_ops = self.ops.clone();
        for op in service.exports() {
            debug!(op, handle, "register service operation");
            self.ops.insert(op.to_string(), handle);
        }
        self.services.push(RegisteredService {
            service,
            parent_ops,
        });
        handle
    }

    pub fn has_op(&self, op: &str) -> bool {
        self.ops.contains_key(op)
    }

    pub fn op_names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }

    /// Invoke an operation through the fully composed lookup table.
    pub async fn call(&self, op: &str, params: &ParamDict) -> Result<(Status, ParamDict)> {
        let handle = *self
            .ops
            .get(op)
            .ok_or_else(|| Error::config(format!("unknown service operation: {op}")))?;
        self.invoke_handle(handle, op, params).await
    }

    async fn invoke_handle(
        &self,
        handle: ServiceHandle,
        op: &str,
        params: &ParamDict,
    ) -> Result<(Status, ParamDict)> {
        let entry = &self.services[handle];
        let ctx = ServiceContext {
            registry: self,
            parent_ops: &entry.parent_ops,
            cancel: &self.cancel,
        };
        entry.service.invoke(&ctx, op, params).await
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        ServiceRegistry::new()
    }
}

/// Per-invocation view handed to a service: the parent lookup table and the
/// cancellation token.
pub struct ServiceContext<'a> {
    registry: &'a ServiceRegistry,
    parent_ops: &'a HashMap<String, ServiceHandle>,
    cancel: &'a CancellationToken,
}

impl ServiceContext<'_> {
    /// Invoke an operation as seen by this service's parent; this is how a
    /// provider delegates to the services registered before it.
    pub async fn call(&self, op: &str, params: &ParamDict) -> Result<(Status, ParamDict)> {
        let handle = *self.parent_ops.get(op).ok_or_else(|| {
            Error::config(format!("unknown parent service operation: {op}"))
        })?;
        self.registry.invoke_handle(handle, op, params).await
    }

    pub fn has_parent_op(&self, op: &str) -> bool {
        self.parent_ops.contains_key(op)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.cancel
    }
}
