//! Ordered module lifecycle: `{Init, AfterInit, BeforeShutdown, Shutdown}`
//! run across two registries (system modules, then user modules) in a
//! fixed start/stop order.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

/// A component with an ordered four-phase lifecycle.
///
/// Registered once before startup; the registry never mutates its module
/// list once [`ModuleRegistry::start_all`] has begun.
#[async_trait]
pub trait Module: Send + Sync {
    /// Identifies this module in logs and init-failure messages.
    fn name(&self) -> &str;

    /// Constructs internal state. A failure here aborts startup.
    ///
    /// # Errors
    ///
    /// Returns any error that should stop the node from starting.
    async fn init(&self) -> Result<(), anyhow::Error> { Ok(()) }

    /// Runs once every module's [`Module::init`] has succeeded; used to
    /// publish readiness (e.g. registering with discovery).
    ///
    /// # Errors
    ///
    /// Returns any error that should stop the node from starting.
    async fn after_init(&self) -> Result<(), anyhow::Error> { Ok(()) }

    /// Runs before [`Module::shutdown`], in reverse registration order;
    /// used to stop accepting new work.
    async fn before_shutdown(&self) {}

    /// Releases resources. Runs last, in reverse registration order.
    async fn shutdown(&self) {}
}

/// An `Init`/`AfterInit` failure, carrying the offending module's name.
#[derive(Debug, Error)]
#[error("module {module} failed to start: {source}")]
pub struct StartError {
    /// The module that failed.
    pub module: String,
    /// The underlying cause.
    #[source]
    pub source: anyhow::Error,
}

/// Two ordered module lists — system modules, then user modules — started
/// and stopped together in the order startup requires: system modules
/// start before user modules; shutdown reverses that, user modules first.
#[derive(Default)]
pub struct ModuleRegistry {
    system: Vec<Box<dyn Module>>,
    user: Vec<Box<dyn Module>>,
}

impl ModuleRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self { Self { system: Vec::new(), user: Vec::new() } }

    /// Registers a framework-provided module, started before user modules.
    pub fn register_system(&mut self, module: impl Module + 'static) { self.system.push(Box::new(module)); }

    /// Registers an application module, started after system modules.
    pub fn register_user(&mut self, module: impl Module + 'static) { self.user.push(Box::new(module)); }

    /// Runs `Init` then `AfterInit` across system modules, then user
    /// modules, in registration order within each list.
    ///
    /// # Errors
    ///
    /// Returns the first [`StartError`] encountered; modules already
    /// started are left running (the caller is expected to call
    /// [`ModuleRegistry::shutdown_all`] on failure if a clean exit is
    /// wanted).
    pub async fn start_all(&self) -> Result<(), StartError> {
        for module in self.system.iter().chain(self.user.iter()) {
            info!(module = module.name(), "module init");
            module.init().await.map_err(|source| StartError { module: module.name().to_owned(), source })?;
        }
        for module in self.system.iter().chain(self.user.iter()) {
            info!(module = module.name(), "module after_init");
            module
                .after_init()
                .await
                .map_err(|source| StartError { module: module.name().to_owned(), source })?;
        }
        Ok(())
    }

    /// Runs `BeforeShutdown` then `Shutdown` across user modules, then
    /// system modules, each in reverse registration order.
    ///
    /// Failures are logged and do not stop remaining modules from
    /// shutting down.
    pub async fn shutdown_all(&self) {
        for module in self.user.iter().rev().chain(self.system.iter().rev()) {
            info!(module = module.name(), "module before_shutdown");
            module.before_shutdown().await;
        }
        for module in self.user.iter().rev().chain(self.system.iter().rev()) {
            info!(module = module.name(), "module shutdown");
            module.shutdown().await;
        }
    }
}

/// Logs (rather than propagates) a shutdown-phase failure, matching the
/// "Shutdown failures are warned and continued" rule; modules that need
/// this call it from their own [`Module::shutdown`] implementation.
pub fn warn_shutdown_failure(module: &str, err: &anyhow::Error) {
    warn!(module, %err, "module shutdown step failed, continuing");
}
