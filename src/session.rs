use crate::capture::CaptureBackend;
use crate::config::SenseConfig;
use crate::error::{Error, Result};
use crate::manager::SenseManager;
use crate::module::{BlobModule, Module, ModuleDesc, ModuleId, ModuleKind};
use std::sync::Arc;

type ModuleFactory = Box<dyn Fn() -> anyhow::Result<Box<dyn Module>> + Send + Sync>;

struct Provider {
    id: ModuleId,
    name: String,
    factory: ModuleFactory,
}

/// Registry of module implementations, keyed by identifier
#[derive(Default)]
pub struct ModuleRegistry {
    providers: Vec<Provider>,
}

impl ModuleRegistry {
    pub fn register<F>(&mut self, id: impl Into<ModuleId>, name: impl Into<String>, factory: F)
    where
        F: Fn() -> anyhow::Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        let id = id.into();
        let name = name.into();
        tracing::debug!("Registered module provider {} for {}", name, id);
        self.providers.push(Provider {
            id,
            name,
            factory: Box::new(factory),
        });
    }

    /// Names of the providers registered for `id`, in registration order
    pub fn providers(&self, id: ModuleId) -> Vec<&str> {
        self.providers
            .iter()
            .filter(|p| p.id == id)
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn contains(&self, id: ModuleId) -> bool {
        self.providers.iter().any(|p| p.id == id)
    }

    /// Instantiate the provider matching `desc`: the named one when a
    /// friendly name is given, otherwise the first registered.
    pub fn create(&self, desc: &ModuleDesc) -> Result<Box<dyn Module>> {
        let provider = self
            .providers
            .iter()
            .filter(|p| p.id == desc.id)
            .find(|p| match &desc.friendly_name {
                Some(name) => p.name == *name,
                None => true,
            })
            .ok_or_else(|| Error::ModuleUnavailable {
                id: desc.id,
                name: desc.friendly_name.clone(),
            })?;

        tracing::debug!("Creating module {} from provider {}", desc.id, provider.name);
        (provider.factory)().map_err(|source| Error::ModuleProfile {
            id: desc.id,
            source,
        })
    }
}

/// Context shared by the pipelines created from it
pub struct Session {
    registry: ModuleRegistry,
    config: SenseConfig,
}

impl Session {
    pub fn new() -> Self {
        Self::with_config(SenseConfig::default())
    }

    pub fn with_config(config: SenseConfig) -> Self {
        Self {
            registry: ModuleRegistry::default(),
            config,
        }
    }

    /// Session with the modules this crate ships registered
    pub fn with_builtin_modules() -> Self {
        let mut session = Self::new();
        session.register(ModuleKind::Blob, "blob-luma", || {
            Ok(Box::new(BlobModule::new()) as Box<dyn Module>)
        });
        session.register(ModuleKind::Blob, "blob-depth", || {
            Ok(Box::new(BlobModule::with_depth(1000)) as Box<dyn Module>)
        });
        session
    }

    pub fn register<F>(&mut self, id: impl Into<ModuleId>, name: impl Into<String>, factory: F)
    where
        F: Fn() -> anyhow::Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        self.registry.register(id, name, factory);
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SenseConfig {
        &self.config
    }

    /// Create a pipeline controller bound to this session and the given
    /// capture backend.
    pub fn create_sense_manager(self: &Arc<Self>, backend: Box<dyn CaptureBackend>) -> SenseManager {
        SenseManager::new(Arc::clone(self), backend)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
