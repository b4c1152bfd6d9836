use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::accelerator::Accelerator;
use super::backends::{StubAccelerator, StubConfig};
use crate::config::AcceleratorSettings;

/// Registry of available accelerators, keyed by backend name.
///
/// Accelerators are shared as `Arc<dyn Accelerator>`: submission takes `&self`
/// and each backend serialises its own device access.
pub struct AcceleratorRegistry {
    accelerators: HashMap<String, Arc<dyn Accelerator>>,
    default_name: Option<String>,
}

impl AcceleratorRegistry {
    pub fn new() -> Self {
        Self {
            accelerators: HashMap::new(),
            default_name: None,
        }
    }

    /// Build the registry the configuration asks for.
    ///
    /// The stub backend is always available. `tract` additionally loads the
    /// model (with fallback path resolution) and becomes the default.
    pub fn from_settings(settings: &AcceleratorSettings, max_batch_size: usize) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(StubAccelerator::new(StubConfig::from(settings))?));

        match settings.backend.as_str() {
            "stub" => {}
            "tract" => {
                #[cfg(feature = "backend-tract")]
                {
                    let model_path = resolve_model_path(
                        &settings.model_path,
                        settings.fallback_model_path.as_deref(),
                    )?;
                    let config = super::backends::TractConfig::from_settings(
                        settings,
                        model_path,
                        max_batch_size,
                    );
                    registry.register(Arc::new(super::backends::TractAccelerator::new(config)?));
                }
                #[cfg(not(feature = "backend-tract"))]
                {
                    let _ = max_batch_size;
                    return Err(anyhow!(
                        "backend 'tract' requires the backend-tract feature"
                    ));
                }
            }
            other => return Err(anyhow!("unknown accelerator backend '{}'", other)),
        }
        registry.set_default(&settings.backend)?;
        Ok(registry)
    }

    /// Register an accelerator. The first registered one becomes the default.
    pub fn register(&mut self, accelerator: Arc<dyn Accelerator>) {
        let name = accelerator.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.accelerators.insert(name, accelerator);
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.accelerators.contains_key(name) {
            return Err(anyhow!("accelerator '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Accelerator>> {
        self.accelerators.get(name).cloned()
    }

    pub fn default_accelerator(&self) -> Option<Arc<dyn Accelerator>> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Registered backend names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.accelerators.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for AcceleratorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the model artifact: the configured path if present, else the fallback.
pub fn resolve_model_path(primary: &Path, fallback: Option<&Path>) -> Result<PathBuf> {
    if primary.exists() {
        log::info!("using model {}", primary.display());
        return Ok(primary.to_path_buf());
    }
    match fallback {
        Some(fallback) if fallback.exists() => {
            log::warn!(
                "model {} not found, falling back to {}",
                primary.display(),
                fallback.display()
            );
            Ok(fallback.to_path_buf())
        }
        Some(fallback) => Err(anyhow!(
            "neither model {} nor fallback {} exists",
            primary.display(),
            fallback.display()
        )),
        None => Err(anyhow!("model {} not found", primary.display())),
    }
}
