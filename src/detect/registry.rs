use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::config::ScannerConfig;

use super::backend::FrameDetector;
use super::backends::EdgeHeuristicBackend;

/// Shared handle to a registered strategy.
pub type SharedDetector = Arc<Mutex<dyn FrameDetector>>;

/// Registry of detector strategies, keyed by name.
///
/// Strategies are wrapped in `Mutex` because `FrameDetector::detect` takes `&mut self`.
pub struct DetectorRegistry {
    detectors: HashMap<String, SharedDetector>,
    default_name: Option<String>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            detectors: HashMap::new(),
            default_name: None,
        }
    }

    /// Build the registry the configuration allows.
    ///
    /// `edge` is always present and is the default. `vision` needs an API key
    /// and `objects` needs a model file; each also needs its cargo feature.
    pub fn from_config(config: &ScannerConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(EdgeHeuristicBackend::new(config.edge));

        #[cfg(feature = "backend-vision")]
        {
            if let Some(api_key) = config.vision.api_key.as_deref() {
                let backend = super::backends::VisionModelBackend::new(&config.vision, api_key)?;
                registry.register(backend);
            } else {
                log::debug!("vision detector not registered: no API key configured");
            }
        }

        #[cfg(feature = "backend-tract")]
        {
            if let Some(model_path) = config.objects.model_path.as_deref() {
                let model =
                    super::backends::TractObjectModel::load(model_path, config.objects.input_size)?;
                registry.register(super::backends::ObjectClassifierBackend::new(model));
            } else {
                log::debug!("objects detector not registered: no model path configured");
            }
        }

        Ok(registry)
    }

    /// Register a strategy. The first registered strategy becomes the default.
    pub fn register<D: FrameDetector + 'static>(&mut self, detector: D) {
        let name = detector.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.detectors.insert(name, Arc::new(Mutex::new(detector)));
    }

    /// Set default strategy by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.detectors.contains_key(name) {
            return Err(anyhow!("detector '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SharedDetector> {
        self.detectors.get(name).cloned()
    }

    pub fn default_detector(&self) -> Option<SharedDetector> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Registered strategy names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.detectors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Pick the preferred strategy, degrading to the default when it is not
    /// registered. Returns the name actually selected.
    pub fn resolve(&self, preferred: &str) -> Result<(String, SharedDetector)> {
        let preferred = preferred.trim().to_lowercase();
        if let Some(detector) = self.get(&preferred) {
            return Ok((preferred, detector));
        }
        let default_name = self
            .default_name
            .clone()
            .ok_or_else(|| anyhow!("no detectors registered"))?;
        let detector = self
            .get(&default_name)
            .ok_or_else(|| anyhow!("default detector '{}' missing", default_name))?;
        log::warn!(
            "detector '{}' unavailable (registered: {:?}); using '{}'",
            preferred,
            self.list(),
            default_name
        );
        Ok((default_name, detector))
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubBackend;

    #[test]
    fn first_registered_is_default() {
        let mut registry = DetectorRegistry::new();
        registry.register(EdgeHeuristicBackend::default());
        registry.register(StubBackend::empty());
        let default = registry.default_detector().unwrap();
        assert_eq!(default.lock().unwrap().name(), "edge");
        assert_eq!(registry.list(), vec!["edge".to_string(), "stub".to_string()]);
    }

    #[test]
    fn set_default_requires_registration() {
        let mut registry = DetectorRegistry::new();
        registry.register(EdgeHeuristicBackend::default());
        assert!(registry.set_default("vision").is_err());
        registry.register(StubBackend::empty());
        registry.set_default("stub").unwrap();
        let default = registry.default_detector().unwrap();
        assert_eq!(default.lock().unwrap().name(), "stub");
    }

    #[test]
    fn resolve_degrades_to_default() {
        let mut registry = DetectorRegistry::new();
        registry.register(EdgeHeuristicBackend::default());
        let (name, detector) = registry.resolve("vision").unwrap();
        assert_eq!(name, "edge");
        assert_eq!(detector.lock().unwrap().name(), "edge");

        let (name, _) = registry.resolve(" EDGE ").unwrap();
        assert_eq!(name, "edge");
    }

    #[test]
    fn resolve_on_empty_registry_fails() {
        assert!(DetectorRegistry::new().resolve("edge").is_err());
    }

    #[test]
    fn from_config_always_has_edge() {
        let mut config = ScannerConfig::default();
        config.vision.api_key = None;
        config.objects.model_path = None;
        let registry = DetectorRegistry::from_config(&config).unwrap();
        assert_eq!(registry.list(), vec!["edge".to_string()]);
    }
}
