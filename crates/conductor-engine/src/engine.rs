use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use conductor_core::config::EngineConfig;
use conductor_core::definition::WorkflowDefinition;
use conductor_core::error::{ConductorError, Result};
use conductor_core::event::EventBus;
use conductor_core::traits::{PersistenceSink, ReasoningBackend};
use conductor_executors::ExecutorRegistry;
use conductor_store::MemoryRunStore;

use crate::tracker::ExecutionTracker;

/// Dependencies shared by the controller, the invoker, and the service.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<ExecutorRegistry>,
    reasoner: Option<Arc<dyn ReasoningBackend>>,
    tracker: ExecutionTracker,
    event_bus: Arc<EventBus>,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            registry: None,
            reasoner: None,
            sink: None,
            event_bus: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn reasoner(&self) -> Option<&Arc<dyn ReasoningBackend>> {
        self.reasoner.as_ref()
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Validate a definition and add it to the catalog, replacing any
    /// definition with the same id.
    pub fn register_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;
        let id = definition.id.clone();
        let mut defs = self.definitions.write().unwrap_or_else(|e| e.into_inner());
        if defs.insert(id.clone(), Arc::new(definition)).is_some() {
            info!(definition = %id, "Replaced workflow definition");
        }
        Ok(())
    }

    pub fn definition(&self, id: &str) -> Result<Arc<WorkflowDefinition>> {
        let defs = self.definitions.read().unwrap_or_else(|e| e.into_inner());
        defs.get(id)
            .cloned()
            .ok_or_else(|| ConductorError::DefinitionNotFound(id.to_string()))
    }

    /// Registered definition ids, sorted.
    pub fn definition_ids(&self) -> Vec<String> {
        let defs = self.definitions.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = defs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Load every `*.toml` / `*.json` definition in a directory. Files that
    /// fail to load or validate are logged and skipped.
    pub fn load_definitions(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "toml" || e == "json")
            })
            .collect();
        paths.sort();

        for path in paths {
            match WorkflowDefinition::load(&path).and_then(|d| self.register_definition(d)) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping workflow definition"),
            }
        }
        info!(dir = %dir.display(), count = loaded, "Loaded workflow definitions");
        Ok(loaded)
    }
}

/// Assembles an [`Engine`]. Unset parts default to the built-in executors,
/// an in-memory store, and a fresh event bus.
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<ExecutorRegistry>,
    reasoner: Option<Arc<dyn ReasoningBackend>>,
    sink: Option<Arc<dyn PersistenceSink>>,
    event_bus: Option<Arc<EventBus>>,
}

impl EngineBuilder {
    pub fn registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn reasoner(mut self, reasoner: Arc<dyn ReasoningBackend>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let event_bus = self.event_bus.unwrap_or_default();
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(MemoryRunStore::new()));
        Arc::new(Engine {
            config: self.config,
            registry: Arc::new(self.registry.unwrap_or_else(ExecutorRegistry::with_builtins)),
            reasoner: self.reasoner,
            tracker: ExecutionTracker::new(sink, event_bus.clone()),
            event_bus,
            definitions: RwLock::new(HashMap::new()),
        })
    }
}
