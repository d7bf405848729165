//! Lazily loaded, memoized separation engines.
//!
//! Each engine name maps to a shared `tokio::sync::OnceCell`. The first
//! resolver runs the blocking load on the blocking pool; concurrent
//! resolvers of the same name await that single load. A failed load leaves
//! the cell empty so the next caller retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;

use crate::engine::{EngineLoadError, EngineLoader, SeparationEngine};

type EngineCell = Arc<OnceCell<Arc<dyn SeparationEngine>>>;

pub struct ModelCache {
    loader: Arc<dyn EngineLoader>,
    engines: Mutex<HashMap<String, EngineCell>>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            loader,
            engines: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EngineCell>> {
        self.engines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the engine named `name`, loading it on first use.
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn SeparationEngine>, EngineLoadError> {
        let cell = Arc::clone(self.lock().entry(name.to_string()).or_default());

        let engine = cell
            .get_or_try_init(|| async {
                let loader = Arc::clone(&self.loader);
                let owned = name.to_string();
                tracing::info!(engine = %name, "Loading separation engine");
                let started = std::time::Instant::now();

                let engine = tokio::task::spawn_blocking(move || loader.load(&owned))
                    .await
                    .map_err(|e| EngineLoadError::Failed {
                        name: name.to_string(),
                        reason: format!("loader task failed: {e}"),
                    })??;

                tracing::info!(
                    engine = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Separation engine loaded",
                );
                Ok::<_, EngineLoadError>(engine)
            })
            .await
            .inspect_err(|e| tracing::warn!(engine = %name, error = %e, "Engine load failed"))?;

        Ok(Arc::clone(engine))
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.lock()
            .get(name)
            .is_some_and(|cell| cell.initialized())
    }

    /// Names of engines loaded so far, sorted.
    pub fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
