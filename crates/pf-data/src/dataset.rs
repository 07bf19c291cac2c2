use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Opaque handle to the data being fitted (e.g. image + noise map + PSF).
///
/// The pipeline never looks inside the payload; it only hands the handle to
/// the optimizer, which downcasts it to whatever its loader produced.
#[derive(Clone)]
pub struct Dataset {
    name: String,
    metadata: BTreeMap<String, serde_json::Value>,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Dataset {
    pub fn new<T: Any + Send + Sync>(name: impl Into<String>, payload: T) -> Self {
        Self {
            name: name.into(),
            metadata: BTreeMap::new(),
            payload: Arc::new(payload),
        }
    }

    /// Dataset with no payload, for optimizers that ignore the data.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, ())
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
