use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::util::unix_millis;

/// Process-wide map of in-flight origin URLs to capture start timestamps.
/// Observability only; it does not serialize concurrent captures.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a capture start; the returned guard removes the entry when the
    /// request finishes, whichever way it finishes.
    pub fn begin(&self, url: &str) -> InFlightGuard {
        self.inner.lock().insert(url.to_string(), unix_millis());
        InFlightGuard {
            registry: self.clone(),
            url: url.to_string(),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.inner.lock().clone()
    }

    fn finish(&self, url: &str) {
        self.inner.lock().remove(url);
    }
}

pub struct InFlightGuard {
    registry: InFlightRegistry,
    url: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.finish(&self.url);
    }
}
