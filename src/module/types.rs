use super::ModuleId;
use crate::sample::Sample;
use crate::stream::{StreamDesc, StreamRequest};
use anyhow::Result;
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

/// Trait for processing modules
/// Allows plugging different implementations (face, hand, blob, ...) behind
/// one identifier-keyed pipeline.
pub trait Module: Send + 'static {
    /// Streams this module consumes; merged into the device request at init
    fn required_streams(&self) -> Vec<StreamDesc>;

    /// Accept the stream profile the device was opened with
    ///
    /// Called once during init, after the device is open. Returning an error
    /// fails init.
    fn set_profile(&mut self, _profile: &StreamRequest) -> Result<()> {
        Ok(())
    }

    /// Process one cycle's sample and update the module's result
    fn process(&mut self, sample: &Sample) -> Result<()>;

    /// Reset internal state (for modules with temporal components)
    ///
    /// Called when the pipeline closes.
    fn reset_state(&mut self) {
        // Default implementation: no-op for stateless modules
    }

    fn as_any(&self) -> &dyn Any;
}

/// Handle to a running module.
///
/// The pipeline owns the module; handles are cheap clones of the shared slot.
#[derive(Clone)]
pub struct ModuleInstance {
    id: ModuleId,
    inner: Arc<Mutex<Box<dyn Module>>>,
}

impl ModuleInstance {
    pub(crate) fn new(id: ModuleId, module: Box<dyn Module>) -> Self {
        Self {
            id,
            inner: Arc::new(Mutex::new(module)),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Lock the module for direct access. The pipeline takes the same lock
    /// while processing, so keep the guard short.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Module>> {
        // A module that panicked mid-process still holds its last result
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the concrete module type, or return `None` when the
    /// module is not a `T`.
    pub fn with<T, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R>
    where
        T: Module,
    {
        let guard = self.lock();
        guard.as_any().downcast_ref::<T>().map(f)
    }

    pub fn is<T: Module>(&self) -> bool {
        self.lock().as_any().is::<T>()
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        seen: u64,
    }

    impl Module for Counter {
        fn required_streams(&self) -> Vec<StreamDesc> {
            Vec::new()
        }

        fn process(&mut self, sample: &Sample) -> Result<()> {
            self.seen = sample.sequence();
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Other;

    impl Module for Other {
        fn required_streams(&self) -> Vec<StreamDesc> {
            Vec::new()
        }

        fn process(&mut self, _sample: &Sample) -> Result<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_typed_lookup() {
        let instance = ModuleInstance::new(ModuleId(1), Box::new(Counter { seen: 0 }));
        instance
            .lock()
            .process(&Sample::new(9, std::time::Instant::now()))
            .unwrap();

        assert_eq!(instance.with(|c: &Counter| c.seen), Some(9));
        assert_eq!(instance.with(|_: &Other| ()), None);
        assert!(instance.is::<Counter>());
        assert_eq!(instance.clone().id(), ModuleId(1));
    }
}
