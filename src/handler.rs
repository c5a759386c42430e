use crate::capture::DeviceInfo;
use crate::error::Status;
use crate::module::{ModuleId, ModuleInstance};
use crate::sample::Sample;
use anyhow::{bail, Result};

/// Pipeline event callbacks
///
/// Callbacks run on whichever thread drives the pipeline: the caller's
/// thread for blocking `stream_frames`, the pipeline thread otherwise.
/// Returning an error from any callback except `on_status` stops the
/// pipeline; the error surfaces from the blocking call in progress or from
/// the next `acquire_frame`.
///
/// Per cycle the order is: device notifications, module completions (in
/// enablement order), then the raw sample notifications.
pub trait Handler: Send + Sync {
    /// Device opened, closed, lost or reconnected
    ///
    /// The result is ignored during init. Accepting a disconnect lets the
    /// pipeline try to reopen the device; refusing it, as the default does,
    /// stops the pipeline with `Error::DeviceLost`. An error on reconnect
    /// aborts the pipeline.
    fn on_connect(&self, device: &DeviceInfo, connected: bool) -> Result<()> {
        if !connected {
            bail!("device {} disconnected", device.name);
        }
        Ok(())
    }

    /// A module, or a raw stream group (`module` is `None`), was configured
    /// with the device profile during init
    fn on_module_set_profile(&self, _id: ModuleId, _module: Option<&ModuleInstance>) -> Result<()> {
        Ok(())
    }

    /// A module finished processing a sample
    fn on_module_processed_frame(
        &self,
        _id: ModuleId,
        _module: &ModuleInstance,
        _sample: &Sample,
    ) -> Result<()> {
        Ok(())
    }

    /// An explicitly requested stream group has a new sample
    fn on_new_sample(&self, _id: ModuleId, _sample: &Sample) -> Result<()> {
        Ok(())
    }

    /// Informational errors and warnings raised while streaming
    fn on_status(&self, _id: ModuleId, _status: Status) {}
}
