//! Driver seam between the device manager and tracking hardware

use crate::error::Result;

/// One tracking backend. The manager owns the driver and brackets its
/// lifetime with `start`/`stop`; between those calls the driver feeds state
/// through the `UpdateSink` it was built with, from whatever thread it
/// likes.
///
/// `feature` arguments are global power/haptic feature indices; the manager
/// bounds-checks them before forwarding.
pub trait TrackingDriver: Send {
    fn name(&self) -> &str;

    /// Begin producing updates. Called at most once per `stop`.
    fn start(&mut self) -> Result<()>;

    /// Stop producing updates and release the hardware. Must be safe to
    /// call without a preceding `start`.
    fn stop(&mut self);

    fn power_off(&mut self, feature: usize) -> Result<()> {
        let _ = feature;
        Ok(())
    }

    fn haptic_tick(&mut self, feature: usize, duration_ms: u16) -> Result<()> {
        let _ = (feature, duration_ms);
        Ok(())
    }
}
