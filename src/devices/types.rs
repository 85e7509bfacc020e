//! State types shared between the device manager, the wire codecs, and the
//! drivers.
//!
//! Trackers, buttons and valuators live in flat global index spaces; a
//! [`VirtualDevice`] names a contiguous slice of each. The global spaces are
//! the concatenation of the per-device counts in configuration order.

use std::time::{SystemTime, UNIX_EPOCH};

/// One tracked point: pose plus first derivatives. 13 floats on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerState {
    /// Position in meters
    pub position: [f32; 3],
    /// Unit quaternion, x y z w
    pub orientation: [f32; 4],
    /// Meters per second
    pub linear_velocity: [f32; 3],
    /// Radians per second
    pub angular_velocity: [f32; 3],
}

impl Default for TrackerState {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            orientation: [0.0, 0.0, 0.0, 1.0],
            linear_velocity: [0.0; 3],
            angular_velocity: [0.0; 3],
        }
    }
}

/// Snapshot of every tracker, button and valuator at one sample time.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerPacket {
    /// Sample time, microseconds since the Unix epoch
    pub timestamp_us: u64,
    pub trackers: Vec<TrackerState>,
    pub buttons: Vec<bool>,
    pub valuators: Vec<f32>,
}

impl TrackerPacket {
    /// An all-defaults packet sized for `layout`.
    pub fn for_layout(layout: &DeviceLayout) -> Self {
        Self {
            timestamp_us: 0,
            trackers: vec![TrackerState::default(); layout.trackers],
            buttons: vec![false; layout.buttons],
            valuators: vec![0.0; layout.valuators],
        }
    }

    /// Stamp the packet with the current wall-clock time.
    pub fn touch(&mut self) {
        self.timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as u64)
            .unwrap_or(0);
    }
}

/// Sizes of the three global index spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceLayout {
    pub trackers: usize,
    pub buttons: usize,
    pub valuators: usize,
}

/// One named input device and the slices of the global index spaces it owns.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualDevice {
    pub name: String,
    pub tracker_first: usize,
    pub num_trackers: usize,
    pub button_first: usize,
    pub num_buttons: usize,
    pub valuator_first: usize,
    pub num_valuators: usize,
}

/// Battery charge of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryState {
    pub charging: bool,
    /// 0 to 100
    pub percent: u8,
}

impl Default for BatteryState {
    fn default() -> Self {
        // Full until a driver reports otherwise
        Self {
            charging: false,
            percent: 100,
        }
    }
}

/// Display geometry of one eye in the viewer frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EyeGeometry {
    /// Eye position relative to the head tracker, meters
    pub offset: [f32; 3],
    /// Tangent half-angles, left/right/bottom/top
    pub fov: [f32; 4],
}

/// Display configuration of one head-mounted display, identified by the
/// global index of the tracker it is attached to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HmdConfiguration {
    pub tracker_index: u16,
    /// Per-eye pixels, width then height
    pub resolution: [u32; 2],
    /// Inter-pupillary distance in meters
    pub ipd: f32,
    /// Left eye then right eye
    pub eyes: [EyeGeometry; 2],
}

impl HmdConfiguration {
    /// Placeholder geometry for `tracker_index`, used until a driver reports
    /// the real display.
    pub fn for_tracker(tracker_index: u16) -> Self {
        let ipd = 0.063;
        let fov = [1.0, 1.0, 1.0, 1.0];
        Self {
            tracker_index,
            resolution: [1920, 1080],
            ipd,
            eyes: [
                EyeGeometry {
                    offset: [-ipd / 2.0, 0.0, 0.0],
                    fov,
                },
                EyeGeometry {
                    offset: [ipd / 2.0, 0.0, 0.0],
                    fov,
                },
            ],
        }
    }
}

/// Maps one global power or haptic feature index back to its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFeature {
    /// Index into the virtual-device table
    pub device: usize,
    /// Feature index local to that device
    pub local_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tracker_orientation_is_identity() {
        let state = TrackerState::default();
        assert_eq!(state.orientation, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(state.position, [0.0; 3]);
    }

    #[test]
    fn test_packet_sized_for_layout() {
        let layout = DeviceLayout {
            trackers: 3,
            buttons: 12,
            valuators: 6,
        };
        let packet = TrackerPacket::for_layout(&layout);
        assert_eq!(packet.trackers.len(), 3);
        assert_eq!(packet.buttons.len(), 12);
        assert_eq!(packet.valuators.len(), 6);
        assert_eq!(packet.timestamp_us, 0);
    }

    #[test]
    fn test_touch_stamps_current_time() {
        let mut packet = TrackerPacket::for_layout(&DeviceLayout::default());
        packet.touch();
        assert!(packet.timestamp_us > 0, "wall clock should be past the epoch");
    }

    #[test]
    fn test_placeholder_hmd_eyes_straddle_the_nose() {
        let hmd = HmdConfiguration::for_tracker(4);
        assert_eq!(hmd.tracker_index, 4);
        assert!(hmd.eyes[0].offset[0] < 0.0);
        assert!(hmd.eyes[1].offset[0] > 0.0);
        assert_eq!(hmd.eyes[0].offset[0], -hmd.eyes[1].offset[0]);
    }
}
