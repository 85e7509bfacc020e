//! Authoritative device state behind per-topic locks
//!
//! The manager owns three independently locked topics (tracker packet,
//! battery states, HMD configurations) plus the immutable layout and
//! descriptor tables built from configuration. Drivers mutate topics
//! through a cloneable [`UpdateSink`]; each publication updates the topic
//! under its lock and then fires the registered change-notification
//! callback outside the lock, so a callback can never deadlock against a
//! reader holding the topic guard.
//!
//! Consumers read topics through the guard accessors and must hold the
//! guard only long enough to copy or serialize the value.

use crate::config::Config;
use crate::devices::driver::TrackingDriver;
use crate::devices::types::{
    BatteryState, DeviceFeature, DeviceLayout, HmdConfiguration, TrackerPacket, VirtualDevice,
};
use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type TrackerCallback = Box<dyn Fn() + Send + Sync>;
type IndexedCallback = Box<dyn Fn(usize) + Send + Sync>;

/// Topic values and notification slots shared with update sinks.
struct SharedTopics {
    tracker_packet: Mutex<TrackerPacket>,
    battery_states: Mutex<Vec<BatteryState>>,
    hmd_configurations: Mutex<Vec<HmdConfiguration>>,
    on_tracker: Mutex<Option<TrackerCallback>>,
    on_battery: Mutex<Option<IndexedCallback>>,
    on_hmd: Mutex<Option<IndexedCallback>>,
}

pub struct DeviceManager {
    layout: DeviceLayout,
    devices: Vec<VirtualDevice>,
    power_features: Vec<DeviceFeature>,
    haptic_features: Vec<DeviceFeature>,
    topics: Arc<SharedTopics>,
    driver: Mutex<Option<Box<dyn TrackingDriver>>>,
    running: AtomicBool,
}

impl DeviceManager {
    /// Build the global index spaces by concatenating the per-device counts
    /// in configuration order. Every device gets one battery slot; every
    /// `hmd = true` device contributes one display configuration bound to
    /// its first tracker. Rejects configurations whose concatenated spaces
    /// outgrow the u16 indices used on the wire.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut layout = DeviceLayout::default();
        let mut devices = Vec::with_capacity(config.devices.len());
        let mut power_features = Vec::new();
        let mut haptic_features = Vec::new();
        let mut hmds = Vec::new();

        for (device_index, device) in config.devices.iter().enumerate() {
            if device.hmd && device.trackers == 0 {
                return Err(Error::InvalidParameter(format!(
                    "device '{}' is an HMD but has no trackers",
                    device.name
                )));
            }
            devices.push(VirtualDevice {
                name: device.name.clone(),
                tracker_first: layout.trackers,
                num_trackers: device.trackers as usize,
                button_first: layout.buttons,
                num_buttons: device.buttons as usize,
                valuator_first: layout.valuators,
                num_valuators: device.valuators as usize,
            });
            if device.hmd {
                hmds.push(HmdConfiguration::for_tracker(layout.trackers as u16));
            }
            for local_index in 0..device.power_features as usize {
                power_features.push(DeviceFeature {
                    device: device_index,
                    local_index,
                });
            }
            for local_index in 0..device.haptic_features as usize {
                haptic_features.push(DeviceFeature {
                    device: device_index,
                    local_index,
                });
            }
            layout.trackers += device.trackers as usize;
            layout.buttons += device.buttons as usize;
            layout.valuators += device.valuators as usize;
        }

        // Device records, battery updates and feature requests all address
        // these spaces with u16 wire fields.
        let widest = layout
            .trackers
            .max(layout.buttons)
            .max(layout.valuators)
            .max(devices.len())
            .max(power_features.len())
            .max(haptic_features.len());
        if widest > u16::MAX as usize {
            return Err(Error::InvalidParameter(format!(
                "concatenated index space of {widest} exceeds the wire maximum of {}",
                u16::MAX
            )));
        }

        log::info!(
            "Device manager: {} devices, {} trackers, {} buttons, {} valuators, {} HMDs",
            devices.len(),
            layout.trackers,
            layout.buttons,
            layout.valuators,
            hmds.len()
        );

        let battery_states = vec![BatteryState::default(); devices.len()];
        let tracker_packet = TrackerPacket::for_layout(&layout);
        Ok(Self {
            layout,
            devices,
            power_features,
            haptic_features,
            topics: Arc::new(SharedTopics {
                tracker_packet: Mutex::new(tracker_packet),
                battery_states: Mutex::new(battery_states),
                hmd_configurations: Mutex::new(hmds),
                on_tracker: Mutex::new(None),
                on_battery: Mutex::new(None),
                on_hmd: Mutex::new(None),
            }),
            driver: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    pub fn devices(&self) -> &[VirtualDevice] {
        &self.devices
    }

    pub fn num_power_features(&self) -> usize {
        self.power_features.len()
    }

    pub fn num_haptic_features(&self) -> usize {
        self.haptic_features.len()
    }

    pub fn tracker_state(&self) -> MutexGuard<'_, TrackerPacket> {
        self.topics.tracker_packet.lock()
    }

    pub fn battery_states(&self) -> MutexGuard<'_, Vec<BatteryState>> {
        self.topics.battery_states.lock()
    }

    pub fn hmd_configurations(&self) -> MutexGuard<'_, Vec<HmdConfiguration>> {
        self.topics.hmd_configurations.lock()
    }

    /// A producer-side handle for drivers.
    pub fn update_sink(&self) -> UpdateSink {
        UpdateSink {
            topics: Arc::clone(&self.topics),
        }
    }

    pub fn set_driver(&self, driver: Box<dyn TrackingDriver>) {
        *self.driver.lock() = Some(driver);
    }

    // === Change notifications ===

    /// Called after every tracker-packet publication.
    pub fn notify_tracker_updates(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.topics.on_tracker.lock() = Some(Box::new(callback));
    }

    /// Called with the device index after a battery state actually changes.
    pub fn notify_battery_updates(&self, callback: impl Fn(usize) + Send + Sync + 'static) {
        *self.topics.on_battery.lock() = Some(Box::new(callback));
    }

    /// Called with the HMD index after a display configuration actually
    /// changes.
    pub fn notify_hmd_updates(&self, callback: impl Fn(usize) + Send + Sync + 'static) {
        *self.topics.on_hmd.lock() = Some(Box::new(callback));
    }

    // === Lifecycle ===

    /// Idempotent: only the first call after a `stop` reaches the driver.
    /// A driver failure leaves the manager stopped.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut driver = self.driver.lock();
        if let Some(driver) = driver.as_mut() {
            log::info!("Starting tracking driver '{}'", driver.name());
            if let Err(err) = driver.start() {
                self.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(driver) = self.driver.lock().as_mut() {
            log::info!("Stopping tracking driver '{}'", driver.name());
            driver.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // === Hardware actions ===

    pub fn power_off(&self, feature: usize) -> Result<()> {
        let Some(&DeviceFeature { device, .. }) = self.power_features.get(feature) else {
            return Err(Error::InvalidParameter(format!(
                "power feature {feature} out of range"
            )));
        };
        log::debug!(
            "Power off feature {} (device '{}')",
            feature,
            self.devices[device].name
        );
        if let Some(driver) = self.driver.lock().as_mut() {
            driver.power_off(feature)?;
        }
        Ok(())
    }

    pub fn haptic_tick(&self, feature: usize, duration_ms: u16) -> Result<()> {
        let Some(&DeviceFeature { device, .. }) = self.haptic_features.get(feature) else {
            return Err(Error::InvalidParameter(format!(
                "haptic feature {feature} out of range"
            )));
        };
        log::debug!(
            "Haptic tick on feature {} for {} ms (device '{}')",
            feature,
            duration_ms,
            self.devices[device].name
        );
        if let Some(driver) = self.driver.lock().as_mut() {
            driver.haptic_tick(feature, duration_ms)?;
        }
        Ok(())
    }
}

/// Producer-side handle for publishing topic changes. Clone-cheap and
/// `Send`; drivers keep one per producer thread.
#[derive(Clone)]
pub struct UpdateSink {
    topics: Arc<SharedTopics>,
}

impl UpdateSink {
    /// Mutate the tracker packet under its lock, stamp it with the current
    /// time, then notify.
    pub fn publish_tracker_state(&self, mutate: impl FnOnce(&mut TrackerPacket)) {
        {
            let mut packet = self.topics.tracker_packet.lock();
            mutate(&mut packet);
            packet.touch();
        }
        if let Some(callback) = self.topics.on_tracker.lock().as_ref() {
            callback();
        }
    }

    /// Store a device's battery state. Returns false, and skips the
    /// notification, when the value is unchanged or the index is out of
    /// range.
    pub fn publish_battery_state(&self, device: usize, state: BatteryState) -> bool {
        {
            let mut states = self.topics.battery_states.lock();
            match states.get_mut(device) {
                Some(current) if *current != state => *current = state,
                _ => return false,
            }
        }
        if let Some(callback) = self.topics.on_battery.lock().as_ref() {
            callback(device);
        }
        true
    }

    /// Store an HMD's display configuration, with the same dedupe rule as
    /// battery states.
    pub fn publish_hmd_configuration(&self, hmd: usize, configuration: HmdConfiguration) -> bool {
        {
            let mut configurations = self.topics.hmd_configurations.lock();
            match configurations.get_mut(hmd) {
                Some(current) if *current != configuration => *current = configuration,
                _ => return false,
            }
        }
        if let Some(callback) = self.topics.on_hmd.lock().as_ref() {
            callback(hmd);
        }
        true
    }

    pub fn num_devices(&self) -> usize {
        self.topics.battery_states.lock().len()
    }

    pub fn num_hmds(&self) -> usize {
        self.topics.hmd_configurations.lock().len()
    }

    /// Copy of one HMD's current configuration, for read-modify-write
    /// publications.
    pub fn hmd_configuration(&self, hmd: usize) -> Option<HmdConfiguration> {
        self.topics.hmd_configurations.lock().get(hmd).copied()
    }
}
