//! Simulated tracking driver
//!
//! Produces believable 6-DOF motion without hardware: every tracker orbits
//! the origin at head height with a per-tracker phase offset, valuators
//! sweep sinusoids with a little seeded jitter, buttons toggle at random,
//! batteries drain slowly and the HMD's measured IPD drifts. Power-off and
//! haptic commands are recorded for inspection instead of reaching any
//! hardware.

use crate::config::SimulationConfig;
use crate::devices::driver::TrackingDriver;
use crate::devices::manager::UpdateSink;
use crate::devices::types::{BatteryState, TrackerState};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Orbit angular velocity, radians per second
const ORBIT_RATE: f32 = 0.5;
const BATTERY_DRAIN_PERIOD: Duration = Duration::from_secs(10);
const IPD_DRIFT_PERIOD: Duration = Duration::from_secs(3);

/// Hardware action received by the driver, kept for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCommand {
    PowerOff { feature: usize },
    HapticTick { feature: usize, duration_ms: u16 },
}

pub struct SimulatedDriver {
    config: SimulationConfig,
    sink: UpdateSink,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    commands: Arc<Mutex<Vec<DriverCommand>>>,
}

impl SimulatedDriver {
    pub fn new(config: SimulationConfig, sink: UpdateSink) -> Self {
        Self {
            config,
            sink,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every power-off and haptic command received so far, oldest first.
    pub fn commands(&self) -> Arc<Mutex<Vec<DriverCommand>>> {
        Arc::clone(&self.commands)
    }
}

impl TrackingDriver for SimulatedDriver {
    fn name(&self) -> &str {
        "simulated"
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::SeqCst);
        let config = self.config.clone();
        let sink = self.sink.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let worker = thread::Builder::new()
            .name("pose-sim".to_string())
            .spawn(move || simulation_loop(config, sink, shutdown))
            .map_err(|err| Error::Other(format!("Failed to spawn simulation thread: {err}")))?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Simulation thread panicked during shutdown");
            }
        }
    }

    fn power_off(&mut self, feature: usize) -> Result<()> {
        log::debug!("Simulated power off, feature {}", feature);
        self.commands.lock().push(DriverCommand::PowerOff { feature });
        Ok(())
    }

    fn haptic_tick(&mut self, feature: usize, duration_ms: u16) -> Result<()> {
        log::debug!(
            "Simulated haptic tick, feature {} for {} ms",
            feature,
            duration_ms
        );
        self.commands.lock().push(DriverCommand::HapticTick {
            feature,
            duration_ms,
        });
        Ok(())
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn simulation_loop(config: SimulationConfig, sink: UpdateSink, shutdown: Arc<AtomicBool>) {
    let mut rng = if config.random_seed == 0 {
        SmallRng::from_entropy()
    } else {
        SmallRng::seed_from_u64(config.random_seed)
    };
    let rate = config.update_rate_hz.max(1.0);
    let period = Duration::from_secs_f32(1.0 / rate);
    log::info!(
        "Simulation running at {} Hz (seed {}, orbit radius {} m)",
        rate,
        config.random_seed,
        config.orbit_radius
    );

    let started = Instant::now();
    let mut next_tick = Instant::now();
    let mut batteries = vec![BatteryState::default(); sink.num_devices()];
    let mut drain_cursor = 0usize;
    let mut drift_cursor = 0usize;
    let mut last_drain = Instant::now();
    let mut last_drift = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        let t = started.elapsed().as_secs_f32();

        sink.publish_tracker_state(|packet| {
            for (index, tracker) in packet.trackers.iter_mut().enumerate() {
                let phase = ORBIT_RATE * t + index as f32 * std::f32::consts::FRAC_PI_3;
                orbit_state(tracker, config.orbit_radius, phase);
            }
            for (index, value) in packet.valuators.iter_mut().enumerate() {
                let sweep = (t * 0.8 + index as f32).sin() * 0.5;
                *value = (sweep + rng.gen_range(-0.01..0.01)).clamp(-1.0, 1.0);
            }
            if !packet.buttons.is_empty() && rng.gen_bool(0.02) {
                let button = rng.gen_range(0..packet.buttons.len());
                packet.buttons[button] = !packet.buttons[button];
            }
        });

        if !batteries.is_empty() && last_drain.elapsed() >= BATTERY_DRAIN_PERIOD {
            last_drain = Instant::now();
            let device = drain_cursor % batteries.len();
            drain_cursor += 1;
            let battery = &mut batteries[device];
            if battery.charging {
                battery.percent = (battery.percent + 5).min(100);
                if battery.percent == 100 {
                    battery.charging = false;
                }
            } else if battery.percent > 5 {
                battery.percent -= 1;
            } else {
                battery.charging = true;
            }
            sink.publish_battery_state(device, *battery);
        }

        if sink.num_hmds() > 0 && last_drift.elapsed() >= IPD_DRIFT_PERIOD {
            last_drift = Instant::now();
            let hmd = drift_cursor % sink.num_hmds();
            drift_cursor += 1;
            if let Some(mut configuration) = sink.hmd_configuration(hmd) {
                configuration.ipd =
                    (configuration.ipd + rng.gen_range(-0.0003..0.0003)).clamp(0.058, 0.070);
                sink.publish_hmd_configuration(hmd, configuration);
            }
        }

        next_tick += period;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            // fell behind, resync instead of bursting
            next_tick = now;
        }
    }
    log::debug!("Simulation thread exiting");
}

/// Circular path at head height, facing the orbit center.
fn orbit_state(tracker: &mut TrackerState, radius: f32, angle: f32) {
    tracker.position = [
        radius * angle.cos(),
        1.5 + 0.05 * (angle * 2.6).sin(),
        radius * angle.sin(),
    ];
    let yaw = -angle;
    tracker.orientation = [0.0, (yaw / 2.0).sin(), 0.0, (yaw / 2.0).cos()];
    tracker.linear_velocity = [
        -radius * ORBIT_RATE * angle.sin(),
        0.0,
        radius * ORBIT_RATE * angle.cos(),
    ];
    tracker.angular_velocity = [0.0, -ORBIT_RATE, 0.0];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::devices::manager::DeviceManager;

    #[test]
    fn test_commands_are_recorded_in_order() {
        let manager = DeviceManager::from_config(&Config::default()).unwrap();
        let mut driver = SimulatedDriver::new(SimulationConfig::default(), manager.update_sink());
        driver.power_off(0).unwrap();
        driver.haptic_tick(1, 40).unwrap();

        let commands = driver.commands();
        let commands = commands.lock();
        assert_eq!(
            *commands,
            vec![
                DriverCommand::PowerOff { feature: 0 },
                DriverCommand::HapticTick {
                    feature: 1,
                    duration_ms: 40
                },
            ]
        );
    }

    #[test]
    fn test_simulation_publishes_then_stops() {
        let manager = DeviceManager::from_config(&Config::default()).unwrap();
        let config = SimulationConfig {
            update_rate_hz: 200.0,
            random_seed: 7,
            orbit_radius: 1.0,
        };
        let mut driver = SimulatedDriver::new(config, manager.update_sink());

        driver.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        driver.stop();

        let stamped = manager.tracker_state().timestamp_us;
        assert!(stamped > 0, "simulation should have published at least once");
        let position = manager.tracker_state().trackers[0].position;
        assert!(position[0] != 0.0 || position[2] != 0.0);

        // No further publications after stop
        thread::sleep(Duration::from_millis(30));
        assert_eq!(manager.tracker_state().timestamp_us, stamped);

        // Restartable
        driver.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        driver.stop();
        assert!(manager.tracker_state().timestamp_us > stamped);
    }

    #[test]
    fn test_orbit_velocity_is_tangent() {
        let mut tracker = TrackerState::default();
        orbit_state(&mut tracker, 2.0, 0.7);
        // Velocity is perpendicular to the radial direction in the plane.
        let dot = tracker.position[0] * tracker.linear_velocity[0]
            + tracker.position[2] * tracker.linear_velocity[2];
        assert!(dot.abs() < 1e-4, "radial component should vanish, got {dot}");
    }
}
