//! Device manager, driver seam, and shared state types

pub mod driver;
pub mod manager;
pub mod sim;
pub mod types;

pub use driver::TrackingDriver;
pub use manager::{DeviceManager, UpdateSink};
pub use sim::SimulatedDriver;
