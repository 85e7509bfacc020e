//! Whole-message encoders
//!
//! Server replies serialize straight out of the device manager; requests
//! are built by clients (and the integration tests). Every function
//! returns the complete message, id included, ready for one write.

use super::wire;
use super::{
    MessageId, MIN_VERSION_BATTERY_STATE, MIN_VERSION_DEVICE_FEATURES, MIN_VERSION_DEVICE_LIST,
    MIN_VERSION_HMD_CONFIGURATION,
};
use crate::devices::manager::DeviceManager;
use crate::devices::types::{BatteryState, HmdConfiguration, TrackerPacket};

pub fn put_message_id(buf: &mut Vec<u8>, id: MessageId) {
    wire::put_u16(buf, id as u16);
}

type SectionWriter = fn(&DeviceManager, &mut Vec<u8>);

/// CONNECT_REPLY tail sections, in increasing minimum-version order. A
/// negotiated version gets every section whose minimum it meets, so the
/// reply for version N is always a byte-prefix of the reply for N+1.
/// New sections are appended here, never inserted.
const CONNECT_REPLY_SECTIONS: &[(u32, SectionWriter)] = &[
    (MIN_VERSION_DEVICE_LIST, write_device_list),
    (MIN_VERSION_HMD_CONFIGURATION, write_hmd_configurations),
    (MIN_VERSION_BATTERY_STATE, write_battery_states),
    (MIN_VERSION_DEVICE_FEATURES, write_feature_counts),
];

pub fn connect_reply(manager: &DeviceManager, negotiated: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    put_message_id(&mut buf, MessageId::ConnectReply);
    wire::put_u32(&mut buf, negotiated);
    wire::put_layout(&mut buf, manager.layout());
    for &(min_version, write_section) in CONNECT_REPLY_SECTIONS {
        if negotiated >= min_version {
            write_section(manager, &mut buf);
        }
    }
    buf
}

fn write_device_list(manager: &DeviceManager, buf: &mut Vec<u8>) {
    let devices = manager.devices();
    wire::put_u32(buf, devices.len() as u32);
    for device in devices {
        wire::put_virtual_device(buf, device);
    }
}

fn write_hmd_configurations(manager: &DeviceManager, buf: &mut Vec<u8>) {
    let configurations = manager.hmd_configurations();
    wire::put_u32(buf, configurations.len() as u32);
    for configuration in configurations.iter() {
        wire::put_hmd_configuration(buf, configuration);
    }
}

fn write_battery_states(manager: &DeviceManager, buf: &mut Vec<u8>) {
    let states = manager.battery_states();
    wire::put_u32(buf, states.len() as u32);
    for state in states.iter() {
        wire::put_battery_state(buf, state);
    }
}

fn write_feature_counts(manager: &DeviceManager, buf: &mut Vec<u8>) {
    wire::put_u32(buf, manager.num_power_features() as u32);
    wire::put_u32(buf, manager.num_haptic_features() as u32);
}

pub fn packet_reply(packet: &TrackerPacket) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        2 + 8
            + packet.trackers.len() * wire::TRACKER_STATE_SIZE
            + packet.buttons.len()
            + packet.valuators.len() * 4,
    );
    put_message_id(&mut buf, MessageId::PacketReply);
    wire::put_tracker_packet(&mut buf, packet);
    buf
}

pub fn battery_state_update(device_index: u16, state: &BatteryState) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    put_message_id(&mut buf, MessageId::BatteryStateUpdate);
    wire::put_u16(&mut buf, device_index);
    wire::put_battery_state(&mut buf, state);
    buf
}

pub fn hmd_config_update(configuration: &HmdConfiguration) -> Vec<u8> {
    let mut buf = Vec::with_capacity(72);
    put_message_id(&mut buf, MessageId::HmdConfigUpdate);
    wire::put_hmd_configuration(&mut buf, configuration);
    buf
}

pub fn stop_stream_reply() -> Vec<u8> {
    let mut buf = Vec::with_capacity(2);
    put_message_id(&mut buf, MessageId::StopStreamReply);
    buf
}

// === Client-side builders ===

pub fn connect_request(version: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    put_message_id(&mut buf, MessageId::ConnectRequest);
    wire::put_u32(&mut buf, version);
    buf
}

/// Any of the empty-body requests.
pub fn request(id: MessageId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2);
    put_message_id(&mut buf, id);
    buf
}

pub fn power_off_request(feature: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    put_message_id(&mut buf, MessageId::PowerOffRequest);
    wire::put_u16(&mut buf, feature);
    buf
}

pub fn haptic_tick_request(feature: u16, duration_ms: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    put_message_id(&mut buf, MessageId::HapticTickRequest);
    wire::put_u16(&mut buf, feature);
    wire::put_u16(&mut buf, duration_ms);
    buf
}
