//! Little-endian primitives and record codecs
//!
//! Record layouts:
//!
//! ```text
//! layout           trackers:u32  buttons:u32  valuators:u32
//! virtual device   name:str  tracker_first:u16 num_trackers:u16
//!                  button_first:u16 num_buttons:u16
//!                  valuator_first:u16 num_valuators:u16
//! tracker state    position:3xf32  orientation:4xf32
//!                  linear_velocity:3xf32  angular_velocity:3xf32
//! tracker packet   timestamp_us:u64  states  buttons:u8 each  valuators:f32 each
//! battery state    charging:u8  percent:u8
//! hmd config       tracker_index:u16  width:u32 height:u32  ipd:f32
//!                  2 x (offset:3xf32  fov:4xf32), left eye first
//! ```
//!
//! Strings are u16-length-prefixed UTF-8. Packet layout never varies with
//! the protocol version; the counts come from the layout record exchanged
//! in the handshake.

use crate::devices::types::{
    BatteryState, DeviceLayout, EyeGeometry, HmdConfiguration, TrackerPacket, TrackerState,
    VirtualDevice,
};
use crate::error::{Error, Result};

pub const TRACKER_STATE_SIZE: usize = 13 * 4;

// === Primitive writers ===

pub fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_f32(buf: &mut Vec<u8>, value: f32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// u16 length prefix then the UTF-8 bytes, truncated at 65535.
pub fn put_str(buf: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    put_u16(buf, len as u16);
    buf.extend_from_slice(&bytes[..len]);
}

// === Cursor reader ===

/// Consuming cursor over a received byte slice. Every accessor fails with
/// [`Error::TruncatedMessage`] instead of panicking when the slice runs out.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(Error::TruncatedMessage {
                needed: count,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn f32(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| Error::Protocol(format!("string is not UTF-8: {err}")))
    }

    fn f32x3(&mut self) -> Result<[f32; 3]> {
        Ok([self.f32()?, self.f32()?, self.f32()?])
    }

    fn f32x4(&mut self) -> Result<[f32; 4]> {
        Ok([self.f32()?, self.f32()?, self.f32()?, self.f32()?])
    }
}

// === Record codecs ===

pub fn put_layout(buf: &mut Vec<u8>, layout: &DeviceLayout) {
    put_u32(buf, layout.trackers as u32);
    put_u32(buf, layout.buttons as u32);
    put_u32(buf, layout.valuators as u32);
}

pub fn get_layout(reader: &mut WireReader) -> Result<DeviceLayout> {
    Ok(DeviceLayout {
        trackers: reader.u32()? as usize,
        buttons: reader.u32()? as usize,
        valuators: reader.u32()? as usize,
    })
}

pub fn put_virtual_device(buf: &mut Vec<u8>, device: &VirtualDevice) {
    put_str(buf, &device.name);
    put_u16(buf, device.tracker_first as u16);
    put_u16(buf, device.num_trackers as u16);
    put_u16(buf, device.button_first as u16);
    put_u16(buf, device.num_buttons as u16);
    put_u16(buf, device.valuator_first as u16);
    put_u16(buf, device.num_valuators as u16);
}

pub fn get_virtual_device(reader: &mut WireReader) -> Result<VirtualDevice> {
    Ok(VirtualDevice {
        name: reader.string()?,
        tracker_first: reader.u16()? as usize,
        num_trackers: reader.u16()? as usize,
        button_first: reader.u16()? as usize,
        num_buttons: reader.u16()? as usize,
        valuator_first: reader.u16()? as usize,
        num_valuators: reader.u16()? as usize,
    })
}

pub fn put_tracker_state(buf: &mut Vec<u8>, state: &TrackerState) {
    for &c in &state.position {
        put_f32(buf, c);
    }
    for &c in &state.orientation {
        put_f32(buf, c);
    }
    for &c in &state.linear_velocity {
        put_f32(buf, c);
    }
    for &c in &state.angular_velocity {
        put_f32(buf, c);
    }
}

pub fn get_tracker_state(reader: &mut WireReader) -> Result<TrackerState> {
    Ok(TrackerState {
        position: reader.f32x3()?,
        orientation: reader.f32x4()?,
        linear_velocity: reader.f32x3()?,
        angular_velocity: reader.f32x3()?,
    })
}

pub fn put_tracker_packet(buf: &mut Vec<u8>, packet: &TrackerPacket) {
    put_u64(buf, packet.timestamp_us);
    for state in &packet.trackers {
        put_tracker_state(buf, state);
    }
    for &pressed in &packet.buttons {
        put_u8(buf, pressed as u8);
    }
    for &value in &packet.valuators {
        put_f32(buf, value);
    }
}

/// The packet carries no counts of its own; the layout from the handshake
/// supplies them.
pub fn get_tracker_packet(reader: &mut WireReader, layout: &DeviceLayout) -> Result<TrackerPacket> {
    let timestamp_us = reader.u64()?;
    let mut trackers = Vec::with_capacity(layout.trackers);
    for _ in 0..layout.trackers {
        trackers.push(get_tracker_state(reader)?);
    }
    let mut buttons = Vec::with_capacity(layout.buttons);
    for _ in 0..layout.buttons {
        buttons.push(reader.u8()? != 0);
    }
    let mut valuators = Vec::with_capacity(layout.valuators);
    for _ in 0..layout.valuators {
        valuators.push(reader.f32()?);
    }
    Ok(TrackerPacket {
        timestamp_us,
        trackers,
        buttons,
        valuators,
    })
}

pub fn put_battery_state(buf: &mut Vec<u8>, state: &BatteryState) {
    put_u8(buf, state.charging as u8);
    put_u8(buf, state.percent);
}

pub fn get_battery_state(reader: &mut WireReader) -> Result<BatteryState> {
    Ok(BatteryState {
        charging: reader.u8()? != 0,
        percent: reader.u8()?,
    })
}

pub fn put_hmd_configuration(buf: &mut Vec<u8>, hmd: &HmdConfiguration) {
    put_u16(buf, hmd.tracker_index);
    put_u32(buf, hmd.resolution[0]);
    put_u32(buf, hmd.resolution[1]);
    put_f32(buf, hmd.ipd);
    for eye in &hmd.eyes {
        for &c in &eye.offset {
            put_f32(buf, c);
        }
        for &c in &eye.fov {
            put_f32(buf, c);
        }
    }
}

pub fn get_hmd_configuration(reader: &mut WireReader) -> Result<HmdConfiguration> {
    let tracker_index = reader.u16()?;
    let resolution = [reader.u32()?, reader.u32()?];
    let ipd = reader.f32()?;
    let mut eyes = [EyeGeometry::default(); 2];
    for eye in &mut eyes {
        eye.offset = reader.f32x3()?;
        eye.fov = reader.f32x4()?;
    }
    Ok(HmdConfiguration {
        tracker_index,
        resolution,
        ipd,
        eyes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_are_little_endian() {
        let mut buf = Vec::new();
        put_u16(&mut buf, 0x1234);
        put_u32(&mut buf, 0xdeadbeef);
        assert_eq!(buf, [0x34, 0x12, 0xef, 0xbe, 0xad, 0xde]);

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.u16().unwrap(), 0x1234);
        assert_eq!(reader.u32().unwrap(), 0xdeadbeef);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_truncated_read_reports_sizes() {
        let buf = [1u8, 2, 3];
        let mut reader = WireReader::new(&buf);
        reader.u16().unwrap();
        let err = reader.u32().unwrap_err();
        match err {
            Error::TruncatedMessage { needed, available } => {
                assert_eq!(needed, 4);
                assert_eq!(available, 1);
            }
            other => panic!("expected TruncatedMessage, got {other:?}"),
        }
    }

    #[test]
    fn test_string_prefix_and_round_trip() {
        let mut buf = Vec::new();
        put_str(&mut buf, "Head");
        assert_eq!(&buf[..2], [4, 0], "length prefix is a little-endian u16");
        assert_eq!(&buf[2..], b"Head");

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.string().unwrap(), "Head");
    }

    #[test]
    fn test_tracker_state_is_13_floats() {
        let state = TrackerState {
            position: [1.0, 2.0, 3.0],
            orientation: [0.0, 0.0, 0.0, 1.0],
            linear_velocity: [0.1, 0.2, 0.3],
            angular_velocity: [4.0, 5.0, 6.0],
        };
        let mut buf = Vec::new();
        put_tracker_state(&mut buf, &state);
        assert_eq!(buf.len(), TRACKER_STATE_SIZE);
        // Orientation w sits after position (12 bytes) plus x y z (12 bytes).
        assert_eq!(&buf[24..28], 1.0f32.to_le_bytes());

        let mut reader = WireReader::new(&buf);
        assert_eq!(get_tracker_state(&mut reader).unwrap(), state);
    }

    #[test]
    fn test_packet_size_follows_layout() {
        let layout = DeviceLayout {
            trackers: 2,
            buttons: 5,
            valuators: 3,
        };
        let mut packet = TrackerPacket::for_layout(&layout);
        packet.timestamp_us = 77;
        packet.buttons[4] = true;
        packet.valuators[0] = -0.5;

        let mut buf = Vec::new();
        put_tracker_packet(&mut buf, &packet);
        assert_eq!(buf.len(), 8 + 2 * TRACKER_STATE_SIZE + 5 + 3 * 4);

        let mut reader = WireReader::new(&buf);
        let decoded = get_tracker_packet(&mut reader, &layout).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_hmd_record_layout() {
        let hmd = HmdConfiguration::for_tracker(2);
        let mut buf = Vec::new();
        put_hmd_configuration(&mut buf, &hmd);
        // 2 + 8 + 4 + 2 eyes x (12 + 16)
        assert_eq!(buf.len(), 70);
        assert_eq!(&buf[..2], [2, 0]);

        let mut reader = WireReader::new(&buf);
        assert_eq!(get_hmd_configuration(&mut reader).unwrap(), hmd);
    }

    #[test]
    fn test_virtual_device_round_trip() {
        let device = VirtualDevice {
            name: "Controller Left".to_string(),
            tracker_first: 1,
            num_trackers: 1,
            button_first: 0,
            num_buttons: 6,
            valuator_first: 0,
            num_valuators: 3,
        };
        let mut buf = Vec::new();
        put_virtual_device(&mut buf, &device);

        let mut reader = WireReader::new(&buf);
        assert_eq!(get_virtual_device(&mut reader).unwrap(), device);
        assert_eq!(reader.remaining(), 0);
    }
}
