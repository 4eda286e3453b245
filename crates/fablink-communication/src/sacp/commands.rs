//! Command tags
//!
//! Grouped by command set. Telemetry tags (`*_INFO`, `HEARTBEAT`, print
//! line number and elapsed time) are subscribable.

use super::packet::CommandTag;

/// System set
pub mod system {
    use super::CommandTag;

    pub const SUBSCRIBE: CommandTag = CommandTag::new(0x01, 0x00);
    pub const UNSUBSCRIBE: CommandTag = CommandTag::new(0x01, 0x01);
    pub const EXECUTE_GCODE: CommandTag = CommandTag::new(0x01, 0x02);
    pub const HANDSHAKE: CommandTag = CommandTag::new(0x01, 0x05);
    pub const DISCONNECT: CommandTag = CommandTag::new(0x01, 0x06);
    pub const EXPORT_LOG: CommandTag = CommandTag::new(0x01, 0x07);
    pub const MODULE_INFO: CommandTag = CommandTag::new(0x01, 0x20);
    pub const MACHINE_INFO: CommandTag = CommandTag::new(0x01, 0x21);
    pub const SET_NETWORK: CommandTag = CommandTag::new(0x01, 0x29);
    pub const GET_NETWORK: CommandTag = CommandTag::new(0x01, 0x2a);
    pub const COORDINATE_INFO: CommandTag = CommandTag::new(0x01, 0x30);
    pub const SET_WORK_ORIGIN: CommandTag = CommandTag::new(0x01, 0x32);
    pub const MOVE: CommandTag = CommandTag::new(0x01, 0x34);
    pub const HOME: CommandTag = CommandTag::new(0x01, 0x35);
    pub const HEARTBEAT: CommandTag = CommandTag::new(0x01, 0xa0);
}

/// Machine-initiated error reports
pub mod report {
    use super::CommandTag;

    pub const ERROR: CommandTag = CommandTag::new(0x04, 0x00);
}

/// Printing head
pub mod nozzle {
    use super::CommandTag;

    pub const SET_TEMPERATURE: CommandTag = CommandTag::new(0x10, 0x02);
    pub const INFO: CommandTag = CommandTag::new(0x10, 0xa0);
}

/// CNC head
pub mod cnc {
    use super::CommandTag;

    pub const SET_SPEED: CommandTag = CommandTag::new(0x11, 0x02);
    pub const SWITCH: CommandTag = CommandTag::new(0x11, 0x03);
    pub const SPEED_INFO: CommandTag = CommandTag::new(0x11, 0xa0);
}

/// Laser head
pub mod laser {
    use super::CommandTag;

    pub const SET_POWER: CommandTag = CommandTag::new(0x12, 0x02);
    pub const CROSSHAIR: CommandTag = CommandTag::new(0x12, 0x0b);
    pub const FIRE_SENSOR_SENSITIVITY: CommandTag = CommandTag::new(0x12, 0x0d);
    pub const POWER_INFO: CommandTag = CommandTag::new(0x12, 0xa0);
}

/// Heated bed
pub mod bed {
    use super::CommandTag;

    pub const SET_TEMPERATURE: CommandTag = CommandTag::new(0x14, 0x02);
    pub const INFO: CommandTag = CommandTag::new(0x14, 0xa0);
}

/// Enclosure
pub mod enclosure {
    use super::CommandTag;

    pub const SET_LIGHT: CommandTag = CommandTag::new(0x15, 0x02);
    pub const SET_FAN: CommandTag = CommandTag::new(0x15, 0x04);
    pub const DOOR_DETECTION: CommandTag = CommandTag::new(0x15, 0x05);
    pub const INFO: CommandTag = CommandTag::new(0x15, 0xa0);
}

/// Air purifier
pub mod purifier {
    use super::CommandTag;

    pub const SWITCH: CommandTag = CommandTag::new(0x17, 0x01);
    pub const SET_FAN_SPEED: CommandTag = CommandTag::new(0x17, 0x02);
    pub const INFO: CommandTag = CommandTag::new(0x17, 0xa0);
}

/// Print jobs
pub mod print {
    use super::CommandTag;

    pub const START: CommandTag = CommandTag::new(0xac, 0x00);
    pub const REQUEST_GCODE: CommandTag = CommandTag::new(0xac, 0x01);
    pub const PAUSE: CommandTag = CommandTag::new(0xac, 0x03);
    pub const RESUME: CommandTag = CommandTag::new(0xac, 0x04);
    pub const STOP: CommandTag = CommandTag::new(0xac, 0x06);
    pub const LINE_NUMBER: CommandTag = CommandTag::new(0xac, 0xa0);
    pub const ELAPSED_TIME: CommandTag = CommandTag::new(0xac, 0xa5);

    /// Start payload source: file already on the machine
    pub const SOURCE_STORED: u8 = 0;
    /// Start payload source: host streams lines on request
    pub const SOURCE_STREAM: u8 = 1;
}

/// File transfer
pub mod file {
    use super::CommandTag;

    pub const START: CommandTag = CommandTag::new(0xb0, 0x00);
    pub const PULL_CHUNK: CommandTag = CommandTag::new(0xb0, 0x01);
    pub const COMPLETE: CommandTag = CommandTag::new(0xb0, 0x02);
    pub const START_COMPRESSED: CommandTag = CommandTag::new(0xb0, 0x10);
    pub const PULL_COMPRESSED_CHUNK: CommandTag = CommandTag::new(0xb0, 0x11);

    /// Chunk reply result when the index is past the end
    pub const RESULT_EOF: u8 = 1;
    /// Chunk reply result when the checksum names another file
    pub const RESULT_UNKNOWN_FILE: u8 = 2;
}

/// Ack result for success
pub const RESULT_OK: u8 = 0;
