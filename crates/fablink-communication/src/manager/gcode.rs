//! G-code equivalents of native commands
//!
//! Used when the active protocol has no typed call for an operation. Every
//! builder returns the full text handed to `execute_gcode`; multi-line
//! sequences are newline separated.

use fablink_core::Axis;

/// Format a coordinate or rate without trailing zeros
pub fn number(value: f64) -> String {
    let text = format!("{:.3}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    match text {
        "" | "-0" => "0".to_string(),
        other => other.to_string(),
    }
}

fn axis_words(axes: &[(Axis, f64)]) -> String {
    axes.iter()
        .map(|(axis, value)| format!("{}{}", axis.letter(), number(*value)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rapid move to absolute positions
pub fn move_to(axes: &[(Axis, f64)], feed_rate: u16) -> String {
    if feed_rate == 0 {
        format!("G0 {}", axis_words(axes))
    } else {
        format!("G0 {} F{}", axis_words(axes), feed_rate)
    }
}

/// Home all axes
pub fn home() -> String {
    "G28".to_string()
}

/// Declare the current position to be `axes`
pub fn set_work_origin(axes: &[(Axis, f64)]) -> String {
    format!("G92 {}", axis_words(axes))
}

/// Raise the laser to `height` in machine coordinates, then return to work coordinates
pub fn laser_work_height(height: f64) -> String {
    format!("G53;\nG0 Z{};\nG54;", number(height))
}

/// Extruder target
pub fn nozzle_temperature(extruder: u8, celsius: u16) -> String {
    format!("M104 T{} S{}", extruder, celsius)
}

/// Bed target
pub fn bed_temperature(celsius: u16) -> String {
    format!("M140 S{}", celsius)
}

/// Laser output; 0 turns the beam off
pub fn laser_power(percent: f64) -> String {
    if percent <= 0.0 {
        "M5".to_string()
    } else {
        format!("M3 P{} S{}", number(percent), number(percent * 2.55))
    }
}

/// Spindle speed; the spindle starts if it was off
pub fn spindle_speed(rpm: u32) -> String {
    format!("M3 S{}", rpm)
}

/// Spindle on or off
pub fn spindle_switch(on: bool) -> String {
    if on {
        "M3".to_string()
    } else {
        "M5".to_string()
    }
}

/// Enclosure light 0-100
pub fn enclosure_light(intensity: u8) -> String {
    format!("M1010 S3 P{}", intensity)
}

/// Enclosure fan 0-100
pub fn enclosure_fan(speed: u8) -> String {
    format!("M1010 S4 P{}", speed)
}

/// Door detection on or off
pub fn door_detection(enabled: bool) -> String {
    format!("M1010 S1 P{}", u8::from(enabled))
}

/// Purifier on or off
pub fn purifier_switch(on: bool) -> String {
    format!("M1011 S{}", u8::from(on))
}

/// Purifier fan level
pub fn purifier_speed(level: u8) -> String {
    format!("M1011 F{}", level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_trims() {
        assert_eq!(number(5.0), "5");
        assert_eq!(number(12.5), "12.5");
        assert_eq!(number(-0.0001), "0");
        assert_eq!(number(0.1234), "0.123");
    }

    #[test]
    fn test_laser_work_height() {
        assert_eq!(laser_work_height(5.0), "G53;\nG0 Z5;\nG54;");
        assert_eq!(laser_work_height(12.25), "G53;\nG0 Z12.25;\nG54;");
    }

    #[test]
    fn test_motion() {
        assert_eq!(move_to(&[(Axis::X, 10.0), (Axis::Y, 2.5)], 3000), "G0 X10 Y2.5 F3000");
        assert_eq!(move_to(&[(Axis::Z, 1.0)], 0), "G0 Z1");
        assert_eq!(set_work_origin(&[(Axis::Z, 0.0)]), "G92 Z0");
    }

    #[test]
    fn test_laser_power() {
        assert_eq!(laser_power(0.0), "M5");
        assert_eq!(laser_power(100.0), "M3 P100 S255");
    }
}
