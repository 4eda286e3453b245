//! Protocol-agnostic machine commands
//!
//! [`forward`] calls the channel's typed capability when it has one and
//! otherwise runs the G-code equivalent from [`super::gcode`].

use super::gcode;
use crate::channel::Channel;
use fablink_core::{Axis, ChannelError, Result};

/// A command the caller can issue regardless of the active protocol
#[derive(Debug, Clone, PartialEq)]
pub enum MachineCommand {
    /// Raw G-code, newline separated.
    Gcode(String),
    /// Move the given axes to absolute positions.
    Move {
        /// Target per axis.
        axes: Vec<(Axis, f64)>,
        /// Feed rate in mm/min; 0 uses the firmware default.
        feed_rate: u16,
    },
    /// Home all axes.
    Home,
    /// Declare the current position to be these work coordinates.
    SetWorkOrigin(Vec<(Axis, f64)>),
    /// Set the laser focus height before a job.
    LaserWorkHeight(f64),
    /// Extruder target in °C.
    NozzleTemperature {
        /// Extruder index.
        extruder: u8,
        /// Target.
        celsius: u16,
    },
    /// Bed target in °C.
    BedTemperature {
        /// Zone index.
        zone: u8,
        /// Target.
        celsius: u16,
    },
    /// Laser output in percent.
    LaserPower(f64),
    /// Crosshair pointer.
    Crosshair(bool),
    /// Fire sensor sensitivity.
    FireSensorSensitivity(u16),
    /// Spindle speed in RPM.
    SpindleSpeed(u32),
    /// Spindle on or off.
    SpindleSwitch(bool),
    /// Enclosure light 0-100.
    EnclosureLight(u8),
    /// Enclosure fan 0-100.
    EnclosureFan(u8),
    /// Pause on door open.
    DoorDetection(bool),
    /// Purifier on or off.
    PurifierSwitch(bool),
    /// Purifier fan level.
    PurifierSpeed(u8),
    /// Pause the running job.
    PausePrint,
    /// Resume a paused job.
    ResumePrint,
    /// Abort the running job.
    StopPrint,
    /// Write the machine log to external storage.
    ExportLog,
}

impl MachineCommand {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gcode(_) => "gcode",
            Self::Move { .. } => "move",
            Self::Home => "home",
            Self::SetWorkOrigin(_) => "set work origin",
            Self::LaserWorkHeight(_) => "laser work height",
            Self::NozzleTemperature { .. } => "nozzle temperature",
            Self::BedTemperature { .. } => "bed temperature",
            Self::LaserPower(_) => "laser power",
            Self::Crosshair(_) => "crosshair",
            Self::FireSensorSensitivity(_) => "fire sensor sensitivity",
            Self::SpindleSpeed(_) => "spindle speed",
            Self::SpindleSwitch(_) => "spindle switch",
            Self::EnclosureLight(_) => "enclosure light",
            Self::EnclosureFan(_) => "enclosure fan",
            Self::DoorDetection(_) => "door detection",
            Self::PurifierSwitch(_) => "purifier switch",
            Self::PurifierSpeed(_) => "purifier speed",
            Self::PausePrint => "pause print",
            Self::ResumePrint => "resume print",
            Self::StopPrint => "stop print",
            Self::ExportLog => "export log",
        }
    }

    /// G-code equivalent, if the command has one
    pub fn to_gcode(&self) -> Option<String> {
        let text = match self {
            Self::Gcode(text) => text.clone(),
            Self::Move { axes, feed_rate } => gcode::move_to(axes, *feed_rate),
            Self::Home => gcode::home(),
            Self::SetWorkOrigin(axes) => gcode::set_work_origin(axes),
            Self::LaserWorkHeight(height) => gcode::laser_work_height(*height),
            Self::NozzleTemperature { extruder, celsius } => {
                gcode::nozzle_temperature(*extruder, *celsius)
            }
            Self::BedTemperature { celsius, .. } => gcode::bed_temperature(*celsius),
            Self::LaserPower(percent) => gcode::laser_power(*percent),
            Self::SpindleSpeed(rpm) => gcode::spindle_speed(*rpm),
            Self::SpindleSwitch(on) => gcode::spindle_switch(*on),
            Self::EnclosureLight(intensity) => gcode::enclosure_light(*intensity),
            Self::EnclosureFan(speed) => gcode::enclosure_fan(*speed),
            Self::DoorDetection(enabled) => gcode::door_detection(*enabled),
            Self::PurifierSwitch(on) => gcode::purifier_switch(*on),
            Self::PurifierSpeed(level) => gcode::purifier_speed(*level),
            Self::Crosshair(_)
            | Self::FireSensorSensitivity(_)
            | Self::PausePrint
            | Self::ResumePrint
            | Self::StopPrint
            | Self::ExportLog => return None,
        };
        Some(text)
    }
}

/// Run `command` on `channel`, natively when possible
///
/// Returns the firmware output when the command went out as G-code, an
/// empty string otherwise.
pub async fn forward(channel: &Channel, command: &MachineCommand) -> Result<String> {
    if let Some(done) = native(channel, command).await {
        return done.map(|()| String::new());
    }
    let unsupported = || ChannelError::unsupported(command.name(), channel.protocol());
    let text = command.to_gcode().ok_or_else(unsupported)?;
    let gcode = channel.gcode().ok_or_else(unsupported)?;
    tracing::debug!("{} as G-code over {}: {:?}", command.name(), channel.protocol(), text);
    gcode.execute_gcode(&text).await
}

/// The typed call for `command`, or `None` when the channel lacks it
async fn native(channel: &Channel, command: &MachineCommand) -> Option<Result<()>> {
    use MachineCommand as C;
    let result = match command {
        C::Gcode(_) => return None,
        C::Move { axes, feed_rate } => channel.motion()?.move_to(axes, *feed_rate).await,
        C::Home => channel.motion()?.home().await,
        C::SetWorkOrigin(axes) => channel.motion()?.set_work_origin(axes).await,
        C::LaserWorkHeight(height) => {
            channel
                .motion()?
                .set_work_origin(&[(Axis::Z, *height)])
                .await
        }
        C::NozzleTemperature { extruder, celsius } => {
            channel
                .temperature()?
                .set_nozzle_temperature(*extruder, *celsius)
                .await
        }
        C::BedTemperature { zone, celsius } => {
            channel
                .temperature()?
                .set_bed_temperature(*zone, *celsius)
                .await
        }
        C::LaserPower(percent) => channel.laser()?.set_laser_power(*percent).await,
        C::Crosshair(on) => channel.laser()?.set_crosshair(*on).await,
        C::FireSensorSensitivity(value) => {
            channel.laser()?.set_fire_sensor_sensitivity(*value).await
        }
        C::SpindleSpeed(rpm) => channel.cnc()?.set_spindle_speed(*rpm).await,
        C::SpindleSwitch(on) => channel.cnc()?.switch_spindle(*on).await,
        C::EnclosureLight(intensity) => {
            channel.enclosure()?.set_enclosure_light(*intensity).await
        }
        C::EnclosureFan(speed) => channel.enclosure()?.set_enclosure_fan(*speed).await,
        C::DoorDetection(enabled) => channel.enclosure()?.set_door_detection(*enabled).await,
        C::PurifierSwitch(on) => channel.air_purifier()?.switch_purifier(*on).await,
        C::PurifierSpeed(level) => channel.air_purifier()?.set_purifier_speed(*level).await,
        C::PausePrint => channel.print_job()?.pause_print().await,
        C::ResumePrint => channel.print_job()?.resume_print().await,
        C::StopPrint => channel.print_job()?.stop_print().await,
        C::ExportLog => channel.system()?.export_log().await,
    };
    Some(result)
}
