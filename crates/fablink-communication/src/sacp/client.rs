//! Typed SACP requests
//!
//! `SacpClient` turns the machine's command set into async methods over a
//! [`Dispatcher`]. Module-addressed commands take the module key found in
//! the module table.

use super::buffer::PayloadWriter;
use super::commands::{bed, cnc, enclosure, laser, nozzle, print, purifier, system};
use super::dispatcher::{Dispatcher, SubscriptionId};
use super::packet::{CommandTag, Packet};
use super::telemetry::{CoordinateInfo, MachineInfo, ModuleList, NetworkInfo, Telemetry};
use super::transfer::{self, FileTransfer, TransferProgress};
use fablink_core::{Axis, ModuleInfo, Result};
use std::time::Duration;

/// Identity sent in the session handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Host name of this computer.
    pub hostname: String,
    /// Application name shown on the machine screen.
    pub client_name: String,
    /// Token from a previous session, empty on first contact.
    pub token: String,
}

impl Default for HandshakeInfo {
    fn default() -> Self {
        Self {
            hostname: "fablink-host".to_string(),
            client_name: "FabLink".to_string(),
            token: String::new(),
        }
    }
}

/// Async request surface over a dispatcher
#[derive(Debug, Clone)]
pub struct SacpClient {
    dispatcher: Dispatcher,
}

impl SacpClient {
    /// Wrap a running dispatcher
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Underlying dispatcher
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    async fn call(&self, tag: CommandTag, payload: Vec<u8>) -> Result<Vec<u8>> {
        self.dispatcher.request(tag, payload).await
    }

    async fn query<T: Telemetry>(&self, payload: Vec<u8>) -> Result<T> {
        let body = self.call(T::TAG, payload).await?;
        Ok(T::decode(&body)?)
    }

    /// Session handshake, required before anything else over TCP
    pub async fn handshake(&self, info: &HandshakeInfo) -> Result<()> {
        let payload = PayloadWriter::new()
            .string(&info.hostname)
            .string(&info.client_name)
            .string(&info.token)
            .finish();
        self.call(system::HANDSHAKE, payload).await.map(|_| ())
    }

    /// Tell the machine the session ends; waits at most `timeout`
    pub async fn disconnect(&self, timeout: Duration) -> Result<()> {
        let ack = self
            .dispatcher
            .send_with_timeout(
                system::DISCONNECT,
                self.dispatcher.config().default_peer,
                Vec::new(),
                Some(timeout),
            )
            .await?;
        super::dispatcher::check_result(&ack)
    }

    /// Machine identity
    pub async fn get_machine_info(&self) -> Result<MachineInfo> {
        self.query(Vec::new()).await
    }

    /// Attached modules
    pub async fn get_module_info(&self) -> Result<Vec<ModuleInfo>> {
        let list: ModuleList = self.query(Vec::new()).await?;
        Ok(list.0)
    }

    /// Homing state and positions
    pub async fn get_coordinate_info(&self) -> Result<CoordinateInfo> {
        self.query(Vec::new()).await
    }

    /// Run G-code on the controller; returns its text output
    pub async fn execute_gcode(&self, gcode: &str) -> Result<String> {
        let body = self
            .call(system::EXECUTE_GCODE, PayloadWriter::new().string(gcode).finish())
            .await?;
        if body.is_empty() {
            return Ok(String::new());
        }
        Ok(super::buffer::PayloadReader::new(&body).string()?)
    }

    /// Write the machine log to external storage
    pub async fn export_log(&self) -> Result<()> {
        self.call(system::EXPORT_LOG, Vec::new()).await.map(|_| ())
    }

    /// Current Wi-Fi settings
    pub async fn get_network_config(&self) -> Result<NetworkInfo> {
        self.query(Vec::new()).await
    }

    /// Join a Wi-Fi network
    pub async fn set_network_config(&self, ssid: &str, password: &str) -> Result<()> {
        let payload = PayloadWriter::new().string(ssid).string(password).finish();
        self.call(system::SET_NETWORK, payload).await.map(|_| ())
    }

    /// Make the current position the work origin on the given axes
    ///
    /// Each entry is an axis and the value the current position should read.
    pub async fn set_work_origin(&self, axes: &[(Axis, f64)]) -> Result<()> {
        let mut w = PayloadWriter::new().u8(axes.len() as u8);
        for (axis, value) in axes {
            w = w.u8(axis.code()).milli(*value);
        }
        self.call(system::SET_WORK_ORIGIN, w.finish()).await.map(|_| ())
    }

    /// Linear move of the given axes at `feed_rate` mm/min
    pub async fn move_to(&self, axes: &[(Axis, f64)], feed_rate: u16) -> Result<()> {
        let mut w = PayloadWriter::new().u16(feed_rate).u8(axes.len() as u8);
        for (axis, value) in axes {
            w = w.u8(axis.code()).milli(*value);
        }
        self.call(system::MOVE, w.finish()).await.map(|_| ())
    }

    /// Home all axes
    pub async fn home(&self) -> Result<()> {
        self.call(system::HOME, Vec::new()).await.map(|_| ())
    }

    /// Target temperature of one extruder
    pub async fn set_nozzle_temperature(&self, key: u8, extruder: u8, celsius: u16) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).u8(extruder).u16(celsius).finish();
        self.call(nozzle::SET_TEMPERATURE, payload).await.map(|_| ())
    }

    /// Target temperature of one bed zone
    pub async fn set_bed_temperature(&self, key: u8, zone: u8, celsius: u16) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).u8(zone).u16(celsius).finish();
        self.call(bed::SET_TEMPERATURE, payload).await.map(|_| ())
    }

    /// Laser output in percent
    pub async fn set_laser_power(&self, key: u8, percent: f64) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).milli(percent).finish();
        self.call(laser::SET_POWER, payload).await.map(|_| ())
    }

    /// Toggle the laser crosshair
    pub async fn set_crosshair(&self, key: u8, on: bool) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).bool(on).finish();
        self.call(laser::CROSSHAIR, payload).await.map(|_| ())
    }

    /// Fire sensor sensitivity
    pub async fn set_fire_sensor_sensitivity(&self, key: u8, value: u16) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).u16(value).finish();
        self.call(laser::FIRE_SENSOR_SENSITIVITY, payload)
            .await
            .map(|_| ())
    }

    /// Spindle speed in RPM
    pub async fn set_spindle_speed(&self, key: u8, rpm: u32) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).u32(rpm).finish();
        self.call(cnc::SET_SPEED, payload).await.map(|_| ())
    }

    /// Turn the spindle on or off
    pub async fn switch_spindle(&self, key: u8, on: bool) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).bool(on).finish();
        self.call(cnc::SWITCH, payload).await.map(|_| ())
    }

    /// Enclosure light intensity in percent
    pub async fn set_enclosure_light(&self, key: u8, intensity: u8) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).u8(intensity).finish();
        self.call(enclosure::SET_LIGHT, payload).await.map(|_| ())
    }

    /// Enclosure fan speed in percent
    pub async fn set_enclosure_fan(&self, key: u8, speed: u8) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).u8(speed).finish();
        self.call(enclosure::SET_FAN, payload).await.map(|_| ())
    }

    /// Enable or disable the door sensor
    pub async fn set_door_detection(&self, key: u8, enabled: bool) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).bool(enabled).finish();
        self.call(enclosure::DOOR_DETECTION, payload)
            .await
            .map(|_| ())
    }

    /// Turn the air purifier on or off
    pub async fn switch_purifier(&self, key: u8, on: bool) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).bool(on).finish();
        self.call(purifier::SWITCH, payload).await.map(|_| ())
    }

    /// Air purifier fan level
    pub async fn set_purifier_speed(&self, key: u8, level: u8) -> Result<()> {
        let payload = PayloadWriter::new().u8(key).u8(level).finish();
        self.call(purifier::SET_FAN_SPEED, payload).await.map(|_| ())
    }

    /// Start a job, either stored on the machine or streamed by the host
    pub async fn start_print(&self, filename: &str, source: u8, total_lines: u32) -> Result<()> {
        let payload = PayloadWriter::new()
            .string(filename)
            .u8(source)
            .u32(total_lines)
            .finish();
        self.call(print::START, payload).await.map(|_| ())
    }

    /// Pause the running job
    pub async fn pause_print(&self) -> Result<()> {
        self.call(print::PAUSE, Vec::new()).await.map(|_| ())
    }

    /// Resume a paused job
    pub async fn resume_print(&self) -> Result<()> {
        self.call(print::RESUME, Vec::new()).await.map(|_| ())
    }

    /// Stop the job
    pub async fn stop_print(&self) -> Result<()> {
        self.call(print::STOP, Vec::new()).await.map(|_| ())
    }

    /// Push a file to the machine's storage
    pub async fn upload<F>(&self, transfer: FileTransfer, on_progress: F) -> Result<()>
    where
        F: Fn(TransferProgress) + Send + Sync + 'static,
    {
        transfer::upload(&self.dispatcher, transfer, on_progress).await
    }

    /// Subscribe to a telemetry type, decoding each push
    ///
    /// Pushes that fail to decode are logged and skipped.
    pub async fn subscribe<T, F>(&self, interval_ms: u16, callback: F) -> Result<SubscriptionId>
    where
        T: Telemetry + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.dispatcher
            .subscribe(T::TAG, interval_ms, move |packet: &Packet| {
                match T::from_packet(packet) {
                    Ok(value) => callback(value),
                    Err(e) => tracing::debug!("Skipping push on {}: {}", T::TAG, e),
                }
            })
            .await
    }
}
