//! Optional channel capabilities
//!
//! Not every protocol can do everything: the HTTP screen firmware has no
//! spindle RPM control, the text firmware has no file storage. Each group of
//! commands is its own trait, and [`super::Channel`] hands out
//! `Option<&dyn Trait>` so callers match on presence instead of probing.

use crate::sacp::telemetry::NetworkInfo;
use crate::sacp::transfer::TransferProgress;
use async_trait::async_trait;
use fablink_core::{Axis, GcodeMetadata, Result};
use std::sync::Arc;

/// Receives transfer progress
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// A print the caller wants to start
#[derive(Debug, Clone, PartialEq)]
pub struct PrintRequest {
    /// File name shown on the machine.
    pub filename: String,
    /// G-code text.
    pub content: String,
    /// Header information of `content`.
    pub metadata: GcodeMetadata,
}

impl PrintRequest {
    /// Build a request, reading the metadata from the G-code header
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let metadata = GcodeMetadata::from_content(&content);
        Self {
            filename: filename.into(),
            content,
            metadata,
        }
    }
}

/// Raw G-code execution
#[async_trait]
pub trait GcodeCapability: Send + Sync {
    /// Run one or more newline separated lines; returns the firmware output
    async fn execute_gcode(&self, gcode: &str) -> Result<String>;
}

/// File storage on the machine
#[async_trait]
pub trait FileTransferCapability: Send + Sync {
    /// Store `content` under `filename`
    async fn upload_file(
        &self,
        filename: &str,
        content: Vec<u8>,
        on_progress: ProgressCallback,
    ) -> Result<()>;
}

/// Firmware housekeeping
#[async_trait]
pub trait SystemCapability: Send + Sync {
    /// Controller firmware version
    async fn firmware_version(&self) -> Result<String>;

    /// Write the machine log to external storage
    async fn export_log(&self) -> Result<()>;
}

/// Wi-Fi configuration
#[async_trait]
pub trait NetworkCapability: Send + Sync {
    /// Current network settings
    async fn get_network_config(&self) -> Result<NetworkInfo>;

    /// Join a network
    async fn set_network_config(&self, ssid: &str, password: &str) -> Result<()>;
}

/// Print job control
#[async_trait]
pub trait PrintJobCapability: Send + Sync {
    /// Start printing; resolves once the machine accepted the job
    async fn start_print(&self, request: &PrintRequest) -> Result<()>;

    /// Pause the running job
    async fn pause_print(&self) -> Result<()>;

    /// Resume a paused job
    async fn resume_print(&self) -> Result<()>;

    /// Abort the job
    async fn stop_print(&self) -> Result<()>;
}

/// Native motion commands
#[async_trait]
pub trait MotionCapability: Send + Sync {
    /// Move the given axes to absolute positions
    async fn move_to(&self, axes: &[(Axis, f64)], feed_rate: u16) -> Result<()>;

    /// Home all axes
    async fn home(&self) -> Result<()>;

    /// Make the current position the work origin for the given axes
    async fn set_work_origin(&self, axes: &[(Axis, f64)]) -> Result<()>;
}

/// Native heater commands
#[async_trait]
pub trait TemperatureCapability: Send + Sync {
    /// Set an extruder target in °C
    async fn set_nozzle_temperature(&self, extruder: u8, celsius: u16) -> Result<()>;

    /// Set a bed zone target in °C
    async fn set_bed_temperature(&self, zone: u8, celsius: u16) -> Result<()>;
}

/// Spindle control
#[async_trait]
pub trait CncCapability: Send + Sync {
    /// Spindle speed in RPM
    async fn set_spindle_speed(&self, rpm: u32) -> Result<()>;

    /// Spindle on or off
    async fn switch_spindle(&self, on: bool) -> Result<()>;
}

/// Laser head control
#[async_trait]
pub trait LaserCapability: Send + Sync {
    /// Output power in percent
    async fn set_laser_power(&self, percent: f64) -> Result<()>;

    /// Crosshair pointer on or off
    async fn set_crosshair(&self, on: bool) -> Result<()>;

    /// Fire sensor sensitivity
    async fn set_fire_sensor_sensitivity(&self, value: u16) -> Result<()>;
}

/// Enclosure control
#[async_trait]
pub trait EnclosureCapability: Send + Sync {
    /// Light intensity 0-100
    async fn set_enclosure_light(&self, intensity: u8) -> Result<()>;

    /// Fan speed 0-100
    async fn set_enclosure_fan(&self, speed: u8) -> Result<()>;

    /// Pause the job when the door opens
    async fn set_door_detection(&self, enabled: bool) -> Result<()>;
}

/// Air purifier control
#[async_trait]
pub trait AirPurifierCapability: Send + Sync {
    /// Purifier on or off
    async fn switch_purifier(&self, on: bool) -> Result<()>;

    /// Fan level 1-3
    async fn set_purifier_speed(&self, level: u8) -> Result<()>;
}
