//! Marlin response parser
//!
//! Parses the lines a text firmware sends: `ok` acknowledgements (which may
//! carry a temperature report), errors, `M114` positions, `M105`
//! temperatures, and the identification lines answered to `M1005`/`M1006`.

use fablink_core::{HeadType, MachineSeries, Position};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Temperature report of one `M105` answer
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TemperatureReport {
    /// Nozzle current and target in °C
    pub nozzle: Option<(f64, f64)>,
    /// Bed current and target in °C
    pub bed: Option<(f64, f64)>,
}

/// One parsed line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarlinResponse {
    /// Command acknowledged
    Ok,
    /// Command failed
    Error(String),
    /// Position report
    Position(Position),
    /// Temperature report
    Temperature(TemperatureReport),
    /// Firmware version
    Firmware(String),
    /// Machine size letter mapped to a series
    MachineSize(MachineSeries),
    /// Mounted tool head
    ToolHead(HeadType),
    /// `echo:` diagnostics
    Echo(String),
    /// Firmware (re)started
    Start,
    /// Anything else
    Message(String),
}

impl fmt::Display for MarlinResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error(msg) => write!(f, "error:{}", msg),
            Self::Position(p) => write!(f, "pos:{}", p),
            Self::Temperature(_) => write!(f, "temperature"),
            Self::Firmware(v) => write!(f, "firmware:{}", v),
            Self::MachineSize(s) => write!(f, "size:{}", s),
            Self::ToolHead(h) => write!(f, "head:{}", h),
            Self::Echo(msg) => write!(f, "echo:{}", msg),
            Self::Start => write!(f, "start"),
            Self::Message(msg) => write!(f, "message:{}", msg),
        }
    }
}

/// Stateless line parser
#[derive(Debug, Clone, Copy, Default)]
pub struct MarlinParser;

impl MarlinParser {
    /// Create a parser
    pub fn new() -> Self {
        Self
    }

    /// Parse one line; an `ok` carrying temperatures yields both
    pub fn parse(&self, line: &str) -> Vec<MarlinResponse> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }

        if line == "ok" {
            return vec![MarlinResponse::Ok];
        }
        if let Some(rest) = line.strip_prefix("ok ") {
            let mut out = Vec::with_capacity(2);
            if let Some(report) = parse_temperature(rest) {
                out.push(MarlinResponse::Temperature(report));
            }
            out.push(MarlinResponse::Ok);
            return out;
        }

        let lower = line.to_ascii_lowercase();
        if lower.starts_with("error:") {
            return vec![MarlinResponse::Error(line[6..].trim().to_string())];
        }
        if let Some(rest) = line.strip_prefix("echo:") {
            return vec![MarlinResponse::Echo(rest.trim().to_string())];
        }
        if line == "start" {
            return vec![MarlinResponse::Start];
        }
        if let Some(rest) = strip_label(line, "Firmware Version:") {
            return vec![MarlinResponse::Firmware(rest.to_string())];
        }
        if let Some(rest) = strip_label(line, "Machine Size:") {
            return vec![MarlinResponse::MachineSize(MachineSeries::from_name(rest))];
        }
        if let Some(rest) = strip_label(line, "Tool Head:") {
            return vec![MarlinResponse::ToolHead(HeadType::from_name(&head_alias(rest)))];
        }
        if line.starts_with("X:") {
            if let Some(position) = parse_position(line) {
                return vec![MarlinResponse::Position(position)];
            }
        }
        if line.starts_with("T:") {
            if let Some(report) = parse_temperature(line) {
                return vec![MarlinResponse::Temperature(report)];
            }
        }

        vec![MarlinResponse::Message(line.to_string())]
    }
}

fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    line.strip_prefix(label).map(str::trim)
}

fn head_alias(name: &str) -> String {
    match name.trim().to_ascii_uppercase().as_str() {
        "3DP" | "3D" => "printing".to_string(),
        other => other.to_string(),
    }
}

/// Parse `X:1.00 Y:2.00 Z:3.00 E:0.00 Count X:...`
///
/// Only the part before `Count` is read; it holds the logical position.
pub fn parse_position(line: &str) -> Option<Position> {
    let logical = line.split(" Count").next().unwrap_or(line);
    let mut position = Position::default();
    let mut seen = 0;
    for token in logical.split_whitespace() {
        let Some((axis, value)) = token.split_once(':') else {
            continue;
        };
        let Ok(value) = value.parse::<f64>() else {
            continue;
        };
        match axis {
            "X" => position.x = value,
            "Y" => position.y = value,
            "Z" => position.z = value,
            "B" => position.b = value,
            _ => continue,
        }
        seen += 1;
    }
    (seen >= 3).then_some(position)
}

/// Parse `T:25.0 /0.0 B:24.0 /0.0 @:0 B@:0`
pub fn parse_temperature(text: &str) -> Option<TemperatureReport> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut report = TemperatureReport::default();
    for (i, token) in tokens.iter().enumerate() {
        let Some((label, value)) = token.split_once(':') else {
            continue;
        };
        let slot = match label {
            "T" | "T0" => &mut report.nozzle,
            "B" => &mut report.bed,
            _ => continue,
        };
        let Ok(current) = value.parse::<f64>() else {
            continue;
        };
        let target = tokens
            .get(i + 1)
            .and_then(|t| t.strip_prefix('/'))
            .and_then(|t| t.parse::<f64>().ok())
            .unwrap_or(0.0);
        if slot.is_none() {
            *slot = Some((current, target));
        }
    }
    (report.nozzle.is_some() || report.bed.is_some()).then_some(report)
}
