//! Physical module descriptors
//!
//! Every binary-protocol connection starts with a module info query. Each
//! answer entry describes one sub-unit (tool head, enclosure, purifier, ...)
//! and carries the `key` used to address it in later commands.

use super::HeadType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Hardware type codes of extruder heads
pub const PRINTING_HEAD_IDS: &[u16] = &[0, 13];
/// Hardware type codes of laser heads
pub const LASER_HEAD_IDS: &[u16] = &[2, 14, 19, 20];
/// Hardware type codes of spindle heads
pub const CNC_HEAD_IDS: &[u16] = &[1, 15];
/// Hardware type codes of rotary modules
pub const ROTARY_MODULE_IDS: &[u16] = &[5];
/// Hardware type codes of emergency stop buttons
pub const EMERGENCY_STOP_IDS: &[u16] = &[8];
/// Hardware type codes of enclosures
pub const ENCLOSURE_IDS: &[u16] = &[16];
/// Hardware type codes of air purifiers
pub const AIR_PURIFIER_IDS: &[u16] = &[7];

/// Logical classification of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    /// Extruder tool head
    PrintingHead,
    /// Laser tool head
    LaserHead,
    /// Spindle tool head
    CncHead,
    /// Rotary axis module
    Rotary,
    /// Emergency stop button
    EmergencyStop,
    /// Enclosure with light and fan
    Enclosure,
    /// Air purifier
    AirPurifier,
    /// Anything else (heated bed, linear modules, ...)
    Other,
}

impl ModuleKind {
    /// Classify a hardware type code by membership in the known ID sets
    pub fn from_module_id(module_id: u16) -> Self {
        if PRINTING_HEAD_IDS.contains(&module_id) {
            Self::PrintingHead
        } else if LASER_HEAD_IDS.contains(&module_id) {
            Self::LaserHead
        } else if CNC_HEAD_IDS.contains(&module_id) {
            Self::CncHead
        } else if ROTARY_MODULE_IDS.contains(&module_id) {
            Self::Rotary
        } else if EMERGENCY_STOP_IDS.contains(&module_id) {
            Self::EmergencyStop
        } else if ENCLOSURE_IDS.contains(&module_id) {
            Self::Enclosure
        } else if AIR_PURIFIER_IDS.contains(&module_id) {
            Self::AirPurifier
        } else {
            Self::Other
        }
    }

    /// Head type this module represents, if it is a tool head
    pub fn head_type(&self) -> Option<HeadType> {
        match self {
            Self::PrintingHead => Some(HeadType::Printing),
            Self::LaserHead => Some(HeadType::Laser),
            Self::CncHead => Some(HeadType::Cnc),
            _ => None,
        }
    }
}

/// One discovered module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Addressing token for later calls to this module
    pub key: u8,
    /// Hardware type code
    pub module_id: u16,
    /// Disambiguates duplicate types (dual extruders)
    pub module_index: u8,
    /// Module state byte as reported by the firmware
    pub module_state: u8,
    /// Module serial number
    pub serial_number: u32,
    /// Hardware revision
    pub hardware_version: u8,
    /// Module firmware version string
    pub firmware_version: String,
}

impl ModuleInfo {
    /// Classification of this module
    pub fn kind(&self) -> ModuleKind {
        ModuleKind::from_module_id(self.module_id)
    }
}

/// Module descriptors of one connection, rebuilt on every open
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleTable {
    modules: Vec<ModuleInfo>,
}

impl ModuleTable {
    /// Build a table from a module info answer
    pub fn new(modules: Vec<ModuleInfo>) -> Self {
        Self { modules }
    }

    /// All modules in discovery order
    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    /// True when nothing was discovered
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// First module of the given kind
    pub fn find(&self, kind: ModuleKind) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.kind() == kind)
    }

    /// Module of the given kind at a specific index
    pub fn find_indexed(&self, kind: ModuleKind, index: u8) -> Option<&ModuleInfo> {
        self.modules
            .iter()
            .find(|m| m.kind() == kind && m.module_index == index)
    }

    /// True when a module of the given kind is present
    pub fn has(&self, kind: ModuleKind) -> bool {
        self.find(kind).is_some()
    }

    /// Type of the mounted tool head
    pub fn head_type(&self) -> HeadType {
        self.modules
            .iter()
            .find_map(|m| m.kind().head_type())
            .unwrap_or_default()
    }

    /// The mounted tool head module
    pub fn head(&self) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.kind().head_type().is_some())
    }

    /// Count of modules per kind, mostly for logging
    pub fn summary(&self) -> HashMap<ModuleKind, usize> {
        let mut counts = HashMap::new();
        for module in &self.modules {
            *counts.entry(module.kind()).or_insert(0) += 1;
        }
        counts
    }

    /// Remove all entries
    pub fn clear(&mut self) {
        self.modules.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(key: u8, module_id: u16, module_index: u8) -> ModuleInfo {
        ModuleInfo {
            key,
            module_id,
            module_index,
            module_state: 0,
            serial_number: 0,
            hardware_version: 0,
            firmware_version: String::new(),
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(ModuleKind::from_module_id(14), ModuleKind::LaserHead);
        assert_eq!(ModuleKind::from_module_id(1), ModuleKind::CncHead);
        assert_eq!(ModuleKind::from_module_id(16), ModuleKind::Enclosure);
        assert_eq!(ModuleKind::from_module_id(7), ModuleKind::AirPurifier);
        assert_eq!(ModuleKind::from_module_id(999), ModuleKind::Other);
    }

    #[test]
    fn test_table_lookup() {
        let table = ModuleTable::new(vec![
            module(1, 13, 0),
            module(2, 13, 1),
            module(3, 16, 0),
        ]);

        assert_eq!(table.head_type(), HeadType::Printing);
        assert_eq!(
            table.find_indexed(ModuleKind::PrintingHead, 1).map(|m| m.key),
            Some(2)
        );
        assert!(table.has(ModuleKind::Enclosure));
        assert!(!table.has(ModuleKind::AirPurifier));
        assert_eq!(table.summary().get(&ModuleKind::PrintingHead), Some(&2));
    }

    #[test]
    fn test_empty_table_has_unknown_head() {
        let table = ModuleTable::default();
        assert!(table.is_empty());
        assert_eq!(table.head_type(), HeadType::Unknown);
        assert!(table.head().is_none());
    }
}
