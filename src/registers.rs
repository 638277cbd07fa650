//! Register map of the Sinapsi Alfa meter
//!
//! Addresses are 0-based holding-register word offsets (function code 3).
//! The default map and the default read groups are part of the external
//! contract: moving an address or a group boundary is a breaking change.

use crate::error::{Result, SinapsiError};
use serde::{Deserialize, Serialize};

/// Width of a register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Uint16,
    Uint32,
}

impl RegisterType {
    /// Number of 16-bit words the value occupies
    pub const fn word_count(self) -> u16 {
        match self {
            RegisterType::Uint16 => 1,
            RegisterType::Uint32 => 2,
        }
    }
}

/// Logical quantity a register carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Quantity {
    PowerImportW,
    EnergyImportTotalWh,
    PowerImportQuarterAvgW,
    PowerExportW,
    EnergyExportTotalWh,
    PowerExportQuarterAvgW,
    /// Yesterday's imported energy for tariff band F1..F6 (index 0..5)
    EnergyImportYesterdayWh(u8),
    /// Yesterday's exported energy for tariff band F1..F6 (index 0..5)
    EnergyExportYesterdayWh(u8),
    CurrentTariffBand,
    CutoffEventEpoch,
    CutoffRemainingSeconds,
    PowerProductionW,
    EnergyProductionTotalWh,
}

/// One register of the map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegisterDefinition {
    pub name: &'static str,
    pub quantity: Quantity,
    pub address: u16,
    #[serde(rename = "type")]
    pub kind: RegisterType,
}

impl RegisterDefinition {
    pub(crate) const fn new(name: &'static str, quantity: Quantity, address: u16, kind: RegisterType) -> Self {
        Self {
            name,
            quantity,
            address,
            kind,
        }
    }

    /// Exclusive end of the word span
    pub const fn end(&self) -> u32 {
        self.address as u32 + self.kind.word_count() as u32
    }
}

/// A contiguous span read in a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadGroup {
    pub start: u16,
    pub count: u16,
}

impl ReadGroup {
    pub const fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    pub const fn end(&self) -> u32 {
        self.start as u32 + self.count as u32
    }

    fn covers(&self, def: &RegisterDefinition) -> bool {
        def.address as u32 >= self.start as u32 && def.end() <= self.end()
    }
}

use Quantity::*;
use RegisterType::{Uint16, Uint32};

/// Default register table
pub const DEFAULT_REGISTERS: [RegisterDefinition; 23] = [
    RegisterDefinition::new("powerImportW", PowerImportW, 2, Uint16),
    RegisterDefinition::new("energyImportTotalWh", EnergyImportTotalWh, 5, Uint32),
    RegisterDefinition::new("powerImportQuarterAvgW", PowerImportQuarterAvgW, 9, Uint16),
    RegisterDefinition::new("powerExportW", PowerExportW, 12, Uint16),
    RegisterDefinition::new("energyExportTotalWh", EnergyExportTotalWh, 15, Uint32),
    RegisterDefinition::new("powerExportQuarterAvgW", PowerExportQuarterAvgW, 19, Uint16),
    RegisterDefinition::new("energyImportYesterdayF1Wh", EnergyImportYesterdayWh(0), 30, Uint32),
    RegisterDefinition::new("energyImportYesterdayF2Wh", EnergyImportYesterdayWh(1), 32, Uint32),
    RegisterDefinition::new("energyImportYesterdayF3Wh", EnergyImportYesterdayWh(2), 34, Uint32),
    RegisterDefinition::new("energyImportYesterdayF4Wh", EnergyImportYesterdayWh(3), 36, Uint32),
    RegisterDefinition::new("energyImportYesterdayF5Wh", EnergyImportYesterdayWh(4), 38, Uint32),
    RegisterDefinition::new("energyImportYesterdayF6Wh", EnergyImportYesterdayWh(5), 40, Uint32),
    RegisterDefinition::new("energyExportYesterdayF1Wh", EnergyExportYesterdayWh(0), 54, Uint32),
    RegisterDefinition::new("energyExportYesterdayF2Wh", EnergyExportYesterdayWh(1), 56, Uint32),
    RegisterDefinition::new("energyExportYesterdayF3Wh", EnergyExportYesterdayWh(2), 58, Uint32),
    RegisterDefinition::new("energyExportYesterdayF4Wh", EnergyExportYesterdayWh(3), 60, Uint32),
    RegisterDefinition::new("energyExportYesterdayF5Wh", EnergyExportYesterdayWh(4), 62, Uint32),
    RegisterDefinition::new("energyExportYesterdayF6Wh", EnergyExportYesterdayWh(5), 64, Uint32),
    RegisterDefinition::new("currentTariffBand", CurrentTariffBand, 203, Uint16),
    RegisterDefinition::new("cutoffEventEpoch", CutoffEventEpoch, 780, Uint32),
    RegisterDefinition::new("cutoffRemainingSeconds", CutoffRemainingSeconds, 782, Uint16),
    RegisterDefinition::new("powerProductionW", PowerProductionW, 921, Uint16),
    RegisterDefinition::new("energyProductionTotalWh", EnergyProductionTotalWh, 924, Uint32),
];

/// Default read groups
pub const DEFAULT_READ_GROUPS: [ReadGroup; 5] = [
    ReadGroup::new(2, 18),   // 2..19
    ReadGroup::new(30, 36),  // 30..65
    ReadGroup::new(203, 1),  // 203
    ReadGroup::new(780, 3),  // 780..782
    ReadGroup::new(921, 6),  // 921..926
];

/// Register table plus the grouping used for batched reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    registers: Vec<RegisterDefinition>,
    groups: Vec<ReadGroup>,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            registers: DEFAULT_REGISTERS.to_vec(),
            groups: DEFAULT_READ_GROUPS.to_vec(),
        }
    }
}

impl RegisterMap {
    /// Build a custom map; every register must be covered by exactly one group
    pub fn new(registers: Vec<RegisterDefinition>, groups: Vec<ReadGroup>) -> Result<Self> {
        let map = Self { registers, groups };
        map.validate()?;
        Ok(map)
    }

    pub fn registers(&self) -> &[RegisterDefinition] {
        &self.registers
    }

    pub fn groups(&self) -> &[ReadGroup] {
        &self.groups
    }

    /// Skips the coverage check so tests can build broken maps
    #[cfg(test)]
    pub(crate) fn unchecked(registers: Vec<RegisterDefinition>, groups: Vec<ReadGroup>) -> Self {
        Self { registers, groups }
    }

    /// Definition carrying a given quantity
    pub fn find(&self, quantity: Quantity) -> Option<&RegisterDefinition> {
        self.registers.iter().find(|d| d.quantity == quantity)
    }

    /// Check the grouping invariant
    pub fn validate(&self) -> Result<()> {
        for group in &self.groups {
            if group.count == 0 || group.end() > u32::from(u16::MAX) + 1 {
                return Err(SinapsiError::validation(
                    "registers.groups",
                    format!("invalid group {}+{}", group.start, group.count),
                ));
            }
        }

        for def in &self.registers {
            let covering = self.groups.iter().filter(|g| g.covers(def)).count();
            if covering != 1 {
                return Err(SinapsiError::validation(
                    "registers.groups",
                    format!(
                        "register {} at {} is covered by {} groups",
                        def.name, def.address, covering
                    ),
                ));
            }
        }
        Ok(())
    }
}
