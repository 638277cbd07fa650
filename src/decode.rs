//! Register word decoding
//!
//! Pure functions from raw 16-bit words to typed values and to a full
//! [`Telemetry`] snapshot.

use crate::error::{Result, SinapsiError};
use crate::registers::{Quantity, RegisterDefinition, RegisterType};
use crate::telemetry::{CutoffNotice, EnergyReadings, PowerReadings, TariffBands, Telemetry};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Event epochs above this value mean "no cutoff announced"
pub const NO_CUTOFF_THRESHOLD: u64 = 4_294_967_294;

/// Word order of 32-bit values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WordOrder {
    /// High-order word first
    #[default]
    HiLo,
    /// Low-order word first
    LoHi,
}

impl std::fmt::Display for WordOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WordOrder::HiLo => write!(f, "hiLo"),
            WordOrder::LoHi => write!(f, "loHi"),
        }
    }
}

/// Combine two consecutive words (in wire order) into a 32-bit value
pub fn decode_u32(word0: u16, word1: u16, order: WordOrder) -> u32 {
    match order {
        WordOrder::HiLo => (u32::from(word0) << 16) | u32::from(word1),
        WordOrder::LoHi => (u32::from(word1) << 16) | u32::from(word0),
    }
}

/// Whether an event-epoch register value means no cutoff is pending
pub fn is_no_cutoff_warning(event_epoch: u32) -> bool {
    u64::from(event_epoch) > NO_CUTOFF_THRESHOLD
}

/// Render seconds since the Unix epoch as an ISO-8601 UTC timestamp
pub fn epoch_to_iso(epoch_seconds: u64) -> Option<String> {
    let secs = i64::try_from(epoch_seconds).ok()?;
    DateTime::<Utc>::from_timestamp(secs, 0).map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl CutoffNotice {
    /// Interpret the two cutoff registers
    pub fn from_registers(event_epoch: u32, remaining_seconds: u16) -> Self {
        if is_no_cutoff_warning(event_epoch) {
            return Self {
                has_warning: false,
                event_epoch,
                remaining_seconds,
                at_epoch: None,
                at_iso: None,
            };
        }

        let at = u64::from(event_epoch) + u64::from(remaining_seconds);
        Self {
            has_warning: true,
            event_epoch,
            remaining_seconds,
            at_epoch: Some(at),
            at_iso: epoch_to_iso(at),
        }
    }

    /// Notice used when the map carries no cutoff registers
    pub fn none() -> Self {
        Self::from_registers(u32::MAX, 0)
    }
}

/// Words keyed by 0-based address, filled by one read pass
pub type WordTable = HashMap<u16, u16>;

/// Decoded register values keyed by quantity
pub type DecodedValues = HashMap<Quantity, u32>;

/// Decode one definition from the word table
pub fn decode_register(def: &RegisterDefinition, words: &WordTable, order: WordOrder) -> Result<u32> {
    let word = |offset: u16| {
        let address = def.address.checked_add(offset).ok_or_else(|| {
            SinapsiError::decode(format!("register {} overflows the address space", def.name))
        })?;
        words.get(&address).copied().ok_or_else(|| {
            SinapsiError::decode(format!(
                "missing word {} for register {}",
                address, def.name
            ))
        })
    };

    match def.kind {
        RegisterType::Uint16 => Ok(u32::from(word(0)?)),
        RegisterType::Uint32 => Ok(decode_u32(word(0)?, word(1)?, order)),
    }
}

/// Decode every definition of a register set
pub fn decode_all(
    registers: &[RegisterDefinition],
    words: &WordTable,
    order: WordOrder,
) -> Result<DecodedValues> {
    registers
        .iter()
        .map(|def| decode_register(def, words, order).map(|v| (def.quantity, v)))
        .collect()
}

/// Assemble a telemetry snapshot from decoded values
pub fn build_telemetry(values: &DecodedValues, order: WordOrder, now: DateTime<Utc>) -> Telemetry {
    let get = |q: Quantity| values.get(&q).copied().unwrap_or(0);
    let bands = |f: fn(u8) -> Quantity| {
        let mut out = [0u32; 6];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = get(f(i as u8));
        }
        TariffBands(out)
    };

    let cutoff = match values.get(&Quantity::CutoffEventEpoch) {
        Some(&epoch) => {
            let remaining = u16::try_from(get(Quantity::CutoffRemainingSeconds)).unwrap_or(u16::MAX);
            CutoffNotice::from_registers(epoch, remaining)
        }
        None => CutoffNotice::none(),
    };

    Telemetry {
        timestamp: now,
        power: PowerReadings {
            import_w: get(Quantity::PowerImportW),
            export_w: get(Quantity::PowerExportW),
            production_w: get(Quantity::PowerProductionW),
            import_quarter_avg_w: get(Quantity::PowerImportQuarterAvgW),
            export_quarter_avg_w: get(Quantity::PowerExportQuarterAvgW),
        },
        energy: EnergyReadings {
            import_total_wh: get(Quantity::EnergyImportTotalWh),
            export_total_wh: get(Quantity::EnergyExportTotalWh),
            production_total_wh: get(Quantity::EnergyProductionTotalWh),
            import_yesterday_wh: bands(Quantity::EnergyImportYesterdayWh),
            export_yesterday_wh: bands(Quantity::EnergyExportYesterdayWh),
        },
        tariff_band: u16::try_from(get(Quantity::CurrentTariffBand)).unwrap_or(u16::MAX),
        cutoff,
        word_order: order,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegisterMap;

    #[test]
    fn decode_u32_respects_word_order() {
        assert_eq!(decode_u32(0x0001, 0x0002, WordOrder::HiLo), 65_538);
        assert_eq!(decode_u32(0x0001, 0x0002, WordOrder::LoHi), 131_073);
        assert_eq!(decode_u32(0xFFFF, 0xFFFF, WordOrder::HiLo), u32::MAX);
        for (hi, lo) in [(0u16, 0u16), (1, 0), (0, 1), (0x1234, 0xABCD), (0xFFFF, 0)] {
            assert_eq!(
                decode_u32(hi, lo, WordOrder::HiLo),
                u32::from(hi) * 65_536 + u32::from(lo)
            );
            assert_eq!(
                decode_u32(hi, lo, WordOrder::LoHi),
                u32::from(lo) * 65_536 + u32::from(hi)
            );
        }
    }

    #[test]
    fn cutoff_sentinel_means_no_warning() {
        let notice = CutoffNotice::from_registers(4_294_967_295, 120);
        assert!(!notice.has_warning);
        assert_eq!(notice.at_epoch, None);
        assert_eq!(notice.at_iso, None);
    }

    #[test]
    fn cutoff_warning_computes_absolute_time() {
        let notice = CutoffNotice::from_registers(100, 30);
        assert!(notice.has_warning);
        assert_eq!(notice.at_epoch, Some(130));
        assert_eq!(notice.at_iso.as_deref(), Some("1970-01-01T00:02:10.000Z"));

        // The value just below the sentinel is still a live warning
        assert!(CutoffNotice::from_registers(4_294_967_294, 0).has_warning);
    }

    #[test]
    fn decode_register_reports_missing_words() {
        let map = RegisterMap::default();
        let def = map.find(Quantity::EnergyImportTotalWh).unwrap();
        let mut words = WordTable::new();
        words.insert(5, 1);
        let err = decode_register(def, &words, WordOrder::HiLo).unwrap_err();
        assert!(err.to_string().contains("missing word 6"));

        words.insert(6, 2);
        assert_eq!(decode_register(def, &words, WordOrder::HiLo).unwrap(), 65_538);
    }

    #[test]
    fn build_telemetry_maps_quantities() {
        let mut values = DecodedValues::new();
        values.insert(Quantity::PowerImportW, 1500);
        values.insert(Quantity::PowerExportW, 20);
        values.insert(Quantity::EnergyImportYesterdayWh(2), 333);
        values.insert(Quantity::CurrentTariffBand, 3);
        values.insert(Quantity::CutoffEventEpoch, u32::MAX);

        let now = Utc::now();
        let t = build_telemetry(&values, WordOrder::LoHi, now);
        assert_eq!(t.timestamp, now);
        assert_eq!(t.power.import_w, 1500);
        assert_eq!(t.power.export_w, 20);
        assert_eq!(t.energy.import_yesterday_wh.0[2], 333);
        assert_eq!(t.tariff_band, 3);
        assert!(!t.cutoff.has_warning);
        assert_eq!(t.word_order, WordOrder::LoHi);
    }

    #[test]
    fn build_telemetry_without_cutoff_registers_has_no_warning() {
        let t = build_telemetry(&DecodedValues::new(), WordOrder::HiLo, Utc::now());
        assert!(!t.cutoff.has_warning);
    }
}
