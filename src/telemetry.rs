//! Telemetry data model
//!
//! A [`Telemetry`] value is built fresh from every successful read cycle and
//! never mutated afterwards. Field names serialise in camelCase.

mod reader;

pub use reader::{ReadMode, TelemetryReader};

use crate::decode::WordOrder;
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// One decoded snapshot of the meter
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    #[serde(rename = "ts", with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub power: PowerReadings,
    pub energy: EnergyReadings,
    pub tariff_band: u16,
    pub cutoff: CutoffNotice,
    pub word_order: WordOrder,
}

/// Instantaneous power in watts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerReadings {
    #[serde(rename = "importW")]
    pub import_w: u32,
    #[serde(rename = "exportW")]
    pub export_w: u32,
    #[serde(rename = "productionW")]
    pub production_w: u32,
    #[serde(rename = "importQuarterAvgW")]
    pub import_quarter_avg_w: u32,
    #[serde(rename = "exportQuarterAvgW")]
    pub export_quarter_avg_w: u32,
}

/// Energy counters in watt-hours
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyReadings {
    #[serde(rename = "importTotalWh")]
    pub import_total_wh: u32,
    #[serde(rename = "exportTotalWh")]
    pub export_total_wh: u32,
    #[serde(rename = "productionTotalWh")]
    pub production_total_wh: u32,
    #[serde(rename = "importYesterdayWh")]
    pub import_yesterday_wh: TariffBands,
    #[serde(rename = "exportYesterdayWh")]
    pub export_yesterday_wh: TariffBands,
}

/// Per tariff band values, F1 at index 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TariffBands(pub [u32; 6]);

impl Serialize for TariffBands {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (i, value) in self.0.iter().enumerate() {
            map.serialize_entry(&format!("F{}", i + 1), value)?;
        }
        map.end()
    }
}

/// Supply cutoff announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CutoffNotice {
    pub has_warning: bool,
    pub event_epoch: u32,
    pub remaining_seconds: u16,
    pub at_epoch: Option<u64>,
    pub at_iso: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodedValues, build_telemetry};
    use crate::registers::Quantity;

    #[test]
    fn telemetry_serialises_camel_case_with_band_keys() {
        let mut values = DecodedValues::new();
        values.insert(Quantity::PowerImportW, 1234);
        values.insert(Quantity::EnergyExportYesterdayWh(5), 9);
        values.insert(Quantity::CutoffEventEpoch, 100);
        values.insert(Quantity::CutoffRemainingSeconds, 30);
        let telemetry = build_telemetry(&values, WordOrder::HiLo, DateTime::<Utc>::UNIX_EPOCH);

        let json = serde_json::to_value(&telemetry).unwrap();
        assert_eq!(json["ts"], 0);
        assert_eq!(json["power"]["importW"], 1234);
        assert_eq!(json["energy"]["exportYesterdayWh"]["F6"], 9);
        assert_eq!(json["energy"]["importYesterdayWh"]["F1"], 0);
        assert!(json["energy"]["exportYesterdayWh"].get("f6").is_none());
        assert_eq!(json["cutoff"]["hasWarning"], true);
        assert_eq!(json["cutoff"]["atEpoch"], 130);
        assert_eq!(json["wordOrder"], "hiLo");
    }
}
