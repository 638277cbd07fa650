#![no_main]
use libfuzzer_sys::fuzz_target;
use sinapsi::decode::{WordOrder, WordTable, build_telemetry, decode_all};
use sinapsi::registers::DEFAULT_REGISTERS;

fuzz_target!(|data: &[u8]| {
    // Big-endian word pairs, laid out from address 0 and wrapped over the map
    let mut words = WordTable::new();
    for (i, b) in data.chunks_exact(2).enumerate() {
        let address = (i % 1024) as u16;
        words.insert(address, u16::from_be_bytes([b[0], b[1]]));
    }

    for order in [WordOrder::HiLo, WordOrder::LoHi] {
        if let Ok(values) = decode_all(&DEFAULT_REGISTERS, &words, order) {
            let telemetry = build_telemetry(&values, order, chrono::Utc::now());
            assert_eq!(telemetry.cutoff.has_warning, telemetry.cutoff.at_epoch.is_some());
        }
    }
});
