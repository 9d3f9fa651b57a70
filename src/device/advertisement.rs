use std::collections::HashMap;

use crate::device::constants::{BATTERY_MAX, PAIRING_MODE_FLAG, POSITION_MAX};
use crate::device::types::Telemetry;

/// Manufacturer payload for `company_id`, if the advertisement carries one.
///
/// Company identifiers are plain integers here, so `0x0409`, `0x409` and `1033` are the same key.
pub fn manufacturer_payload(manufacturer_data: &HashMap<u16, Vec<u8>>, company_id: u16) -> Option<&[u8]> {
    manufacturer_data.get(&company_id).map(Vec::as_slice)
}

pub fn is_pairing_mode(raw: &[u8]) -> bool {
    match raw.first() {
        Some(flags) => flags & PAIRING_MODE_FLAG != 0,
        None => false,
    }
}

/// Decodes the `[flags, position, battery, ...]` layout. Bytes out of the 0-100 range are
/// dropped, as are fields the payload is too short to carry.
pub fn parse_payload(raw: &[u8]) -> Telemetry {
    Telemetry {
        position: raw.get(1).copied().filter(|p| *p <= POSITION_MAX),
        battery: raw.get(2).copied().filter(|b| *b <= BATTERY_MAX),
    }
}

pub fn parse_telemetry(manufacturer_data: &HashMap<u16, Vec<u8>>, company_id: u16) -> Telemetry {
    match manufacturer_payload(manufacturer_data, company_id) {
        Some(raw) => parse_payload(raw),
        None => Telemetry::default(),
    }
}
