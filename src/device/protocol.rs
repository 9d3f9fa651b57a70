//! Encoding and decoding of the shade's framed command protocol.
//!
//! Outbound frames look like `F5 <len> 01 <opcode> <payload..> <checksum>` where the checksum is
//! the sum of every byte from offset 2 up to the checksum itself, modulo 256.

use crate::device::constants::{
    CHECKSUM_START, FRAME_CHANNEL, FRAME_HEADER, OPCODE_GET_POSITION, OPCODE_POSITION_REPORT,
    OPCODE_REPORT_USER_TARGET, OPCODE_SET_POSITION, POSITION_MAX,
};
use crate::error::ProtocolError;

/// What an inbound frame turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification<'a> {
    /// "Report user target" echo; carries nothing we use.
    UserTarget,
    /// Current raw position (0 = open, 100 = closed).
    Position(u8),
    /// Position report whose checksum did not match (strict decoding only).
    Rejected(&'a [u8]),
    /// Anything else, handed back untouched.
    Unclassified(&'a [u8]),
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .skip(CHECKSUM_START)
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Returns the checksum byte carried by a frame (its last byte).
pub fn frame_checksum(frame: &[u8]) -> Option<u8> {
    if frame.len() <= CHECKSUM_START {
        return None;
    }
    frame.last().copied()
}

/// True if the last byte of `frame` matches the checksum of the bytes before it.
pub fn verify_checksum(frame: &[u8]) -> bool {
    match frame_checksum(frame) {
        None => false,
        Some(expected) => checksum(&frame[..frame.len() - 1]) == expected,
    }
}

pub fn encode_set_position(position: i32) -> Result<[u8; 6], ProtocolError> {
    let position = u8::try_from(position)
        .ok()
        .filter(|p| *p <= POSITION_MAX)
        .ok_or(ProtocolError::PositionOutOfRange { position })?;

    let mut packet = [FRAME_HEADER, 0x03, FRAME_CHANNEL, OPCODE_SET_POSITION, position, 0];
    packet[5] = checksum(&packet[..5]);
    Ok(packet)
}

pub fn encode_get_position() -> [u8; 5] {
    let mut packet = [FRAME_HEADER, 0x02, FRAME_CHANNEL, OPCODE_GET_POSITION, 0];
    packet[4] = checksum(&packet[..4]);
    packet
}

/// True if `bytes` starts like a protocol frame (`F5 <len> 01 <opcode>`), whatever the opcode.
/// Such payloads never follow the `[flags, position, battery]` advertisement layout.
pub fn is_frame(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0] == FRAME_HEADER && bytes[2] == FRAME_CHANNEL
}

fn is_frame_with_opcode(bytes: &[u8], opcode: u8) -> bool {
    bytes.len() >= 5 && bytes[0] == FRAME_HEADER && bytes[2] == FRAME_CHANNEL && bytes[3] == opcode
}

pub fn is_user_target_report(bytes: &[u8]) -> bool {
    is_frame_with_opcode(bytes, OPCODE_REPORT_USER_TARGET)
}

/// Classifies a notification payload. The checksum is not looked at.
pub fn decode_notification(bytes: &[u8]) -> Notification<'_> {
    if is_user_target_report(bytes) {
        return Notification::UserTarget;
    }
    if is_frame_with_opcode(bytes, OPCODE_POSITION_REPORT) {
        return Notification::Position(bytes[4]);
    }
    Notification::Unclassified(bytes)
}

/// Like [`decode_notification`], but a position report must end in a valid checksum byte.
/// Reports that fail the check come back as [`Notification::Rejected`].
pub fn decode_notification_strict(bytes: &[u8]) -> Notification<'_> {
    match decode_notification(bytes) {
        Notification::Position(position) => {
            if bytes.len() >= 6 && verify_checksum(bytes) {
                Notification::Position(position)
            } else {
                Notification::Rejected(bytes)
            }
        },
        other => other,
    }
}

/// Host facing "percent open" for a raw wire position.
pub fn open_percentage(raw_position: u8) -> u8 {
    POSITION_MAX - raw_position.min(POSITION_MAX)
}

/// Raw wire position for a host facing "percent open".
pub fn raw_from_open_percentage(open_percentage: u8) -> Result<u8, ProtocolError> {
    if open_percentage > POSITION_MAX {
        return Err(ProtocolError::PositionOutOfRange { position: open_percentage.into() });
    }
    Ok(POSITION_MAX - open_percentage)
}
