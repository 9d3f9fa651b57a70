use uuid::Uuid;

/**
 * First byte of every framed command / response packet.
 */
pub const FRAME_HEADER: u8 = 0xF5;

/**
 * Byte 2 of a framed packet. Always 0x01 for the packets we know about.
 */
pub const FRAME_CHANNEL: u8 = 0x01;

pub const OPCODE_SET_POSITION: u8 = 0x01;
pub const OPCODE_GET_POSITION: u8 = 0x03;
pub const OPCODE_POSITION_REPORT: u8 = 0x07;
pub const OPCODE_REPORT_USER_TARGET: u8 = 0x18;

/**
 * Checksums cover the packet from this offset up to (not including) the checksum byte.
 */
pub const CHECKSUM_START: usize = 2;

/**
 * Raw position sent to fully open / close the shade.
 */
pub const POSITION_OPEN: u8 = 0;
pub const POSITION_CLOSED: u8 = 100;
pub const POSITION_MAX: u8 = 100;
pub const BATTERY_MAX: u8 = 100;

/**
 * Bit in the first manufacturer-data byte that is set while the shade is in pairing mode.
 */
pub const PAIRING_MODE_FLAG: u8 = 0x40;

/**
 * Bluetooth SIG company identifier used in the shade's manufacturer data (0x0409, 1033 decimal).
 */
pub const COMPANY_ID: u16 = 0x0409;

/**
 * Local name prefix that shades advertise with.
 */
pub const DEVICE_NAME_PREFIX: &str = "RZSS";

/**
 * The UUID of the characteristic that position reports are read from / notified on.
 */
pub const RX_CHARACTERISTIC: &str = "a72f2801-b0bd-498b-b4cd-4a3901388238";

/**
 * The UUID of the characteristic that commands are written to.
 */
pub const TX_CHARACTERISTIC: &str = "a72f2802-b0bd-498b-b4cd-4a3901388238";

/**
 * Standard GATT Battery Level characteristic (Battery Service 0x180F). Holds one byte, 0-100.
 */
pub const BATTERY_LEVEL_CHARACTERISTIC: &str = "00002a19-0000-1000-8000-00805f9b34fb";

/**
 * Per attempt connect timeouts (milliseconds). Attempts beyond this list reuse the last entry.
 */
pub const CONNECT_TIMEOUTS: [u64; 3] = [5000, 10000, 15000];

/**
 * Delay (milliseconds) before each connect attempt.
 */
pub const CONNECT_BACKOFF: [u64; 3] = [0, 300, 500];

pub const MAX_CONNECT_ATTEMPTS: usize = 3;

/**
 * How long (milliseconds) to wait after the peer dropped the link before reconnecting.
 */
pub const RECONNECT_COOLDOWN: u64 = 5000;

/**
 * How long (milliseconds) a single read or write of a characteristic may take.
 */
pub const IO_DEADLINE: u64 = 2000;

/**
 * How often (seconds) to poll over GATT. Advertisements are the primary source.
 */
pub const POLL_INTERVAL: u64 = 300;

/**
 * How long (seconds) to wait for the first telemetry after startup.
 */
pub const INIT_TIMEOUT: u64 = 30;

pub fn make_rx_uuid() -> Uuid {
    Uuid::parse_str(RX_CHARACTERISTIC).unwrap()
}

pub fn make_tx_uuid() -> Uuid {
    Uuid::parse_str(TX_CHARACTERISTIC).unwrap()
}

pub fn make_battery_uuid() -> Uuid {
    Uuid::parse_str(BATTERY_LEVEL_CHARACTERISTIC).unwrap()
}
