use uuid::Uuid;

use crate::device::types::ServiceDescriptor;

/**
 * How often (milliseconds) to poll the adapter for newly sighted peripherals
 * while a scan is running.
 */
pub const SCAN_POLL_DELAY: u64 = 1000;

/**
 * How often (milliseconds) to check whether an established link is still up.
 */
pub const LINK_POLL_DELAY: u64 = 500;

/**
 * How long (milliseconds) establishing the transport-level link may take.
 */
pub const CONNECT_DEADLINE: u64 = 10_000;

/**
 * Capacity of the decoded sample channel of a monitor session.
 */
pub const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/**
 * Capacity of the protocol error channel of a monitor session.
 */
pub const ERROR_CHANNEL_CAPACITY: usize = 16;

/**
 * The UUID of the Bluetooth SIG Heart Rate service.
 */
pub const HEART_RATE_SERVICE: &str = "0000180d-0000-1000-8000-00805f9b34fb";

/**
 * The UUID of the Heart Rate Measurement GATT characteristic within that
 * service. Measurements are delivered as notifications on it.
 */
pub const HEART_RATE_MEASUREMENT_CHARACTERISTIC: &str = "00002a37-0000-1000-8000-00805f9b34fb";

/**
 * Bit 0 of the Heart Rate Measurement flags byte: when set, the heart rate
 * value is a little-endian UINT16 instead of a UINT8.
 */
pub const FLAG_HEART_RATE_VALUE_UINT16: u8 = 0x01;

pub fn make_heart_rate_service_uuid() -> Uuid {
    Uuid::parse_str(HEART_RATE_SERVICE).unwrap()
}

pub fn make_heart_rate_measurement_uuid() -> Uuid {
    Uuid::parse_str(HEART_RATE_MEASUREMENT_CHARACTERISTIC).unwrap()
}

pub fn heart_rate_descriptor() -> ServiceDescriptor {
    ServiceDescriptor {
        service: make_heart_rate_service_uuid(),
        characteristic: make_heart_rate_measurement_uuid(),
    }
}
