use uuid::Uuid;

/**
 * How long (milliseconds) to scan for the target peripheral before giving up.
 */
pub const SCAN_TIMEOUT: u64 = 30_000;

/**
 * How long (milliseconds) to wait after writing the handshake response before sending commands.
 */
pub const UNLOCK_SETTLE_DELAY: u64 = 100;

/**
 * Delay (milliseconds) between chunk writes, so the peripheral can drain its buffer.
 */
pub const INTER_CHUNK_DELAY: u64 = 4;

/**
 * Default number of frame bytes carried by a single chunk-write command.
 */
pub const CHUNK_BYTES: usize = 200;

/**
 * The largest chunk payload that fits an ATT write (512 bytes) next to the 6 byte chunk header.
 */
pub const MAX_CHUNK_BYTES: usize = 506;

/**
 * Total time (milliseconds) spent polling the status characteristic after a command.
 */
pub const STATUS_POLL_TIMEOUT: u64 = 500;

/**
 * Delay (milliseconds) between status characteristic reads.
 */
pub const STATUS_POLL_INTERVAL: u64 = 100;

/**
 * Pre-shared AES-128 key used to answer the unlock challenge. It is the same for every device of
 * this hardware family and must be reproduced exactly for the devices to accept a session.
 */
pub const SECURITY_KEY: [u8; 16] = [
    0x9b, 0x60, 0x9f, 0x28, 0xbc, 0x49, 0xe2, 0x57,
    0x29, 0xbd, 0x7b, 0x8d, 0xf2, 0x2b, 0x44, 0x20,
];

/**
 * Length of the unlock challenge read from the security characteristic.
 */
pub const CHALLENGE_LEN: usize = 16;

/**
 * Second framing byte present in every command.
 */
pub const FRAME_MARKER: u8 = 0xA5;

pub const OPCODE_CHUNK_WRITE: u8 = 0x00;
pub const OPCODE_CHUNK_COMMIT: u8 = 0x01;
pub const OPCODE_CLEAR: u8 = 0x04;
pub const OPCODE_RGB: u8 = 0x08;

/**
 * Generic Access and Generic Attribute; every peripheral exposes these.
 */
pub const STANDARD_SERVICES: [u16; 2] = [0x1800, 0x1801];

/**
 * Prefix of the advertised name, followed by the address digits.
 */
pub const ADVERTISED_NAME_PREFIX: &str = "ESL_";

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

pub fn make_standard_service_uuids() -> Vec<Uuid> {
    STANDARD_SERVICES.iter().map(|short| make_short_uuid(*short)).collect()
}

pub fn make_short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// True when the uuid is an expansion of a 16 or 32 bit SIG assigned number.
pub fn is_short_uuid(uuid: &Uuid) -> bool {
    let low_bits = (1u128 << 96) - 1;
    uuid.as_u128() & low_bits == BLUETOOTH_BASE_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuids() {
        let gap = make_short_uuid(0x1800);
        assert_eq!(gap.to_string(), "00001800-0000-1000-8000-00805f9b34fb");
        assert!(is_short_uuid(&gap));

        let vendor = Uuid::parse_str("13187b10-eba9-a3ba-044e-83d3217d9a38").unwrap();
        assert!(!is_short_uuid(&vendor));
    }
}
