//! Byte layouts of the commands written to the command characteristic and of the status
//! characteristic. Multi-byte fields are little endian; every command starts with
//! `[opcode, 0xA5]`.

use crate::device::constants::{
    FRAME_MARKER, MAX_CHUNK_BYTES, OPCODE_CHUNK_COMMIT, OPCODE_CHUNK_WRITE, OPCODE_CLEAR, OPCODE_RGB,
};
use crate::device::types::{RgbCommandParams, StatusError, StatusSnapshot};
use crate::error::DeviceError;

pub const CHUNK_HEADER_LEN: usize = 6;

pub fn build_clear_command() -> Vec<u8> {
    vec![OPCODE_CLEAR, FRAME_MARKER]
}

pub fn build_rgb_command(params: &RgbCommandParams) -> Vec<u8> {
    let mut buf = Vec::with_capacity(13);
    buf.extend_from_slice(&[OPCODE_RGB, FRAME_MARKER]);
    buf.extend_from_slice(&[params.red, params.green, params.blue]);
    buf.extend_from_slice(&params.on_ms.to_le_bytes());
    buf.extend_from_slice(&params.off_ms.to_le_bytes());
    buf.extend_from_slice(&params.work_ms.to_le_bytes());
    buf
}

pub fn build_chunk_write(offset: u32, chunk: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN + chunk.len());
    buf.extend_from_slice(&[OPCODE_CHUNK_WRITE, FRAME_MARKER]);
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(chunk);
    buf
}

pub fn build_chunk_commit(total: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN);
    buf.extend_from_slice(&[OPCODE_CHUNK_COMMIT, FRAME_MARKER]);
    buf.extend_from_slice(&total.to_le_bytes());
    buf
}

/// Frames are addressed with 32 bit offsets and committed with a 32 bit size.
pub fn check_frame_size(len: usize) -> Result<u32, DeviceError> {
    u32::try_from(len).map_err(|_| DeviceError::FrameTooLarge { size: len })
}

pub fn check_chunk_size(chunk_bytes: usize) -> Result<(), DeviceError> {
    if chunk_bytes == 0 || chunk_bytes > MAX_CHUNK_BYTES {
        return Err(DeviceError::InvalidChunkSize { size: chunk_bytes, max: MAX_CHUNK_BYTES });
    }
    Ok(())
}

/// Splits `data` into chunk-write commands at increasing offsets, followed by exactly one
/// chunk-commit carrying the total size.
pub fn transfer_messages(data: &[u8], chunk_bytes: usize) -> Result<Vec<Vec<u8>>, DeviceError> {
    check_chunk_size(chunk_bytes)?;
    let total = check_frame_size(data.len())?;

    let mut messages: Vec<Vec<u8>> = data
        .chunks(chunk_bytes)
        .enumerate()
        .map(|(index, chunk)| build_chunk_write((index * chunk_bytes) as u32, chunk))
        .collect();
    messages.push(build_chunk_commit(total));

    Ok(messages)
}

/// Decodes the status characteristic. Devices that return fewer than two bytes are treated as
/// idle and error free.
pub fn decode_status(bytes: &[u8]) -> StatusSnapshot {
    if bytes.len() < 2 {
        return StatusSnapshot::default();
    }

    let error_byte = bytes[1];
    let errors = StatusError::ALL
        .iter()
        .copied()
        .filter(|error| error_byte & error.bit() != 0)
        .collect();

    StatusSnapshot {
        busy: bytes[0] & 0x01 == 1,
        error_byte,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u16(buf: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([buf[at], buf[at + 1]])
    }

    fn read_u32(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    }

    #[test]
    fn test_clear_command() {
        assert_eq!(build_clear_command(), vec![0x04, 0xA5]);
    }

    #[test]
    fn test_rgb_command() {
        let params = RgbCommandParams::clamped(300, 128, -5, 500, 250, 10_000);
        let buf = build_rgb_command(&params);

        assert_eq!(buf.len(), 13);
        assert_eq!(&buf[..2], &[0x08, 0xA5]);
        assert_eq!(&buf[2..5], &[255, 128, 0]);
        assert_eq!(read_u16(&buf, 5), 500);
        assert_eq!(read_u16(&buf, 7), 250);
        assert_eq!(read_u32(&buf, 9), 10_000);
    }

    #[test]
    fn test_chunk_headers() {
        let chunk = [0xAB; 3];
        let buf = build_chunk_write(0x0102_0304, &chunk);
        assert_eq!(buf, vec![0x00, 0xA5, 0x04, 0x03, 0x02, 0x01, 0xAB, 0xAB, 0xAB]);

        let buf = build_chunk_commit(30_000);
        assert_eq!(&buf[..2], &[0x01, 0xA5]);
        assert_eq!(read_u32(&buf, 2), 30_000);
    }

    #[test]
    fn test_transfer_of_full_frame() {
        let data: Vec<u8> = (0..30_000u32).map(|i| (i % 251) as u8).collect();
        let messages = transfer_messages(&data, 200).unwrap();

        assert_eq!(messages.len(), 151);

        let mut reassembled = Vec::new();
        for (index, message) in messages[..150].iter().enumerate() {
            assert_eq!(&message[..2], &[0x00, 0xA5]);
            assert_eq!(read_u32(message, 2), (index * 200) as u32);
            assert_eq!(message.len(), CHUNK_HEADER_LEN + 200);
            reassembled.extend_from_slice(&message[CHUNK_HEADER_LEN..]);
        }
        assert_eq!(reassembled, data);

        let commit = &messages[150];
        assert_eq!(&commit[..2], &[0x01, 0xA5]);
        assert_eq!(read_u32(commit, 2), 30_000);
    }

    #[test]
    fn test_transfer_with_short_last_chunk() {
        let messages = transfer_messages(&[7; 450], 200).unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(read_u32(&messages[2], 2), 400);
        assert_eq!(messages[2].len(), CHUNK_HEADER_LEN + 50);
        assert_eq!(read_u32(&messages[3], 2), 450);
    }

    #[test]
    fn test_transfer_rejects_bad_chunk_size() {
        assert!(matches!(transfer_messages(&[0; 10], 0), Err(DeviceError::InvalidChunkSize { .. })));
        assert!(matches!(transfer_messages(&[0; 10], 507), Err(DeviceError::InvalidChunkSize { .. })));
    }

    #[test]
    fn test_frame_too_large() {
        assert_eq!(check_frame_size(4736).unwrap(), 4736);
        let too_large = u32::MAX as usize + 1;
        assert!(matches!(check_frame_size(too_large), Err(DeviceError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_decode_status() {
        let status = decode_status(&[0b0000_0011, 0b0000_0010]);
        assert!(status.busy);
        assert_eq!(status.errors, vec![StatusError::EpdWrite]);

        let status = decode_status(&[0x00, 0b0010_1101]);
        assert!(!status.busy);
        assert_eq!(
            status.errors,
            vec![StatusError::EpdInit, StatusError::Decompression, StatusError::Ota, StatusError::UnlockFailed]
        );
    }

    #[test]
    fn test_decode_short_status() {
        assert_eq!(decode_status(&[0x01]), StatusSnapshot::default());
        assert_eq!(decode_status(&[]), StatusSnapshot::default());
    }
}
