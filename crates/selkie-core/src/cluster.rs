//! Cluster wire envelope
//!
//! The only wire format the runtime itself defines:
//! `[u16 LE payload_len][payload: payload_len bytes][header: rest]`.
//! Transport of the envelope is a service concern, not a runtime one.
//!
//! `pack` uses the buffer's front headroom for the length prefix, so a
//! payload is framed without moving its bytes; `unpack` slices payload and
//! trailing header apart in place via `offset_writepos`.

use crate::buffer::Buffer;
use crate::constants::CLUSTER_PAYLOAD_BYTES_MAX;
use crate::error::{Error, Result};

/// Frame `buf` in place: prepend the payload length, append the header
pub fn pack(header: &[u8], buf: &mut Buffer) -> Result<()> {
    let payload_len = buf.len();
    if payload_len > CLUSTER_PAYLOAD_BYTES_MAX {
        return Err(Error::ClusterPayloadTooLarge {
            size: payload_len,
            limit: CLUSTER_PAYLOAD_BYTES_MAX,
        });
    }
    buf.write_front(&(payload_len as u16).to_le_bytes());
    buf.write_back(header);
    Ok(())
}

/// Split a packed envelope in place
///
/// Returns the header bytes; `buf` is left holding exactly the payload.
pub fn unpack(buf: &mut Buffer) -> Result<Vec<u8>> {
    if buf.len() < 2 {
        return Err(Error::ClusterTruncated { size: buf.len() });
    }
    let prefix = buf.read(0, 2)?;
    let payload_len = u16::from_le_bytes([prefix[0], prefix[1]]) as usize;
    buf.consume(2)?;
    if payload_len > buf.len() {
        return Err(Error::ClusterTruncated { size: buf.len() });
    }
    let header = buf.read(payload_len, buf.len() - payload_len)?.to_vec();
    buf.offset_writepos(-(header.len() as isize))?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut buf = Buffer::from("payload bytes");
        pack(b"node-7", &mut buf).unwrap();
        let header = unpack(&mut buf).unwrap();
        assert_eq!(header, b"node-7");
        assert_eq!(buf.data(), b"payload bytes");
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let mut buf = Buffer::new();
        pack(b"h", &mut buf).unwrap();
        let header = unpack(&mut buf).unwrap();
        assert_eq!(header, b"h");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_roundtrip_empty_header() {
        let mut buf = Buffer::from("p");
        pack(b"", &mut buf).unwrap();
        let header = unpack(&mut buf).unwrap();
        assert!(header.is_empty());
        assert_eq!(buf.data(), b"p");
    }

    #[test]
    fn test_pack_rejects_oversized_payload() {
        let mut buf = Buffer::from(vec![0u8; CLUSTER_PAYLOAD_BYTES_MAX + 1]);
        assert!(matches!(
            pack(b"", &mut buf),
            Err(Error::ClusterPayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_pack_max_payload() {
        let payload = vec![0x42u8; CLUSTER_PAYLOAD_BYTES_MAX];
        let mut buf = Buffer::from(payload.clone());
        pack(b"hdr", &mut buf).unwrap();
        let header = unpack(&mut buf).unwrap();
        assert_eq!(header, b"hdr");
        assert_eq!(buf.data(), payload.as_slice());
    }

    #[test]
    fn test_unpack_truncated() {
        let mut buf = Buffer::from(&[0x05u8][..]);
        assert!(matches!(
            unpack(&mut buf),
            Err(Error::ClusterTruncated { .. })
        ));

        // length prefix claims more payload than present
        let mut buf = Buffer::from(&[0xFF, 0x00, 0x01][..]);
        assert!(matches!(
            unpack(&mut buf),
            Err(Error::ClusterTruncated { .. })
        ));
    }

    #[test]
    fn test_pack_does_not_move_payload() {
        let mut buf = Buffer::from("zero copy");
        let before = buf.read(0, 1).unwrap().as_ptr();
        pack(b"h", &mut buf).unwrap();
        let after = buf.read(2, 1).unwrap().as_ptr();
        assert_eq!(before, after);
    }
}
