//! Fixed-size message payloads.
//!
//! Every work request moves exactly [`BUF_SIZE`] bytes: a NUL-padded
//! string with no header, no length prefix and no checksum. Message
//! boundaries equal buffer boundaries, so a payload must leave at least
//! one byte of padding for the terminator; oversized payloads are
//! rejected rather than truncated, keeping read-back well defined.

use thiserror::Error;

/// Size of every message buffer and of every work request, in bytes.
pub const BUF_SIZE: usize = 1024;

/// The payload a client sends to announce intentional termination.
pub const SENTINEL: &[u8] = b"BYE";

/// The payload does not fit the buffer with a terminator.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("payload of {len} bytes does not fit a {cap}-byte buffer (one byte is reserved for the terminator)")]
pub struct PayloadTooLong {
    pub len: usize,
    pub cap: usize,
}

/// Copy `msg` into `buf`, NUL-padding the remainder.
///
/// Fails if `msg` would not leave room for at least one terminator byte.
pub fn write_payload(buf: &mut [u8], msg: &[u8]) -> Result<(), PayloadTooLong> {
    if msg.len() >= buf.len() {
        return Err(PayloadTooLong {
            len: msg.len(),
            cap: buf.len(),
        });
    }
    buf[..msg.len()].copy_from_slice(msg);
    buf[msg.len()..].fill(0);
    Ok(())
}

/// The payload bytes of a buffer: everything up to the first NUL.
pub fn payload(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}

/// Write the byte-reversed payload of `src` into `dst`, NUL-padded.
///
/// The source bytes come off the wire, so the padding convention cannot
/// be trusted: a peer may send a full buffer with no terminator. A
/// payload that does not leave room for the terminator is truncated to
/// `dst.len() - 1` bytes, keeping the reply well formed no matter what
/// arrived.
pub fn fill_reversed(src: &[u8], dst: &mut [u8]) {
    let p = payload(src);
    let n = p.len().min(dst.len().saturating_sub(1));
    for (d, s) in dst[..n].iter_mut().zip(p.iter().rev()) {
        *d = *s;
    }
    dst[n..].fill(0);
}

/// Whether the buffer carries the termination sentinel.
pub fn is_sentinel(buf: &[u8]) -> bool {
    payload(buf) == SENTINEL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_reversal() {
        let mut a = [0u8; BUF_SIZE];
        let mut b = [0u8; BUF_SIZE];
        let mut c = [0u8; BUF_SIZE];
        write_payload(&mut a, b"hello").unwrap();
        fill_reversed(&a, &mut b);
        assert_eq!(payload(&b), b"olleh");
        fill_reversed(&b, &mut c);
        assert_eq!(payload(&c), b"hello");
    }

    #[test]
    fn reply_is_reversed_and_padded() {
        let mut inbound = [0u8; 16];
        let mut outbound = [0xffu8; 16];
        write_payload(&mut inbound, b"abc").unwrap();
        fill_reversed(&inbound, &mut outbound);
        assert_eq!(&outbound[..3], b"cba");
        assert!(outbound[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn boundary_payload_fits_unchanged() {
        let msg = vec![b'x'; BUF_SIZE - 1];
        let mut buf = [0u8; BUF_SIZE];
        write_payload(&mut buf, &msg).unwrap();
        assert_eq!(payload(&buf), &msg[..]);

        let mut reply = [0u8; BUF_SIZE];
        fill_reversed(&buf, &mut reply);
        assert_eq!(payload(&reply).len(), BUF_SIZE - 1);
    }

    #[test]
    fn payload_at_capacity_is_rejected() {
        let msg = vec![b'x'; BUF_SIZE];
        let mut buf = [0u8; BUF_SIZE];
        let err = write_payload(&mut buf, &msg).unwrap_err();
        assert_eq!(
            err,
            PayloadTooLong {
                len: BUF_SIZE,
                cap: BUF_SIZE
            }
        );
    }

    #[test]
    fn writing_clears_stale_bytes() {
        let mut buf = [0u8; 8];
        write_payload(&mut buf, b"longer").unwrap();
        write_payload(&mut buf, b"ab").unwrap();
        assert_eq!(payload(&buf), b"ab");
        assert!(buf[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn sentinel_detection() {
        let mut buf = [0u8; 8];
        write_payload(&mut buf, SENTINEL).unwrap();
        assert!(is_sentinel(&buf));

        write_payload(&mut buf, b"BYEs").unwrap();
        assert!(!is_sentinel(&buf));

        write_payload(&mut buf, b"bye").unwrap();
        assert!(!is_sentinel(&buf));
    }

    #[test]
    fn unterminated_inbound_buffer_is_truncated() {
        // A nonconforming peer can fill the whole buffer with no
        // terminator; the reply must still carry one.
        let src = [b'x'; BUF_SIZE];
        let mut dst = [0xffu8; BUF_SIZE];
        fill_reversed(&src, &mut dst);
        assert_eq!(payload(&dst).len(), BUF_SIZE - 1);
        assert!(payload(&dst).iter().all(|&b| b == b'x'));
        assert_eq!(dst[BUF_SIZE - 1], 0);
    }

    #[test]
    fn empty_payload() {
        let mut buf = [0u8; 8];
        write_payload(&mut buf, b"").unwrap();
        assert_eq!(payload(&buf), b"");
        let mut reply = [0u8; 8];
        fill_reversed(&buf, &mut reply);
        assert_eq!(payload(&reply), b"");
    }
}
