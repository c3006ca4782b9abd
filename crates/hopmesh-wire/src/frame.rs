//! Frame codec.
//!
//! Every command travels in exactly one frame:
//!
//! ```text
//! SOH | len_hi | len_lo | STX | payload | ETX
//! ```
//!
//! `len` is a big-endian u16 covering the payload plus the 5 framing bytes.
//! Frames are read and written one at a time; there is no pipelining.

use crate::error::WireError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Start of header.
pub const SOH: u8 = 0x01;
/// Start of text.
pub const STX: u8 = 0x02;
/// End of text.
pub const ETX: u8 = 0x03;
/// Separates a SENDMSG main command from its hop trailer.
pub const EOT: u8 = 0x04;

/// Largest frame on the wire, framing bytes included.
pub const MAX_MESSAGE_LENGTH: usize = 5000;
/// SOH(1) + length(2) + STX(1) + ETX(1).
pub const HEADER_SIZE: usize = 5;
/// Bytes reserved for a hop trailer.
pub const MAX_HOPS_LENGTH: usize = 240;
/// Budget for a main command, leaving room for EOT and a full hop trailer.
pub const MAX_PAYLOAD_LENGTH: usize = MAX_MESSAGE_LENGTH - HEADER_SIZE - MAX_HOPS_LENGTH - 1;
/// Largest payload the codec accepts.
pub const MAX_FRAME_PAYLOAD: usize = MAX_MESSAGE_LENGTH - HEADER_SIZE;

/// Encode a payload into a complete frame.
pub fn encode_frame(payload: &str) -> Result<Vec<u8>, WireError> {
    let bytes = payload.as_bytes();
    if bytes.len() > MAX_FRAME_PAYLOAD {
        return Err(WireError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }

    let total = (bytes.len() + HEADER_SIZE) as u16;
    let mut frame = Vec::with_capacity(bytes.len() + HEADER_SIZE);
    frame.push(SOH);
    frame.extend_from_slice(&total.to_be_bytes());
    frame.push(STX);
    frame.extend_from_slice(bytes);
    frame.push(ETX);
    Ok(frame)
}

/// Validate a declared total length and return the payload length.
pub fn payload_length(total: u16) -> Result<usize, WireError> {
    let total = total as usize;
    if !(HEADER_SIZE..=MAX_MESSAGE_LENGTH).contains(&total) {
        return Err(WireError::InvalidLength(total));
    }
    Ok(total - HEADER_SIZE)
}

/// Decode a single complete frame held in memory.
pub fn decode_frame(frame: &[u8]) -> Result<String, WireError> {
    if frame.len() < HEADER_SIZE {
        return Err(WireError::Truncated);
    }
    expect_marker(frame[0], SOH)?;
    let len = payload_length(u16::from_be_bytes([frame[1], frame[2]]))?;
    expect_marker(frame[3], STX)?;
    if frame.len() != len + HEADER_SIZE {
        return Err(WireError::Truncated);
    }
    expect_marker(frame[HEADER_SIZE - 1 + len], ETX)?;
    Ok(String::from_utf8_lossy(&frame[4..4 + len]).into_owned())
}

/// Write one framed payload.
pub async fn write_frame<W>(writer: &mut W, payload: &str) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed payload, blocking until a whole frame has arrived.
pub async fn read_frame<R>(reader: &mut R) -> Result<String, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut marker = [0u8; 1];
    match reader.read(&mut marker).await? {
        0 => return Err(WireError::ConnectionClosed),
        _ => expect_marker(marker[0], SOH)?,
    }

    let mut len_bytes = [0u8; 2];
    read_exact_or_closed(reader, &mut len_bytes).await?;
    let len = payload_length(u16::from_be_bytes(len_bytes))?;

    read_exact_or_closed(reader, &mut marker).await?;
    expect_marker(marker[0], STX)?;

    let mut payload = vec![0u8; len];
    read_exact_or_closed(reader, &mut payload).await?;

    read_exact_or_closed(reader, &mut marker).await?;
    expect_marker(marker[0], ETX)?;

    Ok(String::from_utf8_lossy(&payload).into_owned())
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::ConnectionClosed),
        Err(e) => Err(WireError::Io(e)),
    }
}

fn expect_marker(got: u8, expected: u8) -> Result<(), WireError> {
    if got == expected {
        Ok(())
    } else {
        Err(WireError::BadMarker { expected, got })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode_frame("HELO,A5_1").unwrap();
        assert_eq!(frame[0], SOH);
        let total = u16::from_be_bytes([frame[1], frame[2]]) as usize;
        assert_eq!(total, "HELO,A5_1".len() + HEADER_SIZE);
        assert_eq!(total, frame.len());
        assert_eq!(frame[3], STX);
        assert_eq!(&frame[4..frame.len() - 1], b"HELO,A5_1");
        assert_eq!(*frame.last().unwrap(), ETX);
    }

    #[test]
    fn test_length_is_big_endian() {
        let payload = "x".repeat(300);
        let frame = encode_frame(&payload).unwrap();
        // 305 = 0x0131
        assert_eq!(frame[1], 0x01);
        assert_eq!(frame[2], 0x31);
    }

    #[test]
    fn test_decode_inverts_encode() {
        for payload in ["", "STATUSREQ", "SENDMSG,A5_2,A5_1,hi, there", &"y".repeat(MAX_FRAME_PAYLOAD)] {
            let frame = encode_frame(payload).unwrap();
            assert_eq!(decode_frame(&frame).unwrap(), payload);
        }
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let payload = "z".repeat(MAX_FRAME_PAYLOAD + 1);
        match encode_frame(&payload) {
            Err(WireError::MessageTooLarge { size, max }) => {
                assert_eq!(size, MAX_FRAME_PAYLOAD + 1);
                assert_eq!(max, MAX_FRAME_PAYLOAD);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_payload_budget_constants() {
        assert_eq!(MAX_PAYLOAD_LENGTH, 4754);
        assert_eq!(MAX_PAYLOAD_LENGTH + 1 + MAX_HOPS_LENGTH, MAX_FRAME_PAYLOAD);
    }

    #[test]
    fn test_payload_length_bounds() {
        assert!(matches!(payload_length(4), Err(WireError::InvalidLength(4))));
        assert_eq!(payload_length(5).unwrap(), 0);
        assert_eq!(payload_length(5000).unwrap(), 4995);
        assert!(matches!(payload_length(5001), Err(WireError::InvalidLength(5001))));
    }

    #[tokio::test]
    async fn test_read_frame_across_partial_reads() {
        let frame = encode_frame("KEEPALIVE,3").unwrap();
        let mut reader = tokio_test::io::Builder::new()
            .read(&frame[..2])
            .read(&frame[2..6])
            .read(&frame[6..])
            .build();
        assert_eq!(read_frame(&mut reader).await.unwrap(), "KEEPALIVE,3");
    }

    #[tokio::test]
    async fn test_read_frame_bad_start_marker() {
        let mut reader = tokio_test::io::Builder::new().read(&[0x7f]).build();
        match read_frame(&mut reader).await {
            Err(WireError::BadMarker { expected, got }) => {
                assert_eq!(expected, SOH);
                assert_eq!(got, 0x7f);
            }
            other => panic!("Expected BadMarker, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_frame_bad_end_marker() {
        let mut frame = encode_frame("NO_MESSAGES").unwrap();
        let last = frame.len() - 1;
        frame[last] = b'!';
        let mut reader = tokio_test::io::Builder::new().read(&frame).build();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::BadMarker { expected: ETX, .. })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_invalid_length() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&[SOH, 0xff, 0xff])
            .build();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::InvalidLength(0xffff))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_closed() {
        let mut reader = tokio_test::io::Builder::new().build();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_frame_closed_mid_payload() {
        let frame = encode_frame("GETMSGS,A5_1").unwrap();
        let mut reader = tokio_test::io::Builder::new().read(&frame[..7]).build();
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_frame() {
        let expected = encode_frame("STATUSREQ").unwrap();
        let mut writer = tokio_test::io::Builder::new().write(&expected).build();
        write_frame(&mut writer, "STATUSREQ").await.unwrap();
    }

    #[tokio::test]
    async fn test_duplex_back_to_back_frames() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            write_frame(&mut a, "HELO,A5_2").await.unwrap();
            write_frame(&mut a, "SERVERS,A5_2,10.0.0.2,4002").await.unwrap();
        });
        assert_eq!(read_frame(&mut b).await.unwrap(), "HELO,A5_2");
        assert_eq!(read_frame(&mut b).await.unwrap(), "SERVERS,A5_2,10.0.0.2,4002");
        writer.await.unwrap();
    }
}
