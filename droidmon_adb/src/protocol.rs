use crate::AdbError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const WIRE_OKAY: &[u8; 4] = b"OKAY";
const WIRE_FAIL: &[u8; 4] = b"FAIL";

/// Encodes an ADB wire-protocol command: a 4-digit lower-case hex length
/// prefix followed by the payload, no trailing newline.
pub fn encode_command(cmd: &str) -> Vec<u8> {
    let mut msg = format!("{:04x}", cmd.len()).into_bytes();
    msg.extend_from_slice(cmd.as_bytes());
    msg
}

/// Writes a framed command to the transport.
pub(crate) async fn write_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cmd: &str,
) -> Result<(), AdbError> {
    writer.write_all(&encode_command(cmd)).await?;
    Ok(())
}

/// Reads the 4-byte status response. `OKAY` is success; `FAIL` carries a
/// length-prefixed message which is surfaced as [`AdbError::Server`].
/// Anything else is a protocol violation.
pub async fn read_status<R: AsyncRead + Unpin>(
    reader: &mut R,
    cmd: &str,
) -> Result<(), AdbError> {
    let mut status = [0u8; 4];
    reader
        .read_exact(&mut status)
        .await
        .map_err(|e| map_eof(e, "reading status"))?;

    if &status == WIRE_OKAY {
        return Ok(());
    }
    if &status == WIRE_FAIL {
        let message = read_length_prefixed(reader).await?;
        return Err(AdbError::Server {
            command: cmd.to_string(),
            message,
        });
    }
    Err(AdbError::Protocol(format!(
        "unexpected status {:?}",
        String::from_utf8_lossy(&status)
    )))
}

/// Reads a 4-hex-digit length prefix and then that many payload bytes,
/// returned as UTF-8 (lossy). Used both for single-shot command replies
/// and for the frames of a `track-devices` subscription.
pub async fn read_length_prefixed<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<String, AdbError> {
    let mut length_buf = [0u8; 4];
    reader
        .read_exact(&mut length_buf)
        .await
        .map_err(|e| map_eof(e, "reading length prefix"))?;

    let mut length: u32 = 0;
    for b in length_buf {
        length <<= 4;
        match b {
            b'0'..=b'9' => length |= u32::from(b - b'0'),
            b'a'..=b'f' => length |= u32::from(b - b'a') + 10,
            b'A'..=b'F' => length |= u32::from(b - b'A') + 10,
            _ => {
                return Err(AdbError::Protocol(format!(
                    "invalid hex digit {:?} in length",
                    b as char
                )));
            }
        }
    }

    if length == 0 {
        return Ok(String::new());
    }

    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| map_eof(e, "reading payload"))?;
    Ok(String::from_utf8_lossy(&payload).into_owned())
}

/// Reads all remaining bytes from a shell connection and trims whitespace.
pub(crate) async fn read_remainder<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<String, AdbError> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await?;
    Ok(String::from_utf8_lossy(&data).trim().to_string())
}

/// An `UnexpectedEof` mid-frame means the peer hung up; distinguish it
/// from other I/O failures so stream consumers can treat it as a clean
/// termination.
fn map_eof(e: std::io::Error, _context: &str) -> AdbError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        AdbError::ConnectionClosed
    } else {
        AdbError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn encode_simple_command() {
        let msg = encode_command("host:version");
        assert_eq!(msg, b"000chost:version");
    }

    #[test]
    fn encode_empty_command() {
        assert_eq!(encode_command(""), b"0000");
    }

    #[tokio::test]
    async fn length_prefixed_round_trip() {
        for payload in ["hello, world", "", "0123456789"] {
            let framed = encode_command(payload);
            let mut reader = framed.as_slice();
            let got = read_length_prefixed(&mut reader).await.expect("decode");
            assert_eq!(got, payload);
        }
    }

    #[tokio::test]
    async fn length_prefixed_rejects_invalid_hex() {
        let mut reader: &[u8] = b"zzzzhello";
        let err = read_length_prefixed(&mut reader).await.unwrap_err();
        assert!(matches!(err, AdbError::Protocol(_)));
    }

    #[tokio::test]
    async fn length_prefixed_short_payload_is_connection_closed() {
        // Claims 10 bytes but only 5 follow.
        let mut reader: &[u8] = b"000ahello";
        let err = read_length_prefixed(&mut reader).await.unwrap_err();
        assert!(matches!(err, AdbError::ConnectionClosed));
    }

    #[tokio::test]
    async fn status_okay() {
        let mut reader: &[u8] = b"OKAY";
        read_status(&mut reader, "test").await.expect("okay");
    }

    #[tokio::test]
    async fn status_fail_carries_server_message() {
        let msg = "device not found";
        let framed = format!("FAIL{:04x}{}", msg.len(), msg);
        let mut reader = framed.as_bytes();
        let err = read_status(&mut reader, "host:transport:xyz")
            .await
            .unwrap_err();
        match err {
            AdbError::Server { command, message } => {
                assert_eq!(command, "host:transport:xyz");
                assert_eq!(message, msg);
            }
            other => panic!("expected Server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_garbage_is_protocol_error() {
        let mut reader: &[u8] = b"BAAD";
        let err = read_status(&mut reader, "test").await.unwrap_err();
        assert!(matches!(err, AdbError::Protocol(_)));
    }

    #[tokio::test]
    async fn status_eof_is_connection_closed() {
        let mut reader: &[u8] = b"";
        let err = read_status(&mut reader, "test").await.unwrap_err();
        assert!(matches!(err, AdbError::ConnectionClosed));
    }

    #[tokio::test]
    async fn write_then_read_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_command(&mut client, "host:devices-l")
            .await
            .expect("write");
        client.shutdown().await.expect("shutdown");

        let got = read_length_prefixed(&mut server).await.expect("read");
        assert_eq!(got, "host:devices-l");
    }

    #[tokio::test]
    async fn read_remainder_trims_whitespace() {
        let mut reader: &[u8] = b"  some output with whitespace  \n\n";
        let got = read_remainder(&mut reader).await.expect("read");
        assert_eq!(got, "some output with whitespace");
    }
}
