//! Line-oriented query protocol
//!
//! One newline-terminated statement goes in; the next complete JSON array
//! of row objects comes out. There is no request framing beyond that, which
//! is why the supervisor only ever allows a single in-flight exchange.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use fimtrack_core::prelude::*;

use crate::monitor::Row;

/// Write one statement and decode the engine's response.
pub(crate) async fn round_trip<W, R>(input: &mut W, output: &mut R, statement: &str) -> Result<Vec<Row>>
where
    W: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
{
    input
        .write_all(statement.as_bytes())
        .await
        .map_err(|e| Error::write_failed(e.to_string()))?;
    input
        .write_all(b"\n")
        .await
        .map_err(|e| Error::write_failed(e.to_string()))?;
    input
        .flush()
        .await
        .map_err(|e| Error::write_failed(e.to_string()))?;

    read_response(output).await
}

/// Accumulate output lines until they form one complete JSON value.
///
/// The engine may emit the array on a single line or pretty-printed across
/// several; a serde "unexpected end of input" just means keep reading.
pub(crate) async fn read_response<R>(output: &mut R) -> Result<Vec<Row>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = String::new();

    loop {
        let mut line = String::new();
        let read = output
            .read_line(&mut line)
            .await
            .map_err(|e| Error::decode_failed(e.to_string()))?;
        if read == 0 {
            return Err(Error::decode_failed("engine closed its output stream"));
        }

        buffer.push_str(&line);
        if buffer.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Vec<Row>>(buffer.trim()) {
            Ok(rows) => return Ok(rows),
            Err(e) if e.is_eof() => continue,
            Err(e) => return Err(Error::decode_failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    #[tokio::test]
    async fn test_round_trip_single_line() {
        let (mut engine_in, mut our_out) = tokio::io::duplex(1024);
        let (our_in, mut engine_out) = tokio::io::duplex(1024);

        engine_out
            .write_all(b"[{\"path\":\"/tmp/a\",\"action\":\"CREATED\"}]\n")
            .await
            .unwrap();
        drop(engine_out);

        let mut reader = BufReader::new(our_in);
        let rows = round_trip(&mut our_out, &mut reader, "SELECT * FROM file_events;")
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["path"], "/tmp/a");

        // The statement must arrive newline-terminated
        drop(our_out);
        let mut sent = String::new();
        engine_in.read_to_string(&mut sent).await.unwrap();
        assert_eq!(sent, "SELECT * FROM file_events;\n");
    }

    #[tokio::test]
    async fn test_read_response_pretty_printed_across_reads() {
        // Pretty-printed array arriving in separate chunks: decoding must
        // keep accumulating until the value completes
        let mock = tokio_test::io::Builder::new()
            .read(b"[\n  {\n    \"path\": \"/etc/hosts\"\n  },\n")
            .read(b"  {\n    \"path\": \"/etc/passwd\"\n  }\n")
            .read(b"]\n")
            .build();
        let mut reader = BufReader::new(mock);

        let rows = read_response(&mut reader).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["path"], "/etc/passwd");
    }

    #[tokio::test]
    async fn test_read_response_empty_array() {
        let payload = b"[]\n";
        let mut reader = BufReader::new(&payload[..]);

        let rows = read_response(&mut reader).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_read_response_skips_blank_lines() {
        let payload = b"\n\n[{\"path\":\"/tmp/x\"}]\n";
        let mut reader = BufReader::new(&payload[..]);

        let rows = read_response(&mut reader).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_read_response_malformed() {
        let payload = b"this is not json\n";
        let mut reader = BufReader::new(&payload[..]);

        let result = read_response(&mut reader).await;
        assert!(matches!(result, Err(Error::DecodeFailed { .. })));
    }

    #[tokio::test]
    async fn test_read_response_stream_closed() {
        let payload = b"";
        let mut reader = BufReader::new(&payload[..]);

        let result = read_response(&mut reader).await;
        match result {
            Err(Error::DecodeFailed { reason }) => {
                assert!(reason.contains("closed"));
            }
            other => panic!("expected DecodeFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_response_truncated_then_closed() {
        let payload = b"[{\"path\":\n";
        let mut reader = BufReader::new(&payload[..]);

        let result = read_response(&mut reader).await;
        assert!(matches!(result, Err(Error::DecodeFailed { .. })));
    }
}
