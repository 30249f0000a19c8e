// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Line framing for the worker wire.
//!
//! One JSON object per `\n`-terminated line. The byte cap applies to the
//! serialized form, so multibyte characters count at their UTF-8 byte
//! length, not their character count. Oversized frames fail fast with
//! [`Error::BufferOverflow`] and never reach the worker; oversized inbound
//! lines are dropped with a decode failure rather than poisoning the
//! reader.

use crate::error::{Error, Result};
use crate::metrics_constants::{METRIC_CODEC_DECODE_FAILURES_TOTAL, METRIC_CODEC_FRAME_BYTES};
use prometheus::{Counter, Histogram, HistogramOpts};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::LazyLock;

/// Default byte cap on a serialized frame (1 MiB).
pub const DEFAULT_MAX_LINE_BUFFER_SIZE: usize = 1_048_576;

static DECODE_FAILURES: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(
        METRIC_CODEC_DECODE_FAILURES_TOTAL,
        "Total inbound worker frames that failed to decode",
    )
});

static FRAME_BYTES: LazyLock<Histogram> = LazyLock::new(|| {
    crate::metrics_utils::histogram(
        HistogramOpts::new(METRIC_CODEC_FRAME_BYTES, "Serialized frame size in bytes").buckets(
            vec![
                64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262_144.0, 1_048_576.0,
            ],
        ),
    )
});

/// Serialize a frame to a newline-terminated JSON line, enforcing the cap.
///
/// # Errors
///
/// `BufferOverflow` when the serialized form exceeds `max_bytes`;
/// `Json` when the value cannot be serialized.
pub fn encode_frame<T: Serialize>(frame: &T, max_bytes: usize) -> Result<String> {
    let mut line = serde_json::to_string(frame)?;
    // The cap is measured on the payload, excluding the terminator.
    if line.len() > max_bytes {
        return Err(Error::BufferOverflow {
            size: line.len(),
            limit: max_bytes,
        });
    }
    FRAME_BYTES.observe(line.len() as f64);
    line.push('\n');
    Ok(line)
}

/// Check a payload-carrying string against the cap without serializing
/// the envelope. Used on admission so oversized prompts are rejected
/// before any queueing work happens.
pub fn check_payload_bytes(payload_len: usize, max_bytes: usize) -> Result<()> {
    if payload_len > max_bytes {
        return Err(Error::BufferOverflow {
            size: payload_len,
            limit: max_bytes,
        });
    }
    Ok(())
}

/// Decode one inbound line into a frame type.
///
/// # Errors
///
/// `BufferOverflow` when the line exceeds `max_bytes` (the reader drops
/// the line and continues); `Parse` when the line is not valid JSON for
/// the expected shape.
pub fn decode_frame<T: DeserializeOwned>(line: &str, max_bytes: usize) -> Result<T> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.len() > max_bytes {
        DECODE_FAILURES.inc();
        return Err(Error::BufferOverflow {
            size: trimmed.len(),
            limit: max_bytes,
        });
    }
    FRAME_BYTES.observe(trimmed.len() as f64);
    serde_json::from_str(trimmed).map_err(|e| {
        DECODE_FAILURES.inc();
        Error::Parse(format!("invalid worker frame: {e}"))
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{methods, WorkerRequest, WorkerResponse};
    use serde_json::json;

    #[test]
    fn test_encode_appends_newline() {
        let req = WorkerRequest {
            id: 1,
            method: methods::PING.to_string(),
            params: json!({}),
        };
        let line = encode_frame(&req, DEFAULT_MAX_LINE_BUFFER_SIZE).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let req = WorkerRequest {
            id: 2,
            method: methods::GENERATE.to_string(),
            params: json!({"prompt": "x".repeat(2048)}),
        };
        let err = encode_frame(&req, 1024).unwrap_err();
        match err {
            Error::BufferOverflow { size, limit } => {
                assert!(size > 1024);
                assert_eq!(limit, 1024);
            }
            other => panic!("expected BufferOverflow, got {other:?}"),
        }
    }

    #[test]
    fn test_cap_counts_multibyte_characters_by_byte_length() {
        // A 4-byte emoji: 300 copies is 1200 bytes serialized, well over a
        // 1000-byte cap even though only 300 characters.
        let prompt = "\u{1F980}".repeat(300);
        assert_eq!(prompt.len(), 1200);
        let req = WorkerRequest {
            id: 3,
            method: methods::GENERATE.to_string(),
            params: json!({"prompt": prompt}),
        };
        assert!(matches!(
            encode_frame(&req, 1000),
            Err(Error::BufferOverflow { .. })
        ));
    }

    #[test]
    fn test_check_payload_bytes() {
        assert!(check_payload_bytes(10, 10).is_ok());
        assert!(matches!(
            check_payload_bytes(11, 10),
            Err(Error::BufferOverflow { size: 11, limit: 10 })
        ));
    }

    #[test]
    fn test_decode_round_trip() {
        let line = "{\"id\":9,\"result\":{\"ok\":true}}\n";
        let resp: WorkerResponse = decode_frame(line, DEFAULT_MAX_LINE_BUFFER_SIZE).unwrap();
        assert_eq!(resp.id, 9);
        assert!(resp.result.is_some());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_frame::<WorkerResponse>("not json", DEFAULT_MAX_LINE_BUFFER_SIZE)
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_decode_rejects_oversized_line() {
        let line = format!("{{\"id\":1,\"result\":\"{}\"}}", "y".repeat(4096));
        assert!(matches!(
            decode_frame::<WorkerResponse>(&line, 256),
            Err(Error::BufferOverflow { .. })
        ));
    }
}
