//! Newline-delimited JSON framing.
//!
//! The terminal writes one JSON object per line. TCP may split or coalesce
//! those lines arbitrarily, so bytes are buffered until a full line is seen.

use crate::protocol::Response;
use tradebridge_core::BridgeError;

/// Default cap on a single unterminated line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds {limit} bytes")]
    Oversized { limit: usize },
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        BridgeError::Protocol(err.to_string())
    }
}

/// Incremental line decoder with a hard per-line size limit.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    max_line: usize,
    /// Bytes of `buf` already searched for a newline.
    scanned: usize,
    /// Dropping the tail of an oversized line until its newline arrives.
    discarding: bool,
}

impl LineDecoder {
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
            scanned: 0,
            discarding: false,
        }
    }

    /// Append bytes read from the socket.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True when an incomplete line is buffered.
    pub fn has_partial(&self) -> bool {
        !self.discarding && !self.buf.is_empty()
    }

    /// Yield the next complete line, in arrival order.
    ///
    /// Returns `None` when more bytes are needed. An oversized line produces
    /// exactly one `CodecError::Oversized`, however it was fragmented.
    pub fn next_frame(&mut self) -> Option<Result<String, CodecError>> {
        loop {
            let newline = self.buf[self.scanned..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                self.scanned = self.buf.len();
                if self.discarding {
                    self.buf.clear();
                    self.scanned = 0;
                    return None;
                }
                // A trailing '\r' may be the first half of a CRLF terminator.
                let pending_cr = usize::from(self.buf.last() == Some(&b'\r'));
                if self.buf.len() > self.max_line + pending_cr {
                    self.buf.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    return Some(Err(CodecError::Oversized {
                        limit: self.max_line,
                    }));
                }
                return None;
            };

            let end = self.scanned + offset;
            let raw: Vec<u8> = self.buf.drain(..=end).collect();
            self.scanned = 0;

            if self.discarding {
                self.discarding = false;
                continue;
            }

            let mut line = &raw[..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.len() > self.max_line {
                return Some(Err(CodecError::Oversized {
                    limit: self.max_line,
                }));
            }
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return Some(
                std::str::from_utf8(line)
                    .map(str::to_string)
                    .map_err(|_| CodecError::InvalidUtf8),
            );
        }
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

/// Serialize a response as a single terminated line.
pub fn encode_response(response: &Response) -> Result<Vec<u8>, BridgeError> {
    let mut bytes = serde_json::to_vec(response)
        .map_err(|e| BridgeError::Internal(format!("response serialization failed: {}", e)))?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(decoder: &mut LineDecoder) -> Vec<Result<String, CodecError>> {
        std::iter::from_fn(|| decoder.next_frame()).collect()
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let mut decoder = LineDecoder::new(1024);
        decoder.push(br#"{"action":"pi"#);
        assert!(decoder.next_frame().is_none());
        assert!(decoder.has_partial());

        decoder.push(b"ng\"}\r\n{\"action\"");
        assert_eq!(
            decoder.next_frame(),
            Some(Ok(r#"{"action":"ping"}"#.to_string()))
        );
        assert!(decoder.next_frame().is_none());
        assert!(decoder.has_partial());
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut decoder = LineDecoder::new(1024);
        decoder.push(b"\n\r\n  \nabc\n");
        assert_eq!(drain(&mut decoder), vec![Ok("abc".to_string())]);
    }

    #[test]
    fn test_oversized_unterminated_line_rejected_once() {
        let mut decoder = LineDecoder::new(8);
        decoder.push(b"0123456789");
        assert_eq!(
            decoder.next_frame(),
            Some(Err(CodecError::Oversized { limit: 8 }))
        );
        // The tail of the same line is dropped silently.
        decoder.push(b"abcdef");
        assert!(decoder.next_frame().is_none());
        decoder.push(b"xyz\nok\n");
        assert_eq!(drain(&mut decoder), vec![Ok("ok".to_string())]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_oversized_terminated_line_rejected() {
        let mut decoder = LineDecoder::new(4);
        decoder.push(b"too long\nfine\n");
        assert_eq!(
            drain(&mut decoder),
            vec![
                Err(CodecError::Oversized { limit: 4 }),
                Ok("fine".to_string())
            ]
        );
    }

    #[test]
    fn test_crlf_split_at_limit_accepted() {
        let mut whole = LineDecoder::new(4);
        whole.push(b"abcd\r\n");
        assert_eq!(drain(&mut whole), vec![Ok("abcd".to_string())]);

        let mut split = LineDecoder::new(4);
        split.push(b"abcd\r");
        assert!(split.next_frame().is_none());
        split.push(b"\n");
        assert_eq!(drain(&mut split), vec![Ok("abcd".to_string())]);

        // A carriage return inside the line still counts.
        let mut over = LineDecoder::new(4);
        over.push(b"abcd\rx");
        assert_eq!(
            over.next_frame(),
            Some(Err(CodecError::Oversized { limit: 4 }))
        );
    }

    #[test]
    fn test_invalid_utf8_only_affects_its_line() {
        let mut decoder = LineDecoder::new(64);
        decoder.push(&[0xff, 0xfe, b'\n']);
        decoder.push(b"next\n");
        assert_eq!(
            drain(&mut decoder),
            vec![Err(CodecError::InvalidUtf8), Ok("next".to_string())]
        );
    }

    #[test]
    fn test_encode_response_is_one_line() {
        let bytes = encode_response(&Response::pong()).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }

    fn message_line() -> impl Strategy<Value = String> {
        (
            prop_oneof![Just("ping"), Just("trade"), Just("account_info")],
            "[A-Z]{3,8}",
            "[a-zA-Z0-9 ]{0,40}",
        )
            .prop_map(|(action, broker, note)| {
                serde_json::json!({ "action": action, "broker": broker, "note": note }).to_string()
            })
    }

    const PROP_MAX_LINE: usize = 48;

    /// Lines up to and around the limit, to exercise the boundary.
    fn sized_line() -> impl Strategy<Value = String> {
        (PROP_MAX_LINE - 4..=PROP_MAX_LINE + 2).prop_flat_map(|len| {
            prop::collection::vec(prop::char::range('a', 'z'), len)
                .prop_map(|chars| chars.into_iter().collect::<String>())
        })
    }

    fn split_stream(stream: &[u8], cuts: &[prop::sample::Index]) -> Vec<usize> {
        let mut points: Vec<usize> = cuts.iter().map(|i| i.index(stream.len() + 1)).collect();
        points.push(0);
        points.push(stream.len());
        points.sort_unstable();
        points.dedup();
        points
    }

    proptest! {
        /// Framing is independent of how reads fragment the stream.
        #[test]
        fn framing_survives_arbitrary_splits(
            lines in prop::collection::vec(message_line(), 1..12),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..24),
            crlf in any::<bool>(),
        ) {
            let terminator: &[u8] = if crlf { b"\r\n" } else { b"\n" };
            let stream: Vec<u8> = lines
                .iter()
                .flat_map(|l| l.bytes().chain(terminator.iter().copied()))
                .collect();

            let mut decoder = LineDecoder::new(DEFAULT_MAX_LINE_BYTES);
            let mut decoded = Vec::new();
            for window in split_stream(&stream, &cuts).windows(2) {
                decoder.push(&stream[window[0]..window[1]]);
                while let Some(frame) = decoder.next_frame() {
                    decoded.push(frame.unwrap());
                }
            }

            prop_assert_eq!(decoded, lines);
            prop_assert!(!decoder.has_partial());
        }

        /// Whether a line near the limit is accepted does not depend on
        /// where the stream was cut.
        #[test]
        fn limit_is_split_independent(
            lines in prop::collection::vec(sized_line(), 1..6),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..16),
            crlf in any::<bool>(),
        ) {
            let terminator: &[u8] = if crlf { b"\r\n" } else { b"\n" };
            let stream: Vec<u8> = lines
                .iter()
                .flat_map(|l| l.bytes().chain(terminator.iter().copied()))
                .collect();

            let mut whole = LineDecoder::new(PROP_MAX_LINE);
            whole.push(&stream);
            let expected = drain(&mut whole);

            let mut decoder = LineDecoder::new(PROP_MAX_LINE);
            let mut decoded = Vec::new();
            for window in split_stream(&stream, &cuts).windows(2) {
                decoder.push(&stream[window[0]..window[1]]);
                decoded.extend(drain(&mut decoder));
            }

            let accepted: Vec<String> = lines
                .iter()
                .filter(|l| l.len() <= PROP_MAX_LINE)
                .cloned()
                .collect();
            prop_assert_eq!(&decoded, &expected);
            prop_assert_eq!(
                decoded.iter().filter_map(|f| f.clone().ok()).collect::<Vec<_>>(),
                accepted
            );
            prop_assert_eq!(
                decoded.iter().filter(|f| f.is_err()).count(),
                lines.len() - lines.iter().filter(|l| l.len() <= PROP_MAX_LINE).count()
            );
        }
    }
}
