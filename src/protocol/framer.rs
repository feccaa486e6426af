//! # Line Framer
//!
//! Turns raw serial chunks into complete text lines.
//!
//! Bytes are accumulated until a `\n` is seen. Each terminated line has a
//! single trailing `\r` removed and is decoded as UTF-8 with replacement
//! characters, so a garbled byte never shifts record boundaries.
//!
//! A line whose content exceeds `max_line_bytes` is a framing error: it is
//! discarded up to and including its terminator and counted. The limit is
//! applied identically whether the oversized line arrives in one chunk or
//! one byte at a time.

use bytes::BytesMut;
use tracing::{trace, warn};

/// Default limit for a single line, in bytes (terminator excluded)
pub const DEFAULT_MAX_LINE_BYTES: usize = 4096;

/// Record terminator
const LINE_TERMINATOR: u8 = b'\n';

/// Optional byte preceding the terminator
const CARRIAGE_RETURN: u8 = b'\r';

/// Per-port accumulator of unterminated bytes.
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    max_line_bytes: usize,
    /// Set after an overflow until the next terminator is consumed
    discarding: bool,
    overflows: u64,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineFramer {
    /// Creates a framer that drops lines longer than `max_line_bytes`.
    ///
    /// A limit of zero is raised to one byte.
    #[must_use]
    pub fn new(max_line_bytes: usize) -> Self {
        let max_line_bytes = max_line_bytes.max(1);
        Self {
            buffer: BytesMut::with_capacity(max_line_bytes.min(256)),
            max_line_bytes,
            discarding: false,
            overflows: 0,
        }
    }

    /// Feed one chunk and return every line it completes.
    ///
    /// Partial data after the last terminator stays buffered for the next
    /// call.
    ///
    /// # Examples
    ///
    /// ```
    /// use telemon::protocol::LineFramer;
    ///
    /// let mut framer = LineFramer::default();
    /// assert!(framer.feed(b"12,3").is_empty());
    /// assert_eq!(framer.feed(b"4\r\n5"), vec!["12,34".to_string()]);
    /// assert_eq!(framer.pending_len(), 1);
    /// ```
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        trace!(chunk_len = chunk.len(), "Feeding chunk into LineFramer");
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == LINE_TERMINATOR) {
            let mut line = self.buffer.split_to(pos + 1);

            if self.discarding {
                trace!(discarded = pos, "Dropped tail of oversized line");
                self.discarding = false;
                continue;
            }

            let content_len = match pos.checked_sub(1) {
                Some(last) if line[last] == CARRIAGE_RETURN => last,
                _ => pos,
            };
            if content_len > self.max_line_bytes {
                self.record_overflow(content_len);
                continue;
            }

            line.truncate(content_len);
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if self.pending_content_len() > self.max_line_bytes {
            if !self.discarding {
                self.record_overflow(self.buffer.len());
                self.discarding = true;
            }
            self.buffer.clear();
        }

        lines
    }

    /// Number of unterminated bytes currently buffered
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Number of framing errors (oversized lines) seen so far
    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.overflows
    }

    /// Drop any buffered partial line.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    /// Buffered length excluding a trailing `\r` that may turn out to be
    /// part of the terminator
    fn pending_content_len(&self) -> usize {
        match self.buffer.last() {
            Some(&CARRIAGE_RETURN) => self.buffer.len() - 1,
            _ => self.buffer.len(),
        }
    }

    fn record_overflow(&mut self, len: usize) {
        self.overflows += 1;
        warn!(
            pending_len = len,
            max_line_bytes = self.max_line_bytes,
            "Dropping unterminated data over the line limit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_bytewise(framer: &mut LineFramer, input: &[u8]) -> Vec<String> {
        input
            .iter()
            .flat_map(|b| framer.feed(std::slice::from_ref(b)))
            .collect()
    }

    #[test]
    fn test_single_line() {
        let mut framer = LineFramer::default();
        assert_eq!(framer.feed(b"1234,5678,98.6\n"), vec!["1234,5678,98.6"]);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn test_partial_line_is_buffered() {
        let mut framer = LineFramer::default();
        assert!(framer.feed(b"15").is_empty());
        assert_eq!(framer.pending_len(), 2);
        assert_eq!(framer.feed(b"00\n"), vec!["1500"]);
    }

    #[test]
    fn test_strips_single_carriage_return() {
        let mut framer = LineFramer::default();
        assert_eq!(framer.feed(b"a\r\nb\r\r\n"), vec!["a", "b\r"]);
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut framer = LineFramer::default();
        let lines = framer.feed(b"1,2\n3,4\n5,");
        assert_eq!(lines, vec!["1,2", "3,4"]);
        assert_eq!(framer.pending_len(), 2);
    }

    #[test]
    fn test_empty_lines_are_emitted() {
        // Empty lines are the parser's concern, not the framer's
        let mut framer = LineFramer::default();
        assert_eq!(framer.feed(b"\n\r\n"), vec!["", ""]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut framer = LineFramer::default();
        let lines = framer.feed(b"1,\xFF,3\n4\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "1,\u{FFFD},3");
        assert_eq!(lines[1], "4");
    }

    #[test]
    fn test_bytewise_feeding_matches_single_feed() {
        let inputs: [&[u8]; 4] = [
            b"1,2,3\n4,5,6\r\n7",
            b"\n\n,,\n",
            b"temp=\xE2\x82\xAC,\xC3\n9\n",
            b"no newline until the end\n",
        ];

        for input in inputs {
            let whole = LineFramer::default().feed(input);
            let bytewise = feed_bytewise(&mut LineFramer::default(), input);
            assert_eq!(whole, bytewise, "input {:?}", input);
        }
    }

    #[test]
    fn test_oversized_line_is_dropped() {
        let mut framer = LineFramer::new(8);
        let lines = framer.feed(b"short\nthis line is far too long\nok\n");
        assert_eq!(lines, vec!["short", "ok"]);
        assert_eq!(framer.overflow_count(), 1);
    }

    #[test]
    fn test_oversized_unterminated_data_is_cleared() {
        let mut framer = LineFramer::new(8);
        assert!(framer.feed(b"0123456789").is_empty());
        assert_eq!(framer.pending_len(), 0);
        assert_eq!(framer.overflow_count(), 1);

        // The rest of the oversized line is skipped, the next line survives
        assert_eq!(framer.feed(b"abc\n1,2\n"), vec!["1,2"]);
        assert_eq!(framer.overflow_count(), 1);
    }

    #[test]
    fn test_overflow_is_chunking_independent() {
        let input = b"1,2\nxxxxxxxxxxxxxxxxxxxx\n3,4\n";

        let mut whole = LineFramer::new(8);
        let mut bytewise = LineFramer::new(8);
        assert_eq!(whole.feed(input), feed_bytewise(&mut bytewise, input));
        assert_eq!(whole.overflow_count(), bytewise.overflow_count());
    }

    #[test]
    fn test_crlf_line_at_limit_is_kept() {
        let input = b"abcd\r\nabcde\r\nabc\r\r\n";

        let mut whole = LineFramer::new(4);
        assert_eq!(whole.feed(input), vec!["abcd", "abc\r"]);
        assert_eq!(whole.overflow_count(), 1);

        let mut bytewise = LineFramer::new(4);
        assert_eq!(feed_bytewise(&mut bytewise, input), vec!["abcd", "abc\r"]);
        assert_eq!(bytewise.overflow_count(), 1);
    }

    #[test]
    fn test_carriage_return_inside_oversized_line_counts() {
        let mut framer = LineFramer::new(4);
        assert!(feed_bytewise(&mut framer, b"abcd\rx").is_empty());
        assert_eq!(framer.overflow_count(), 1);
        assert_eq!(framer.feed(b"\nok\n"), vec!["ok"]);
    }

    #[test]
    fn test_reset_clears_pending() {
        let mut framer = LineFramer::default();
        framer.feed(b"partial");
        framer.reset();
        assert_eq!(framer.pending_len(), 0);
        assert_eq!(framer.feed(b"x\n"), vec!["x"]);
    }
}
