//! Newline framing for the byte stream clients send.
//!
//! Record bodies are opaque bytes: no UTF-8 requirement and no trimming,
//! so `\r` and empty lines are stored exactly as received.

use chrono::{DateTime, TimeZone};

use crate::error::Error;

const NEWLINE: u8 = b'\n';

/// One newline-terminated unit of the shared log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record(Vec<u8>);

impl Record {
    /// Builds a record from a body that must not contain a newline.
    pub fn from_body(body: &[u8]) -> Self {
        debug_assert!(!body.contains(&NEWLINE));
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.extend_from_slice(body);
        bytes.push(NEWLINE);
        Self(bytes)
    }

    /// `timestamp:<weekday>, <day> <month> <year> <time> <utc-offset>\n`
    pub fn timestamp<Tz>(at: &DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let line = at.format("timestamp:%a, %d %b %Y %T %z\n").to_string();
        Self(line.into_bytes())
    }

    /// The full record, trailing newline included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Records completed by one call to [`LineAccumulator::feed`].
#[derive(Debug, Default)]
pub struct Feed {
    pub records: Vec<Record>,
    /// One entry per record that lost its tail to the length cap.
    pub overflows: Vec<Error>,
}

/// Per-connection line buffer.
///
/// Bytes accumulate until a newline arrives. Anything past `max_len`
/// is dropped, so an overlong line is committed truncated rather than
/// split or rejected.
#[derive(Debug)]
pub struct LineAccumulator {
    pending: Vec<u8>,
    max_len: usize,
    dropped: usize,
}

impl LineAccumulator {
    pub fn new(max_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_len,
            dropped: 0,
        }
    }

    /// Scans one received chunk, returning every record it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Feed {
        let mut feed = Feed::default();

        for segment in chunk.split_inclusive(|byte| *byte == NEWLINE) {
            let (body, terminated) = match segment.split_last() {
                Some((&NEWLINE, body)) => (body, true),
                _ => (segment, false),
            };

            self.push_body(body);

            if terminated {
                if let Some(overflow) = self.overflow() {
                    feed.overflows.push(overflow);
                }
                feed.records.push(Record::from_body(&self.pending));
                self.pending.clear();
                self.dropped = 0;
            }
        }

        feed
    }

    fn push_body(&mut self, body: &[u8]) {
        let room = self.max_len.saturating_sub(self.pending.len());
        let kept = body.len().min(room);
        self.pending.extend_from_slice(&body[..kept]);
        self.dropped += body.len() - kept;
    }

    /// Bytes received since the last newline, which are never committed on
    /// their own.
    pub fn pending_len(&self) -> usize {
        self.pending.len() + self.dropped
    }

    /// Overflow of the unterminated fragment, if it already ran past the
    /// cap. Checked when a session ends before the newline arrives.
    pub fn unterminated_overflow(&self) -> Option<Error> {
        self.overflow()
    }

    fn overflow(&self) -> Option<Error> {
        (self.dropped > 0).then(|| Error::ProtocolOverflow {
            limit: self.max_len,
            dropped: self.dropped,
        })
    }
}
