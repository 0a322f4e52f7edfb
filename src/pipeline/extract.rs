//! Parser for the delimited ingest line format.
//!
//! One byte line per record: the 11 schema fields separated by `!` and
//! terminated by newline. The `?UNKNOWN?` sentinel (the emitter's
//! missing-key fallback) and empty fields read as null. Malformed lines
//! are logged and skipped.

use std::io::BufRead;

use log::warn;

use super::schema::{INGEST_DELIMITER, INGEST_FIELDS};
use crate::emit::MISSING;

/// One parsed ingest line; field order matches [`INGEST_FIELDS`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRecord {
    fields: [Option<String>; 11],
}

impl IngestRecord {
    pub fn get(&self, name: &str) -> Option<&str> {
        let index = INGEST_FIELDS.iter().position(|field| *field == name)?;
        self.fields[index].as_deref()
    }

    pub fn by_index(&self, index: usize) -> Option<&str> {
        self.fields.get(index).and_then(|field| field.as_deref())
    }

    pub fn topic(&self) -> Option<&str> {
        self.by_index(0)
    }

    pub fn start_time(&self) -> Option<&str> {
        self.get("start_time")
    }

    /// Parse one line (with or without the trailing newline).
    pub fn from_line(line: &[u8], delimiter: u8) -> Option<IngestRecord> {
        let mut line = line;
        while let [rest @ .., b'\n' | b'\r'] = line {
            line = rest;
        }
        if line.is_empty() {
            return None;
        }
        let mut fields: [Option<String>; 11] = Default::default();
        let mut count = 0;
        for raw in line.split(|byte| *byte == delimiter) {
            if count == fields.len() {
                return None;
            }
            let text = std::str::from_utf8(raw).ok()?;
            fields[count] = match text {
                "" | MISSING => None,
                value => Some(value.to_string()),
            };
            count += 1;
        }
        if count != fields.len() {
            return None;
        }
        Some(IngestRecord { fields })
    }
}

/// Streaming reader that yields one record per well-formed line.
pub struct RecordReader<R: BufRead> {
    source: R,
    delimiter: u8,
    line: Vec<u8>,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(source: R, delimiter: u8) -> Self {
        RecordReader {
            source,
            delimiter,
            line: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = IngestRecord;

    fn next(&mut self) -> Option<IngestRecord> {
        loop {
            self.line.clear();
            match self.source.read_until(b'\n', &mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => {
                    warn!("ingest read failed: {err}");
                    return None;
                }
            }
            match IngestRecord::from_line(&self.line, self.delimiter) {
                Some(record) => return Some(record),
                None => {
                    warn!(
                        "skipping malformed ingest line: {:?}",
                        String::from_utf8_lossy(&self.line)
                    );
                }
            }
        }
    }
}

/// Reader over the default `!`-delimited format.
pub fn read_records<R: BufRead>(source: R) -> RecordReader<R> {
    RecordReader::new(source, INGEST_DELIMITER)
}
