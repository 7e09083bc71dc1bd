//! NDJSON input and output for the command line.
//!
//! Raw messages are read one JSON object per line; transformed graphs are
//! written the same way or as one JSON array.

use serde::Serialize;
use std::io::{BufRead, Write};

use crate::message::{MessageError, RawEntityMessage};

/// Error type for serialization operations
#[derive(Debug)]
pub enum SerializationError {
    JsonError(serde_json::Error),
    IoError(std::io::Error),
    /// A line that is JSON but not a usable raw message
    InvalidMessage { line: usize, source: MessageError },
}

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        SerializationError::JsonError(err)
    }
}

impl From<std::io::Error> for SerializationError {
    fn from(err: std::io::Error) -> Self {
        SerializationError::IoError(err)
    }
}

impl std::fmt::Display for SerializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializationError::JsonError(e) => write!(f, "JSON error: {}", e),
            SerializationError::IoError(e) => write!(f, "IO error: {}", e),
            SerializationError::InvalidMessage { line, source } => write!(f, "line {}: {}", line, source),
        }
    }
}

impl std::error::Error for SerializationError {}

/// NDJSON (Newline Delimited JSON) writer
///
/// Writes one JSON object per line.
pub struct NdjsonWriter<W: Write> {
    writer: W,
}

impl<W: Write> NdjsonWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a single value as an NDJSON line
    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<(), SerializationError> {
        let json = serde_json::to_string(value)?;
        writeln!(self.writer, "{}", json)?;
        Ok(())
    }

    pub fn write_all<T: Serialize>(&mut self, values: &[T]) -> Result<(), SerializationError> {
        for value in values {
            self.write(value)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SerializationError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// JSON array writer
pub struct JsonArrayWriter<W: Write> {
    writer: W,
    first: bool,
}

impl<W: Write> JsonArrayWriter<W> {
    /// Create a new JSON array writer and write the opening bracket
    pub fn new(mut writer: W) -> Result<Self, SerializationError> {
        write!(writer, "[")?;
        Ok(Self {
            writer,
            first: true,
        })
    }

    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<(), SerializationError> {
        if !self.first {
            write!(self.writer, ",")?;
        }
        self.first = false;

        let json = serde_json::to_string(value)?;
        write!(self.writer, "{}", json)?;
        Ok(())
    }

    /// Finish writing the array and close the bracket
    pub fn finish(mut self) -> Result<(), SerializationError> {
        write!(self.writer, "]")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// NDJSON reader. Blank lines and lines starting with `#` are skipped.
pub struct NdjsonReader<R: BufRead> {
    reader: R,
    line: usize,
}

impl<R: BufRead> NdjsonReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line: 0 }
    }

    /// Next non-empty line with its 1-based line number.
    pub fn next_line(&mut self) -> Result<Option<(usize, String)>, SerializationError> {
        let mut buf = String::new();
        loop {
            buf.clear();
            if self.reader.read_line(&mut buf)? == 0 {
                return Ok(None);
            }
            self.line += 1;
            let trimmed = buf.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return Ok(Some((self.line, trimmed.to_string())));
        }
    }

    /// Every line as raw bytes, unparsed.
    pub fn raw_lines(&mut self) -> Result<Vec<Vec<u8>>, SerializationError> {
        let mut lines = Vec::new();
        while let Some((_, line)) = self.next_line()? {
            lines.push(line.into_bytes());
        }
        Ok(lines)
    }

    /// Next parsed raw message.
    pub fn next_message(&mut self) -> Result<Option<RawEntityMessage>, SerializationError> {
        match self.next_line()? {
            None => Ok(None),
            Some((line, text)) => RawEntityMessage::from_slice(text.as_bytes())
                .map(Some)
                .map_err(|source| SerializationError::InvalidMessage { line, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::TransformedEntityGraph;
    use std::io::Cursor;

    const MESSAGES: &str = r#"
# two users
{"vendor":"microsoft","type":"users","tenant":"T1","data":{"id":"U1"}}

{"vendor":"microsoft","type":"users","tenant":"T1","data":{"id":"U2"}}
{"vendor":"microsoft","tenant":"T1","data":{"id":"U3"}}
"#;

    #[test]
    fn test_reader_skips_blank_and_comment_lines() {
        let mut reader = NdjsonReader::new(Cursor::new(MESSAGES));
        let first = reader.next_message().unwrap().unwrap();
        assert_eq!(first.data["id"], "U1");
        let second = reader.next_message().unwrap().unwrap();
        assert_eq!(second.data["id"], "U2");
        assert!(second.timestamp.is_some());

        // Missing `type`
        match reader.next_message() {
            Err(SerializationError::InvalidMessage { line, .. }) => assert_eq!(line, 6),
            other => panic!("expected invalid message, got {:?}", other),
        }
        assert!(reader.next_message().unwrap().is_none());
    }

    #[test]
    fn test_raw_lines() {
        let lines = NdjsonReader::new(Cursor::new(MESSAGES)).raw_lines().unwrap();
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_graph_writers() {
        let graphs = vec![TransformedEntityGraph::new(), TransformedEntityGraph::new()];

        let mut buf = Vec::new();
        let mut writer = NdjsonWriter::new(&mut buf);
        writer.write_all(&graphs).unwrap();
        writer.flush().unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert_eq!(output.lines().count(), 2);
        assert!(output.lines().all(|l| l.contains("\"userGroups\":[]")));

        let mut buf = Vec::new();
        let mut writer = JsonArrayWriter::new(&mut buf).unwrap();
        for graph in &graphs {
            writer.write(graph).unwrap();
        }
        writer.finish().unwrap();
        let parsed: Vec<TransformedEntityGraph> = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed, graphs);
    }
}
