//! Splitting child output into diagnostic records.
//!
//! ffmpeg rewrites its progress line with a bare `\r`, so a line-based reader
//! would glue every progress report of a relay's lifetime into one record.
//! Records here end at `\n` or `\r`, and bytes that are not UTF-8 are
//! replaced rather than treated as an error.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Size of a single read from the pipe.
const READ_CHUNK: usize = 4096;

/// Longest record kept before it is cut, for writers that never send a
/// delimiter.
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// Reads text records delimited by `\n` or `\r`.
pub struct RecordReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    chunk: Box<[u8; READ_CHUNK]>,
    eof: bool,
}

impl<R> RecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            chunk: Box::new([0u8; READ_CHUNK]),
            eof: false,
        }
    }

    /// Next non-empty, trimmed record, or `None` at end of stream.
    ///
    /// A read error leaves buffered bytes in place, so the caller may retry.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(record) = self.take_record() {
                if record.is_empty() {
                    continue;
                }
                return Ok(Some(record));
            }

            if self.eof {
                return Ok(None);
            }

            let n = self.reader.read(&mut self.chunk[..]).await?;
            if n == 0 {
                self.eof = true;
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let record = decode(&self.pending);
                self.pending.clear();
                if !record.is_empty() {
                    return Ok(Some(record));
                }
                return Ok(None);
            }
            self.pending.extend_from_slice(&self.chunk[..n]);
        }
    }

    /// Cut one record off the front of the buffer, if a full one is there.
    fn take_record(&mut self) -> Option<String> {
        let end = match self.pending.iter().position(|&b| is_delimiter(b)) {
            Some(idx) => idx,
            None if self.pending.len() >= MAX_RECORD_LEN => MAX_RECORD_LEN,
            None => return None,
        };

        let record = decode(&self.pending[..end]);
        let skip = self.pending[end..]
            .iter()
            .take_while(|&&b| is_delimiter(b))
            .count();
        self.pending.drain(..end + skip);
        Some(record)
    }
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b'\n' | b'\r')
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}
