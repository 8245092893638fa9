//! Streaming reader and appending writer for large JSON arrays of objects.
//!
//! The reader never holds more than one chunk plus one partial object in
//! memory. It does not run a full JSON parser over the stream: a small
//! brace/quote scanner finds where each top-level object ends, and only those
//! complete slices are handed to `serde_json`.

use crate::error::SnapshotError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Default read chunk size (10 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;

type ChunkCallback = Box<dyn FnMut(u64, u64) + Send>;

/// Scanner position carried between chunks.
#[derive(Debug, Default, Clone)]
struct ScanState {
    /// Next unscanned byte in the carry buffer.
    pos: usize,
    in_string: bool,
    escaped: bool,
    depth: u32,
    /// Start of the object currently being scanned, if any.
    object_start: Option<usize>,
    opened: bool,
    closed: bool,
}

/// Lazily parses a JSON array of objects from any reader.
///
/// Yields entries in document order. `bytes_read` and `entries_read` are
/// reported to the optional chunk callback after every chunk.
pub struct ArrayReader<R, T> {
    reader: R,
    name: String,
    chunk_size: usize,
    buffer: Vec<u8>,
    scan: ScanState,
    pending: VecDeque<T>,
    bytes_read: u64,
    entries_read: u64,
    on_chunk: Option<ChunkCallback>,
    finished: bool,
}

impl<T: DeserializeOwned> ArrayReader<File, T> {
    /// Opens `path` for streaming with the given chunk size.
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self, SnapshotError> {
        let file = File::open(path)?;
        Ok(ArrayReader::new(file, chunk_size).named(path.display().to_string()))
    }
}

impl<R: Read, T: DeserializeOwned> ArrayReader<R, T> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            name: "<stream>".to_string(),
            chunk_size: chunk_size.max(1),
            buffer: Vec::new(),
            scan: ScanState::default(),
            pending: VecDeque::new(),
            bytes_read: 0,
            entries_read: 0,
            on_chunk: None,
            finished: false,
        }
    }

    /// Name used in error messages.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Callback receiving `(bytes_read, entries_read)` after each chunk.
    pub fn on_chunk<F>(mut self, callback: F) -> Self
    where
        F: FnMut(u64, u64) + Send + 'static,
    {
        self.on_chunk = Some(Box::new(callback));
        self
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn entries_read(&self) -> u64 {
        self.entries_read
    }

    fn read_chunk(&mut self) -> io::Result<usize> {
        let before = self.buffer.len();
        (&mut self.reader)
            .take(self.chunk_size as u64)
            .read_to_end(&mut self.buffer)?;
        Ok(self.buffer.len() - before)
    }

    /// Scans newly appended bytes, returning the byte ranges of objects that closed.
    fn scan_new_bytes(&mut self) -> Result<Vec<(usize, usize)>, SnapshotError> {
        let mut complete = Vec::new();
        let s = &mut self.scan;

        for i in s.pos..self.buffer.len() {
            let b = self.buffer[i];

            if s.in_string {
                if s.escaped {
                    s.escaped = false;
                } else if b == b'\\' {
                    s.escaped = true;
                } else if b == b'"' {
                    s.in_string = false;
                }
                continue;
            }

            if s.depth > 0 {
                match b {
                    b'"' => s.in_string = true,
                    b'{' => s.depth += 1,
                    b'}' => {
                        s.depth -= 1;
                        if s.depth == 0 {
                            if let Some(start) = s.object_start.take() {
                                complete.push((start, i + 1));
                            }
                        }
                    }
                    _ => {}
                }
                continue;
            }

            match b {
                b'{' if s.opened && !s.closed => {
                    s.depth = 1;
                    s.object_start = Some(i);
                }
                b'[' if !s.opened => s.opened = true,
                b']' if s.opened && !s.closed => s.closed = true,
                b',' | b' ' | b'\n' | b'\r' | b'\t' => {}
                other => {
                    return Err(SnapshotError::corrupt(
                        self.name.clone(),
                        format!(
                            "unexpected byte {:?} at offset {}",
                            other as char,
                            self.bytes_read as usize - (self.buffer.len() - i)
                        ),
                    ));
                }
            }
        }

        s.pos = self.buffer.len();
        Ok(complete)
    }

    /// Parses completed objects and drops everything before the first unfinished one.
    fn take_complete(&mut self, ranges: Vec<(usize, usize)>) -> Result<(), SnapshotError> {
        for (start, end) in ranges {
            let entry = serde_json::from_slice::<T>(&self.buffer[start..end]).map_err(|e| {
                SnapshotError::corrupt(
                    self.name.clone(),
                    format!("entry {}: {}", self.entries_read, e),
                )
            })?;
            self.pending.push_back(entry);
            self.entries_read += 1;
        }

        let keep_from = self.scan.object_start.unwrap_or(self.buffer.len());
        self.buffer.drain(..keep_from);
        self.scan.pos = self.buffer.len();
        if self.scan.object_start.is_some() {
            self.scan.object_start = Some(0);
        }
        Ok(())
    }

    fn check_end_of_stream(&self) -> Result<(), SnapshotError> {
        if self.scan.depth > 0 || self.scan.in_string {
            return Err(SnapshotError::corrupt(
                self.name.clone(),
                format!(
                    "truncated after {} entries: {} bytes of an unterminated object",
                    self.entries_read,
                    self.buffer.len()
                ),
            ));
        }
        if !self.scan.opened {
            return Err(SnapshotError::corrupt(self.name.clone(), "not a JSON array"));
        }
        if !self.scan.closed {
            return Err(SnapshotError::corrupt(
                self.name.clone(),
                format!("truncated after {} entries: missing ']'", self.entries_read),
            ));
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<bool, SnapshotError> {
        let n = self.read_chunk()?;
        if n == 0 {
            self.check_end_of_stream()?;
            return Ok(false);
        }
        self.bytes_read += n as u64;
        let ranges = self.scan_new_bytes()?;
        self.take_complete(ranges)?;
        if let Some(callback) = self.on_chunk.as_mut() {
            callback(self.bytes_read, self.entries_read);
        }
        Ok(true)
    }

    /// Drains the whole stream into a vector.
    pub fn read_all(self) -> Result<Vec<T>, SnapshotError> {
        self.collect()
    }
}

impl<R: Read + Seek, T: DeserializeOwned> ArrayReader<R, T> {
    /// Restarts the sequence from the first entry.
    pub fn rewind(&mut self) -> Result<(), SnapshotError> {
        self.reader.seek(SeekFrom::Start(0))?;
        self.buffer.clear();
        self.scan = ScanState::default();
        self.pending.clear();
        self.bytes_read = 0;
        self.entries_read = 0;
        self.finished = false;
        Ok(())
    }
}

impl<R: Read, T: DeserializeOwned> Iterator for ArrayReader<R, T> {
    type Item = Result<T, SnapshotError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            if self.finished {
                return None;
            }
            match self.advance() {
                Ok(true) => {}
                Ok(false) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Reads a whole JSON array file, reporting progress per chunk.
pub fn read_array<T, F>(
    path: &Path,
    chunk_size: usize,
    on_chunk: F,
) -> Result<Vec<T>, SnapshotError>
where
    T: DeserializeOwned,
    F: FnMut(u64, u64) + Send + 'static,
{
    ArrayReader::<File, T>::open(path, chunk_size)?
        .on_chunk(on_chunk)
        .read_all()
}

/// Appends serialized entries to a JSON array file.
///
/// The array is only syntactically complete after [`ArrayWriter::finish`].
#[derive(Debug)]
pub struct ArrayWriter {
    path: PathBuf,
    file: BufWriter<File>,
    needs_comma: bool,
    written: u64,
}

impl ArrayWriter {
    /// Creates (or truncates) `path` and opens a new array.
    pub fn create(path: &Path) -> Result<Self, SnapshotError> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(b"[\n")?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            needs_comma: false,
            written: 0,
        })
    }

    /// Continues an array left open by an earlier writer, or starts one.
    pub fn append_to(path: &Path) -> Result<Self, SnapshotError> {
        let mut existing = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::create(path),
            Err(e) => return Err(e.into()),
        };
        let mut content = Vec::new();
        existing.read_to_end(&mut content)?;
        let last = content.iter().rev().find(|b| !b.is_ascii_whitespace()).copied();

        let needs_comma = match last {
            None => return Self::create(path),
            Some(b'[') => false,
            Some(b'}') => true,
            Some(b']') => {
                return Err(SnapshotError::corrupt(
                    path.display().to_string(),
                    "array is already closed",
                ))
            }
            Some(other) => {
                return Err(SnapshotError::corrupt(
                    path.display().to_string(),
                    format!("cannot append after {:?}", other as char),
                ))
            }
        };

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            needs_comma,
            written: 0,
        })
    }

    /// Appends `entries` in order.
    pub fn write_all<T: Serialize>(&mut self, entries: &[T]) -> Result<(), SnapshotError> {
        for entry in entries {
            if self.needs_comma {
                self.file.write_all(b",\n")?;
            }
            serde_json::to_writer(&mut self.file, entry)?;
            self.needs_comma = true;
            self.written += 1;
        }
        Ok(())
    }

    /// Flushes buffered bytes without closing the array.
    pub fn flush(&mut self) -> Result<(), SnapshotError> {
        self.file.flush()?;
        Ok(())
    }

    /// Entries written through this writer.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the array and syncs it to disk.
    pub fn finish(mut self) -> Result<u64, SnapshotError> {
        self.file.write_all(b"\n]\n")?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(self.written)
    }
}

/// Writes `entries` as a complete array file.
pub fn write_array<T: Serialize>(path: &Path, entries: &[T]) -> Result<u64, SnapshotError> {
    let mut writer = ArrayWriter::create(path)?;
    writer.write_all(entries)?;
    writer.finish()
}

/// Counts bytes written through it; used to size buffers without allocating.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteCounter(pub usize);

impl Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serialized size of one entry in bytes.
pub fn serialized_len<T: Serialize>(entry: &T) -> Result<usize, SnapshotError> {
    let mut counter = ByteCounter::default();
    serde_json::to_writer(&mut counter, entry)?;
    Ok(counter.0)
}
