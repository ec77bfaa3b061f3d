// log_file.rs
// File-backed log sink.
//
// Record layout (little-endian):
// ┌────────────┬────────────┬───────────┐
// │ u32 len    │ u32 crc32  │ payload…  │
// └────────────┴────────────┴───────────┘
// - `len`    : number of bytes in payload
// - `crc32`  : checksum of payload for corruption detection
//
// A record cut short at the end of the file (a torn write from a crash) ends the
// log. A checksum mismatch anywhere is reported as corruption.
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;

use super::LogSink;
use crate::error::{StorageResult, WalError};

const HEADER_SIZE: usize = 8; // 4 bytes length + 4 bytes crc32

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn encode(payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(&checksum(payload).to_le_bytes());
    data.extend_from_slice(payload);
    data
}

/// Append-only log file.
pub struct FileLogSink {
    file: BufWriter<File>,
    path: PathBuf,
}

impl FileLogSink {
    /// Open existing log or create a new one at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).map_err(WalError::Io)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .read(true)
            .open(&path)
            .map_err(WalError::Io)?;

        // Cut a torn tail so later appends stay reachable.
        let mut records = LogFileIter::new(file.try_clone().map_err(WalError::Io)?);
        let intact = records.by_ref().all(|record| record.is_ok());
        let file_len = file.metadata().map_err(WalError::Io)?.len();
        if intact && file_len > records.valid_len {
            tracing::warn!(
                file_len,
                valid_len = records.valid_len,
                "truncating torn log tail"
            );
            file.set_len(records.valid_len).map_err(WalError::Io)?;
        }
        file.seek(SeekFrom::End(0)).map_err(WalError::Io)?;

        Ok(Self {
            file: BufWriter::new(file),
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lazily read records from the start of the file.
    pub fn iter(&self) -> StorageResult<LogFileIter> {
        let reader = File::open(&self.path).map_err(WalError::Io)?;
        Ok(LogFileIter::new(reader))
    }
}

impl LogSink for FileLogSink {
    /// Buffer one framed record. If the write fails, the file is truncated back
    /// to where the record started so no partial record is left behind.
    fn append(&mut self, payload: &[u8]) -> StorageResult<u64> {
        let original_pos = self.file.stream_position().map_err(WalError::Io)?;

        if let Err(e) = self.file.write_all(&encode(payload)) {
            self.file
                .seek(SeekFrom::Start(original_pos))
                .map_err(WalError::Io)?;
            self.file
                .get_ref()
                .set_len(original_pos)
                .map_err(WalError::Io)?;
            return Err(WalError::Io(e).into());
        }
        Ok(original_pos)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.flush().map_err(WalError::Io)?;
        self.file.get_ref().sync_data().map_err(WalError::Io)?;
        Ok(())
    }

    fn read_all(&self) -> StorageResult<Vec<Vec<u8>>> {
        self.iter()?.collect()
    }

    /// Write `payloads` to a sibling file and rename it over the log.
    fn rewrite(&mut self, payloads: &[Vec<u8>]) -> StorageResult<()> {
        self.flush()?;
        let tmp_path = self.path.with_extension("rewrite");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path).map_err(WalError::Io)?);
            for payload in payloads {
                tmp.write_all(&encode(payload)).map_err(WalError::Io)?;
            }
            tmp.flush().map_err(WalError::Io)?;
            tmp.get_ref().sync_data().map_err(WalError::Io)?;
        }
        fs::rename(&tmp_path, &self.path).map_err(WalError::Io)?;
        *self = Self::open(&self.path)?;
        Ok(())
    }
}

/// Iterator over the payloads of a log file.
pub struct LogFileIter {
    reader: BufReader<File>,
    done: bool,
    /// Bytes covered by the complete records read so far.
    valid_len: u64,
}

impl LogFileIter {
    fn new(mut file: File) -> Self {
        let done = file.seek(SeekFrom::Start(0)).is_err();
        Self {
            reader: BufReader::new(file),
            done,
            valid_len: 0,
        }
    }

    fn read_record(&mut self) -> StorageResult<Option<Vec<u8>>> {
        let mut header = [0u8; HEADER_SIZE];
        if let Err(e) = self.reader.read_exact(&mut header) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(WalError::Io(e).into());
        }
        let [l0, l1, l2, l3, c0, c1, c2, c3] = header;
        let len = u32::from_le_bytes([l0, l1, l2, l3]) as usize;
        let expected = u32::from_le_bytes([c0, c1, c2, c3]);

        let mut payload = vec![0u8; len];
        if let Err(e) = self.reader.read_exact(&mut payload) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                tracing::warn!(len, "ignoring torn record at end of log");
                return Ok(None);
            }
            return Err(WalError::Io(e).into());
        }
        if checksum(&payload) != expected {
            return Err(WalError::ChecksumMismatch.into());
        }
        self.valid_len += (HEADER_SIZE + len) as u64;
        Ok(Some(payload))
    }
}

impl Iterator for LogFileIter {
    type Item = StorageResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(payload)) => Some(Ok(payload)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use temp_dir::TempDir;

    use super::*;
    use crate::error::StorageError;

    #[test]
    fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ember.wal");
        {
            let mut sink = FileLogSink::open(&path).unwrap();
            assert_eq!(sink.append(b"first").unwrap(), 0);
            assert_eq!(sink.append(b"second").unwrap(), (HEADER_SIZE + 5) as u64);
            sink.flush().unwrap();
        }

        let mut sink = FileLogSink::open(&path).unwrap();
        sink.append(b"third").unwrap();
        sink.flush().unwrap();
        let records = sink.read_all().unwrap();
        assert_eq!(records, vec![
            b"first".to_vec(),
            b"second".to_vec(),
            b"third".to_vec()
        ]);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ember.wal");
        let mut sink = FileLogSink::open(&path).unwrap();
        sink.append(b"complete").unwrap();
        sink.append(b"torn-record").unwrap();
        sink.flush().unwrap();

        let full = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(full - 3)
            .unwrap();

        let mut sink = FileLogSink::open(&path).unwrap();
        assert_eq!(sink.read_all().unwrap(), vec![b"complete".to_vec()]);

        // Records appended after the torn tail was cut are readable.
        sink.append(b"after").unwrap();
        sink.flush().unwrap();
        let records = FileLogSink::open(&path).unwrap().read_all().unwrap();
        assert_eq!(records, vec![b"complete".to_vec(), b"after".to_vec()]);
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ember.wal");
        let mut sink = FileLogSink::open(&path).unwrap();
        sink.append(b"payload").unwrap();
        sink.flush().unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let err = FileLogSink::open(&path).unwrap().read_all().unwrap_err();
        assert!(matches!(err, StorageError::Wal(WalError::ChecksumMismatch)));
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ember.wal");
        let mut sink = FileLogSink::open(&path).unwrap();
        for payload in [b"a", b"b", b"c"] {
            sink.append(payload).unwrap();
        }
        sink.rewrite(&[b"c".to_vec()]).unwrap();
        sink.append(b"d").unwrap();
        sink.flush().unwrap();

        assert_eq!(sink.read_all().unwrap(), vec![b"c".to_vec(), b"d".to_vec()]);
    }
}
