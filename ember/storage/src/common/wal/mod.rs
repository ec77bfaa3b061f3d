pub mod log_file;
pub mod redo;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StorageResult;

/// Trait for records that can be stored in a write-ahead log
pub trait LogRecord: Clone + std::fmt::Debug {
    /// Convert the record to bytes for storage
    fn to_bytes(&self) -> StorageResult<Vec<u8>>;

    /// Create a record from bytes
    fn from_bytes(bytes: Vec<u8>) -> StorageResult<Self>
    where
        Self: Sized;
}

/// Byte-level write-ahead log sink.
///
/// A sink stores opaque record payloads in append order. It knows nothing about
/// transactions; record encoding lives in [`redo`].
pub trait LogSink: Send {
    /// Append one record payload and return the offset it was written at.
    fn append(&mut self, payload: &[u8]) -> StorageResult<u64>;

    /// Durability barrier. Every record appended before the call survives a crash
    /// once it returns.
    fn flush(&mut self) -> StorageResult<()>;

    /// Every payload in the log, oldest first.
    fn read_all(&self) -> StorageResult<Vec<Vec<u8>>>;

    /// Replace the whole log with `payloads`.
    fn rewrite(&mut self, payloads: &[Vec<u8>]) -> StorageResult<()>;
}

/// Log sink kept in process memory. Clones share the same record list.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogSink {
    records: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl LogSink for MemoryLogSink {
    fn append(&mut self, payload: &[u8]) -> StorageResult<u64> {
        let mut records = self.records.lock();
        records.push(payload.to_vec());
        Ok((records.len() - 1) as u64)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn read_all(&self) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self.records.lock().clone())
    }

    fn rewrite(&mut self, payloads: &[Vec<u8>]) -> StorageResult<()> {
        *self.records.lock() = payloads.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_shares_records() {
        let sink = MemoryLogSink::new();
        let mut writer = sink.clone();
        assert_eq!(writer.append(b"a").unwrap(), 0);
        assert_eq!(writer.append(b"bc").unwrap(), 1);
        writer.flush().unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.read_all().unwrap(), vec![b"a".to_vec(), b"bc".to_vec()]);

        writer.rewrite(&[b"z".to_vec()]).unwrap();
        assert_eq!(sink.read_all().unwrap(), vec![b"z".to_vec()]);
    }
}
