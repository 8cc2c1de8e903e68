use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_stream::try_stream;
use futures::Stream;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::byte_range::{ByteRangeError, ByteRangeSource};

/// 256 × (table_offset: u64 LE, num_slots: u64 LE).
pub const HEADER_SIZE: u64 = 4096;
pub const NUM_BUCKETS: usize = 256;
const SLOT_SIZE: u64 = 16;
const RECORD_HEADER_SIZE: u64 = 8;

#[derive(Debug, Error)]
pub enum Cdb64Error {
    #[error("empty keys are not permitted")]
    InvalidKey,
    #[error("cdb64 file is corrupt: {0}")]
    Corruption(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    ByteRange(#[from] ByteRangeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest error: {0}")]
    Manifest(String),
}

/// The djb2 hash (×33 plus byte), widened to 64 bits. The zero hash is
/// reserved to mark empty slots; keys hashing to 0 are stored under 1.
pub fn djb2(key: &[u8]) -> u64 {
    key.iter().fold(5381u64, |hash, byte| {
        hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(*byte as u64)
    })
}

fn stored_hash(key: &[u8]) -> (usize, u64) {
    let hash = djb2(key);
    let bucket = (hash % NUM_BUCKETS as u64) as usize;
    (bucket, if hash == 0 { 1 } else { hash })
}

//==============================================================================
// Writer
//------------------------------------------------------------------------------

/// Streams records into a temp file and lays down the header and bucket
/// tables on finalize, renaming the temp file into place atomically.
/// Single-producer; the file must not be read until finalize returns.
pub struct Cdb64Writer {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    buckets: Vec<Vec<(u64, u64)>>,
    position: u64,
    record_count: u64,
}

impl Cdb64Writer {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, Cdb64Error> {
        let final_path = path.as_ref().to_path_buf();
        let temp_path = final_path.with_extension("cdb.tmp");
        let mut file = fs::File::create(&temp_path).await?;
        // The header is rewritten in place on finalize.
        file.write_all(&[0u8; HEADER_SIZE as usize]).await?;
        Ok(Self {
            file,
            temp_path,
            final_path,
            buckets: vec![Vec::new(); NUM_BUCKETS],
            position: HEADER_SIZE,
            record_count: 0,
        })
    }

    pub async fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), Cdb64Error> {
        if key.is_empty() {
            return Err(Cdb64Error::InvalidKey);
        }
        let (bucket, hash) = stored_hash(key);
        self.buckets[bucket].push((hash, self.position));

        self.file
            .write_all(&(key.len() as u32).to_le_bytes())
            .await?;
        self.file
            .write_all(&(value.len() as u32).to_le_bytes())
            .await?;
        self.file.write_all(key).await?;
        self.file.write_all(value).await?;
        self.position += RECORD_HEADER_SIZE + key.len() as u64 + value.len() as u64;
        self.record_count += 1;
        Ok(())
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Writes all bucket tables and the final header, then renames the temp
    /// file onto the target path.
    pub async fn finalize(mut self) -> Result<(), Cdb64Error> {
        let mut header = Vec::with_capacity(HEADER_SIZE as usize);

        for bucket in &self.buckets {
            let table_offset = self.position;
            let num_slots = (bucket.len() as u64 * 2).next_power_of_two().max(2);

            let mut slots = vec![(0u64, 0u64); num_slots as usize];
            for &(hash, record_offset) in bucket {
                let mut slot = ((hash / NUM_BUCKETS as u64) % num_slots) as usize;
                while slots[slot].1 != 0 {
                    slot = (slot + 1) % num_slots as usize;
                }
                slots[slot] = (hash, record_offset);
            }

            let mut table = Vec::with_capacity((num_slots * SLOT_SIZE) as usize);
            for (hash, record_offset) in slots {
                table.extend_from_slice(&hash.to_le_bytes());
                table.extend_from_slice(&record_offset.to_le_bytes());
            }
            self.file.write_all(&table).await?;
            self.position += num_slots * SLOT_SIZE;

            header.extend_from_slice(&table_offset.to_le_bytes());
            header.extend_from_slice(&num_slots.to_le_bytes());
        }

        self.file.seek(std::io::SeekFrom::Start(0)).await?;
        self.file.write_all(&header).await?;
        self.file.flush().await?;
        self.file.sync_all().await?;

        fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(())
    }

    /// Drops the temp file without producing an index.
    pub async fn abort(self) -> Result<(), Cdb64Error> {
        drop(self.file);
        match fs::remove_file(&self.temp_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

//==============================================================================
// Reader
//------------------------------------------------------------------------------

/// Point lookups and iteration over a finalized CDB64, generic over where
/// the bytes live. The header is read once at open; each `get` costs one
/// ranged read for the bucket table and one or two for the record.
pub struct Cdb64Reader {
    source: Arc<dyn ByteRangeSource>,
    tables: [(u64, u64); NUM_BUCKETS],
}

impl Cdb64Reader {
    pub async fn open(source: Arc<dyn ByteRangeSource>) -> Result<Self, Cdb64Error> {
        let header = source.read(0, HEADER_SIZE).await.map_err(read_as_corruption)?;

        let mut tables = [(0u64, 0u64); NUM_BUCKETS];
        for (i, table) in tables.iter_mut().enumerate() {
            let base = i * 16;
            let table_offset = u64::from_le_bytes(header[base..base + 8].try_into().unwrap());
            let num_slots = u64::from_le_bytes(header[base + 8..base + 16].try_into().unwrap());
            if table_offset < HEADER_SIZE || num_slots == 0 {
                return Err(Cdb64Error::Corruption(format!(
                    "bucket {i} header entry is invalid (offset {table_offset}, slots {num_slots})"
                )));
            }
            *table = (table_offset, num_slots);
        }

        Ok(Self { source, tables })
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Cdb64Error> {
        if key.is_empty() {
            return Err(Cdb64Error::InvalidKey);
        }
        let (bucket, hash) = stored_hash(key);
        let (table_offset, num_slots) = self.tables[bucket];

        // One ranged read for the whole bucket table, probed in memory.
        let table = self
            .source
            .read(table_offset, num_slots * SLOT_SIZE)
            .await
            .map_err(read_as_corruption)?;

        let start = ((hash / NUM_BUCKETS as u64) % num_slots) as usize;
        for i in 0..num_slots as usize {
            let slot = (start + i) % num_slots as usize;
            let base = slot * SLOT_SIZE as usize;
            let slot_hash = u64::from_le_bytes(table[base..base + 8].try_into().unwrap());
            let record_offset =
                u64::from_le_bytes(table[base + 8..base + 16].try_into().unwrap());

            if record_offset == 0 {
                return Ok(None);
            }
            if slot_hash != hash {
                continue;
            }

            // Hash matches; confirm by re-reading the record's key.
            let (record_key, value) = self.read_record(record_offset).await?;
            if record_key == key {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    async fn read_record(&self, offset: u64) -> Result<(Vec<u8>, Vec<u8>), Cdb64Error> {
        let header = self
            .source
            .read(offset, RECORD_HEADER_SIZE)
            .await
            .map_err(read_as_corruption)?;
        let key_len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
        let value_len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as u64;
        if key_len == 0 {
            return Err(Cdb64Error::Corruption(format!(
                "record at {offset} has an empty key"
            )));
        }

        let body = self
            .source
            .read(offset + RECORD_HEADER_SIZE, key_len + value_len)
            .await
            .map_err(read_as_corruption)?;
        let (key, value) = body.split_at(key_len as usize);
        Ok((key.to_vec(), value.to_vec()))
    }

    /// Yields `(key, value)` pairs in storage order via sequential ranged
    /// reads of the record section.
    pub fn entries(&self) -> impl Stream<Item = Result<(Vec<u8>, Vec<u8>), Cdb64Error>> + '_ {
        // The record section ends where the first bucket table begins.
        let records_end = self
            .tables
            .iter()
            .map(|(offset, _)| *offset)
            .min()
            .unwrap_or(HEADER_SIZE);

        try_stream! {
            let mut position = HEADER_SIZE;
            while position < records_end {
                let (key, value) = self.read_record(position).await?;
                position += RECORD_HEADER_SIZE + key.len() as u64 + value.len() as u64;
                yield (key, value);
            }
        }
    }

    pub async fn close(&self) -> Result<(), Cdb64Error> {
        self.source.close().await?;
        Ok(())
    }
}

fn read_as_corruption(err: ByteRangeError) -> Cdb64Error {
    match err {
        ByteRangeError::ShortRead { offset, wanted, .. } => Cdb64Error::Corruption(format!(
            "read of {wanted} bytes at {offset} ran past the end of the index"
        )),
        other => Cdb64Error::ByteRange(other),
    }
}
