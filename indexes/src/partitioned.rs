use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use reqwest::Client as ReqwestClient;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::byte_range::{
    ByteRangeSource, FileByteRangeSource, HttpByteRangeSource, LargeObjectByteRangeSource,
    LargeObjectSource,
};
use crate::caching::CachingByteRangeSource;
use crate::cdb64::{Cdb64Error, Cdb64Reader, Cdb64Writer};
use crate::manifest::{
    partition_prefix_byte, Cdb64Manifest, PartitionInfo, PartitionLocation, MANIFEST_FILE_NAME,
    MANIFEST_VERSION,
};

const NUM_PARTITIONS: usize = 256;

enum PartitionSlot {
    /// No partition exists for this prefix, or opening it failed.
    Absent,
    /// The manifest lists a partition but nothing has touched it yet.
    Unopened(PartitionInfo),
    Open(Arc<Cdb64Reader>),
}

/// Everything the reader needs to materialize partitions on demand.
#[derive(Default)]
pub struct PartitionedCdb64ReaderOptions {
    /// Directory `file` locations are resolved against.
    pub base_dir: Option<PathBuf>,
    /// Client used for `http` locations.
    pub http_client: Option<ReqwestClient>,
    /// Source used for `arweave-id` and `arweave-byte-range` locations.
    pub large_object_source: Option<Arc<dyn LargeObjectSource>>,
}

/// A logical CDB64 split 256 ways by first key byte. Partitions open lazily
/// on first probe; concurrent opens of the same slot coalesce behind a
/// per-slot async mutex so exactly one open runs.
pub struct PartitionedCdb64Reader {
    slots: Vec<Mutex<PartitionSlot>>,
    /// Manifest state per slot, used to restore slots on close.
    partitions: Vec<Option<PartitionInfo>>,
    options: PartitionedCdb64ReaderOptions,
    open_count: AtomicUsize,
}

impl PartitionedCdb64Reader {
    /// Builds the slot table from a validated manifest.
    pub fn new(
        manifest: &Cdb64Manifest,
        options: PartitionedCdb64ReaderOptions,
    ) -> Result<Self, Cdb64Error> {
        manifest.validate()?;
        let mut partitions: Vec<Option<PartitionInfo>> =
            (0..NUM_PARTITIONS).map(|_| None).collect();
        for partition in &manifest.partitions {
            let prefix = partition_prefix_byte(&partition.prefix)?;
            partitions[prefix as usize] = Some(partition.clone());
        }
        let slots = partitions
            .iter()
            .map(|partition| {
                Mutex::new(match partition {
                    Some(info) => PartitionSlot::Unopened(info.clone()),
                    None => PartitionSlot::Absent,
                })
            })
            .collect();
        Ok(Self {
            slots,
            partitions,
            options,
            open_count: AtomicUsize::new(0),
        })
    }

    /// Reads and parses `manifest.json` from `base_dir`, which also becomes
    /// the resolution root for `file` locations.
    pub async fn open_dir(
        base_dir: impl AsRef<Path>,
        mut options: PartitionedCdb64ReaderOptions,
    ) -> Result<Self, Cdb64Error> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let manifest_path = base_dir.join(MANIFEST_FILE_NAME);
        let bytes = fs::read(&manifest_path).await?;
        let manifest: Cdb64Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| Cdb64Error::Manifest(format!("{manifest_path:?}: {e}")))?;
        options.base_dir.get_or_insert(base_dir);
        Self::new(&manifest, options)
    }

    /// Looks `key` up in its partition. Missing partitions answer without
    /// any I/O; a partition whose open fails for a non-configuration reason
    /// is marked absent and treated as a miss from then on.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Cdb64Error> {
        if key.is_empty() {
            return Err(Cdb64Error::InvalidKey);
        }

        let slot_index = key[0] as usize;
        let mut slot = self.slots[slot_index].lock().await;

        let reader = match std::mem::replace(&mut *slot, PartitionSlot::Absent) {
            PartitionSlot::Absent => return Ok(None),
            PartitionSlot::Open(reader) => {
                *slot = PartitionSlot::Open(Arc::clone(&reader));
                reader
            }
            PartitionSlot::Unopened(info) => match self.open_partition(&info).await {
                Ok(reader) => {
                    let reader = Arc::new(reader);
                    *slot = PartitionSlot::Open(Arc::clone(&reader));
                    self.open_count.fetch_add(1, Ordering::SeqCst);
                    reader
                }
                Err(err @ Cdb64Error::Config(_)) => {
                    // Configuration errors propagate and must not demote
                    // the slot; the partition may open fine once wired.
                    *slot = PartitionSlot::Unopened(info);
                    return Err(err);
                }
                Err(err) => {
                    debug!(prefix = %info.prefix, error = %err, "partition open failed");
                    return Ok(None);
                }
            },
        };
        drop(slot);

        match reader.get(key).await {
            Ok(value) => Ok(value),
            Err(err) => {
                debug!(prefix = slot_index, error = %err, "partition get failed");
                Ok(None)
            }
        }
    }

    async fn open_partition(&self, info: &PartitionInfo) -> Result<Cdb64Reader, Cdb64Error> {
        let source: Arc<dyn ByteRangeSource> = match &info.location {
            PartitionLocation::File { filename } => {
                let base_dir = self.options.base_dir.as_ref().ok_or_else(|| {
                    Cdb64Error::Config("file partition locations need a base_dir".into())
                })?;
                Arc::new(FileByteRangeSource::open(base_dir.join(filename)).await?)
            }
            PartitionLocation::Http { url } => {
                let client = self.options.http_client.clone().unwrap_or_default();
                Arc::new(HttpByteRangeSource::new(client, url.clone()))
            }
            PartitionLocation::ArweaveId { id } => {
                let source = self.large_object_source()?;
                Arc::new(LargeObjectByteRangeSource::new(source, *id, 0))
            }
            PartitionLocation::ArweaveByteRange {
                root_tx_id,
                data_offset_in_root_tx,
            } => {
                let source = self.large_object_source()?;
                Arc::new(LargeObjectByteRangeSource::new(
                    source,
                    *root_tx_id,
                    *data_offset_in_root_tx,
                ))
            }
        };

        // The caching wrapper pins the partition's 4 KiB header.
        let caching = CachingByteRangeSource::new(source, true);
        Cdb64Reader::open(Arc::new(caching)).await
    }

    fn large_object_source(&self) -> Result<Arc<dyn LargeObjectSource>, Cdb64Error> {
        self.options
            .large_object_source
            .clone()
            .ok_or_else(|| {
                Cdb64Error::Config(
                    "arweave partition locations need a large object source".into(),
                )
            })
    }

    pub fn open_partition_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Closes every open partition and resets each slot to its manifest
    /// state, so a later `get` re-opens cleanly.
    pub async fn close(&self) -> Result<(), Cdb64Error> {
        for (index, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock().await;
            if let PartitionSlot::Open(reader) = &*slot {
                reader.close().await?;
            }
            *slot = match &self.partitions[index] {
                Some(info) => PartitionSlot::Unopened(info.clone()),
                None => PartitionSlot::Absent,
            };
        }
        self.open_count.store(0, Ordering::SeqCst);
        Ok(())
    }
}

//==============================================================================
// Writer
//------------------------------------------------------------------------------

/// Routes each record to a per-partition [`Cdb64Writer`] created lazily in a
/// temp directory; `finalize` renames the temp directory onto the target
/// atomically and emits the manifest.
pub struct PartitionedCdb64Writer {
    temp_dir: PathBuf,
    target_dir: PathBuf,
    writers: Vec<Option<Cdb64Writer>>,
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl PartitionedCdb64Writer {
    pub async fn create(target_dir: impl AsRef<Path>) -> Result<Self, Cdb64Error> {
        let target_dir = target_dir.as_ref().to_path_buf();
        let file_name = target_dir
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Cdb64Error::Config("target dir has no name".into()))?;
        let temp_dir = target_dir.with_file_name(format!("{file_name}.tmp"));
        fs::create_dir_all(&temp_dir).await?;
        Ok(Self {
            temp_dir,
            target_dir,
            writers: (0..NUM_PARTITIONS).map(|_| None).collect(),
            metadata: None,
        })
    }

    pub fn set_metadata(
        &mut self,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) {
        self.metadata = Some(metadata);
    }

    pub async fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), Cdb64Error> {
        if key.is_empty() {
            return Err(Cdb64Error::InvalidKey);
        }
        let index = key[0] as usize;
        if self.writers[index].is_none() {
            let path = self.temp_dir.join(format!("{:02x}.cdb", key[0]));
            self.writers[index] = Some(Cdb64Writer::create(path).await?);
        }
        self.writers[index]
            .as_mut()
            .expect("writer was just created")
            .add(key, value)
            .await
    }

    /// Finalizes every partition, writes the manifest, and renames the temp
    /// directory onto the target. Only `file` locations are emitted;
    /// uploading partitions to remote storage is an external post-step.
    pub async fn finalize(self) -> Result<Cdb64Manifest, Cdb64Error> {
        let mut partitions = Vec::new();
        let mut total_records = 0u64;

        for (index, writer) in self.writers.into_iter().enumerate() {
            let Some(writer) = writer else { continue };
            let record_count = writer.record_count();
            writer.finalize().await?;

            let filename = format!("{index:02x}.cdb");
            let size = fs::metadata(self.temp_dir.join(&filename)).await?.len();
            total_records += record_count;
            partitions.push(PartitionInfo {
                prefix: format!("{index:02x}"),
                location: PartitionLocation::File { filename },
                record_count,
                size,
            });
        }

        let manifest = Cdb64Manifest {
            version: MANIFEST_VERSION,
            created_at: Utc::now(),
            total_records,
            metadata: self.metadata,
            partitions,
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Cdb64Error::Manifest(e.to_string()))?;
        fs::write(self.temp_dir.join(MANIFEST_FILE_NAME), json).await?;

        if fs::metadata(&self.target_dir).await.is_ok() {
            return Err(Cdb64Error::Config(format!(
                "target directory {:?} already exists",
                self.target_dir
            )));
        }
        fs::rename(&self.temp_dir, &self.target_dir).await?;
        Ok(manifest)
    }

    pub async fn abort(self) -> Result<(), Cdb64Error> {
        for writer in self.writers.into_iter().flatten() {
            writer.abort().await?;
        }
        match fs::remove_dir_all(&self.temp_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
