use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arweave_gateway_types::H256;
use async_trait::async_trait;
use reqwest::{header, Client as ReqwestClient, StatusCode};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ByteRangeError {
    #[error("source is closed")]
    Closed,
    #[error("short read: wanted {wanted} bytes at offset {offset}, got {got}")]
    ShortRead { offset: u64, wanted: u64, got: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("range request to {url} returned status {status}")]
    UnexpectedStatus { url: String, status: u16 },
    #[error("timed out waiting for a request slot")]
    SlotTimeout,
    #[error("large object source error: {0}")]
    LargeObject(String),
}

/// Uniform positioned-read access to a byte addressable resource.
///
/// `read` must return exactly `size` bytes or fail; short reads at the tail
/// of a resource are an error, not a truncated success. Implementations are
/// safe for concurrent `read` calls.
#[async_trait]
pub trait ByteRangeSource: Send + Sync {
    async fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>, ByteRangeError>;

    async fn close(&self) -> Result<(), ByteRangeError>;

    fn is_open(&self) -> bool;
}

//==============================================================================
// File source
//------------------------------------------------------------------------------

/// Reads byte ranges from a local file using positioned reads, so concurrent
/// callers never race on a shared cursor.
pub struct FileByteRangeSource {
    file: Arc<std::fs::File>,
    path: PathBuf,
    open: AtomicBool,
}

impl FileByteRangeSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ByteRangeError> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let file = tokio::task::spawn_blocking(move || std::fs::File::open(open_path))
            .await
            .map_err(|e| ByteRangeError::Io(std::io::Error::other(e)))??;
        Ok(Self {
            file: Arc::new(file),
            path,
            open: AtomicBool::new(true),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ByteRangeSource for FileByteRangeSource {
    async fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>, ByteRangeError> {
        if !self.is_open() {
            return Err(ByteRangeError::Closed);
        }
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            use std::os::unix::fs::FileExt;
            let mut buf = vec![0u8; size as usize];
            match file.read_exact_at(&mut buf, offset) {
                Ok(()) => Ok(buf),
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    Err(ByteRangeError::ShortRead {
                        offset,
                        wanted: size,
                        got: 0,
                    })
                }
                Err(err) => Err(ByteRangeError::Io(err)),
            }
        })
        .await
        .map_err(|e| ByteRangeError::Io(std::io::Error::other(e)))?
    }

    async fn close(&self) -> Result<(), ByteRangeError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

//==============================================================================
// HTTP source
//------------------------------------------------------------------------------

/// Reads byte ranges with `Range: bytes=` requests. Retries 429 and 5xx
/// responses with bounded exponential backoff, and requires a 206 with the
/// exact requested length.
pub struct HttpByteRangeSource {
    client: ReqwestClient,
    url: String,
    max_retries: u32,
    retry_base_delay: Duration,
    request_timeout: Duration,
    slots: Option<Arc<tokio::sync::Semaphore>>,
    slot_timeout: Duration,
    open: AtomicBool,
}

impl HttpByteRangeSource {
    pub fn new(client: ReqwestClient, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(250),
            request_timeout: Duration::from_secs(30),
            slots: None,
            slot_timeout: Duration::from_secs(10),
            open: AtomicBool::new(true),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    /// Bounds the number of in-flight range requests across clones of the
    /// semaphore; acquisition waits at most `timeout`.
    pub fn with_request_slots(
        mut self,
        slots: Arc<tokio::sync::Semaphore>,
        timeout: Duration,
    ) -> Self {
        self.slots = Some(slots);
        self.slot_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn should_retry(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }
}

#[async_trait]
impl ByteRangeSource for HttpByteRangeSource {
    async fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>, ByteRangeError> {
        if !self.is_open() {
            return Err(ByteRangeError::Closed);
        }

        let _permit = match &self.slots {
            Some(slots) => Some(
                tokio::time::timeout(self.slot_timeout, Arc::clone(slots).acquire_owned())
                    .await
                    .map_err(|_| ByteRangeError::SlotTimeout)?
                    .map_err(|_| ByteRangeError::Closed)?,
            ),
            None => None,
        };

        let range = format!("bytes={}-{}", offset, offset + size - 1);
        let mut retry_count = 0;
        loop {
            let result = self
                .client
                .get(&self.url)
                .header(header::RANGE, &range)
                .timeout(self.request_timeout)
                .send()
                .await;

            match result {
                Ok(res) if res.status() == StatusCode::PARTIAL_CONTENT => {
                    let body = res.bytes().await?;
                    if body.len() as u64 != size {
                        return Err(ByteRangeError::ShortRead {
                            offset,
                            wanted: size,
                            got: body.len() as u64,
                        });
                    }
                    return Ok(body.to_vec());
                }
                Ok(res) if Self::should_retry(res.status()) && retry_count < self.max_retries => {
                    debug!(url = %self.url, status = %res.status(), "retriable range response");
                }
                Ok(res) => {
                    return Err(ByteRangeError::UnexpectedStatus {
                        url: self.url.clone(),
                        status: res.status().as_u16(),
                    });
                }
                Err(err) if retry_count < self.max_retries => {
                    debug!(url = %self.url, error = %err, "range request failed, retrying");
                }
                Err(err) => return Err(ByteRangeError::Http(err)),
            }

            // Exponential backoff, doubling per attempt.
            retry_count += 1;
            let delay = self.retry_base_delay * 2u32.saturating_pow(retry_count - 1);
            tokio::time::sleep(delay).await;
        }
    }

    async fn close(&self) -> Result<(), ByteRangeError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

//==============================================================================
// Large-object source
//------------------------------------------------------------------------------

/// Ranged access into content-addressed objects too large to hold in memory,
/// e.g. index partitions stored inside weave transactions. The data layer
/// provides the implementation; this crate only needs region reads.
#[async_trait]
pub trait LargeObjectSource: Send + Sync {
    async fn read_region(
        &self,
        id: &H256,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, ByteRangeError>;
}

/// Adapts a [`LargeObjectSource`] object to the byte-range interface by
/// folding reads into region requests at `base_offset + offset`.
pub struct LargeObjectByteRangeSource {
    source: Arc<dyn LargeObjectSource>,
    id: H256,
    base_offset: u64,
    open: AtomicBool,
}

impl LargeObjectByteRangeSource {
    pub fn new(source: Arc<dyn LargeObjectSource>, id: H256, base_offset: u64) -> Self {
        Self {
            source,
            id,
            base_offset,
            open: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl ByteRangeSource for LargeObjectByteRangeSource {
    async fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>, ByteRangeError> {
        if !self.is_open() {
            return Err(ByteRangeError::Closed);
        }
        let bytes = self
            .source
            .read_region(&self.id, self.base_offset + offset, size)
            .await?;
        if bytes.len() as u64 != size {
            return Err(ByteRangeError::ShortRead {
                offset,
                wanted: size,
                got: bytes.len() as u64,
            });
        }
        Ok(bytes)
    }

    async fn close(&self) -> Result<(), ByteRangeError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
