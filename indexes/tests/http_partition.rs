//! End-to-end coverage of remotely served index partitions: a CDB64 file
//! behind an HTTP range server probes identically to one on disk, and the
//! partitioned reader opens `http` locations lazily.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arweave_gateway_indexes::{
    CachingByteRangeSource, Cdb64Manifest, Cdb64Reader, Cdb64Writer, HttpByteRangeSource,
    PartitionInfo, PartitionLocation, PartitionedCdb64Reader, PartitionedCdb64ReaderOptions,
};
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves one file over HTTP, honoring `Range: bytes=a-b` with 206
/// responses, one connection per request.
async fn spawn_range_server(bytes: Vec<u8>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/index.cdb", listener.local_addr().unwrap());
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&requests);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let bytes = bytes.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let Ok(read) = socket.read(&mut buf).await else {
                        return;
                    };
                    if read == 0 {
                        return;
                    }
                    request.extend_from_slice(&buf[..read]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let request = String::from_utf8_lossy(&request);

                let range = request
                    .lines()
                    .find(|line| line.to_ascii_lowercase().starts_with("range:"))
                    .and_then(|line| line.split('=').nth(1))
                    .and_then(|span| {
                        let (start, end) = span.trim().split_once('-')?;
                        Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?))
                    });

                let response = match range {
                    Some((start, end)) if start < bytes.len() => {
                        let end = end.min(bytes.len() - 1);
                        let body = &bytes[start..=end];
                        let mut head = format!(
                            "HTTP/1.1 206 Partial Content\r\ncontent-range: bytes {start}-{end}/{}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                            bytes.len(),
                            body.len(),
                        )
                        .into_bytes();
                        head.extend_from_slice(body);
                        head
                    }
                    Some(_) => {
                        b"HTTP/1.1 416 Range Not Satisfiable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                            .to_vec()
                    }
                    None => {
                        let mut head = format!(
                            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                            bytes.len()
                        )
                        .into_bytes();
                        head.extend_from_slice(&bytes);
                        head
                    }
                };
                let _ = socket.write_all(&response).await;
            });
        }
    });
    (url, requests)
}

async fn build_cdb(records: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.cdb");
    let mut writer = Cdb64Writer::create(&path).await.unwrap();
    for (key, value) in records {
        writer.add(key, value).await.unwrap();
    }
    writer.finalize().await.unwrap();
    std::fs::read(&path).unwrap()
}

fn records_for_prefix(prefix: u8) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0u8..20)
        .map(|i| {
            (
                vec![prefix, i, i + 1],
                format!("value-{prefix:02x}-{i}").into_bytes(),
            )
        })
        .collect()
}

#[tokio::test]
async fn http_backed_reader_probes_with_ranged_reads() {
    let records = records_for_prefix(0x42);
    let bytes = build_cdb(&records).await;
    let (url, requests) = spawn_range_server(bytes).await;

    let source = HttpByteRangeSource::new(reqwest::Client::new(), url);
    let caching = CachingByteRangeSource::new(Arc::new(source), true);
    let reader = Cdb64Reader::open(Arc::new(caching)).await.unwrap();

    for (key, value) in &records {
        assert_eq!(reader.get(key).await.unwrap().as_ref(), Some(value));
    }
    assert_eq!(reader.get(&[0x42, 0xfe]).await.unwrap(), None);

    // The header was fetched once; every get cost at most a table read and
    // a record read on top of it.
    let total = requests.load(Ordering::SeqCst);
    assert!(total >= 2);
    assert!(total <= 1 + records.len() * 3);
}

#[tokio::test]
async fn partitioned_reader_opens_http_locations_lazily() {
    let records = records_for_prefix(0x42);
    let bytes = build_cdb(&records).await;
    let size = bytes.len() as u64;
    let (url, requests) = spawn_range_server(bytes).await;

    let manifest = Cdb64Manifest {
        version: 1,
        created_at: Utc::now(),
        total_records: records.len() as u64,
        metadata: None,
        partitions: vec![PartitionInfo {
            prefix: "42".into(),
            location: PartitionLocation::Http { url },
            record_count: records.len() as u64,
            size,
        }],
    };
    let reader = PartitionedCdb64Reader::new(
        &manifest,
        PartitionedCdb64ReaderOptions {
            http_client: Some(reqwest::Client::new()),
            ..Default::default()
        },
    )
    .unwrap();

    // Other prefixes miss without touching the network.
    assert_eq!(reader.get(&[0x41, 0x00]).await.unwrap(), None);
    assert_eq!(requests.load(Ordering::SeqCst), 0);
    assert_eq!(reader.open_partition_count(), 0);

    let (key, value) = &records[7];
    assert_eq!(reader.get(key).await.unwrap().as_ref(), Some(value));
    assert_eq!(reader.open_partition_count(), 1);
    assert!(requests.load(Ordering::SeqCst) >= 1);
}
