use std::time::Instant;

use arweave_gateway::chain::{ChunkByAnySource, ChunkRequest};
use arweave_gateway::data::ChunkRetrievalResult;
use arweave_gateway::peers::PeerManagerConfig;
use arweave_gateway::{GatewayConfig, GatewayCore};
use color_eyre::eyre::eyre;
use eyre::Result;
use paris::Logger;

const DEFAULT_PEERS: &[&str] = &[
    "https://arweave.net",
    "http://188.166.200.45:1984",
];

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let absolute_offset: u64 = args
        .next()
        .ok_or_else(|| eyre!("usage: chunk_scraper <absolute_offset> [peer_url...]"))?
        .parse()
        .map_err(|_| eyre!("absolute_offset must be a number"))?;
    let mut peer_urls: Vec<String> = args.collect();
    if peer_urls.is_empty() {
        peer_urls = DEFAULT_PEERS.iter().map(|s| s.to_string()).collect();
    }

    let mut log = Logger::new();
    log.info(format!("Resolving absolute offset {absolute_offset}"));

    let core = GatewayCore::build(GatewayConfig {
        peers: PeerManagerConfig {
            get_chunk_peers: peer_urls.clone(),
            post_chunk_peers: peer_urls,
            ..Default::default()
        },
        ..Default::default()
    });

    // Locate the containing tx through the chain client.
    let start_boundary = Instant::now();
    let placement = core
        .chain
        .find_tx_by_offset(absolute_offset)
        .await?
        .ok_or_else(|| eyre!("no transaction covers offset {absolute_offset}"))?;
    log.success(format!(
        "Found tx {} in {:?}",
        placement.tx_id.to_base64_url(),
        start_boundary.elapsed()
    ));
    log.indent(1).log(format!(
        "tx_start: {} tx_end: {} size: {}",
        placement.tx_start, placement.tx_end, placement.tx_size
    ));

    let tx = core.chain.tx(&placement.tx_id).await?;
    let data_root = tx
        .data_root
        .ok_or_else(|| eyre!("tx has no data root (format 1 inline data?)"))?;

    // Fetch and verify the chunk from peers.
    let start_fetch = Instant::now();
    let chunk = core
        .chunk_source
        .get_chunk_by_any(
            &ChunkRequest {
                tx_size: placement.tx_size,
                absolute_offset,
                data_root,
                relative_offset: absolute_offset - placement.tx_start,
            },
            None,
        )
        .await?;
    log.success(format!(
        "Fetched and validated {} bytes in {:?}",
        chunk.chunk.len(),
        start_fetch.elapsed()
    ));
    log.indent(1).log(format!(
        "chunk range in tx: [{}, {})",
        chunk.offset,
        chunk.offset + chunk.chunk.len() as u64
    ));
    log.indent(1).log(format!(
        "source: {} host: {}",
        chunk.source,
        chunk.source_host.as_deref().unwrap_or("-")
    ));
    log.indent(1)
        .log(format!("chunk hash: {}", chunk.hash.to_base64_url()));

    // Run it once more through the full pipeline for the cache-aware path.
    let start_pipeline = Instant::now();
    match core.pipeline.retrieve_chunk(absolute_offset, None, None).await {
        Ok(ChunkRetrievalResult::CacheHit(retrieved)) => {
            log.success(format!(
                "Pipeline cache hit in {:?} (relative offset {})",
                start_pipeline.elapsed(),
                retrieved.relative_offset
            ));
        }
        Ok(ChunkRetrievalResult::BoundaryFetch(retrieved)) => {
            log.success(format!(
                "Pipeline boundary fetch in {:?} (tx {})",
                start_pipeline.elapsed(),
                retrieved
                    .tx_id
                    .map(|id| id.to_base64_url())
                    .unwrap_or_else(|| "unknown".into())
            ));
        }
        Err(err) => {
            log.warn(format!("Pipeline retrieval failed: {err}"));
        }
    }

    Ok(())
}
