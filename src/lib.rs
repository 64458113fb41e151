use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub mod backoff;
pub mod buffered;
pub mod cache;
pub mod config;
pub mod enrich;
pub mod pipeline;
pub mod report;

use crate::cache::{DynCache, InMemoryCache, MongoDbCache};
use crate::config::{CacheServiceConfig, Config, EnricherConfig};
use crate::enrich::crossref::CrossrefClient;
use crate::enrich::unpaywall::UnpaywallClient;
use crate::enrich::{EnrichOptions, Enricher};
use crate::pipeline::{Continuation, EventContext, FlowControl, Middleware, Released, StreamItem};
use crate::report::Report;

/// Reads event contexts as JSON lines from stdin, runs them through the
/// configured enrichment middlewares, and writes the enriched records as
/// JSON lines to stdout.
pub async fn run_app(config_path: &str) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    debug!("config: {:?}", config);

    let report = Report::new();
    let mut middlewares = Vec::with_capacity(config.enrichers.len());
    for enricher_config in &config.enrichers {
        middlewares.push(build_middleware(enricher_config, &config.cache, &report).await?);
    }

    run_pipeline(middlewares).await?;

    info!("run report: {:?}", report);
    Ok(())
}

async fn build_middleware(
    config: &EnricherConfig,
    cache_config: &Option<CacheServiceConfig>,
    report: &Report,
) -> anyhow::Result<Box<dyn Middleware>> {
    let cache = build_cache(config.provider(), cache_config).await?;

    match config {
        EnricherConfig::Crossref {
            include_license,
            settings,
        } => {
            let options = EnrichOptions::resolved(settings, CrossrefClient::default_options());
            let client = CrossrefClient::new(options.packet_size, *include_license)?;
            let enricher = Enricher::new(client, cache, &options, report.clone()).await?;
            Ok(buffered_middleware("crossref", enricher, &options))
        }
        EnricherConfig::Unpaywall { email, settings } => {
            let options = EnrichOptions::resolved(settings, UnpaywallClient::default_options());
            let client = UnpaywallClient::new(email.clone())?;
            let enricher = Enricher::new(client, cache, &options, report.clone()).await?;
            Ok(buffered_middleware("unpaywall", enricher, &options))
        }
    }
}

fn buffered_middleware<H: buffered::PacketHandler + 'static>(
    name: &'static str,
    handler: H,
    options: &EnrichOptions,
) -> Box<dyn Middleware> {
    let (flow, mut signals) = FlowControl::new();
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            debug!(middleware = name, "flow signal: {:?}", signal);
        }
    });

    Box::new(buffered::BufferedProcessor::new(
        handler,
        options.buffer_options(),
        flow,
    ))
}

async fn build_cache(
    source: &str,
    config: &Option<CacheServiceConfig>,
) -> anyhow::Result<Option<DynCache>> {
    match config {
        Some(config) => {
            let client = mongodb::Client::with_uri_str(&config.connection_string).await?;
            let database = client.database(&config.db_name);
            Ok(Some(Arc::new(MongoDbCache::new(
                database,
                source.to_owned(),
            ))))
        }
        // without a configured backend the cache still deduplicates
        // identifiers within the run
        None => Ok(Some(Arc::new(InMemoryCache::new()))),
    }
}

/// Wires the middleware chain: stdin feeds the first stage, each stage's
/// released records feed the next, the last stage feeds the writer. Records
/// released with an error skip the rest of the chain.
async fn run_pipeline(middlewares: Vec<Box<dyn Middleware>>) -> anyhow::Result<()> {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Released>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(released) = out_rx.recv().await {
            if let Some(err) = released.error {
                warn!("record aborted: {err}");
                continue;
            }
            let mut line = serde_json::to_vec(&released.ec)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
        }
        stdout.flush().await?;
        Ok::<(), anyhow::Error>(())
    });

    let mut stage_txs = Vec::with_capacity(middlewares.len());
    let mut stage_handles = Vec::with_capacity(middlewares.len());
    for mut middleware in middlewares {
        let (tx, mut rx) = mpsc::unbounded_channel::<StreamItem>();
        stage_txs.push(tx);
        stage_handles.push(tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                middleware.process(item).await?;
            }
            Ok::<(), anyhow::Error>(())
        }));
    }
    let stage_txs = Arc::new(stage_txs);

    // feed stdin into the first stage
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let ec: EventContext = match serde_json::from_str(&line) {
            Ok(ec) => ec,
            Err(err) => {
                warn!("skipping malformed record: {err}");
                continue;
            }
        };
        dispatch(&stage_txs, 0, &out_tx, Released { ec, error: None });
    }

    // end of stream: flush each stage in order, so stage n has forwarded
    // everything before stage n+1 is told to finish
    for (idx, tx) in stage_txs.iter().enumerate() {
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(StreamItem::Flush(ack_tx)).is_ok() && ack_rx.await.is_ok() {
            continue;
        }
        warn!(stage = idx, "stage stopped before flushing");
    }

    drop(stage_txs);
    drop(out_tx);

    for handle in stage_handles {
        handle.await??;
    }
    writer.await??;

    Ok(())
}

/// Sends a record into the stage at `idx`, with a continuation that forwards
/// it to the following stage. Errored records go straight to the writer.
fn dispatch(
    stages: &Arc<Vec<mpsc::UnboundedSender<StreamItem>>>,
    idx: usize,
    out: &mpsc::UnboundedSender<Released>,
    released: Released,
) {
    if released.error.is_some() || idx >= stages.len() {
        let _ = out.send(released);
        return;
    }

    let next_stages = stages.clone();
    let next_out = out.clone();
    let cont = Continuation::new(move |released| {
        dispatch(&next_stages, idx + 1, &next_out, released);
    });
    let _ = stages[idx].send(StreamItem::Ec(released.ec, cont));
}
