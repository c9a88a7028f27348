use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use record_store::{export_range, import_records};
use replay_auditor::{ReplaySummary, ReproducibilityAuditor};
use replay_core::{
    ChainVerification, Fingerprint, PartitionKey, RecordStore, ReplayAuditEntry, ReplayError,
    ReplayLog,
};
use replay_engine::{ReplayRuntime, ResolveRequest};

use crate::args::Args;

fn output(path: Option<&str>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path))?,
        )),
        None => Box::new(io::stdout().lock()),
    })
}

fn write_json<T: Serialize>(out: &mut dyn Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

fn auditor(runtime: &ReplayRuntime) -> ReproducibilityAuditor {
    let store: Arc<dyn RecordStore> = runtime.store.clone();
    let log: Arc<dyn ReplayLog> = runtime.replay_log.clone();
    ReproducibilityAuditor::new(store, log)
}

pub async fn import(runtime: &ReplayRuntime, args: &Args) -> Result<()> {
    let path = args.positional().context("usage: replay import <file>")?;
    let file = File::open(path).with_context(|| format!("Failed to open {}", path))?;

    let summary = import_records(runtime.store.as_ref(), BufReader::new(file))
        .await
        .with_context(|| format!("Import of {} failed", path))?;
    write_json(&mut io::stdout(), &summary)
}

pub async fn export(runtime: &ReplayRuntime, args: &Args) -> Result<()> {
    let pair = args.required("--pair")?;
    let timeframe = args.required("--timeframe")?;
    let from = args.parsed::<i64>("--from")?.unwrap_or(i64::MIN);
    let to = args.parsed::<i64>("--to")?.unwrap_or(i64::MAX);

    let mut out = output(args.value("--out"))?;
    let count = export_range(runtime.store.as_ref(), pair, timeframe, from, to, &mut out).await?;
    tracing::info!("Exported {} records for {}:{}", count, pair, timeframe);
    Ok(())
}

pub async fn resolve(runtime: &ReplayRuntime, args: &Args) -> Result<()> {
    let hash: Fingerprint = args
        .parsed("--hash")?
        .context("missing required --hash")?;
    let timestamp: i64 = args.parsed("--ts")?.context("missing required --ts")?;

    let mut request = ResolveRequest::from_fingerprint(
        hash,
        args.required("--pair")?,
        args.required("--timeframe")?,
        timestamp,
    );
    if let Some(id) = args.value("--request-id") {
        request = request.with_request_id(id);
    }

    let resolution = runtime.resolver()?.resolve(&request).await?;
    write_json(&mut io::stdout(), &resolution)
}

/// Batch resolution of an NDJSON file of `ResolveRequest`s.
///
/// Malformed or invalid queries are skipped; infrastructure failures abort
/// the run so a backtest never continues on silently degraded decisions.
pub async fn replay(runtime: &ReplayRuntime, args: &Args) -> Result<()> {
    let path = args.positional().context("usage: replay replay <queries.ndjson>")?;
    let file = File::open(path).with_context(|| format!("Failed to open {}", path))?;
    let resolver = runtime.resolver()?;
    let run_id = runtime.config.run_id.clone();
    let mut out = output(args.value("--out"))?;

    tracing::info!("Starting replay run {} from {}", run_id, path);

    let mut rejected = 0usize;
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: ResolveRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("line {}: skipping malformed query: {}", n + 1, e);
                rejected += 1;
                continue;
            }
        };

        match resolver.resolve(&request).await {
            Ok(resolution) => {
                serde_json::to_writer(&mut out, &resolution)?;
                writeln!(out)?;
            }
            Err(e) if e.is_infrastructure() => {
                tracing::error!(
                    "Replay run {} aborted at line {}: {}. Decisions after this point were not resolved.",
                    run_id,
                    n + 1,
                    e
                );
                out.flush()?;
                return Err(e).with_context(|| format!("replay run {} aborted", run_id));
            }
            Err(ReplayError::InvalidInput(msg)) => {
                tracing::warn!("line {}: skipping invalid query: {}", n + 1, msg);
                rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    out.flush()?;

    let stats = resolver.stats().snapshot();
    tracing::info!(
        "Replay run {} complete: {} resolved (exact {}, nearest {}, surrogate {}, default {}), {} rejected",
        run_id,
        stats.resolved(),
        stats.exact,
        stats.nearest,
        stats.surrogate,
        stats.default,
        rejected
    );
    Ok(())
}

#[derive(Serialize)]
struct AuditReport {
    summary: ReplaySummary,
    entries: Vec<ReplayAuditEntry>,
}

pub async fn audit(runtime: &ReplayRuntime, args: &Args) -> Result<()> {
    let run_id = args.required("--run")?;
    let auditor = auditor(runtime);

    let report = AuditReport {
        summary: auditor.report(run_id).await?,
        entries: auditor.audit_run(run_id).await?,
    };
    let mut out = output(args.value("--out"))?;
    write_json(&mut out, &report)
}

pub async fn verify(runtime: &ReplayRuntime, args: &Args) -> Result<()> {
    let auditor = auditor(runtime);

    let verification: ChainVerification = match args.value("--run") {
        Some(run_id) => auditor.verify_run(run_id).await?,
        None => {
            let partition =
                PartitionKey::new(args.required("--pair")?, args.required("--timeframe")?);
            auditor.verify_partition(&partition).await?
        }
    };
    write_json(&mut io::stdout(), &verification)?;

    if !verification.is_valid {
        bail!("chain verification failed: {}", verification.message);
    }
    Ok(())
}
