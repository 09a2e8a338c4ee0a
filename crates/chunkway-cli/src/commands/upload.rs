//! Upload command implementation.
//!
//! Selects the given files through a single slot, preflights them locally
//! and uploads them into the destination directory. Ctrl-C withdraws every
//! entry from the slot's active set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use chunkway_core::channel::directory::DirectoryTransport;
use chunkway_core::entry::UploadEntry;
use chunkway_core::file::{format_size, UploadFile};
use chunkway_core::preflight::StaticPreflight;
use chunkway_core::session::UploadSession;
use chunkway_core::transform::ImageResize;
use chunkway_core::view::{ActiveRefs, UploadSlot};

use super::UploadArgs;
use crate::ui::TerminalView;

/// Run the upload command.
pub async fn run(args: UploadArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(chunk_size) = args.chunk_size {
        config.upload.chunk_size = chunk_size;
    }
    if let Some(max) = args.max_concurrency {
        config.upload.max_concurrency = max;
    }
    if let Some(ms) = args.latency {
        config.upload.latency_sim = Duration::from_millis(ms);
    }
    if let Some(dest) = args.dest {
        config.endpoint.output_dir = dest;
    }
    if args.quota.is_some() {
        config.endpoint.quota = args.quota;
    }
    if let Some((w, h)) = args.resize {
        config.image.resize = true;
        config.image.max_width = w;
        config.image.max_height = h;
    }
    config.validate()?;

    let slot = Arc::new(UploadSlot::new("cli"));
    let view = Arc::new(TerminalView::new(args.quiet));

    let mut entries = Vec::new();
    let mut total_size = 0;
    for path in &args.paths {
        let file = UploadFile::from_path(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        if !slot.is_active(&file, true) {
            tracing::debug!("{} is empty", path.display());
            eprintln!("  Skipping {}: empty file", path.display());
            continue;
        }

        total_size += file.size();
        let name = file.name().to_string();
        let entry = UploadEntry::new(file, Arc::clone(&slot), view.clone());
        view.register(entry.entry_ref(), &name);
        slot.track(entry.entry_ref().clone());
        entries.push(entry);
    }

    if entries.is_empty() {
        anyhow::bail!("Nothing to upload");
    }

    if !args.quiet {
        println!();
        println!("Chunkway v{}", chunkway_core::VERSION);
        println!("{}", "-".repeat(37));
        println!(
            "  {} files ({}) -> {}",
            entries.len(),
            format_size(total_size),
            config.endpoint.output_dir.display()
        );
        println!();
    }

    let transport = DirectoryTransport::new(&config.endpoint.output_dir)
        .with_quota(config.endpoint.quota)
        .with_latency(Some(config.upload.latency_sim));
    let preflight = StaticPreflight::new(config.settings());

    let mut session = UploadSession::new(Arc::new(transport), Arc::new(preflight));
    if config.image.resize {
        session = session.with_before_upload(Arc::new(ImageResize::new(
            config.image.max_width,
            config.image.max_height,
        )));
    }

    tracing::info!(
        "Uploading {} files to {}",
        entries.len(),
        config.endpoint.output_dir.display()
    );
    let run = session.run(entries.clone()).await;
    for err in run.errors() {
        tracing::error!("{err}");
    }

    tokio::select! {
        () = run.wait() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Interrupted, cancelling {} entries", entries.len());
            slot.set_active_refs(ActiveRefs::new());
            eprintln!();
            eprintln!("  Upload cancelled.");
        }
    }

    summarize(&entries, &view, args.quiet)
}

fn summarize(entries: &[Arc<UploadEntry>], view: &TerminalView, quiet: bool) -> Result<()> {
    let failed = entries
        .iter()
        .filter(|e| view.failure(e.entry_ref()).is_some())
        .count();
    let cancelled = entries.iter().filter(|e| e.is_cancelled()).count();
    let completed = entries
        .iter()
        .filter(|e| e.is_done() && !e.is_cancelled())
        .count();

    if !quiet {
        println!();
        println!("  {completed} uploaded, {failed} failed, {cancelled} cancelled");
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} uploads failed", entries.len());
    }
    Ok(())
}
