pub mod cli;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod downloader;
pub mod error;
pub mod http;
pub mod job;
pub mod manager;
pub mod merger;
pub mod playlist;
pub mod sink;
pub mod transmux;

use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;

use crate::cli::Args;
use crate::config::Config;
use crate::discovery::StreamDetected;
use crate::job::{JobId, JobStatus};
use crate::manager::{DownloadManager, StartRequest};

/// 命令行宣告清单时使用的作用域
const CLI_SCOPE: i64 = 1;

/// 运行下载器的主要逻辑
pub async fn run(args: Args) -> Result<()> {
    let config = Config::from(&args);
    let manager = DownloadManager::from_config(config)?;

    let mut detected = StreamDetected::new(args.url.clone(), CLI_SCOPE);
    detected.origin_url = Some("command line".to_string());
    if !manager.on_stream_detected(detected).await {
        warn!("{} does not look like an HLS manifest, trying anyway", args.url);
    }

    let variants = manager.get_quality_variants(&args.url).await;
    if args.list_variants {
        for v in &variants {
            println!("{:<8} {:<12} {:>10} {}", v.quality, v.resolution, v.bandwidth, v.url);
        }
        return Ok(());
    }
    if variants.iter().all(|v| v.resolution == "Error") {
        bail!("Failed to fetch manifest: {}", args.url);
    }

    let variant = match &args.quality {
        Some(quality) => match variants.iter().find(|v| &v.quality == quality) {
            Some(v) => v,
            None => {
                warn!("Quality {} not available, using {}", quality, variants[0].quality);
                &variants[0]
            }
        },
        None => &variants[0],
    };
    info!(
        "Selected {} ({}, {} bps): {}",
        variant.quality, variant.resolution, variant.bandwidth, variant.url
    );

    // 先订阅再启动，避免错过更新
    let progress_rx = manager.subscribe();
    let id = manager
        .start_download(StartRequest {
            manifest_url: args.url.clone(),
            quality: variant.quality.clone(),
            variant_url: Some(variant.url.clone()),
            audio_only: args.audio_only,
        })
        .await;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(concat!(
                "{spinner:.green} [{elapsed_precise}] ",
                "[{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}"
            ))?
            .progress_chars("#>-"),
    );
    let ui = tokio::spawn(render_progress(progress_rx, id.clone(), pb.clone()));

    let snapshot = tokio::select! {
        snapshot = manager.wait_for_completion(&id) => snapshot,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling download {}", id);
            manager.cancel_download(&id).await;
            manager.wait_for_completion(&id).await
        }
    };
    ui.abort();

    let Some(snapshot) = snapshot else {
        bail!("Download {} disappeared", id);
    };
    match snapshot.status {
        JobStatus::Completed => {
            pb.finish_with_message("done");
            info!(
                "Saved {} ({} bytes downloaded, {}/{} segments)",
                snapshot.output_file.unwrap_or_default(),
                snapshot.downloaded_bytes,
                snapshot.segments_downloaded,
                snapshot.total_segments
            );
            Ok(())
        }
        JobStatus::Cancelled => {
            pb.abandon_with_message("cancelled");
            bail!("Download cancelled after {} segments", snapshot.segments_downloaded)
        }
        status => {
            pb.abandon_with_message(status.label());
            bail!(
                "Download failed: {}",
                snapshot.error.unwrap_or_else(|| status.label().to_string())
            )
        }
    }
}

async fn render_progress(
    mut rx: tokio::sync::broadcast::Receiver<job::DownloadProgress>,
    id: JobId,
    pb: ProgressBar,
) {
    loop {
        match rx.recv().await {
            Ok(event) if event.job_id == id => {
                let s = event.snapshot;
                pb.set_length(s.total_segments as u64);
                pb.set_position(s.segments_downloaded as u64);
                pb.set_message(s.status.label());
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}
