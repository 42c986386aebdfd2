use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use url::Url;

use crate::crypto::{decrypt_data, segment_iv};
use crate::error::{FetchError, JobError, SegmentError};
use crate::http::Fetcher;
use crate::job::{DownloadJob, DownloadProgress, JobSnapshot, JobStatus};
use crate::merger::merge_segments;
use crate::playlist::{
    parse_master_playlist, parse_media_playlist, SegmentDescriptor, VariantDescriptor,
};
use crate::sink::{suggested_filename, PersistenceSink};
use crate::transmux::{ContainerTransmuxer, OutputMode};

/// 开始转换时上报的进度
const CONVERTING_PROGRESS: f64 = 95.0;

/// 管理器与运行中任务共享的控制标志
#[derive(Debug, Default)]
pub struct JobControl {
    cancelled: AtomicBool,
    removed: AtomicBool,
}

impl JobControl {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 分离任务：下次检查时停止，且不再发布
    pub fn remove(&self) {
        self.removed.store(true, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

/// 任务协程除自身状态外所需的全部依赖
pub struct JobContext {
    pub fetcher: Arc<dyn Fetcher>,
    pub sink: Arc<dyn PersistenceSink>,
    pub transmuxer: ContainerTransmuxer,
    pub progress_interval: Duration,
    pub control: Arc<JobControl>,
    pub snapshot_tx: watch::Sender<JobSnapshot>,
    pub progress_tx: broadcast::Sender<DownloadProgress>,
}

impl JobContext {
    fn publish(&self, job: &DownloadJob) {
        if self.control.is_removed() {
            return;
        }
        // 先广播，等待 watch 的一方被唤醒时事件已在队列中
        let _ = self.progress_tx.send(DownloadProgress {
            job_id: job.id().clone(),
            snapshot: job.snapshot().clone(),
        });
        self.snapshot_tx.send_replace(job.snapshot().clone());
    }

    fn transition(&self, job: &mut DownloadJob, next: JobStatus) -> bool {
        let moved = job.transition(next);
        if moved {
            self.publish(job);
        }
        moved
    }

    fn fail(&self, job: &mut DownloadJob, error: JobError) {
        warn!("Job {} failed: {}", job.id(), error);
        job.fail(error.to_string());
        self.publish(job);
    }

    async fn fetch_segment(
        &self,
        segment: &SegmentDescriptor,
        keys: &mut HashMap<String, Bytes>,
    ) -> Result<Bytes, SegmentError> {
        let data = self.fetcher.fetch_bytes(&segment.url).await?;
        let Some(key_info) = &segment.key else {
            return Ok(data);
        };

        let key = match keys.get(&key_info.uri) {
            Some(key) => key.clone(),
            None => {
                debug!("Fetching AES-128 key {}", key_info.uri);
                let key = self.fetcher.fetch_bytes(&key_info.uri).await?;
                keys.insert(key_info.uri.clone(), key.clone());
                key
            }
        };
        let iv = segment_iv(key_info.iv.as_deref(), segment.sequence)?;
        Ok(Bytes::from(decrypt_data(&data, &key, &iv)?))
    }
}

/// 在主播放列表中挑选变体：优先匹配画质标签，否则取最高码率
pub fn select_variant<'a>(
    variants: &'a [VariantDescriptor],
    quality: &str,
) -> Option<&'a VariantDescriptor> {
    variants
        .iter()
        .find(|v| v.quality == quality)
        .or_else(|| variants.first())
}

/// 获取任务的分段列表；主播放列表会按 `quality` 跟随一次到对应变体
async fn fetch_segments(
    fetcher: &dyn Fetcher,
    playlist_url: &str,
    quality: &str,
) -> Result<Vec<SegmentDescriptor>, FetchError> {
    let parse_url = |url: &str| {
        Url::parse(url)
            .map_err(|e| FetchError::Other(format!("invalid playlist URL {}: {}", url, e)))
    };

    let base = parse_url(playlist_url)?;
    let text = fetcher.fetch_text(playlist_url).await?;

    let variants = parse_master_playlist(&text, &base);
    let Some(variant) = select_variant(&variants, quality) else {
        return Ok(parse_media_playlist(&text, &base));
    };

    info!("Following master playlist to {} variant: {}", variant.quality, variant.url);
    let base = parse_url(&variant.url)?;
    let text = fetcher.fetch_text(&variant.url).await?;
    Ok(parse_media_playlist(&text, &base))
}

/// 运行单个下载任务直到终态（或被移除）
pub async fn run_job(ctx: JobContext, mut job: DownloadJob, playlist_url: String) {
    let quality = job.snapshot().quality.clone();
    let audio_only = job.snapshot().audio_only;

    let segments = match fetch_segments(ctx.fetcher.as_ref(), &playlist_url, &quality).await {
        Ok(segments) => segments,
        Err(e) => {
            ctx.fail(&mut job, JobError::ManifestFetch(e));
            return;
        }
    };
    info!("Job {}: {} segments in {}", job.id(), segments.len(), playlist_url);

    if ctx.control.is_removed() {
        return;
    }
    job.begin_download(segments.len());
    ctx.publish(&job);

    let mut buffers: Vec<Bytes> = Vec::with_capacity(segments.len());
    let mut keys: HashMap<String, Bytes> = HashMap::new();
    let mut last_publish = Instant::now();

    for segment in &segments {
        if ctx.control.is_removed() {
            debug!("Job {} removed, stopping", job.id());
            return;
        }
        if ctx.control.is_cancelled() {
            ctx.transition(&mut job, JobStatus::Cancelled);
            return;
        }

        match ctx.fetch_segment(segment, &mut keys).await {
            Ok(data) => {
                debug!("Job {}: segment {} ({} bytes)", job.id(), segment.index, data.len());
                job.record_segment(data.len());
                buffers.push(data);
                if last_publish.elapsed() >= ctx.progress_interval {
                    ctx.publish(&job);
                    last_publish = Instant::now();
                }
            }
            Err(e) => {
                warn!(
                    "Job {}: skipping segment {} ({}): {}",
                    job.id(),
                    segment.index,
                    segment.url,
                    e
                );
            }
        }
    }

    if !ctx.transition(&mut job, JobStatus::Merging) {
        return;
    }
    let merged = merge_segments(buffers);

    if ctx.control.is_removed() {
        return;
    }
    if ctx.control.is_cancelled() {
        ctx.transition(&mut job, JobStatus::Cancelled);
        return;
    }

    job.raise_progress(CONVERTING_PROGRESS);
    ctx.transition(&mut job, JobStatus::Converting);

    let mode = if audio_only {
        OutputMode::AudioOnly
    } else {
        OutputMode::Video
    };
    let output = match ctx.transmuxer.transmux(&merged, mode).await {
        Ok(converted) => converted,
        Err(e) => {
            warn!("Job {}: conversion failed ({}), saving original TS", job.id(), e);
            merged
        }
    };

    if ctx.control.is_removed() {
        return;
    }

    let filename = suggested_filename(&quality, output.format.extension());
    match ctx.sink.persist(output.data, &filename).await {
        Ok(saved) => {
            if ctx.control.is_removed() {
                return;
            }
            job.complete(saved);
            ctx.publish(&job);
        }
        Err(e) => ctx.fail(&mut job, JobError::Persistence(e)),
    }
}
