use anyhow::Result;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use url::Url;

use crate::config::Config;
use crate::discovery::{StreamDetected, StreamRegistry};
use crate::downloader::{run_job, JobContext, JobControl};
use crate::http::{build_http_client, Fetcher, HttpFetcher};
use crate::job::{DownloadJob, DownloadProgress, JobId, JobSnapshot};
use crate::playlist::{parse_master_playlist, VariantDescriptor};
use crate::sink::{FileSink, PersistenceSink};
use crate::transmux::{ContainerTransmuxer, TsCodec};

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// 新建下载任务的参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub manifest_url: String,
    pub quality: String,
    /// 所选变体的媒体播放列表，缺省时使用清单地址
    pub variant_url: Option<String>,
    pub audio_only: bool,
}

struct JobHandle {
    control: Arc<JobControl>,
    snapshot: watch::Receiver<JobSnapshot>,
}

/// 管理检测到的流和下载任务，前端通过它操作
pub struct DownloadManager {
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn PersistenceSink>,
    transmuxer: ContainerTransmuxer,
    config: Config,
    jobs: RwLock<HashMap<JobId, JobHandle>>,
    streams: RwLock<StreamRegistry>,
    progress_tx: broadcast::Sender<DownloadProgress>,
}

impl DownloadManager {
    pub fn new(fetcher: Arc<dyn Fetcher>, sink: Arc<dyn PersistenceSink>, config: Config) -> Self {
        let transmuxer = ContainerTransmuxer::new(Arc::new(TsCodec), config.transmux_timeout);
        Self::with_transmuxer(fetcher, sink, transmuxer, config)
    }

    pub fn with_transmuxer(
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn PersistenceSink>,
        transmuxer: ContainerTransmuxer,
        config: Config,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            fetcher,
            sink,
            transmuxer,
            config,
            jobs: RwLock::new(HashMap::new()),
            streams: RwLock::new(StreamRegistry::new()),
            progress_tx,
        }
    }

    /// 根据配置构建 HTTP 获取器和文件落盘
    pub fn from_config(config: Config) -> Result<Self> {
        let client = build_http_client(&config.headers, config.http_timeout)?;
        let fetcher = Arc::new(HttpFetcher::new(client));
        let sink = Arc::new(FileSink::new(config.output_dir.clone()));
        Ok(Self::new(fetcher, sink, config))
    }

    pub async fn on_stream_detected(&self, stream: StreamDetected) -> bool {
        self.streams.write().await.record(stream)
    }

    pub async fn detected_streams(&self, scope: i64) -> Vec<StreamDetected> {
        self.streams.read().await.streams(scope)
    }

    pub async fn invalidate_scope(&self, scope: i64) {
        self.streams.write().await.invalidate_scope(scope);
    }

    /// 获取清单的画质列表；失败时返回一个 "Error" 占位变体
    pub async fn get_quality_variants(&self, manifest_url: &str) -> Vec<VariantDescriptor> {
        let base = match Url::parse(manifest_url) {
            Ok(url) => url,
            Err(e) => {
                warn!("Invalid manifest URL {}: {}", manifest_url, e);
                return vec![VariantDescriptor::single(manifest_url, "Error")];
            }
        };

        let text = match self.fetcher.fetch_text(manifest_url).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to fetch manifest {}: {}", manifest_url, e);
                return vec![VariantDescriptor::single(manifest_url, "Error")];
            }
        };

        let variants = parse_master_playlist(&text, &base);
        if variants.is_empty() {
            debug!("{} is a media playlist", manifest_url);
            return vec![VariantDescriptor::single(manifest_url, "Original")];
        }
        variants
    }

    /// 登记任务并启动其协程，立即返回
    pub async fn start_download(&self, request: StartRequest) -> JobId {
        let id = JobId::generate(&request.manifest_url);
        let job = DownloadJob::new(
            id.clone(),
            &request.manifest_url,
            &request.quality,
            request.audio_only,
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(job.snapshot().clone());
        let control = Arc::new(JobControl::default());

        self.jobs.write().await.insert(
            id.clone(),
            JobHandle {
                control: Arc::clone(&control),
                snapshot: snapshot_rx,
            },
        );

        let playlist_url = request.variant_url.unwrap_or(request.manifest_url);
        info!("Starting download {} ({}): {}", id, request.quality, playlist_url);

        let ctx = JobContext {
            fetcher: Arc::clone(&self.fetcher),
            sink: Arc::clone(&self.sink),
            transmuxer: self.transmuxer.clone(),
            progress_interval: self.config.progress_interval,
            control,
            snapshot_tx,
            progress_tx: self.progress_tx.clone(),
        };
        tokio::spawn(run_job(ctx, job, playlist_url));

        id
    }

    /// 请求取消；未知或已结束的任务返回 false
    pub async fn cancel_download(&self, id: &JobId) -> bool {
        let jobs = self.jobs.read().await;
        let Some(handle) = jobs.get(id) else {
            return false;
        };
        if handle.snapshot.borrow().status.is_terminal() {
            return false;
        }
        info!("Cancelling download {}", id);
        handle.control.cancel();
        true
    }

    /// 移除任务，运行中的任务在下次检查时停止且不再发布
    pub async fn remove_download(&self, id: &JobId) {
        if let Some(handle) = self.jobs.write().await.remove(id) {
            debug!("Removed download {}", id);
            handle.control.remove();
        }
    }

    /// 所有已登记的任务，按开始时间排序
    pub async fn get_active_downloads(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.read().await;
        let mut snapshots: Vec<JobSnapshot> =
            jobs.values().map(|h| h.snapshot.borrow().clone()).collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadProgress> {
        self.progress_tx.subscribe()
    }

    /// 等待任务进入终态；期间被移除时返回最后发布的快照
    pub async fn wait_for_completion(&self, id: &JobId) -> Option<JobSnapshot> {
        let mut rx = {
            let jobs = self.jobs.read().await;
            jobs.get(id)?.snapshot.clone()
        };
        if rx.wait_for(|s| s.status.is_terminal()).await.is_err() {
            debug!("Download {} stopped before reaching a terminal state", id);
        }
        let snapshot = rx.borrow().clone();
        Some(snapshot)
    }
}
