use log::{debug, info};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static JOB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 进程内唯一的下载任务ID，例如 `dl_1700000000000_3fa9c0d12`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    /// 生成新的任务ID
    pub fn generate(manifest_url: &str) -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let n = JOB_COUNTER.fetch_add(1, Ordering::Relaxed);
        let digest = sha256::digest(format!("{}|{}|{}", manifest_url, n, millis));
        JobId(format!("dl_{}_{}", millis, &digest[..9]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Initializing,
    Downloading,
    Merging,
    Converting,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled)
    }

    fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Initializing, Downloading)
                | (Initializing, Error)
                | (Downloading, Merging)
                | (Downloading, Cancelled)
                | (Merging, Converting)
                | (Merging, Cancelled)
                | (Merging, Error)
                | (Converting, Completed)
                | (Converting, Error)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            JobStatus::Initializing => "Initializing",
            JobStatus::Downloading => "Downloading",
            JobStatus::Merging => "Merging",
            JobStatus::Converting => "Converting to MP4",
            JobStatus::Completed => "Completed",
            JobStatus::Error => "Error",
            JobStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 提供给观察者的只读任务视图
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub id: JobId,
    pub stream_url: String,
    pub quality: String,
    pub status: JobStatus,
    pub progress: f64,
    pub segments_downloaded: usize,
    pub total_segments: usize,
    pub downloaded_bytes: u64,
    pub estimated_size: u64,
    /// 字节/秒
    pub speed: f64,
    /// 秒
    pub time_remaining: f64,
    /// Unix 毫秒时间戳
    pub started_at: i64,
    pub cancelled: bool,
    pub audio_only: bool,
    pub error: Option<String>,
    pub output_file: Option<String>,
}

/// 节流后的进度更新和每次状态迁移都会广播
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub job_id: JobId,
    pub snapshot: JobSnapshot,
}

/// 可变的任务状态，由运行该任务的协程独占
#[derive(Debug)]
pub struct DownloadJob {
    snapshot: JobSnapshot,
    started: Instant,
}

impl DownloadJob {
    pub fn new(id: JobId, stream_url: &str, quality: &str, audio_only: bool) -> Self {
        Self {
            snapshot: JobSnapshot {
                id,
                stream_url: stream_url.to_string(),
                quality: quality.to_string(),
                status: JobStatus::Initializing,
                progress: 0.0,
                segments_downloaded: 0,
                total_segments: 0,
                downloaded_bytes: 0,
                estimated_size: 0,
                speed: 0.0,
                time_remaining: 0.0,
                started_at: chrono::Utc::now().timestamp_millis(),
                cancelled: false,
                audio_only,
                error: None,
                output_file: None,
            },
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.snapshot.id
    }

    pub fn snapshot(&self) -> &JobSnapshot {
        &self.snapshot
    }

    /// 状态迁移；终态之后的迁移会被忽略并返回 false
    pub fn transition(&mut self, next: JobStatus) -> bool {
        let current = self.snapshot.status;
        if !current.can_transition_to(next) {
            debug!("Job {}: ignoring transition {:?} -> {:?}", self.id(), current, next);
            return false;
        }
        info!("Job {}: {} -> {}", self.id(), current, next);
        self.snapshot.status = next;
        if next == JobStatus::Cancelled {
            self.snapshot.cancelled = true;
        }
        true
    }

    /// 进入 `downloading` 状态并固定分段总数
    pub fn begin_download(&mut self, total_segments: usize) -> bool {
        if !self.transition(JobStatus::Downloading) {
            return false;
        }
        self.snapshot.total_segments = total_segments;
        self.started = Instant::now();
        true
    }

    pub fn record_segment(&mut self, bytes: usize) {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.record_segment_at(bytes, elapsed);
    }

    fn record_segment_at(&mut self, bytes: usize, elapsed_secs: f64) {
        let s = &mut self.snapshot;
        s.segments_downloaded += 1;
        s.downloaded_bytes += bytes as u64;

        let done = s.segments_downloaded as f64;
        let total = s.total_segments as f64;
        if total > 0.0 {
            s.progress = s.progress.max((done / total * 100.0).min(100.0));
        }
        if elapsed_secs > 0.0 {
            s.speed = s.downloaded_bytes as f64 / elapsed_secs;
        }
        s.time_remaining = (total - done).max(0.0) * (elapsed_secs / done);
        s.estimated_size = ((s.downloaded_bytes as f64 / done) * total) as u64;
    }

    /// 提高进度，进度不会下降
    pub fn raise_progress(&mut self, progress: f64) {
        self.snapshot.progress = self.snapshot.progress.max(progress.clamp(0.0, 100.0));
    }

    pub fn complete(&mut self, output_file: String) {
        if self.transition(JobStatus::Completed) {
            self.raise_progress(100.0);
            self.snapshot.time_remaining = 0.0;
            self.snapshot.output_file = Some(output_file);
        }
    }

    pub fn fail(&mut self, message: String) {
        if self.transition(JobStatus::Error) {
            self.snapshot.error = Some(message);
        }
    }
}
