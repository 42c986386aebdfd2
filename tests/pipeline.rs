use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use hls_grabber::config::Config;
use hls_grabber::error::{FetchError, PersistError};
use hls_grabber::http::Fetcher;
use hls_grabber::job::{JobSnapshot, JobStatus};
use hls_grabber::manager::{DownloadManager, StartRequest};
use hls_grabber::sink::PersistenceSink;

const MANIFEST: &str = "https://cdn.example.com/live/index.m3u8";

/// 返回预置内容，未知 URL 返回 404
#[derive(Default)]
struct FakeFetcher {
    bodies: HashMap<String, Bytes>,
    failing: HashSet<String>,
    fetched: Mutex<Vec<String>>,
    /// 请求该 URL 时发出通知，并挂起直到被放行
    pause: Option<(String, mpsc::UnboundedSender<()>, Arc<Notify>)>,
}

impl FakeFetcher {
    fn with(mut self, url: &str, body: impl Into<Bytes>) -> Self {
        self.bodies.insert(url.to_string(), body.into());
        self
    }

    fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    async fn get(&self, url: &str) -> Result<Bytes, FetchError> {
        self.fetched.lock().unwrap().push(url.to_string());
        if let Some((paused, announce, release)) = &self.pause {
            if paused == url {
                let _ = announce.send(());
                release.notified().await;
            }
        }
        if self.failing.contains(url) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: 500,
            });
        }
        self.bodies.get(url).cloned().ok_or(FetchError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

impl Fetcher for FakeFetcher {
    fn fetch_text<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, FetchError>> {
        async move {
            let body = self.get(url).await?;
            Ok(String::from_utf8_lossy(&body).into_owned())
        }
        .boxed()
    }

    fn fetch_bytes<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes, FetchError>> {
        self.get(url).boxed()
    }
}

#[derive(Default)]
struct MemorySink {
    saved: Mutex<Vec<(String, Bytes)>>,
    fail_with: Option<String>,
}

impl MemorySink {
    fn saved(&self) -> Vec<(String, Bytes)> {
        self.saved.lock().unwrap().clone()
    }
}

impl PersistenceSink for MemorySink {
    fn persist<'a>(
        &'a self,
        data: Bytes,
        name: &'a str,
    ) -> BoxFuture<'a, Result<String, PersistError>> {
        async move {
            if let Some(reason) = &self.fail_with {
                return Err(PersistError::new(reason.clone()));
            }
            self.saved.lock().unwrap().push((name.to_string(), data));
            Ok(name.to_string())
        }
        .boxed()
    }
}

fn media_playlist(count: usize) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:4\n");
    for i in 0..count {
        text.push_str(&format!("#EXTINF:4.0,\nseg{}.ts\n", i));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

fn segment_url(i: usize) -> String {
    format!("https://cdn.example.com/live/seg{}.ts", i)
}

/// 清单加 `count` 个 `size` 字节的非 TS 分段
fn fetcher_with_segments(count: usize, size: usize) -> FakeFetcher {
    let mut fetcher = FakeFetcher::default().with(MANIFEST, media_playlist(count));
    for i in 0..count {
        fetcher = fetcher.with(&segment_url(i), vec![b'a' + i as u8; size]);
    }
    fetcher
}

fn test_config() -> Config {
    Config {
        progress_interval: Duration::ZERO,
        transmux_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

fn request(audio_only: bool) -> StartRequest {
    StartRequest {
        manifest_url: MANIFEST.to_string(),
        quality: "720p".to_string(),
        variant_url: None,
        audio_only,
    }
}

async fn run_to_end(
    fetcher: Arc<FakeFetcher>,
    sink: Arc<MemorySink>,
    request: StartRequest,
) -> JobSnapshot {
    let manager = DownloadManager::new(fetcher, sink, test_config());
    let id = manager.start_download(request).await;
    tokio::time::timeout(Duration::from_secs(10), manager.wait_for_completion(&id))
        .await
        .expect("job did not finish")
        .expect("job vanished")
}

#[tokio::test]
async fn test_full_download_falls_back_to_ts() {
    let fetcher = Arc::new(fetcher_with_segments(4, 100));
    let sink = Arc::new(MemorySink::default());

    let snapshot = run_to_end(fetcher, sink.clone(), request(false)).await;

    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.downloaded_bytes, 400);
    assert_eq!(snapshot.segments_downloaded, 4);
    assert_eq!(snapshot.total_segments, 4);
    assert_eq!(snapshot.progress, 100.0);
    assert!(snapshot.error.is_none());

    let saved = sink.saved();
    assert_eq!(saved.len(), 1);
    let (name, data) = &saved[0];
    assert!(name.starts_with("video_720p_"));
    assert!(name.ends_with(".ts"));
    assert_eq!(snapshot.output_file.as_deref(), Some(name.as_str()));

    // 原样保存的合并数据，按播放列表顺序
    let mut expected = Vec::new();
    for i in 0..4 {
        expected.extend(vec![b'a' + i as u8; 100]);
    }
    assert_eq!(&data[..], &expected[..]);
}

#[tokio::test]
async fn test_audio_only_without_audio_still_completes() {
    let fetcher = Arc::new(fetcher_with_segments(2, 188));
    let sink = Arc::new(MemorySink::default());

    let snapshot = run_to_end(fetcher, sink.clone(), request(true)).await;

    assert_eq!(snapshot.status, JobStatus::Completed);
    assert!(snapshot.audio_only);
    assert!(sink.saved()[0].0.ends_with(".ts"));
}

#[tokio::test]
async fn test_failed_segments_are_skipped() {
    let fetcher = Arc::new(fetcher_with_segments(3, 10).failing(&segment_url(1)));
    let sink = Arc::new(MemorySink::default());

    let snapshot = run_to_end(fetcher.clone(), sink.clone(), request(false)).await;

    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.segments_downloaded, 2);
    assert_eq!(snapshot.total_segments, 3);
    assert_eq!(snapshot.downloaded_bytes, 20);
    assert_eq!(snapshot.progress, 100.0);
    assert_eq!(&sink.saved()[0].1[..], &[[b'a'; 10], [b'c'; 10]].concat()[..]);
    assert!(fetcher.fetched().contains(&segment_url(2)));
}

#[tokio::test]
async fn test_manifest_failure() {
    let fetcher = Arc::new(FakeFetcher::default());
    let sink = Arc::new(MemorySink::default());

    let snapshot = run_to_end(fetcher, sink.clone(), request(false)).await;

    assert_eq!(snapshot.status, JobStatus::Error);
    let message = snapshot.error.unwrap();
    assert!(message.contains("HTTP error! status: 404"), "{}", message);
    assert!(sink.saved().is_empty());
}

#[tokio::test]
async fn test_persistence_failure_surfaces_reason() {
    let fetcher = Arc::new(fetcher_with_segments(2, 10));
    let sink = Arc::new(MemorySink {
        fail_with: Some("disk full".to_string()),
        ..MemorySink::default()
    });

    let snapshot = run_to_end(fetcher, sink, request(false)).await;

    assert_eq!(snapshot.status, JobStatus::Error);
    assert_eq!(snapshot.error.as_deref(), Some("disk full"));
    assert!(snapshot.progress >= 95.0);
}

#[tokio::test]
async fn test_cancel_mid_download() {
    let (announce, mut announced) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let mut fetcher = fetcher_with_segments(5, 10);
    fetcher.pause = Some((segment_url(1), announce, release.clone()));
    let fetcher = Arc::new(fetcher);
    let sink = Arc::new(MemorySink::default());

    let manager = DownloadManager::new(fetcher.clone(), sink.clone(), test_config());
    let mut progress = manager.subscribe();
    let id = manager.start_download(request(false)).await;

    // 分段 1 正在下载
    announced.recv().await.unwrap();
    assert!(manager.cancel_download(&id).await);
    release.notify_one();

    let snapshot = manager.wait_for_completion(&id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Cancelled);
    assert!(snapshot.cancelled);
    assert_eq!(snapshot.segments_downloaded, 2);
    assert!(sink.saved().is_empty());
    assert!(!fetcher.fetched().contains(&segment_url(2)));

    // 从未进入合并
    let mut statuses = Vec::new();
    while let Ok(event) = progress.try_recv() {
        statuses.push(event.snapshot.status);
    }
    assert!(!statuses.contains(&JobStatus::Merging));
    assert_eq!(statuses.last(), Some(&JobStatus::Cancelled));
    assert!(!manager.cancel_download(&id).await);
}

#[tokio::test]
async fn test_cancel_during_last_segment_stops_after_merging() {
    let (announce, mut announced) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let mut fetcher = fetcher_with_segments(3, 10);
    fetcher.pause = Some((segment_url(2), announce, release.clone()));
    let sink = Arc::new(MemorySink::default());

    let manager = DownloadManager::new(Arc::new(fetcher), sink.clone(), test_config());
    let mut progress = manager.subscribe();
    let id = manager.start_download(request(false)).await;

    // 最后一个分段正在下载
    announced.recv().await.unwrap();
    assert!(manager.cancel_download(&id).await);
    release.notify_one();

    let snapshot = manager.wait_for_completion(&id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Cancelled);
    assert_eq!(snapshot.segments_downloaded, 3);
    assert!(snapshot.output_file.is_none());
    assert!(sink.saved().is_empty());

    let mut statuses = Vec::new();
    while let Ok(event) = progress.try_recv() {
        statuses.push(event.snapshot.status);
    }
    assert!(statuses.contains(&JobStatus::Merging));
    assert!(!statuses.contains(&JobStatus::Converting));
    assert_eq!(statuses.last(), Some(&JobStatus::Cancelled));
}

#[tokio::test]
async fn test_throttled_progress_only_publishes_transitions() {
    let fetcher = Arc::new(fetcher_with_segments(5, 10));
    let sink = Arc::new(MemorySink::default());
    let config = Config {
        progress_interval: Duration::from_secs(60),
        ..test_config()
    };

    let manager = DownloadManager::new(fetcher, sink, config);
    let mut progress = manager.subscribe();
    let id = manager.start_download(request(false)).await;
    let snapshot = manager.wait_for_completion(&id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.segments_downloaded, 5);

    let mut events = Vec::new();
    while let Ok(event) = progress.try_recv() {
        events.push(event.snapshot);
    }
    let statuses: Vec<JobStatus> = events.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        [
            JobStatus::Downloading,
            JobStatus::Merging,
            JobStatus::Converting,
            JobStatus::Completed
        ]
    );
    assert_eq!(events[0].segments_downloaded, 0);
    assert_eq!(events[1].segments_downloaded, 5);
}

#[tokio::test]
async fn test_removed_job_publishes_nothing_more() {
    let (announce, mut announced) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let mut fetcher = fetcher_with_segments(3, 10);
    fetcher.pause = Some((segment_url(0), announce, release.clone()));
    let sink = Arc::new(MemorySink::default());

    let manager = DownloadManager::new(Arc::new(fetcher), sink.clone(), test_config());
    let id = manager.start_download(request(false)).await;
    announced.recv().await.unwrap();

    let mut progress = manager.subscribe();
    manager.remove_download(&id).await;
    release.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(manager.get_active_downloads().await.is_empty());
    assert!(progress.try_recv().is_err());
    assert!(sink.saved().is_empty());
}

#[tokio::test]
async fn test_aes128_segments_are_decrypted() {
    let key = [0x2Bu8; 16];
    let playlist = "#EXTM3U\n\
        #EXT-X-MEDIA-SEQUENCE:7\n\
        #EXT-X-KEY:METHOD=AES-128,URI=\"/keys/k1\"\n\
        #EXTINF:4,\nseg0.ts\n\
        #EXTINF:4,\nseg1.ts\n";

    let encrypt = |plain: &[u8], sequence: u64| {
        let mut iv = [0u8; 16];
        iv[8..].copy_from_slice(&sequence.to_be_bytes());
        let mut buf = vec![0u8; plain.len() + 16];
        buf[..plain.len()].copy_from_slice(plain);
        cbc::Encryptor::<aes::Aes128>::new(key.as_slice().into(), iv.as_slice().into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plain.len())
            .unwrap()
            .to_vec()
    };

    let fetcher = Arc::new(
        FakeFetcher::default()
            .with(MANIFEST, playlist)
            .with("https://cdn.example.com/keys/k1", key.to_vec())
            .with(&segment_url(0), encrypt(b"first-", 7))
            .with(&segment_url(1), encrypt(b"second", 8)),
    );
    let sink = Arc::new(MemorySink::default());

    let snapshot = run_to_end(fetcher.clone(), sink.clone(), request(false)).await;

    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.downloaded_bytes, 12);
    assert_eq!(&sink.saved()[0].1[..], b"first-second");

    let key_fetches = fetcher
        .fetched()
        .iter()
        .filter(|u| u.ends_with("/keys/k1"))
        .count();
    assert_eq!(key_fetches, 1);
}

#[tokio::test]
async fn test_master_manifest_follows_requested_variant() {
    let master = "#EXTM3U\n\
        #EXT-X-STREAM-INF:BANDWIDTH=500000,RESOLUTION=640x360\n\
        low/index.m3u8\n\
        #EXT-X-STREAM-INF:BANDWIDTH=1200000,RESOLUTION=1280x720\n\
        high/index.m3u8\n";
    let fetcher = Arc::new(
        FakeFetcher::default()
            .with(MANIFEST, master)
            .with("https://cdn.example.com/live/low/index.m3u8", "#EXTM3U\n#EXTINF:4,\na.ts\n")
            .with("https://cdn.example.com/live/low/a.ts", vec![1u8; 5]),
    );
    let sink = Arc::new(MemorySink::default());

    let mut req = request(false);
    req.quality = "360p".to_string();
    let snapshot = run_to_end(fetcher, sink, req).await;

    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.total_segments, 1);
    assert_eq!(snapshot.downloaded_bytes, 5);
}

#[tokio::test]
async fn test_variant_url_overrides_manifest() {
    let variant = "https://cdn.example.com/live/720/index.m3u8";
    let fetcher = Arc::new(
        FakeFetcher::default()
            .with(variant, "#EXTM3U\n#EXTINF:4,\n/abs/seg.ts\n")
            .with("https://cdn.example.com/abs/seg.ts", vec![9u8; 3]),
    );
    let sink = Arc::new(MemorySink::default());

    let mut req = request(false);
    req.variant_url = Some(variant.to_string());
    let snapshot = run_to_end(fetcher.clone(), sink, req).await;

    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.stream_url, MANIFEST);
    assert!(!fetcher.fetched().contains(&MANIFEST.to_string()));
}

#[tokio::test]
async fn test_active_downloads_ordered_by_start() {
    let fetcher = Arc::new(fetcher_with_segments(1, 1));
    let manager = DownloadManager::new(fetcher, Arc::new(MemorySink::default()), test_config());

    let first = manager.start_download(request(false)).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = manager.start_download(request(true)).await;

    let ids: Vec<_> = manager
        .get_active_downloads()
        .await
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, [first, second]);
}
