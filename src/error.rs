use thiserror::Error;

/// 网络获取失败（清单、分段或密钥）
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error! status: {status} ({url})")]
    Status { url: String, status: u16 },

    #[error("{0}")]
    Other(String),
}

/// 分段解密失败
#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("invalid key length: expected 16 bytes, got {0}")]
    KeyLength(usize),

    #[error("invalid IV: {0}")]
    Iv(String),

    #[error("decryption error: {0}")]
    Padding(String),
}

/// 单个分段失败；任务会跳过该分段继续
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Decrypt(#[from] DecryptError),
}

/// 传输流解复用过程中的错误
#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("no transport stream packets found")]
    NoPackets,

    #[error("invalid SPS: {0}")]
    InvalidSps(&'static str),

    #[error("invalid ADTS header at offset {0}")]
    InvalidAdts(usize),

    #[error("media data too large for a 32-bit box ({0} bytes)")]
    BoxTooLarge(usize),
}

/// 转封装失败。均不致命：调用方会回退到原始 TS 容器。
#[derive(Debug, Error)]
pub enum TransmuxError {
    #[error("conversion timed out after {0:?} without producing output")]
    Timeout(std::time::Duration),

    #[error("no audio data found")]
    NoAudioTrack,

    #[error("no MP4 segments generated")]
    NoOutput,

    #[error("conversion failed: {0}")]
    Conversion(String),
}

impl From<DemuxError> for TransmuxError {
    fn from(e: DemuxError) -> Self {
        TransmuxError::Conversion(e.to_string())
    }
}

/// 持久化失败，错误信息原样展示给观察者
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct PersistError {
    pub reason: String,
}

impl PersistError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        PersistError::new(e.to_string())
    }
}

/// 导致任务进入 `error` 状态的错误
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    ManifestFetch(#[source] FetchError),

    #[error("{0}")]
    Persistence(#[source] PersistError),
}
