use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use log::info;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::PersistError;

/// 下载结果的落盘位置，返回保存的文件名
pub trait PersistenceSink: Send + Sync {
    fn persist<'a>(
        &'a self,
        data: Bytes,
        suggested_filename: &'a str,
    ) -> BoxFuture<'a, Result<String, PersistError>>;
}

/// 生成文件名 `video_<quality>_<epochMillis>.<ext>`
pub fn suggested_filename(quality: &str, extension: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let quality: String = quality
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("video_{}_{}.{}", quality, millis, extension)
}

/// 写入指定目录，首次使用时创建目录
#[derive(Debug, Clone)]
pub struct FileSink {
    output_dir: PathBuf,
}

impl FileSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    async fn write(&self, data: Bytes, filename: &str) -> Result<String, PersistError> {
        fs::create_dir_all(&self.output_dir).await?;
        let path = self.output_dir.join(filename);

        let mut file = fs::File::create(&path).await?;
        file.write_all(&data).await?;
        file.flush().await?;

        info!("Saved {} bytes to {:?}", data.len(), path);
        Ok(path.to_string_lossy().into_owned())
    }
}

impl PersistenceSink for FileSink {
    fn persist<'a>(
        &'a self,
        data: Bytes,
        suggested_filename: &'a str,
    ) -> BoxFuture<'a, Result<String, PersistError>> {
        self.write(data, suggested_filename).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggested_filename() {
        let name = suggested_filename("720p", "mp4");
        assert!(name.starts_with("video_720p_"));
        assert!(name.ends_with(".mp4"));

        let name = suggested_filename("a/b", "ts");
        assert!(name.starts_with("video_a_b_"));
    }

    #[tokio::test]
    async fn test_file_sink_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("nested"));

        let saved = sink
            .persist(Bytes::from_static(b"payload"), "video_720p_1.ts")
            .await
            .unwrap();

        assert!(saved.ends_with("video_720p_1.ts"));
        let written = std::fs::read(dir.path().join("nested").join("video_720p_1.ts")).unwrap();
        assert_eq!(written, b"payload");
    }

    #[tokio::test]
    async fn test_file_sink_reports_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        // 目录位置上是一个普通文件
        let sink = FileSink::new(&blocker);
        let err = sink.persist(Bytes::new(), "out.ts").await.unwrap_err();
        assert!(!err.reason.is_empty());
    }
}
