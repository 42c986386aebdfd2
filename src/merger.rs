use bytes::{Bytes, BytesMut};
use log::info;

/// `MediaBuffer` 的容器格式，决定保存时的扩展名
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    TransportStream,
    FragmentedMp4,
    AudioOnly,
}

impl ContainerFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ContainerFormat::TransportStream => "ts",
            ContainerFormat::FragmentedMp4 => "mp4",
            ContainerFormat::AudioOnly => "mp3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBuffer {
    pub data: Bytes,
    pub format: ContainerFormat,
}

impl MediaBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 按下载顺序拼接所有分段
pub fn merge_segments(segments: Vec<Bytes>) -> MediaBuffer {
    let total: usize = segments.iter().map(Bytes::len).sum();
    let mut merged = BytesMut::with_capacity(total);
    for segment in &segments {
        merged.extend_from_slice(segment);
    }

    info!("Merged {} segments into {} bytes", segments.len(), total);

    MediaBuffer {
        data: merged.freeze(),
        format: ContainerFormat::TransportStream,
    }
}
