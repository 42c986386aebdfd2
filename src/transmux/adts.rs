use crate::error::DemuxError;

pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// 每个 AAC 帧的采样数
pub const FRAME_SAMPLES: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// MPEG-4 音频对象类型（profile + 1）
    pub object_type: u8,
    pub sampling_index: u8,
    pub channels: u8,
    /// 帧头加负载的长度
    pub frame_length: usize,
    pub header_length: usize,
}

impl AdtsHeader {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, DemuxError> {
        let h = data
            .get(offset..offset + 7)
            .ok_or(DemuxError::InvalidAdts(offset))?;
        if h[0] != 0xFF || (h[1] & 0xF0) != 0xF0 {
            return Err(DemuxError::InvalidAdts(offset));
        }

        let protection_absent = h[1] & 0x01 == 1;
        let object_type = ((h[2] >> 6) & 0x03) + 1;
        let sampling_index = (h[2] >> 2) & 0x0F;
        let channels = ((h[2] & 0x01) << 2) | ((h[3] >> 6) & 0x03);
        let frame_length =
            (((h[3] & 0x03) as usize) << 11) | ((h[4] as usize) << 3) | ((h[5] as usize) >> 5);
        let header_length = if protection_absent { 7 } else { 9 };

        if sampling_index as usize >= SAMPLE_RATES.len() || frame_length < header_length {
            return Err(DemuxError::InvalidAdts(offset));
        }

        Ok(Self {
            object_type,
            sampling_index,
            channels,
            frame_length,
            header_length,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATES[self.sampling_index as usize]
    }

    /// `esds` 中使用的两字节 AudioSpecificConfig
    pub fn audio_specific_config(&self) -> [u8; 2] {
        let v = ((self.object_type as u16) << 11)
            | ((self.sampling_index as u16) << 7)
            | ((self.channels as u16) << 3);
        v.to_be_bytes()
    }
}

/// 从缓冲区中拆出的 ADTS 帧
#[derive(Debug, Default)]
pub struct AdtsFrames<'a> {
    /// 第一个有效帧的帧头
    pub first: Option<AdtsHeader>,
    /// 去掉帧头的原始 AAC 帧
    pub frames: Vec<&'a [u8]>,
    /// 已处理的字节数；之后的数据是不完整的帧，应与下一个 PES 拼接
    pub consumed: usize,
}

/// 拆分 ADTS 帧，遇到损坏数据时向后搜索下一个同步字
pub fn split_frames(data: &[u8]) -> AdtsFrames<'_> {
    let mut out = AdtsFrames::default();
    let mut offset = 0;

    while offset + 7 <= data.len() {
        match AdtsHeader::parse(data, offset) {
            Ok(header) if offset + header.frame_length <= data.len() => {
                out.frames
                    .push(&data[offset + header.header_length..offset + header.frame_length]);
                out.first.get_or_insert(header);
                offset += header.frame_length;
            }
            Ok(_) => break,
            Err(_) => offset += 1,
        }
    }

    out.consumed = offset;
    out
}
