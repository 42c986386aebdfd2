pub mod adts;
pub mod fmp4;
pub mod h264;
pub mod ts;

#[cfg(test)]
pub(crate) mod test_support;

use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{DemuxError, TransmuxError};
use crate::merger::{ContainerFormat, MediaBuffer};
use fmp4::{Sample, Track, TrackCodec, VIDEO_TIMESCALE};
use ts::{PesPacket, StreamKind, TsDemuxer};

/// 缺少时间戳时使用的帧时长（29.97 fps）
const DEFAULT_VIDEO_DURATION: u32 = 3003;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
    Video,
    Audio,
    /// 所有轨道共用一个初始化分段和一个媒体分段
    Combined,
}

/// 编解码器的一次输出，按发出顺序拼接
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub track: TrackType,
    pub init_segment: Option<Bytes>,
    pub data: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmuxOptions {
    /// 将音视频合并为一个影片，而不是每个轨道单独输出
    pub remux: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Video,
    AudioOnly,
}

/// 编解码器与收集器之间的事件
#[derive(Debug)]
pub enum TransmuxEvent {
    Data(Fragment),
    Done,
    Failed(String),
}

/// 解复用/重封装组件，在阻塞线程上运行。
/// 每个分段以 `Data` 发出，最后发出 `Done` 或 `Failed`
pub trait Codec: Send + Sync + 'static {
    fn transmux(
        &self,
        input: &[u8],
        options: TransmuxOptions,
        events: &mpsc::UnboundedSender<TransmuxEvent>,
    );
}

/// 基于内置 TS 解复用器和 fMP4 写入器的编解码器
#[derive(Debug, Default, Clone, Copy)]
pub struct TsCodec;

impl Codec for TsCodec {
    fn transmux(
        &self,
        input: &[u8],
        options: TransmuxOptions,
        events: &mpsc::UnboundedSender<TransmuxEvent>,
    ) {
        let mut transmuxer = Transmuxer::new(options);
        transmuxer.push(input);
        match transmuxer.flush() {
            Ok(fragments) => {
                for fragment in fragments {
                    let _ = events.send(TransmuxEvent::Data(fragment));
                }
                let _ = events.send(TransmuxEvent::Done);
            }
            Err(e) => {
                let _ = events.send(TransmuxEvent::Failed(e.to_string()));
            }
        }
    }
}

/// 基于 TS 的 push/flush 转封装器
#[derive(Debug)]
pub struct Transmuxer {
    options: TransmuxOptions,
    demuxer: TsDemuxer,
    packets: Vec<PesPacket>,
}

impl Transmuxer {
    pub fn new(options: TransmuxOptions) -> Self {
        Self {
            options,
            demuxer: TsDemuxer::new(),
            packets: Vec::new(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        let packets = self.demuxer.push(data);
        self.packets.extend(packets);
    }

    /// 结束输入并生成全部分段
    pub fn flush(mut self) -> Result<Vec<Fragment>, DemuxError> {
        let rest = self.demuxer.flush();
        self.packets.extend(rest);

        if self.demuxer.packet_count() == 0 {
            return Err(DemuxError::NoPackets);
        }

        let (video_pes, audio_pes): (Vec<_>, Vec<_>) = self
            .packets
            .into_iter()
            .partition(|p| p.kind == StreamKind::H264);

        let video = build_video(&video_pes)?;
        let audio = build_audio(&audio_pes);

        let origin = [video.as_ref().map(|v| v.first_dts), audio.as_ref().map(|a| a.first_pts)]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(0);

        let mut tracks = Vec::new();
        if let Some(v) = video {
            tracks.push(Track {
                id: tracks.len() as u32 + 1,
                timescale: VIDEO_TIMESCALE,
                base_decode_time: v.first_dts - origin,
                codec: v.codec,
                samples: v.samples,
            });
        }
        if let Some(a) = audio {
            tracks.push(Track {
                id: tracks.len() as u32 + 1,
                timescale: a.sample_rate,
                base_decode_time: (a.first_pts - origin) * a.sample_rate as u64 / 90_000,
                codec: a.codec,
                samples: a.samples,
            });
        }

        debug!(
            "Transmuxer found {} track(s): {:?}",
            tracks.len(),
            tracks.iter().map(|t| (t.id, t.samples.len())).collect::<Vec<_>>()
        );

        if tracks.is_empty() {
            return Ok(Vec::new());
        }

        if self.options.remux {
            let refs: Vec<&Track> = tracks.iter().collect();
            let init = fmp4::init_segment(&refs);
            let mut data = Vec::new();
            for (i, track) in tracks.iter().enumerate() {
                data.extend(fmp4::media_segment(track, i as u32 + 1)?);
            }
            return Ok(vec![Fragment {
                track: TrackType::Combined,
                init_segment: Some(Bytes::from(init)),
                data: Some(Bytes::from(data)),
            }]);
        }

        tracks
            .iter()
            .map(|track| {
                Ok(Fragment {
                    track: if track.is_video() {
                        TrackType::Video
                    } else {
                        TrackType::Audio
                    },
                    init_segment: Some(Bytes::from(fmp4::init_segment(&[track]))),
                    data: Some(Bytes::from(fmp4::media_segment(track, 1)?)),
                })
            })
            .collect()
    }
}

struct VideoTrackData {
    codec: TrackCodec,
    first_dts: u64,
    samples: Vec<Sample>,
}

struct AudioTrackData {
    codec: TrackCodec,
    sample_rate: u32,
    first_pts: u64,
    samples: Vec<Sample>,
}

fn build_video(packets: &[PesPacket]) -> Result<Option<VideoTrackData>, DemuxError> {
    let mut sps: Option<Vec<u8>> = None;
    let mut pps: Option<Vec<u8>> = None;
    // (dts, pts, sample)
    let mut units: Vec<(u64, u64, h264::AvccSample)> = Vec::new();
    let mut last_dts: Option<u64> = None;

    for packet in packets {
        let nals = h264::split_annex_b(&packet.payload);
        for nal in &nals {
            match h264::nal_type(nal) {
                h264::NAL_SPS if sps.is_none() => sps = Some(nal.to_vec()),
                h264::NAL_PPS if pps.is_none() => pps = Some(nal.to_vec()),
                _ => {}
            }
        }

        let Some(sample) = h264::to_avcc_sample(&nals) else {
            continue;
        };
        // 跳过第一个关键帧之前无法解码的帧
        if units.is_empty() && !sample.keyframe {
            continue;
        }

        let dts = match packet.dts.or(packet.pts) {
            Some(ts) => ts,
            None => last_dts.map(|d| d + DEFAULT_VIDEO_DURATION as u64).unwrap_or(0),
        };
        let pts = packet.pts.unwrap_or(dts);
        last_dts = Some(dts);
        units.push((dts, pts, sample));
    }

    let (Some(sps), Some(pps)) = (sps, pps) else {
        if !units.is_empty() {
            warn!("H.264 stream has no SPS/PPS, dropping video track");
        }
        return Ok(None);
    };
    if units.is_empty() {
        return Ok(None);
    }

    let info = h264::parse_sps(&sps)?;
    let first_dts = units[0].0;

    let mut samples = Vec::with_capacity(units.len());
    let mut previous_duration = DEFAULT_VIDEO_DURATION;
    for i in 0..units.len() {
        let (dts, pts, _) = &units[i];
        let duration = match units.get(i + 1) {
            Some((next_dts, _, _)) if next_dts > dts => (next_dts - dts) as u32,
            _ => previous_duration,
        };
        previous_duration = duration;
        let composition_offset = pts.saturating_sub(*dts) as u32;
        samples.push((duration, composition_offset));
    }

    let samples = units
        .into_iter()
        .zip(samples)
        .map(|((_, _, sample), (duration, composition_offset))| Sample {
            data: sample.data,
            duration,
            composition_offset,
            keyframe: sample.keyframe,
        })
        .collect();

    Ok(Some(VideoTrackData {
        codec: TrackCodec::Avc {
            width: info.width,
            height: info.height,
            sps,
            pps,
        },
        first_dts,
        samples,
    }))
}

fn build_audio(packets: &[PesPacket]) -> Option<AudioTrackData> {
    let mut header: Option<adts::AdtsHeader> = None;
    let mut first_pts: Option<u64> = None;
    let mut samples = Vec::new();
    // 跨越 PES 边界的不完整帧，与下一个包拼接
    let mut pending: Vec<u8> = Vec::new();
    let mut pending_pts: Option<u64> = None;

    for packet in packets {
        let (data, pts) = if pending.is_empty() {
            (packet.payload.as_slice(), packet.pts)
        } else {
            pending.extend_from_slice(&packet.payload);
            (pending.as_slice(), pending_pts.or(packet.pts))
        };

        let split = adts::split_frames(data);
        if !split.frames.is_empty() {
            if header.is_none() {
                header = split.first;
            }
            if first_pts.is_none() {
                first_pts = pts;
            }
            samples.extend(split.frames.iter().map(|frame| Sample {
                data: frame.to_vec(),
                duration: adts::FRAME_SAMPLES,
                composition_offset: 0,
                keyframe: true,
            }));
        }

        let tail = data[split.consumed..].to_vec();
        pending_pts = match (tail.is_empty(), split.consumed) {
            (true, _) => None,
            (false, 0) => pts,
            (false, _) => packet.pts,
        };
        pending = tail;
    }
    if !pending.is_empty() {
        debug!("Dropping {} trailing bytes of an incomplete ADTS frame", pending.len());
    }

    let header = header?;
    Some(AudioTrackData {
        codec: TrackCodec::Aac {
            sample_rate: header.sample_rate(),
            channels: header.channels,
            audio_specific_config: header.audio_specific_config(),
        },
        sample_rate: header.sample_rate(),
        first_pts: first_pts.unwrap_or(0),
        samples,
    })
}

/// 按输出模式转换合并后的 TS
#[derive(Clone)]
pub struct ContainerTransmuxer {
    codec: Arc<dyn Codec>,
    watchdog: Duration,
}

impl ContainerTransmuxer {
    pub fn new(codec: Arc<dyn Codec>, watchdog: Duration) -> Self {
        Self { codec, watchdog }
    }

    /// 转封装合并后的 TS，失败时由调用方回退到原始容器
    pub async fn transmux(
        &self,
        input: &MediaBuffer,
        mode: OutputMode,
    ) -> Result<MediaBuffer, TransmuxError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let codec = Arc::clone(&self.codec);
        let data = input.data.clone();
        let options = TransmuxOptions {
            remux: mode == OutputMode::Video,
        };

        let worker = tokio::task::spawn_blocking(move || codec.transmux(&data, options, &tx));

        let output = collect(rx, worker, mode, self.watchdog).await?;
        let format = match mode {
            OutputMode::Video => ContainerFormat::FragmentedMp4,
            OutputMode::AudioOnly => ContainerFormat::AudioOnly,
        };
        info!("Transmuxed {} bytes into {} bytes ({:?})", input.len(), output.len(), format);

        Ok(MediaBuffer {
            data: output,
            format,
        })
    }
}

/// 收集编解码器输出。看门狗在编解码器返回后才开始计时，
/// 此后仍没有任何输出则判定超时
async fn collect(
    mut rx: mpsc::UnboundedReceiver<TransmuxEvent>,
    mut worker: JoinHandle<()>,
    mode: OutputMode,
    watchdog: Duration,
) -> Result<Bytes, TransmuxError> {
    let deadline = tokio::time::sleep(watchdog);
    tokio::pin!(deadline);

    let mut pieces: Vec<Bytes> = Vec::new();
    let mut produced = false;
    let mut closed = false;
    let mut worker_done = false;

    loop {
        tokio::select! {
            event = rx.recv(), if !closed => match event {
                Some(TransmuxEvent::Data(fragment)) => {
                    produced = true;
                    if mode == OutputMode::AudioOnly && fragment.track != TrackType::Audio {
                        continue;
                    }
                    pieces.extend(fragment.init_segment);
                    pieces.extend(fragment.data);
                }
                Some(TransmuxEvent::Done) => break,
                Some(TransmuxEvent::Failed(message)) => {
                    return Err(TransmuxError::Conversion(message));
                }
                None => {
                    closed = true;
                    if produced {
                        warn!("Transmuxer stopped without a completion event");
                        break;
                    }
                }
            },
            joined = &mut worker, if !worker_done => {
                worker_done = true;
                if let Err(e) = joined {
                    return Err(TransmuxError::Conversion(format!("transmuxer panicked: {}", e)));
                }
                deadline.as_mut().reset(tokio::time::Instant::now() + watchdog);
            }
            _ = &mut deadline, if worker_done && !produced => {
                return Err(TransmuxError::Timeout(watchdog));
            }
        }
    }

    if pieces.is_empty() {
        return Err(match mode {
            OutputMode::AudioOnly => TransmuxError::NoAudioTrack,
            OutputMode::Video => TransmuxError::NoOutput,
        });
    }

    let total = pieces.iter().map(Bytes::len).sum();
    let mut out = BytesMut::with_capacity(total);
    for piece in &pieces {
        out.extend_from_slice(piece);
    }
    Ok(out.freeze())
}
