use crate::error::DemuxError;

pub const VIDEO_TIMESCALE: u32 = 90_000;

const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

const MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub data: Vec<u8>,
    pub duration: u32,
    pub composition_offset: u32,
    pub keyframe: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackCodec {
    Avc {
        width: u32,
        height: u32,
        sps: Vec<u8>,
        pps: Vec<u8>,
    },
    Aac {
        sample_rate: u32,
        channels: u8,
        audio_specific_config: [u8; 2],
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub id: u32,
    pub timescale: u32,
    /// 第一个样本的解码时间，单位为 `timescale`
    pub base_decode_time: u64,
    pub codec: TrackCodec,
    pub samples: Vec<Sample>,
}

impl Track {
    pub fn is_video(&self) -> bool {
        matches!(self.codec, TrackCodec::Avc { .. })
    }
}

fn write_box(buf: &mut Vec<u8>, fourcc: &[u8; 4], body: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.extend_from_slice(&[0; 4]);
    buf.extend_from_slice(fourcc);
    body(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn write_full_box(
    buf: &mut Vec<u8>,
    fourcc: &[u8; 4],
    version: u8,
    flags: u32,
    body: impl FnOnce(&mut Vec<u8>),
) {
    write_box(buf, fourcc, |b| {
        b.push(version);
        b.extend_from_slice(&flags.to_be_bytes()[1..]);
        body(b);
    });
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// 生成初始化分段：ftyp | moov(mvhd, trak*, mvex(trex*))
pub fn init_segment(tracks: &[&Track]) -> Vec<u8> {
    let mut buf = Vec::new();

    write_box(&mut buf, b"ftyp", |b| {
        b.extend_from_slice(b"isom");
        put_u32(b, 1);
        for brand in [b"isom", b"iso6", b"avc1", b"mp41"] {
            b.extend_from_slice(brand);
        }
    });

    let next_track_id = tracks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
    write_box(&mut buf, b"moov", |b| {
        write_full_box(b, b"mvhd", 0, 0, |b| {
            put_u32(b, 0); // creation_time
            put_u32(b, 0); // modification_time
            put_u32(b, 1000); // timescale
            put_u32(b, 0); // duration
            put_u32(b, 0x0001_0000); // rate
            put_u16(b, 0x0100); // volume
            b.extend_from_slice(&[0; 10]);
            for m in MATRIX {
                put_u32(b, m);
            }
            b.extend_from_slice(&[0; 24]); // pre_defined
            put_u32(b, next_track_id);
        });

        for track in tracks {
            write_trak(b, track);
        }

        write_box(b, b"mvex", |b| {
            for track in tracks {
                write_full_box(b, b"trex", 0, 0, |b| {
                    put_u32(b, track.id);
                    put_u32(b, 1); // default_sample_description_index
                    put_u32(b, 0); // default_sample_duration
                    put_u32(b, 0); // default_sample_size
                    put_u32(b, 0); // default_sample_flags
                });
            }
        });
    });

    buf
}

fn write_trak(buf: &mut Vec<u8>, track: &Track) {
    write_box(buf, b"trak", |b| {
        write_full_box(b, b"tkhd", 0, 0x03, |b| {
            put_u32(b, 0);
            put_u32(b, 0);
            put_u32(b, track.id);
            put_u32(b, 0); // reserved
            put_u32(b, 0); // duration
            b.extend_from_slice(&[0; 8]);
            put_u16(b, 0); // layer
            put_u16(b, 0); // alternate_group
            put_u16(b, if track.is_video() { 0 } else { 0x0100 });
            put_u16(b, 0);
            for m in MATRIX {
                put_u32(b, m);
            }
            let (width, height) = match &track.codec {
                TrackCodec::Avc { width, height, .. } => (*width, *height),
                TrackCodec::Aac { .. } => (0, 0),
            };
            put_u32(b, width << 16);
            put_u32(b, height << 16);
        });

        write_box(b, b"mdia", |b| {
            write_full_box(b, b"mdhd", 0, 0, |b| {
                put_u32(b, 0);
                put_u32(b, 0);
                put_u32(b, track.timescale);
                put_u32(b, 0);
                put_u16(b, 0x55C4); // language "und"
                put_u16(b, 0);
            });

            let (handler, name): (&[u8; 4], &[u8]) = if track.is_video() {
                (b"vide", &b"VideoHandler\0"[..])
            } else {
                (b"soun", &b"SoundHandler\0"[..])
            };
            write_full_box(b, b"hdlr", 0, 0, |b| {
                put_u32(b, 0);
                b.extend_from_slice(handler);
                b.extend_from_slice(&[0; 12]);
                b.extend_from_slice(name);
            });

            write_box(b, b"minf", |b| {
                if track.is_video() {
                    write_full_box(b, b"vmhd", 0, 1, |b| b.extend_from_slice(&[0; 8]));
                } else {
                    write_full_box(b, b"smhd", 0, 0, |b| b.extend_from_slice(&[0; 4]));
                }
                write_box(b, b"dinf", |b| {
                    write_full_box(b, b"dref", 0, 0, |b| {
                        put_u32(b, 1);
                        write_full_box(b, b"url ", 0, 1, |_| {});
                    });
                });
                write_box(b, b"stbl", |b| {
                    write_full_box(b, b"stsd", 0, 0, |b| {
                        put_u32(b, 1);
                        write_sample_entry(b, &track.codec);
                    });
                    write_full_box(b, b"stts", 0, 0, |b| put_u32(b, 0));
                    write_full_box(b, b"stsc", 0, 0, |b| put_u32(b, 0));
                    write_full_box(b, b"stsz", 0, 0, |b| {
                        put_u32(b, 0);
                        put_u32(b, 0);
                    });
                    write_full_box(b, b"stco", 0, 0, |b| put_u32(b, 0));
                });
            });
        });
    });
}

fn write_sample_entry(buf: &mut Vec<u8>, codec: &TrackCodec) {
    match codec {
        TrackCodec::Avc {
            width,
            height,
            sps,
            pps,
        } => write_box(buf, b"avc1", |b| {
            b.extend_from_slice(&[0; 6]);
            put_u16(b, 1); // data_reference_index
            b.extend_from_slice(&[0; 16]);
            put_u16(b, *width as u16);
            put_u16(b, *height as u16);
            put_u32(b, 0x0048_0000); // 72 dpi
            put_u32(b, 0x0048_0000);
            put_u32(b, 0);
            put_u16(b, 1); // frame_count
            b.extend_from_slice(&[0; 32]); // compressor name
            put_u16(b, 0x0018); // depth
            put_u16(b, 0xFFFF); // pre_defined = -1

            write_box(b, b"avcC", |b| {
                b.push(1);
                b.extend_from_slice(sps.get(1..4).unwrap_or(&[0x42, 0xC0, 0x1E]));
                b.push(0xFF); // 4-byte NAL lengths
                b.push(0xE1); // one SPS
                put_u16(b, sps.len() as u16);
                b.extend_from_slice(sps);
                b.push(1); // one PPS
                put_u16(b, pps.len() as u16);
                b.extend_from_slice(pps);
            });
        }),
        TrackCodec::Aac {
            sample_rate,
            channels,
            audio_specific_config,
        } => write_box(buf, b"mp4a", |b| {
            b.extend_from_slice(&[0; 6]);
            put_u16(b, 1);
            b.extend_from_slice(&[0; 8]);
            put_u16(b, *channels as u16);
            put_u16(b, 16); // sample size
            put_u32(b, 0);
            put_u32(b, sample_rate << 16);
            write_esds(b, audio_specific_config);
        }),
    }
}

fn write_esds(buf: &mut Vec<u8>, asc: &[u8; 2]) {
    write_full_box(buf, b"esds", 0, 0, |b| {
        let mut decoder_specific = vec![0x05, asc.len() as u8];
        decoder_specific.extend_from_slice(asc);
        let mut decoder_config = vec![0x04, (13 + decoder_specific.len()) as u8];
        decoder_config.push(0x40); // MPEG-4 audio
        decoder_config.push(0x15); // audio stream
        decoder_config.extend_from_slice(&[0; 3]); // buffer size
        decoder_config.extend_from_slice(&[0; 8]); // max / avg bitrate
        decoder_config.extend_from_slice(&decoder_specific);
        let sl_config = [0x06, 0x01, 0x02];

        b.push(0x03);
        b.push((3 + decoder_config.len() + sl_config.len()) as u8);
        put_u16(b, 0); // ES_ID
        b.push(0);
        b.extend_from_slice(&decoder_config);
        b.extend_from_slice(&sl_config);
    });
}

/// 生成一个媒体分段，覆盖轨道的全部样本：
/// moof(mfhd, traf(tfhd, tfdt, trun)) | mdat
pub fn media_segment(track: &Track, sequence_number: u32) -> Result<Vec<u8>, DemuxError> {
    let payload: usize = track.samples.iter().map(|s| s.data.len()).sum();
    let mdat_size = payload + 8;
    if mdat_size > u32::MAX as usize {
        return Err(DemuxError::BoxTooLarge(mdat_size));
    }

    let video = track.is_video();
    // data-offset | duration | size，视频另有 flags 和 composition offset
    let trun_flags = if video { 0x000F01 } else { 0x000301 };

    let mut buf = Vec::with_capacity(mdat_size + 64 + track.samples.len() * 16);
    let mut data_offset_pos = 0;

    write_box(&mut buf, b"moof", |b| {
        write_full_box(b, b"mfhd", 0, 0, |b| put_u32(b, sequence_number));
        write_box(b, b"traf", |b| {
            // default-base-is-moof
            write_full_box(b, b"tfhd", 0, 0x02_0000, |b| put_u32(b, track.id));
            write_full_box(b, b"tfdt", 1, 0, |b| {
                b.extend_from_slice(&track.base_decode_time.to_be_bytes())
            });
            write_full_box(b, b"trun", 0, trun_flags, |b| {
                put_u32(b, track.samples.len() as u32);
                data_offset_pos = b.len();
                put_u32(b, 0);
                for sample in &track.samples {
                    put_u32(b, sample.duration);
                    put_u32(b, sample.data.len() as u32);
                    if video {
                        put_u32(
                            b,
                            if sample.keyframe {
                                SAMPLE_FLAGS_SYNC
                            } else {
                                SAMPLE_FLAGS_NON_SYNC
                            },
                        );
                        put_u32(b, sample.composition_offset);
                    }
                }
            });
        });
    });

    let data_offset = (buf.len() + 8) as u32;
    buf[data_offset_pos..data_offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());

    put_u32(&mut buf, mdat_size as u32);
    buf.extend_from_slice(b"mdat");
    for sample in &track.samples {
        buf.extend_from_slice(&sample.data);
    }

    Ok(buf)
}

/// 按顺序列出顶层 box 类型，用于检查输出
pub fn top_level_boxes(data: &[u8]) -> Vec<[u8; 4]> {
    let mut boxes = Vec::new();
    let mut offset = 0;
    while offset + 8 <= data.len() {
        let size = u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        if size < 8 || offset + size > data.len() {
            break;
        }
        boxes.push([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        offset += size;
    }
    boxes
}
