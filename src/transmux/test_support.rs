use super::ts::{PACKET_SIZE, PID_PAT, STREAM_TYPE_AAC_ADTS, STREAM_TYPE_H264, SYNC_BYTE};

const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x100;
pub const AUDIO_PID: u16 = 0x101;

struct BitWriter {
    bytes: Vec<u8>,
    bit: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            bit: 0,
        }
    }

    fn put(&mut self, value: u32, bits: u32) {
        for i in (0..bits).rev() {
            if self.bit == 0 {
                self.bytes.push(0);
            }
            let b = ((value >> i) & 1) as u8;
            let last = self.bytes.len() - 1;
            self.bytes[last] |= b << (7 - self.bit);
            self.bit = (self.bit + 1) % 8;
        }
    }

    fn ue(&mut self, value: u32) {
        let code = value + 1;
        let len = 32 - code.leading_zeros();
        self.put(0, len - 1);
        self.put(code, len);
    }

    fn finish(mut self) -> Vec<u8> {
        self.put(1, 1); // rbsp_stop_one_bit
        while self.bit != 0 {
            self.put(0, 1);
        }
        self.bytes
    }
}

pub struct SpsParams {
    pub profile_idc: u8,
    pub width_mbs: u32,
    pub height_mbs: u32,
    pub crop_bottom: u32,
}

/// 构造逐行 4:2:0 视频的 SPS NAL（含头字节）
pub fn build_sps(params: SpsParams) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.put(params.profile_idc as u32, 8);
    w.put(0xC0, 8);
    w.put(30, 8);
    w.ue(0); // sps id
    if params.profile_idc == 100 {
        w.ue(1); // chroma_format_idc
        w.ue(0);
        w.ue(0);
        w.put(0, 1);
        w.put(0, 1); // no scaling matrix
    }
    w.ue(0); // log2_max_frame_num_minus4
    w.ue(2); // pic_order_cnt_type
    w.ue(1); // max_num_ref_frames
    w.put(0, 1);
    w.ue(params.width_mbs - 1);
    w.ue(params.height_mbs - 1);
    w.put(1, 1); // frame_mbs_only
    w.put(1, 1); // direct_8x8_inference
    if params.crop_bottom > 0 {
        w.put(1, 1);
        w.ue(0);
        w.ue(0);
        w.ue(0);
        w.ue(params.crop_bottom);
    } else {
        w.put(0, 1);
    }
    w.put(0, 1); // no VUI

    let mut nal = vec![0x67];
    let mut zeros = 0;
    for b in w.finish() {
        if zeros >= 2 && b <= 3 {
            nal.push(3);
            zeros = 0;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        nal.push(b);
    }
    nal
}

/// 一个 Annex B 访问单元：AUD，关键帧带 SPS/PPS，最后是一个 slice
pub fn h264_access_unit(keyframe: bool) -> Vec<u8> {
    let mut au = vec![0, 0, 0, 1, 0x09, 0xF0];
    if keyframe {
        au.extend_from_slice(&[0, 0, 0, 1]);
        au.extend(build_sps(SpsParams {
            profile_idc: 66,
            width_mbs: 20,
            height_mbs: 15,
            crop_bottom: 0,
        }));
        au.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80]);
        au.extend_from_slice(&[0, 0, 1, 0x65, 0x88, 0x84, 0x21, 0xA0]);
    } else {
        au.extend_from_slice(&[0, 0, 1, 0x41, 0x9A, 0x22, 0x11]);
    }
    au
}

/// AAC-LC、44.1 kHz 立体声 ADTS 帧，负载为 `payload_len` 个填充字节
pub fn adts_frame(payload_len: usize) -> Vec<u8> {
    let len = payload_len + 7;
    let mut frame = vec![
        0xFF,
        0xF1,
        0x50,
        0x80 | ((len >> 11) & 0x03) as u8,
        ((len >> 3) & 0xFF) as u8,
        (((len & 0x07) << 5) as u8) | 0x1F,
        0xFC,
    ];
    frame.extend(std::iter::repeat(0x21).take(payload_len));
    frame
}

pub fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    [
        (prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 1,
        ((ts >> 22) & 0xFF) as u8,
        ((((ts >> 15) & 0x7F) as u8) << 1) | 1,
        ((ts >> 7) & 0xFF) as u8,
        (((ts & 0x7F) as u8) << 1) | 1,
    ]
}

/// 188 字节的 TS 包，负载不足时用自适应字段填充
fn ts_packet(pid: u16, pusi: bool, cc: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= PACKET_SIZE - 4);
    let mut packet = vec![
        SYNC_BYTE,
        (if pusi { 0x40 } else { 0 }) | ((pid >> 8) as u8 & 0x1F),
        (pid & 0xFF) as u8,
    ];
    let stuffing = PACKET_SIZE - 4 - payload.len();
    if stuffing == 0 {
        packet.push(0x10 | (cc & 0x0F));
    } else {
        packet.push(0x30 | (cc & 0x0F));
        packet.push((stuffing - 1) as u8);
        if stuffing > 1 {
            packet.push(0x00);
            packet.extend(std::iter::repeat(0xFF).take(stuffing - 2));
        }
    }
    packet.extend_from_slice(payload);
    packet
}

fn psi_packet(pid: u16, table_id: u8, body: &[u8]) -> Vec<u8> {
    let section_length = body.len() + 5 + 4;
    let mut section = vec![
        0x00, // pointer field
        table_id,
        0xB0 | ((section_length >> 8) & 0x0F) as u8,
        (section_length & 0xFF) as u8,
        0x00,
        0x01,
        0xC1,
        0x00,
        0x00,
    ];
    section.extend_from_slice(body);
    section.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]); // 不校验 CRC
    ts_packet(pid, true, 0, &section)
}

pub fn pat_packet(pmt_pid: u16) -> Vec<u8> {
    psi_packet(
        PID_PAT,
        0x00,
        &[0x00, 0x01, 0xE0 | (pmt_pid >> 8) as u8, (pmt_pid & 0xFF) as u8],
    )
}

pub fn pmt_packet(pmt_pid: u16, streams: &[(u8, u16)]) -> Vec<u8> {
    let mut body = vec![0xE1, 0x00, 0xF0, 0x00]; // PCR pid, program_info_length = 0
    for &(stream_type, pid) in streams {
        let pid_bytes = [0xE0 | (pid >> 8) as u8, (pid & 0xFF) as u8];
        body.extend_from_slice(&[stream_type, pid_bytes[0], pid_bytes[1], 0xF0, 0x00]);
    }
    psi_packet(pmt_pid, 0x02, &body)
}

/// 把一个 PES（包头 + `es`）切分到所需数量的 TS 包中
pub fn pes_packets(pid: u16, stream_id: u8, pts: u64, dts: Option<u64>, es: &[u8]) -> Vec<Vec<u8>> {
    let mut pes = vec![0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80];
    match dts {
        Some(dts) => {
            pes.extend_from_slice(&[0xC0, 10]);
            pes.extend_from_slice(&encode_timestamp(0x3, pts));
            pes.extend_from_slice(&encode_timestamp(0x1, dts));
        }
        None => {
            pes.extend_from_slice(&[0x80, 5]);
            pes.extend_from_slice(&encode_timestamp(0x2, pts));
        }
    }
    pes.extend_from_slice(es);

    pes.chunks(PACKET_SIZE - 4)
        .enumerate()
        .map(|(i, chunk)| ts_packet(pid, i == 0, i as u8, chunk))
        .collect()
}

/// 包含 `frames` 个视频访问单元（首帧为关键帧）和对应 ADTS 音频的完整流，
/// 音视频均可省略
pub fn sample_stream(with_video: bool, with_audio: bool, frames: usize) -> Vec<u8> {
    let mut streams = Vec::new();
    if with_video {
        streams.push((STREAM_TYPE_H264, VIDEO_PID));
    }
    if with_audio {
        streams.push((STREAM_TYPE_AAC_ADTS, AUDIO_PID));
    }

    let mut out = pat_packet(PMT_PID);
    out.extend(pmt_packet(PMT_PID, &streams));

    for i in 0..frames as u64 {
        let base = 126_000 + i * 3003;
        if with_video {
            let access_unit = h264_access_unit(i == 0);
            for p in pes_packets(VIDEO_PID, 0xE0, base + 3003, Some(base), &access_unit) {
                out.extend(p);
            }
        }
        if with_audio {
            let mut frames = adts_frame(24);
            frames.extend(adts_frame(30));
            for p in pes_packets(AUDIO_PID, 0xC0, base, None, &frames) {
                out.extend(p);
            }
        }
    }
    out
}
