use log::{debug, trace};
use std::collections::HashMap;

pub const PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;
pub const PID_PAT: u16 = 0x0000;

pub const STREAM_TYPE_AAC_ADTS: u8 = 0x0F;
pub const STREAM_TYPE_H264: u8 = 0x1B;

const TIMESTAMP_WRAP: u64 = 1 << 33;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    H264,
    Aac,
}

/// 重组后的 PES 包，时间戳为展开后的 90 kHz 时钟
#[derive(Debug, Clone)]
pub struct PesPacket {
    pub kind: StreamKind,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub payload: Vec<u8>,
}

/// TS 解复用器：通过 PAT/PMT 发现节目，重组 H.264 和 ADTS AAC 的 PES 包。
/// 假定 PSI 段不跨包
#[derive(Debug, Default)]
pub struct TsDemuxer {
    pmt_pid: Option<u16>,
    streams: HashMap<u16, StreamKind>,
    pending: HashMap<u16, Vec<u8>>,
    last_timestamp: HashMap<u16, u64>,
    remainder: Vec<u8>,
    packet_count: usize,
}

/// 从 5 个字节中解析 33 位的 PTS/DTS
fn parse_timestamp(data: &[u8]) -> u64 {
    (((data[0] as u64 >> 1) & 0x07) << 30)
        | ((data[1] as u64) << 22)
        | (((data[2] as u64 >> 1) & 0x7F) << 15)
        | ((data[3] as u64) << 7)
        | ((data[4] as u64 >> 1) & 0x7F)
}

/// 把 `ts` 放到与 `reference` 最接近的 33 位周期上
fn unroll_timestamp(ts: u64, reference: Option<u64>) -> u64 {
    let Some(reference) = reference else {
        return ts;
    };
    let mut value = ts + (reference / TIMESTAMP_WRAP) * TIMESTAMP_WRAP;
    if value + TIMESTAMP_WRAP / 2 < reference {
        value += TIMESTAMP_WRAP;
    } else if value > reference + TIMESTAMP_WRAP / 2 && value >= TIMESTAMP_WRAP {
        value -= TIMESTAMP_WRAP;
    }
    value
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_count(&self) -> usize {
        self.packet_count
    }

    pub fn has_stream(&self, kind: StreamKind) -> bool {
        self.streams.values().any(|k| *k == kind)
    }

    /// 推入任意长度的数据，返回已完整的 PES 包
    pub fn push(&mut self, data: &[u8]) -> Vec<PesPacket> {
        let mut buf = std::mem::take(&mut self.remainder);
        buf.extend_from_slice(data);

        let mut out = Vec::new();
        let mut pos = 0;
        while pos + PACKET_SIZE <= buf.len() {
            if buf[pos] != SYNC_BYTE {
                match buf[pos..].iter().position(|&b| b == SYNC_BYTE) {
                    Some(skip) => {
                        trace!("Lost sync, skipping {} bytes", skip);
                        pos += skip;
                        continue;
                    }
                    None => {
                        pos = buf.len();
                        break;
                    }
                }
            }
            self.handle_packet(&buf[pos..pos + PACKET_SIZE], &mut out);
            pos += PACKET_SIZE;
        }

        self.remainder = buf.split_off(pos);
        out
    }

    /// 输出所有仍在组装中的 PES
    pub fn flush(&mut self) -> Vec<PesPacket> {
        let mut pids: Vec<u16> = self.pending.keys().copied().collect();
        pids.sort_unstable();
        let mut out = Vec::new();
        for pid in pids {
            if let Some(data) = self.pending.remove(&pid) {
                self.finish_pes(pid, data, &mut out);
            }
        }
        self.remainder.clear();
        out
    }

    fn handle_packet(&mut self, packet: &[u8], out: &mut Vec<PesPacket>) {
        self.packet_count += 1;

        let pusi = packet[1] & 0x40 != 0;
        let pid = (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16;
        let adaptation_field_control = (packet[3] >> 4) & 0x03;

        let mut offset = 4;
        if adaptation_field_control & 0x02 != 0 {
            offset += 1 + packet[4] as usize;
        }
        if adaptation_field_control & 0x01 == 0 || offset >= PACKET_SIZE {
            return;
        }
        let payload = &packet[offset..];

        if pid == PID_PAT {
            if let Some(section) = psi_section(payload, pusi) {
                self.parse_pat(section);
            }
        } else if Some(pid) == self.pmt_pid {
            if let Some(section) = psi_section(payload, pusi) {
                self.parse_pmt(section);
            }
        } else if self.streams.contains_key(&pid) {
            if pusi {
                if let Some(previous) = self.pending.remove(&pid) {
                    self.finish_pes(pid, previous, out);
                }
                self.pending.insert(pid, payload.to_vec());
            } else if let Some(pending) = self.pending.get_mut(&pid) {
                pending.extend_from_slice(payload);
            }
        }
    }

    fn parse_pat(&mut self, section: &[u8]) {
        if section.len() < 8 || section[0] != 0x00 {
            return;
        }
        let section_length = section_length(section);
        // section_length 之后有 5 字节头，末尾 4 字节 CRC
        let end = (3 + section_length).saturating_sub(4);
        let mut i = 8;
        while i + 4 <= end {
            let program_number = ((section[i] as u16) << 8) | section[i + 1] as u16;
            let pid = (((section[i + 2] & 0x1F) as u16) << 8) | section[i + 3] as u16;
            if program_number != 0 {
                if self.pmt_pid != Some(pid) {
                    debug!("PAT: program {} -> PMT pid {:#x}", program_number, pid);
                }
                self.pmt_pid = Some(pid);
                return;
            }
            i += 4;
        }
    }

    fn parse_pmt(&mut self, section: &[u8]) {
        if section.len() < 12 || section[0] != 0x02 {
            return;
        }
        let section_length = section_length(section);
        let end = (3 + section_length).saturating_sub(4);
        let program_info_length = (((section[10] & 0x0F) as usize) << 8) | section[11] as usize;

        let mut i = 12 + program_info_length;
        while i + 5 <= end {
            let stream_type = section[i];
            let pid = (((section[i + 1] & 0x1F) as u16) << 8) | section[i + 2] as u16;
            let es_info_length =
                (((section[i + 3] & 0x0F) as usize) << 8) | section[i + 4] as usize;

            let kind = match stream_type {
                STREAM_TYPE_H264 => Some(StreamKind::H264),
                STREAM_TYPE_AAC_ADTS => Some(StreamKind::Aac),
                other => {
                    debug!("PMT: ignoring stream type {:#x} on pid {:#x}", other, pid);
                    None
                }
            };
            if let Some(kind) = kind {
                // 每种类型只使用第一条流
                if !self.has_stream(kind) || self.streams.get(&pid) == Some(&kind) {
                    self.streams.insert(pid, kind);
                }
            }
            i += 5 + es_info_length;
        }
    }

    fn finish_pes(&mut self, pid: u16, data: Vec<u8>, out: &mut Vec<PesPacket>) {
        let Some(&kind) = self.streams.get(&pid) else {
            return;
        };
        if data.len() < 9 || data[0] != 0 || data[1] != 0 || data[2] != 1 {
            debug!("Dropping PES without start code on pid {:#x}", pid);
            return;
        }

        let pts_dts_flags = (data[7] >> 6) & 0x03;
        let header_end = 9 + data[8] as usize;
        if header_end > data.len() {
            return;
        }

        let mut pts = None;
        let mut dts = None;
        if pts_dts_flags & 0x02 != 0 && data.len() >= 14 {
            let raw = parse_timestamp(&data[9..14]);
            let value = unroll_timestamp(raw, self.last_timestamp.get(&pid).copied());
            pts = Some(value);
            if pts_dts_flags == 0x03 && data.len() >= 19 {
                let raw = parse_timestamp(&data[14..19]);
                dts = Some(unroll_timestamp(raw, Some(value)));
            }
            self.last_timestamp.insert(pid, dts.unwrap_or(value));
        }

        let mut payload = data;
        payload.drain(..header_end);
        out.push(PesPacket {
            kind,
            pts,
            dts,
            payload,
        });
    }
}

/// 去掉段起始处的 pointer field，忽略续传包
fn psi_section(payload: &[u8], pusi: bool) -> Option<&[u8]> {
    if !pusi || payload.is_empty() {
        return None;
    }
    let pointer = payload[0] as usize;
    payload.get(1 + pointer..)
}

/// 读取 section_length，截断到实际数据长度
fn section_length(section: &[u8]) -> usize {
    let declared = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
    declared.min(section.len() - 3)
}
