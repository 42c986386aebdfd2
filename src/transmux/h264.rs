use crate::error::DemuxError;

pub const NAL_IDR_SLICE: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

pub fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1F).unwrap_or(0)
}

/// 按 3 字节和 4 字节起始码拆分 Annex B 字节流
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &(_, begin)) in starts.iter().enumerate() {
        let mut end = starts
            .get(idx + 1)
            .map(|&(code, _)| code)
            .unwrap_or(data.len());
        // 末尾的 0 属于下一个 4 字节起始码
        while end > begin && data[end - 1] == 0 {
            end -= 1;
        }
        if end > begin {
            nals.push(&data[begin..end]);
        }
    }
    nals
}

/// SPS 中裁剪后的画面尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub width: u32,
    pub height: u32,
}

fn remove_emulation_prevention(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0;
    for &b in nal {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Result<u32, DemuxError> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or(DemuxError::InvalidSps("truncated"))?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Ok(bit as u32)
    }

    fn bits(&mut self, n: u32) -> Result<u32, DemuxError> {
        let mut v = 0;
        for _ in 0..n {
            v = (v << 1) | self.bit()?;
        }
        Ok(v)
    }

    fn ue(&mut self) -> Result<u32, DemuxError> {
        let mut leading = 0;
        while self.bit()? == 0 {
            leading += 1;
            if leading > 31 {
                return Err(DemuxError::InvalidSps("exp-golomb overflow"));
            }
        }
        Ok((1u32 << leading) - 1 + self.bits(leading)?)
    }

    fn se(&mut self) -> Result<i32, DemuxError> {
        let k = self.ue()?;
        Ok(if k % 2 == 1 {
            k.div_ceil(2) as i32
        } else {
            -((k / 2) as i32)
        })
    }
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), DemuxError> {
    let mut last = 8i64;
    let mut next = 8i64;
    for _ in 0..size {
        if next != 0 {
            next = (last + r.se()? as i64).rem_euclid(256);
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

/// 解析 SPS，得到裁剪后的宽高
pub fn parse_sps(nal: &[u8]) -> Result<SpsInfo, DemuxError> {
    if nal_type(nal) != NAL_SPS || nal.len() < 4 {
        return Err(DemuxError::InvalidSps("not a sequence parameter set"));
    }
    let rbsp = remove_emulation_prevention(&nal[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.bits(8)? as u8;
    r.bits(8)?; // constraint_set flags
    r.bits(8)?; // level_idc
    r.ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            r.bit()?; // separate_colour_plane_flag
        }
        r.ue()?; // bit_depth_luma_minus8
        r.ue()?; // bit_depth_chroma_minus8
        r.bit()?; // qpprime_y_zero_transform_bypass_flag
        if r.bit()? == 1 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.ue()?; // log2_max_frame_num_minus4
    match r.ue()? {
        0 => {
            r.ue()?; // log2_max_pic_order_cnt_lsb_minus4
        }
        1 => {
            r.bit()?; // delta_pic_order_always_zero_flag
            r.se()?; // offset_for_non_ref_pic
            r.se()?; // offset_for_top_to_bottom_field
            for _ in 0..r.ue()? {
                r.se()?;
            }
        }
        _ => {}
    }
    r.ue()?; // max_num_ref_frames
    r.bit()?; // gaps_in_frame_num_value_allowed_flag

    let width_in_mbs = r.ue()?.checked_add(1).ok_or(OVERFLOW)?;
    let height_in_map_units = r.ue()?.checked_add(1).ok_or(OVERFLOW)?;
    let frame_mbs_only = r.bit()?;
    if frame_mbs_only == 0 {
        r.bit()?; // mb_adaptive_frame_field_flag
    }
    r.bit()?; // direct_8x8_inference_flag

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if r.bit()? == 1 {
        crop_left = r.ue()?;
        crop_right = r.ue()?;
        crop_top = r.ue()?;
        crop_bottom = r.ue()?;
    }

    let (crop_unit_x, crop_unit_y) = match chroma_format_idc {
        0 | 3 => (1, 2 - frame_mbs_only),
        2 => (2, 2 - frame_mbs_only),
        _ => (2, 2 * (2 - frame_mbs_only)),
    };

    let width = cropped(width_in_mbs, 16, crop_left, crop_right, crop_unit_x)?;
    let height = cropped(
        height_in_map_units,
        16 * (2 - frame_mbs_only),
        crop_top,
        crop_bottom,
        crop_unit_y,
    )?;

    Ok(SpsInfo { width, height })
}

const OVERFLOW: DemuxError = DemuxError::InvalidSps("dimensions overflow");

/// 宏块数换算成像素并减去两侧裁剪
fn cropped(
    units: u32,
    unit_size: u32,
    start: u32,
    end: u32,
    crop_unit: u32,
) -> Result<u32, DemuxError> {
    let full = units.checked_mul(unit_size).ok_or(OVERFLOW)?;
    let crop = start
        .checked_add(end)
        .and_then(|c| c.checked_mul(crop_unit))
        .ok_or(OVERFLOW)?;
    full.checked_sub(crop).ok_or(DemuxError::InvalidSps("cropping exceeds picture"))
}

/// 以 4 字节长度前缀重新打包的访问单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvccSample {
    pub data: Vec<u8>,
    pub keyframe: bool,
}

/// 转换一个 Annex B 访问单元，参数集和分隔符不进入样本（保存在 `avcC` 中）
pub fn to_avcc_sample(nals: &[&[u8]]) -> Option<AvccSample> {
    let mut data = Vec::new();
    let mut keyframe = false;
    for nal in nals {
        match nal_type(nal) {
            NAL_SPS | NAL_PPS | NAL_AUD => continue,
            NAL_IDR_SLICE => keyframe = true,
            _ => {}
        }
        data.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        data.extend_from_slice(nal);
    }
    if data.is_empty() {
        None
    } else {
        Some(AvccSample { data, keyframe })
    }
}
