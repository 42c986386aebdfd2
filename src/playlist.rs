use log::debug;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use url::Url;

const STREAM_INF: &str = "#EXT-X-STREAM-INF:";
const MEDIA_SEQUENCE: &str = "#EXT-X-MEDIA-SEQUENCE:";
const KEY: &str = "#EXT-X-KEY:";

/// 主播放列表中的一个可选画质
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantDescriptor {
    pub quality: String,
    pub resolution: String,
    pub bandwidth: u64,
    pub url: String,
}

impl VariantDescriptor {
    /// 把清单本身当作唯一的变体
    pub fn single(url: &str, resolution: &str) -> Self {
        Self {
            quality: "Auto".to_string(),
            resolution: resolution.to_string(),
            bandwidth: 0,
            url: url.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub uri: String,
    pub iv: Option<String>,
}

/// 一个媒体分段，`index` 是其在播放列表中的位置，也是拼接顺序
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub index: usize,
    pub url: String,
    pub sequence: u64,
    pub key: Option<KeyInfo>,
}

fn attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Z0-9-]+)=("([^"]*)"|([^,]*))"#).expect("attribute regex is valid")
    })
}

/// 解析属性列表，引号内的值可以包含逗号
pub fn parse_attributes(line: &str) -> HashMap<String, String> {
    let list = line.split_once(':').map(|(_, rest)| rest).unwrap_or(line);
    attribute_regex()
        .captures_iter(list)
        .map(|caps| {
            let value = caps
                .get(3)
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            (caps[1].to_string(), value.to_string())
        })
        .collect()
}

/// 将分段或变体 URI 解析为绝对地址
pub fn resolve_url(base: &Url, reference: &str) -> String {
    if let Ok(absolute) = Url::parse(reference) {
        if !absolute.cannot_be_a_base() {
            return reference.to_string();
        }
    }

    let origin = base.origin().ascii_serialization();
    if reference.starts_with('/') {
        return format!("{}{}", origin, reference);
    }

    let path = base.path();
    let dir = &path[..path.rfind('/').map(|i| i + 1).unwrap_or(0)];
    format!("{}{}{}", origin, dir, reference)
}

/// 解析主播放列表，按带宽降序返回所有变体
pub fn parse_master_playlist(text: &str, base: &Url) -> Vec<VariantDescriptor> {
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let mut variants = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        if !line.starts_with(STREAM_INF) {
            continue;
        }

        let uri = match lines.get(i + 1) {
            Some(next) if !next.is_empty() && !next.starts_with('#') => *next,
            _ => {
                debug!("Skipping stream-info directive without URI: {}", line);
                continue;
            }
        };

        let attributes = parse_attributes(line);
        let bandwidth = attributes
            .get("BANDWIDTH")
            .and_then(|b| b.parse::<u64>().ok())
            .unwrap_or(0);

        let (quality, resolution) = match attributes.get("RESOLUTION") {
            Some(res) => {
                let height = res.split('x').nth(1).unwrap_or(res.as_str());
                (format!("{}p", height), res.clone())
            }
            None => ("Auto".to_string(), "Unknown".to_string()),
        };

        variants.push(VariantDescriptor {
            quality,
            resolution,
            bandwidth,
            url: resolve_url(base, uri),
        });
    }

    variants.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
    variants
}

/// 解析媒体播放列表，保持分段原始顺序
pub fn parse_media_playlist(text: &str, base: &Url) -> Vec<SegmentDescriptor> {
    let mut segments = Vec::new();
    let mut media_sequence = 0u64;
    let mut key: Option<KeyInfo> = None;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(value) = line.strip_prefix(MEDIA_SEQUENCE) {
            media_sequence = value.trim().parse().unwrap_or(media_sequence);
            continue;
        }

        if line.starts_with(KEY) {
            key = parse_key(line, base);
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let index = segments.len();
        segments.push(SegmentDescriptor {
            index,
            url: resolve_url(base, line),
            sequence: media_sequence + index as u64,
            key: key.clone(),
        });
    }

    segments
}

fn parse_key(line: &str, base: &Url) -> Option<KeyInfo> {
    let attributes = parse_attributes(line);
    match attributes.get("METHOD").map(String::as_str) {
        Some("AES-128") => {
            let uri = attributes.get("URI")?;
            Some(KeyInfo {
                uri: resolve_url(base, uri),
                iv: attributes.get("IV").cloned(),
            })
        }
        Some("NONE") => None,
        other => {
            debug!("Unsupported key method {:?}, segments left as-is", other);
            None
        }
    }
}
