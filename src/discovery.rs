use log::debug;
use std::collections::HashMap;

/// 在某个作用域（标签页）中检测到的清单请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDetected {
    pub url: String,
    pub scope: i64,
    /// Unix 毫秒时间戳
    pub timestamp: i64,
    pub origin_url: Option<String>,
}

impl StreamDetected {
    pub fn new(url: impl Into<String>, scope: i64) -> Self {
        Self {
            url: url.into(),
            scope,
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin_url: None,
        }
    }

    pub fn is_manifest(&self) -> bool {
        self.scope > 0 && self.url.contains(".m3u8")
    }
}

#[derive(Debug, Default)]
pub struct StreamRegistry {
    scopes: HashMap<i64, Vec<StreamDetected>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次检测；被拒绝或已存在时返回 false
    pub fn record(&mut self, stream: StreamDetected) -> bool {
        if !stream.is_manifest() {
            return false;
        }
        let streams = self.scopes.entry(stream.scope).or_default();
        if streams.iter().any(|s| s.url == stream.url) {
            return false;
        }
        debug!("Detected stream in scope {}: {}", stream.scope, stream.url);
        streams.push(stream);
        true
    }

    /// 按检测顺序返回某个作用域的流
    pub fn streams(&self, scope: i64) -> Vec<StreamDetected> {
        self.scopes.get(&scope).cloned().unwrap_or_default()
    }

    pub fn invalidate_scope(&mut self, scope: i64) {
        if let Some(removed) = self.scopes.remove(&scope) {
            debug!("Cleared {} stream(s) from scope {}", removed.len(), scope);
        }
    }
}
