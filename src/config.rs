use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Args;

/// 下载管理器和 HTTP 层共用的运行时配置
#[derive(Debug, Clone)]
pub struct Config {
    pub output_dir: PathBuf,
    pub headers: Vec<String>,
    pub http_timeout: Duration,
    /// 分段下载过程中进度广播的最小间隔
    pub progress_interval: Duration,
    /// 转封装步骤的看门狗时长
    pub transmux_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            headers: Vec::new(),
            http_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_millis(500),
            transmux_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            output_dir: args.output_dir.clone(),
            headers: args.headers.clone(),
            http_timeout: Duration::from_secs(args.timeout_secs),
            progress_interval: Duration::from_millis(args.progress_interval_ms),
            transmux_timeout: Duration::from_secs(args.transmux_timeout_secs),
        }
    }
}
