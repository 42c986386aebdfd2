use log::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 解析命令行参数
    let args = hls_grabber::cli::parse_args();

    info!("Starting HLS grabber...");
    info!("URL: {}", args.url);

    if let Err(e) = hls_grabber::run(args).await {
        error!("An error occurred: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
