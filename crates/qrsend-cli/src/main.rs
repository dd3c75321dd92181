//! qrsend CLI
//!
//! 在终端中运行一个对等端: 作为主机打印分享链接，或打开对方的链接作为客户端连接。

mod console;

use anyhow::Result;
use clap::{Parser, Subcommand};
use qrsend_core::{AppSettings, LogLevel, PeerOptions, WsSignaling};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qrsend", version, about = "扫码直连的点对点文件传输")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动对等端
    Start {
        /// 对方的分享链接 (ws://host:port/#peerId)，省略时作为主机等待连接
        link: Option<String>,
        /// 监听地址 (默认取自配置，例如 0.0.0.0:9000)
        #[arg(short, long)]
        bind: Option<String>,
        /// 写入分享链接的主机名或 IP
        #[arg(short, long)]
        advertise: Option<String>,
        /// 保存目录 (默认: ~/Downloads)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// 日志级别 (trace, debug, info, warn, error)
        #[arg(short, long)]
        log_level: Option<LogLevel>,
    },
    /// 查看当前配置
    Config {
        /// 将当前 (或默认) 配置写入配置文件
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = AppSettings::load();

    match cli.command {
        Commands::Start {
            link,
            bind,
            advertise,
            output,
            log_level,
        } => {
            if let Some(bind) = bind {
                settings.bind_address = bind;
            }
            if advertise.is_some() {
                settings.advertise_host = advertise;
            }
            if let Some(output) = output {
                settings.download_dir = output;
            }
            init_logging(log_level.unwrap_or(settings.log_level));
            start(settings, link).await?;
        }
        Commands::Config { save } => {
            println!("📄 配置文件: {}", AppSettings::config_path().display());
            println!("   设备名称: {}", settings.device_name);
            println!("   监听地址: {}", settings.bind_address);
            println!(
                "   公布地址: {}",
                settings.advertise_host.as_deref().unwrap_or("(自动)")
            );
            println!("   下载目录: {}", settings.download_dir.display());
            println!("   数据块大小: {} 字节", settings.chunk_size);
            println!(
                "   连接超时/重试: {}s × {} (间隔 {}s)",
                settings.attempt_timeout_secs, settings.max_retries, settings.retry_delay_secs
            );
            println!(
                "   心跳: 每 {}s，{} 次未应答断开",
                settings.heartbeat_interval_secs, settings.max_missed_pongs
            );
            println!("   日志级别: {}", settings.log_level);
            if save {
                settings.save()?;
                println!("✅ 已保存");
            }
        }
    }

    Ok(())
}

fn init_logging(level: LogLevel) {
    // 桥接 log crate（qrsend-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.filter_directive())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

async fn start(settings: AppSettings, link: Option<String>) -> Result<()> {
    let signaling = WsSignaling::new(settings.ws_options()?);
    let options = PeerOptions {
        session: settings.session_config(),
        transfer: settings.transfer_config(),
        link,
    };

    tracing::info!(
        "qrsend starting as {}",
        if options.link.is_some() { "client" } else { "host" }
    );

    let (callback, events) = qrsend_core::ChannelCallback::new();
    let (handle, task) = qrsend_core::peer::spawn(signaling, options, Arc::new(callback));

    console::run(handle, events, settings.download_dir).await?;

    if let Err(e) = task.await {
        tracing::error!("Peer task ended abnormally: {e}");
    }
    Ok(())
}
