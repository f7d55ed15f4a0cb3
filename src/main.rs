mod config;
mod engine;
mod error;
mod frame;
mod pipeline;
mod placeholder;
mod quality;
mod resolver;
mod shutdown;
mod state;
mod supervisor;
mod target;
mod web;

use clap::Parser;
use config::AppConfig;
use engine::Engine;
use frame::FrameStore;
use resolver::{retry::RetryPolicy, HelixClient, TwitchResolver};
use state::AppState;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{Supervisor, SupervisorSettings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Frame Relay - 直播画面转单帧 JPEG 服务
/// 解析命令行参数，加载配置文件，启动HTTP服务及后台修复任务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "frame-relay.yaml")]
    config: String,

    /// 覆盖配置中的监听地址
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，默认 info 级别，可通过 RUST_LOG 覆盖
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    info!(
        "Frame Relay initialized. Frame path: {}, canvas {}x{}",
        config.server.frame_path, config.capture.width, config.capture.height
    );

    // 清理上次运行残留的帧文件，客户端先看到占位图
    let frames = Arc::new(FrameStore::new(&config.server.frame_path));
    frames.reset().await;
    let placeholder = placeholder::prepare(
        Path::new(&config.server.placeholder_path),
        config.capture.width,
        config.capture.height,
    )?;

    // 上游平台客户端
    let twitch = &config.twitch;
    let http = resolver::build_http_client(twitch)?;
    let retry = RetryPolicy::with_max_retries(twitch.max_retries);
    let source = Arc::new(TwitchResolver::new(
        http.clone(),
        retry.clone(),
        Duration::from_secs(twitch.cache_ttl_secs),
    ));
    let catalogue = Arc::new(HelixClient::new(
        http,
        retry,
        twitch.client_id.clone(),
        twitch.client_secret.clone(),
        twitch.category.clone(),
        twitch.catalogue_size,
    ));
    info!("Catalogue category: {}", catalogue.category());

    let engine = Arc::new(Engine::new(&config.server.ffmpeg_binary));
    let supervisor = Arc::new(Supervisor::new(
        SupervisorSettings::from_config(&config),
        source,
        engine,
        frames.clone(),
    ));

    // 启动后台修复任务
    let cancel = CancellationToken::new();
    let heal_worker = supervisor.spawn_heal_worker(cancel.clone());

    let frame_mime = mime_guess::from_path(&config.server.frame_path)
        .first_or_octet_stream()
        .to_string();

    // 初始化全局状态
    let state = Arc::new(AppState {
        config: config.clone(),
        supervisor: supervisor.clone(),
        frames,
        catalogue,
        placeholder,
        frame_mime,
        shutdown: cancel.clone(),
    });

    let app = web::router(state);

    // 启动HTTP服务，监听指定的地址和端口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    let signal_token = cancel.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = shutdown::wait_for_shutdown_signal().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
            // 通知推流连接结束，否则优雅关闭会一直等待长连接
            signal_token.cancel();
        })
        .await;

    cancel.cancel();
    if let Some(handle) = heal_worker {
        if let Err(e) = handle.await {
            error!("Heal worker panicked: {}", e);
        }
    }
    supervisor.stop().await;
    info!("Frame Relay stopped");

    served?;
    Ok(())
}
