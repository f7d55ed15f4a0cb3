pub mod helix;
pub mod retry;
pub mod twitch;

use crate::config::TwitchConfig;
use crate::error::ResolveError;
use async_trait::async_trait;
use std::time::Duration;

pub use helix::{HelixClient, LiveStream};
pub use twitch::TwitchResolver;

/// 根据频道名查询可用清晰度与播放地址
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// 可用清晰度标签，按优先级从高到低排列
    async fn qualities(&self, channel: &str) -> Result<Vec<String>, ResolveError>;

    /// 指定清晰度的可播放地址
    async fn playable_url(&self, channel: &str, quality: &str) -> Result<String, ResolveError>;
}

/// 频道目录 (首页列表)
#[async_trait]
pub trait Catalogue: Send + Sync {
    async fn live_streams(&self) -> Result<Vec<LiveStream>, ResolveError>;
}

pub fn build_http_client(cfg: &TwitchConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
        .timeout(Duration::from_secs(cfg.request_timeout_secs))
        .user_agent(concat!("frame-relay/", env!("CARGO_PKG_VERSION")))
        .build()
}
