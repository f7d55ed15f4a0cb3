use super::retry::{send_with_retry, RetryPolicy};
use super::SourceResolver;
use crate::error::ResolveError;
use async_trait::async_trait;
use m3u8_rs::{MasterPlaylist, Playlist};
use parking_lot::Mutex;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 网页播放器使用的公开 Client-Id
const WEB_CLIENT_ID: &str = "kimne78kx3ncx6brgo4mv6wki5h1ko";
const PLAYBACK_TOKEN_HASH: &str =
    "ed230aa1e33e07eebb8928504583da78a5173989fadfb1ac94be06a04f3cdbe9";

#[derive(Debug, Clone)]
pub struct TwitchEndpoints {
    pub gql: String,
    pub usher: String,
}

impl Default for TwitchEndpoints {
    fn default() -> Self {
        Self {
            gql: "https://gql.twitch.tv/gql".to_string(),
            usher: "https://usher.ttvnw.net/api/channel/hls".to_string(),
        }
    }
}

/// 一路可播放的清晰度
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub label: String,
    pub url: String,
    pub bandwidth: u64,
}

struct CachedVariants {
    fetched_at: Instant,
    variants: Vec<Variant>,
}

#[derive(Deserialize)]
struct GqlResponse {
    data: Option<GqlData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlData {
    stream_playback_access_token: Option<AccessToken>,
}

#[derive(Deserialize)]
struct AccessToken {
    value: String,
    signature: String,
}

/// 通过 PlaybackAccessToken + usher 主播放列表解析直播地址
pub struct TwitchResolver {
    client: Client,
    endpoints: TwitchEndpoints,
    retry: RetryPolicy,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedVariants>>,
}

impl TwitchResolver {
    pub fn new(client: Client, retry: RetryPolicy, cache_ttl: Duration) -> Self {
        Self::with_endpoints(client, retry, cache_ttl, TwitchEndpoints::default())
    }

    pub fn with_endpoints(
        client: Client,
        retry: RetryPolicy,
        cache_ttl: Duration,
        endpoints: TwitchEndpoints,
    ) -> Self {
        Self {
            client,
            endpoints,
            retry,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn access_token(&self, channel: &str) -> Result<AccessToken, ResolveError> {
        let body = serde_json::json!({
            "operationName": "PlaybackAccessToken",
            "extensions": {
                "persistedQuery": {
                    "version": 1,
                    "sha256Hash": PLAYBACK_TOKEN_HASH,
                }
            },
            "variables": {
                "isLive": true,
                "login": channel,
                "isVod": false,
                "vodID": "",
                "playerType": "site",
            },
        });

        let resp = send_with_retry(&self.retry, "gql", || {
            self.client
                .post(&self.endpoints.gql)
                .header("Client-Id", WEB_CLIENT_ID)
                .json(&body)
        })
        .await?;

        let parsed: GqlResponse = resp.json().await?;
        parsed
            .data
            .and_then(|d| d.stream_playback_access_token)
            .ok_or_else(|| ResolveError::Offline(channel.to_string()))
    }

    async fn fetch_variants(&self, channel: &str) -> Result<Vec<Variant>, ResolveError> {
        let token = self.access_token(channel).await?;
        let url = format!("{}/{}.m3u8", self.endpoints.usher, channel);
        let nonce = rand::rng().random_range(0..9_999_999u32).to_string();

        let resp = send_with_retry(&self.retry, "usher", || {
            self.client.get(&url).query(&[
                ("player", "twitchweb"),
                ("p", nonce.as_str()),
                ("allow_source", "true"),
                ("allow_audio_only", "false"),
                ("fast_bread", "true"),
                ("token", token.value.as_str()),
                ("sig", token.signature.as_str()),
            ])
        })
        .await
        .map_err(|e| match e {
            // usher 对未开播频道返回 404
            ResolveError::Status { status, .. } if status == StatusCode::NOT_FOUND => {
                ResolveError::Offline(channel.to_string())
            }
            other => other,
        })?;

        let bytes = resp.bytes().await?;
        let variants = parse_master_playlist(&bytes)?;
        if variants.is_empty() {
            return Err(ResolveError::Offline(channel.to_string()));
        }
        Ok(variants)
    }

    /// 带短期缓存的清晰度列表
    async fn variants(&self, channel: &str) -> Result<Vec<Variant>, ResolveError> {
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.get(channel) {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    debug!("Variant cache hit for {}", channel);
                    return Ok(cached.variants.clone());
                }
            }
        }

        let variants = self.fetch_variants(channel).await?;
        info!(
            "Resolved {} qualities for {}: {:?}",
            variants.len(),
            channel,
            variants.iter().map(|v| v.label.as_str()).collect::<Vec<_>>()
        );

        let mut cache = self.cache.lock();
        cache.retain(|_, c| c.fetched_at.elapsed() < self.cache_ttl);
        cache.insert(
            channel.to_string(),
            CachedVariants {
                fetched_at: Instant::now(),
                variants: variants.clone(),
            },
        );
        Ok(variants)
    }
}

#[async_trait]
impl SourceResolver for TwitchResolver {
    async fn qualities(&self, channel: &str) -> Result<Vec<String>, ResolveError> {
        Ok(self
            .variants(channel)
            .await?
            .into_iter()
            .map(|v| v.label)
            .collect())
    }

    async fn playable_url(&self, channel: &str, quality: &str) -> Result<String, ResolveError> {
        self.variants(channel)
            .await?
            .into_iter()
            .find(|v| v.label.eq_ignore_ascii_case(quality))
            .map(|v| v.url)
            .ok_or_else(|| ResolveError::Api(format!("quality {quality} not offered by {channel}")))
    }
}

/// 解析 usher 主播放列表
///
/// 标签取自 `EXT-X-MEDIA` 的 NAME (去掉 " (source)" 后缀)，
/// 原画同时登记为 `source`，并追加 `best` / `worst` 两个别名。
/// 结果按码率从高到低排列
pub fn parse_master_playlist(bytes: &[u8]) -> Result<Vec<Variant>, ResolveError> {
    match m3u8_rs::parse_playlist_res(bytes) {
        Ok(Playlist::MasterPlaylist(pl)) => Ok(variants_from_master(pl)),
        Ok(Playlist::MediaPlaylist(_)) => Err(ResolveError::Playlist(
            "expected a master playlist".to_string(),
        )),
        Err(e) => Err(ResolveError::Playlist(e.to_string())),
    }
}

fn variants_from_master(pl: MasterPlaylist) -> Vec<Variant> {
    let mut named: Vec<(Variant, bool)> = Vec::new();

    for variant in pl.variants.iter().filter(|v| !v.is_i_frame) {
        let media = variant
            .video
            .as_ref()
            .and_then(|group| pl.alternatives.iter().find(|m| &m.group_id == group));

        let raw_name = match (media, &variant.resolution) {
            (Some(m), _) => m.name.clone(),
            (None, Some(res)) => format!("{}p", res.height),
            (None, None) => continue,
        };
        let raw_name = raw_name.to_ascii_lowercase();
        if raw_name.contains("audio") {
            continue;
        }

        let is_source = raw_name.contains("(source)")
            || variant.video.as_deref() == Some("chunked");
        let label = raw_name.replace("(source)", "").trim().to_string();

        named.push((
            Variant {
                label,
                url: variant.uri.clone(),
                bandwidth: variant.bandwidth,
            },
            is_source,
        ));
    }

    named.sort_by(|a, b| b.0.bandwidth.cmp(&a.0.bandwidth));

    let mut out: Vec<Variant> = Vec::new();
    for (variant, _) in &named {
        if !out.iter().any(|v| v.label == variant.label) {
            out.push(variant.clone());
        }
    }
    if let Some((source, _)) = named.iter().find(|(_, is_source)| *is_source) {
        out.push(Variant {
            label: "source".to_string(),
            ..source.clone()
        });
    }
    if let (Some((best, _)), Some((worst, _))) = (named.first(), named.last()) {
        out.push(Variant {
            label: "best".to_string(),
            ..best.clone()
        });
        out.push(Variant {
            label: "worst".to_string(),
            ..worst.clone()
        });
    }
    out
}
