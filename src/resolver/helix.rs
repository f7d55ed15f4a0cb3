use super::retry::{send_with_retry, RetryPolicy};
use super::Catalogue;
use crate::error::ResolveError;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct HelixEndpoints {
    pub auth: String,
    pub api: String,
}

impl Default for HelixEndpoints {
    fn default() -> Self {
        Self {
            auth: "https://id.twitch.tv/oauth2/token".to_string(),
            api: "https://api.twitch.tv/helix".to_string(),
        }
    }
}

/// 首页列表中的一路直播
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LiveStream {
    pub user_login: String,
    pub user_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub viewer_count: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct DataList<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct Game {
    id: String,
}

struct AppToken {
    value: String,
    expires_at: Instant,
}

/// Helix API 客户端，使用 client-credentials 应用令牌
pub struct HelixClient {
    client: Client,
    endpoints: HelixEndpoints,
    retry: RetryPolicy,
    client_id: Option<String>,
    client_secret: Option<String>,
    category: String,
    page_size: u32,
    token: Mutex<Option<AppToken>>,
}

impl HelixClient {
    pub fn new(
        client: Client,
        retry: RetryPolicy,
        client_id: Option<String>,
        client_secret: Option<String>,
        category: String,
        page_size: u32,
    ) -> Self {
        Self {
            client,
            endpoints: HelixEndpoints::default(),
            retry,
            client_id,
            client_secret,
            category,
            page_size,
            token: Mutex::new(None),
        }
    }

    pub fn with_endpoints(mut self, endpoints: HelixEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    fn credentials(&self) -> Result<(&str, &str), ResolveError> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Ok((id, secret)),
            _ => Err(ResolveError::MissingCredentials),
        }
    }

    /// 令牌在过期前 60 秒内视为失效
    async fn app_token(&self) -> Result<String, ResolveError> {
        let cached = self
            .token
            .lock()
            .as_ref()
            .filter(|t| Instant::now() < t.expires_at)
            .map(|t| t.value.clone());
        if let Some(token) = cached {
            return Ok(token);
        }

        let (id, secret) = self.credentials()?;
        let resp = send_with_retry(&self.retry, "oauth2/token", || {
            self.client.post(&self.endpoints.auth).query(&[
                ("client_id", id),
                ("client_secret", secret),
                ("grant_type", "client_credentials"),
            ])
        })
        .await?;
        let token: TokenResponse = resp.json().await?;
        info!("Obtained Helix app token (expires in {}s)", token.expires_in);

        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *self.token.lock() = Some(AppToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn get<T: for<'de> Deserialize<'de>>(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ResolveError> {
        let (id, _) = self.credentials()?;
        let token = self.app_token().await?;
        let url = format!("{}/{}", self.endpoints.api, path);
        let resp = send_with_retry(&self.retry, operation, || {
            self.client
                .get(&url)
                .header("Client-Id", id)
                .bearer_auth(&token)
                .query(query)
        })
        .await?;
        Ok(resp.json().await?)
    }

    async fn game_id(&self, name: &str) -> Result<Option<String>, ResolveError> {
        let games: DataList<Game> = self.get("helix/games", "games", &[("name", name)]).await?;
        Ok(games.data.into_iter().next().map(|g| g.id))
    }
}

#[async_trait]
impl Catalogue for HelixClient {
    async fn live_streams(&self) -> Result<Vec<LiveStream>, ResolveError> {
        let Some(game_id) = self.game_id(&self.category).await? else {
            debug!("Unknown category {:?}", self.category);
            return Ok(Vec::new());
        };

        let first = self.page_size.clamp(1, 100).to_string();
        let streams: DataList<LiveStream> = self
            .get(
                "helix/streams",
                "streams",
                &[("game_id", game_id.as_str()), ("first", first.as_str())],
            )
            .await?;
        Ok(streams.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, http::HeaderMap, routing::{get, post}, Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn mock_helix() -> (HelixEndpoints, Arc<AtomicU32>) {
        let token_hits = Arc::new(AtomicU32::new(0));
        let hits = token_hits.clone();

        let app = Router::new()
            .route(
                "/token",
                post(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Json(serde_json::json!({ "access_token": "app", "expires_in": 3600 }))
                    }
                }),
            )
            .route(
                "/helix/games",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    let data = if q.get("name").map(String::as_str) == Some("Just Chatting") {
                        serde_json::json!([{ "id": "509658", "name": "Just Chatting" }])
                    } else {
                        serde_json::json!([])
                    };
                    Json(serde_json::json!({ "data": data }))
                }),
            )
            .route(
                "/helix/streams",
                get(|headers: HeaderMap| async move {
                    assert_eq!(
                        headers.get("authorization").and_then(|v| v.to_str().ok()),
                        Some("Bearer app")
                    );
                    Json(serde_json::json!({ "data": [{
                        "user_login": "alpha",
                        "user_name": "Alpha",
                        "title": "hello",
                        "viewer_count": 42,
                        "game_id": "509658"
                    }]}))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let endpoints = HelixEndpoints {
            auth: format!("http://{addr}/token"),
            api: format!("http://{addr}/helix"),
        };
        (endpoints, token_hits)
    }

    fn client(category: &str, endpoints: HelixEndpoints) -> HelixClient {
        HelixClient::new(
            Client::new(),
            RetryPolicy::with_max_retries(0),
            Some("id".into()),
            Some("secret".into()),
            category.into(),
            20,
        )
        .with_endpoints(endpoints)
    }

    #[tokio::test]
    async fn lists_streams_and_reuses_token() {
        let (endpoints, token_hits) = mock_helix().await;
        let helix = client("Just Chatting", endpoints);

        let streams = helix.live_streams().await.unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].user_login, "alpha");
        assert_eq!(streams[0].viewer_count, 42);

        helix.live_streams().await.unwrap();
        assert_eq!(token_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_category_is_empty() {
        let (endpoints, _) = mock_helix().await;
        let streams = client("Nope", endpoints).live_streams().await.unwrap();
        assert!(streams.is_empty());
    }

    #[tokio::test]
    async fn missing_credentials() {
        let helix = HelixClient::new(
            Client::new(),
            RetryPolicy::default(),
            None,
            None,
            "Just Chatting".into(),
            20,
        );
        assert!(matches!(
            helix.live_streams().await,
            Err(ResolveError::MissingCredentials)
        ));
    }
}
