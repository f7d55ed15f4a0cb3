//! 上游 HTTP 请求的有界重试：指数退避 + 抖动，仅对可重试错误生效

use crate::error::ResolveError;
use rand::Rng;
use reqwest::{RequestBuilder, Response};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 初次请求之外的最大重试次数
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// 第 `attempt` 次重试前的等待时长 (从 0 开始计数)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_limit_ms = (self.base_delay.as_millis() as u64 / 2)
            .min(self.max_delay.saturating_sub(capped).as_millis() as u64);
        if jitter_limit_ms == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::rng().random_range(0..jitter_limit_ms))
    }
}

/// 发送请求，非 2xx 状态转换为 `ResolveError::Status`
///
/// `build` 每次尝试都会被调用一次，以便重新构造请求体
pub async fn send_with_retry<F>(
    policy: &RetryPolicy,
    operation: &'static str,
    build: F,
) -> Result<Response, ResolveError>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0;
    loop {
        let err = match build().send().await {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => ResolveError::Status {
                status: resp.status(),
                operation,
            },
            Err(e) => ResolveError::Http(e),
        };

        if !err.is_retryable() || attempt >= policy.max_retries {
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            operation,
            attempt = attempt + 1,
            max = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying upstream request"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: false,
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// 前 `failures` 次返回 `status`，之后返回 200
    async fn flaky_server(failures: u32, status: StatusCode) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < failures {
                        (status, "nope")
                    } else {
                        (StatusCode::OK, "ok")
                    }
                }
            }),
        );
        (serve(app).await, hits)
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..32 {
            assert!(policy.delay_for_attempt(10) <= policy.max_delay);
        }
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let (url, hits) = flaky_server(2, StatusCode::SERVICE_UNAVAILABLE).await;
        let client = reqwest::Client::new();
        let resp = send_with_retry(&fast_policy(3), "test", || client.get(&url))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let (url, hits) = flaky_server(10, StatusCode::TOO_MANY_REQUESTS).await;
        let client = reqwest::Client::new();
        let err = send_with_retry(&fast_policy(2), "test", || client.get(&url))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Status { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, hits) = flaky_server(10, StatusCode::NOT_FOUND).await;
        let client = reqwest::Client::new();
        let err = send_with_retry(&fast_policy(3), "test", || client.get(&url))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
