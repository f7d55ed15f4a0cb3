use crate::frame::FrameVersion;
use crate::state::SharedState;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info};

pub const BOUNDARY: &str = "frame";

/// 允许缓存但每次都必须重新校验
const REVALIDATE: &str = "no-cache, must-revalidate, max-age=0";
const NO_STORE: &str = "no-store, no-cache, must-revalidate, max-age=0";

/// 单帧轮询
///
/// 先按需触发修复，再返回最新帧。客户端携带的 ETag 与当前版本一致时
/// 只比较元数据即返回 304，不读取文件内容
pub async fn serve_frame(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    state.supervisor.heal_current().await;

    if let Some(version) = state.frames.version().await {
        if if_none_match(&headers, &version.etag()) {
            return not_modified(&version);
        }
    }

    match state.frames.read().await {
        Some(frame) => {
            let etag = frame.version.etag();
            if if_none_match(&headers, &etag) {
                return not_modified(&frame.version);
            }
            (
                [
                    (header::CONTENT_TYPE, state.frame_mime.clone()),
                    (header::ETAG, etag),
                    (header::CACHE_CONTROL, REVALIDATE.to_string()),
                ],
                frame.bytes,
            )
                .into_response()
        }
        None => placeholder_response(&state),
    }
}

fn not_modified(version: &FrameVersion) -> Response {
    (
        StatusCode::NOT_MODIFIED,
        [
            (header::ETAG, version.etag()),
            (header::CACHE_CONTROL, REVALIDATE.to_string()),
        ],
    )
        .into_response()
}

fn placeholder_response(state: &SharedState) -> Response {
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg")),
            (header::CACHE_CONTROL, HeaderValue::from_static(NO_STORE)),
            (header::PRAGMA, HeaderValue::from_static("no-cache")),
        ],
        state.placeholder.clone(),
    )
        .into_response()
}

/// `If-None-Match` 支持逗号分隔列表、弱校验前缀与 `*`
fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|tag| tag.trim())
        .any(|tag| tag == "*" || tag.trim_start_matches("W/") == etag)
}

/// 持续推流 (multipart/x-mixed-replace)
pub async fn serve_stream(State(state): State<SharedState>) -> Response {
    state.supervisor.heal_current().await;

    let interval = push_interval(&state);
    info!("Push client connected (interval {:?})", interval);

    let stream = frame_stream(state, interval);
    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
            ),
            (header::CACHE_CONTROL, NO_STORE.to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// 推流间隔：目标帧率对应的周期，不低于配置的下限
fn push_interval(state: &SharedState) -> Duration {
    let fps = state
        .supervisor
        .current_target()
        .map(|t| t.fps)
        .unwrap_or(state.config.capture.fps);
    let period = Duration::from_secs_f32(1.0 / fps.max(0.01));
    period.max(Duration::from_millis(state.config.supervision.push_min_interval_ms))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Emitted {
    Nothing,
    Placeholder,
    Frame(FrameVersion),
}

struct PushState {
    state: SharedState,
    interval: Duration,
    last: Emitted,
    first: bool,
    _conn: ConnectionGuard,
}

/// 连接关闭 (流被丢弃) 时记录日志
struct ConnectionGuard;

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        debug!("Push client disconnected");
    }
}

/// 只在版本变化时产出新分片；尚无帧时先发一次占位图。
/// 流被丢弃 (客户端断开) 或服务关闭后不再做任何工作
pub fn frame_stream(
    state: SharedState,
    interval: Duration,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    let init = PushState {
        state,
        interval,
        last: Emitted::Nothing,
        first: true,
        _conn: ConnectionGuard,
    };

    futures::stream::unfold(init, |mut s| async move {
        loop {
            if !s.first {
                tokio::select! {
                    _ = s.state.shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(s.interval) => {}
                }
            }
            s.first = false;

            s.state.supervisor.heal_current().await;

            let chunk = match s.state.frames.read().await {
                Some(frame) if s.last != Emitted::Frame(frame.version) => {
                    s.last = Emitted::Frame(frame.version);
                    multipart_chunk(&s.state.frame_mime, &frame.bytes)
                }
                None if s.last != Emitted::Placeholder => {
                    s.last = Emitted::Placeholder;
                    multipart_chunk("image/jpeg", &s.state.placeholder)
                }
                _ => continue,
            };
            return Some((Ok(chunk), s));
        }
    })
}

/// 单个分片：分隔符 + 分片头 + 图像数据
pub fn multipart_chunk(content_type: &str, data: &[u8]) -> Bytes {
    let head = format!(
        "--{BOUNDARY}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        data.len()
    );
    let mut buf = BytesMut::with_capacity(head.len() + data.len() + 2);
    buf.put_slice(head.as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_layout() {
        let chunk = multipart_chunk("image/jpeg", b"\xFF\xD8xx\xFF\xD9");
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 6\r\n\r\n"));
        assert!(chunk.ends_with(b"\xFF\xD9\r\n"));
    }

    #[test]
    fn etag_matching() {
        let mut headers = HeaderMap::new();
        assert!(!if_none_match(&headers, "\"a\""));

        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"x\", W/\"a\""));
        assert!(if_none_match(&headers, "\"a\""));
        assert!(!if_none_match(&headers, "\"b\""));

        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("*"));
        assert!(if_none_match(&headers, "\"b\""));
    }
}
