use crate::error::ResolveError;
use crate::resolver::LiveStream;
use crate::state::SharedState;
use crate::target::{is_valid_channel, DeliveryMode, ViewQuery};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use std::fmt::Write;
use tracing::{info, warn};

const INDEX_TEMPLATE: &str = include_str!("../../static/index.html");
const VIEW_TEMPLATE: &str = include_str!("../../static/view.html");

/// 首页：当前分类下的直播列表
///
/// 未配置凭据或接口出错时展示空列表，不返回错误
pub async fn index_handler(State(state): State<SharedState>) -> Html<String> {
    let streams = match state.catalogue.live_streams().await {
        Ok(streams) => streams,
        Err(ResolveError::MissingCredentials) => {
            info!("Twitch credentials not configured, catalogue disabled");
            Vec::new()
        }
        Err(e) => {
            warn!("Failed to load catalogue: {}", e);
            Vec::new()
        }
    };

    Html(render(
        INDEX_TEMPLATE,
        &[
            ("category", escape_html(&state.config.twitch.category)),
            ("streams", stream_items(&streams)),
        ],
    ))
}

fn stream_items(streams: &[LiveStream]) -> String {
    if streams.is_empty() {
        return "        <li class=\"stream-item\">No streams found or API error.</li>".to_string();
    }

    let mut out = String::new();
    for stream in streams {
        let _ = writeln!(
            out,
            "        <li class=\"stream-item\"><a href=\"/view/{}\">\
             <div class=\"stream-title\">{}</div>\
             <div class=\"stream-meta\">{} viewers - {}</div></a></li>",
            escape_html(&stream.user_login),
            escape_html(&stream.user_name),
            stream.viewer_count,
            escape_html(&stream.title),
        );
    }
    out
}

/// 观看页：顺带启动 (或继续) 对该频道的监控
pub async fn view_handler(
    State(state): State<SharedState>,
    Path(channel): Path<String>,
    Query(query): Query<ViewQuery>,
) -> Response {
    if !is_valid_channel(&channel) {
        return (StatusCode::BAD_REQUEST, "Invalid channel name").into_response();
    }

    let mode = query.mode.unwrap_or_default();
    let target = query.into_target(&channel, &state.config.capture);

    // 启动失败时目标仍被保留，页面先显示占位图，之后由取帧请求触发重试
    match state.supervisor.start(target.clone()).await {
        Ok(outcome) => info!("View [{}]: {:?}", target, outcome),
        Err(e) => warn!("View [{}]: start failed, will retry: {}", target, e),
    }

    let refresh_ms = (1000.0 / target.fps)
        .max(state.config.supervision.push_min_interval_ms as f32)
        .round() as u64;
    let (mode_name, image_src) = match mode {
        DeliveryMode::Poll => ("poll", "/frame.jpg"),
        DeliveryMode::Push => ("push", "/stream.mjpg"),
    };

    Html(render(
        VIEW_TEMPLATE,
        &[
            ("channel", escape_html(&target.channel)),
            ("quality", escape_html(&target.quality)),
            ("mode", mode_name.to_string()),
            ("image_src", image_src.to_string()),
            ("refresh_ms", refresh_ms.to_string()),
        ],
    ))
    .into_response()
}

/// 替换模板中的 `{{key}}`；值需要调用方预先转义
fn render(template: &str, vars: &[(&str, String)]) -> String {
    vars.iter().fold(template.to_string(), |page, (key, value)| {
        page.replace(&format!("{{{{{key}}}}}"), value)
    })
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
