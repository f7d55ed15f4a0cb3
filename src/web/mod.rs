pub mod admin;
pub mod frames;
pub mod pages;

use crate::state::SharedState;
use axum::{routing::get, Router};

/// 注册HTTP路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(pages::index_handler)) // 首页
        .route("/view/:channel", get(pages::view_handler)) // 观看页 (启动监控)
        .route("/frame.jpg", get(frames::serve_frame)) // 单帧轮询
        .route("/stream.mjpg", get(frames::serve_stream)) // 持续推流
        .route("/health", get(admin::health))
        .route("/status", get(admin::status))
        .with_state(state)
}
