use crate::config::AppConfig;
use crate::frame::FrameStore;
use crate::resolver::Catalogue;
use crate::supervisor::Supervisor;
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 全局应用上下文
pub struct AppState {
    pub config: AppConfig,
    pub supervisor: Arc<Supervisor>,
    pub frames: Arc<FrameStore>,
    pub catalogue: Arc<dyn Catalogue>,
    /// 尚无有效帧时返回的占位图
    pub placeholder: Bytes,
    /// 帧文件的 Content-Type (由输出路径扩展名推断)
    pub frame_mime: String,
    /// 关闭时通知推流连接结束
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<AppState>;
