use crate::config::CaptureConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 当前应当播放的内容：频道 + 期望的转码参数
///
/// 按值比较，用来判断正在运行的转码进程是否已经满足请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelTarget {
    pub channel: String,
    pub quality: String,
    pub jpeg_qscale: u8,
    pub fps: f32,
    pub scale: f32,
}

impl fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} q{} {}fps x{}",
            self.channel, self.quality, self.jpeg_qscale, self.fps, self.scale
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Poll,
    Push,
}

/// `/view/{channel}` 的查询参数
#[derive(Debug, Default, Deserialize)]
pub struct ViewQuery {
    pub quality: Option<String>,
    pub imgq: Option<u8>,
    pub fps: Option<f32>,
    pub scale: Option<f32>,
    pub mode: Option<DeliveryMode>,
}

impl ViewQuery {
    /// 合并默认值并把参数限制在配置允许的范围内
    pub fn into_target(self, channel: &str, capture: &CaptureConfig) -> ChannelTarget {
        let quality = self
            .quality
            .map(|q| q.trim().to_ascii_lowercase())
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| capture.default_quality.clone());

        let fps = self
            .fps
            .filter(|f| f.is_finite() && *f > 0.0)
            .map(|f| f.min(capture.max_fps))
            .unwrap_or(capture.fps);

        let scale = self
            .scale
            .filter(|s| s.is_finite())
            .map(|s| s.clamp(capture.min_scale, capture.max_scale))
            .unwrap_or(capture.max_scale);

        ChannelTarget {
            channel: channel.to_ascii_lowercase(),
            quality,
            jpeg_qscale: self.imgq.unwrap_or(capture.jpeg_qscale).clamp(2, 31),
            fps,
            scale,
        }
    }
}

/// 频道名只允许 1~25 位字母、数字、下划线
pub fn is_valid_channel(name: &str) -> bool {
    (1..=25).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}
