use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub supervision: SupervisionConfig,
    pub twitch: TwitchConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub ffmpeg_binary: String,

    /// 转码进程持续覆盖写入的帧文件
    /// 低功耗设备上建议配置为 /dev/shm 下的路径以保护闪存寿命
    pub frame_path: String,

    /// 启动时生成的 "加载中" 占位图
    pub placeholder_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
            frame_path: "current.jpg".to_string(),
            placeholder_path: "placeholder.jpg".to_string(),
        }
    }
}

/// 画面输出参数 (默认值针对 1404x1872 的墨水屏阅读器)
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    /// 顺时针旋转角度，仅支持 0 / 90 / 180 / 270
    pub rotate: u32,
    pub fps: f32,
    pub max_fps: f32,
    /// mjpeg 编码质量，数值越小画质越高 (2..=31)
    pub jpeg_qscale: u8,
    pub grayscale: bool,
    pub min_scale: f32,
    pub max_scale: f32,
    pub default_quality: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1404,
            height: 1872,
            rotate: 0,
            fps: 1.0,
            max_fps: 5.0,
            jpeg_qscale: 2,
            grayscale: true,
            min_scale: 0.25,
            max_scale: 1.0,
            default_quality: "best".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SupervisionConfig {
    /// 帧文件超过该时长未刷新即视为卡死
    pub stale_after_secs: u64,
    /// 同一目标两次重启之间的最小间隔 (秒)
    pub restart_min_interval_secs: u64,
    /// 连续故障时退避间隔的上限 (秒)
    pub restart_max_interval_secs: u64,
    pub stop_timeout_ms: u64,
    pub push_min_interval_ms: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 15,
            restart_min_interval_secs: 10,
            restart_max_interval_secs: 120,
            stop_timeout_ms: 2000,
            push_min_interval_ms: 250,
        }
    }
}

impl SupervisionConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TwitchConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// 首页展示的直播分类
    pub category: String,
    pub catalogue_size: u32,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    /// 播放地址缓存时长 (秒)
    pub cache_ttl_secs: u64,
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            category: "Just Chatting".to_string(),
            catalogue_size: 20,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            max_retries: 3,
            cache_ttl_secs: 30,
        }
    }
}

impl AppConfig {
    /// 读取 YAML 配置；文件不存在时使用默认配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config: AppConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&content)?
        } else {
            info!("Config file {:?} not found, using defaults", path);
            AppConfig::default()
        };

        config.apply_env();
        config.validate();
        Ok(config)
    }

    /// 凭据允许通过环境变量覆盖，避免明文写入配置文件
    fn apply_env(&mut self) {
        if let Ok(id) = std::env::var("TWITCH_CLIENT_ID") {
            self.twitch.client_id = Some(id);
        }
        if let Ok(secret) = std::env::var("TWITCH_SECRET") {
            self.twitch.client_secret = Some(secret);
        }
        if let Ok(category) = std::env::var("TWITCH_CATEGORY") {
            self.twitch.category = category;
        }
    }

    /// 修正越界配置项
    pub fn validate(&mut self) {
        let capture = &mut self.capture;
        if !matches!(capture.rotate, 0 | 90 | 180 | 270) {
            warn!("Unsupported rotation {}, falling back to 0", capture.rotate);
            capture.rotate = 0;
        }
        if !(2..=31).contains(&capture.jpeg_qscale) {
            warn!("jpeg_qscale {} out of range 2..=31", capture.jpeg_qscale);
            capture.jpeg_qscale = capture.jpeg_qscale.clamp(2, 31);
        }
        if capture.width < 16 || capture.height < 16 {
            warn!(
                "Canvas {}x{} too small, using 16x16 minimum",
                capture.width, capture.height
            );
            capture.width = capture.width.max(16);
            capture.height = capture.height.max(16);
        }
        if !(capture.max_fps > 0.0) || !capture.max_fps.is_finite() {
            capture.max_fps = 5.0;
        }
        if !(capture.fps > 0.0) || capture.fps > capture.max_fps {
            warn!("fps {} out of range, clamping", capture.fps);
            capture.fps = if capture.fps > 0.0 {
                capture.fps.min(capture.max_fps)
            } else {
                1.0_f32.min(capture.max_fps)
            };
        }
        if !(capture.min_scale > 0.0)
            || !capture.max_scale.is_finite()
            || capture.min_scale > capture.max_scale
        {
            warn!(
                "Scale bounds {}..{} invalid, using 0.25..1.0",
                capture.min_scale, capture.max_scale
            );
            capture.min_scale = 0.25;
            capture.max_scale = 1.0;
        }

        let sup = &mut self.supervision;
        if sup.restart_max_interval_secs < sup.restart_min_interval_secs {
            sup.restart_max_interval_secs = sup.restart_min_interval_secs;
        }
        if sup.stale_after_secs == 0 {
            sup.stale_after_secs = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_bounds_fall_back() {
        let yaml = r#"
capture:
  max_scale: .nan
  max_fps: .inf
"#;
        let mut config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate();
        assert_eq!(config.capture.min_scale, 0.25);
        assert_eq!(config.capture.max_scale, 1.0);
        assert_eq!(config.capture.max_fps, 5.0);

        let target = crate::target::ViewQuery {
            scale: Some(0.5),
            ..Default::default()
        }
        .into_target("alpha", &config.capture);
        assert_eq!(target.scale, 0.5);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = r#"
server:
  listen: "127.0.0.1:8080"
capture:
  fps: 2
"#;
        let mut config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.server.frame_path, "current.jpg");
        assert_eq!(config.capture.fps, 2.0);
        assert_eq!(config.capture.width, 1404);
        assert_eq!(config.supervision.restart_min_interval_secs, 10);
    }

    #[test]
    fn validate_clamps_out_of_range_values() {
        let mut config = AppConfig::default();
        config.capture.rotate = 45;
        config.capture.jpeg_qscale = 40;
        config.capture.fps = 30.0;
        config.supervision.restart_max_interval_secs = 1;
        config.validate();

        assert_eq!(config.capture.rotate, 0);
        assert_eq!(config.capture.jpeg_qscale, 31);
        assert_eq!(config.capture.fps, config.capture.max_fps);
        assert_eq!(config.supervision.restart_max_interval_secs, 10);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:5000");
    }
}
