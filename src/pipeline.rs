use crate::config::CaptureConfig;
use crate::target::ChannelTarget;

/// 生成转码滤镜链所需的全部参数
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineParams {
    pub fps: f32,
    pub rotate: u32,
    pub width: u32,
    pub height: u32,
    pub grayscale: bool,
    pub jpeg_qscale: u8,
}

impl PipelineParams {
    pub fn new(target: &ChannelTarget, capture: &CaptureConfig) -> Self {
        Self {
            fps: target.fps,
            rotate: capture.rotate,
            width: scaled_even(capture.width, target.scale),
            height: scaled_even(capture.height, target.scale),
            grayscale: capture.grayscale,
            jpeg_qscale: target.jpeg_qscale,
        }
    }

    /// 构建 `-vf` 滤镜链
    ///
    /// 顺序固定：抽帧 → 旋转 → 等比缩放 → 居中填充 → 灰度。
    /// 旋转必须先于缩放/填充，填充画布才能反映旋转后的方向；
    /// 抽帧放在最前，后续的空间变换只处理保留下来的帧
    pub fn filter_graph(&self) -> String {
        let mut parts = vec![format!("fps={}", self.fps)];

        match self.rotate {
            90 => parts.push("transpose=clock".to_string()),
            180 => parts.push("hflip,vflip".to_string()),
            270 => parts.push("transpose=cclock".to_string()),
            _ => {}
        }

        let (w, h) = (self.width, self.height);
        parts.push(format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease:flags=lanczos"
        ));
        parts.push(format!("pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color=white"));

        if self.grayscale {
            parts.push("format=gray".to_string());
        }

        parts.join(",")
    }
}

/// 按比例缩放并取偶数，mjpeg 编码器要求偶数尺寸
fn scaled_even(value: u32, scale: f32) -> u32 {
    let scaled = (value as f32 * scale).round() as u32;
    (scaled & !1).max(16)
}
