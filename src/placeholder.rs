use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, Luma};
use std::path::Path;
use tracing::{info, warn};

const BACKGROUND: u8 = 235;
const BAR: u8 = 96;

/// 生成 "加载中" 占位图：浅灰画布，中间一条深色横条
pub fn render(width: u32, height: u32) -> anyhow::Result<Bytes> {
    let bar_top = height / 2 - height / 40;
    let bar_bottom = height / 2 + height / 40;
    let bar_left = width / 4;
    let bar_right = width - width / 4;

    let img = GrayImage::from_fn(width, height, |x, y| {
        let in_bar = (bar_top..=bar_bottom).contains(&y) && (bar_left..bar_right).contains(&x);
        Luma([if in_bar { BAR } else { BACKGROUND }])
    });

    let mut buf = Vec::new();
    img.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, 80))?;
    Ok(Bytes::from(buf))
}

/// 启动时生成一次占位图并落盘，落盘失败不影响服务 (内存中仍有一份)
pub fn prepare(path: &Path, width: u32, height: u32) -> anyhow::Result<Bytes> {
    let bytes = render(width, height)?;
    match std::fs::write(path, &bytes) {
        Ok(()) => info!("Placeholder written to {:?} ({} bytes)", path, bytes.len()),
        Err(e) => warn!("Failed to write placeholder {:?}: {}", path, e),
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::is_complete_jpeg;

    #[test]
    fn placeholder_is_a_valid_jpeg() {
        let bytes = render(64, 96).unwrap();
        assert!(is_complete_jpeg(&bytes));
    }

    #[test]
    fn prepare_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("placeholder.jpg");
        let bytes = prepare(&path, 32, 32).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), bytes.as_ref());
    }
}
