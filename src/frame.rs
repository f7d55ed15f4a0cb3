//! 帧存储：磁盘上的帧文件由外部转码进程原地覆盖写入，
//! 读取时做格式校验，失败则回退到内存中最后一次有效的帧

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// 由修改时间与文件大小派生的版本标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameVersion {
    pub modified_nanos: u128,
    pub len: u64,
}

impl FrameVersion {
    fn from_metadata(meta: &Metadata) -> Option<Self> {
        let modified = meta.modified().ok()?;
        let modified_nanos = modified.duration_since(UNIX_EPOCH).ok()?.as_nanos();
        Some(Self {
            modified_nanos,
            len: meta.len(),
        })
    }

    /// 强校验 ETag (含引号)
    pub fn etag(&self) -> String {
        format!("\"{:x}-{:x}\"", self.modified_nanos, self.len)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Bytes,
    pub version: FrameVersion,
}

pub struct FrameStore {
    path: PathBuf,
    /// 最后一次校验通过的帧
    shadow: RwLock<Option<Frame>>,
}

impl FrameStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            shadow: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 返回最新的有效帧
    ///
    /// 磁盘读取出错或内容不完整 (写入进行中) 时返回影子副本，
    /// 因此调用方永远看不到被撕裂的帧。从未读到有效帧时返回 `None`
    pub async fn read(&self) -> Option<Frame> {
        match self.read_disk().await {
            Ok(Some(frame)) => {
                let mut shadow = self.shadow.write();
                let newer = shadow
                    .as_ref()
                    .map_or(true, |cur| frame.version.modified_nanos >= cur.version.modified_nanos);
                if newer {
                    *shadow = Some(frame.clone());
                    return Some(frame);
                }
                shadow.clone()
            }
            Ok(None) => self.shadow.read().clone(),
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Frame read failed for {:?}: {}", self.path, e);
                }
                self.shadow.read().clone()
            }
        }
    }

    async fn read_disk(&self) -> io::Result<Option<Frame>> {
        let file = fs::File::open(&self.path).await?;
        read_validated(file).await
    }

    /// 仅读取元数据，供条件请求快速比较
    pub async fn version(&self) -> Option<FrameVersion> {
        let meta = fs::metadata(&self.path).await.ok()?;
        FrameVersion::from_metadata(&meta)
    }

    pub async fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).await.ok()?.modified().ok()
    }

    /// 文件不存在同样视为过期
    pub async fn is_stale(&self, max_age: Duration) -> bool {
        match self.modified().await {
            Some(modified) => age_of(modified) > max_age,
            None => true,
        }
    }

    /// 删除磁盘帧并清空影子副本 (切换频道时使用)
    pub async fn reset(&self) {
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove frame file {:?}: {}", self.path, e);
            }
        }
        *self.shadow.write() = None;
    }
}

/// 读取并校验已打开的帧文件，校验不通过返回 `Ok(None)`
///
/// 版本与内容来自同一个句柄；读取前后元数据不一致说明期间被原地改写
async fn read_validated(mut file: fs::File) -> io::Result<Option<Frame>> {
    let before = file.metadata().await?;
    let mut bytes = Vec::with_capacity(before.len() as usize);
    file.read_to_end(&mut bytes).await?;
    let after = file.metadata().await?;

    let version = FrameVersion::from_metadata(&before);
    if version != FrameVersion::from_metadata(&after)
        || before.len() != bytes.len() as u64
        || !is_complete_jpeg(&bytes)
    {
        debug!("Torn frame ({} bytes)", bytes.len());
        return Ok(None);
    }

    Ok(version.map(|version| Frame {
        bytes: Bytes::from(bytes),
        version,
    }))
}

pub fn age_of(time: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(time)
        .unwrap_or(Duration::ZERO)
}

/// 以 SOI 开头、EOI 结尾才算完整的 JPEG
pub fn is_complete_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes.starts_with(&JPEG_SOI) && bytes.ends_with(&JPEG_EOI)
}
