use crate::error::StartError;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// 可用内存低于该值 (KB) 时拒绝启动转码进程
const MIN_AVAILABLE_MEMORY_KB: u64 = 5120;

/// 启动一个转码进程所需的全部参数
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub input_url: String,
    pub filter_graph: String,
    pub jpeg_qscale: u8,
    pub output: PathBuf,
}

/// 转码进程的启动方式
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: &WorkerSpec) -> io::Result<Child>;
}

/// 基于 FFmpeg 的转码引擎：持续把最新一帧覆盖写入同一个 JPEG 文件
pub struct Engine {
    binary: String,
}

impl Engine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn command(&self, spec: &WorkerSpec) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner")
            .args(["-loglevel", "error"])
            .arg("-nostdin")
            .arg("-y");
        // 直播源按原始速率读取
        cmd.arg("-re").arg("-i").arg(&spec.input_url);
        cmd.arg("-an");
        cmd.arg("-vf").arg(&spec.filter_graph);
        cmd.arg("-q:v").arg(spec.jpeg_qscale.to_string());
        cmd.args(["-f", "image2", "-update", "1"]);
        cmd.arg(&spec.output);

        // 标准流全部丢弃，避免管道写满导致进程阻塞
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }
}

impl WorkerLauncher for Engine {
    fn launch(&self, spec: &WorkerSpec) -> io::Result<Child> {
        let child = self.command(spec).spawn()?;
        info!(
            "Spawned {} (pid {:?}) -> {:?}",
            self.binary,
            child.id(),
            spec.output
        );
        Ok(child)
    }
}

/// 检查系统内存是否足够；无法获取内存信息时只记录警告
pub fn ensure_memory() -> Result<(), StartError> {
    match sys_info::mem_info() {
        Ok(mem) if mem.avail < MIN_AVAILABLE_MEMORY_KB => {
            Err(StartError::InsufficientMemory(mem.avail))
        }
        Ok(_) => Ok(()),
        Err(e) => {
            warn!("Failed to check memory usage: {}", e);
            Ok(())
        }
    }
}

/// 先发送终止信号，超时后强制杀死
pub async fn terminate(child: &mut Child, timeout: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    if send_sigterm(child) {
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => return status,
            Err(_) => warn!(
                "Worker pid {:?} ignored SIGTERM for {:?}, killing",
                child.id(),
                timeout
            ),
        }
    }

    child.kill().await?;
    child.wait().await
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: pid 来自仍未被回收的子进程
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!("SIGTERM to pid {} failed: {}", pid, io::Error::last_os_error());
    }
    rc == 0
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}
