use crate::state::SharedState;
use axum::{extract::State, Json};

/// 存活探针
pub async fn health() -> &'static str {
    "OK"
}

/// 监控器状态 API
/// 返回当前目标、进程与帧文件状态，以及主机的内存和负载信息
pub async fn status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let supervisor = state.supervisor.status().await;

    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(serde_json::json!({
        "supervisor": supervisor,
        "system": {
            "mem_total": mem.0 / 1024, // 转换为MB
            "mem_avail": mem.1 / 1024, // 转换为MB
            "load_avg": load,
        },
    }))
}
