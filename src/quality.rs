/// 期望清晰度不可用时依次尝试的备选项
pub const FALLBACK_ORDER: &[&str] = &[
    "source", "1080p60", "1080p", "936p60", "936p", "720p60", "720p", "480p", "360p", "160p",
    "best", "worst",
];

/// 从可用清晰度中选出一个
///
/// 顺序：期望值 → `FALLBACK_ORDER` → 第一个可用项。只有可用集合为空时才返回 `None`
pub fn select_quality(available: &[String], desired: &str) -> Option<String> {
    let has = |label: &str| available.iter().any(|q| q.eq_ignore_ascii_case(label));

    if has(desired) {
        return Some(desired.to_ascii_lowercase());
    }

    FALLBACK_ORDER
        .iter()
        .find(|label| has(label))
        .map(|label| label.to_string())
        .or_else(|| available.first().cloned())
}
