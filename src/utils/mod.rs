//! 工具函数模块
//!
//! 提供时间戳转换、客户端关联 ID 生成等通用工具函数

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// 毫秒数转换为 DateTime
pub fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// 解析 RFC3339 时间字符串并统一为 UTC
///
/// # 示例
/// ```
/// use farmhub_chat_core::utils::parse_rfc3339;
///
/// let ts = parse_rfc3339("2025-03-01T08:30:00+08:00").unwrap();
/// assert_eq!(ts.to_rfc3339(), "2025-03-01T00:30:00+00:00");
/// assert!(parse_rfc3339("yesterday").is_none());
/// ```
pub fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// 生成新的客户端消息关联 ID（UUIDv4）
///
/// 发送时附加到持久化请求与实时广播上，用于乐观条目与回显的对账。
pub fn new_client_msg_id() -> String {
    Uuid::new_v4().to_string()
}

/// 两个时间点之间的绝对差（毫秒）
pub fn millis_between(a: &DateTime<Utc>, b: &DateTime<Utc>) -> i64 {
    (a.timestamp_millis() - b.timestamp_millis()).abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_roundtrip() {
        let dt = millis_to_datetime(1_700_000_000_123).unwrap();
        assert_eq!(dt.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_parse_rfc3339_accepts_js_iso_strings() {
        // new Date().toISOString() 的输出格式
        let dt = parse_rfc3339("2025-06-01T10:00:00.250Z").unwrap();
        assert_eq!(dt.timestamp_millis() % 1000, 250);
    }

    #[test]
    fn test_client_msg_ids_are_unique() {
        assert_ne!(new_client_msg_id(), new_client_msg_id());
    }

    #[test]
    fn test_millis_between_is_symmetric() {
        let a = millis_to_datetime(1_000).unwrap();
        let b = millis_to_datetime(3_500).unwrap();
        assert_eq!(millis_between(&a, &b), 2_500);
        assert_eq!(millis_between(&b, &a), 2_500);
    }
}
