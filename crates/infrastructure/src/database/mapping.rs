//! SQLite 行映射的公共工具

use chrono::{DateTime, Utc};
use jobsched_errors::{SchedulerError, SchedulerResult};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn to_millis(at: DateTime<Utc>) -> i64 {
        at.timestamp_millis()
    }

    pub fn from_millis(millis: i64) -> SchedulerResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| SchedulerError::Serialization(format!("无效的时间戳: {millis}")))
    }

    pub fn get_time(row: &SqliteRow, field: &str) -> SchedulerResult<DateTime<Utc>> {
        let millis: i64 = row.try_get(field)?;
        Self::from_millis(millis)
    }

    pub fn get_optional_time(
        row: &SqliteRow,
        field: &str,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let millis: Option<i64> = row.try_get(field)?;
        millis.map(Self::from_millis).transpose()
    }

    pub fn get_uuid(row: &SqliteRow, field: &str) -> SchedulerResult<Uuid> {
        let raw: String = row.try_get(field)?;
        Uuid::parse_str(&raw)
            .map_err(|e| SchedulerError::Serialization(format!("解析执行ID失败: {e}")))
    }

    pub fn get_json(row: &SqliteRow, field: &str) -> SchedulerResult<serde_json::Value> {
        let raw: String = row.try_get(field)?;
        serde_json::from_str(&raw)
            .map_err(|e| SchedulerError::Serialization(format!("解析 {field} 失败: {e}")))
    }

    pub fn get_optional_json(
        row: &SqliteRow,
        field: &str,
    ) -> SchedulerResult<Option<serde_json::Value>> {
        let raw: Option<String> = row.try_get(field)?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| SchedulerError::Serialization(format!("解析 {field} 失败: {e}"))),
            None => Ok(None),
        }
    }

    /// 生成 `?, ?, ?` 形式的占位符
    pub fn placeholders(count: usize) -> String {
        vec!["?"; count].join(", ")
    }
}
