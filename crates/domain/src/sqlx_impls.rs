//! # SQLx 数据库类型转换实现
//!
//! 本模块仅在启用 `sqlx-support` feature 时编译，
//! 状态枚举在 SQLite 中以大写字符串存储。

use crate::entities::{DependencyType, ExecutionStatus, JobStatus};

macro_rules! impl_sqlite_text_enum {
    ($ty:ty, $label:literal, { $($variant:path => $text:literal),+ $(,)? }) => {
        impl sqlx::Type<sqlx::Sqlite> for $ty {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <str as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $ty {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                match s {
                    $($text => Ok($variant),)+
                    _ => Err(format!("Invalid {}: {s}", $label).into()),
                }
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                let s = match self {
                    $($variant => $text,)+
                };
                <&str as sqlx::Encode<sqlx::Sqlite>>::encode(s, buf)
            }
        }
    };
}

impl_sqlite_text_enum!(JobStatus, "job status", {
    JobStatus::Active => "ACTIVE",
    JobStatus::Inactive => "INACTIVE",
});

impl_sqlite_text_enum!(ExecutionStatus, "execution status", {
    ExecutionStatus::Pending => "PENDING",
    ExecutionStatus::Running => "RUNNING",
    ExecutionStatus::Completed => "COMPLETED",
    ExecutionStatus::Failed => "FAILED",
    ExecutionStatus::Cancelled => "CANCELLED",
});

impl_sqlite_text_enum!(DependencyType, "dependency type", {
    DependencyType::Blocking => "BLOCKING",
    DependencyType::NonBlocking => "NON_BLOCKING",
});
