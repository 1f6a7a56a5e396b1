//! 仓储错误定义

use crate::entity::{EntityId, ItemState};
use crate::schema::FieldKind;
use thiserror::Error;

/// 仓储操作的统一结果类型
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// 持久化核心的错误分类
///
/// 所有错误对当前操作都是致命的，直接向调用方传播；
/// 唯一的补偿动作是保存失败时的事务回滚（由存储适配器负责）。
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Command not defined: {entity_type}/{op}")]
    MissingCommand { entity_type: String, op: String },

    #[error("Schema overrun for {entity_type}: position {position} exceeds declared count {declared}")]
    SchemaOverrun {
        entity_type: String,
        position: usize,
        declared: usize,
    },

    #[error("Field type not supported by this medium: {0:?}")]
    UnsupportedFieldType(FieldKind),

    #[error("Operation not supported by this medium: {0}")]
    UnsupportedMedium(&'static str),

    #[error("Dangling reference to entity id {0}")]
    DanglingReference(EntityId),

    #[error("Referenced {0} has no identity yet")]
    UnregisteredReference(&'static str),

    #[error("Unsupported bucket state: {0:?}")]
    UnsupportedState(ItemState),

    #[error("Field decode error: {0}")]
    Parse(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl RepositoryError {
    /// 包装后端原生错误（存储适配器用）
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }

    /// 包装字段解码错误
    pub fn parse(err: impl std::fmt::Display) -> Self {
        Self::Parse(err.to_string())
    }
}
