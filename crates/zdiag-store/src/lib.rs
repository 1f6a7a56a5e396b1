//! ZDIAG 存储适配器
//!
//! 仓储核心之下的存储一侧：
//! - `command`: （实体类型、操作）命令字典
//! - `codec`: 嵌入式内嵌集合的字符串编码
//! - `medium`: 读写协议在SQLite行上的具体化
//! - `bootstrap`: 库表模式与内建命令集
//! - `store`: SQLite后端（两阶段加载、单事务保存）

pub mod bootstrap;
pub mod codec;
pub mod command;
pub mod medium;
pub mod store;

pub mod prelude {
    //! 常用类型的便捷导入
    pub use crate::bootstrap::{create_schema, default_command_set, load_command_set, save_command_set};
    pub use crate::codec::{StringRecordReader, StringRecordWriter};
    pub use crate::command::{CommandOp, CommandSet, StoreCommand};
    pub use crate::medium::{ChildRowReader, SqliteRecordWriter, SqliteRowReader};
    pub use crate::store::SqliteStore;
}

pub use store::SqliteStore;
