//! ZDIAG 持久化核心
//!
//! 图示编辑器的对象持久化与变更跟踪子系统：实体对存储介质一无所知，
//! 通过注入的读写游标搬运自身字段；仓储缓存跟踪每个实体的生命周期
//! 状态，并把分类好的变更集整体交给可替换的存储适配器。
//!
//! # 架构设计
//!
//! - `entity`: 标识、句柄、生命周期桶与`Persistable`契约
//! - `schema`: 运行时实体类型描述符（字段布局即线上契约）
//! - `io`: 读写游标与引用解析
//! - `repository`: 实体缓存、惰性加载与变更集管理
//! - 具体实体类型按类别分模块（设计、模板、模型、图示、形状）
//!
//! # 示例
//!
//! ```rust,no_run
//! use zdiag_core::prelude::*;
//! # fn open_store() -> Box<dyn Store> { unimplemented!() }
//!
//! let mut repo = Repository::new(open_store());
//! for descriptor in zdiag_core::shape::builtin_shape_types() {
//!     repo.register_shape_type(descriptor);
//! }
//! repo.create("My Project")?;
//!
//! let diagram = handle(Diagram::new("Page 1"));
//! repo.insert_diagram(diagram.clone())?;
//! repo.save_changes()?;
//! # Ok::<(), zdiag_core::error::RepositoryError>(())
//! ```

pub mod design;
pub mod diagram;
pub mod entity;
pub mod error;
pub mod io;
pub mod model;
pub mod project;
pub mod repository;
pub mod schema;
pub mod shape;
pub mod template;

pub mod prelude {
    //! 常用类型的便捷导入
    pub use crate::design::{Design, Style, StyleKind};
    pub use crate::diagram::Diagram;
    pub use crate::entity::{handle, EntityBucket, EntityId, Handle, ItemState, Owner, Persistable};
    pub use crate::error::{RepositoryError, Result};
    pub use crate::io::{RecordReader, RecordWriter, RefResolver};
    pub use crate::model::{MappingKind, Model, ModelMapping, ModelObject, ValueRange};
    pub use crate::project::ProjectSettings;
    pub use crate::repository::{
        Repository, RepositoryAction, RepositoryEvent, RepositoryState, Store,
    };
    pub use crate::schema::{
        EntityCategory, EntityTypeDescriptor, FieldDef, FieldKind, InnerObjectsDef, InnerStorage,
    };
    pub use crate::shape::{Shape, ShapeConnection, Vertex};
    pub use crate::template::Template;
}
