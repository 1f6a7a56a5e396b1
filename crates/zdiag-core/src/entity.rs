//! 实体标识与生命周期管理
//!
//! 每个已加载实体对应唯一的桶（实体、所有者、生命周期状态）；
//! 新建实体尚无标识，单独以（句柄、所有者）对跟踪。

use crate::design::Design;
use crate::diagram::Diagram;
use crate::error::Result;
use crate::io::{RecordReader, RecordWriter};
use crate::model::{Model, ModelObject};
use crate::project::ProjectSettings;
use crate::shape::Shape;
use crate::template::Template;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// 实体唯一标识
///
/// 由后端在首次插入时分配，且只分配一次；新建实体的标识为`None`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub i64);

impl EntityId {
    pub fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 实体句柄
///
/// 单线程会话模型下的共享可变引用（见并发模型），
/// 对应原始对象图中实体间的直接引用。
pub type Handle<T> = Rc<RefCell<T>>;

/// 创建实体句柄
pub fn handle<T>(value: T) -> Handle<T> {
    Rc::new(RefCell::new(value))
}

/// 桶的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    /// 自上次保存以来未变
    Original,

    /// 字段已修改
    Modified,

    /// 仅所有者指针变化，字段未变
    OwnerChanged,

    /// 待删除
    Deleted,

    /// 尚未获得标识
    New,
}

/// 实体的所有者
///
/// 除工程根对象外，每个实体任意时刻恰有一个所有者；
/// 所有者必须先于其从属实体持久化。
#[derive(Clone)]
pub enum Owner {
    None,
    Project(Handle<ProjectSettings>),
    Design(Handle<Design>),
    Model(Handle<Model>),
    Template(Handle<Template>),
    Diagram(Handle<Diagram>),
    Shape(Handle<Shape>),
    ModelObject(Handle<ModelObject>),
}

impl Owner {
    /// 所有者实体的标识（尚未持久化时为`None`）
    pub fn id(&self) -> Option<EntityId> {
        match self {
            Self::None => None,
            Self::Project(h) => h.borrow().id(),
            Self::Design(h) => h.borrow().id(),
            Self::Model(h) => h.borrow().id(),
            Self::Template(h) => h.borrow().id(),
            Self::Diagram(h) => h.borrow().id(),
            Self::Shape(h) => h.borrow().id(),
            Self::ModelObject(h) => h.borrow().id(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, id) = match self {
            Self::None => ("None", None),
            Self::Project(h) => ("Project", h.borrow().id()),
            Self::Design(h) => ("Design", h.borrow().id()),
            Self::Model(h) => ("Model", h.borrow().id()),
            Self::Template(h) => ("Template", h.borrow().id()),
            Self::Diagram(h) => ("Diagram", h.borrow().id()),
            Self::Shape(h) => ("Shape", h.borrow().id()),
            Self::ModelObject(h) => ("ModelObject", h.borrow().id()),
        };
        match id {
            Some(id) => write!(f, "Owner::{kind}({id})"),
            None => write!(f, "Owner::{kind}(new)"),
        }
    }
}

/// 实体桶
///
/// 每个已加载实体恰有一个桶，按标识索引。
#[derive(Debug)]
pub struct EntityBucket<T> {
    /// 实体句柄
    pub entity: Handle<T>,

    /// 当前所有者
    pub owner: Owner,

    /// 生命周期状态
    pub state: ItemState,
}

impl<T> EntityBucket<T> {
    pub fn new(entity: Handle<T>, owner: Owner, state: ItemState) -> Self {
        Self {
            entity,
            owner,
            state,
        }
    }
}

/// 持久化实体契约
///
/// 实体通过注入的游标读写自身字段，对存储介质一无所知。
pub trait Persistable {
    /// 当前标识
    fn id(&self) -> Option<EntityId>;

    /// 写回后端分配的标识（仅插入时调用一次）
    fn assign_id(&mut self, id: EntityId);

    /// 按描述符顺序读取标量字段
    fn load_fields(&mut self, reader: &mut dyn RecordReader, version: u32) -> Result<()>;

    /// 按描述符顺序写出标量字段
    fn save_fields(&self, writer: &mut dyn RecordWriter, version: u32) -> Result<()>;

    /// 读取指定名称的内嵌对象集合
    fn load_inner_objects(
        &mut self,
        name: &str,
        reader: &mut dyn RecordReader,
        version: u32,
    ) -> Result<()> {
        let _ = (name, reader, version);
        Ok(())
    }

    /// 写出指定名称的内嵌对象集合（整体替换，先清除旧子行）
    fn save_inner_objects(
        &self,
        name: &str,
        writer: &mut dyn RecordWriter,
        version: u32,
    ) -> Result<()> {
        let _ = (name, writer, version);
        Ok(())
    }

    /// 删除通知：在实体行删除前清理其子行集合
    fn on_delete(&self, writer: &mut dyn RecordWriter, version: u32) -> Result<()> {
        let _ = (writer, version);
        Ok(())
    }
}
