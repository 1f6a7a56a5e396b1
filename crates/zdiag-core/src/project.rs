//! 工程设置实体
//!
//! 工程是所有权图的根：设计、模板、模型和图示都直接或间接归属于它。

use crate::entity::{EntityId, Persistable};
use crate::error::Result;
use crate::io::{RecordReader, RecordWriter};
use crate::schema::{EntityCategory, EntityTypeDescriptor, FieldDef, FieldKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 工程设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSettings {
    /// 标识（首次保存时由后端分配）
    pub id: Option<EntityId>,

    /// 工程名称
    pub name: String,

    /// 描述
    pub description: String,

    /// 创建时间
    pub created_at: DateTime<Utc>,
}

impl ProjectSettings {
    /// 实体类型全名
    pub const TYPE_NAME: &'static str = "Core.Project";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    /// 类型描述符
    pub fn descriptor() -> EntityTypeDescriptor {
        EntityTypeDescriptor::new(
            Self::TYPE_NAME,
            1,
            EntityCategory::ProjectSettings,
            vec![
                FieldDef::new("name", FieldKind::String),
                FieldDef::new("description", FieldKind::String),
                FieldDef::new("created_at", FieldKind::Date),
            ],
            Vec::new(),
        )
    }
}

impl Persistable for ProjectSettings {
    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn load_fields(&mut self, reader: &mut dyn RecordReader, _version: u32) -> Result<()> {
        self.name = reader.read_string()?;
        self.description = reader.read_string()?;
        self.created_at = reader.read_date()?;
        Ok(())
    }

    fn save_fields(&self, writer: &mut dyn RecordWriter, _version: u32) -> Result<()> {
        writer.write_string(&self.name)?;
        writer.write_string(&self.description)?;
        writer.write_date(self.created_at)?;
        Ok(())
    }
}
