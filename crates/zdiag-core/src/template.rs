//! 模板实体
//!
//! 模板持有一个原型形状（作为归属于模板的形状行存储），
//! 可选地再持有一个模型对象原型。

use crate::entity::{EntityId, Persistable};
use crate::error::Result;
use crate::io::{RecordReader, RecordWriter};
use crate::schema::{EntityCategory, EntityTypeDescriptor, FieldDef, FieldKind};
use serde::{Deserialize, Serialize};

/// 模板
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Option<EntityId>,

    /// 模板名称
    pub name: String,

    /// 描述
    pub description: String,
}

impl Template {
    pub const TYPE_NAME: &'static str = "Core.Template";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn descriptor() -> EntityTypeDescriptor {
        EntityTypeDescriptor::new(
            Self::TYPE_NAME,
            1,
            EntityCategory::Template,
            vec![
                FieldDef::new("name", FieldKind::String),
                FieldDef::new("description", FieldKind::String),
            ],
            Vec::new(),
        )
    }
}

impl Persistable for Template {
    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn load_fields(&mut self, reader: &mut dyn RecordReader, _version: u32) -> Result<()> {
        self.name = reader.read_string()?;
        self.description = reader.read_string()?;
        Ok(())
    }

    fn save_fields(&self, writer: &mut dyn RecordWriter, _version: u32) -> Result<()> {
        writer.write_string(&self.name)?;
        writer.write_string(&self.description)?;
        Ok(())
    }
}
