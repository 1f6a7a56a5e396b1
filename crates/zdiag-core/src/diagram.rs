//! 图示实体

use crate::entity::{EntityId, Persistable};
use crate::error::{RepositoryError, Result};
use crate::io::{RecordReader, RecordWriter};
use crate::schema::{EntityCategory, EntityTypeDescriptor, FieldDef, FieldKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 图示
///
/// 自定义属性作为JSON文本存入单个字符串字段。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagram {
    pub id: Option<EntityId>,

    /// 图示名称
    pub name: String,

    /// 显示标题
    pub title: String,

    /// 画布宽度
    pub width: i32,

    /// 画布高度
    pub height: i32,

    /// 背景色（ARGB）
    pub background_argb: i32,

    /// 背景图片数据（空表示无）
    pub background_image: Vec<u8>,

    /// 自定义属性
    pub custom_properties: HashMap<String, String>,
}

impl Diagram {
    pub const TYPE_NAME: &'static str = "Core.Diagram";

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: None,
            title: name.clone(),
            name,
            width: 1000,
            height: 1000,
            background_argb: 0x00_FF_FF_FF,
            background_image: Vec::new(),
            custom_properties: HashMap::new(),
        }
    }

    pub fn descriptor() -> EntityTypeDescriptor {
        EntityTypeDescriptor::new(
            Self::TYPE_NAME,
            1,
            EntityCategory::Diagram,
            vec![
                FieldDef::new("name", FieldKind::String),
                FieldDef::new("title", FieldKind::String),
                FieldDef::new("width", FieldKind::Int32),
                FieldDef::new("height", FieldKind::Int32),
                FieldDef::new("background_argb", FieldKind::Int32),
                FieldDef::new("background_image", FieldKind::Image),
                FieldDef::new("custom_properties", FieldKind::String),
            ],
            Vec::new(),
        )
    }
}

impl Persistable for Diagram {
    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn load_fields(&mut self, reader: &mut dyn RecordReader, _version: u32) -> Result<()> {
        self.name = reader.read_string()?;
        self.title = reader.read_string()?;
        self.width = reader.read_i32()?;
        self.height = reader.read_i32()?;
        self.background_argb = reader.read_i32()?;
        self.background_image = reader.read_image()?;
        let props = reader.read_string()?;
        self.custom_properties = if props.is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&props).map_err(RepositoryError::parse)?
        };
        Ok(())
    }

    fn save_fields(&self, writer: &mut dyn RecordWriter, _version: u32) -> Result<()> {
        writer.write_string(&self.name)?;
        writer.write_string(&self.title)?;
        writer.write_i32(self.width)?;
        writer.write_i32(self.height)?;
        writer.write_i32(self.background_argb)?;
        writer.write_image(&self.background_image)?;
        let props = if self.custom_properties.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&self.custom_properties).map_err(RepositoryError::parse)?
        };
        writer.write_string(&props)?;
        Ok(())
    }
}
