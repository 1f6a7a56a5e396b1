//! 设计与样式实体
//!
//! 设计是样式的容器；样式被形状按引用使用。

use crate::entity::{EntityId, Persistable};
use crate::error::{RepositoryError, Result};
use crate::io::{RecordReader, RecordWriter};
use crate::schema::{EntityCategory, EntityTypeDescriptor, FieldDef, FieldKind};
use serde::{Deserialize, Serialize};

/// 设计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Design {
    pub id: Option<EntityId>,

    /// 设计名称
    pub name: String,

    /// 描述
    pub description: String,
}

impl Design {
    pub const TYPE_NAME: &'static str = "Core.Design";

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
            EntityCategory::Design,
            vec![
                FieldDef::new("name", FieldKind::String),
                FieldDef::new("description", FieldKind::String),
            ],
            Vec::new(),
        )
    }
}

impl Persistable for Design {
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

/// 样式类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StyleKind {
    Color = 1,
    Line = 2,
    Fill = 3,
}

impl StyleKind {
    fn from_i32(value: i32) -> Result<Self> {
        match value {
            1 => Ok(Self::Color),
            2 => Ok(Self::Line),
            3 => Ok(Self::Fill),
            other => Err(RepositoryError::Parse(format!(
                "invalid style kind: {other}"
            ))),
        }
    }
}

/// 样式
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Style {
    pub id: Option<EntityId>,

    /// 样式名称
    pub name: String,

    /// 样式类别
    pub kind: StyleKind,

    /// ARGB颜色
    pub color_argb: i32,

    /// 线宽
    pub line_width: f32,

    /// 是否虚线
    pub dashed: bool,

    /// 透明度（0-255）
    pub transparency: u8,
}

impl Style {
    pub const TYPE_NAME: &'static str = "Core.Style";

    pub fn new(name: impl Into<String>, kind: StyleKind) -> Self {
        Self {
            id: None,
            name: name.into(),
            kind,
            color_argb: 0xFF_FF_FF_FFu32 as i32,
            line_width: 1.0,
            dashed: false,
            transparency: 0,
        }
    }

    pub fn descriptor() -> EntityTypeDescriptor {
        EntityTypeDescriptor::new(
            Self::TYPE_NAME,
            1,
            EntityCategory::Style,
            vec![
                FieldDef::new("name", FieldKind::String),
                FieldDef::new("kind", FieldKind::Int32),
                FieldDef::new("color_argb", FieldKind::Int32),
                FieldDef::new("line_width", FieldKind::Float),
                FieldDef::new("dashed", FieldKind::Bool),
                FieldDef::new("transparency", FieldKind::Byte),
            ],
            Vec::new(),
        )
    }
}

impl Persistable for Style {
    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn load_fields(&mut self, reader: &mut dyn RecordReader, _version: u32) -> Result<()> {
        self.name = reader.read_string()?;
        self.kind = StyleKind::from_i32(reader.read_i32()?)?;
        self.color_argb = reader.read_i32()?;
        self.line_width = reader.read_f32()?;
        self.dashed = reader.read_bool()?;
        self.transparency = reader.read_byte()?;
        Ok(())
    }

    fn save_fields(&self, writer: &mut dyn RecordWriter, _version: u32) -> Result<()> {
        writer.write_string(&self.name)?;
        writer.write_i32(self.kind as i32)?;
        writer.write_i32(self.color_argb)?;
        writer.write_f32(self.line_width)?;
        writer.write_bool(self.dashed)?;
        writer.write_byte(self.transparency)?;
        Ok(())
    }
}
