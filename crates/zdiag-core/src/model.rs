//! 模型、模型对象与模型映射实体
//!
//! 模型对象构成一棵以模型为根的树（模板也可以拥有原型模型对象）；
//! 模型映射把模型对象属性映射到形状属性，其取值区间表以嵌入式
//! 内嵌集合存储（编码进所有者行的单个单元格）。

use crate::entity::{EntityId, Persistable};
use crate::error::{RepositoryError, Result};
use crate::io::{RecordReader, RecordWriter};
use crate::schema::{
    EntityCategory, EntityTypeDescriptor, FieldDef, FieldKind, InnerObjectsDef, InnerStorage,
};
use serde::{Deserialize, Serialize};

/// 模型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: Option<EntityId>,

    /// 模型名称
    pub name: String,
}

impl Model {
    pub const TYPE_NAME: &'static str = "Core.Model";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
        }
    }

    pub fn descriptor() -> EntityTypeDescriptor {
        EntityTypeDescriptor::new(
            Self::TYPE_NAME,
            1,
            EntityCategory::Model,
            vec![FieldDef::new("name", FieldKind::String)],
            Vec::new(),
        )
    }
}

impl Persistable for Model {
    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn load_fields(&mut self, reader: &mut dyn RecordReader, _version: u32) -> Result<()> {
        self.name = reader.read_string()?;
        Ok(())
    }

    fn save_fields(&self, writer: &mut dyn RecordWriter, _version: u32) -> Result<()> {
        writer.write_string(&self.name)?;
        Ok(())
    }
}

/// 模型对象
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: Option<EntityId>,

    /// 对象名称
    pub name: String,

    /// 整型值
    pub int_value: i64,

    /// 浮点值
    pub float_value: f64,

    /// 字符串值
    pub string_value: String,
}

impl ModelObject {
    pub const TYPE_NAME: &'static str = "Core.ModelObject";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            int_value: 0,
            float_value: 0.0,
            string_value: String::new(),
        }
    }

    pub fn descriptor() -> EntityTypeDescriptor {
        EntityTypeDescriptor::new(
            Self::TYPE_NAME,
            1,
            EntityCategory::ModelObject,
            vec![
                FieldDef::new("name", FieldKind::String),
                FieldDef::new("int_value", FieldKind::Int64),
                FieldDef::new("float_value", FieldKind::Double),
                FieldDef::new("string_value", FieldKind::String),
            ],
            Vec::new(),
        )
    }
}

impl Persistable for ModelObject {
    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn load_fields(&mut self, reader: &mut dyn RecordReader, _version: u32) -> Result<()> {
        self.name = reader.read_string()?;
        self.int_value = reader.read_i64()?;
        self.float_value = reader.read_f64()?;
        self.string_value = reader.read_string()?;
        Ok(())
    }

    fn save_fields(&self, writer: &mut dyn RecordWriter, _version: u32) -> Result<()> {
        writer.write_string(&self.name)?;
        writer.write_i64(self.int_value)?;
        writer.write_f64(self.float_value)?;
        writer.write_string(&self.string_value)?;
        Ok(())
    }
}

/// 映射类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingKind {
    Numeric = 1,
    Format = 2,
    Style = 3,
}

impl MappingKind {
    fn from_i32(value: i32) -> Result<Self> {
        match value {
            1 => Ok(Self::Numeric),
            2 => Ok(Self::Format),
            3 => Ok(Self::Style),
            other => Err(RepositoryError::Parse(format!(
                "invalid mapping kind: {other}"
            ))),
        }
    }
}

/// 取值区间：模型值达到下界时套用指定样式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    /// 区间下界
    pub lower: f32,

    /// 套用的样式标识
    pub style: Option<EntityId>,
}

/// 模型映射
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    pub id: Option<EntityId>,

    /// 映射类别
    pub kind: MappingKind,

    /// 形状侧属性编号
    pub shape_property: i32,

    /// 模型侧属性编号
    pub model_property: i32,

    /// 线性映射截距
    pub intercept: f64,

    /// 线性映射系数
    pub multiplier: f64,

    /// 取值区间表（嵌入式内嵌集合）
    pub value_ranges: Vec<ValueRange>,
}

impl ModelMapping {
    pub const TYPE_NAME: &'static str = "Core.ModelMapping";

    /// 取值区间集合的作用域名称
    pub const VALUE_RANGES: &'static str = "value_ranges";

    pub fn new(kind: MappingKind, shape_property: i32, model_property: i32) -> Self {
        Self {
            id: None,
            kind,
            shape_property,
            model_property,
            intercept: 0.0,
            multiplier: 1.0,
            value_ranges: Vec::new(),
        }
    }

    pub fn descriptor() -> EntityTypeDescriptor {
        EntityTypeDescriptor::new(
            Self::TYPE_NAME,
            1,
            EntityCategory::ModelMapping,
            vec![
                FieldDef::new("kind", FieldKind::Int32),
                FieldDef::new("shape_property", FieldKind::Int32),
                FieldDef::new("model_property", FieldKind::Int32),
                FieldDef::new("intercept", FieldKind::Double),
                FieldDef::new("multiplier", FieldKind::Double),
            ],
            vec![InnerObjectsDef::new(
                Self::VALUE_RANGES,
                InnerStorage::Embedded,
                vec![FieldDef::new("lower", FieldKind::Float)],
            )],
        )
    }
}

impl Persistable for ModelMapping {
    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn load_fields(&mut self, reader: &mut dyn RecordReader, _version: u32) -> Result<()> {
        self.kind = MappingKind::from_i32(reader.read_i32()?)?;
        self.shape_property = reader.read_i32()?;
        self.model_property = reader.read_i32()?;
        self.intercept = reader.read_f64()?;
        self.multiplier = reader.read_f64()?;
        Ok(())
    }

    fn save_fields(&self, writer: &mut dyn RecordWriter, _version: u32) -> Result<()> {
        writer.write_i32(self.kind as i32)?;
        writer.write_i32(self.shape_property)?;
        writer.write_i32(self.model_property)?;
        writer.write_f64(self.intercept)?;
        writer.write_f64(self.multiplier)?;
        Ok(())
    }

    fn load_inner_objects(
        &mut self,
        name: &str,
        reader: &mut dyn RecordReader,
        _version: u32,
    ) -> Result<()> {
        if name != Self::VALUE_RANGES {
            return Ok(());
        }
        self.value_ranges.clear();
        reader.begin_inner_objects(name)?;
        while reader.begin_inner_object()? {
            let style = reader.read_id()?;
            let lower = reader.read_f32()?;
            self.value_ranges.push(ValueRange { lower, style });
            reader.end_inner_object()?;
        }
        reader.end_inner_objects()?;
        Ok(())
    }

    fn save_inner_objects(
        &self,
        name: &str,
        writer: &mut dyn RecordWriter,
        _version: u32,
    ) -> Result<()> {
        if name != Self::VALUE_RANGES {
            return Ok(());
        }
        writer.delete_inner_objects(name)?;
        writer.begin_write_inner_objects(name)?;
        for range in &self.value_ranges {
            writer.begin_write_inner_object()?;
            writer.write_id(range.style)?;
            writer.write_f32(range.lower)?;
            writer.end_write_inner_object()?;
        }
        writer.end_write_inner_objects()?;
        Ok(())
    }
}
