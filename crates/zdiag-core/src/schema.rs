//! 属性模式描述符
//!
//! 实体类型的字段布局在运行时以显式描述符表示，而不是依赖编译期反射。
//! 每个实体类型声明：名称、版本、类别、标量字段序列和内嵌对象集合。
//! 字段顺序就是线上契约：id、所有者id、声明字段（按描述符顺序）、
//! 每个嵌入式内嵌集合各占一格。

use serde::{Deserialize, Serialize};

/// 字段的声明类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Bool,
    Byte,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    Char,
    String,
    Date,
    Image,
}

impl FieldKind {
    /// 持久化用名称（SysParameter表）
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "Bool",
            Self::Byte => "Byte",
            Self::Int16 => "Int16",
            Self::Int32 => "Int32",
            Self::Int64 => "Int64",
            Self::Float => "Float",
            Self::Double => "Double",
            Self::Char => "Char",
            Self::String => "String",
            Self::Date => "Date",
            Self::Image => "Image",
        }
    }

    /// 从持久化名称解析
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Bool" => Some(Self::Bool),
            "Byte" => Some(Self::Byte),
            "Int16" => Some(Self::Int16),
            "Int32" => Some(Self::Int32),
            "Int64" => Some(Self::Int64),
            "Float" => Some(Self::Float),
            "Double" => Some(Self::Double),
            "Char" => Some(Self::Char),
            "String" => Some(Self::String),
            "Date" => Some(Self::Date),
            "Image" => Some(Self::Image),
            _ => None,
        }
    }
}

/// 标量字段描述符
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    /// 字段名称
    pub name: String,

    /// 声明类型
    pub kind: FieldKind,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// 内嵌对象集合的存储方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InnerStorage {
    /// 编码为所有者行上的单个字符串单元格（组合）
    Embedded,

    /// 以所有者id为键的独立子行（聚合）
    ChildRows,
}

/// 内嵌对象集合描述符
///
/// 存储方式是描述符数据的一部分，而不是按名称约定匹配。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerObjectsDef {
    /// 集合名称（同时是命令字典中子行命令的键）
    pub name: String,

    /// 存储方式
    pub storage: InnerStorage,

    /// 每条内嵌记录的字段（不含记录自身的id槽位）
    pub fields: Vec<FieldDef>,
}

impl InnerObjectsDef {
    pub fn new(name: impl Into<String>, storage: InnerStorage, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            storage,
            fields,
        }
    }
}

/// 实体类别（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityCategory {
    ProjectSettings,
    Design,
    Style,
    Template,
    ModelMapping,
    Model,
    ModelObject,
    Diagram,
    Shape,
}

/// 实体类型描述符
///
/// 运行时构造并注册，持久化层据此校验字段游标和生成命令参数。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityTypeDescriptor {
    /// 实体类型全名（命令字典的键）
    pub name: String,

    /// 模式版本
    pub version: u32,

    /// 实体类别
    pub category: EntityCategory,

    /// 标量字段，按持久化顺序
    pub fields: Vec<FieldDef>,

    /// 内嵌对象集合
    pub inner_objects: Vec<InnerObjectsDef>,
}

impl EntityTypeDescriptor {
    pub fn new(
        name: impl Into<String>,
        version: u32,
        category: EntityCategory,
        fields: Vec<FieldDef>,
        inner_objects: Vec<InnerObjectsDef>,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            category,
            fields,
            inner_objects,
        }
    }

    /// 查找内嵌集合描述符
    pub fn inner(&self, name: &str) -> Option<&InnerObjectsDef> {
        self.inner_objects.iter().find(|d| d.name == name)
    }

    /// 嵌入式内嵌集合
    pub fn embedded_inner_objects(&self) -> impl Iterator<Item = &InnerObjectsDef> {
        self.inner_objects
            .iter()
            .filter(|d| d.storage == InnerStorage::Embedded)
    }

    /// 子行内嵌集合
    pub fn child_row_inner_objects(&self) -> impl Iterator<Item = &InnerObjectsDef> {
        self.inner_objects
            .iter()
            .filter(|d| d.storage == InnerStorage::ChildRows)
    }

    /// 命令参数总数：id + 所有者id + 字段 + 每个嵌入式集合一格
    pub fn param_count(&self) -> usize {
        2 + self.fields.len() + self.embedded_inner_objects().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_count() {
        let desc = EntityTypeDescriptor::new(
            "Test.Thing",
            1,
            EntityCategory::Diagram,
            vec![
                FieldDef::new("name", FieldKind::String),
                FieldDef::new("size", FieldKind::Int32),
            ],
            vec![
                InnerObjectsDef::new(
                    "ranges",
                    InnerStorage::Embedded,
                    vec![FieldDef::new("lower", FieldKind::Float)],
                ),
                InnerObjectsDef::new(
                    "points",
                    InnerStorage::ChildRows,
                    vec![
                        FieldDef::new("x", FieldKind::Int32),
                        FieldDef::new("y", FieldKind::Int32),
                    ],
                ),
            ],
        );

        // id + owner + 2字段 + 1个嵌入式集合
        assert_eq!(desc.param_count(), 5);
        assert_eq!(desc.embedded_inner_objects().count(), 1);
        assert_eq!(desc.child_row_inner_objects().count(), 1);
        assert!(desc.inner("points").is_some());
        assert!(desc.inner("missing").is_none());
    }

    #[test]
    fn test_field_kind_roundtrip() {
        for kind in [
            FieldKind::Bool,
            FieldKind::Byte,
            FieldKind::Int16,
            FieldKind::Int32,
            FieldKind::Int64,
            FieldKind::Float,
            FieldKind::Double,
            FieldKind::Char,
            FieldKind::String,
            FieldKind::Date,
            FieldKind::Image,
        ] {
            assert_eq!(FieldKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(FieldKind::parse("Blob"), None);
    }
}
