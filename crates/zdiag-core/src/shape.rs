//! 形状实体与形状连接
//!
//! 几何与渲染不在本层：形状在持久化核心里只是一组标量字段、
//! 一张顶点子行表和若干对象引用。具体形状类型在运行时注册，
//! 每个类型名对应命令字典中独立的一组命令。

use crate::design::Style;
use crate::entity::{EntityId, Handle, Persistable};
use crate::error::Result;
use crate::io::{RecordReader, RecordWriter};
use crate::model::ModelObject;
use crate::schema::{
    EntityCategory, EntityTypeDescriptor, FieldDef, FieldKind, InnerObjectsDef, InnerStorage,
};
use crate::template::Template;
use serde::{Deserialize, Serialize};

/// 形状顶点（子行内嵌集合的一条记录）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vertex {
    pub x: i32,
    pub y: i32,
}

impl Vertex {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// 形状
#[derive(Debug, Clone)]
pub struct Shape {
    pub id: Option<EntityId>,

    /// 注册的具体形状类型名
    pub type_name: String,

    /// 位置X
    pub x: i32,

    /// 位置Y
    pub y: i32,

    /// 旋转角（十分之一度）
    pub angle: i16,

    /// 图示内的叠放次序
    pub z_order: i32,

    /// 文本内容
    pub text: String,

    /// 来源模板
    pub template: Option<Handle<Template>>,

    /// 关联的模型对象
    pub model_object: Option<Handle<ModelObject>>,

    /// 使用的样式
    pub style: Option<Handle<Style>>,

    /// 顶点（子行内嵌集合）
    pub vertices: Vec<Vertex>,
}

impl Shape {
    /// 顶点集合的作用域名称
    pub const VERTICES: &'static str = "vertices";

    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            id: None,
            type_name: type_name.into(),
            x: 0,
            y: 0,
            angle: 0,
            z_order: 0,
            text: String::new(),
            template: None,
            model_object: None,
            style: None,
            vertices: Vec::new(),
        }
    }

    /// 指定类型名的形状描述符
    ///
    /// 所有内建形状类型共享同一字段布局，但各自拥有独立的
    /// 类型名、数据表和命令字典条目。
    pub fn descriptor(type_name: impl Into<String>) -> EntityTypeDescriptor {
        EntityTypeDescriptor::new(
            type_name,
            1,
            EntityCategory::Shape,
            vec![
                FieldDef::new("template_ref", FieldKind::Int32),
                FieldDef::new("model_object_ref", FieldKind::Int32),
                FieldDef::new("style_ref", FieldKind::Int32),
                FieldDef::new("x", FieldKind::Int32),
                FieldDef::new("y", FieldKind::Int32),
                FieldDef::new("angle", FieldKind::Int16),
                FieldDef::new("z_order", FieldKind::Int32),
                FieldDef::new("text", FieldKind::String),
            ],
            vec![InnerObjectsDef::new(
                Self::VERTICES,
                InnerStorage::ChildRows,
                vec![
                    FieldDef::new("x", FieldKind::Int32),
                    FieldDef::new("y", FieldKind::Int32),
                ],
            )],
        )
    }
}

/// 内建形状类型描述符
pub fn builtin_shape_types() -> Vec<EntityTypeDescriptor> {
    vec![
        Shape::descriptor("Shapes.Rect"),
        Shape::descriptor("Shapes.Ellipse"),
        Shape::descriptor("Shapes.Polyline"),
    ]
}

impl Persistable for Shape {
    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn load_fields(&mut self, reader: &mut dyn RecordReader, _version: u32) -> Result<()> {
        self.template = reader.read_template_ref()?;
        self.model_object = reader.read_model_object_ref()?;
        self.style = reader.read_style_ref()?;
        self.x = reader.read_i32()?;
        self.y = reader.read_i32()?;
        self.angle = reader.read_i16()?;
        self.z_order = reader.read_i32()?;
        self.text = reader.read_string()?;
        Ok(())
    }

    fn save_fields(&self, writer: &mut dyn RecordWriter, _version: u32) -> Result<()> {
        writer.write_template_ref(self.template.as_ref())?;
        writer.write_model_object_ref(self.model_object.as_ref())?;
        writer.write_style_ref(self.style.as_ref())?;
        writer.write_i32(self.x)?;
        writer.write_i32(self.y)?;
        writer.write_i16(self.angle)?;
        writer.write_i32(self.z_order)?;
        writer.write_string(&self.text)?;
        Ok(())
    }

    fn load_inner_objects(
        &mut self,
        name: &str,
        reader: &mut dyn RecordReader,
        _version: u32,
    ) -> Result<()> {
        if name != Self::VERTICES {
            return Ok(());
        }
        self.vertices.clear();
        reader.begin_inner_objects(name)?;
        while reader.begin_inner_object()? {
            let x = reader.read_i32()?;
            let y = reader.read_i32()?;
            self.vertices.push(Vertex::new(x, y));
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
        if name != Self::VERTICES {
            return Ok(());
        }
        writer.delete_inner_objects(name)?;
        writer.begin_write_inner_objects(name)?;
        for vertex in &self.vertices {
            writer.begin_write_inner_object()?;
            writer.write_i32(vertex.x)?;
            writer.write_i32(vertex.y)?;
            writer.end_write_inner_object()?;
        }
        writer.end_write_inner_objects()?;
        Ok(())
    }

    fn on_delete(&self, writer: &mut dyn RecordWriter, _version: u32) -> Result<()> {
        writer.delete_inner_objects(Self::VERTICES)
    }
}

/// 形状连接
///
/// 连接件形状的某个连接点指向目标形状的某个连接点；
/// 保存前在仓储的待插入/待删除集合中暂存。
#[derive(Debug, Clone)]
pub struct ShapeConnection {
    /// 连接件形状
    pub connector: Handle<Shape>,

    /// 连接件侧连接点编号
    pub connector_point: i32,

    /// 目标形状
    pub target: Handle<Shape>,

    /// 目标侧连接点编号
    pub target_point: i32,
}

impl ShapeConnection {
    pub const TYPE_NAME: &'static str = "Core.ShapeConnection";

    pub fn new(
        connector: Handle<Shape>,
        connector_point: i32,
        target: Handle<Shape>,
        target_point: i32,
    ) -> Self {
        Self {
            connector,
            connector_point,
            target,
            target_point,
        }
    }

    /// 两个连接是否指同一条边（按句柄同一性与连接点比较）
    pub fn same_as(&self, other: &ShapeConnection) -> bool {
        std::rc::Rc::ptr_eq(&self.connector, &other.connector)
            && std::rc::Rc::ptr_eq(&self.target, &other.target)
            && self.connector_point == other.connector_point
            && self.target_point == other.target_point
    }
}
