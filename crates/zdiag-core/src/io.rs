//! 读写协议
//!
//! 存储无关的游标对：实体用同一套接口读写自身字段并递归进入
//! 内嵌对象作用域，介质可以是数据库行，也可以是紧凑字符串编码。
//! 每次标量读写使内部游标前进一格，越过声明字段数即报
//! `SchemaOverrun`。内嵌对象的嵌套深度恰为一层。

use crate::design::Style;
use crate::entity::{EntityId, Handle, Persistable};
use crate::error::{RepositoryError, Result};
use crate::model::ModelObject;
use crate::shape::Shape;
use crate::template::Template;
use chrono::{DateTime, Utc};

/// 对象引用解析视图
///
/// 由仓储缓存实现；读取器据此把标识解析为已加载实体的句柄。
/// 缓存中不存在的标识是致命的悬挂引用。
pub trait RefResolver {
    fn resolve_style(&self, id: EntityId) -> Option<Handle<Style>>;
    fn resolve_shape(&self, id: EntityId) -> Option<Handle<Shape>>;
    fn resolve_template(&self, id: EntityId) -> Option<Handle<Template>>;
    fn resolve_model_object(&self, id: EntityId) -> Option<Handle<ModelObject>>;
}

/// 空解析器，用于不含对象引用的介质（如字符串编码）
pub struct NoRefs;

impl RefResolver for NoRefs {
    fn resolve_style(&self, _id: EntityId) -> Option<Handle<Style>> {
        None
    }

    fn resolve_shape(&self, _id: EntityId) -> Option<Handle<Shape>> {
        None
    }

    fn resolve_template(&self, _id: EntityId) -> Option<Handle<Template>> {
        None
    }

    fn resolve_model_object(&self, _id: EntityId) -> Option<Handle<ModelObject>> {
        None
    }
}

/// 记录读取器
pub trait RecordReader {
    /// 当前介质的引用解析器
    fn resolver(&self) -> &dyn RefResolver;

    fn read_bool(&mut self) -> Result<bool>;
    fn read_byte(&mut self) -> Result<u8>;
    fn read_i16(&mut self) -> Result<i16>;
    fn read_i32(&mut self) -> Result<i32>;
    fn read_i64(&mut self) -> Result<i64>;
    fn read_f32(&mut self) -> Result<f32>;
    fn read_f64(&mut self) -> Result<f64>;
    fn read_char(&mut self) -> Result<char>;
    fn read_string(&mut self) -> Result<String>;
    fn read_date(&mut self) -> Result<DateTime<Utc>>;
    fn read_image(&mut self) -> Result<Vec<u8>>;

    /// 读取标识字段；空引用返回`None`
    fn read_id(&mut self) -> Result<Option<EntityId>>;

    /// 读取样式引用并解析为句柄
    fn read_style_ref(&mut self) -> Result<Option<Handle<Style>>> {
        match self.read_id()? {
            None => Ok(None),
            Some(id) => self
                .resolver()
                .resolve_style(id)
                .map(Some)
                .ok_or(RepositoryError::DanglingReference(id)),
        }
    }

    /// 读取形状引用并解析为句柄
    fn read_shape_ref(&mut self) -> Result<Option<Handle<Shape>>> {
        match self.read_id()? {
            None => Ok(None),
            Some(id) => self
                .resolver()
                .resolve_shape(id)
                .map(Some)
                .ok_or(RepositoryError::DanglingReference(id)),
        }
    }

    /// 读取模板引用并解析为句柄
    fn read_template_ref(&mut self) -> Result<Option<Handle<Template>>> {
        match self.read_id()? {
            None => Ok(None),
            Some(id) => self
                .resolver()
                .resolve_template(id)
                .map(Some)
                .ok_or(RepositoryError::DanglingReference(id)),
        }
    }

    /// 读取模型对象引用并解析为句柄
    fn read_model_object_ref(&mut self) -> Result<Option<Handle<ModelObject>>> {
        match self.read_id()? {
            None => Ok(None),
            Some(id) => self
                .resolver()
                .resolve_model_object(id)
                .map(Some)
                .ok_or(RepositoryError::DanglingReference(id)),
        }
    }

    /// 打开命名的内嵌对象作用域
    fn begin_inner_objects(&mut self, name: &str) -> Result<()>;

    /// 进入下一条内嵌记录；作用域耗尽时返回`false`
    fn begin_inner_object(&mut self) -> Result<bool>;

    /// 结束当前内嵌记录
    fn end_inner_object(&mut self) -> Result<()>;

    /// 关闭内嵌对象作用域
    fn end_inner_objects(&mut self) -> Result<()>;
}

/// 记录写入器
pub trait RecordWriter {
    /// 重置游标并绑定目标实体（写裸内嵌记录时传`None`）
    fn prepare(&mut self, entity_id: Option<EntityId>) -> Result<()>;

    /// 把当前已准备的记录提交到介质
    fn finish(&mut self) -> Result<()>;

    fn write_bool(&mut self, value: bool) -> Result<()>;
    fn write_byte(&mut self, value: u8) -> Result<()>;
    fn write_i16(&mut self, value: i16) -> Result<()>;
    fn write_i32(&mut self, value: i32) -> Result<()>;
    fn write_i64(&mut self, value: i64) -> Result<()>;
    fn write_f32(&mut self, value: f32) -> Result<()>;
    fn write_f64(&mut self, value: f64) -> Result<()>;
    fn write_char(&mut self, value: char) -> Result<()>;
    fn write_string(&mut self, value: &str) -> Result<()>;
    fn write_date(&mut self, value: DateTime<Utc>) -> Result<()>;
    fn write_image(&mut self, value: &[u8]) -> Result<()>;

    /// 写出标识字段；`None`写空引用
    fn write_id(&mut self, id: Option<EntityId>) -> Result<()>;

    /// 写出样式引用；被引用实体尚无标识时报`UnregisteredReference`
    fn write_style_ref(&mut self, style: Option<&Handle<Style>>) -> Result<()> {
        match style {
            None => self.write_id(None),
            Some(h) => {
                let id = h
                    .borrow()
                    .id()
                    .ok_or(RepositoryError::UnregisteredReference("style"))?;
                self.write_id(Some(id))
            }
        }
    }

    /// 写出形状引用
    fn write_shape_ref(&mut self, shape: Option<&Handle<Shape>>) -> Result<()> {
        match shape {
            None => self.write_id(None),
            Some(h) => {
                let id = h
                    .borrow()
                    .id()
                    .ok_or(RepositoryError::UnregisteredReference("shape"))?;
                self.write_id(Some(id))
            }
        }
    }

    /// 写出模板引用
    fn write_template_ref(&mut self, template: Option<&Handle<Template>>) -> Result<()> {
        match template {
            None => self.write_id(None),
            Some(h) => {
                let id = h
                    .borrow()
                    .id()
                    .ok_or(RepositoryError::UnregisteredReference("template"))?;
                self.write_id(Some(id))
            }
        }
    }

    /// 写出模型对象引用
    fn write_model_object_ref(&mut self, obj: Option<&Handle<ModelObject>>) -> Result<()> {
        match obj {
            None => self.write_id(None),
            Some(h) => {
                let id = h
                    .borrow()
                    .id()
                    .ok_or(RepositoryError::UnregisteredReference("model object"))?;
                self.write_id(Some(id))
            }
        }
    }

    /// 打开命名的内嵌对象作用域
    fn begin_write_inner_objects(&mut self, name: &str) -> Result<()>;

    /// 开始一条内嵌记录
    fn begin_write_inner_object(&mut self) -> Result<()>;

    /// 结束一条内嵌记录
    fn end_write_inner_object(&mut self) -> Result<()>;

    /// 关闭内嵌对象作用域
    fn end_write_inner_objects(&mut self) -> Result<()>;

    /// 清除此前持久化的子行
    ///
    /// 内嵌集合总是整体替换、从不增量修补，重写前必须先清除。
    fn delete_inner_objects(&mut self, name: &str) -> Result<()>;
}
