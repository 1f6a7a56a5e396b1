//! 命令字典
//!
//! 按（实体类型全名、操作类别）注册后端参数化命令。字典由存储
//! 实例持有（显式构造、显式注册，不是进程级单例）；缺失的条目
//! 在首次使用时才报错，因此只读库等部分配置是合法的。

use std::collections::HashMap;
use zdiag_core::error::{RepositoryError, Result};
use zdiag_core::schema::FieldDef;

/// 操作类别
///
/// 插入与改所有者操作按新所有者的种类细分，存储适配器据此路由
/// 到写入正确所有者列的命令。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandOp {
    CreateSchema,
    Insert,
    InsertDiagramShape,
    InsertTemplateShape,
    InsertChildShape,
    InsertModelModelObject,
    InsertTemplateModelObject,
    InsertChildModelObject,
    Update,
    UpdateOwnerDiagram,
    UpdateOwnerShape,
    UpdateOwnerModel,
    UpdateOwnerModelObject,
    Delete,
    SelectAll,
    SelectById,
    SelectByName,
    SelectByOwnerId,
    SelectDiagramShapes,
    SelectTemplateShape,
    SelectChildShapes,
    SelectModelModelObjects,
    SelectTemplateModelObjects,
    SelectChildModelObjects,
}

impl CommandOp {
    /// 持久化用名称（SysCommand表）
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateSchema => "CreateSchema",
            Self::Insert => "Insert",
            Self::InsertDiagramShape => "InsertDiagramShape",
            Self::InsertTemplateShape => "InsertTemplateShape",
            Self::InsertChildShape => "InsertChildShape",
            Self::InsertModelModelObject => "InsertModelModelObject",
            Self::InsertTemplateModelObject => "InsertTemplateModelObject",
            Self::InsertChildModelObject => "InsertChildModelObject",
            Self::Update => "Update",
            Self::UpdateOwnerDiagram => "UpdateOwnerDiagram",
            Self::UpdateOwnerShape => "UpdateOwnerShape",
            Self::UpdateOwnerModel => "UpdateOwnerModel",
            Self::UpdateOwnerModelObject => "UpdateOwnerModelObject",
            Self::Delete => "Delete",
            Self::SelectAll => "SelectAll",
            Self::SelectById => "SelectById",
            Self::SelectByName => "SelectByName",
            Self::SelectByOwnerId => "SelectByOwnerId",
            Self::SelectDiagramShapes => "SelectDiagramShapes",
            Self::SelectTemplateShape => "SelectTemplateShape",
            Self::SelectChildShapes => "SelectChildShapes",
            Self::SelectModelModelObjects => "SelectModelModelObjects",
            Self::SelectTemplateModelObjects => "SelectTemplateModelObjects",
            Self::SelectChildModelObjects => "SelectChildModelObjects",
        }
    }

    /// 从持久化名称解析
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CreateSchema" => Some(Self::CreateSchema),
            "Insert" => Some(Self::Insert),
            "InsertDiagramShape" => Some(Self::InsertDiagramShape),
            "InsertTemplateShape" => Some(Self::InsertTemplateShape),
            "InsertChildShape" => Some(Self::InsertChildShape),
            "InsertModelModelObject" => Some(Self::InsertModelModelObject),
            "InsertTemplateModelObject" => Some(Self::InsertTemplateModelObject),
            "InsertChildModelObject" => Some(Self::InsertChildModelObject),
            "Update" => Some(Self::Update),
            "UpdateOwnerDiagram" => Some(Self::UpdateOwnerDiagram),
            "UpdateOwnerShape" => Some(Self::UpdateOwnerShape),
            "UpdateOwnerModel" => Some(Self::UpdateOwnerModel),
            "UpdateOwnerModelObject" => Some(Self::UpdateOwnerModelObject),
            "Delete" => Some(Self::Delete),
            "SelectAll" => Some(Self::SelectAll),
            "SelectById" => Some(Self::SelectById),
            "SelectByName" => Some(Self::SelectByName),
            "SelectByOwnerId" => Some(Self::SelectByOwnerId),
            "SelectDiagramShapes" => Some(Self::SelectDiagramShapes),
            "SelectTemplateShape" => Some(Self::SelectTemplateShape),
            "SelectChildShapes" => Some(Self::SelectChildShapes),
            "SelectModelModelObjects" => Some(Self::SelectModelModelObjects),
            "SelectTemplateModelObjects" => Some(Self::SelectTemplateModelObjects),
            "SelectChildModelObjects" => Some(Self::SelectChildModelObjects),
            _ => None,
        }
    }
}

/// 一条注册的后端命令
///
/// 参数个数与顺序必须与读写协议为该实体类型产出的字段顺序完全
/// 一致：id、所有者id、声明字段（描述符顺序）、每个嵌入式内嵌
/// 集合一格。
#[derive(Debug, Clone)]
pub struct StoreCommand {
    /// 后端原生SQL文本（?N编号占位符）
    pub sql: String,

    /// 有序的类型化参数表
    pub params: Vec<FieldDef>,
}

impl StoreCommand {
    pub fn new(sql: impl Into<String>, params: Vec<FieldDef>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// 命令字典
#[derive(Debug, Clone, Default)]
pub struct CommandSet {
    commands: HashMap<(String, CommandOp), StoreCommand>,
}

impl CommandSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册命令（重复注册覆盖旧条目）
    pub fn set_command(
        &mut self,
        entity_type: impl Into<String>,
        op: CommandOp,
        command: StoreCommand,
    ) {
        self.commands.insert((entity_type.into(), op), command);
    }

    /// 查找命令；缺失在使用时才报错
    pub fn get_command(&self, entity_type: &str, op: CommandOp) -> Result<&StoreCommand> {
        self.commands
            .get(&(entity_type.to_string(), op))
            .ok_or_else(|| RepositoryError::MissingCommand {
                entity_type: entity_type.to_string(),
                op: op.as_str().to_string(),
            })
    }

    pub fn has_command(&self, entity_type: &str, op: CommandOp) -> bool {
        self.commands.contains_key(&(entity_type.to_string(), op))
    }

    /// 注销命令，返回被移除的条目
    pub fn remove_command(&mut self, entity_type: &str, op: CommandOp) -> Option<StoreCommand> {
        self.commands.remove(&(entity_type.to_string(), op))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// 遍历全部条目（持久化到SysCommand用）
    pub fn iter(&self) -> impl Iterator<Item = (&(String, CommandOp), &StoreCommand)> {
        self.commands.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zdiag_core::schema::FieldKind;

    #[test]
    fn test_set_and_get_command() {
        let mut set = CommandSet::new();
        set.set_command(
            "Core.Design",
            CommandOp::Insert,
            StoreCommand::new(
                "INSERT INTO design (id, owner, name) VALUES (?1, ?2, ?3)",
                vec![
                    FieldDef::new("id", FieldKind::Int32),
                    FieldDef::new("owner", FieldKind::Int32),
                    FieldDef::new("name", FieldKind::String),
                ],
            ),
        );

        let cmd = set.get_command("Core.Design", CommandOp::Insert).unwrap();
        assert_eq!(cmd.params.len(), 3);
        assert!(set.has_command("Core.Design", CommandOp::Insert));
    }

    #[test]
    fn test_missing_command_surfaces_at_use_time() {
        let set = CommandSet::new();
        let err = set
            .get_command("Core.Design", CommandOp::Delete)
            .unwrap_err();
        match err {
            RepositoryError::MissingCommand { entity_type, op } => {
                assert_eq!(entity_type, "Core.Design");
                assert_eq!(op, "Delete");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_op_name_roundtrip() {
        for op in [
            CommandOp::CreateSchema,
            CommandOp::Insert,
            CommandOp::InsertDiagramShape,
            CommandOp::InsertTemplateShape,
            CommandOp::InsertChildShape,
            CommandOp::InsertModelModelObject,
            CommandOp::InsertTemplateModelObject,
            CommandOp::InsertChildModelObject,
            CommandOp::Update,
            CommandOp::UpdateOwnerDiagram,
            CommandOp::UpdateOwnerShape,
            CommandOp::UpdateOwnerModel,
            CommandOp::UpdateOwnerModelObject,
            CommandOp::Delete,
            CommandOp::SelectAll,
            CommandOp::SelectById,
            CommandOp::SelectByName,
            CommandOp::SelectByOwnerId,
            CommandOp::SelectDiagramShapes,
            CommandOp::SelectTemplateShape,
            CommandOp::SelectChildShapes,
            CommandOp::SelectModelModelObjects,
            CommandOp::SelectTemplateModelObjects,
            CommandOp::SelectChildModelObjects,
        ] {
            assert_eq!(CommandOp::parse(op.as_str()), Some(op));
        }
        assert_eq!(CommandOp::parse("Truncate"), None);
    }
}
