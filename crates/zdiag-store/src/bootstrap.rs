//! 模式引导与命令字典持久化
//!
//! 建表语句本身也是一条注册命令（`Sys.Schema`/`CreateSchema`）；
//! 自描述的`syscommand`/`sysparameter`表对把整个命令字典连同
//! 参数名与类型一起存进后端，部署出去的库自带命令集，客户端
//! 打开时直接重载而不必重新注册。

use crate::command::{CommandOp, CommandSet, StoreCommand};
use rusqlite::{params, Connection};
use zdiag_core::design::{Design, Style};
use zdiag_core::diagram::Diagram;
use zdiag_core::error::{RepositoryError, Result};
use zdiag_core::model::{Model, ModelMapping, ModelObject};
use zdiag_core::project::ProjectSettings;
use zdiag_core::schema::{EntityTypeDescriptor, FieldDef, FieldKind};
use zdiag_core::shape::{builtin_shape_types, Shape, ShapeConnection};
use zdiag_core::template::Template;

/// 建表命令的字典键
pub const SCHEMA_KEY: &str = "Sys.Schema";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS project (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner INTEGER,
    name TEXT NOT NULL,
    description TEXT,
    created_at TEXT
);
CREATE TABLE IF NOT EXISTS design (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner INTEGER,
    name TEXT NOT NULL,
    description TEXT
);
CREATE TABLE IF NOT EXISTS style (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner INTEGER,
    name TEXT NOT NULL,
    kind INTEGER NOT NULL,
    color_argb INTEGER,
    line_width REAL,
    dashed INTEGER,
    transparency INTEGER
);
CREATE TABLE IF NOT EXISTS template (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner INTEGER,
    name TEXT NOT NULL,
    description TEXT
);
CREATE TABLE IF NOT EXISTS model_mapping (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner INTEGER,
    kind INTEGER NOT NULL,
    shape_property INTEGER,
    model_property INTEGER,
    intercept REAL,
    multiplier REAL,
    value_ranges TEXT
);
CREATE TABLE IF NOT EXISTS model (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner INTEGER,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS model_object (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_model INTEGER,
    owner_template INTEGER,
    owner_parent INTEGER,
    name TEXT NOT NULL,
    int_value INTEGER,
    float_value REAL,
    string_value TEXT
);
CREATE TABLE IF NOT EXISTS diagram (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner INTEGER,
    name TEXT NOT NULL,
    title TEXT,
    width INTEGER,
    height INTEGER,
    background_argb INTEGER,
    background_image BLOB,
    custom_properties TEXT
);
CREATE TABLE IF NOT EXISTS shape (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type_name TEXT NOT NULL,
    owner_diagram INTEGER,
    owner_template INTEGER,
    owner_shape INTEGER,
    template_ref INTEGER,
    model_object_ref INTEGER,
    style_ref INTEGER,
    x INTEGER,
    y INTEGER,
    angle INTEGER,
    z_order INTEGER,
    text TEXT
);
CREATE TABLE IF NOT EXISTS vertex (
    owner INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    x INTEGER,
    y INTEGER
);
CREATE TABLE IF NOT EXISTS connection (
    connector INTEGER NOT NULL,
    connector_point INTEGER NOT NULL,
    target INTEGER NOT NULL,
    target_point INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS syscommand (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    op TEXT NOT NULL,
    sql TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sysparameter (
    command_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL
);
";

/// 执行注册的建表命令
pub fn create_schema(conn: &Connection, commands: &CommandSet) -> Result<()> {
    let cmd = commands.get_command(SCHEMA_KEY, CommandOp::CreateSchema)?;
    conn.execute_batch(&cmd.sql).map_err(RepositoryError::store)
}

/// 参数表：id、所有者id、声明字段、每个嵌入式集合一格
fn entity_params(descriptor: &EntityTypeDescriptor) -> Vec<FieldDef> {
    let mut params = vec![
        FieldDef::new("id", FieldKind::Int32),
        FieldDef::new("owner", FieldKind::Int32),
    ];
    params.extend(descriptor.fields.iter().cloned());
    for def in descriptor.embedded_inner_objects() {
        params.push(FieldDef::new(def.name.clone(), FieldKind::String));
    }
    params
}

fn wire_columns(descriptor: &EntityTypeDescriptor) -> Vec<String> {
    let mut columns: Vec<String> = descriptor.fields.iter().map(|f| f.name.clone()).collect();
    columns.extend(descriptor.embedded_inner_objects().map(|d| d.name.clone()));
    columns
}

fn insert_sql(table: &str, owner_col: &str, descriptor: &EntityTypeDescriptor) -> String {
    let columns = wire_columns(descriptor);
    let mut names = format!("id, {owner_col}");
    let mut slots = String::from("?1, ?2");
    for (i, column) in columns.iter().enumerate() {
        names.push_str(", ");
        names.push_str(column);
        slots.push_str(&format!(", ?{}", i + 3));
    }
    format!("INSERT INTO {table} ({names}) VALUES ({slots})")
}

fn update_sql(table: &str, descriptor: &EntityTypeDescriptor) -> String {
    let assignments: Vec<String> = wire_columns(descriptor)
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{column} = ?{}", i + 3))
        .collect();
    // ?2（所有者）在普通更新里留空不用；改所有者走专门命令
    format!(
        "UPDATE {table} SET {} WHERE id = ?1",
        assignments.join(", ")
    )
}

fn select_sql(
    table: &str,
    owner_col: &str,
    descriptor: &EntityTypeDescriptor,
    where_clause: &str,
) -> String {
    let columns = wire_columns(descriptor).join(", ");
    format!("SELECT id, {owner_col}, {columns} FROM {table}{where_clause}")
}

/// 注册一个普通实体类别的增删改查命令
fn register_entity_commands(
    set: &mut CommandSet,
    descriptor: &EntityTypeDescriptor,
    table: &str,
) {
    let params = entity_params(descriptor);
    set.set_command(
        &descriptor.name,
        CommandOp::Insert,
        StoreCommand::new(insert_sql(table, "owner", descriptor), params.clone()),
    );
    set.set_command(
        &descriptor.name,
        CommandOp::Update,
        StoreCommand::new(update_sql(table, descriptor), params.clone()),
    );
    set.set_command(
        &descriptor.name,
        CommandOp::Delete,
        StoreCommand::new(
            format!("DELETE FROM {table} WHERE id = ?1"),
            vec![FieldDef::new("id", FieldKind::Int32)],
        ),
    );
    set.set_command(
        &descriptor.name,
        CommandOp::SelectAll,
        StoreCommand::new(select_sql(table, "owner", descriptor, ""), Vec::new()),
    );
}

/// 注册一个具体形状类型的全部命令
///
/// 形状共用一张物理表，命令按类型名过滤；三个插入变体只在
/// 所有者列上不同。
pub fn register_shape_commands(set: &mut CommandSet, descriptor: &EntityTypeDescriptor) {
    let params = entity_params(descriptor);
    let type_name = &descriptor.name;
    let columns = wire_columns(descriptor);

    for (op, owner_col) in [
        (CommandOp::InsertDiagramShape, "owner_diagram"),
        (CommandOp::InsertTemplateShape, "owner_template"),
        (CommandOp::InsertChildShape, "owner_shape"),
    ] {
        let mut names = format!("type_name, id, {owner_col}");
        let mut slots = String::from("?1, ?2");
        for (i, column) in columns.iter().enumerate() {
            names.push_str(", ");
            names.push_str(column);
            slots.push_str(&format!(", ?{}", i + 3));
        }
        set.set_command(
            type_name,
            op,
            StoreCommand::new(
                format!("INSERT INTO shape ({names}) VALUES ('{type_name}', {slots})"),
                params.clone(),
            ),
        );
    }

    set.set_command(
        type_name,
        CommandOp::Update,
        StoreCommand::new(update_sql("shape", descriptor), params.clone()),
    );
    for (op, owner_col) in [
        (CommandOp::UpdateOwnerDiagram, "owner_diagram"),
        (CommandOp::UpdateOwnerShape, "owner_shape"),
    ] {
        let others: Vec<&str> = ["owner_diagram", "owner_template", "owner_shape"]
            .into_iter()
            .filter(|c| *c != owner_col)
            .collect();
        set.set_command(
            type_name,
            op,
            StoreCommand::new(
                format!(
                    "UPDATE shape SET {owner_col} = ?2, {} = NULL, {} = NULL WHERE id = ?1",
                    others[0], others[1]
                ),
                vec![
                    FieldDef::new("id", FieldKind::Int32),
                    FieldDef::new("owner", FieldKind::Int32),
                ],
            ),
        );
    }
    set.set_command(
        type_name,
        CommandOp::Delete,
        StoreCommand::new(
            "DELETE FROM shape WHERE id = ?1",
            vec![FieldDef::new("id", FieldKind::Int32)],
        ),
    );

    let filter = format!(" WHERE type_name = '{type_name}'");
    set.set_command(
        type_name,
        CommandOp::SelectDiagramShapes,
        StoreCommand::new(
            select_sql(
                "shape",
                "owner_diagram",
                descriptor,
                &format!("{filter} AND owner_diagram = ?1 ORDER BY z_order"),
            ),
            vec![FieldDef::new("owner", FieldKind::Int32)],
        ),
    );
    set.set_command(
        type_name,
        CommandOp::SelectTemplateShape,
        StoreCommand::new(
            select_sql(
                "shape",
                "owner_template",
                descriptor,
                &format!("{filter} AND owner_template IS NOT NULL"),
            ),
            Vec::new(),
        ),
    );
    set.set_command(
        type_name,
        CommandOp::SelectChildShapes,
        StoreCommand::new(
            select_sql(
                "shape",
                "owner_shape",
                descriptor,
                &format!("{filter} AND owner_shape = ?1 ORDER BY z_order"),
            ),
            vec![FieldDef::new("owner", FieldKind::Int32)],
        ),
    );
}

fn register_model_object_commands(set: &mut CommandSet) {
    let descriptor = ModelObject::descriptor();
    let params = entity_params(&descriptor);
    let key = &descriptor.name;

    for (op, owner_col) in [
        (CommandOp::InsertModelModelObject, "owner_model"),
        (CommandOp::InsertTemplateModelObject, "owner_template"),
        (CommandOp::InsertChildModelObject, "owner_parent"),
    ] {
        set.set_command(
            key,
            op,
            StoreCommand::new(insert_sql("model_object", owner_col, &descriptor), params.clone()),
        );
    }
    set.set_command(
        key,
        CommandOp::Update,
        StoreCommand::new(update_sql("model_object", &descriptor), params.clone()),
    );
    for (op, owner_col) in [
        (CommandOp::UpdateOwnerModel, "owner_model"),
        (CommandOp::UpdateOwnerModelObject, "owner_parent"),
    ] {
        let others: Vec<&str> = ["owner_model", "owner_template", "owner_parent"]
            .into_iter()
            .filter(|c| *c != owner_col)
            .collect();
        set.set_command(
            key,
            op,
            StoreCommand::new(
                format!(
                    "UPDATE model_object SET {owner_col} = ?2, {} = NULL, {} = NULL WHERE id = ?1",
                    others[0], others[1]
                ),
                vec![
                    FieldDef::new("id", FieldKind::Int32),
                    FieldDef::new("owner", FieldKind::Int32),
                ],
            ),
        );
    }
    set.set_command(
        key,
        CommandOp::Delete,
        StoreCommand::new(
            "DELETE FROM model_object WHERE id = ?1",
            vec![FieldDef::new("id", FieldKind::Int32)],
        ),
    );
    set.set_command(
        key,
        CommandOp::SelectModelModelObjects,
        StoreCommand::new(
            select_sql(
                "model_object",
                "owner_model",
                &descriptor,
                " WHERE owner_model IS NOT NULL",
            ),
            Vec::new(),
        ),
    );
    set.set_command(
        key,
        CommandOp::SelectTemplateModelObjects,
        StoreCommand::new(
            select_sql(
                "model_object",
                "owner_template",
                &descriptor,
                " WHERE owner_template IS NOT NULL",
            ),
            Vec::new(),
        ),
    );
    set.set_command(
        key,
        CommandOp::SelectChildModelObjects,
        StoreCommand::new(
            select_sql(
                "model_object",
                "owner_parent",
                &descriptor,
                " WHERE owner_parent = ?1",
            ),
            vec![FieldDef::new("owner", FieldKind::Int32)],
        ),
    );
}

/// 内建实体类型与操作的全套SQLite命令
pub fn default_command_set() -> CommandSet {
    let mut set = CommandSet::new();

    set.set_command(
        SCHEMA_KEY,
        CommandOp::CreateSchema,
        StoreCommand::new(SCHEMA_SQL, Vec::new()),
    );

    register_entity_commands(&mut set, &ProjectSettings::descriptor(), "project");
    register_entity_commands(&mut set, &Design::descriptor(), "design");
    register_entity_commands(&mut set, &Style::descriptor(), "style");
    register_entity_commands(&mut set, &Template::descriptor(), "template");
    register_entity_commands(&mut set, &ModelMapping::descriptor(), "model_mapping");
    register_entity_commands(&mut set, &Model::descriptor(), "model");
    register_entity_commands(&mut set, &Diagram::descriptor(), "diagram");
    register_model_object_commands(&mut set);

    for descriptor in builtin_shape_types() {
        register_shape_commands(&mut set, &descriptor);
    }

    // 顶点子行集合：按所有者整删整写，读取按序号排序
    set.set_command(
        Shape::VERTICES,
        CommandOp::Insert,
        StoreCommand::new(
            "INSERT INTO vertex (owner, seq, x, y) VALUES (?1, ?2, ?3, ?4)",
            vec![
                FieldDef::new("owner", FieldKind::Int32),
                FieldDef::new("seq", FieldKind::Int32),
                FieldDef::new("x", FieldKind::Int32),
                FieldDef::new("y", FieldKind::Int32),
            ],
        ),
    );
    set.set_command(
        Shape::VERTICES,
        CommandOp::Delete,
        StoreCommand::new(
            "DELETE FROM vertex WHERE owner = ?1",
            vec![FieldDef::new("owner", FieldKind::Int32)],
        ),
    );
    set.set_command(
        Shape::VERTICES,
        CommandOp::SelectByOwnerId,
        StoreCommand::new(
            "SELECT x, y FROM vertex WHERE owner = ?1 ORDER BY seq",
            vec![FieldDef::new("owner", FieldKind::Int32)],
        ),
    );

    let connection_params = vec![
        FieldDef::new("connector", FieldKind::Int32),
        FieldDef::new("connector_point", FieldKind::Int32),
        FieldDef::new("target", FieldKind::Int32),
        FieldDef::new("target_point", FieldKind::Int32),
    ];
    set.set_command(
        ShapeConnection::TYPE_NAME,
        CommandOp::Insert,
        StoreCommand::new(
            "INSERT INTO connection (connector, connector_point, target, target_point) \
             VALUES (?1, ?2, ?3, ?4)",
            connection_params.clone(),
        ),
    );
    set.set_command(
        ShapeConnection::TYPE_NAME,
        CommandOp::Delete,
        StoreCommand::new(
            "DELETE FROM connection WHERE connector = ?1 AND connector_point = ?2 \
             AND target = ?3 AND target_point = ?4",
            connection_params,
        ),
    );
    set.set_command(
        ShapeConnection::TYPE_NAME,
        CommandOp::SelectByOwnerId,
        StoreCommand::new(
            "SELECT connector, connector_point, target, target_point FROM connection \
             WHERE connector = ?1",
            vec![FieldDef::new("connector", FieldKind::Int32)],
        ),
    );

    set
}

/// 把命令字典写入SysCommand/SysParameter表（整体替换）
pub fn save_command_set(conn: &Connection, set: &CommandSet) -> Result<()> {
    conn.execute("DELETE FROM sysparameter", [])
        .map_err(RepositoryError::store)?;
    conn.execute("DELETE FROM syscommand", [])
        .map_err(RepositoryError::store)?;

    let mut entries: Vec<_> = set.iter().collect();
    entries.sort_by(|a, b| (&a.0 .0, a.0 .1.as_str()).cmp(&(&b.0 .0, b.0 .1.as_str())));
    for ((entity_type, op), command) in entries {
        conn.execute(
            "INSERT INTO syscommand (entity_type, op, sql) VALUES (?1, ?2, ?3)",
            params![entity_type, op.as_str(), command.sql],
        )
        .map_err(RepositoryError::store)?;
        let command_id = conn.last_insert_rowid();
        for (position, param) in command.params.iter().enumerate() {
            conn.execute(
                "INSERT INTO sysparameter (command_id, position, name, kind) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![command_id, position as i64, param.name, param.kind.as_str()],
            )
            .map_err(RepositoryError::store)?;
        }
    }
    Ok(())
}

/// 从SysCommand/SysParameter表重载命令字典
pub fn load_command_set(conn: &Connection) -> Result<CommandSet> {
    let mut set = CommandSet::new();
    let mut stmt = conn
        .prepare("SELECT id, entity_type, op, sql FROM syscommand")
        .map_err(RepositoryError::store)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(RepositoryError::store)?;

    for row in rows {
        let (command_id, entity_type, op_name, sql) = row.map_err(RepositoryError::store)?;
        let op = CommandOp::parse(&op_name).ok_or_else(|| {
            RepositoryError::Parse(format!("unknown operation kind '{op_name}'"))
        })?;

        let mut param_stmt = conn
            .prepare("SELECT name, kind FROM sysparameter WHERE command_id = ?1 ORDER BY position")
            .map_err(RepositoryError::store)?;
        let param_rows = param_stmt
            .query_map([command_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(RepositoryError::store)?;
        let mut fields = Vec::new();
        for param in param_rows {
            let (name, kind_name) = param.map_err(RepositoryError::store)?;
            let kind = FieldKind::parse(&kind_name).ok_or_else(|| {
                RepositoryError::Parse(format!("unknown field kind '{kind_name}'"))
            })?;
            fields.push(FieldDef::new(name, kind));
        }
        set.set_command(entity_type, op, StoreCommand::new(sql, fields));
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_set_covers_builtins() {
        let set = default_command_set();
        assert!(set.has_command(SCHEMA_KEY, CommandOp::CreateSchema));
        assert!(set.has_command("Core.Project", CommandOp::Insert));
        assert!(set.has_command("Core.Diagram", CommandOp::SelectAll));
        assert!(set.has_command("Shapes.Rect", CommandOp::InsertDiagramShape));
        assert!(set.has_command("Shapes.Ellipse", CommandOp::SelectChildShapes));
        assert!(set.has_command("Shapes.Polyline", CommandOp::UpdateOwnerShape));
        assert!(set.has_command("Core.ModelObject", CommandOp::InsertTemplateModelObject));
        assert!(set.has_command(Shape::VERTICES, CommandOp::SelectByOwnerId));
        assert!(set.has_command(ShapeConnection::TYPE_NAME, CommandOp::Delete));
    }

    #[test]
    fn test_insert_param_order_matches_wire_contract() {
        let set = default_command_set();
        let cmd = set
            .get_command("Core.ModelMapping", CommandOp::Insert)
            .unwrap();
        let names: Vec<&str> = cmd.params.iter().map(|p| p.name.as_str()).collect();
        // id、所有者、声明字段、嵌入式集合各一格
        assert_eq!(
            names,
            [
                "id",
                "owner",
                "kind",
                "shape_property",
                "model_property",
                "intercept",
                "multiplier",
                "value_ranges"
            ]
        );
    }

    #[test]
    fn test_schema_creation() {
        let conn = Connection::open_in_memory().unwrap();
        let set = default_command_set();
        create_schema(&conn, &set).unwrap();
        // 幂等
        create_schema(&conn, &set).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'shape'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_command_set_persistence_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        let set = default_command_set();
        create_schema(&conn, &set).unwrap();
        save_command_set(&conn, &set).unwrap();

        let reloaded = load_command_set(&conn).unwrap();
        assert_eq!(reloaded.len(), set.len());

        let original = set.get_command("Core.Style", CommandOp::Insert).unwrap();
        let restored = reloaded.get_command("Core.Style", CommandOp::Insert).unwrap();
        assert_eq!(original.sql, restored.sql);
        assert_eq!(original.params.len(), restored.params.len());
        assert_eq!(original.params[2].name, restored.params[2].name);
        assert_eq!(original.params[2].kind, restored.params[2].kind);
    }
}
