//! SQLite协议介质
//!
//! 读写协议在关系后端上的具体化：
//! - `SqliteRowReader`：游标走在一行预读的单元格序列上，嵌入式
//!   内嵌集合委托给对应单元格上的字符串读取器；
//! - `ChildRowReader`：游标走在一批按所有者查出的子行上；
//! - `SqliteRecordWriter`：`prepare`绑定目标实体并清空参数累加器，
//!   `write_*`压入类型化参数，`finish`执行绑定的命令并捕获
//!   `last_insert_rowid`供标识回写。

use crate::codec::{StringRecordReader, StringRecordWriter};
use crate::command::{CommandOp, CommandSet, StoreCommand};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Connection;
use std::collections::VecDeque;
use zdiag_core::entity::EntityId;
use zdiag_core::error::{RepositoryError, Result};
use zdiag_core::io::{RecordReader, RecordWriter, RefResolver};
use zdiag_core::schema::{EntityTypeDescriptor, FieldKind, InnerObjectsDef, InnerStorage};

pub(crate) fn value_to_id(value: &Value) -> Result<Option<EntityId>> {
    match value {
        Value::Null => Ok(None),
        Value::Integer(v) => Ok(Some(EntityId(*v))),
        other => Err(RepositoryError::Parse(format!(
            "expected integer identity, got {other:?}"
        ))),
    }
}

fn as_i64(value: Value) -> Result<i64> {
    match value {
        Value::Integer(v) => Ok(v),
        other => Err(RepositoryError::Parse(format!(
            "expected integer, got {other:?}"
        ))),
    }
}

fn as_f64(value: Value) -> Result<f64> {
    match value {
        Value::Real(v) => Ok(v),
        Value::Integer(v) => Ok(v as f64),
        other => Err(RepositoryError::Parse(format!(
            "expected real, got {other:?}"
        ))),
    }
}

fn as_text(value: Value) -> Result<String> {
    match value {
        Value::Text(v) => Ok(v),
        Value::Null => Ok(String::new()),
        other => Err(RepositoryError::Parse(format!(
            "expected text, got {other:?}"
        ))),
    }
}

fn as_blob(value: Value) -> Result<Vec<u8>> {
    match value {
        Value::Blob(v) => Ok(v),
        Value::Null => Ok(Vec::new()),
        other => Err(RepositoryError::Parse(format!(
            "expected blob, got {other:?}"
        ))),
    }
}

fn as_date(value: Value) -> Result<DateTime<Utc>> {
    let text = as_text(value)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(RepositoryError::parse)
}

/// 行读取器
///
/// 单元格序列不含id与所有者id两列（适配器自行消费），
/// 标量游标越过描述符声明的字段数即报`SchemaOverrun`。
pub struct SqliteRowReader<'a> {
    resolver: &'a dyn RefResolver,
    entity_type: String,
    declared: usize,
    inner_defs: Vec<InnerObjectsDef>,
    cells: VecDeque<Value>,
    consumed: usize,
    embedded: Option<StringRecordReader>,
}

impl<'a> SqliteRowReader<'a> {
    pub fn new(
        resolver: &'a dyn RefResolver,
        descriptor: &EntityTypeDescriptor,
        cells: Vec<Value>,
    ) -> Self {
        Self {
            resolver,
            entity_type: descriptor.name.clone(),
            declared: descriptor.fields.len(),
            inner_defs: descriptor.inner_objects.clone(),
            cells: cells.into(),
            consumed: 0,
            embedded: None,
        }
    }

    fn next_cell(&mut self) -> Result<Value> {
        if self.consumed >= self.declared {
            return Err(RepositoryError::SchemaOverrun {
                entity_type: self.entity_type.clone(),
                position: self.consumed,
                declared: self.declared,
            });
        }
        let cell = self.cells.pop_front().ok_or_else(|| {
            RepositoryError::Parse(format!("row for {} is short of cells", self.entity_type))
        })?;
        self.consumed += 1;
        Ok(cell)
    }
}

impl RecordReader for SqliteRowReader<'_> {
    fn resolver(&self) -> &dyn RefResolver {
        self.resolver
    }

    fn read_bool(&mut self) -> Result<bool> {
        match &mut self.embedded {
            Some(inner) => inner.read_bool(),
            None => Ok(as_i64(self.next_cell()?)? != 0),
        }
    }

    fn read_byte(&mut self) -> Result<u8> {
        match &mut self.embedded {
            Some(inner) => inner.read_byte(),
            None => u8::try_from(as_i64(self.next_cell()?)?).map_err(RepositoryError::parse),
        }
    }

    fn read_i16(&mut self) -> Result<i16> {
        match &mut self.embedded {
            Some(inner) => inner.read_i16(),
            None => i16::try_from(as_i64(self.next_cell()?)?).map_err(RepositoryError::parse),
        }
    }

    fn read_i32(&mut self) -> Result<i32> {
        match &mut self.embedded {
            Some(inner) => inner.read_i32(),
            None => i32::try_from(as_i64(self.next_cell()?)?).map_err(RepositoryError::parse),
        }
    }

    fn read_i64(&mut self) -> Result<i64> {
        match &mut self.embedded {
            Some(inner) => inner.read_i64(),
            None => as_i64(self.next_cell()?),
        }
    }

    fn read_f32(&mut self) -> Result<f32> {
        match &mut self.embedded {
            Some(inner) => inner.read_f32(),
            None => Ok(as_f64(self.next_cell()?)? as f32),
        }
    }

    fn read_f64(&mut self) -> Result<f64> {
        match &mut self.embedded {
            Some(inner) => inner.read_f64(),
            None => as_f64(self.next_cell()?),
        }
    }

    fn read_char(&mut self) -> Result<char> {
        match &mut self.embedded {
            Some(inner) => inner.read_char(),
            None => {
                let text = as_text(self.next_cell()?)?;
                text.chars()
                    .next()
                    .ok_or_else(|| RepositoryError::Parse("empty char cell".into()))
            }
        }
    }

    fn read_string(&mut self) -> Result<String> {
        match &mut self.embedded {
            Some(inner) => inner.read_string(),
            None => as_text(self.next_cell()?),
        }
    }

    fn read_date(&mut self) -> Result<DateTime<Utc>> {
        match &mut self.embedded {
            Some(inner) => inner.read_date(),
            None => as_date(self.next_cell()?),
        }
    }

    fn read_image(&mut self) -> Result<Vec<u8>> {
        match &mut self.embedded {
            Some(inner) => inner.read_image(),
            None => as_blob(self.next_cell()?),
        }
    }

    fn read_id(&mut self) -> Result<Option<EntityId>> {
        match &mut self.embedded {
            Some(inner) => inner.read_id(),
            None => {
                let cell = self.next_cell()?;
                value_to_id(&cell)
            }
        }
    }

    fn begin_inner_objects(&mut self, name: &str) -> Result<()> {
        let def = self
            .inner_defs
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| {
                RepositoryError::Integrity(format!("unknown inner collection '{name}'"))
            })?;
        match def.storage {
            InnerStorage::Embedded => {
                // 嵌入单元格紧跟在声明字段之后，不计入标量游标
                let cell = self.cells.pop_front().ok_or_else(|| {
                    RepositoryError::Parse(format!(
                        "row for {} is missing the '{name}' cell",
                        self.entity_type
                    ))
                })?;
                let mut inner = StringRecordReader::parse(&as_text(cell)?, def)?;
                inner.begin_inner_objects(name)?;
                self.embedded = Some(inner);
                Ok(())
            }
            InnerStorage::ChildRows => Err(RepositoryError::UnsupportedMedium(
                "aggregated collections are hydrated from child rows, not the owner row",
            )),
        }
    }

    fn begin_inner_object(&mut self) -> Result<bool> {
        self.embedded
            .as_mut()
            .ok_or_else(|| RepositoryError::Integrity("inner collection scope not open".into()))?
            .begin_inner_object()
    }

    fn end_inner_object(&mut self) -> Result<()> {
        self.embedded
            .as_mut()
            .ok_or_else(|| RepositoryError::Integrity("inner collection scope not open".into()))?
            .end_inner_object()
    }

    fn end_inner_objects(&mut self) -> Result<()> {
        if let Some(mut inner) = self.embedded.take() {
            inner.end_inner_objects()?;
        }
        Ok(())
    }
}

/// 子行读取器
///
/// 行集已按所有者查出并按序号排序，每行只含集合声明的字段列。
pub struct ChildRowReader<'a> {
    resolver: &'a dyn RefResolver,
    def: InnerObjectsDef,
    rows: VecDeque<Vec<Value>>,
    current: Option<VecDeque<Value>>,
    consumed: usize,
}

impl<'a> ChildRowReader<'a> {
    pub fn new(resolver: &'a dyn RefResolver, def: InnerObjectsDef, rows: Vec<Vec<Value>>) -> Self {
        Self {
            resolver,
            def,
            rows: rows.into_iter().collect(),
            current: None,
            consumed: 0,
        }
    }

    fn next_cell(&mut self) -> Result<Value> {
        let declared = self.def.fields.len();
        if self.consumed >= declared {
            return Err(RepositoryError::SchemaOverrun {
                entity_type: self.def.name.clone(),
                position: self.consumed,
                declared,
            });
        }
        let row = self
            .current
            .as_mut()
            .ok_or_else(|| RepositoryError::Integrity("no child row open for reading".into()))?;
        let cell = row.pop_front().ok_or_else(|| {
            RepositoryError::Parse(format!("child row in '{}' is short of cells", self.def.name))
        })?;
        self.consumed += 1;
        Ok(cell)
    }
}

impl RecordReader for ChildRowReader<'_> {
    fn resolver(&self) -> &dyn RefResolver {
        self.resolver
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(as_i64(self.next_cell()?)? != 0)
    }

    fn read_byte(&mut self) -> Result<u8> {
        u8::try_from(as_i64(self.next_cell()?)?).map_err(RepositoryError::parse)
    }

    fn read_i16(&mut self) -> Result<i16> {
        i16::try_from(as_i64(self.next_cell()?)?).map_err(RepositoryError::parse)
    }

    fn read_i32(&mut self) -> Result<i32> {
        i32::try_from(as_i64(self.next_cell()?)?).map_err(RepositoryError::parse)
    }

    fn read_i64(&mut self) -> Result<i64> {
        as_i64(self.next_cell()?)
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(as_f64(self.next_cell()?)? as f32)
    }

    fn read_f64(&mut self) -> Result<f64> {
        as_f64(self.next_cell()?)
    }

    fn read_char(&mut self) -> Result<char> {
        let text = as_text(self.next_cell()?)?;
        text.chars()
            .next()
            .ok_or_else(|| RepositoryError::Parse("empty char cell".into()))
    }

    fn read_string(&mut self) -> Result<String> {
        as_text(self.next_cell()?)
    }

    fn read_date(&mut self) -> Result<DateTime<Utc>> {
        as_date(self.next_cell()?)
    }

    fn read_image(&mut self) -> Result<Vec<u8>> {
        as_blob(self.next_cell()?)
    }

    fn read_id(&mut self) -> Result<Option<EntityId>> {
        let cell = self.next_cell()?;
        value_to_id(&cell)
    }

    fn begin_inner_objects(&mut self, name: &str) -> Result<()> {
        if name != self.def.name {
            return Err(RepositoryError::Integrity(format!(
                "unknown inner collection '{name}'"
            )));
        }
        Ok(())
    }

    fn begin_inner_object(&mut self) -> Result<bool> {
        self.current = self.rows.pop_front().map(Into::into);
        self.consumed = 0;
        Ok(self.current.is_some())
    }

    fn end_inner_object(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }

    fn end_inner_objects(&mut self) -> Result<()> {
        Ok(())
    }
}

struct ChildWriteScope {
    def: InnerObjectsDef,
    owner: EntityId,
    seq: i64,
    row: Vec<Value>,
    row_open: bool,
}

/// 记录写入器
///
/// 主命令的参数顺序：id、所有者id、声明字段、每个嵌入式集合一格。
/// 子行集合不走参数累加器，每条子行在`end_write_inner_object`时
/// 立即执行该集合注册的插入命令。
pub struct SqliteRecordWriter<'a> {
    conn: &'a Connection,
    commands: &'a CommandSet,
    command: &'a StoreCommand,
    entity_type: String,
    declared: usize,
    inner_defs: Vec<InnerObjectsDef>,
    entity_id: Option<EntityId>,
    params: Vec<Value>,
    embedded: Option<StringRecordWriter>,
    child: Option<ChildWriteScope>,
    last_rowid: Option<i64>,
}

impl<'a> SqliteRecordWriter<'a> {
    pub fn new(
        conn: &'a Connection,
        commands: &'a CommandSet,
        command: &'a StoreCommand,
        descriptor: &EntityTypeDescriptor,
    ) -> Self {
        Self {
            conn,
            commands,
            command,
            entity_type: descriptor.name.clone(),
            declared: descriptor.fields.len(),
            inner_defs: descriptor.inner_objects.clone(),
            entity_id: None,
            params: Vec::new(),
            embedded: None,
            child: None,
            last_rowid: None,
        }
    }

    /// 上一次`finish`插入的行标识
    pub fn last_insert_id(&self) -> Option<EntityId> {
        self.last_rowid.map(EntityId)
    }

    fn push_param(&mut self, value: Value) -> Result<()> {
        // 前两格是id与所有者id，不计入字段预算
        if self.params.len() >= 2 {
            let position = self.params.len() - 2;
            if position >= self.declared {
                return Err(RepositoryError::SchemaOverrun {
                    entity_type: self.entity_type.clone(),
                    position,
                    declared: self.declared,
                });
            }
        }
        self.params.push(value);
        Ok(())
    }

    fn push_child(&mut self, value: Value) -> Result<()> {
        let scope = self
            .child
            .as_mut()
            .ok_or_else(|| RepositoryError::Integrity("no child row open for writing".into()))?;
        if !scope.row_open {
            return Err(RepositoryError::Integrity(
                "no child row open for writing".into(),
            ));
        }
        let declared = scope.def.fields.len();
        let position = scope.row.len() - 2;
        if position >= declared {
            return Err(RepositoryError::SchemaOverrun {
                entity_type: scope.def.name.clone(),
                position,
                declared,
            });
        }
        scope.row.push(value);
        Ok(())
    }

    fn write_value(&mut self, value: Value) -> Result<()> {
        if self.child.is_some() {
            self.push_child(value)
        } else {
            self.push_param(value)
        }
    }

    fn owner_id(&self) -> Result<EntityId> {
        self.entity_id.ok_or_else(|| {
            RepositoryError::Integrity("owner identity required for child rows".into())
        })
    }
}

impl RecordWriter for SqliteRecordWriter<'_> {
    fn prepare(&mut self, entity_id: Option<EntityId>) -> Result<()> {
        self.entity_id = entity_id;
        self.params.clear();
        self.embedded = None;
        self.child = None;
        self.last_rowid = None;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let params: Vec<Value> = self.params.drain(..).collect();
        self.conn
            .execute(&self.command.sql, rusqlite::params_from_iter(params))
            .map_err(RepositoryError::store)?;
        self.last_rowid = Some(self.conn.last_insert_rowid());
        Ok(())
    }

    fn write_bool(&mut self, value: bool) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.write_bool(value);
        }
        self.write_value(Value::Integer(i64::from(value)))
    }

    fn write_byte(&mut self, value: u8) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.write_byte(value);
        }
        self.write_value(Value::Integer(i64::from(value)))
    }

    fn write_i16(&mut self, value: i16) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.write_i16(value);
        }
        self.write_value(Value::Integer(i64::from(value)))
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.write_i32(value);
        }
        self.write_value(Value::Integer(i64::from(value)))
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.write_i64(value);
        }
        self.write_value(Value::Integer(value))
    }

    fn write_f32(&mut self, value: f32) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.write_f32(value);
        }
        self.write_value(Value::Real(f64::from(value)))
    }

    fn write_f64(&mut self, value: f64) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.write_f64(value);
        }
        self.write_value(Value::Real(value))
    }

    fn write_char(&mut self, value: char) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.write_char(value);
        }
        self.write_value(Value::Text(value.to_string()))
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.write_string(value);
        }
        self.write_value(Value::Text(value.to_string()))
    }

    fn write_date(&mut self, value: DateTime<Utc>) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.write_date(value);
        }
        self.write_value(Value::Text(value.to_rfc3339()))
    }

    fn write_image(&mut self, value: &[u8]) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.write_image(value);
        }
        if value.is_empty() {
            self.write_value(Value::Null)
        } else {
            self.write_value(Value::Blob(value.to_vec()))
        }
    }

    fn write_id(&mut self, id: Option<EntityId>) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.write_id(id);
        }
        let value = match id {
            None => Value::Null,
            Some(id) => Value::Integer(id.raw()),
        };
        self.write_value(value)
    }

    fn begin_write_inner_objects(&mut self, name: &str) -> Result<()> {
        let def = self
            .inner_defs
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| {
                RepositoryError::Integrity(format!("unknown inner collection '{name}'"))
            })?;
        match def.storage {
            InnerStorage::Embedded => {
                let mut inner = StringRecordWriter::new(def);
                inner.begin_write_inner_objects(name)?;
                self.embedded = Some(inner);
            }
            InnerStorage::ChildRows => {
                let owner = self.owner_id()?;
                self.child = Some(ChildWriteScope {
                    def,
                    owner,
                    seq: 0,
                    row: Vec::new(),
                    row_open: false,
                });
            }
        }
        Ok(())
    }

    fn begin_write_inner_object(&mut self) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.begin_write_inner_object();
        }
        let scope = self
            .child
            .as_mut()
            .ok_or_else(|| RepositoryError::Integrity("inner collection scope not open".into()))?;
        scope.row = vec![Value::Integer(scope.owner.raw()), Value::Integer(scope.seq)];
        scope.row_open = true;
        Ok(())
    }

    fn end_write_inner_object(&mut self) -> Result<()> {
        if let Some(inner) = &mut self.embedded {
            return inner.end_write_inner_object();
        }
        let (name, row) = {
            let scope = self.child.as_mut().ok_or_else(|| {
                RepositoryError::Integrity("inner collection scope not open".into())
            })?;
            if !scope.row_open {
                return Err(RepositoryError::Integrity(
                    "no child row open for writing".into(),
                ));
            }
            scope.row_open = false;
            scope.seq += 1;
            (scope.def.name.clone(), std::mem::take(&mut scope.row))
        };
        let cmd = self.commands.get_command(&name, CommandOp::Insert)?;
        self.conn
            .execute(&cmd.sql, rusqlite::params_from_iter(row))
            .map_err(RepositoryError::store)?;
        Ok(())
    }

    fn end_write_inner_objects(&mut self) -> Result<()> {
        if let Some(mut inner) = self.embedded.take() {
            inner.end_write_inner_objects()?;
            // 嵌入集合折叠为主命令的一个文本参数
            self.params.push(Value::Text(inner.into_encoded()));
            return Ok(());
        }
        self.child = None;
        Ok(())
    }

    fn delete_inner_objects(&mut self, name: &str) -> Result<()> {
        let def = self
            .inner_defs
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| {
                RepositoryError::Integrity(format!("unknown inner collection '{name}'"))
            })?;
        match def.storage {
            // 嵌入单元格整体覆盖
            InnerStorage::Embedded => Ok(()),
            InnerStorage::ChildRows => {
                let owner = self.owner_id()?;
                let cmd = self.commands.get_command(name, CommandOp::Delete)?;
                self.conn
                    .execute(&cmd.sql, [Value::Integer(owner.raw())])
                    .map_err(RepositoryError::store)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zdiag_core::io::NoRefs;
    use zdiag_core::schema::FieldDef;

    fn scratch_table() -> (Connection, CommandSet) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE thing (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner INTEGER,
                name TEXT,
                size INTEGER,
                ranges TEXT
            );
            CREATE TABLE point (owner INTEGER, seq INTEGER, x INTEGER, y INTEGER);",
        )
        .unwrap();
        let mut commands = CommandSet::new();
        commands.set_command(
            "points",
            CommandOp::Insert,
            StoreCommand::new(
                "INSERT INTO point (owner, seq, x, y) VALUES (?1, ?2, ?3, ?4)",
                Vec::new(),
            ),
        );
        commands.set_command(
            "points",
            CommandOp::Delete,
            StoreCommand::new("DELETE FROM point WHERE owner = ?1", Vec::new()),
        );
        (conn, commands)
    }

    fn thing_descriptor() -> EntityTypeDescriptor {
        EntityTypeDescriptor::new(
            "Test.Thing",
            1,
            zdiag_core::schema::EntityCategory::Diagram,
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
        )
    }

    #[test]
    fn test_writer_insert_and_row_reader_roundtrip() {
        let (conn, commands) = scratch_table();
        let descriptor = thing_descriptor();
        let insert = StoreCommand::new(
            "INSERT INTO thing (id, owner, name, size, ranges) VALUES (?1, ?2, ?3, ?4, ?5)",
            Vec::new(),
        );

        let mut writer = SqliteRecordWriter::new(&conn, &commands, &insert, &descriptor);
        writer.prepare(None).unwrap();
        writer.write_id(None).unwrap();
        writer.write_id(Some(EntityId(9))).unwrap();
        writer.write_string("first").unwrap();
        writer.write_i32(42).unwrap();
        writer.begin_write_inner_objects("ranges").unwrap();
        writer.begin_write_inner_object().unwrap();
        writer.write_id(Some(EntityId(3))).unwrap();
        writer.write_f32(1.5).unwrap();
        writer.end_write_inner_object().unwrap();
        writer.end_write_inner_objects().unwrap();
        writer.finish().unwrap();

        let id = writer.last_insert_id().unwrap();

        // 子行集合绑定在刚分配的标识上
        writer.prepare(Some(id)).unwrap();
        writer.delete_inner_objects("points").unwrap();
        writer.begin_write_inner_objects("points").unwrap();
        for (x, y) in [(10, 20), (30, 40)] {
            writer.begin_write_inner_object().unwrap();
            writer.write_i32(x).unwrap();
            writer.write_i32(y).unwrap();
            writer.end_write_inner_object().unwrap();
        }
        writer.end_write_inner_objects().unwrap();

        let row: Vec<Value> = conn
            .query_row(
                "SELECT name, size, ranges FROM thing WHERE id = ?1",
                [id.raw()],
                |row| Ok(vec![row.get(0)?, row.get(1)?, row.get(2)?]),
            )
            .unwrap();

        let refs = NoRefs;
        let mut reader = SqliteRowReader::new(&refs, &descriptor, row);
        assert_eq!(reader.read_string().unwrap(), "first");
        assert_eq!(reader.read_i32().unwrap(), 42);
        reader.begin_inner_objects("ranges").unwrap();
        assert!(reader.begin_inner_object().unwrap());
        assert_eq!(reader.read_id().unwrap(), Some(EntityId(3)));
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        reader.end_inner_object().unwrap();
        assert!(!reader.begin_inner_object().unwrap());
        reader.end_inner_objects().unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM point WHERE owner = ?1", [id.raw()], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_row_reader_schema_overrun() {
        let refs = NoRefs;
        let descriptor = thing_descriptor();
        let mut reader = SqliteRowReader::new(
            &refs,
            &descriptor,
            vec![Value::Text("a".into()), Value::Integer(1)],
        );
        reader.read_string().unwrap();
        reader.read_i32().unwrap();
        assert!(matches!(
            reader.read_i32(),
            Err(RepositoryError::SchemaOverrun { position: 2, .. })
        ));
    }

    #[test]
    fn test_child_scope_rejected_on_row_cursor() {
        let refs = NoRefs;
        let descriptor = thing_descriptor();
        let mut reader = SqliteRowReader::new(
            &refs,
            &descriptor,
            vec![Value::Text("a".into()), Value::Integer(1)],
        );
        assert!(matches!(
            reader.begin_inner_objects("points"),
            Err(RepositoryError::UnsupportedMedium(_))
        ));
    }

    #[test]
    fn test_child_row_reader() {
        let refs = NoRefs;
        let def = InnerObjectsDef::new(
            "points",
            InnerStorage::ChildRows,
            vec![
                FieldDef::new("x", FieldKind::Int32),
                FieldDef::new("y", FieldKind::Int32),
            ],
        );
        let rows = vec![
            vec![Value::Integer(1), Value::Integer(2)],
            vec![Value::Integer(3), Value::Integer(4)],
        ];
        let mut reader = ChildRowReader::new(&refs, def, rows);
        reader.begin_inner_objects("points").unwrap();
        assert!(reader.begin_inner_object().unwrap());
        assert_eq!(reader.read_i32().unwrap(), 1);
        assert_eq!(reader.read_i32().unwrap(), 2);
        reader.end_inner_object().unwrap();
        assert!(reader.begin_inner_object().unwrap());
        assert_eq!(reader.read_i32().unwrap(), 3);
        assert_eq!(reader.read_i32().unwrap(), 4);
        reader.end_inner_object().unwrap();
        assert!(!reader.begin_inner_object().unwrap());
    }
}
