//! SQLite存储适配器
//!
//! 两阶段加载：先把行集整体缓冲（游标关闭后再建实体），再按
//! 描述符顺序让实体自行读取字段并解析引用；子行集合与连接在
//! 所属批次的实体全部入缓存之后补水。
//!
//! 保存在单个事务内按固定顺序提交整个变更集：
//! 1. 工程行的插入或字段更新；
//! 2. 删除（连接 → 形状（子先于父）→ 模型对象（子先于父）→
//!    映射 → 图示 → 模板 → 样式 → 设计 → 模型 → 工程行最后）；
//! 3. 字段更新；
//! 4. 插入（设计 → 样式 → 模板 → 模型 → 模型对象（逐层）→
//!    映射 → 图示 → 形状（逐层））；
//! 5. 新连接与所有者改写。
//! 任何一步失败即整体回滚，内存状态保持原样。

use crate::bootstrap::{create_schema, load_command_set, save_command_set};
use crate::command::{CommandOp, CommandSet, StoreCommand};
use crate::medium::{value_to_id, ChildRowReader, SqliteRecordWriter, SqliteRowReader};
use rusqlite::types::Value;
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info};
use zdiag_core::design::{Design, Style, StyleKind};
use zdiag_core::diagram::Diagram;
use zdiag_core::entity::{handle, EntityBucket, EntityId, Handle, ItemState, Owner, Persistable};
use zdiag_core::error::{RepositoryError, Result};
use zdiag_core::io::{RecordWriter, RefResolver};
use zdiag_core::model::{MappingKind, Model, ModelMapping, ModelObject};
use zdiag_core::project::ProjectSettings;
use zdiag_core::repository::{RepositoryState, Store};
use zdiag_core::schema::EntityTypeDescriptor;
use zdiag_core::shape::{Shape, ShapeConnection};
use zdiag_core::template::Template;

/// 一行缓冲数据：标识、所有者标识、其余单元格
struct RowData {
    id: Option<EntityId>,
    owner: Option<EntityId>,
    cells: Vec<Value>,
}

/// SQLite存储
///
/// 连接按需建立；文件后端在关闭时释放连接，内存后端保留连接
/// 以便同一实例内重新打开会话。
pub struct SqliteStore {
    path: Option<PathBuf>,
    conn: Option<Connection>,
    commands: CommandSet,
}

impl SqliteStore {
    /// 文件后端
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            conn: None,
            commands: crate::bootstrap::default_command_set(),
        }
    }

    /// 内存后端（测试与临时会话用）
    pub fn in_memory() -> Self {
        Self {
            path: None,
            conn: None,
            commands: crate::bootstrap::default_command_set(),
        }
    }

    pub fn commands(&self) -> &CommandSet {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut CommandSet {
        &mut self.commands
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.conn.is_none() {
            let conn = match &self.path {
                Some(path) => Connection::open(path),
                None => Connection::open_in_memory(),
            }
            .map_err(RepositoryError::store)?;
            debug!(path = ?self.path, "backend connection established");
            self.conn = Some(conn);
        }
        Ok(())
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| RepositoryError::Store("backend connection is not open".into()))
    }
}

// ---------------------------------------------------------------------------
// 查询缓冲
// ---------------------------------------------------------------------------

fn query_rows(conn: &Connection, cmd: &StoreCommand, params: &[Value]) -> Result<Vec<RowData>> {
    let mut stmt = conn.prepare(&cmd.sql).map_err(RepositoryError::store)?;
    let columns = stmt.column_count();
    let mut rows = stmt
        .query(rusqlite::params_from_iter(params.iter().cloned()))
        .map_err(RepositoryError::store)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(RepositoryError::store)? {
        let id = value_to_id(&row.get::<_, Value>(0).map_err(RepositoryError::store)?)?;
        let owner = value_to_id(&row.get::<_, Value>(1).map_err(RepositoryError::store)?)?;
        let mut cells = Vec::with_capacity(columns.saturating_sub(2));
        for index in 2..columns {
            cells.push(row.get::<_, Value>(index).map_err(RepositoryError::store)?);
        }
        out.push(RowData { id, owner, cells });
    }
    Ok(out)
}

fn query_child_rows(
    conn: &Connection,
    cmd: &StoreCommand,
    owner: EntityId,
) -> Result<Vec<Vec<Value>>> {
    let mut stmt = conn.prepare(&cmd.sql).map_err(RepositoryError::store)?;
    let columns = stmt.column_count();
    let mut rows = stmt.query([owner.raw()]).map_err(RepositoryError::store)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(RepositoryError::store)? {
        let mut cells = Vec::with_capacity(columns);
        for index in 0..columns {
            cells.push(row.get::<_, Value>(index).map_err(RepositoryError::store)?);
        }
        out.push(cells);
    }
    Ok(out)
}

/// 把缓冲的行集实体化（第二阶段）
///
/// 引用解析走仓储缓存，因此被引用的类别必须先于引用方加载。
fn read_rows<T: Persistable>(
    state: &RepositoryState,
    descriptor: &EntityTypeDescriptor,
    rows: Vec<RowData>,
    make: impl Fn() -> T,
) -> Result<Vec<(EntityId, Option<EntityId>, T)>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.id.ok_or_else(|| {
            RepositoryError::Integrity(format!("{} row without identity", descriptor.name))
        })?;
        let mut entity = make();
        entity.assign_id(id);
        let mut reader = SqliteRowReader::new(state, descriptor, row.cells);
        entity.load_fields(&mut reader, descriptor.version)?;
        for def in descriptor.embedded_inner_objects() {
            entity.load_inner_objects(&def.name, &mut reader, descriptor.version)?;
        }
        out.push((id, row.owner, entity));
    }
    Ok(out)
}

fn shape_descriptor<'a>(
    state: &'a RepositoryState,
    type_name: &str,
) -> Result<&'a EntityTypeDescriptor> {
    state
        .shape_types
        .iter()
        .find(|d| d.name == type_name)
        .ok_or_else(|| RepositoryError::Integrity(format!("unregistered shape type '{type_name}'")))
}

// ---------------------------------------------------------------------------
// 形状补水
// ---------------------------------------------------------------------------

fn admit_shapes(
    state: &mut RepositoryState,
    descriptor: &EntityTypeDescriptor,
    rows: Vec<RowData>,
    owner_of: impl Fn(&RepositoryState, Option<EntityId>) -> Result<Owner>,
) -> Result<Vec<EntityId>> {
    let loaded = read_rows(state, descriptor, rows, || {
        Shape::new(descriptor.name.clone())
    })?;
    let mut admitted = Vec::new();
    for (id, owner_id, shape) in loaded {
        if state.shapes.contains_key(&id) {
            continue;
        }
        let owner = owner_of(state, owner_id)?;
        state
            .shapes
            .insert(id, EntityBucket::new(handle(shape), owner, ItemState::Original));
        admitted.push(id);
    }
    Ok(admitted)
}

/// 逐层加载子形状，返回根与全部后代的标识
fn hydrate_shape_children(
    conn: &Connection,
    commands: &CommandSet,
    state: &mut RepositoryState,
    roots: &[EntityId],
) -> Result<Vec<EntityId>> {
    let types = state.shape_types.clone();
    let mut all: Vec<EntityId> = roots.to_vec();
    let mut queue: Vec<EntityId> = roots.to_vec();
    while let Some(parent) = queue.pop() {
        let parent_handle = state
            .shapes
            .get(&parent)
            .map(|b| b.entity.clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("shape {parent}")))?;
        for descriptor in &types {
            let cmd = commands.get_command(&descriptor.name, CommandOp::SelectChildShapes)?;
            let rows = query_rows(conn, cmd, &[Value::Integer(parent.raw())])?;
            let admitted = admit_shapes(state, descriptor, rows, |_, _| {
                Ok(Owner::Shape(parent_handle.clone()))
            })?;
            queue.extend(admitted.iter().copied());
            all.extend(admitted);
        }
    }
    Ok(all)
}

/// 顶点子行与形状连接的补水（批次内实体全部入缓存后执行）
fn hydrate_shape_details(
    conn: &Connection,
    commands: &CommandSet,
    state: &mut RepositoryState,
    ids: &[EntityId],
) -> Result<()> {
    let vertex_cmd = commands.get_command(Shape::VERTICES, CommandOp::SelectByOwnerId)?;
    for id in ids {
        let bucket = state
            .shapes
            .get(id)
            .ok_or_else(|| RepositoryError::NotFound(format!("shape {id}")))?;
        let type_name = bucket.entity.borrow().type_name.clone();
        let descriptor = shape_descriptor(state, &type_name)?;
        if let Some(def) = descriptor.inner(Shape::VERTICES) {
            let rows = query_child_rows(conn, vertex_cmd, *id)?;
            let mut reader = ChildRowReader::new(state, def.clone(), rows);
            bucket
                .entity
                .borrow_mut()
                .load_inner_objects(Shape::VERTICES, &mut reader, descriptor.version)?;
        }
    }

    let link_cmd = commands.get_command(ShapeConnection::TYPE_NAME, CommandOp::SelectByOwnerId)?;
    for id in ids {
        load_connections(conn, link_cmd, state, *id)?;
    }
    Ok(())
}

fn load_connections(
    conn: &Connection,
    cmd: &StoreCommand,
    state: &mut RepositoryState,
    shape: EntityId,
) -> Result<()> {
    let mut stmt = conn.prepare(&cmd.sql).map_err(RepositoryError::store)?;
    let mut rows = stmt.query([shape.raw()]).map_err(RepositoryError::store)?;
    let mut fresh = Vec::new();
    while let Some(row) = rows.next().map_err(RepositoryError::store)? {
        let connector = EntityId(row.get::<_, i64>(0).map_err(RepositoryError::store)?);
        let connector_point: i32 = row.get(1).map_err(RepositoryError::store)?;
        let target = EntityId(row.get::<_, i64>(2).map_err(RepositoryError::store)?);
        let target_point: i32 = row.get(3).map_err(RepositoryError::store)?;
        let connector_handle = state
            .resolve_shape(connector)
            .ok_or(RepositoryError::DanglingReference(connector))?;
        let target_handle = state
            .resolve_shape(target)
            .ok_or(RepositoryError::DanglingReference(target))?;
        fresh.push(ShapeConnection::new(
            connector_handle,
            connector_point,
            target_handle,
            target_point,
        ));
    }
    for link in fresh {
        if !state.connections.iter().any(|c| c.same_as(&link)) {
            state.connections.push(link);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// 写入原语
// ---------------------------------------------------------------------------

/// 插入一个实体并回写后端分配的标识
fn insert_entity<T: Persistable>(
    conn: &Connection,
    commands: &CommandSet,
    descriptor: &EntityTypeDescriptor,
    op: CommandOp,
    entity: &Handle<T>,
    owner: &Owner,
) -> Result<EntityId> {
    let command = commands.get_command(&descriptor.name, op)?;
    let mut writer = SqliteRecordWriter::new(conn, commands, command, descriptor);
    writer.prepare(None)?;
    writer.write_id(None)?;
    writer.write_id(owner.id())?;
    {
        let current = entity.borrow();
        current.save_fields(&mut writer, descriptor.version)?;
        for def in descriptor.embedded_inner_objects() {
            current.save_inner_objects(&def.name, &mut writer, descriptor.version)?;
        }
    }
    writer.finish()?;
    let id = writer.last_insert_id().ok_or_else(|| {
        RepositoryError::Integrity(format!(
            "backend assigned no identity for new {}",
            descriptor.name
        ))
    })?;
    entity.borrow_mut().assign_id(id);

    // 子行集合绑定在刚分配的标识上
    if descriptor.child_row_inner_objects().next().is_some() {
        writer.prepare(Some(id))?;
        let current = entity.borrow();
        for def in descriptor.child_row_inner_objects() {
            current.save_inner_objects(&def.name, &mut writer, descriptor.version)?;
        }
    }
    Ok(id)
}

/// 字段更新；子行集合整体重写
fn update_entity<T: Persistable>(
    conn: &Connection,
    commands: &CommandSet,
    descriptor: &EntityTypeDescriptor,
    entity: &Handle<T>,
    owner: &Owner,
) -> Result<()> {
    let id = entity.borrow().id().ok_or_else(|| {
        RepositoryError::Integrity(format!("cannot update a {} without identity", descriptor.name))
    })?;
    let command = commands.get_command(&descriptor.name, CommandOp::Update)?;
    let mut writer = SqliteRecordWriter::new(conn, commands, command, descriptor);
    writer.prepare(Some(id))?;
    writer.write_id(Some(id))?;
    writer.write_id(owner.id())?;
    let current = entity.borrow();
    current.save_fields(&mut writer, descriptor.version)?;
    for def in descriptor.embedded_inner_objects() {
        current.save_inner_objects(&def.name, &mut writer, descriptor.version)?;
    }
    writer.finish()?;
    for def in descriptor.child_row_inner_objects() {
        current.save_inner_objects(&def.name, &mut writer, descriptor.version)?;
    }
    Ok(())
}

fn delete_entity<T: Persistable>(
    conn: &Connection,
    commands: &CommandSet,
    descriptor: &EntityTypeDescriptor,
    entity: &Handle<T>,
) -> Result<()> {
    let id = entity.borrow().id().ok_or_else(|| {
        RepositoryError::Integrity(format!("cannot delete a {} without identity", descriptor.name))
    })?;
    let command = commands.get_command(&descriptor.name, CommandOp::Delete)?;
    let mut writer = SqliteRecordWriter::new(conn, commands, command, descriptor);
    writer.prepare(Some(id))?;
    // 先清子行，再删实体行
    entity.borrow().on_delete(&mut writer, descriptor.version)?;
    writer.write_id(Some(id))?;
    writer.finish()?;
    Ok(())
}

fn exec_connection(
    conn: &Connection,
    commands: &CommandSet,
    op: CommandOp,
    link: &ShapeConnection,
) -> Result<()> {
    let connector = link
        .connector
        .borrow()
        .id()
        .ok_or(RepositoryError::UnregisteredReference("shape"))?;
    let target = link
        .target
        .borrow()
        .id()
        .ok_or(RepositoryError::UnregisteredReference("shape"))?;
    let cmd = commands.get_command(ShapeConnection::TYPE_NAME, op)?;
    conn.execute(
        &cmd.sql,
        rusqlite::params![connector.raw(), link.connector_point, target.raw(), link.target_point],
    )
    .map_err(RepositoryError::store)?;
    Ok(())
}

fn exec_owner_update(
    conn: &Connection,
    commands: &CommandSet,
    entity_type: &str,
    op: CommandOp,
    id: EntityId,
    owner: EntityId,
) -> Result<()> {
    let cmd = commands.get_command(entity_type, op)?;
    conn.execute(&cmd.sql, rusqlite::params![id.raw(), owner.raw()])
        .map_err(RepositoryError::store)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// 变更集提交
// ---------------------------------------------------------------------------

fn delete_marked<T: Persistable>(
    conn: &Connection,
    commands: &CommandSet,
    descriptor: &EntityTypeDescriptor,
    map: &std::collections::HashMap<EntityId, EntityBucket<T>>,
) -> Result<()> {
    for bucket in map.values().filter(|b| b.state == ItemState::Deleted) {
        delete_entity(conn, commands, descriptor, &bucket.entity)?;
    }
    Ok(())
}

fn update_marked<T: Persistable>(
    conn: &Connection,
    commands: &CommandSet,
    descriptor: &EntityTypeDescriptor,
    map: &std::collections::HashMap<EntityId, EntityBucket<T>>,
) -> Result<()> {
    for bucket in map.values().filter(|b| b.state == ItemState::Modified) {
        update_entity(conn, commands, descriptor, &bucket.entity, &bucket.owner)?;
    }
    Ok(())
}

fn insert_simple<T: Persistable>(
    conn: &Connection,
    commands: &CommandSet,
    descriptor: &EntityTypeDescriptor,
    news: &[(Handle<T>, Owner)],
    label: &str,
) -> Result<()> {
    for (entity, owner) in news {
        if !owner.is_none() && owner.id().is_none() {
            return Err(RepositoryError::Integrity(format!(
                "owner of new {label} has no identity"
            )));
        }
        insert_entity(conn, commands, descriptor, CommandOp::Insert, entity, owner)?;
    }
    Ok(())
}

/// 待删除形状：子先于父，逐轮收敛
fn delete_shapes(conn: &Connection, commands: &CommandSet, state: &RepositoryState) -> Result<()> {
    let mut pending: Vec<EntityId> = state
        .shapes
        .iter()
        .filter(|(_, b)| b.state == ItemState::Deleted)
        .map(|(id, _)| *id)
        .collect();
    while !pending.is_empty() {
        let blocked: HashSet<EntityId> = pending
            .iter()
            .filter_map(|id| match &state.shapes.get(id)?.owner {
                Owner::Shape(h) => h.borrow().id(),
                _ => None,
            })
            .collect();
        let (ready, rest): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|id| !blocked.contains(id));
        if ready.is_empty() {
            return Err(RepositoryError::Integrity(
                "circular ownership in pending shape deletions".into(),
            ));
        }
        for id in ready {
            let bucket = state
                .shapes
                .get(&id)
                .ok_or_else(|| RepositoryError::NotFound(format!("shape {id}")))?;
            let type_name = bucket.entity.borrow().type_name.clone();
            let descriptor = shape_descriptor(state, &type_name)?;
            delete_entity(conn, commands, descriptor, &bucket.entity)?;
        }
        pending = rest;
    }
    Ok(())
}

fn delete_model_objects(
    conn: &Connection,
    commands: &CommandSet,
    state: &RepositoryState,
) -> Result<()> {
    let descriptor = ModelObject::descriptor();
    let mut pending: Vec<EntityId> = state
        .model_objects
        .iter()
        .filter(|(_, b)| b.state == ItemState::Deleted)
        .map(|(id, _)| *id)
        .collect();
    while !pending.is_empty() {
        let blocked: HashSet<EntityId> = pending
            .iter()
            .filter_map(|id| match &state.model_objects.get(id)?.owner {
                Owner::ModelObject(h) => h.borrow().id(),
                _ => None,
            })
            .collect();
        let (ready, rest): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|id| !blocked.contains(id));
        if ready.is_empty() {
            return Err(RepositoryError::Integrity(
                "circular ownership in pending model object deletions".into(),
            ));
        }
        for id in ready {
            let bucket = state
                .model_objects
                .get(&id)
                .ok_or_else(|| RepositoryError::NotFound(format!("model object {id}")))?;
            delete_entity(conn, commands, &descriptor, &bucket.entity)?;
        }
        pending = rest;
    }
    Ok(())
}

fn shape_insert_op(owner: &Owner) -> Result<CommandOp> {
    match owner {
        Owner::Diagram(_) => Ok(CommandOp::InsertDiagramShape),
        Owner::Template(_) => Ok(CommandOp::InsertTemplateShape),
        Owner::Shape(_) => Ok(CommandOp::InsertChildShape),
        _ => Err(RepositoryError::Integrity(
            "shape owner must be a diagram, template or shape".into(),
        )),
    }
}

fn model_object_insert_op(owner: &Owner) -> Result<CommandOp> {
    match owner {
        Owner::Model(_) => Ok(CommandOp::InsertModelModelObject),
        Owner::Template(_) => Ok(CommandOp::InsertTemplateModelObject),
        Owner::ModelObject(_) => Ok(CommandOp::InsertChildModelObject),
        _ => Err(RepositoryError::Integrity(
            "model object owner must be a model, template or model object".into(),
        )),
    }
}

/// 新形状逐层插入：所有者获得标识后其从属形状才就绪
fn insert_shapes(conn: &Connection, commands: &CommandSet, state: &RepositoryState) -> Result<()> {
    let mut pending: Vec<&(Handle<Shape>, Owner)> = state.new_shapes.iter().collect();
    while !pending.is_empty() {
        let before = pending.len();
        let mut rest = Vec::new();
        for entry in pending {
            let (shape, owner) = entry;
            if owner.id().is_none() {
                rest.push(entry);
                continue;
            }
            let op = shape_insert_op(owner)?;
            let type_name = shape.borrow().type_name.clone();
            let descriptor = shape_descriptor(state, &type_name)?;
            insert_entity(conn, commands, descriptor, op, shape, owner)?;
        }
        if rest.len() == before {
            return Err(RepositoryError::Integrity(
                "pending shape inserts reference owners without identity".into(),
            ));
        }
        pending = rest;
    }
    Ok(())
}

fn insert_model_objects(
    conn: &Connection,
    commands: &CommandSet,
    state: &RepositoryState,
) -> Result<()> {
    let descriptor = ModelObject::descriptor();
    let mut pending: Vec<&(Handle<ModelObject>, Owner)> = state.new_model_objects.iter().collect();
    while !pending.is_empty() {
        let before = pending.len();
        let mut rest = Vec::new();
        for entry in pending {
            let (object, owner) = entry;
            if owner.id().is_none() {
                rest.push(entry);
                continue;
            }
            let op = model_object_insert_op(owner)?;
            insert_entity(conn, commands, &descriptor, op, object, owner)?;
        }
        if rest.len() == before {
            return Err(RepositoryError::Integrity(
                "pending model object inserts reference owners without identity".into(),
            ));
        }
        pending = rest;
    }
    Ok(())
}

/// 已有形状的所有者改写
///
/// `Modified`也同步所有者列：改所有者之后再改字段会把桶折叠为
/// `Modified`，普通更新命令不碰所有者列。
fn sync_shape_owner(
    conn: &Connection,
    commands: &CommandSet,
    bucket: &EntityBucket<Shape>,
) -> Result<()> {
    let op = match &bucket.owner {
        Owner::Diagram(_) => CommandOp::UpdateOwnerDiagram,
        Owner::Shape(_) => CommandOp::UpdateOwnerShape,
        _ => {
            return if bucket.state == ItemState::OwnerChanged {
                Err(RepositoryError::Integrity(
                    "shape can only be relocated under a diagram or shape".into(),
                ))
            } else {
                Ok(())
            };
        }
    };
    let id = bucket
        .entity
        .borrow()
        .id()
        .ok_or_else(|| RepositoryError::Integrity("cannot relocate a shape without identity".into()))?;
    let owner = bucket
        .owner
        .id()
        .ok_or(RepositoryError::UnregisteredReference("shape owner"))?;
    let type_name = bucket.entity.borrow().type_name.clone();
    exec_owner_update(conn, commands, &type_name, op, id, owner)
}

fn sync_model_object_owner(
    conn: &Connection,
    commands: &CommandSet,
    bucket: &EntityBucket<ModelObject>,
) -> Result<()> {
    let op = match &bucket.owner {
        Owner::Model(_) => CommandOp::UpdateOwnerModel,
        Owner::ModelObject(_) => CommandOp::UpdateOwnerModelObject,
        _ => {
            return if bucket.state == ItemState::OwnerChanged {
                Err(RepositoryError::Integrity(
                    "model object can only be relocated under a model or model object".into(),
                ))
            } else {
                Ok(())
            };
        }
    };
    let id = bucket.entity.borrow().id().ok_or_else(|| {
        RepositoryError::Integrity("cannot relocate a model object without identity".into())
    })?;
    let owner = bucket
        .owner
        .id()
        .ok_or(RepositoryError::UnregisteredReference("model object owner"))?;
    exec_owner_update(conn, commands, ModelObject::TYPE_NAME, op, id, owner)
}

fn save_all(conn: &Connection, commands: &CommandSet, state: &RepositoryState) -> Result<()> {
    // 1. 工程行
    if let Some(bucket) = &state.project {
        let descriptor = ProjectSettings::descriptor();
        match bucket.state {
            ItemState::New => {
                insert_entity(
                    conn,
                    commands,
                    &descriptor,
                    CommandOp::Insert,
                    &bucket.entity,
                    &bucket.owner,
                )?;
            }
            ItemState::Modified => {
                update_entity(conn, commands, &descriptor, &bucket.entity, &bucket.owner)?
            }
            _ => {}
        }
    }

    // 2. 删除
    for gone in &state.deleted_connections {
        exec_connection(conn, commands, CommandOp::Delete, gone)?;
    }
    delete_shapes(conn, commands, state)?;
    delete_model_objects(conn, commands, state)?;
    delete_marked(conn, commands, &ModelMapping::descriptor(), &state.model_mappings)?;
    delete_marked(conn, commands, &Diagram::descriptor(), &state.diagrams)?;
    delete_marked(conn, commands, &Template::descriptor(), &state.templates)?;
    delete_marked(conn, commands, &Style::descriptor(), &state.styles)?;
    delete_marked(conn, commands, &Design::descriptor(), &state.designs)?;
    delete_marked(conn, commands, &Model::descriptor(), &state.models)?;
    // 工程行最后删：所有从属实体此时已清空
    if let Some(bucket) = &state.project {
        if bucket.state == ItemState::Deleted {
            delete_entity(conn, commands, &ProjectSettings::descriptor(), &bucket.entity)?;
        }
    }

    // 3. 字段更新
    update_marked(conn, commands, &Design::descriptor(), &state.designs)?;
    update_marked(conn, commands, &Style::descriptor(), &state.styles)?;
    update_marked(conn, commands, &Template::descriptor(), &state.templates)?;
    update_marked(conn, commands, &ModelMapping::descriptor(), &state.model_mappings)?;
    update_marked(conn, commands, &Model::descriptor(), &state.models)?;
    update_marked(conn, commands, &ModelObject::descriptor(), &state.model_objects)?;
    update_marked(conn, commands, &Diagram::descriptor(), &state.diagrams)?;
    for bucket in state
        .shapes
        .values()
        .filter(|b| b.state == ItemState::Modified)
    {
        let type_name = bucket.entity.borrow().type_name.clone();
        let descriptor = shape_descriptor(state, &type_name)?;
        update_entity(conn, commands, descriptor, &bucket.entity, &bucket.owner)?;
    }

    // 4. 插入，所有者先于从属实体
    insert_simple(conn, commands, &Design::descriptor(), &state.new_designs, "design")?;
    insert_simple(conn, commands, &Style::descriptor(), &state.new_styles, "style")?;
    insert_simple(conn, commands, &Template::descriptor(), &state.new_templates, "template")?;
    insert_simple(conn, commands, &Model::descriptor(), &state.new_models, "model")?;
    insert_model_objects(conn, commands, state)?;
    insert_simple(
        conn,
        commands,
        &ModelMapping::descriptor(),
        &state.new_model_mappings,
        "model mapping",
    )?;
    insert_simple(conn, commands, &Diagram::descriptor(), &state.new_diagrams, "diagram")?;
    insert_shapes(conn, commands, state)?;

    // 5. 新连接与所有者改写
    for fresh in &state.new_connections {
        exec_connection(conn, commands, CommandOp::Insert, fresh)?;
    }
    for bucket in state.shapes.values() {
        if matches!(bucket.state, ItemState::Modified | ItemState::OwnerChanged) {
            sync_shape_owner(conn, commands, bucket)?;
        }
    }
    for bucket in state.model_objects.values() {
        if matches!(bucket.state, ItemState::Modified | ItemState::OwnerChanged) {
            sync_model_object_owner(conn, commands, bucket)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Store实现
// ---------------------------------------------------------------------------

impl Store for SqliteStore {
    fn create_backend(&mut self) -> Result<()> {
        self.ensure_open()?;
        let conn = self.conn()?;
        create_schema(conn, &self.commands)?;
        // 命令字典随库落盘，部署出去的文件自带命令集
        save_command_set(conn, &self.commands)?;
        info!(path = ?self.path, "backend schema created");
        Ok(())
    }

    fn open_backend(&mut self, state: &mut RepositoryState) -> Result<()> {
        self.ensure_open()?;
        let persisted = load_command_set(self.conn()?)?;
        if !persisted.is_empty() {
            self.commands = persisted;
        }

        let conn = self.conn()?;
        let descriptor = ProjectSettings::descriptor();
        let cmd = self
            .commands
            .get_command(ProjectSettings::TYPE_NAME, CommandOp::SelectAll)?;
        let rows = query_rows(conn, cmd, &[])?;
        if rows.len() != 1 {
            return Err(RepositoryError::Integrity(format!(
                "expected exactly one project, found {}",
                rows.len()
            )));
        }
        let mut loaded = read_rows(state, &descriptor, rows, || ProjectSettings::new(""))?;
        let (_, _, project) = loaded
            .pop()
            .ok_or_else(|| RepositoryError::Integrity("project row vanished".into()))?;
        state.project = Some(EntityBucket::new(
            handle(project),
            Owner::None,
            ItemState::Original,
        ));

        let project_handle = state
            .project_handle()
            .ok_or_else(|| RepositoryError::NotFound("project".into()))?;
        let descriptor = Design::descriptor();
        let cmd = self
            .commands
            .get_command(Design::TYPE_NAME, CommandOp::SelectAll)?;
        let rows = query_rows(conn, cmd, &[])?;
        if rows.len() != 1 {
            return Err(RepositoryError::Integrity(format!(
                "expected exactly one design, found {}",
                rows.len()
            )));
        }
        for (id, _, design) in read_rows(state, &descriptor, rows, || Design::new(""))? {
            state.designs.insert(
                id,
                EntityBucket::new(
                    handle(design),
                    Owner::Project(project_handle.clone()),
                    ItemState::Original,
                ),
            );
        }
        info!(designs = state.designs.len(), "backend opened");
        Ok(())
    }

    fn close_backend(&mut self) {
        // 内存后端保留连接，否则数据随连接销毁
        if self.path.is_some() {
            self.conn = None;
        }
        debug!("backend closed");
    }

    fn load_styles(&mut self, state: &mut RepositoryState) -> Result<()> {
        self.ensure_open()?;
        let conn = self.conn()?;
        let descriptor = Style::descriptor();
        let cmd = self
            .commands
            .get_command(Style::TYPE_NAME, CommandOp::SelectAll)?;
        let rows = query_rows(conn, cmd, &[])?;
        let loaded = read_rows(state, &descriptor, rows, || Style::new("", StyleKind::Color))?;
        for (id, owner_id, style) in loaded {
            if state.styles.contains_key(&id) {
                continue;
            }
            let owner_id = owner_id
                .ok_or_else(|| RepositoryError::Integrity(format!("style {id} has no owner")))?;
            let design = state
                .designs
                .get(&owner_id)
                .map(|b| b.entity.clone())
                .ok_or(RepositoryError::DanglingReference(owner_id))?;
            state.styles.insert(
                id,
                EntityBucket::new(handle(style), Owner::Design(design), ItemState::Original),
            );
        }
        debug!(count = state.styles.len(), "styles loaded");
        Ok(())
    }

    fn load_templates(&mut self, state: &mut RepositoryState) -> Result<()> {
        self.ensure_open()?;
        let conn = self.conn()?;
        let project = state
            .project_handle()
            .ok_or_else(|| RepositoryError::NotFound("project".into()))?;
        let descriptor = Template::descriptor();
        let cmd = self
            .commands
            .get_command(Template::TYPE_NAME, CommandOp::SelectAll)?;
        let rows = query_rows(conn, cmd, &[])?;
        for (id, _, template) in read_rows(state, &descriptor, rows, || Template::new(""))? {
            state.templates.entry(id).or_insert_with(|| {
                EntityBucket::new(
                    handle(template),
                    Owner::Project(project.clone()),
                    ItemState::Original,
                )
            });
        }
        debug!(count = state.templates.len(), "templates loaded");
        Ok(())
    }

    fn load_models(&mut self, state: &mut RepositoryState) -> Result<()> {
        self.ensure_open()?;
        let conn = self.conn()?;
        let project = state
            .project_handle()
            .ok_or_else(|| RepositoryError::NotFound("project".into()))?;
        let descriptor = Model::descriptor();
        let cmd = self
            .commands
            .get_command(Model::TYPE_NAME, CommandOp::SelectAll)?;
        let rows = query_rows(conn, cmd, &[])?;
        for (id, _, model) in read_rows(state, &descriptor, rows, || Model::new(""))? {
            state.models.entry(id).or_insert_with(|| {
                EntityBucket::new(
                    handle(model),
                    Owner::Project(project.clone()),
                    ItemState::Original,
                )
            });
        }
        debug!(count = state.models.len(), "models loaded");
        Ok(())
    }

    fn load_model_objects(&mut self, state: &mut RepositoryState) -> Result<()> {
        self.ensure_open()?;
        let conn = self.conn()?;
        let descriptor = ModelObject::descriptor();
        let mut queue: Vec<EntityId> = Vec::new();

        // 模型根对象
        let cmd = self
            .commands
            .get_command(ModelObject::TYPE_NAME, CommandOp::SelectModelModelObjects)?;
        let rows = query_rows(conn, cmd, &[])?;
        for (id, owner_id, object) in
            read_rows(state, &descriptor, rows, || ModelObject::new(""))?
        {
            if state.model_objects.contains_key(&id) {
                continue;
            }
            let owner_id = owner_id.ok_or_else(|| {
                RepositoryError::Integrity(format!("model object {id} has no owner"))
            })?;
            let model = state
                .models
                .get(&owner_id)
                .map(|b| b.entity.clone())
                .ok_or(RepositoryError::DanglingReference(owner_id))?;
            state.model_objects.insert(
                id,
                EntityBucket::new(handle(object), Owner::Model(model), ItemState::Original),
            );
            queue.push(id);
        }

        // 模板原型对象
        let cmd = self
            .commands
            .get_command(ModelObject::TYPE_NAME, CommandOp::SelectTemplateModelObjects)?;
        let rows = query_rows(conn, cmd, &[])?;
        for (id, owner_id, object) in
            read_rows(state, &descriptor, rows, || ModelObject::new(""))?
        {
            if state.model_objects.contains_key(&id) {
                continue;
            }
            let owner_id = owner_id.ok_or_else(|| {
                RepositoryError::Integrity(format!("model object {id} has no owner"))
            })?;
            let template = state
                .templates
                .get(&owner_id)
                .map(|b| b.entity.clone())
                .ok_or(RepositoryError::DanglingReference(owner_id))?;
            state.model_objects.insert(
                id,
                EntityBucket::new(handle(object), Owner::Template(template), ItemState::Original),
            );
            queue.push(id);
        }

        // 逐层下钻子对象
        let cmd = self
            .commands
            .get_command(ModelObject::TYPE_NAME, CommandOp::SelectChildModelObjects)?;
        while let Some(parent) = queue.pop() {
            let parent_handle = state
                .model_objects
                .get(&parent)
                .map(|b| b.entity.clone())
                .ok_or_else(|| RepositoryError::NotFound(format!("model object {parent}")))?;
            let rows = query_rows(conn, cmd, &[Value::Integer(parent.raw())])?;
            for (id, _, object) in
                read_rows(state, &descriptor, rows, || ModelObject::new(""))?
            {
                if state.model_objects.contains_key(&id) {
                    continue;
                }
                state.model_objects.insert(
                    id,
                    EntityBucket::new(
                        handle(object),
                        Owner::ModelObject(parent_handle.clone()),
                        ItemState::Original,
                    ),
                );
                queue.push(id);
            }
        }
        debug!(count = state.model_objects.len(), "model objects loaded");
        Ok(())
    }

    fn load_model_mappings(&mut self, state: &mut RepositoryState) -> Result<()> {
        self.ensure_open()?;
        let conn = self.conn()?;
        let descriptor = ModelMapping::descriptor();
        let cmd = self
            .commands
            .get_command(ModelMapping::TYPE_NAME, CommandOp::SelectAll)?;
        let rows = query_rows(conn, cmd, &[])?;
        let loaded = read_rows(state, &descriptor, rows, || {
            ModelMapping::new(MappingKind::Numeric, 0, 0)
        })?;
        for (id, owner_id, mapping) in loaded {
            if state.model_mappings.contains_key(&id) {
                continue;
            }
            let owner_id = owner_id.ok_or_else(|| {
                RepositoryError::Integrity(format!("model mapping {id} has no owner"))
            })?;
            let template = state
                .templates
                .get(&owner_id)
                .map(|b| b.entity.clone())
                .ok_or(RepositoryError::DanglingReference(owner_id))?;
            state.model_mappings.insert(
                id,
                EntityBucket::new(handle(mapping), Owner::Template(template), ItemState::Original),
            );
        }
        debug!(count = state.model_mappings.len(), "model mappings loaded");
        Ok(())
    }

    fn load_diagrams(&mut self, state: &mut RepositoryState) -> Result<()> {
        self.ensure_open()?;
        let conn = self.conn()?;
        let project = state
            .project_handle()
            .ok_or_else(|| RepositoryError::NotFound("project".into()))?;
        let descriptor = Diagram::descriptor();
        let cmd = self
            .commands
            .get_command(Diagram::TYPE_NAME, CommandOp::SelectAll)?;
        let rows = query_rows(conn, cmd, &[])?;
        for (id, _, diagram) in read_rows(state, &descriptor, rows, || Diagram::new(""))? {
            state.diagrams.entry(id).or_insert_with(|| {
                EntityBucket::new(
                    handle(diagram),
                    Owner::Project(project.clone()),
                    ItemState::Original,
                )
            });
        }
        debug!(count = state.diagrams.len(), "diagrams loaded");
        Ok(())
    }

    fn load_template_shapes(&mut self, state: &mut RepositoryState) -> Result<()> {
        self.ensure_open()?;
        let conn = self.conn()?;
        let types = state.shape_types.clone();
        let mut roots = Vec::new();
        for descriptor in &types {
            let cmd = self
                .commands
                .get_command(&descriptor.name, CommandOp::SelectTemplateShape)?;
            let rows = query_rows(conn, cmd, &[])?;
            let admitted = admit_shapes(state, descriptor, rows, |state, owner_id| {
                let id = owner_id.ok_or_else(|| {
                    RepositoryError::Integrity("template shape row has no owner".into())
                })?;
                let template = state
                    .templates
                    .get(&id)
                    .map(|b| b.entity.clone())
                    .ok_or(RepositoryError::DanglingReference(id))?;
                Ok(Owner::Template(template))
            })?;
            roots.extend(admitted);
        }
        let all = hydrate_shape_children(conn, &self.commands, state, &roots)?;
        hydrate_shape_details(conn, &self.commands, state, &all)?;
        debug!(count = all.len(), "template shapes loaded");
        Ok(())
    }

    fn load_diagram_shapes(
        &mut self,
        state: &mut RepositoryState,
        diagram: EntityId,
    ) -> Result<()> {
        self.ensure_open()?;
        let conn = self.conn()?;
        let diagram_handle = state
            .diagrams
            .get(&diagram)
            .map(|b| b.entity.clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("diagram {diagram}")))?;
        let types = state.shape_types.clone();
        let mut roots = Vec::new();
        for descriptor in &types {
            let cmd = self
                .commands
                .get_command(&descriptor.name, CommandOp::SelectDiagramShapes)?;
            let rows = query_rows(conn, cmd, &[Value::Integer(diagram.raw())])?;
            let admitted = admit_shapes(state, descriptor, rows, |_, _| {
                Ok(Owner::Diagram(diagram_handle.clone()))
            })?;
            roots.extend(admitted);
        }
        let all = hydrate_shape_children(conn, &self.commands, state, &roots)?;
        hydrate_shape_details(conn, &self.commands, state, &all)?;
        debug!(diagram = %diagram, count = all.len(), "diagram shapes loaded");
        Ok(())
    }

    fn save_changes(&mut self, state: &mut RepositoryState) -> Result<()> {
        self.ensure_open()?;
        let conn = self.conn()?;
        conn.execute_batch("BEGIN TRANSACTION")
            .map_err(RepositoryError::store)?;
        match save_all(conn, &self.commands, state) {
            Ok(()) => {
                conn.execute_batch("COMMIT").map_err(RepositoryError::store)?;
                info!(
                    new_shapes = state.new_shapes.len(),
                    new_connections = state.new_connections.len(),
                    "change set committed"
                );
                Ok(())
            }
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use zdiag_core::design::StyleKind;
    use zdiag_core::model::{MappingKind, ValueRange};
    use zdiag_core::repository::Repository;
    use zdiag_core::shape::{builtin_shape_types, Vertex};

    fn temp_db(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("zdiag_{}_{}.db", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn new_repo(store: SqliteStore) -> Repository {
        let mut repo = Repository::new(Box::new(store));
        for descriptor in builtin_shape_types() {
            repo.register_shape_type(descriptor);
        }
        repo
    }

    #[test]
    fn test_full_roundtrip_through_file_backend() {
        let path = temp_db("roundtrip");

        let diagram_id;
        let line_id;
        let rect_id;
        let mapping_id;
        {
            let mut repo = new_repo(SqliteStore::open(&path));
            repo.create("Plant").unwrap();

            let design = repo.get_design_by_name("Default").unwrap();
            let style = handle(Style::new("Alarm", StyleKind::Fill));
            style.borrow_mut().color_argb = 0x00FF0000;
            style.borrow_mut().dashed = true;
            repo.insert_style(style.clone(), design.clone()).unwrap();

            let template = handle(Template::new("Pump"));
            repo.insert_template(template.clone()).unwrap();
            let prototype = handle(Shape::new("Shapes.Rect"));
            prototype.borrow_mut().text = "prototype".into();
            repo.replace_template_shape(&template, prototype).unwrap();

            let model = handle(Model::new("Plant model"));
            repo.insert_model(model.clone()).unwrap();
            let unit = handle(ModelObject::new("Unit"));
            repo.insert_model_object(unit.clone(), Owner::Model(model.clone()))
                .unwrap();
            let valve = handle(ModelObject::new("Valve"));
            valve.borrow_mut().int_value = 7;
            valve.borrow_mut().float_value = 2.5;
            repo.insert_model_object(valve.clone(), Owner::ModelObject(unit.clone()))
                .unwrap();

            let mapping = handle(ModelMapping::new(MappingKind::Style, 1, 2));
            mapping.borrow_mut().value_ranges.push(ValueRange {
                lower: 0.5,
                style: None,
            });
            repo.insert_model_mapping(mapping.clone(), template.clone())
                .unwrap();

            let diagram = handle(Diagram::new("Overview"));
            diagram
                .borrow_mut()
                .custom_properties
                .insert("grid".into(), "10".into());
            repo.insert_diagram(diagram.clone()).unwrap();

            let rect = handle(Shape::new("Shapes.Rect"));
            rect.borrow_mut().text = "tank".into();
            rect.borrow_mut().style = Some(style.clone());
            repo.insert_shape(rect.clone(), Owner::Diagram(diagram.clone()))
                .unwrap();
            let line = handle(Shape::new("Shapes.Polyline"));
            line.borrow_mut().vertices.push(Vertex::new(0, 0));
            line.borrow_mut().vertices.push(Vertex::new(10, 5));
            repo.insert_shape(line.clone(), Owner::Diagram(diagram.clone()))
                .unwrap();
            let label = handle(Shape::new("Shapes.Ellipse"));
            repo.insert_shape(label.clone(), Owner::Shape(rect.clone()))
                .unwrap();
            repo.insert_shape_connection(ShapeConnection::new(line.clone(), 1, rect.clone(), 2))
                .unwrap();

            repo.save_changes().unwrap();
            diagram_id = diagram.borrow().id().unwrap();
            line_id = line.borrow().id().unwrap();
            rect_id = rect.borrow().id().unwrap();
            mapping_id = mapping.borrow().id().unwrap();
        }

        let mut repo = new_repo(SqliteStore::open(&path));
        repo.open().unwrap();
        assert_eq!(repo.project().unwrap().borrow().name, "Plant");

        let style = repo.get_style_by_name("Alarm").unwrap();
        assert_eq!(style.borrow().color_argb, 0x00FF0000);
        assert!(style.borrow().dashed);

        let diagram = repo.get_diagram_by_name("Overview").unwrap();
        assert_eq!(diagram.borrow().id(), Some(diagram_id));
        assert_eq!(
            diagram.borrow().custom_properties.get("grid"),
            Some(&"10".to_string())
        );

        let line = repo.get_shape(line_id).unwrap();
        assert_eq!(
            line.borrow().vertices,
            vec![Vertex::new(0, 0), Vertex::new(10, 5)]
        );
        let rect = repo.get_shape(rect_id).unwrap();
        assert_eq!(rect.borrow().text, "tank");
        assert!(rect.borrow().style.is_some());
        assert_eq!(repo.child_shapes(&rect).len(), 1);
        assert_eq!(repo.state().connections.len(), 1);

        let mapping = repo.get_model_mapping(mapping_id).unwrap();
        assert_eq!(mapping.borrow().value_ranges.len(), 1);
        assert_eq!(mapping.borrow().value_ranges[0].lower, 0.5);

        let roots = repo.get_model_objects(None).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].borrow().name, "Unit");
        let children = repo.get_model_objects(Some(&roots[0])).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].borrow().int_value, 7);

        let template = repo.get_template_by_name("Pump").unwrap();
        let prototype = repo.template_shape(&template).unwrap();
        assert_eq!(prototype.borrow().text, "prototype");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_open_requires_saved_project() {
        let mut repo = new_repo(SqliteStore::in_memory());
        repo.create("Draft").unwrap();
        repo.close();
        assert!(matches!(
            repo.open(),
            Err(RepositoryError::Integrity(_))
        ));
    }

    #[test]
    fn test_open_rejects_multiple_designs() {
        let path = temp_db("two_designs");
        {
            let mut repo = new_repo(SqliteStore::open(&path));
            repo.create("P").unwrap();
            repo.insert_design(handle(Design::new("Spare"))).unwrap();
            repo.save_changes().unwrap();
        }

        let mut repo = new_repo(SqliteStore::open(&path));
        assert!(matches!(
            repo.open(),
            Err(RepositoryError::Integrity(_))
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_new_shape_with_unregistered_owner_fails() {
        let mut repo = new_repo(SqliteStore::in_memory());
        repo.create("P").unwrap();
        let diagram = handle(Diagram::new("Page"));
        repo.insert_diagram(diagram.clone()).unwrap();

        // 所有者形状从未注册进仓储，保存时永远得不到标识
        let orphan = handle(Shape::new("Shapes.Rect"));
        let child = handle(Shape::new("Shapes.Ellipse"));
        repo.insert_shape(child, Owner::Shape(orphan)).unwrap();

        let err = repo.save_changes().unwrap_err();
        assert!(matches!(err, RepositoryError::Integrity(_)));
    }

    #[test]
    fn test_circular_shape_ownership_rejected_on_delete() {
        let mut repo = new_repo(SqliteStore::in_memory());
        repo.create("P").unwrap();
        let diagram = handle(Diagram::new("Page"));
        repo.insert_diagram(diagram.clone()).unwrap();
        let a = handle(Shape::new("Shapes.Rect"));
        let b = handle(Shape::new("Shapes.Rect"));
        repo.insert_shape(a.clone(), Owner::Diagram(diagram.clone()))
            .unwrap();
        repo.insert_shape(b.clone(), Owner::Shape(a.clone())).unwrap();
        repo.save_changes().unwrap();

        // a 改挂到 b 下形成所有权环，再整体标记删除
        repo.update_shape_owner(&a, Owner::Shape(b.clone())).unwrap();
        repo.delete_shape(&a).unwrap();
        repo.delete_shape(&b).unwrap();

        let err = repo.save_changes().unwrap_err();
        assert!(matches!(err, RepositoryError::Integrity(_)));
    }

    #[test]
    fn test_in_memory_session_survives_close() {
        let mut repo = new_repo(SqliteStore::in_memory());
        repo.create("Scratch").unwrap();
        repo.save_changes().unwrap();
        repo.close();
        repo.open().unwrap();
        assert_eq!(repo.project().unwrap().borrow().name, "Scratch");
    }

    #[test]
    fn test_save_failure_rolls_back_everything() {
        let path = temp_db("rollback");
        {
            let mut store = SqliteStore::open(&path);
            // 拔掉连接插入命令：保存在最后一步失败
            store
                .commands_mut()
                .remove_command(ShapeConnection::TYPE_NAME, CommandOp::Insert);
            let mut repo = new_repo(store);
            repo.create("Doomed").unwrap();
            let diagram = handle(Diagram::new("Page"));
            repo.insert_diagram(diagram.clone()).unwrap();
            let a = handle(Shape::new("Shapes.Rect"));
            let b = handle(Shape::new("Shapes.Rect"));
            repo.insert_shape(a.clone(), Owner::Diagram(diagram.clone()))
                .unwrap();
            repo.insert_shape(b.clone(), Owner::Diagram(diagram.clone()))
                .unwrap();
            repo.insert_shape_connection(ShapeConnection::new(a, 1, b, 1))
                .unwrap();

            let err = repo.save_changes().unwrap_err();
            assert!(matches!(err, RepositoryError::MissingCommand { .. }));
            assert!(repo.is_modified());
        }

        // 工程行也一并回滚了，重新打开必然失败
        let mut repo = new_repo(SqliteStore::open(&path));
        assert!(repo.open().is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_delete_cascade_persists() {
        let path = temp_db("delete");
        let diagram_id;
        {
            let mut repo = new_repo(SqliteStore::open(&path));
            repo.create("P").unwrap();
            let diagram = handle(Diagram::new("Gone"));
            repo.insert_diagram(diagram.clone()).unwrap();
            let shape = handle(Shape::new("Shapes.Rect"));
            repo.insert_shape(shape, Owner::Diagram(diagram.clone()))
                .unwrap();
            repo.save_changes().unwrap();
            diagram_id = diagram.borrow().id().unwrap();

            repo.delete_diagram(&diagram).unwrap();
            repo.save_changes().unwrap();
        }

        let mut repo = new_repo(SqliteStore::open(&path));
        repo.open().unwrap();
        assert!(matches!(
            repo.get_diagram(diagram_id),
            Err(RepositoryError::NotFound(_))
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_owner_relocation_persists() {
        let path = temp_db("reparent");
        let rect_id;
        let ellipse_id;
        {
            let mut repo = new_repo(SqliteStore::open(&path));
            repo.create("P").unwrap();
            let diagram = handle(Diagram::new("Page"));
            repo.insert_diagram(diagram.clone()).unwrap();
            let rect = handle(Shape::new("Shapes.Rect"));
            let ellipse = handle(Shape::new("Shapes.Ellipse"));
            repo.insert_shape(rect.clone(), Owner::Diagram(diagram.clone()))
                .unwrap();
            repo.insert_shape(ellipse.clone(), Owner::Diagram(diagram.clone()))
                .unwrap();
            repo.save_changes().unwrap();
            rect_id = rect.borrow().id().unwrap();
            ellipse_id = ellipse.borrow().id().unwrap();

            repo.update_shape_owner(&ellipse, Owner::Shape(rect.clone()))
                .unwrap();
            repo.save_changes().unwrap();
        }

        let mut repo = new_repo(SqliteStore::open(&path));
        repo.open().unwrap();
        let rect = repo.get_shape(rect_id).unwrap();
        let children = repo.child_shapes(&rect);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].borrow().id(), Some(ellipse_id));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_vertices_rewritten_on_update() {
        let path = temp_db("vertices");
        let line_id;
        {
            let mut repo = new_repo(SqliteStore::open(&path));
            repo.create("P").unwrap();
            let diagram = handle(Diagram::new("Page"));
            repo.insert_diagram(diagram.clone()).unwrap();
            let line = handle(Shape::new("Shapes.Polyline"));
            line.borrow_mut().vertices = vec![Vertex::new(0, 0), Vertex::new(5, 5)];
            repo.insert_shape(line.clone(), Owner::Diagram(diagram.clone()))
                .unwrap();
            repo.save_changes().unwrap();
            line_id = line.borrow().id().unwrap();

            line.borrow_mut().vertices = vec![
                Vertex::new(0, 0),
                Vertex::new(3, 8),
                Vertex::new(5, 5),
            ];
            repo.update_shape(&line).unwrap();
            repo.save_changes().unwrap();
        }

        let mut repo = new_repo(SqliteStore::open(&path));
        repo.open().unwrap();
        let line = repo.get_shape(line_id).unwrap();
        assert_eq!(line.borrow().vertices.len(), 3);
        assert_eq!(line.borrow().vertices[1], Vertex::new(3, 8));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_project_update_persists() {
        let mut repo = new_repo(SqliteStore::in_memory());
        repo.create("Before").unwrap();
        repo.save_changes().unwrap();

        let project = repo.project().unwrap();
        project.borrow_mut().description = "renamed".into();
        repo.update_project().unwrap();
        repo.save_changes().unwrap();

        repo.close();
        repo.open().unwrap();
        assert_eq!(repo.project().unwrap().borrow().description, "renamed");
    }
}
