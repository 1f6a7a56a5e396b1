//! 仓储缓存
//!
//! 会话内"改了什么"与"已加载什么"的唯一事实来源：
//! - 每个类别一张（标识 → 桶）表保存已加载实体及其生命周期状态；
//! - 新建实体尚无标识，以（句柄、所有者）对单独跟踪；
//! - 未命中的读取触发一次按类别的惰性加载，随后重试；
//! - `save_changes`把分类后的集合整体交给存储适配器，成功后
//!   调用`accept_all`把内存状态折叠回`Original`。
//!
//! 单线程同步模型：所有方法在调用线程上阻塞完成。

use crate::design::{Design, Style};
use crate::diagram::Diagram;
use crate::entity::{handle, EntityBucket, EntityId, Handle, ItemState, Owner, Persistable};
use crate::error::{RepositoryError, Result};
use crate::io::RefResolver;
use crate::model::{Model, ModelMapping, ModelObject};
use crate::project::ProjectSettings;
use crate::schema::{EntityCategory, EntityTypeDescriptor};
use crate::shape::{Shape, ShapeConnection};
use crate::template::Template;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// 仓储通知的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryAction {
    Inserted,
    Updated,
    Deleted,
    Saved,
    Opened,
    Closed,
}

/// 仓储通知
#[derive(Debug, Clone)]
pub struct RepositoryEvent {
    /// 涉及的实体类别（保存/打开/关闭时为`None`）
    pub category: Option<EntityCategory>,

    /// 动作
    pub action: RepositoryAction,

    /// 涉及实体的标识（新建实体尚无标识时为`None`）
    pub id: Option<EntityId>,
}

impl RepositoryEvent {
    fn entity(category: EntityCategory, action: RepositoryAction, id: Option<EntityId>) -> Self {
        Self {
            category: Some(category),
            action,
            id,
        }
    }

    fn session(action: RepositoryAction) -> Self {
        Self {
            category: None,
            action,
            id: None,
        }
    }
}

/// 存储适配器契约
///
/// 仓储通过这组方法委托加载与保存；适配器自行管理连接与事务。
pub trait Store {
    /// 创建后端模式（建表等），不写入任何实体
    fn create_backend(&mut self) -> Result<()>;

    /// 打开后端并加载工程与设计
    ///
    /// 恰好一个工程、恰好一个设计，否则完整性错误。
    fn open_backend(&mut self, state: &mut RepositoryState) -> Result<()>;

    /// 关闭后端连接
    fn close_backend(&mut self);

    fn load_styles(&mut self, state: &mut RepositoryState) -> Result<()>;
    fn load_templates(&mut self, state: &mut RepositoryState) -> Result<()>;
    fn load_models(&mut self, state: &mut RepositoryState) -> Result<()>;
    fn load_model_objects(&mut self, state: &mut RepositoryState) -> Result<()>;
    fn load_model_mappings(&mut self, state: &mut RepositoryState) -> Result<()>;
    fn load_diagrams(&mut self, state: &mut RepositoryState) -> Result<()>;
    fn load_template_shapes(&mut self, state: &mut RepositoryState) -> Result<()>;
    fn load_diagram_shapes(&mut self, state: &mut RepositoryState, diagram: EntityId)
        -> Result<()>;

    /// 在单个事务内提交整个变更集（见存储适配器的固定顺序）
    fn save_changes(&mut self, state: &mut RepositoryState) -> Result<()>;
}

/// 仓储的内存会话状态
///
/// 存储适配器直接读写这份状态来加载实体和提交变更集。
pub struct RepositoryState {
    /// 工程设置（会话内至多一个）
    pub project: Option<EntityBucket<ProjectSettings>>,

    pub designs: HashMap<EntityId, EntityBucket<Design>>,
    pub styles: HashMap<EntityId, EntityBucket<Style>>,
    pub templates: HashMap<EntityId, EntityBucket<Template>>,
    pub model_mappings: HashMap<EntityId, EntityBucket<ModelMapping>>,
    pub models: HashMap<EntityId, EntityBucket<Model>>,
    pub model_objects: HashMap<EntityId, EntityBucket<ModelObject>>,
    pub diagrams: HashMap<EntityId, EntityBucket<Diagram>>,
    pub shapes: HashMap<EntityId, EntityBucket<Shape>>,

    /// 新建实体：尚无标识，按（句柄、所有者）跟踪
    pub new_designs: Vec<(Handle<Design>, Owner)>,
    pub new_styles: Vec<(Handle<Style>, Owner)>,
    pub new_templates: Vec<(Handle<Template>, Owner)>,
    pub new_model_mappings: Vec<(Handle<ModelMapping>, Owner)>,
    pub new_models: Vec<(Handle<Model>, Owner)>,
    pub new_model_objects: Vec<(Handle<ModelObject>, Owner)>,
    pub new_diagrams: Vec<(Handle<Diagram>, Owner)>,
    pub new_shapes: Vec<(Handle<Shape>, Owner)>,

    /// 已加载的形状连接
    pub connections: Vec<ShapeConnection>,

    /// 待插入的形状连接
    pub new_connections: Vec<ShapeConnection>,

    /// 待删除的形状连接
    pub deleted_connections: Vec<ShapeConnection>,

    /// 注册的具体形状类型
    pub shape_types: Vec<EntityTypeDescriptor>,

    /// 各类别的惰性加载标记
    pub styles_loaded: bool,
    pub templates_loaded: bool,
    pub models_loaded: bool,
    pub model_objects_loaded: bool,
    pub model_mappings_loaded: bool,
    pub diagrams_loaded: bool,
    pub template_shapes_loaded: bool,

    /// 已完成形状加载的图示
    pub hydrated_diagrams: HashSet<EntityId>,

    /// 会话是否有未保存修改
    pub dirty: bool,
}

impl RepositoryState {
    pub fn new() -> Self {
        Self {
            project: None,
            designs: HashMap::new(),
            styles: HashMap::new(),
            templates: HashMap::new(),
            model_mappings: HashMap::new(),
            models: HashMap::new(),
            model_objects: HashMap::new(),
            diagrams: HashMap::new(),
            shapes: HashMap::new(),
            new_designs: Vec::new(),
            new_styles: Vec::new(),
            new_templates: Vec::new(),
            new_model_mappings: Vec::new(),
            new_models: Vec::new(),
            new_model_objects: Vec::new(),
            new_diagrams: Vec::new(),
            new_shapes: Vec::new(),
            connections: Vec::new(),
            new_connections: Vec::new(),
            deleted_connections: Vec::new(),
            shape_types: Vec::new(),
            styles_loaded: false,
            templates_loaded: false,
            models_loaded: false,
            model_objects_loaded: false,
            model_mappings_loaded: false,
            diagrams_loaded: false,
            template_shapes_loaded: false,
            hydrated_diagrams: HashSet::new(),
            dirty: false,
        }
    }

    /// 工程句柄
    pub fn project_handle(&self) -> Option<Handle<ProjectSettings>> {
        self.project.as_ref().map(|b| b.entity.clone())
    }

    /// 工程标识
    pub fn project_id(&self) -> Option<EntityId> {
        self.project.as_ref().and_then(|b| b.entity.borrow().id())
    }
}

impl Default for RepositoryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RefResolver for RepositoryState {
    fn resolve_style(&self, id: EntityId) -> Option<Handle<Style>> {
        self.styles.get(&id).map(|b| b.entity.clone())
    }

    fn resolve_shape(&self, id: EntityId) -> Option<Handle<Shape>> {
        self.shapes.get(&id).map(|b| b.entity.clone())
    }

    fn resolve_template(&self, id: EntityId) -> Option<Handle<Template>> {
        self.templates.get(&id).map(|b| b.entity.clone())
    }

    fn resolve_model_object(&self, id: EntityId) -> Option<Handle<ModelObject>> {
        self.model_objects.get(&id).map(|b| b.entity.clone())
    }
}

// ---------------------------------------------------------------------------
// 按类别通用的CRUD辅助函数
//
// 各类别的插入/更新/删除算法只差桶表与事件类别，这里实现一次。
// ---------------------------------------------------------------------------

fn insert_into<T: Persistable>(
    news: &mut Vec<(Handle<T>, Owner)>,
    entity: &Handle<T>,
    owner: Owner,
    what: &str,
) -> Result<()> {
    if entity.borrow().id().is_some() {
        return Err(RepositoryError::Integrity(format!(
            "{what} already has an identity"
        )));
    }
    if news.iter().any(|(h, _)| Rc::ptr_eq(h, entity)) {
        return Err(RepositoryError::Integrity(format!(
            "{what} is already inserted"
        )));
    }
    news.push((entity.clone(), owner));
    Ok(())
}

fn update_in<T: Persistable>(
    loaded: &mut HashMap<EntityId, EntityBucket<T>>,
    news: &[(Handle<T>, Owner)],
    entity: &Handle<T>,
    what: &str,
) -> Result<()> {
    match entity.borrow().id() {
        Some(id) => {
            let bucket = loaded
                .get_mut(&id)
                .ok_or_else(|| RepositoryError::NotFound(format!("{what} {id}")))?;
            match bucket.state {
                ItemState::Original | ItemState::Modified | ItemState::OwnerChanged => {
                    bucket.state = ItemState::Modified;
                    Ok(())
                }
                ItemState::Deleted => Err(RepositoryError::Integrity(format!(
                    "{what} {id} is pending deletion"
                ))),
                state => Err(RepositoryError::UnsupportedState(state)),
            }
        }
        None => {
            if news.iter().any(|(h, _)| Rc::ptr_eq(h, entity)) {
                Ok(())
            } else {
                Err(RepositoryError::NotFound(format!("new {what}")))
            }
        }
    }
}

fn delete_in<T: Persistable>(
    loaded: &mut HashMap<EntityId, EntityBucket<T>>,
    news: &mut Vec<(Handle<T>, Owner)>,
    entity: &Handle<T>,
    what: &str,
) -> Result<()> {
    match entity.borrow().id() {
        Some(id) => {
            let bucket = loaded
                .get_mut(&id)
                .ok_or_else(|| RepositoryError::NotFound(format!("{what} {id}")))?;
            match bucket.state {
                ItemState::Original | ItemState::Modified | ItemState::OwnerChanged => {
                    bucket.state = ItemState::Deleted;
                    Ok(())
                }
                ItemState::Deleted => Err(RepositoryError::Integrity(format!(
                    "{what} {id} is already pending deletion"
                ))),
                state => Err(RepositoryError::UnsupportedState(state)),
            }
        }
        None => {
            let pos = news
                .iter()
                .position(|(h, _)| Rc::ptr_eq(h, entity))
                .ok_or_else(|| RepositoryError::NotFound(format!("new {what}")))?;
            news.remove(pos);
            Ok(())
        }
    }
}

fn reparent_in<T: Persistable>(
    loaded: &mut HashMap<EntityId, EntityBucket<T>>,
    news: &mut [(Handle<T>, Owner)],
    entity: &Handle<T>,
    new_owner: Owner,
    what: &str,
) -> Result<()> {
    match entity.borrow().id() {
        Some(id) => {
            let bucket = loaded
                .get_mut(&id)
                .ok_or_else(|| RepositoryError::NotFound(format!("{what} {id}")))?;
            match bucket.state {
                ItemState::Original | ItemState::Modified | ItemState::OwnerChanged => {
                    bucket.owner = new_owner;
                    bucket.state = ItemState::OwnerChanged;
                    Ok(())
                }
                ItemState::Deleted => Err(RepositoryError::Integrity(format!(
                    "{what} {id} is pending deletion"
                ))),
                state => Err(RepositoryError::UnsupportedState(state)),
            }
        }
        None => {
            let entry = news
                .iter_mut()
                .find(|(h, _)| Rc::ptr_eq(h, entity))
                .ok_or_else(|| RepositoryError::NotFound(format!("new {what}")))?;
            entry.1 = new_owner;
            Ok(())
        }
    }
}

fn accept_map<T: Persistable>(
    loaded: &mut HashMap<EntityId, EntityBucket<T>>,
    news: &mut Vec<(Handle<T>, Owner)>,
) {
    loaded.retain(|_, b| b.state != ItemState::Deleted);
    for bucket in loaded.values_mut() {
        bucket.state = ItemState::Original;
    }
    for (entity, owner) in news.drain(..) {
        // 保存成功后新建实体必然已获得标识
        if let Some(id) = entity.borrow().id() {
            loaded.insert(id, EntityBucket::new(entity.clone(), owner, ItemState::Original));
        }
    }
}

fn find_by_name<T: Persistable>(
    loaded: &HashMap<EntityId, EntityBucket<T>>,
    news: &[(Handle<T>, Owner)],
    name: &str,
    name_of: impl Fn(&T) -> String,
) -> Option<Handle<T>> {
    // 名称未建索引：线性扫描，大小写不敏感；待保存的新实体同样可见
    loaded
        .values()
        .filter(|b| b.state != ItemState::Deleted)
        .map(|b| b.entity.clone())
        .chain(news.iter().map(|(h, _)| h.clone()))
        .find(|h| name_of(&h.borrow()).eq_ignore_ascii_case(name))
}

/// 仓储
///
/// 每个仓储实例拥有恰好一个存储适配器，适配器在实例生命周期内
/// 独占其后端连接。
pub struct Repository {
    state: RepositoryState,
    store: Box<dyn Store>,
    listeners: Vec<Box<dyn Fn(&RepositoryEvent)>>,
}

impl Repository {
    pub fn new(store: Box<dyn Store>) -> Self {
        Self {
            state: RepositoryState::new(),
            store,
            listeners: Vec::new(),
        }
    }

    /// 注册具体形状类型
    pub fn register_shape_type(&mut self, descriptor: EntityTypeDescriptor) {
        if !self
            .state
            .shape_types
            .iter()
            .any(|d| d.name == descriptor.name)
        {
            self.state.shape_types.push(descriptor);
        }
    }

    /// 订阅仓储通知
    pub fn subscribe(&mut self, listener: impl Fn(&RepositoryEvent) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    fn emit(&self, event: RepositoryEvent) {
        for listener in &self.listeners {
            listener(&event);
        }
    }

    /// 会话是否有未保存修改
    pub fn is_modified(&self) -> bool {
        self.state.dirty
    }

    /// 内部状态视图（存储适配器与测试用）
    pub fn state(&self) -> &RepositoryState {
        &self.state
    }

    // -----------------------------------------------------------------------
    // 会话管理
    // -----------------------------------------------------------------------

    /// 新建工程
    ///
    /// 创建后端模式，并在内存中建立新的工程与默认设计；
    /// 两者在首次`save_changes`时获得标识。
    pub fn create(&mut self, project_name: impl Into<String>) -> Result<()> {
        if self.state.project.is_some() {
            return Err(RepositoryError::Integrity(
                "a project is already open".into(),
            ));
        }
        self.store.create_backend()?;

        let project = handle(ProjectSettings::new(project_name));
        self.state.project = Some(EntityBucket::new(
            project.clone(),
            Owner::None,
            ItemState::New,
        ));
        let design = handle(Design::new("Default"));
        self.state
            .new_designs
            .push((design, Owner::Project(project)));

        // 新建会话视作全部已加载
        self.state.styles_loaded = true;
        self.state.templates_loaded = true;
        self.state.models_loaded = true;
        self.state.model_objects_loaded = true;
        self.state.model_mappings_loaded = true;
        self.state.diagrams_loaded = true;
        self.state.template_shapes_loaded = true;
        self.state.dirty = true;
        self.emit(RepositoryEvent::session(RepositoryAction::Opened));
        Ok(())
    }

    /// 打开既有工程
    pub fn open(&mut self) -> Result<()> {
        if self.state.project.is_some() {
            return Err(RepositoryError::Integrity(
                "a project is already open".into(),
            ));
        }
        self.store.open_backend(&mut self.state)?;
        self.emit(RepositoryEvent::session(RepositoryAction::Opened));
        Ok(())
    }

    /// 关闭会话，丢弃全部内存集合（不隐式保存）
    pub fn close(&mut self) {
        let shape_types = std::mem::take(&mut self.state.shape_types);
        self.state = RepositoryState::new();
        self.state.shape_types = shape_types;
        self.store.close_backend();
        self.emit(RepositoryEvent::session(RepositoryAction::Closed));
    }

    /// 提交会话变更集
    ///
    /// 失败时后端已整体回滚，内存状态保持原样，调用方可检查、
    /// 修正后重试，或丢弃会话。
    pub fn save_changes(&mut self) -> Result<()> {
        self.store.save_changes(&mut self.state)?;
        self.accept_all();
        self.state.dirty = false;
        self.emit(RepositoryEvent::session(RepositoryAction::Saved));
        Ok(())
    }

    /// 保存后的对账：把待定状态折叠回`Original`
    ///
    /// 幂等：连续调用第二次不改变任何桶。
    pub fn accept_all(&mut self) {
        if let Some(bucket) = self.state.project.as_mut() {
            if bucket.state == ItemState::Deleted {
                self.state.project = None;
            } else {
                bucket.state = ItemState::Original;
            }
        }
        accept_map(&mut self.state.designs, &mut self.state.new_designs);
        accept_map(&mut self.state.styles, &mut self.state.new_styles);
        accept_map(&mut self.state.templates, &mut self.state.new_templates);
        accept_map(
            &mut self.state.model_mappings,
            &mut self.state.new_model_mappings,
        );
        accept_map(&mut self.state.models, &mut self.state.new_models);
        accept_map(
            &mut self.state.model_objects,
            &mut self.state.new_model_objects,
        );
        accept_map(&mut self.state.diagrams, &mut self.state.new_diagrams);
        accept_map(&mut self.state.shapes, &mut self.state.new_shapes);

        let deleted = std::mem::take(&mut self.state.deleted_connections);
        for gone in &deleted {
            self.state.connections.retain(|c| !c.same_as(gone));
        }
        let mut fresh = std::mem::take(&mut self.state.new_connections);
        self.state.connections.append(&mut fresh);
    }

    // -----------------------------------------------------------------------
    // 惰性加载
    // -----------------------------------------------------------------------

    fn ensure_styles_loaded(&mut self) -> Result<()> {
        if !self.state.styles_loaded {
            self.store.load_styles(&mut self.state)?;
            self.state.styles_loaded = true;
        }
        Ok(())
    }

    fn ensure_templates_loaded(&mut self) -> Result<()> {
        if !self.state.templates_loaded {
            self.ensure_styles_loaded()?;
            self.store.load_templates(&mut self.state)?;
            self.state.templates_loaded = true;
        }
        Ok(())
    }

    fn ensure_models_loaded(&mut self) -> Result<()> {
        if !self.state.models_loaded {
            self.store.load_models(&mut self.state)?;
            self.state.models_loaded = true;
        }
        Ok(())
    }

    fn ensure_model_objects_loaded(&mut self) -> Result<()> {
        if !self.state.model_objects_loaded {
            self.ensure_templates_loaded()?;
            self.ensure_models_loaded()?;
            self.store.load_model_objects(&mut self.state)?;
            self.state.model_objects_loaded = true;
        }
        Ok(())
    }

    fn ensure_model_mappings_loaded(&mut self) -> Result<()> {
        if !self.state.model_mappings_loaded {
            self.ensure_templates_loaded()?;
            self.store.load_model_mappings(&mut self.state)?;
            self.state.model_mappings_loaded = true;
        }
        Ok(())
    }

    fn ensure_diagrams_loaded(&mut self) -> Result<()> {
        if !self.state.diagrams_loaded {
            self.store.load_diagrams(&mut self.state)?;
            self.state.diagrams_loaded = true;
        }
        Ok(())
    }

    fn ensure_template_shapes_loaded(&mut self) -> Result<()> {
        if !self.state.template_shapes_loaded {
            self.ensure_templates_loaded()?;
            self.ensure_model_objects_loaded()?;
            self.store.load_template_shapes(&mut self.state)?;
            self.state.template_shapes_loaded = true;
        }
        Ok(())
    }

    fn ensure_diagram_shapes_loaded(&mut self, diagram: EntityId) -> Result<()> {
        self.ensure_template_shapes_loaded()?;
        if !self.state.hydrated_diagrams.contains(&diagram) {
            self.store.load_diagram_shapes(&mut self.state, diagram)?;
            self.state.hydrated_diagrams.insert(diagram);
        }
        Ok(())
    }

    fn ensure_all_shapes_loaded(&mut self) -> Result<()> {
        self.ensure_diagrams_loaded()?;
        let diagram_ids: Vec<EntityId> = self.state.diagrams.keys().copied().collect();
        for id in diagram_ids {
            self.ensure_diagram_shapes_loaded(id)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 工程
    // -----------------------------------------------------------------------

    pub fn project(&self) -> Result<Handle<ProjectSettings>> {
        self.state
            .project_handle()
            .ok_or_else(|| RepositoryError::NotFound("project".into()))
    }

    pub fn update_project(&mut self) -> Result<()> {
        let bucket = self
            .state
            .project
            .as_mut()
            .ok_or_else(|| RepositoryError::NotFound("project".into()))?;
        match bucket.state {
            ItemState::New => {}
            ItemState::Original | ItemState::Modified => bucket.state = ItemState::Modified,
            ItemState::Deleted => {
                return Err(RepositoryError::Integrity(
                    "project is pending deletion".into(),
                ))
            }
            state => return Err(RepositoryError::UnsupportedState(state)),
        }
        self.state.dirty = true;
        self.emit(RepositoryEvent::entity(
            EntityCategory::ProjectSettings,
            RepositoryAction::Updated,
            self.state.project_id(),
        ));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 设计与样式
    // -----------------------------------------------------------------------

    pub fn get_design(&mut self, id: EntityId) -> Result<Handle<Design>> {
        // 设计在打开时已加载，未命中即不存在
        self.state
            .designs
            .get(&id)
            .map(|b| b.entity.clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("design {id}")))
    }

    pub fn get_design_by_name(&mut self, name: &str) -> Result<Handle<Design>> {
        find_by_name(&self.state.designs, &self.state.new_designs, name, |d| {
            d.name.clone()
        })
        .ok_or_else(|| RepositoryError::NotFound(format!("design '{name}'")))
    }

    pub fn designs(&self) -> Vec<Handle<Design>> {
        self.state
            .designs
            .values()
            .filter(|b| b.state != ItemState::Deleted)
            .map(|b| b.entity.clone())
            .chain(self.state.new_designs.iter().map(|(h, _)| h.clone()))
            .collect()
    }

    pub fn insert_design(&mut self, design: Handle<Design>) -> Result<()> {
        let project = self.project()?;
        insert_into(
            &mut self.state.new_designs,
            &design,
            Owner::Project(project),
            "design",
        )?;
        self.mark_dirty(EntityCategory::Design, RepositoryAction::Inserted, None);
        Ok(())
    }

    pub fn update_design(&mut self, design: &Handle<Design>) -> Result<()> {
        update_in(
            &mut self.state.designs,
            &self.state.new_designs,
            design,
            "design",
        )?;
        self.mark_dirty(
            EntityCategory::Design,
            RepositoryAction::Updated,
            design.borrow().id(),
        );
        Ok(())
    }

    /// 删除设计及其全部样式
    pub fn delete_design(&mut self, design: &Handle<Design>) -> Result<()> {
        self.ensure_styles_loaded()?;
        let owned: Vec<Handle<Style>> = self
            .state
            .styles
            .values()
            .filter(|b| matches!(&b.owner, Owner::Design(h) if Rc::ptr_eq(h, design)))
            .filter(|b| b.state != ItemState::Deleted)
            .map(|b| b.entity.clone())
            .collect();
        for style in owned {
            self.delete_style(&style)?;
        }
        let pending: Vec<Handle<Style>> = self
            .state
            .new_styles
            .iter()
            .filter(|(_, o)| matches!(o, Owner::Design(h) if Rc::ptr_eq(h, design)))
            .map(|(h, _)| h.clone())
            .collect();
        for style in pending {
            self.delete_style(&style)?;
        }
        delete_in(
            &mut self.state.designs,
            &mut self.state.new_designs,
            design,
            "design",
        )?;
        self.mark_dirty(
            EntityCategory::Design,
            RepositoryAction::Deleted,
            design.borrow().id(),
        );
        Ok(())
    }

    pub fn get_style(&mut self, id: EntityId) -> Result<Handle<Style>> {
        if let Some(bucket) = self.state.styles.get(&id) {
            return Ok(bucket.entity.clone());
        }
        self.ensure_styles_loaded()?;
        self.state
            .styles
            .get(&id)
            .map(|b| b.entity.clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("style {id}")))
    }

    pub fn get_style_by_name(&mut self, name: &str) -> Result<Handle<Style>> {
        self.ensure_styles_loaded()?;
        find_by_name(&self.state.styles, &self.state.new_styles, name, |s| {
            s.name.clone()
        })
        .ok_or_else(|| RepositoryError::NotFound(format!("style '{name}'")))
    }

    pub fn insert_style(&mut self, style: Handle<Style>, design: Handle<Design>) -> Result<()> {
        insert_into(
            &mut self.state.new_styles,
            &style,
            Owner::Design(design),
            "style",
        )?;
        self.mark_dirty(EntityCategory::Style, RepositoryAction::Inserted, None);
        Ok(())
    }

    pub fn update_style(&mut self, style: &Handle<Style>) -> Result<()> {
        update_in(
            &mut self.state.styles,
            &self.state.new_styles,
            style,
            "style",
        )?;
        self.mark_dirty(
            EntityCategory::Style,
            RepositoryAction::Updated,
            style.borrow().id(),
        );
        Ok(())
    }

    pub fn delete_style(&mut self, style: &Handle<Style>) -> Result<()> {
        delete_in(
            &mut self.state.styles,
            &mut self.state.new_styles,
            style,
            "style",
        )?;
        self.mark_dirty(
            EntityCategory::Style,
            RepositoryAction::Deleted,
            style.borrow().id(),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 模板
    // -----------------------------------------------------------------------

    pub fn get_template(&mut self, id: EntityId) -> Result<Handle<Template>> {
        if let Some(bucket) = self.state.templates.get(&id) {
            return Ok(bucket.entity.clone());
        }
        self.ensure_templates_loaded()?;
        self.state
            .templates
            .get(&id)
            .map(|b| b.entity.clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("template {id}")))
    }

    pub fn get_template_by_name(&mut self, name: &str) -> Result<Handle<Template>> {
        self.ensure_templates_loaded()?;
        find_by_name(&self.state.templates, &self.state.new_templates, name, |t| {
            t.name.clone()
        })
        .ok_or_else(|| RepositoryError::NotFound(format!("template '{name}'")))
    }

    pub fn insert_template(&mut self, template: Handle<Template>) -> Result<()> {
        let project = self.project()?;
        insert_into(
            &mut self.state.new_templates,
            &template,
            Owner::Project(project),
            "template",
        )?;
        self.mark_dirty(EntityCategory::Template, RepositoryAction::Inserted, None);
        Ok(())
    }

    pub fn update_template(&mut self, template: &Handle<Template>) -> Result<()> {
        update_in(
            &mut self.state.templates,
            &self.state.new_templates,
            template,
            "template",
        )?;
        self.mark_dirty(
            EntityCategory::Template,
            RepositoryAction::Updated,
            template.borrow().id(),
        );
        Ok(())
    }

    /// 删除模板及其映射、模型对象与原型形状
    pub fn delete_template(&mut self, template: &Handle<Template>) -> Result<()> {
        self.ensure_model_mappings_loaded()?;
        self.ensure_template_shapes_loaded()?;

        let mappings: Vec<Handle<ModelMapping>> = self
            .state
            .model_mappings
            .values()
            .filter(|b| matches!(&b.owner, Owner::Template(h) if Rc::ptr_eq(h, template)))
            .filter(|b| b.state != ItemState::Deleted)
            .map(|b| b.entity.clone())
            .chain(
                self.state
                    .new_model_mappings
                    .iter()
                    .filter(|(_, o)| matches!(o, Owner::Template(h) if Rc::ptr_eq(h, template)))
                    .map(|(h, _)| h.clone()),
            )
            .collect();
        for mapping in mappings {
            self.delete_model_mapping(&mapping)?;
        }

        if let Some(shape) = self.template_shape(template) {
            self.delete_shape_tree(&shape)?;
        }

        let objects: Vec<Handle<ModelObject>> = self
            .state
            .model_objects
            .values()
            .filter(|b| matches!(&b.owner, Owner::Template(h) if Rc::ptr_eq(h, template)))
            .filter(|b| b.state != ItemState::Deleted)
            .map(|b| b.entity.clone())
            .chain(
                self.state
                    .new_model_objects
                    .iter()
                    .filter(|(_, o)| matches!(o, Owner::Template(h) if Rc::ptr_eq(h, template)))
                    .map(|(h, _)| h.clone()),
            )
            .collect();
        for object in objects {
            self.delete_model_object(&object)?;
        }

        delete_in(
            &mut self.state.templates,
            &mut self.state.new_templates,
            template,
            "template",
        )?;
        self.mark_dirty(
            EntityCategory::Template,
            RepositoryAction::Deleted,
            template.borrow().id(),
        );
        Ok(())
    }

    /// 模板的原型形状
    pub fn template_shape(&self, template: &Handle<Template>) -> Option<Handle<Shape>> {
        self.state
            .shapes
            .values()
            .filter(|b| b.state != ItemState::Deleted)
            .find(|b| matches!(&b.owner, Owner::Template(h) if Rc::ptr_eq(h, template)))
            .map(|b| b.entity.clone())
            .or_else(|| {
                self.state
                    .new_shapes
                    .iter()
                    .find(|(_, o)| matches!(o, Owner::Template(h) if Rc::ptr_eq(h, template)))
                    .map(|(h, _)| h.clone())
            })
    }

    /// 替换模板的原型形状
    pub fn replace_template_shape(
        &mut self,
        template: &Handle<Template>,
        shape: Handle<Shape>,
    ) -> Result<()> {
        self.ensure_template_shapes_loaded()?;
        if let Some(old) = self.template_shape(template) {
            self.delete_shape_tree(&old)?;
        }
        self.insert_shape(shape, Owner::Template(template.clone()))
    }

    // -----------------------------------------------------------------------
    // 模型与模型对象
    // -----------------------------------------------------------------------

    pub fn get_model(&mut self, id: EntityId) -> Result<Handle<Model>> {
        if let Some(bucket) = self.state.models.get(&id) {
            return Ok(bucket.entity.clone());
        }
        self.ensure_models_loaded()?;
        self.state
            .models
            .get(&id)
            .map(|b| b.entity.clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("model {id}")))
    }

    pub fn models(&mut self) -> Result<Vec<Handle<Model>>> {
        self.ensure_models_loaded()?;
        Ok(self
            .state
            .models
            .values()
            .filter(|b| b.state != ItemState::Deleted)
            .map(|b| b.entity.clone())
            .chain(self.state.new_models.iter().map(|(h, _)| h.clone()))
            .collect())
    }

    pub fn insert_model(&mut self, model: Handle<Model>) -> Result<()> {
        let project = self.project()?;
        insert_into(
            &mut self.state.new_models,
            &model,
            Owner::Project(project),
            "model",
        )?;
        self.mark_dirty(EntityCategory::Model, RepositoryAction::Inserted, None);
        Ok(())
    }

    pub fn update_model(&mut self, model: &Handle<Model>) -> Result<()> {
        update_in(
            &mut self.state.models,
            &self.state.new_models,
            model,
            "model",
        )?;
        self.mark_dirty(
            EntityCategory::Model,
            RepositoryAction::Updated,
            model.borrow().id(),
        );
        Ok(())
    }

    pub fn delete_model(&mut self, model: &Handle<Model>) -> Result<()> {
        delete_in(
            &mut self.state.models,
            &mut self.state.new_models,
            model,
            "model",
        )?;
        self.mark_dirty(
            EntityCategory::Model,
            RepositoryAction::Deleted,
            model.borrow().id(),
        );
        Ok(())
    }

    pub fn get_model_object(&mut self, id: EntityId) -> Result<Handle<ModelObject>> {
        if let Some(bucket) = self.state.model_objects.get(&id) {
            return Ok(bucket.entity.clone());
        }
        self.ensure_model_objects_loaded()?;
        self.state
            .model_objects
            .get(&id)
            .map(|b| b.entity.clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("model object {id}")))
    }

    /// 列出某个父节点的直接子模型对象
    ///
    /// `parent`为`None`时返回直接归属于模型的根对象。
    pub fn get_model_objects(
        &mut self,
        parent: Option<&Handle<ModelObject>>,
    ) -> Result<Vec<Handle<ModelObject>>> {
        self.ensure_model_objects_loaded()?;
        let matches_owner = |owner: &Owner| match parent {
            Some(p) => matches!(owner, Owner::ModelObject(h) if Rc::ptr_eq(h, p)),
            None => matches!(owner, Owner::Model(_)),
        };
        let mut result: Vec<Handle<ModelObject>> = self
            .state
            .model_objects
            .values()
            .filter(|b| b.state != ItemState::Deleted && matches_owner(&b.owner))
            .map(|b| b.entity.clone())
            .collect();
        result.extend(
            self.state
                .new_model_objects
                .iter()
                .filter(|(_, o)| matches_owner(o))
                .map(|(h, _)| h.clone()),
        );
        Ok(result)
    }

    pub fn insert_model_object(&mut self, object: Handle<ModelObject>, owner: Owner) -> Result<()> {
        match owner {
            Owner::Model(_) | Owner::Template(_) | Owner::ModelObject(_) => {}
            _ => {
                return Err(RepositoryError::Integrity(
                    "model object owner must be a model, template or model object".into(),
                ))
            }
        }
        insert_into(&mut self.state.new_model_objects, &object, owner, "model object")?;
        self.mark_dirty(EntityCategory::ModelObject, RepositoryAction::Inserted, None);
        Ok(())
    }

    pub fn insert_model_objects(
        &mut self,
        objects: impl IntoIterator<Item = (Handle<ModelObject>, Owner)>,
    ) -> Result<()> {
        for (object, owner) in objects {
            self.insert_model_object(object, owner)?;
        }
        Ok(())
    }

    pub fn update_model_object(&mut self, object: &Handle<ModelObject>) -> Result<()> {
        update_in(
            &mut self.state.model_objects,
            &self.state.new_model_objects,
            object,
            "model object",
        )?;
        self.mark_dirty(
            EntityCategory::ModelObject,
            RepositoryAction::Updated,
            object.borrow().id(),
        );
        Ok(())
    }

    pub fn update_model_objects(
        &mut self,
        objects: impl IntoIterator<Item = Handle<ModelObject>>,
    ) -> Result<()> {
        for object in objects {
            self.update_model_object(&object)?;
        }
        Ok(())
    }

    pub fn delete_model_object(&mut self, object: &Handle<ModelObject>) -> Result<()> {
        delete_in(
            &mut self.state.model_objects,
            &mut self.state.new_model_objects,
            object,
            "model object",
        )?;
        self.mark_dirty(
            EntityCategory::ModelObject,
            RepositoryAction::Deleted,
            object.borrow().id(),
        );
        Ok(())
    }

    pub fn delete_model_objects(
        &mut self,
        objects: impl IntoIterator<Item = Handle<ModelObject>>,
    ) -> Result<()> {
        for object in objects {
            self.delete_model_object(&object)?;
        }
        Ok(())
    }

    /// 重设模型对象的父节点
    pub fn update_model_object_parent(
        &mut self,
        object: &Handle<ModelObject>,
        new_owner: Owner,
    ) -> Result<()> {
        match new_owner {
            Owner::Model(_) | Owner::ModelObject(_) => {}
            _ => {
                return Err(RepositoryError::Integrity(
                    "model object parent must be a model or model object".into(),
                ))
            }
        }
        reparent_in(
            &mut self.state.model_objects,
            &mut self.state.new_model_objects,
            object,
            new_owner,
            "model object",
        )?;
        self.mark_dirty(
            EntityCategory::ModelObject,
            RepositoryAction::Updated,
            object.borrow().id(),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 模型映射
    // -----------------------------------------------------------------------

    pub fn get_model_mapping(&mut self, id: EntityId) -> Result<Handle<ModelMapping>> {
        if let Some(bucket) = self.state.model_mappings.get(&id) {
            return Ok(bucket.entity.clone());
        }
        self.ensure_model_mappings_loaded()?;
        self.state
            .model_mappings
            .get(&id)
            .map(|b| b.entity.clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("model mapping {id}")))
    }

    pub fn insert_model_mapping(
        &mut self,
        mapping: Handle<ModelMapping>,
        template: Handle<Template>,
    ) -> Result<()> {
        insert_into(
            &mut self.state.new_model_mappings,
            &mapping,
            Owner::Template(template),
            "model mapping",
        )?;
        self.mark_dirty(EntityCategory::ModelMapping, RepositoryAction::Inserted, None);
        Ok(())
    }

    pub fn update_model_mapping(&mut self, mapping: &Handle<ModelMapping>) -> Result<()> {
        update_in(
            &mut self.state.model_mappings,
            &self.state.new_model_mappings,
            mapping,
            "model mapping",
        )?;
        self.mark_dirty(
            EntityCategory::ModelMapping,
            RepositoryAction::Updated,
            mapping.borrow().id(),
        );
        Ok(())
    }

    pub fn delete_model_mapping(&mut self, mapping: &Handle<ModelMapping>) -> Result<()> {
        delete_in(
            &mut self.state.model_mappings,
            &mut self.state.new_model_mappings,
            mapping,
            "model mapping",
        )?;
        self.mark_dirty(
            EntityCategory::ModelMapping,
            RepositoryAction::Deleted,
            mapping.borrow().id(),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 图示
    // -----------------------------------------------------------------------

    pub fn get_diagram(&mut self, id: EntityId) -> Result<Handle<Diagram>> {
        if let Some(bucket) = self.state.diagrams.get(&id) {
            return Ok(bucket.entity.clone());
        }
        self.ensure_diagrams_loaded()?;
        self.state
            .diagrams
            .get(&id)
            .map(|b| b.entity.clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("diagram {id}")))
    }

    pub fn get_diagram_by_name(&mut self, name: &str) -> Result<Handle<Diagram>> {
        self.ensure_diagrams_loaded()?;
        find_by_name(&self.state.diagrams, &self.state.new_diagrams, name, |d| {
            d.name.clone()
        })
        .ok_or_else(|| RepositoryError::NotFound(format!("diagram '{name}'")))
    }

    pub fn diagrams(&mut self) -> Result<Vec<Handle<Diagram>>> {
        self.ensure_diagrams_loaded()?;
        Ok(self
            .state
            .diagrams
            .values()
            .filter(|b| b.state != ItemState::Deleted)
            .map(|b| b.entity.clone())
            .chain(self.state.new_diagrams.iter().map(|(h, _)| h.clone()))
            .collect())
    }

    pub fn insert_diagram(&mut self, diagram: Handle<Diagram>) -> Result<()> {
        let project = self.project()?;
        insert_into(
            &mut self.state.new_diagrams,
            &diagram,
            Owner::Project(project),
            "diagram",
        )?;
        self.mark_dirty(EntityCategory::Diagram, RepositoryAction::Inserted, None);
        Ok(())
    }

    pub fn update_diagram(&mut self, diagram: &Handle<Diagram>) -> Result<()> {
        update_in(
            &mut self.state.diagrams,
            &self.state.new_diagrams,
            diagram,
            "diagram",
        )?;
        self.mark_dirty(
            EntityCategory::Diagram,
            RepositoryAction::Updated,
            diagram.borrow().id(),
        );
        Ok(())
    }

    /// 删除图示及其全部形状与连接
    pub fn delete_diagram(&mut self, diagram: &Handle<Diagram>) -> Result<()> {
        if let Some(id) = diagram.borrow().id() {
            self.ensure_diagram_shapes_loaded(id)?;
        }
        let shapes = self.diagram_shapes(diagram);
        for shape in shapes {
            self.delete_shape_tree(&shape)?;
        }
        delete_in(
            &mut self.state.diagrams,
            &mut self.state.new_diagrams,
            diagram,
            "diagram",
        )?;
        self.mark_dirty(
            EntityCategory::Diagram,
            RepositoryAction::Deleted,
            diagram.borrow().id(),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 形状
    // -----------------------------------------------------------------------

    pub fn get_shape(&mut self, id: EntityId) -> Result<Handle<Shape>> {
        if let Some(bucket) = self.state.shapes.get(&id) {
            return Ok(bucket.entity.clone());
        }
        self.ensure_all_shapes_loaded()?;
        self.state
            .shapes
            .get(&id)
            .map(|b| b.entity.clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("shape {id}")))
    }

    /// 图示直接拥有的形状
    pub fn diagram_shapes(&self, diagram: &Handle<Diagram>) -> Vec<Handle<Shape>> {
        let mut result: Vec<Handle<Shape>> = self
            .state
            .shapes
            .values()
            .filter(|b| b.state != ItemState::Deleted)
            .filter(|b| matches!(&b.owner, Owner::Diagram(h) if Rc::ptr_eq(h, diagram)))
            .map(|b| b.entity.clone())
            .collect();
        result.extend(
            self.state
                .new_shapes
                .iter()
                .filter(|(_, o)| matches!(o, Owner::Diagram(h) if Rc::ptr_eq(h, diagram)))
                .map(|(h, _)| h.clone()),
        );
        result
    }

    /// 形状直接拥有的子形状
    pub fn child_shapes(&self, parent: &Handle<Shape>) -> Vec<Handle<Shape>> {
        let mut result: Vec<Handle<Shape>> = self
            .state
            .shapes
            .values()
            .filter(|b| b.state != ItemState::Deleted)
            .filter(|b| matches!(&b.owner, Owner::Shape(h) if Rc::ptr_eq(h, parent)))
            .map(|b| b.entity.clone())
            .collect();
        result.extend(
            self.state
                .new_shapes
                .iter()
                .filter(|(_, o)| matches!(o, Owner::Shape(h) if Rc::ptr_eq(h, parent)))
                .map(|(h, _)| h.clone()),
        );
        result
    }

    pub fn insert_shape(&mut self, shape: Handle<Shape>, owner: Owner) -> Result<()> {
        match owner {
            Owner::Diagram(_) | Owner::Template(_) | Owner::Shape(_) => {}
            _ => {
                return Err(RepositoryError::Integrity(
                    "shape owner must be a diagram, template or shape".into(),
                ))
            }
        }
        insert_into(&mut self.state.new_shapes, &shape, owner, "shape")?;
        self.mark_dirty(EntityCategory::Shape, RepositoryAction::Inserted, None);
        Ok(())
    }

    pub fn insert_shapes(
        &mut self,
        shapes: impl IntoIterator<Item = (Handle<Shape>, Owner)>,
    ) -> Result<()> {
        for (shape, owner) in shapes {
            self.insert_shape(shape, owner)?;
        }
        Ok(())
    }

    pub fn update_shape(&mut self, shape: &Handle<Shape>) -> Result<()> {
        update_in(
            &mut self.state.shapes,
            &self.state.new_shapes,
            shape,
            "shape",
        )?;
        self.mark_dirty(
            EntityCategory::Shape,
            RepositoryAction::Updated,
            shape.borrow().id(),
        );
        Ok(())
    }

    pub fn update_shapes(
        &mut self,
        shapes: impl IntoIterator<Item = Handle<Shape>>,
    ) -> Result<()> {
        for shape in shapes {
            self.update_shape(&shape)?;
        }
        Ok(())
    }

    pub fn delete_shape(&mut self, shape: &Handle<Shape>) -> Result<()> {
        delete_in(
            &mut self.state.shapes,
            &mut self.state.new_shapes,
            shape,
            "shape",
        )?;
        self.mark_dirty(
            EntityCategory::Shape,
            RepositoryAction::Deleted,
            shape.borrow().id(),
        );
        Ok(())
    }

    pub fn delete_shapes(
        &mut self,
        shapes: impl IntoIterator<Item = Handle<Shape>>,
    ) -> Result<()> {
        for shape in shapes {
            self.delete_shape(&shape)?;
        }
        Ok(())
    }

    /// 删除形状、其子形状树及涉及的连接
    pub fn delete_shape_tree(&mut self, shape: &Handle<Shape>) -> Result<()> {
        for child in self.child_shapes(shape) {
            self.delete_shape_tree(&child)?;
        }
        let involved: Vec<ShapeConnection> = self
            .shape_connections(shape)
            .into_iter()
            .chain(
                self.state
                    .connections
                    .iter()
                    .filter(|c| Rc::ptr_eq(&c.target, shape))
                    .cloned(),
            )
            .chain(
                self.state
                    .new_connections
                    .iter()
                    .filter(|c| Rc::ptr_eq(&c.target, shape))
                    .cloned(),
            )
            .collect();
        for connection in involved {
            self.delete_shape_connection(&connection)?;
        }
        self.delete_shape(shape)
    }

    /// 重设形状的所有者
    pub fn update_shape_owner(&mut self, shape: &Handle<Shape>, new_owner: Owner) -> Result<()> {
        match new_owner {
            Owner::Diagram(_) | Owner::Shape(_) => {}
            _ => {
                return Err(RepositoryError::Integrity(
                    "shape owner must be a diagram or shape".into(),
                ))
            }
        }
        reparent_in(
            &mut self.state.shapes,
            &mut self.state.new_shapes,
            shape,
            new_owner,
            "shape",
        )?;
        self.mark_dirty(
            EntityCategory::Shape,
            RepositoryAction::Updated,
            shape.borrow().id(),
        );
        Ok(())
    }

    /// 图示的新顶层叠放次序
    pub fn obtain_new_top_z_order(&mut self, diagram: &Handle<Diagram>) -> i32 {
        self.diagram_shapes(diagram)
            .iter()
            .map(|s| s.borrow().z_order)
            .max()
            .unwrap_or(0)
            + 10
    }

    /// 图示的新底层叠放次序
    pub fn obtain_new_bottom_z_order(&mut self, diagram: &Handle<Diagram>) -> i32 {
        self.diagram_shapes(diagram)
            .iter()
            .map(|s| s.borrow().z_order)
            .min()
            .unwrap_or(0)
            - 10
    }

    // -----------------------------------------------------------------------
    // 形状连接
    // -----------------------------------------------------------------------

    /// 某形状作为连接件的全部连接
    pub fn shape_connections(&self, shape: &Handle<Shape>) -> Vec<ShapeConnection> {
        self.state
            .connections
            .iter()
            .filter(|c| Rc::ptr_eq(&c.connector, shape))
            .filter(|c| !self.state.deleted_connections.iter().any(|d| d.same_as(c)))
            .cloned()
            .chain(
                self.state
                    .new_connections
                    .iter()
                    .filter(|c| Rc::ptr_eq(&c.connector, shape))
                    .cloned(),
            )
            .collect()
    }

    pub fn insert_shape_connection(&mut self, connection: ShapeConnection) -> Result<()> {
        if self
            .state
            .new_connections
            .iter()
            .any(|c| c.same_as(&connection))
        {
            return Err(RepositoryError::Integrity(
                "connection is already pending insertion".into(),
            ));
        }
        self.state.new_connections.push(connection);
        self.mark_dirty(EntityCategory::Shape, RepositoryAction::Inserted, None);
        Ok(())
    }

    pub fn delete_shape_connection(&mut self, connection: &ShapeConnection) -> Result<()> {
        // 删除尚未提交的待插入连接：直接从插入集合撤销
        if let Some(pos) = self
            .state
            .new_connections
            .iter()
            .position(|c| c.same_as(connection))
        {
            self.state.new_connections.remove(pos);
        } else {
            if !self.state.connections.iter().any(|c| c.same_as(connection)) {
                return Err(RepositoryError::NotFound("shape connection".into()));
            }
            if !self
                .state
                .deleted_connections
                .iter()
                .any(|c| c.same_as(connection))
            {
                self.state.deleted_connections.push(connection.clone());
            }
        }
        self.mark_dirty(EntityCategory::Shape, RepositoryAction::Deleted, None);
        Ok(())
    }

    fn mark_dirty(
        &mut self,
        category: EntityCategory,
        action: RepositoryAction,
        id: Option<EntityId>,
    ) {
        self.state.dirty = true;
        self.emit(RepositoryEvent::entity(category, action, id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::StyleKind;
    use std::cell::Cell;

    /// 仅分配标识、不落盘的测试桩
    struct MockStore {
        next_id: i64,
    }

    impl MockStore {
        fn new() -> Self {
            Self { next_id: 1 }
        }

        fn assign<T: Persistable>(&mut self, news: &[(Handle<T>, Owner)]) {
            for (entity, _) in news {
                if entity.borrow().id().is_none() {
                    entity.borrow_mut().assign_id(EntityId(self.next_id));
                    self.next_id += 1;
                }
            }
        }
    }

    impl Store for MockStore {
        fn create_backend(&mut self) -> Result<()> {
            Ok(())
        }

        fn open_backend(&mut self, _state: &mut RepositoryState) -> Result<()> {
            Err(RepositoryError::Integrity("no project in backend".into()))
        }

        fn close_backend(&mut self) {}

        fn load_styles(&mut self, _state: &mut RepositoryState) -> Result<()> {
            Ok(())
        }

        fn load_templates(&mut self, _state: &mut RepositoryState) -> Result<()> {
            Ok(())
        }

        fn load_models(&mut self, _state: &mut RepositoryState) -> Result<()> {
            Ok(())
        }

        fn load_model_objects(&mut self, _state: &mut RepositoryState) -> Result<()> {
            Ok(())
        }

        fn load_model_mappings(&mut self, _state: &mut RepositoryState) -> Result<()> {
            Ok(())
        }

        fn load_diagrams(&mut self, _state: &mut RepositoryState) -> Result<()> {
            Ok(())
        }

        fn load_template_shapes(&mut self, _state: &mut RepositoryState) -> Result<()> {
            Ok(())
        }

        fn load_diagram_shapes(
            &mut self,
            _state: &mut RepositoryState,
            _diagram: EntityId,
        ) -> Result<()> {
            Ok(())
        }

        fn save_changes(&mut self, state: &mut RepositoryState) -> Result<()> {
            if let Some(bucket) = &state.project {
                if bucket.entity.borrow().id().is_none() {
                    bucket.entity.borrow_mut().assign_id(EntityId(self.next_id));
                    self.next_id += 1;
                }
            }
            self.assign(&state.new_designs);
            self.assign(&state.new_styles);
            self.assign(&state.new_templates);
            self.assign(&state.new_models);
            self.assign(&state.new_model_objects);
            self.assign(&state.new_model_mappings);
            self.assign(&state.new_diagrams);
            self.assign(&state.new_shapes);
            Ok(())
        }
    }

    fn fresh_repository() -> Repository {
        let mut repo = Repository::new(Box::new(MockStore::new()));
        for descriptor in crate::shape::builtin_shape_types() {
            repo.register_shape_type(descriptor);
        }
        repo.create("Test Project").unwrap();
        repo
    }

    #[test]
    fn test_create_assigns_identity_on_save() {
        let mut repo = fresh_repository();
        assert!(repo.project().unwrap().borrow().id().is_none());
        assert!(repo.is_modified());

        repo.save_changes().unwrap();

        assert!(repo.project().unwrap().borrow().id().is_some());
        assert!(!repo.is_modified());
        // 默认设计已迁入已加载集合
        assert_eq!(repo.designs().len(), 1);
    }

    #[test]
    fn test_new_entities_visible_before_first_save() {
        let mut repo = fresh_repository();

        // 默认设计在首次保存前就必须可查
        let design = repo.get_design_by_name("Default").unwrap();
        assert!(design.borrow().id().is_none());
        assert_eq!(repo.designs().len(), 1);

        let style = handle(Style::new("Red", StyleKind::Color));
        repo.insert_style(style.clone(), design.clone()).unwrap();
        let template = handle(Template::new("Pump"));
        repo.insert_template(template.clone()).unwrap();
        let diagram = handle(Diagram::new("Page 1"));
        repo.insert_diagram(diagram.clone()).unwrap();

        assert!(Rc::ptr_eq(&repo.get_style_by_name("red").unwrap(), &style));
        assert!(Rc::ptr_eq(
            &repo.get_template_by_name("pump").unwrap(),
            &template
        ));
        assert!(Rc::ptr_eq(
            &repo.get_diagram_by_name("page 1").unwrap(),
            &diagram
        ));
    }

    #[test]
    fn test_insert_rejects_identified_entity() {
        let mut repo = fresh_repository();
        repo.save_changes().unwrap();

        let design = repo.designs()[0].clone();
        let style = handle(Style::new("Red", StyleKind::Color));
        style.borrow_mut().assign_id(EntityId(99));

        let err = repo.insert_style(style, design).unwrap_err();
        assert!(matches!(err, RepositoryError::Integrity(_)));
    }

    #[test]
    fn test_lifecycle_state_machine() {
        let mut repo = fresh_repository();
        repo.save_changes().unwrap();

        let design = repo.designs()[0].clone();
        let style = handle(Style::new("Red", StyleKind::Color));
        repo.insert_style(style.clone(), design).unwrap();
        repo.save_changes().unwrap();

        let id = style.borrow().id().unwrap();
        assert_eq!(repo.state().styles[&id].state, ItemState::Original);

        repo.update_style(&style).unwrap();
        assert_eq!(repo.state().styles[&id].state, ItemState::Modified);

        repo.save_changes().unwrap();
        assert_eq!(repo.state().styles[&id].state, ItemState::Original);

        repo.delete_style(&style).unwrap();
        assert_eq!(repo.state().styles[&id].state, ItemState::Deleted);

        repo.save_changes().unwrap();
        assert!(!repo.state().styles.contains_key(&id));
    }

    #[test]
    fn test_new_entity_deleted_before_save_vanishes() {
        let mut repo = fresh_repository();
        repo.save_changes().unwrap();

        let diagram = handle(Diagram::new("D1"));
        repo.insert_diagram(diagram.clone()).unwrap();
        repo.delete_diagram(&diagram).unwrap();

        repo.save_changes().unwrap();
        assert!(diagram.borrow().id().is_none());
        assert!(repo.state().diagrams.is_empty());
    }

    #[test]
    fn test_update_unknown_entity_fails() {
        let mut repo = fresh_repository();
        repo.save_changes().unwrap();

        let stray = handle(Style::new("Stray", StyleKind::Line));
        assert!(matches!(
            repo.update_style(&stray),
            Err(RepositoryError::NotFound(_))
        ));

        stray.borrow_mut().assign_id(EntityId(404));
        assert!(matches!(
            repo.update_style(&stray),
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[test]
    fn test_accept_all_idempotent() {
        let mut repo = fresh_repository();
        let diagram = handle(Diagram::new("D1"));
        repo.insert_diagram(diagram.clone()).unwrap();
        repo.save_changes().unwrap();

        let id = diagram.borrow().id().unwrap();
        repo.update_diagram(&diagram).unwrap();
        repo.accept_all();
        assert_eq!(repo.state().diagrams[&id].state, ItemState::Original);

        // 第二次调用不改变任何桶
        repo.accept_all();
        assert_eq!(repo.state().diagrams[&id].state, ItemState::Original);
        assert!(repo.state().new_diagrams.is_empty());
    }

    #[test]
    fn test_owner_change_distinct_from_modified() {
        let mut repo = fresh_repository();
        let d1 = handle(Diagram::new("D1"));
        let d2 = handle(Diagram::new("D2"));
        repo.insert_diagram(d1.clone()).unwrap();
        repo.insert_diagram(d2.clone()).unwrap();
        let shape = handle(Shape::new("Shapes.Rect"));
        repo.insert_shape(shape.clone(), Owner::Diagram(d1.clone()))
            .unwrap();
        repo.save_changes().unwrap();

        let id = shape.borrow().id().unwrap();
        repo.update_shape_owner(&shape, Owner::Diagram(d2.clone()))
            .unwrap();
        assert_eq!(repo.state().shapes[&id].state, ItemState::OwnerChanged);
        assert!(repo.diagram_shapes(&d1).is_empty());
        assert_eq!(repo.diagram_shapes(&d2).len(), 1);
    }

    #[test]
    fn test_new_shape_owner_rewrite() {
        let mut repo = fresh_repository();
        let d1 = handle(Diagram::new("D1"));
        let d2 = handle(Diagram::new("D2"));
        repo.insert_diagram(d1.clone()).unwrap();
        repo.insert_diagram(d2.clone()).unwrap();
        let shape = handle(Shape::new("Shapes.Rect"));
        repo.insert_shape(shape.clone(), Owner::Diagram(d1.clone()))
            .unwrap();

        // 新建形状改所有者只是改写映射条目
        repo.update_shape_owner(&shape, Owner::Diagram(d2.clone()))
            .unwrap();
        assert!(repo.diagram_shapes(&d1).is_empty());
        assert_eq!(repo.diagram_shapes(&d2).len(), 1);
    }

    #[test]
    fn test_pending_connection_cancelled_by_delete() {
        let mut repo = fresh_repository();
        let diagram = handle(Diagram::new("D1"));
        repo.insert_diagram(diagram.clone()).unwrap();
        let a = handle(Shape::new("Shapes.Rect"));
        let b = handle(Shape::new("Shapes.Ellipse"));
        repo.insert_shape(a.clone(), Owner::Diagram(diagram.clone()))
            .unwrap();
        repo.insert_shape(b.clone(), Owner::Diagram(diagram.clone()))
            .unwrap();

        let connection = ShapeConnection::new(a.clone(), 3, b.clone(), 1);
        repo.insert_shape_connection(connection.clone()).unwrap();
        assert_eq!(repo.shape_connections(&a).len(), 1);

        repo.delete_shape_connection(&connection).unwrap();
        assert!(repo.shape_connections(&a).is_empty());
        assert!(repo.state().deleted_connections.is_empty());
    }

    #[test]
    fn test_case_insensitive_name_lookup() {
        let mut repo = fresh_repository();
        repo.save_changes().unwrap();

        let found = repo.get_design_by_name("DEFAULT").unwrap();
        assert_eq!(found.borrow().name, "Default");
        assert!(matches!(
            repo.get_design_by_name("missing"),
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[test]
    fn test_z_order_helpers() {
        let mut repo = fresh_repository();
        let diagram = handle(Diagram::new("D1"));
        repo.insert_diagram(diagram.clone()).unwrap();

        assert_eq!(repo.obtain_new_top_z_order(&diagram), 10);
        assert_eq!(repo.obtain_new_bottom_z_order(&diagram), -10);

        let shape = handle(Shape::new("Shapes.Rect"));
        shape.borrow_mut().z_order = 40;
        repo.insert_shape(shape, Owner::Diagram(diagram.clone()))
            .unwrap();
        assert_eq!(repo.obtain_new_top_z_order(&diagram), 50);
        assert_eq!(repo.obtain_new_bottom_z_order(&diagram), 30);
    }

    #[test]
    fn test_get_model_objects_filters_by_parent() {
        let mut repo = fresh_repository();
        let model = handle(Model::new("M"));
        repo.insert_model(model.clone()).unwrap();

        let root = handle(ModelObject::new("root"));
        repo.insert_model_object(root.clone(), Owner::Model(model.clone()))
            .unwrap();
        let child = handle(ModelObject::new("child"));
        repo.insert_model_object(child.clone(), Owner::ModelObject(root.clone()))
            .unwrap();

        let roots = repo.get_model_objects(None).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].borrow().name, "root");

        let children = repo.get_model_objects(Some(&root)).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].borrow().name, "child");
    }

    #[test]
    fn test_delete_diagram_cascades_to_shapes_and_connections() {
        let mut repo = fresh_repository();
        let diagram = handle(Diagram::new("D1"));
        repo.insert_diagram(diagram.clone()).unwrap();
        let a = handle(Shape::new("Shapes.Rect"));
        let b = handle(Shape::new("Shapes.Ellipse"));
        repo.insert_shape(a.clone(), Owner::Diagram(diagram.clone()))
            .unwrap();
        repo.insert_shape(b.clone(), Owner::Diagram(diagram.clone()))
            .unwrap();
        repo.insert_shape_connection(ShapeConnection::new(a.clone(), 1, b.clone(), 2))
            .unwrap();
        repo.save_changes().unwrap();

        repo.delete_diagram(&diagram).unwrap();
        let id = diagram.borrow().id().unwrap();
        assert_eq!(repo.state().diagrams[&id].state, ItemState::Deleted);
        assert!(repo
            .state()
            .shapes
            .values()
            .all(|b| b.state == ItemState::Deleted));
        assert_eq!(repo.state().deleted_connections.len(), 1);

        repo.save_changes().unwrap();
        assert!(repo.state().shapes.is_empty());
        assert!(repo.state().connections.is_empty());
    }

    #[test]
    fn test_events_are_emitted() {
        let mut repo = fresh_repository();
        let inserted = std::rc::Rc::new(Cell::new(0));
        let seen = inserted.clone();
        repo.subscribe(move |event| {
            if event.action == RepositoryAction::Inserted {
                seen.set(seen.get() + 1);
            }
        });

        let diagram = handle(Diagram::new("D1"));
        repo.insert_diagram(diagram).unwrap();
        assert_eq!(inserted.get(), 1);
    }

    #[test]
    fn test_close_discards_session() {
        let mut repo = fresh_repository();
        repo.save_changes().unwrap();
        assert!(repo.project().is_ok());

        repo.close();
        assert!(matches!(repo.project(), Err(RepositoryError::NotFound(_))));
        // 形状类型注册在关闭后保留
        assert_eq!(repo.state().shape_types.len(), 3);
    }

    #[test]
    fn test_replace_template_shape() {
        let mut repo = fresh_repository();
        let template = handle(Template::new("T"));
        repo.insert_template(template.clone()).unwrap();
        let first = handle(Shape::new("Shapes.Rect"));
        repo.insert_shape(first.clone(), Owner::Template(template.clone()))
            .unwrap();
        repo.save_changes().unwrap();

        let second = handle(Shape::new("Shapes.Ellipse"));
        repo.replace_template_shape(&template, second.clone())
            .unwrap();

        let current = repo.template_shape(&template).unwrap();
        assert!(Rc::ptr_eq(&current, &second));
    }
}
