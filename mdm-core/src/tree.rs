//! The typed node tree.
//!
//! Nodes live in a single arena keyed by `Identifier`; parent/child edges are
//! id references rather than `Rc`/`Weak` pointers, so the tree has no borrow-
//! checker fights and no cycles to worry about — the same shape the store
//! this crate is modeled on uses for its process instances (`HashMap<Uuid, T>`
//! plus explicit foreign-key-style references instead of a pointer graph).

use crate::addressing::NodeRef;
use crate::errors::{CoreError, CoreResult};
use crate::hooks::{MethodHooks, PostInvoke, PreInvoke, VariableHook, VariableHooks};
use crate::ids::{Identifier, ScopeId, SubscriberId, SubscriptionId};
use crate::steps::{CompareOp, Step};
use crate::subscription::{Filter, Firing, SubscriptionList};
use crate::value::{Unit, Value, ValueKind};
use std::collections::{HashMap, HashSet};

/// An insertion-ordered name -> id map, used for both folder children and
/// object variable properties. A plain `Vec` rather than a map crate — trees
/// in this system are small enough that linear lookup costs nothing, and the
/// ordering it gives for free is what children-iteration order needs anyway.
#[derive(Default)]
pub struct NameMap {
    entries: Vec<(String, Identifier)>,
}

impl NameMap {
    pub fn get(&self, name: &str) -> Option<Identifier> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, id)| *id)
    }

    pub fn insert(&mut self, name: String, id: Identifier) -> CoreResult<()> {
        if self.get(&name).is_some() {
            return Err(CoreError::MalformedModel(format!(
                "duplicate child name {name:?}"
            )));
        }
        self.entries.push((name, id));
        Ok(())
    }

    pub fn remove(&mut self, id: Identifier) {
        self.entries.retain(|(_, child)| *child != id);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Identifier)> {
        self.entries.iter().map(|(n, id)| (n.as_str(), *id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A single parameter or return slot on a Method/CompositeMethod.
#[derive(Clone, Debug)]
pub struct ParamTemplate {
    pub name: String,
    pub kind: ValueKind,
    pub default: Option<Value>,
}

impl ParamTemplate {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// A composite method's suspended wait on one variable, resolved to a
/// concrete comparison at the moment the scope parked (the step's `Expr` has
/// already been evaluated against the scope's frame by the composite engine
/// by the time it lands here).
///
/// This is kept separate from `SubscriptionList` rather than folded into it
/// as another filter kind: resumes must happen strictly after all regular
/// subscription notifications for the same write finish, and the two
/// lists would need to interleave by insertion order if they shared one
/// structure. Keeping them apart makes that ordering the natural order of
/// operations instead of something `notify` has to special-case.
pub struct ActiveWait {
    pub method_id: Identifier,
    pub scope_id: ScopeId,
    pub op: CompareOp,
    pub rhs: Value,
}

pub struct FolderPayload {
    pub children: NameMap,
}

pub struct ScalarPayload {
    pub value: Value,
    pub subs: SubscriptionList,
    pub hooks: VariableHooks,
    pub active_waits: Vec<ActiveWait>,
}

impl ScalarPayload {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            subs: SubscriptionList::default(),
            hooks: VariableHooks::default(),
            active_waits: Vec::new(),
        }
    }
}

pub struct NumericPayload {
    pub value: f64,
    pub unit: Option<Unit>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub subs: SubscriptionList,
    pub hooks: VariableHooks,
    pub active_waits: Vec<ActiveWait>,
}

impl NumericPayload {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            unit: None,
            lower: None,
            upper: None,
            subs: SubscriptionList::default(),
            hooks: VariableHooks::default(),
            active_waits: Vec::new(),
        }
    }

    pub fn in_range(&self, v: f64) -> bool {
        self.lower.map(|lo| v >= lo).unwrap_or(true) && self.upper.map(|hi| v <= hi).unwrap_or(true)
    }
}

pub struct ObjectPayload {
    pub properties: NameMap,
    pub subs: SubscriptionList,
    pub hooks: VariableHooks,
}

impl ObjectPayload {
    pub fn new() -> Self {
        Self {
            properties: NameMap::default(),
            subs: SubscriptionList::default(),
            hooks: VariableHooks::default(),
        }
    }
}

pub type MethodCallback = Box<dyn FnMut(&[Value]) -> Result<Vec<Value>, CoreError> + Send>;

pub struct MethodPayload {
    pub params: Vec<ParamTemplate>,
    pub returns: Vec<ParamTemplate>,
    pub callback: Option<MethodCallback>,
    pub hooks: MethodHooks,
}

impl MethodPayload {
    pub fn new(params: Vec<ParamTemplate>, returns: Vec<ParamTemplate>) -> Self {
        Self {
            params,
            returns,
            callback: None,
            hooks: MethodHooks::default(),
        }
    }
}

pub struct CompositePayload {
    pub params: Vec<ParamTemplate>,
    pub returns: Vec<ParamTemplate>,
    pub graph: Vec<Step>,
    pub hooks: MethodHooks,
    /// Scopes currently executing against this method. The scope's own state
    /// (frame, program counter, deadline) is owned by the composite engine's
    /// registry, not here — this only tracks which scope ids belong to us, so
    /// `remove` can report them for cancellation.
    pub active_scopes: HashSet<ScopeId>,
}

impl CompositePayload {
    pub fn new(params: Vec<ParamTemplate>, returns: Vec<ParamTemplate>, graph: Vec<Step>) -> Self {
        Self {
            params,
            returns,
            graph,
            hooks: MethodHooks::default(),
            active_scopes: HashSet::new(),
        }
    }
}

pub enum NodeKind {
    Folder(FolderPayload),
    Boolean(ScalarPayload),
    StringVar(ScalarPayload),
    Numeric(NumericPayload),
    Object(ObjectPayload),
    Method(MethodPayload),
    AsyncMethod(MethodPayload),
    Composite(CompositePayload),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Folder(_) => "folder",
            NodeKind::Boolean(_) => "boolean",
            NodeKind::StringVar(_) => "string",
            NodeKind::Numeric(_) => "numeric",
            NodeKind::Object(_) => "object",
            NodeKind::Method(_) => "method",
            NodeKind::AsyncMethod(_) => "async_method",
            NodeKind::Composite(_) => "composite_method",
        }
    }

    pub fn is_variable(&self) -> bool {
        matches!(
            self,
            NodeKind::Boolean(_) | NodeKind::StringVar(_) | NodeKind::Numeric(_) | NodeKind::Object(_)
        )
    }
}

pub struct NodeRecord {
    pub id: Identifier,
    pub name: String,
    pub description: String,
    pub parent: Option<Identifier>,
    pub kind: NodeKind,
}

pub struct Tree {
    nodes: HashMap<Identifier, NodeRecord>,
    root: Identifier,
}

/// The subscriptions that fired, and which node each firing belongs to —
/// hierarchical propagation means a single write can trigger firings on
/// several ObjectVariable ancestors, not just the written node.
pub struct WriteOutcome {
    /// The value the written node held immediately before this call. Not
    /// consulted by anything in this crate — hooks already receive the
    /// before/after pair directly — but kept on the outcome for embedders
    /// calling `Tree::write` who want it for diffing or audit logging.
    pub previous: Value,
    pub firings: Vec<(Identifier, Firing)>,
    /// The scalar/numeric variables directly written by this call (as
    /// opposed to ObjectVariable ancestors that only fired because of
    /// propagation). The manager checks exactly these ids for satisfied
    /// active waits — a composite method can only wait on a concrete
    /// scalar or numeric variable, never on an ObjectVariable's composed
    /// value.
    pub written: Vec<Identifier>,
}

impl Tree {
    /// A fresh tree with just a root folder named `root_name`.
    pub fn new(root_name: impl Into<String>) -> Self {
        let id = Identifier::new();
        let mut nodes = HashMap::new();
        nodes.insert(
            id,
            NodeRecord {
                id,
                name: root_name.into(),
                description: String::new(),
                parent: None,
                kind: NodeKind::Folder(FolderPayload {
                    children: NameMap::default(),
                }),
            },
        );
        Self { nodes, root: id }
    }

    pub fn root(&self) -> Identifier {
        self.root
    }

    pub fn get(&self, id: Identifier) -> CoreResult<&NodeRecord> {
        self.nodes
            .get(&id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    pub fn get_mut(&mut self, id: Identifier) -> CoreResult<&mut NodeRecord> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    fn children_of(&self, id: Identifier) -> Option<&NameMap> {
        match &self.nodes.get(&id)?.kind {
            NodeKind::Folder(f) => Some(&f.children),
            NodeKind::Object(o) => Some(&o.properties),
            _ => None,
        }
    }

    fn children_of_mut(&mut self, id: Identifier) -> Option<&mut NameMap> {
        match &mut self.nodes.get_mut(&id)?.kind {
            NodeKind::Folder(f) => Some(&mut f.children),
            NodeKind::Object(o) => Some(&mut o.properties),
            _ => None,
        }
    }

    /// Insert a new node under `parent`. `parent` must be a Folder or an
    /// ObjectVariable (ObjectVariable children are its declared properties).
    pub fn insert(
        &mut self,
        parent: Identifier,
        name: impl Into<String>,
        description: impl Into<String>,
        kind: NodeKind,
    ) -> CoreResult<Identifier> {
        let name = name.into();
        if !self.nodes.contains_key(&parent) {
            return Err(CoreError::NotFound(parent.to_string()));
        }
        if self.children_of(parent).is_none() {
            return Err(CoreError::MalformedModel(format!(
                "{parent} cannot hold children"
            )));
        }
        let id = Identifier::new();
        self.children_of_mut(parent).unwrap().insert(name.clone(), id)?;
        self.nodes.insert(
            id,
            NodeRecord {
                id,
                name,
                description: description.into(),
                parent: Some(parent),
                kind,
            },
        );
        Ok(id)
    }

    /// Resolve a `/`-joined path. By convention the first segment names the
    /// root itself (e.g. `"plant/line1/temp"`), matching how the protocol
    /// manager's concrete scenarios address nodes.
    pub fn resolve_path(&self, path: &str) -> CoreResult<Identifier> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let Some(first) = segments.next() else {
            return Err(CoreError::NotFound(path.to_string()));
        };
        let root = self.get(self.root)?;
        if root.name != first {
            return Err(CoreError::NotFound(path.to_string()));
        }
        let mut current = self.root;
        for segment in segments {
            let children = self
                .children_of(current)
                .ok_or_else(|| CoreError::NotFound(path.to_string()))?;
            current = children
                .get(segment)
                .ok_or_else(|| CoreError::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    pub fn resolve(&self, node_ref: &NodeRef) -> CoreResult<Identifier> {
        match node_ref {
            NodeRef::Path(p) => self.resolve_path(p),
            NodeRef::Id(id) => {
                self.get(*id)?;
                Ok(*id)
            }
            NodeRef::Both(p, id) => {
                let from_path = self.resolve_path(p)?;
                self.get(*id)?;
                if from_path != *id {
                    return Err(CoreError::AddressMismatch(format!("{p} vs {id}")));
                }
                Ok(from_path)
            }
        }
    }

    pub fn path_of(&self, id: Identifier) -> String {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            let Some(record) = self.nodes.get(&cur) else {
                break;
            };
            segments.push(record.name.clone());
            current = record.parent;
        }
        segments.reverse();
        segments.join("/")
    }

    /// Compose an ObjectVariable's current value from its declared properties.
    fn compose_object(&self, id: Identifier) -> CoreResult<Value> {
        let record = self.get(id)?;
        let NodeKind::Object(payload) = &record.kind else {
            return Err(CoreError::TypeMismatch {
                path: self.path_of(id),
                expected: "object",
                got: record.kind.name(),
            });
        };
        let mut out = std::collections::BTreeMap::new();
        for (name, child_id) in payload.properties.iter() {
            out.insert(name.to_string(), self.sample_value(child_id)?);
        }
        Ok(Value::Object(out))
    }

    /// Current value of a variable node, no hooks fired. Used internally by
    /// object composition and notification, where hooks have already run (or
    /// deliberately don't apply, e.g. computing an ancestor's composed value
    /// for its own subscription pass).
    fn sample_value(&self, id: Identifier) -> CoreResult<Value> {
        let record = self.get(id)?;
        match &record.kind {
            NodeKind::Boolean(s) | NodeKind::StringVar(s) => Ok(s.value.clone()),
            NodeKind::Numeric(n) => Ok(Value::Numeric(n.value)),
            NodeKind::Object(_) => self.compose_object(id),
            other => Err(CoreError::TypeMismatch {
                path: self.path_of(id),
                expected: "variable",
                got: other.kind_name_helper(),
            }),
        }
    }

    /// Read a variable, running pre/post read hooks.
    pub fn read(&mut self, id: Identifier) -> CoreResult<Value> {
        let path = self.path_of(id);
        {
            let record = self.get_mut(id)?;
            match &mut record.kind {
                NodeKind::Boolean(s) | NodeKind::StringVar(s) => {
                    s.hooks.fire_pre_read(&path)?;
                }
                NodeKind::Numeric(n) => {
                    n.hooks.fire_pre_read(&path)?;
                }
                NodeKind::Object(o) => {
                    o.hooks.fire_pre_read(&path)?;
                }
                other => {
                    return Err(CoreError::TypeMismatch {
                        path,
                        expected: "variable",
                        got: other.kind_name_helper(),
                    })
                }
            }
        }
        let sampled = self.sample_value(id)?;
        let record = self.get_mut(id)?;
        match &mut record.kind {
            NodeKind::Boolean(s) | NodeKind::StringVar(s) => s.hooks.fire_post_read(&path, sampled),
            NodeKind::Numeric(n) => n.hooks.fire_post_read(&path, sampled),
            NodeKind::Object(o) => o.hooks.fire_post_read(&path, sampled),
            _ => unreachable!("type-checked above"),
        }
    }

    /// Write a scalar or numeric variable. Type/range checks, then
    /// pre_update (may veto), then apply, then post_update (may revert).
    /// Field-wise ObjectVariable writes go through `write_object`, not this.
    pub fn write(&mut self, id: Identifier, new_value: Value) -> CoreResult<WriteOutcome> {
        let path = self.path_of(id);
        if matches!(self.get(id)?.kind, NodeKind::Object(_)) {
            let Value::Object(fields) = new_value else {
                return Err(CoreError::TypeMismatch {
                    path,
                    expected: "object",
                    got: new_value.kind().name(),
                });
            };
            return self.write_object_fields(id, fields);
        }

        let record = self.get_mut(id)?;
        let applied = match &mut record.kind {
            NodeKind::Boolean(s) => Self::write_scalar(s, &path, new_value, ValueKind::Boolean),
            NodeKind::StringVar(s) => Self::write_scalar(s, &path, new_value, ValueKind::String),
            NodeKind::Numeric(n) => {
                let value = new_value.as_numeric().ok_or_else(|| CoreError::TypeMismatch {
                    path: path.clone(),
                    expected: "numeric",
                    got: new_value.kind().name(),
                })?;
                Self::write_numeric(n, &path, value)
            }
            other => Err(CoreError::TypeMismatch {
                path,
                expected: "variable",
                got: other.kind_name_helper(),
            }),
        }?;
        self.propagate(id, applied)
    }

    fn write_scalar(
        payload: &mut ScalarPayload,
        path: &str,
        new_value: Value,
        expected: ValueKind,
    ) -> CoreResult<Value> {
        if new_value.kind() != expected {
            return Err(CoreError::TypeMismatch {
                path: path.to_string(),
                expected: expected.name(),
                got: new_value.kind().name(),
            });
        }
        if !payload.hooks.fire_pre_update(path, &new_value)? {
            return Err(CoreError::Vetoed(path.to_string()));
        }
        let previous = payload.value.clone();
        payload.value = new_value.clone();
        if !payload.hooks.fire_post_update(path, &previous, &new_value)? {
            payload.value = previous;
            return Err(CoreError::PostVetoed(path.to_string()));
        }
        Ok(previous)
    }

    fn write_numeric(payload: &mut NumericPayload, path: &str, n: f64) -> CoreResult<Value> {
        if !payload.in_range(n) {
            return Err(CoreError::OutOfRange {
                path: path.to_string(),
                value: n,
                lo: payload.lower.unwrap_or(f64::NEG_INFINITY),
                hi: payload.upper.unwrap_or(f64::INFINITY),
            });
        }
        let new_value = Value::Numeric(n);
        if !payload.hooks.fire_pre_update(path, &new_value)? {
            return Err(CoreError::Vetoed(path.to_string()));
        }
        let previous = Value::Numeric(payload.value);
        payload.value = n;
        if !payload.hooks.fire_post_update(path, &previous, &new_value)? {
            payload.value = previous.as_numeric().unwrap();
            return Err(CoreError::PostVetoed(path.to_string()));
        }
        Ok(previous)
    }

    /// Field-wise merge for a direct ObjectVariable write: each
    /// property is written independently through the normal `write` path,
    /// there is no cross-property transaction, and a failure on one field
    /// does not roll back fields already applied.
    fn write_object_fields(
        &mut self,
        id: Identifier,
        fields: std::collections::BTreeMap<String, Value>,
    ) -> CoreResult<WriteOutcome> {
        let previous = self.compose_object(id)?;
        let property_ids: Vec<(String, Identifier)> = {
            let NodeKind::Object(payload) = &self.get(id)?.kind else {
                unreachable!("caller matched Object");
            };
            payload
                .properties
                .iter()
                .map(|(n, pid)| (n.to_string(), pid))
                .collect()
        };
        let mut all_firings = Vec::new();
        let mut all_written = Vec::new();
        let mut first_err = None;
        for (name, value) in fields {
            let Some(prop_id) = property_ids.iter().find(|(n, _)| n == &name).map(|(_, id)| *id)
            else {
                first_err.get_or_insert(CoreError::NotFound(format!(
                    "{}/{name}",
                    self.path_of(id)
                )));
                continue;
            };
            match self.write(prop_id, value) {
                Ok(outcome) => {
                    all_firings.extend(outcome.firings);
                    all_written.extend(outcome.written);
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            if all_firings.is_empty() && all_written.is_empty() {
                return Err(e);
            }
        }
        Ok(WriteOutcome {
            previous,
            firings: all_firings,
            written: all_written,
        })
    }

    /// After a scalar/numeric write is accepted: fire that node's own
    /// subscriptions, then walk up through ObjectVariable ancestors firing
    /// each one's subscriptions against its recomposed value. Folders do not
    /// participate — the walk stops the first time a parent isn't an
    /// ObjectVariable.
    fn propagate(&mut self, id: Identifier, previous: Value) -> CoreResult<WriteOutcome> {
        let mut firings = Vec::new();
        let current = self.sample_value(id)?;
        let record = self.get_mut(id)?;
        let subs = match &mut record.kind {
            NodeKind::Boolean(s) | NodeKind::StringVar(s) => &mut s.subs,
            NodeKind::Numeric(n) => &mut n.subs,
            NodeKind::Object(o) => &mut o.subs,
            _ => unreachable!("only variables reach propagate"),
        };
        for firing in subs.notify(&current) {
            firings.push((id, firing));
        }

        let mut cursor = self.get(id)?.parent;
        while let Some(parent_id) = cursor {
            let is_object = matches!(self.get(parent_id)?.kind, NodeKind::Object(_));
            if !is_object {
                break;
            }
            let composed = self.compose_object(parent_id)?;
            let NodeKind::Object(payload) = &mut self.get_mut(parent_id)?.kind else {
                unreachable!("checked above");
            };
            for firing in payload.subs.notify(&composed) {
                firings.push((parent_id, firing));
            }
            cursor = self.get(parent_id)?.parent;
        }

        Ok(WriteOutcome {
            previous,
            firings,
            written: vec![id],
        })
    }

    /// Subscribe to a variable. `current_value` seeds the filter's baseline
    /// (e.g. the zone a Range filter starts in).
    pub fn subscribe(
        &mut self,
        id: Identifier,
        subscriber_id: SubscriberId,
        filter: Filter,
    ) -> CoreResult<SubscriptionId> {
        let current = self.sample_value(id)?;
        let record = self.get_mut(id)?;
        let subs = match &mut record.kind {
            NodeKind::Boolean(s) | NodeKind::StringVar(s) => &mut s.subs,
            NodeKind::Numeric(n) => &mut n.subs,
            NodeKind::Object(o) => &mut o.subs,
            other => {
                return Err(CoreError::TypeMismatch {
                    path: self.path_of(id),
                    expected: "variable",
                    got: other.kind_name_helper(),
                })
            }
        };
        subs.add(subscriber_id, filter, Some(&current))
            .map_err(CoreError::InvalidFilter)
    }

    pub fn unsubscribe(&mut self, id: Identifier, subscription_id: SubscriptionId) -> CoreResult<()> {
        let record = self.get_mut(id)?;
        let subs = match &mut record.kind {
            NodeKind::Boolean(s) | NodeKind::StringVar(s) => &mut s.subs,
            NodeKind::Numeric(n) => &mut n.subs,
            NodeKind::Object(o) => &mut o.subs,
            other => {
                return Err(CoreError::TypeMismatch {
                    path: self.path_of(id),
                    expected: "variable",
                    got: other.kind_name_helper(),
                })
            }
        };
        subs.remove_by_handle(subscription_id);
        Ok(())
    }

    /// Install a pre/post read/update hook on a variable. Overwrites any
    /// hook previously bound to the same phase.
    pub fn bind_variable_hook(&mut self, node_ref: &NodeRef, hook: VariableHook) -> CoreResult<()> {
        let id = self.resolve(node_ref)?;
        let path = self.path_of(id);
        let record = self.get_mut(id)?;
        let hooks = match &mut record.kind {
            NodeKind::Boolean(s) | NodeKind::StringVar(s) => &mut s.hooks,
            NodeKind::Numeric(n) => &mut n.hooks,
            NodeKind::Object(o) => &mut o.hooks,
            other => {
                return Err(CoreError::TypeMismatch {
                    path,
                    expected: "variable",
                    got: other.kind_name_helper(),
                })
            }
        };
        hooks.bind(hook);
        Ok(())
    }

    /// Install a Method/AsyncMethod's invocation callback (
    /// `bind_method_callback`). Required before the method is invocable —
    /// calling an unbound method fails `UNBOUND_CALLBACK`.
    pub fn bind_method_callback(&mut self, node_ref: &NodeRef, callback: MethodCallback) -> CoreResult<()> {
        let id = self.resolve(node_ref)?;
        let path = self.path_of(id);
        let record = self.get_mut(id)?;
        match &mut record.kind {
            NodeKind::Method(p) | NodeKind::AsyncMethod(p) => {
                p.callback = Some(callback);
                Ok(())
            }
            other => Err(CoreError::TypeMismatch {
                path,
                expected: "method or async_method",
                got: other.kind_name_helper(),
            }),
        }
    }

    /// Install a Method/AsyncMethod's pre/post invocation hooks.
    pub fn bind_method_pre_invoke(&mut self, node_ref: &NodeRef, hook: PreInvoke) -> CoreResult<()> {
        self.method_hooks_mut(node_ref)?.bind_pre_invoke(hook);
        Ok(())
    }

    pub fn bind_method_post_invoke(&mut self, node_ref: &NodeRef, hook: PostInvoke) -> CoreResult<()> {
        self.method_hooks_mut(node_ref)?.bind_post_invoke(hook);
        Ok(())
    }

    fn method_hooks_mut(&mut self, node_ref: &NodeRef) -> CoreResult<&mut MethodHooks> {
        let id = self.resolve(node_ref)?;
        let path = self.path_of(id);
        let record = self.get_mut(id)?;
        match &mut record.kind {
            NodeKind::Method(p) | NodeKind::AsyncMethod(p) => Ok(&mut p.hooks),
            NodeKind::Composite(c) => Ok(&mut c.hooks),
            other => Err(CoreError::TypeMismatch {
                path,
                expected: "method, async_method, or composite_method",
                got: other.kind_name_helper(),
            }),
        }
    }

    /// Register a composite method's wait against the variable it targets.
    /// Called by the composite engine when a scope parks on a `Wait` step.
    pub fn add_active_wait(&mut self, var_id: Identifier, wait: ActiveWait) -> CoreResult<()> {
        let record = self.get_mut(var_id)?;
        match &mut record.kind {
            NodeKind::Boolean(s) | NodeKind::StringVar(s) => s.active_waits.push(wait),
            NodeKind::Numeric(n) => n.active_waits.push(wait),
            other => {
                return Err(CoreError::TypeMismatch {
                    path: self.path_of(var_id),
                    expected: "scalar or numeric variable",
                    got: other.kind_name_helper(),
                })
            }
        }
        Ok(())
    }

    /// Evaluate `var_id`'s active waits against its current value, draining
    /// and returning the ones that are now satisfied. Called by the manager
    /// strictly after `propagate`'s subscription pass for the same write
    /// completes — this is a distinct, later phase, not part of
    /// `propagate` itself.
    pub fn drain_satisfied_waits(&mut self, var_id: Identifier) -> CoreResult<Vec<ActiveWait>> {
        let current = self.sample_value(var_id)?;
        let record = self.get_mut(var_id)?;
        let waits = match &mut record.kind {
            NodeKind::Boolean(s) | NodeKind::StringVar(s) => std::mem::take(&mut s.active_waits),
            NodeKind::Numeric(n) => std::mem::take(&mut n.active_waits),
            _ => return Ok(Vec::new()),
        };
        let (satisfied, still_waiting): (Vec<_>, Vec<_>) =
            waits.into_iter().partition(|w| w.op.evaluate(&current, &w.rhs));
        let record = self.get_mut(var_id)?;
        match &mut record.kind {
            NodeKind::Boolean(s) | NodeKind::StringVar(s) => s.active_waits = still_waiting,
            NodeKind::Numeric(n) => n.active_waits = still_waiting,
            _ => {}
        }
        Ok(satisfied)
    }

    /// Cascade-delete `id` and every descendant. Returns the
    /// `(method_id, scope_id)` pairs of composite scopes that were depending
    /// on anything removed, so the caller (composite engine) can cancel them
    /// with `DEPENDENCY_LOST`.
    pub fn remove(&mut self, id: Identifier) -> CoreResult<Vec<(Identifier, ScopeId)>> {
        let mut to_remove = vec![id];
        let mut frontier = vec![id];
        while let Some(cur) = frontier.pop() {
            if let Some(children) = self.children_of(cur) {
                for (_, child) in children.iter() {
                    to_remove.push(child);
                    frontier.push(child);
                }
            }
        }

        let mut dependents = Vec::new();
        for &victim in &to_remove {
            if let Some(record) = self.nodes.get(&victim) {
                match &record.kind {
                    NodeKind::Boolean(s) | NodeKind::StringVar(s) => {
                        for w in &s.active_waits {
                            dependents.push((w.method_id, w.scope_id));
                        }
                    }
                    NodeKind::Numeric(n) => {
                        for w in &n.active_waits {
                            dependents.push((w.method_id, w.scope_id));
                        }
                    }
                    NodeKind::Composite(c) => {
                        for scope_id in &c.active_scopes {
                            dependents.push((victim, *scope_id));
                        }
                    }
                    _ => {}
                }
            }
        }

        if let Some(parent_id) = self.nodes.get(&id).and_then(|r| r.parent) {
            if let Some(siblings) = self.children_of_mut(parent_id) {
                siblings.remove(id);
            }
        }
        for victim in to_remove {
            self.nodes.remove(&victim);
        }
        Ok(dependents)
    }
}

impl NodeKind {
    fn kind_name_helper(&self) -> &'static str {
        self.name()
    }
}
