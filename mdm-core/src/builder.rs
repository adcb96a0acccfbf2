//! In-crate tree construction helpers.
//!
//! A textual/declarative tree loader is an external collaborator out of
//! scope for this crate — only the in-memory model it would produce is
//! defined here, via `load_tree`. `FolderBuilder` is the in-process
//! substitute an embedder (or this crate's own demo binary) uses to build a
//! tree by hand, the way the engine this crate is modeled on exposes a
//! fluent builder over its own process-definition types rather than parsing
//! one from text.

use crate::errors::CoreResult;
use crate::ids::Identifier;
use crate::tree::{
    CompositePayload, MethodPayload, NodeKind, NumericPayload, ObjectPayload, ParamTemplate,
    ScalarPayload, Tree,
};
use crate::value::Value;
use crate::steps::Step;

/// Fluent attachment helpers scoped to one folder or object node. Holds no
/// state of its own beyond the id it was built around — every call borrows
/// the tree it's wrapping.
pub struct FolderBuilder<'a> {
    tree: &'a mut Tree,
    parent: Identifier,
}

impl<'a> FolderBuilder<'a> {
    pub fn new(tree: &'a mut Tree, parent: Identifier) -> Self {
        Self { tree, parent }
    }

    pub fn root(tree: &'a mut Tree) -> Self {
        let parent = tree.root();
        Self { tree, parent }
    }

    pub fn attach_folder(&mut self, name: &str, description: &str) -> CoreResult<Identifier> {
        self.tree.insert(
            self.parent,
            name,
            description,
            NodeKind::Folder(crate::tree::FolderPayload {
                children: Default::default(),
            }),
        )
    }

    pub fn attach_boolean(
        &mut self,
        name: &str,
        description: &str,
        initial: bool,
    ) -> CoreResult<Identifier> {
        self.tree.insert(
            self.parent,
            name,
            description,
            NodeKind::Boolean(ScalarPayload::new(Value::Boolean(initial))),
        )
    }

    pub fn attach_string(
        &mut self,
        name: &str,
        description: &str,
        initial: impl Into<String>,
    ) -> CoreResult<Identifier> {
        self.tree.insert(
            self.parent,
            name,
            description,
            NodeKind::StringVar(ScalarPayload::new(Value::String(initial.into()))),
        )
    }

    pub fn attach_numeric(
        &mut self,
        name: &str,
        description: &str,
        initial: f64,
        bounds: Option<(f64, f64)>,
    ) -> CoreResult<Identifier> {
        let mut payload = NumericPayload::new(initial);
        if let Some((lo, hi)) = bounds {
            payload.lower = Some(lo);
            payload.upper = Some(hi);
        }
        self.tree
            .insert(self.parent, name, description, NodeKind::Numeric(payload))
    }

    pub fn attach_object(&mut self, name: &str, description: &str) -> CoreResult<Identifier> {
        self.tree.insert(
            self.parent,
            name,
            description,
            NodeKind::Object(ObjectPayload::new()),
        )
    }

    pub fn attach_method(
        &mut self,
        name: &str,
        description: &str,
        params: Vec<ParamTemplate>,
        returns: Vec<ParamTemplate>,
    ) -> CoreResult<Identifier> {
        self.tree.insert(
            self.parent,
            name,
            description,
            NodeKind::Method(MethodPayload::new(params, returns)),
        )
    }

    pub fn attach_async_method(
        &mut self,
        name: &str,
        description: &str,
        params: Vec<ParamTemplate>,
        returns: Vec<ParamTemplate>,
    ) -> CoreResult<Identifier> {
        self.tree.insert(
            self.parent,
            name,
            description,
            NodeKind::AsyncMethod(MethodPayload::new(params, returns)),
        )
    }

    pub fn attach_composite(
        &mut self,
        name: &str,
        description: &str,
        params: Vec<ParamTemplate>,
        returns: Vec<ParamTemplate>,
        graph: Vec<Step>,
    ) -> CoreResult<Identifier> {
        self.tree.insert(
            self.parent,
            name,
            description,
            NodeKind::Composite(CompositePayload::new(params, returns, graph)),
        )
    }

    /// Re-scope this builder onto a child folder/object already attached,
    /// for building out nested structure without re-resolving paths.
    pub fn into_child(self, child: Identifier) -> FolderBuilder<'a> {
        FolderBuilder {
            tree: self.tree,
            parent: child,
        }
    }
}

/// Stand-in for an external declarative `load_tree(definition)` embedder
/// entry point: the concrete textual format is out of scope, so this just
/// documents the contract an embedder's own loader should honor — a fresh,
/// empty tree the caller then populates via `FolderBuilder`, with duplicate
/// names/ids failing `MALFORMED_MODEL` exactly as `Tree::insert` already
/// enforces.
pub fn load_tree(root_name: impl Into<String>) -> Tree {
    Tree::new(root_name)
}
