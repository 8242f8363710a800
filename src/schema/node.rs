//! Live node tree.
//!
//! Schema elements become nodes in an append-only arena addressed by index;
//! each node stores its parent index, so the tree carries no back-pointer
//! cycles and node lifetime is that of the arena. Group nodes also index
//! their child groups by class tag and by name, which is what link-target
//! resolution walks.

use crate::container::{FieldHandle, GroupHandle};
use std::collections::HashMap;

/// Index of a node in its arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// What a node is bound to.
pub enum NodeKind {
    Group,
    Field,
}

/// One schema element bound to a container object.
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
    pub name: String,
    /// NeXus-class-like type tag; groups only.
    pub class: Option<String>,
    pub children: Vec<NodeId>,
    pub group: Option<GroupHandle>,
    pub field: Option<FieldHandle>,
    pub doc: Option<String>,
    /// Child groups keyed by class tag; link targets address groups this way.
    pub groups_by_class: HashMap<String, NodeId>,
    /// Child groups keyed by name.
    pub groups_by_name: HashMap<String, NodeId>,
}

/// Append-only arena of nodes.
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    /// An arena whose root node is bound to the container's root group.
    pub fn new(root: GroupHandle) -> Self {
        NodeArena {
            nodes: vec![Node {
                id: NodeId(0),
                parent: None,
                kind: NodeKind::Group,
                name: String::new(),
                class: None,
                children: Vec::new(),
                group: Some(root),
                field: None,
                doc: None,
                groups_by_class: HashMap::new(),
                groups_by_name: HashMap::new(),
            }],
        }
    }

    /// The root node.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Append a group node under `parent` and index it by class and name.
    pub fn add_group(
        &mut self,
        parent: NodeId,
        name: &str,
        class: &str,
        handle: GroupHandle,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            parent: Some(parent),
            kind: NodeKind::Group,
            name: name.to_string(),
            class: Some(class.to_string()),
            children: Vec::new(),
            group: Some(handle),
            field: None,
            doc: None,
            groups_by_class: HashMap::new(),
            groups_by_name: HashMap::new(),
        });
        let parent_node = self.get_mut(parent);
        parent_node.children.push(id);
        parent_node
            .groups_by_class
            .insert(class.to_string(), id);
        parent_node.groups_by_name.insert(name.to_string(), id);
        id
    }

    /// Append a field node under `parent`.
    pub fn add_field(&mut self, parent: NodeId, name: &str, handle: FieldHandle) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            parent: Some(parent),
            kind: NodeKind::Field,
            name: name.to_string(),
            class: None,
            children: Vec::new(),
            group: None,
            field: Some(handle),
            doc: None,
            groups_by_class: HashMap::new(),
            groups_by_name: HashMap::new(),
        });
        self.get_mut(parent).children.push(id);
        id
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: the arena is created with its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
