//! Descriptor hierarchy stored as an arena.
//!
//! Every node of a dataset lives in one flat table and refers to its parent
//! and children by [`NodeId`]. Descriptors never change once created; lazy
//! expansion only fills in child slots that were empty.

use std::collections::HashMap;

use pointstream_decode::HierarchyRecord;
use serde::{Deserialize, Serialize};

use crate::bounds::Aabb;
use crate::error::LoadError;

/// Name of every dataset root.
pub const ROOT_NAME: &str = "r";

/// Index of a node in its dataset's hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// The dataset root.
    pub const ROOT: NodeId = NodeId(0);

    /// Position in the arena.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// Shape of a dataset's spatial subdivision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeShape {
    /// Eight children per node, split at the centre on every axis.
    Octree,
    /// Two children per node, split at the centre of the longest axis.
    KdTree,
}

impl TreeShape {
    /// Maximum number of children per node.
    #[must_use]
    pub fn arity(self) -> u8 {
        match self {
            TreeShape::Octree => 8,
            TreeShape::KdTree => 2,
        }
    }

    /// Bounds of child `index` of a node with bounds `parent`.
    #[must_use]
    pub fn child_bounds(self, parent: &Aabb, index: u8) -> Aabb {
        match self {
            TreeShape::Octree => parent.octant(index),
            TreeShape::KdTree => parent.half(index),
        }
    }

    /// Nominal spacing one level below a node with spacing `spacing`.
    #[must_use]
    pub fn child_spacing(self, spacing: f64) -> f64 {
        match self {
            TreeShape::Octree => spacing * 0.5,
            // Halving the volume shrinks the spacing by the cube root of two.
            TreeShape::KdTree => spacing / 2.0_f64.cbrt(),
        }
    }
}

/// Where a node's tile payload lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PayloadLocation {
    /// A byte range inside the dataset's single data file.
    Range {
        /// First byte.
        offset: u64,
        /// Number of bytes.
        size: u64,
    },
    /// A file relative to the dataset's base location.
    Path(String),
}

impl PayloadLocation {
    /// Default per-node file for a node name.
    #[must_use]
    pub fn for_name(name: &str) -> Self {
        PayloadLocation::Path(format!("{name}.bin"))
    }
}

/// Static metadata for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescriptor {
    /// Path from the root, e.g. `"r306"`.
    pub name: String,
    /// Depth below the root.
    pub level: u32,
    /// Slot in the parent's child table.
    pub index: u8,
    /// Node bounds.
    pub bounds: Aabb,
    /// Nominal point spacing at this level.
    pub spacing: f64,
    /// Points stored in this node.
    pub point_count: u64,
    /// Bit `i` is set when child `i` exists.
    pub child_mask: u8,
    /// Payload location.
    pub payload: PayloadLocation,
    parent: Option<NodeId>,
    children: [Option<NodeId>; 8],
}

impl NodeDescriptor {
    /// Parent node, `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Child in slot `index`, if it has been materialized.
    #[must_use]
    pub fn child(&self, index: u8) -> Option<NodeId> {
        self.children.get(usize::from(index)).copied().flatten()
    }

    /// Materialized children in slot order.
    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.iter().filter_map(|c| *c)
    }

    /// Whether the hierarchy index reports any children.
    #[must_use]
    pub fn has_children(&self) -> bool {
        self.child_mask != 0
    }
}

/// Metadata for one child, as produced by a hierarchy source.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildDescriptor {
    /// Child slot.
    pub index: u8,
    /// Points stored in the child.
    pub point_count: u64,
    /// Which of the child's own children exist.
    pub child_mask: u8,
    /// Payload location; derived from the name when absent.
    pub payload: Option<PayloadLocation>,
    /// Bounds; derived from the parent when absent.
    pub bounds: Option<Aabb>,
}

impl ChildDescriptor {
    /// Child with derived bounds and payload.
    #[must_use]
    pub fn new(index: u8, point_count: u64, child_mask: u8) -> Self {
        Self {
            index,
            point_count,
            child_mask,
            payload: None,
            bounds: None,
        }
    }
}

/// Whether a node's children have been materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expansion {
    /// All children known (or there are none).
    Complete,
    /// Children exist but their descriptors have not been fetched.
    Pending,
    /// A hierarchy fetch is in flight.
    Loading,
}

/// The descriptor tree of one dataset.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    shape: TreeShape,
    nodes: Vec<NodeDescriptor>,
    expansion: Vec<Expansion>,
    by_name: HashMap<String, NodeId>,
}

impl Hierarchy {
    /// Create a hierarchy holding only the root.
    #[must_use]
    pub fn new(
        shape: TreeShape,
        bounds: Aabb,
        spacing: f64,
        point_count: u64,
        child_mask: u8,
    ) -> Self {
        let root = NodeDescriptor {
            name: ROOT_NAME.to_string(),
            level: 0,
            index: 0,
            bounds,
            spacing,
            point_count,
            child_mask,
            payload: PayloadLocation::for_name(ROOT_NAME),
            parent: None,
            children: [None; 8],
        };
        let mut hierarchy = Self {
            shape,
            nodes: Vec::new(),
            expansion: Vec::new(),
            by_name: HashMap::new(),
        };
        hierarchy.push(root);
        hierarchy
    }

    /// Build a hierarchy from a breadth-first index chunk rooted at `"r"`.
    ///
    /// Nodes whose children are missing from the chunk stay
    /// [`Expansion::Pending`] and can be expanded later.
    ///
    /// # Errors
    ///
    /// Returns an error if the records do not start at the root, name a
    /// child the parent's mask does not announce, or exceed the tree arity.
    pub fn from_records(
        shape: TreeShape,
        bounds: Aabb,
        spacing: f64,
        records: &[HierarchyRecord],
    ) -> Result<Self, LoadError> {
        let Some((root, rest)) = records.split_first() else {
            return Err(LoadError::Hierarchy {
                message: "hierarchy index is empty".to_string(),
            });
        };
        if root.name != ROOT_NAME {
            return Err(LoadError::Hierarchy {
                message: format!("first record is {:?}, expected the root", root.name),
            });
        }

        let mut hierarchy = Self::new(
            shape,
            bounds,
            spacing,
            u64::from(root.point_count),
            root.child_mask,
        );
        for record in rest {
            if record.name.len() < 2 || !record.name.is_ascii() {
                return Err(LoadError::Hierarchy {
                    message: format!("malformed node name {:?}", record.name),
                });
            }
            let (parent_name, digit) = record.name.split_at(record.name.len() - 1);
            let index = digit.as_bytes()[0].wrapping_sub(b'0');
            let Some(&parent) = hierarchy.by_name.get(parent_name) else {
                return Err(LoadError::Hierarchy {
                    message: format!("record {:?} has no parent", record.name),
                });
            };
            let child =
                ChildDescriptor::new(index, u64::from(record.point_count), record.child_mask);
            hierarchy.insert_child(parent, child)?;
        }

        for i in 0..hierarchy.nodes.len() {
            let node = &hierarchy.nodes[i];
            let present = node.children().count();
            let announced = node.child_mask.count_ones() as usize;
            hierarchy.expansion[i] = if present == announced {
                Expansion::Complete
            } else if present == 0 {
                Expansion::Pending
            } else {
                return Err(LoadError::Hierarchy {
                    message: format!("node {:?} lists only some of its children", node.name),
                });
            };
        }

        Ok(hierarchy)
    }

    fn push(&mut self, node: NodeDescriptor) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.expansion.push(if node.has_children() {
            Expansion::Pending
        } else {
            Expansion::Complete
        });
        self.by_name.insert(node.name.clone(), id);
        self.nodes.push(node);
        id
    }

    /// Check that `index` is a free slot announced by the parent's mask.
    /// `claimed` holds slots already taken by the same batch.
    fn check_slot(&self, parent: NodeId, index: u8, claimed: u8) -> Result<(), LoadError> {
        let p = &self.nodes[parent.index()];
        if index >= self.shape.arity() || p.child_mask & (1 << index) == 0 {
            return Err(LoadError::Hierarchy {
                message: format!("node {:?} has no child slot {index}", p.name),
            });
        }
        if p.child(index).is_some() || claimed & (1 << index) != 0 {
            return Err(LoadError::Hierarchy {
                message: format!("node {:?} child {index} already exists", p.name),
            });
        }
        Ok(())
    }

    fn insert_child(
        &mut self,
        parent: NodeId,
        child: ChildDescriptor,
    ) -> Result<NodeId, LoadError> {
        self.check_slot(parent, child.index, 0)?;
        let shape = self.shape;
        let p = &self.nodes[parent.index()];

        let mut name = p.name.clone();
        name.push(char::from(b'0' + child.index));
        let payload = child
            .payload
            .unwrap_or_else(|| PayloadLocation::for_name(&name));
        let descriptor = NodeDescriptor {
            level: p.level + 1,
            index: child.index,
            bounds: child
                .bounds
                .unwrap_or_else(|| shape.child_bounds(&p.bounds, child.index)),
            spacing: shape.child_spacing(p.spacing),
            point_count: child.point_count,
            child_mask: child.child_mask,
            payload,
            parent: Some(parent),
            children: [None; 8],
            name,
        };

        let id = self.push(descriptor);
        self.nodes[parent.index()].children[usize::from(child.index)] = Some(id);
        Ok(id)
    }

    /// Materialize the children of a pending node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node does not exist, or a child is not
    /// announced by the node's mask or already exists. Nothing is inserted
    /// on error.
    pub fn expand(
        &mut self,
        id: NodeId,
        children: Vec<ChildDescriptor>,
    ) -> Result<Vec<NodeId>, LoadError> {
        if self.get(id).is_none() {
            return Err(LoadError::Hierarchy {
                message: format!("node {} does not exist", id.index()),
            });
        }
        let mut claimed = 0u8;
        for child in &children {
            self.check_slot(id, child.index, claimed)?;
            claimed |= 1 << child.index;
        }

        let mut ids = Vec::with_capacity(children.len());
        for child in children {
            ids.push(self.insert_child(id, child)?);
        }
        self.expansion[id.index()] = Expansion::Complete;
        Ok(ids)
    }

    /// Tree shape.
    #[must_use]
    pub fn shape(&self) -> TreeShape {
        self.shape
    }

    /// Number of materialized nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the hierarchy is empty. Always false: the root exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&NodeDescriptor> {
        self.nodes.get(id.index())
    }

    /// Look up a node by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    /// Expansion state of a node.
    #[must_use]
    pub fn expansion(&self, id: NodeId) -> Expansion {
        self.expansion
            .get(id.index())
            .copied()
            .unwrap_or(Expansion::Complete)
    }

    pub(crate) fn set_expansion(&mut self, id: NodeId, expansion: Expansion) {
        if let Some(slot) = self.expansion.get_mut(id.index()) {
            *slot = expansion;
        }
    }

    /// Node ids in arena order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).filter_map(|i| u32::try_from(i).ok().map(NodeId))
    }

    /// `id` and all its descendants, children before parents.
    #[must_use]
    pub fn post_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((node, visited)) = stack.pop() {
            if visited {
                out.push(node);
                continue;
            }
            stack.push((node, true));
            if let Some(descriptor) = self.get(node) {
                stack.extend(descriptor.children().map(|c| (c, false)));
            }
        }
        out
    }
}
