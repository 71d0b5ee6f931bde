//! Path recording: discovering which fields, keys, and iterations a
//! selector depends on without touching real data.
//!
//! A selector runs against a [`PathProbe`]; every access materializes a
//! child probe (memoized per step) instead of a value. The result is a
//! pure decision tree used to build subscription nodes.

use std::cell::RefCell;
use std::rc::Rc;

use trellis_core::Key;

/// One step of a dependency path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    /// Named record field.
    Field(String),
    /// Sequence element by position.
    Index(usize),
    /// Map entry by literal key.
    MapKey(Key),
    /// Iterate the whole collection.
    Each,
    /// Any property may change.
    Any,
}

/// The recorded dependency tree of one selector.
#[derive(Debug, Clone, PartialEq)]
pub struct PathRecord {
    pub root: PathNode,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PathNode {
    pub children: Vec<(Step, PathNode)>,
}

impl PathNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

impl PathRecord {
    /// Appends a wildcard step under every leaf, turning "select this
    /// sub-object" into "any of this sub-object's own properties".
    pub fn with_any_leaves(mut self) -> PathRecord {
        fn extend(node: &mut PathNode) {
            if node.children.is_empty() {
                node.children.push((Step::Any, PathNode::default()));
            } else {
                for (_, child) in &mut node.children {
                    extend(child);
                }
            }
        }
        extend(&mut self.root);
        self
    }
}

// Probe nodes live in a shared arena so child probes can keep extending
// the tree after the parent probe was moved or dropped.
#[derive(Debug, Default)]
struct ProbeTree {
    nodes: Vec<ProbeNode>,
}

#[derive(Debug, Default)]
struct ProbeNode {
    children: Vec<(Step, usize)>,
}

impl ProbeTree {
    fn child(&mut self, parent: usize, step: Step) -> usize {
        if let Some((_, idx)) = self.nodes[parent].children.iter().find(|(s, _)| *s == step) {
            return *idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(ProbeNode::default());
        self.nodes[parent].children.push((step, idx));
        idx
    }

    fn freeze(&self, index: usize) -> PathNode {
        PathNode {
            children: self.nodes[index]
                .children
                .iter()
                .map(|(step, idx)| (step.clone(), self.freeze(*idx)))
                .collect(),
        }
    }
}

/// Synthetic recording target handed to selector functions.
#[derive(Debug, Clone)]
pub struct PathProbe {
    tree: Rc<RefCell<ProbeTree>>,
    node: usize,
}

impl PathProbe {
    fn step(&self, step: Step) -> PathProbe {
        let node = self.tree.borrow_mut().child(self.node, step);
        PathProbe {
            tree: Rc::clone(&self.tree),
            node,
        }
    }

    /// Records a named-field access.
    pub fn field(&self, name: &str) -> PathProbe {
        self.step(Step::Field(name.to_owned()))
    }

    /// Records a sequence-element access.
    pub fn index(&self, index: usize) -> PathProbe {
        self.step(Step::Index(index))
    }

    /// Records a map lookup by literal key. Keys are literal by
    /// construction; a probe cannot be turned into a `Key`.
    pub fn entry(&self, key: impl Into<Key>) -> PathProbe {
        self.step(Step::MapKey(key.into()))
    }

    /// Records an iterate-whole-collection dependency.
    pub fn each(&self) -> PathProbe {
        self.step(Step::Each)
    }

    /// Records an any-property-may-change dependency.
    pub fn any(&self) -> PathProbe {
        self.step(Step::Any)
    }
}

/// Runs `selector` against a fresh probe and returns the dependency tree
/// it touched. No real data is accessed.
pub fn record_path(selector: impl FnOnce(&PathProbe)) -> PathRecord {
    let tree = Rc::new(RefCell::new(ProbeTree {
        nodes: vec![ProbeNode::default()],
    }));
    let probe = PathProbe {
        tree: Rc::clone(&tree),
        node: 0,
    };
    selector(&probe);
    let root = tree.borrow().freeze(0);
    PathRecord { root }
}
