// Statement tree storage, navigation and projections
use crate::model::{Node, NodeType};
use crate::{Error, Result, DEFAULT_INDENT_SIZE};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::fmt;

/// Handle to a node stored in a [`Hierarchy`]. Only meaningful for the
/// hierarchy that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

impl NodeId {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub const MAX_CHILDREN_WARNING: usize = 50;
pub const DEEP_HIERARCHY_WARNING: u32 = 10;
pub const MIN_NODES_FOR_VALID_HIERARCHY: usize = 2;

// ============================================================================
// Typing rules
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingRules {
    pub abstract_suffix: String,
    pub total_patterns: Vec<String>,
    pub member_suffix: String,
    pub axis_suffixes: Vec<String>,
}

impl Default for TypingRules {
    fn default() -> Self {
        Self {
            abstract_suffix: "Abstract".to_string(),
            total_patterns: ["total", "sum", "net", "aggregate"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            member_suffix: "Member".to_string(),
            axis_suffixes: vec!["Axis".to_string(), "Domain".to_string()],
        }
    }
}

impl TypingRules {
    pub fn with_abstract_suffix(mut self, suffix: &str) -> Self {
        self.abstract_suffix = suffix.to_string();
        self
    }

    pub fn with_total_patterns(mut self, patterns: &[&str]) -> Self {
        self.total_patterns = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn is_abstract(&self, node: &Node) -> bool {
        if node.node_type == NodeType::Abstract || node.abstract_flag == Some(true) {
            return true;
        }
        if node.concept.ends_with(self.abstract_suffix.as_str()) {
            return true;
        }
        node.value.is_none() && node.abstract_flag != Some(false)
    }

    pub fn is_total(&self, node: &Node) -> bool {
        node.node_type == NodeType::Total || self.text_is_total(&node.label)
    }

    pub fn text_is_total(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.total_patterns
            .iter()
            .any(|p| lower.contains(p.to_lowercase().as_str()))
    }

    /// Node type guessed from a concept name alone.
    pub fn classify_concept(&self, concept: &str) -> NodeType {
        let local = local_name(concept);
        let lower = local.to_lowercase();

        if lower.ends_with(&self.abstract_suffix.to_lowercase()) {
            return NodeType::Abstract;
        }
        if self.axis_suffixes.iter().any(|s| local.ends_with(s.as_str())) {
            return NodeType::Abstract;
        }
        if !self.member_suffix.is_empty() && local.ends_with(self.member_suffix.as_str()) {
            return NodeType::DimensionMember;
        }
        if self.text_is_total(&lower) {
            return NodeType::Total;
        }
        NodeType::LineItem
    }
}

fn local_name(concept: &str) -> &str {
    match concept.rsplit_once(':') {
        Some((_, local)) => local,
        None => concept,
    }
}

// ============================================================================
// Hierarchy arena
// ============================================================================

/// A single statement tree. Nodes live in an arena owned by the hierarchy;
/// each node's `children` list is the owning edge and `parent` is a plain
/// index used only for navigation.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    nodes: Vec<Node>,
    root: NodeId,
    rules: TypingRules,
}

impl Hierarchy {
    pub fn new(root: Node) -> Self {
        Self::with_rules(root, TypingRules::default())
    }

    pub fn with_rules(mut root: Node, rules: TypingRules) -> Self {
        root.parent = None;
        root.children.clear();
        root.depth = 0;
        Self {
            nodes: vec![root],
            root: NodeId(0),
            rules,
        }
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn rules(&self) -> &TypingRules {
        &self.rules
    }

    pub fn set_rules(&mut self, rules: TypingRules) {
        self.rules = rules;
    }

    /// Number of nodes reachable from the root.
    pub fn node_count(&self) -> usize {
        self.preorder(self.root).count()
    }

    /// Number of nodes stored, including detached ones.
    pub fn arena_len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    /// # Panics
    /// If `id` was not issued by this hierarchy.
    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// # Panics
    /// If `id` was not issued by this hierarchy.
    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Stores a detached node and returns its handle.
    pub fn insert(&mut self, mut node: Node) -> NodeId {
        node.parent = None;
        node.children.clear();
        node.depth = 0;
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Attaches `child` under `parent`. Rejects self-attachment and any
    /// attachment that would make a node its own ancestor; on rejection the
    /// tree is unchanged. A child that already has a parent is moved.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.check(parent)?;
        self.check(child)?;

        if parent == child {
            return Err(Error::SelfAttachment(self.nodes[child.0].concept.to_string()));
        }
        if self.is_ancestor_or_self(child, parent) {
            return Err(Error::Cycle {
                parent: self.nodes[parent.0].concept.to_string(),
                child: self.nodes[child.0].concept.to_string(),
            });
        }

        if let Some(old_parent) = self.nodes[child.0].parent {
            self.nodes[old_parent.0].children.retain(|c| *c != child);
        }

        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
        let depth = self.nodes[parent.0].depth + 1;
        self.rebase_depth(child, depth);
        Ok(())
    }

    /// Detaches `child` from `parent`. Returns whether it was present.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        if !self.contains(parent) || !self.contains(child) {
            return false;
        }
        let children = &mut self.nodes[parent.0].children;
        match children.iter().position(|c| *c == child) {
            Some(idx) => {
                children.remove(idx);
                self.nodes[child.0].parent = None;
                self.rebase_depth(child, 0);
                true
            }
            None => false,
        }
    }

    fn check(&self, id: NodeId) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("node {}", id)))
        }
    }

    /// Walks upward from `start`; true if `candidate` is on the way.
    fn is_ancestor_or_self(&self, candidate: NodeId, start: NodeId) -> bool {
        let mut current = Some(start);
        while let Some(id) = current {
            if id == candidate {
                return true;
            }
            current = self.nodes[id.0].parent;
        }
        false
    }

    fn rebase_depth(&mut self, top: NodeId, depth: u32) {
        let mut stack = vec![(top, depth)];
        while let Some((id, d)) = stack.pop() {
            self.nodes[id.0].depth = d;
            for child in &self.nodes[id.0].children {
                stack.push((*child, d + 1));
            }
        }
    }

    /// Orders every node's children by (order, label). Source taxonomies
    /// reuse order values across siblings, hence the label tie-break.
    pub fn sort_children(&mut self) {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let mut children = std::mem::take(&mut self.nodes[id.0].children);
            let nodes = &self.nodes;
            children.sort_by(|a, b| {
                let (a, b) = (&nodes[a.0], &nodes[b.0]);
                a.order
                    .total_cmp(&b.order)
                    .then_with(|| a.label.cmp(&b.label))
            });
            stack.extend(children.iter().copied());
            self.nodes[id.0].children = children;
        }
    }

    // ------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------

    #[inline]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    #[inline]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            next: self.nodes[id.0].parent,
        }
    }

    pub fn siblings(&self, id: NodeId) -> Vec<NodeId> {
        match self.nodes[id.0].parent {
            Some(parent) => self.nodes[parent.0]
                .children
                .iter()
                .copied()
                .filter(|c| *c != id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Nodes from the topmost ancestor down to `id`.
    pub fn path(&self, id: NodeId) -> Vec<NodeId> {
        let mut path: Vec<NodeId> = self.ancestors(id).collect();
        path.reverse();
        path.push(id);
        path
    }

    pub fn path_labels(&self, id: NodeId) -> Vec<&str> {
        self.path(id)
            .into_iter()
            .map(|n| self.nodes[n.0].label.as_str())
            .collect()
    }

    pub fn is_abstract(&self, id: NodeId) -> bool {
        self.rules.is_abstract(&self.nodes[id.0])
    }

    pub fn is_total(&self, id: NodeId) -> bool {
        self.rules.is_total(&self.nodes[id.0])
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    pub fn preorder(&self, start: NodeId) -> PreOrder<'_> {
        PreOrder {
            tree: self,
            stack: vec![start],
        }
    }

    pub fn postorder(&self, start: NodeId) -> PostOrder<'_> {
        PostOrder {
            tree: self,
            stack: vec![(start, false)],
        }
    }

    pub fn level_order(&self, start: NodeId) -> LevelOrder<'_> {
        LevelOrder {
            tree: self,
            queue: VecDeque::from([start]),
        }
    }

    pub fn leaves(&self, start: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.preorder(start)
            .filter(move |id| self.nodes[id.0].children.is_empty())
    }

    pub fn with_values(&self, start: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.preorder(start)
            .filter(move |id| self.nodes[id.0].value.is_some())
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    pub fn find_by_concept(&self, concept: &str) -> Option<NodeId> {
        self.preorder(self.root)
            .find(|id| self.nodes[id.0].concept == concept)
    }

    pub fn find_by_label(&self, label: &str, case_sensitive: bool) -> Option<NodeId> {
        self.preorder(self.root)
            .find(|id| label_matches(&self.nodes[id.0].label, label, case_sensitive))
    }

    pub fn find_all_by_label(&self, label: &str, case_sensitive: bool) -> Vec<NodeId> {
        self.preorder(self.root)
            .filter(|id| label_matches(&self.nodes[id.0].label, label, case_sensitive))
            .collect()
    }

    pub fn find_by_label_contains(&self, text: &str) -> Vec<NodeId> {
        let needle = text.to_lowercase();
        self.preorder(self.root)
            .filter(|id| self.nodes[id.0].label.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn find_all_by_type(&self, node_type: NodeType) -> Vec<NodeId> {
        self.preorder(self.root)
            .filter(|id| self.nodes[id.0].node_type == node_type)
            .collect()
    }

    pub fn find_totals(&self) -> Vec<NodeId> {
        self.preorder(self.root).filter(|id| self.is_total(*id)).collect()
    }

    pub fn nodes_at_depth(&self, depth: u32) -> Vec<NodeId> {
        self.preorder(self.root)
            .filter(|id| self.nodes[id.0].depth == depth)
            .collect()
    }

    /// Line items carrying a value.
    pub fn line_items(&self) -> Vec<NodeId> {
        self.preorder(self.root)
            .filter(|id| {
                let node = &self.nodes[id.0];
                node.node_type == NodeType::LineItem && node.value.is_some()
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    #[inline]
    pub fn child_count(&self, id: NodeId) -> usize {
        self.nodes[id.0].children.len()
    }

    pub fn descendant_count(&self, id: NodeId) -> usize {
        self.preorder(id).count() - 1
    }

    pub fn leaf_count(&self, id: NodeId) -> usize {
        self.leaves(id).count()
    }

    pub fn max_depth(&self, id: NodeId) -> u32 {
        self.preorder(id)
            .map(|n| self.nodes[n.0].depth)
            .max()
            .unwrap_or(0)
    }

    /// Sum of the values present in the subtree; `None` when no node in it
    /// carries a value.
    pub fn subtree_value_sum(&self, id: NodeId) -> Option<f64> {
        self.with_values(id)
            .filter_map(|n| self.nodes[n.0].value)
            .fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
    }

    /// Structural sanity report: `(is_valid, messages)`.
    pub fn validate(&self) -> (bool, Vec<String>) {
        let mut messages = Vec::new();
        let mut is_valid = true;

        let count = self.node_count();
        if count < MIN_NODES_FOR_VALID_HIERARCHY {
            messages.push(format!("Too few nodes: {}", count));
            is_valid = false;
        }

        for id in self.preorder(self.root) {
            let node = &self.nodes[id.0];
            if node.children.len() > MAX_CHILDREN_WARNING {
                messages.push(format!(
                    "Node '{}' has {} children (exceeds {})",
                    node.label,
                    node.children.len(),
                    MAX_CHILDREN_WARNING
                ));
            }
            if self.is_total(id) && node.children.is_empty() {
                messages.push(format!("Total '{}' has no children", node.label));
            }
            if node.label.is_empty() || node.label == node.concept.as_str() {
                messages.push(format!("Node '{}' has no proper label", node.concept));
            }
        }

        let depth = self.max_depth(self.root);
        if depth > DEEP_HIERARCHY_WARNING {
            messages.push(format!("Hierarchy is very deep: {} levels", depth));
        }

        if !messages.is_empty() {
            log::debug!("Validation messages: {:?}", messages);
        }

        (is_valid, messages)
    }

    // ------------------------------------------------------------------
    // Projections
    // ------------------------------------------------------------------

    pub fn to_json(&self) -> Value {
        self.subtree_json(self.root)
    }

    /// Nested structured view of a subtree. Built bottom-up from a
    /// post-order walk so deep trees do not recurse.
    pub fn subtree_json(&self, start: NodeId) -> Value {
        let mut built: AHashMap<NodeId, Value> = AHashMap::new();

        for id in self.postorder(start) {
            let node = &self.nodes[id.0];
            let mut obj = Map::new();
            obj.insert("concept".into(), json!(node.concept.as_str()));
            obj.insert("label".into(), json!(node.label));
            obj.insert("node_type".into(), json!(node.node_type.as_str()));
            obj.insert("order".into(), json!(node.order));
            obj.insert("depth".into(), json!(node.depth));
            if let Some(value) = node.value {
                obj.insert("value".into(), json!(value));
            }
            if let Some(unit) = &node.unit {
                obj.insert("unit".into(), json!(unit));
            }
            if let Some(decimals) = node.decimals {
                obj.insert("decimals".into(), json!(decimals));
            }
            if let Some(position) = node.position_str() {
                obj.insert("position".into(), json!(position));
            }
            if let Some(position_id) = node.position_id() {
                obj.insert("position_id".into(), json!(position_id));
            }
            if !node.metadata.is_empty() {
                if let Ok(meta) = serde_json::to_value(&node.metadata) {
                    obj.insert("metadata".into(), meta);
                }
            }
            if !node.children.is_empty() {
                let children: Vec<Value> = node
                    .children
                    .iter()
                    .filter_map(|c| built.remove(c))
                    .collect();
                obj.insert("children".into(), Value::Array(children));
            }
            built.insert(id, Value::Object(obj));
        }

        built.remove(&start).unwrap_or(Value::Null)
    }

    /// One record per node in pre-order.
    pub fn to_records(&self) -> Vec<NodeRecord> {
        self.preorder(self.root)
            .map(|id| {
                let node = &self.nodes[id.0];
                NodeRecord {
                    concept: node.concept.to_string(),
                    label: node.label.clone(),
                    depth: node.depth,
                    node_type: node.node_type,
                    value: node.value,
                    decimals: node.decimals,
                    unit: node.unit.clone(),
                    is_total: self.is_total(id),
                    path: self.path_labels(id).join(" > "),
                    position: node.position_str(),
                    position_id: node.position_id(),
                }
            })
            .collect()
    }

    pub fn to_text(&self, indent_size: usize) -> String {
        let mut lines = Vec::new();
        for id in self.preorder(self.root) {
            let node = &self.nodes[id.0];
            let indent = " ".repeat(node.depth as usize * indent_size);
            match node.value {
                Some(value) => lines.push(format!("{}{} = {}", indent, node.label, value)),
                None => lines.push(format!("{}{}", indent, node.label)),
            }
        }
        lines.join("\n")
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text(DEFAULT_INDENT_SIZE))
    }
}

fn label_matches(label: &str, wanted: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        label == wanted
    } else {
        label.to_lowercase() == wanted.to_lowercase()
    }
}

/// Flattened view of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRecord {
    pub concept: String,
    pub label: String,
    pub depth: u32,
    pub node_type: NodeType,
    pub value: Option<f64>,
    pub decimals: Option<i32>,
    pub unit: Option<String>,
    pub is_total: bool,
    pub path: String,
    pub position: Option<String>,
    pub position_id: Option<String>,
}

// ============================================================================
// Iterators
// ============================================================================

pub struct Ancestors<'a> {
    tree: &'a Hierarchy,
    next: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.next?;
        self.next = self.tree.nodes[id.0].parent;
        Some(id)
    }
}

pub struct PreOrder<'a> {
    tree: &'a Hierarchy,
    stack: Vec<NodeId>,
}

impl Iterator for PreOrder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        self.stack
            .extend(self.tree.nodes[id.0].children.iter().rev().copied());
        Some(id)
    }
}

pub struct PostOrder<'a> {
    tree: &'a Hierarchy,
    // (node, children already pushed)
    stack: Vec<(NodeId, bool)>,
}

impl Iterator for PostOrder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        loop {
            let (id, expanded) = self.stack.pop()?;
            if expanded {
                return Some(id);
            }
            self.stack.push((id, true));
            for child in self.tree.nodes[id.0].children.iter().rev() {
                self.stack.push((*child, false));
            }
        }
    }
}

pub struct LevelOrder<'a> {
    tree: &'a Hierarchy,
    queue: VecDeque<NodeId>,
}

impl Iterator for LevelOrder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.queue.pop_front()?;
        self.queue.extend(self.tree.nodes[id.0].children.iter().copied());
        Some(id)
    }
}
