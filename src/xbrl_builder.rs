// Statement trees from linkbase roles
use crate::builder::{self, attach_first, attach_orphans, concept_to_label, finish_tree, role_to_key, unique_key};
use crate::hierarchy::{Hierarchy, NodeId, TypingRules};
use crate::linkbase::{LabelSet, LinkbaseKind, LinkbaseParser, StatementRole, CALCULATION_SUFFIX};
use crate::model::Node;
use crate::position::SharedRegistry;
use ahash::AHashMap;
use std::collections::BTreeMap;
use std::path::Path;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Builds one [`Hierarchy`] per statement role of a filing.
pub struct XbrlHierarchyBuilder {
    registry: SharedRegistry,
    rules: TypingRules,
    labels: Option<LabelSet>,
    // (parent concept, child concept) -> calculation weight
    weights: AHashMap<(String, String), f64>,
    default_context: Option<String>,
    parser: LinkbaseParser,
    last_error: Option<String>,
    build_count: usize,
}

impl XbrlHierarchyBuilder {
    pub fn new(registry: SharedRegistry) -> Self {
        Self {
            registry,
            rules: TypingRules::default(),
            labels: None,
            weights: AHashMap::new(),
            default_context: None,
            parser: LinkbaseParser::new(),
            last_error: None,
            build_count: 0,
        }
    }

    pub fn with_rules(mut self, rules: TypingRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_labels(mut self, labels: LabelSet) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_default_context(mut self, context: Option<&str>) -> Self {
        self.default_context = context.map(str::to_string);
        self
    }

    /// Records calculation weights so presentation trees can carry them.
    pub fn with_calculation_roles(mut self, roles: &[StatementRole]) -> Self {
        self.record_weights(roles);
        self
    }

    fn record_weights(&mut self, roles: &[StatementRole]) {
        for role in roles {
            for arc in &role.arcs {
                if let (Some(parent), Some(child)) = (role.concept(&arc.from), role.concept(&arc.to)) {
                    self.weights
                        .entry((parent.to_string(), child.to_string()))
                        .or_insert(arc.weight);
                }
            }
        }
    }

    /// Most recent scan or parse failure of the last build.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn note_parser_error(&mut self) {
        if let Some(message) = self.parser.last_error() {
            self.last_error = Some(message.to_string());
        }
    }

    pub fn build_count(&self) -> usize {
        self.build_count
    }

    /// `(statement type, code)` pairs known to the shared registry.
    pub fn discovered_types(&self) -> Vec<(String, String)> {
        self.registry.lock().registered_types()
    }

    /// Builds every statement in a filing directory. Presentation roles are
    /// used when present, calculation roles otherwise. Labels and
    /// calculation weights are picked up from sibling linkbases.
    pub fn build_from_filing<P: AsRef<Path>>(&mut self, dir: P) -> BTreeMap<String, Hierarchy> {
        let dir = dir.as_ref();
        self.last_error = None;
        let files = match LinkbaseParser::find_linkbase_files(dir) {
            Ok(files) => files,
            Err(e) => {
                log::warn!("Cannot scan {}: {}", dir.display(), e);
                self.last_error = Some(e.to_string());
                return BTreeMap::new();
            }
        };

        if self.labels.is_none() {
            if let Some(path) = &files.label {
                let labels = self.parser.parse_label_linkbase(path);
                self.note_parser_error();
                if !labels.is_empty() {
                    self.labels = Some(labels);
                }
            }
        }

        let calculation = match &files.calculation {
            Some(path) => {
                let roles = self.parser.parse_calculation_linkbase(path);
                self.note_parser_error();
                roles
            }
            None => Vec::new(),
        };

        let roles = match &files.presentation {
            Some(path) => {
                let roles = self.parser.parse_presentation_linkbase(path);
                self.note_parser_error();
                self.record_weights(&calculation);
                roles
            }
            None if !calculation.is_empty() => calculation,
            None => {
                log::warn!("No presentation or calculation linkbase in {}", dir.display());
                self.last_error = Some(format!("No linkbase found in {}", dir.display()));
                return BTreeMap::new();
            }
        };

        self.build_from_roles(&roles)
    }

    /// Builds from a single linkbase file; `_cal.xml` files are read as
    /// calculation linkbases, anything else as presentation.
    pub fn build_from_linkbase<P: AsRef<Path>>(&mut self, path: P) -> BTreeMap<String, Hierarchy> {
        let path = path.as_ref();
        let is_calculation = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.to_lowercase().ends_with(CALCULATION_SUFFIX));

        self.last_error = None;
        let roles = if is_calculation {
            self.parser.parse_calculation_linkbase(path)
        } else {
            self.parser.parse_presentation_linkbase(path)
        };
        self.note_parser_error();
        self.build_from_roles(&roles)
    }

    /// One tree per non-empty role, keyed by [`role_to_key`]. Statement
    /// codes are registered in role order before any tree is built, so the
    /// assignment does not depend on build scheduling.
    pub fn build_from_roles(&mut self, roles: &[StatementRole]) -> BTreeMap<String, Hierarchy> {
        let codes: Vec<Option<String>> = {
            let mut registry = self.registry.lock();
            roles
                .iter()
                .map(|role| {
                    (!role.is_empty())
                        .then(|| registry.get_or_generate_code(role.statement_kind().as_str()))
                })
                .collect()
        };

        let this = &*self;
        #[cfg(feature = "parallel")]
        let built: Vec<Option<Hierarchy>> = roles
            .par_iter()
            .zip(codes.par_iter())
            .map(|(role, code)| code.as_deref().and_then(|c| this.build_role(role, c)))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let built: Vec<Option<Hierarchy>> = roles
            .iter()
            .zip(codes.iter())
            .map(|(role, code)| code.as_deref().and_then(|c| this.build_role(role, c)))
            .collect();

        let mut trees: BTreeMap<String, Hierarchy> = BTreeMap::new();
        for (role, tree) in roles.iter().zip(built) {
            let Some(tree) = tree else {
                continue;
            };
            let key = unique_key(&trees, &role_to_key(&role.role_uri));
            trees.insert(key, tree);
        }

        self.build_count += trees.len();
        log::info!("Built {} statement trees from {} roles", trees.len(), roles.len());
        trees
    }

    /// Tree for a single role; `None` when the role has no arcs.
    pub fn build_role(&self, role: &StatementRole, code: &str) -> Option<Hierarchy> {
        if role.is_empty() {
            log::debug!("Skipping empty role {}", role.role_uri);
            return None;
        }

        let kind = role.statement_kind();
        let label = role
            .title
            .clone()
            .unwrap_or_else(|| builder::split_camel_case(role.short_name()));
        let mut root = Node::root(&label, &format!("role:{}", role.role_uri));
        root.metadata.statement_type = Some(kind.as_str().to_string());
        root.metadata.role_uri = Some(role.role_uri.clone());

        let mut tree = Hierarchy::with_rules(root, self.rules.clone());
        let mut ids: AHashMap<String, NodeId> = AHashMap::new();
        let mut created: Vec<NodeId> = Vec::new();

        for arc in &role.arcs {
            if arc.is_prohibited() {
                log::debug!("Skipping prohibited arc {} -> {}", arc.from, arc.to);
                continue;
            }
            let (Some(parent_concept), Some(child_concept)) = (role.concept(&arc.from), role.concept(&arc.to))
            else {
                continue;
            };

            let parent = self.node_for(&mut tree, &mut ids, &mut created, parent_concept);
            let child = self.node_for(&mut tree, &mut ids, &mut created, child_concept);
            if !attach_first(&mut tree, parent, child) {
                continue;
            }

            let node = tree.node_mut(child);
            node.order = arc.order;
            if let Some(preferred) = &arc.preferred_label {
                if let Some(text) = self.labels.as_ref().and_then(|l| l.get(child_concept, Some(preferred.as_str()))) {
                    node.label = text.to_string();
                }
                node.metadata.preferred_label = Some(preferred.clone());
            }
            node.metadata.weight = match role.kind {
                LinkbaseKind::Calculation => Some(arc.weight),
                _ => self
                    .weights
                    .get(&(parent_concept.to_string(), child_concept.to_string()))
                    .copied(),
            };
        }

        // Locators without a surviving arc still belong to the statement
        for locator in role.locators.values() {
            self.node_for(&mut tree, &mut ids, &mut created, &locator.concept);
        }

        attach_orphans(&mut tree, &created);
        finish_tree(&mut tree, code, self.default_context.as_deref());

        log::debug!(
            "Role {} -> {} nodes, depth {}",
            role.role_uri,
            tree.node_count(),
            tree.max_depth(tree.root())
        );
        Some(tree)
    }

    fn node_for(
        &self,
        tree: &mut Hierarchy,
        ids: &mut AHashMap<String, NodeId>,
        created: &mut Vec<NodeId>,
        concept: &str,
    ) -> NodeId {
        if let Some(id) = ids.get(concept) {
            return *id;
        }
        let label = self
            .labels
            .as_ref()
            .and_then(|l| l.get(concept, None))
            .map(str::to_string)
            .unwrap_or_else(|| concept_to_label(concept));
        let node_type = self.rules.classify_concept(concept);

        let id = tree.insert(Node::new(concept, &label, node_type));
        ids.insert(concept.to_string(), id);
        created.push(id);
        id
    }
}

impl Default for XbrlHierarchyBuilder {
    fn default() -> Self {
        Self::new(crate::position::StatementTypeRegistry::new().shared())
    }
}
