// Statement trees from pre-extracted hierarchy records
use crate::builder::{
    attach_first, attach_orphans, bool_field, concept_local_name, determine_node_type, extract_value,
    finish_tree, parse_decimals, string_field,
};
use crate::hierarchy::{Hierarchy, NodeId, TypingRules};
use crate::model::Node;
use crate::position::{SharedRegistry, StatementTypeRegistry};
use crate::Result;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const UNKNOWN_STATEMENT_TYPE: &str = "UNKNOWN";

/// One mapped statement: a `statement_type` plus its `hierarchy`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatementRecord {
    pub statement_type: Option<String>,
    pub role_uri: Option<String>,
    pub role_definition: Option<String>,
    pub statement_name: Option<String>,
    pub hierarchy: HierarchyRecord,
}

/// Either `nodes` + `arcs`, or a `children` map with an optional `order`
/// map. `roots` fixes the top-level concepts when given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyRecord {
    pub roots: Vec<String>,
    pub nodes: BTreeMap<String, Map<String, Value>>,
    pub arcs: Vec<ArcRecord>,
    pub children: BTreeMap<String, Vec<String>>,
    pub order: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcRecord {
    #[serde(alias = "from")]
    pub parent: String,
    #[serde(alias = "to")]
    pub child: String,
    #[serde(default)]
    pub order: f64,
}

pub struct MappedHierarchyBuilder {
    registry: SharedRegistry,
    rules: TypingRules,
    default_context: Option<String>,
    build_count: usize,
}

impl MappedHierarchyBuilder {
    pub fn new(registry: SharedRegistry) -> Self {
        Self {
            registry,
            rules: TypingRules::default(),
            default_context: None,
            build_count: 0,
        }
    }

    pub fn with_rules(mut self, rules: TypingRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_default_context(mut self, context: Option<&str>) -> Self {
        self.default_context = context.map(str::to_string);
        self
    }

    pub fn build_count(&self) -> usize {
        self.build_count
    }

    pub fn build_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<Hierarchy> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("statement");
        self.build_from_str(&text, name)
    }

    pub fn build_from_str(&mut self, text: &str, name: &str) -> Result<Hierarchy> {
        let record: StatementRecord = serde_json::from_str(text)?;
        Ok(self.build_from_record(&record, name))
    }

    pub fn build_from_data(&mut self, data: &Value, name: &str) -> Result<Hierarchy> {
        let record = StatementRecord::deserialize(data)?;
        Ok(self.build_from_record(&record, name))
    }

    pub fn build_from_record(&mut self, record: &StatementRecord, name: &str) -> Hierarchy {
        let statement_type = record
            .statement_type
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(UNKNOWN_STATEMENT_TYPE)
            .to_uppercase();
        let code = self.registry.lock().get_or_generate_code(&statement_type);

        let label = record
            .role_definition
            .as_deref()
            .or(record.statement_name.as_deref())
            .unwrap_or(name);
        let mut root = Node::root(label, &format!("root:{}", name));
        root.metadata.statement_type = Some(statement_type.clone());
        root.metadata.role_uri = record.role_uri.clone();
        root.metadata.statement_name = Some(name.to_string());

        let mut tree = Hierarchy::with_rules(root, self.rules.clone());
        let hierarchy = &record.hierarchy;
        let mut ids: AHashMap<String, NodeId> = AHashMap::new();
        let mut created: Vec<NodeId> = Vec::new();

        let mut node_for = |tree: &mut Hierarchy, concept: &str| -> NodeId {
            if let Some(id) = ids.get(concept) {
                return *id;
            }
            let node = self.create_node(concept, hierarchy.nodes.get(concept));
            let id = tree.insert(node);
            ids.insert(concept.to_string(), id);
            created.push(id);
            id
        };

        for concept in hierarchy.roots.iter().chain(hierarchy.nodes.keys()) {
            node_for(&mut tree, concept);
        }

        let mut edges = 0usize;
        if !hierarchy.arcs.is_empty() {
            for arc in &hierarchy.arcs {
                let parent = node_for(&mut tree, &arc.parent);
                let child = node_for(&mut tree, &arc.child);
                if attach_first(&mut tree, parent, child) {
                    edges += 1;
                    if arc.order != 0.0 {
                        tree.node_mut(child).order = arc.order;
                    }
                }
            }
        } else {
            for (parent_concept, kids) in &hierarchy.children {
                let parent = node_for(&mut tree, parent_concept);
                for (index, kid) in kids.iter().enumerate() {
                    let child = node_for(&mut tree, kid);
                    if attach_first(&mut tree, parent, child) {
                        edges += 1;
                        tree.node_mut(child).order = hierarchy
                            .order
                            .get(kid)
                            .copied()
                            .unwrap_or((index + 1) as f64);
                    }
                }
            }
        }

        let orphans = attach_orphans(&mut tree, &created);
        finish_tree(&mut tree, &code, self.default_context.as_deref());
        self.build_count += 1;

        log::info!(
            "Built {} ({}): {} nodes, {} edges, {} attached to root",
            name,
            statement_type,
            tree.node_count(),
            edges,
            orphans
        );
        tree
    }

    /// Node for `concept`, filled from its record when there is one.
    fn create_node(&self, concept: &str, data: Option<&Map<String, Value>>) -> Node {
        let Some(data) = data else {
            let label = concept_local_name(concept);
            let node_type = determine_node_type(&self.rules, concept, label, None, None);
            return Node::new(concept, label, node_type);
        };

        let label = string_field(data, &["label", "preferred_label"])
            .unwrap_or_else(|| concept_local_name(concept));
        let value = extract_value(data);
        let abstract_flag = bool_field(data, &["is_abstract", "abstract"]);
        let node_type = determine_node_type(&self.rules, concept, label, value, abstract_flag);

        let mut node = Node::new(concept, label, node_type);
        node.value = value;
        node.abstract_flag = abstract_flag;
        node.decimals = data.get("decimals").and_then(parse_decimals);
        node.unit = string_field(data, &["unit", "unit_ref"]).map(str::to_string);

        let meta = &mut node.metadata;
        meta.balance = string_field(data, &["balance"]).map(str::to_string);
        meta.period_type = string_field(data, &["period_type"]).map(str::to_string);
        meta.is_monetary = bool_field(data, &["is_monetary"]);
        meta.context_ref = string_field(data, &["context_ref", "contextRef"]).map(str::to_string);
        meta.preferred_label = string_field(data, &["preferred_label"]).map(str::to_string);
        node
    }
}

impl Default for MappedHierarchyBuilder {
    fn default() -> Self {
        Self::new(StatementTypeRegistry::new().shared())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn nodes_and_arcs() -> Value {
        json!({
            "statement_type": "balance_sheet",
            "role_uri": "http://acme.com/role/BalanceSheet",
            "hierarchy": {
                "roots": ["us-gaap:AssetsAbstract"],
                "nodes": {
                    "us-gaap:AssetsAbstract": {"label": "Assets", "is_abstract": true},
                    "us-gaap:Cash": {"label": "Cash", "value": "1,000", "decimals": "-3",
                                      "unit_ref": "USD", "balance": "debit", "contextRef": "c-1"},
                    "us-gaap:Receivables": {"label": "Receivables", "fact_value": 250, "decimals": "INF"},
                    "us-gaap:Assets": {"label": "Total assets", "amount": 1250, "is_monetary": true},
                    "us-gaap:Goodwill": {"label": "Goodwill", "value": "N/A", "is_abstract": false}
                },
                "arcs": [
                    {"from": "us-gaap:AssetsAbstract", "to": "us-gaap:Receivables", "order": 2},
                    {"parent": "us-gaap:AssetsAbstract", "child": "us-gaap:Cash", "order": 1},
                    {"parent": "us-gaap:AssetsAbstract", "child": "us-gaap:Assets", "order": 3},
                    {"parent": "us-gaap:Cash", "child": "us-gaap:AssetsAbstract"}
                ]
            }
        })
    }

    #[test]
    fn test_nodes_and_arcs_format() {
        let mut builder = MappedHierarchyBuilder::default().with_default_context(Some("FY2023"));
        let tree = builder.build_from_data(&nodes_and_arcs(), "balance_sheet").unwrap();
        let root = tree.root();

        assert_eq!(tree.node(root).concept, "root:balance_sheet");
        assert_eq!(tree.node(root).metadata.statement_type.as_deref(), Some("BALANCE_SHEET"));
        assert_eq!(tree.node(root).label, "balance_sheet");
        // Assets abstract plus the orphaned Goodwill
        assert_eq!(tree.node_count(), 6);
        assert_eq!(tree.child_count(root), 2);

        let abstract_id = tree.find_by_concept("us-gaap:AssetsAbstract").unwrap();
        let labels: Vec<&str> = tree
            .children(abstract_id)
            .iter()
            .map(|id| tree.node(*id).label.as_str())
            .collect();
        assert_eq!(labels, vec!["Cash", "Receivables", "Total assets"]);
        assert_eq!(tree.node(abstract_id).node_type, NodeType::Abstract);

        let cash = tree.node(tree.find_by_concept("us-gaap:Cash").unwrap());
        assert_eq!(cash.value, Some(1000.0));
        assert_eq!(cash.decimals, Some(-3));
        assert_eq!(cash.unit.as_deref(), Some("USD"));
        assert_eq!(cash.metadata.balance.as_deref(), Some("debit"));
        assert_eq!(cash.position_id().as_deref(), Some("BS-002-001-c1"));

        let recv = tree.node(tree.find_by_concept("us-gaap:Receivables").unwrap());
        assert_eq!(recv.value, Some(250.0));
        assert_eq!(recv.decimals, None);
        assert_eq!(recv.position_id().as_deref(), Some("BS-002-002-FY2023"));

        let total = tree.node(tree.find_by_concept("us-gaap:Assets").unwrap());
        assert_eq!(total.node_type, NodeType::Total);
        assert_eq!(total.metadata.is_monetary, Some(true));

        let goodwill = tree.node(tree.find_by_concept("us-gaap:Goodwill").unwrap());
        assert_eq!(goodwill.value, None);
        assert_eq!(goodwill.node_type, NodeType::LineItem);
        assert!(!tree.is_abstract(tree.find_by_concept("us-gaap:Goodwill").unwrap()));
    }

    #[test]
    fn test_children_map_format() {
        let data = json!({
            "statement_type": "INCOME_STATEMENT",
            "statement_name": "Income Statement",
            "hierarchy": {
                "children": {
                    "ifrs-full_ProfitLoss": ["ifrs-full_Revenue", "ifrs-full_CostOfSales"]
                },
                "order": {"ifrs-full_Revenue": 2.0}
            }
        });
        let mut builder = MappedHierarchyBuilder::default();
        let tree = builder.build_from_data(&data, "income").unwrap();
        let root = tree.root();

        assert_eq!(tree.node(root).label, "Income Statement");
        let profit = tree.children(root)[0];
        assert_eq!(tree.node(profit).label, "ProfitLoss");
        let kids: Vec<&str> = tree
            .children(profit)
            .iter()
            .map(|id| tree.node(*id).concept.as_str())
            .collect();
        // Revenue takes order 2 from the map, CostOfSales its index (2): label tie-break
        assert_eq!(kids, vec!["ifrs-full_CostOfSales", "ifrs-full_Revenue"]);
        assert_eq!(builder.build_count(), 1);
    }

    #[test]
    fn test_missing_statement_type_is_unknown() {
        let mut builder = MappedHierarchyBuilder::default();
        let tree = builder
            .build_from_str(r#"{"hierarchy": {"nodes": {"x:A": {"value": 1}}}}"#, "misc")
            .unwrap();
        assert_eq!(tree.node(tree.root()).metadata.statement_type.as_deref(), Some("UNKNOWN"));
        let a = tree.find_by_concept("x:A").unwrap();
        assert_eq!(tree.node(a).position_str().as_deref(), Some("UN-001-001"));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let mut builder = MappedHierarchyBuilder::default();
        assert!(builder.build_from_str("{not json", "broken").is_err());
        assert!(builder.build_from_file("/nonexistent/statement.json").is_err());
    }
}
