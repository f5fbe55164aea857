// Attaches reconciled fact values to hierarchy nodes
use crate::duplicates::{DuplicateHandler, DuplicateInfo};
use crate::facts::FactIndex;
use crate::hierarchy::{Hierarchy, NodeId};
use crate::model::{FactInstance, NodeType};
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    /// Nodes that received a value.
    pub attached: usize,
    /// Concepts with no fact in the chosen context.
    pub missing: Vec<String>,
    pub inconsistent: Vec<DuplicateInfo>,
}

impl MergeReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.inconsistent.is_empty()
    }
}

/// Fills value, decimals, unit and context on every node that can carry a
/// fact: anything but the root, dimension members and explicitly abstract
/// concepts. A node typed abstract only for lack of a value becomes a line
/// item (or total) once a numeric value lands on it.
///
/// The context is the node's own `context_ref`, else `default_context`, else
/// the context of the concept's first indexed fact. Inconsistent duplicate
/// sets leave the value empty and are returned in the report. Only line
/// items and totals are reported missing.
pub fn attach_facts(
    tree: &mut Hierarchy,
    index: &FactIndex,
    handler: &DuplicateHandler,
    default_context: Option<&str>,
) -> MergeReport {
    let mut report = MergeReport::default();
    let targets: Vec<NodeId> = tree
        .preorder(tree.root())
        .filter(|id| accepts_facts(tree, *id))
        .collect();

    for id in targets {
        let node = tree.node(id);
        let concept = node.concept.to_string();
        let expected = matches!(node.node_type, NodeType::LineItem | NodeType::Total);
        let total_label = tree.rules().text_is_total(&node.label);
        let facts = index.get_facts_for_concept(&concept);

        let context = node
            .metadata
            .context_ref
            .clone()
            .or_else(|| default_context.map(str::to_string))
            .or_else(|| facts.first().map(|f| f.context_ref.clone()));
        let Some(context) = context else {
            if expected {
                report.missing.push(concept);
            }
            continue;
        };

        let in_context: Vec<FactInstance> = facts
            .into_iter()
            .filter(|f| f.context_ref == context)
            .cloned()
            .collect();
        if in_context.is_empty() {
            if expected {
                report.missing.push(concept);
            }
            continue;
        }

        let info = handler.analyze(&in_context, &context);
        let node = tree.node_mut(id);
        node.metadata.context_ref = Some(context);

        if !info.is_usable() {
            log::warn!("Leaving {} empty: {}", concept, info.summary());
            report.inconsistent.push(info);
            continue;
        }

        if let Some(fact) = info.selected() {
            match fact.numeric_value() {
                Some(value) => {
                    node.value = Some(value);
                    node.decimals = fact.decimals;
                    if node.node_type == NodeType::Abstract {
                        node.node_type = if total_label { NodeType::Total } else { NodeType::LineItem };
                    }
                    report.attached += 1;
                }
                None => {
                    if let Some(text) = &fact.value {
                        node.metadata.insert("text_value", text.as_str());
                    }
                }
            }
            if let Some(unit) = &fact.unit {
                node.unit = Some(unit.clone());
            }
        }
    }

    log::info!(
        "Attached {} values ({} missing, {} inconsistent)",
        report.attached,
        report.missing.len(),
        report.inconsistent.len()
    );
    report
}

fn accepts_facts(tree: &Hierarchy, id: NodeId) -> bool {
    let node = tree.node(id);
    match node.node_type {
        NodeType::Root | NodeType::DimensionMember => false,
        _ => node.abstract_flag != Some(true) && !node.concept.ends_with(tree.rules().abstract_suffix.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapped_builder::MappedHierarchyBuilder;
    use crate::model::Node;
    use crate::position::assign_positions;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn balance_sheet() -> Hierarchy {
        let mut tree = Hierarchy::new(Node::root("Balance Sheet", "BalanceSheet"));
        let root = tree.root();
        let assets = tree.insert(Node::abstract_item("us-gaap:AssetsAbstract", "Assets", 1.0));
        let cash = tree.insert(Node::line_item("us-gaap:Cash", "Cash", None).with_order(1.0));
        let receivables = tree.insert(Node::line_item("us-gaap:Receivables", "Receivables", None).with_order(2.0));
        let goodwill = tree.insert(Node::line_item("us-gaap:Goodwill", "Goodwill", None).with_order(3.0));
        tree.add_child(root, assets).unwrap();
        for child in [cash, receivables, goodwill] {
            tree.add_child(assets, child).unwrap();
        }
        tree
    }

    fn index() -> FactIndex {
        let mut index = FactIndex::new();
        index.add_fact(FactInstance::new("us-gaap:Cash", "c4", "1000000").with_decimals(-3).with_unit("USD"));
        index.add_fact(FactInstance::new("us-gaap:Cash", "c4", "1000000").with_decimals(-6));
        index.add_fact(FactInstance::new("us-gaap:Cash", "c5", "900000").with_decimals(-3));
        index.add_fact(FactInstance::new("us-gaap:Receivables", "c4", "5000000").with_decimals(-3));
        index.add_fact(FactInstance::new("us-gaap:Receivables", "c4", "4500000").with_decimals(-3));
        index
    }

    #[test]
    fn test_attach_with_default_context() {
        let mut tree = balance_sheet();
        assign_positions(&mut tree, "BS", None);
        let report = attach_facts(&mut tree, &index(), &DuplicateHandler::default(), Some("c4"));

        assert_eq!(report.attached, 1);
        assert_eq!(report.missing, vec!["us-gaap:Goodwill".to_string()]);
        assert_eq!(report.inconsistent.len(), 1);
        assert_eq!(report.inconsistent[0].concept, "us-gaap:Receivables");
        assert!(!report.is_clean());

        let cash = tree.node(tree.find_by_concept("us-gaap:Cash").unwrap());
        assert_eq!(cash.value, Some(1_000_000.0));
        assert_eq!(cash.decimals, Some(-3));
        assert_eq!(cash.unit.as_deref(), Some("USD"));
        assert_eq!(cash.position_id().as_deref(), Some("BS-002-001-c4"));

        let receivables = tree.node(tree.find_by_concept("us-gaap:Receivables").unwrap());
        assert_eq!(receivables.value, None);
        assert_eq!(receivables.metadata.context_ref.as_deref(), Some("c4"));
    }

    #[test]
    fn test_node_context_takes_precedence() {
        let mut tree = balance_sheet();
        let cash = tree.find_by_concept("us-gaap:Cash").unwrap();
        tree.node_mut(cash).metadata.context_ref = Some("c5".to_string());

        attach_facts(&mut tree, &index(), &DuplicateHandler::default(), Some("c4"));
        assert_eq!(tree.node(cash).value, Some(900_000.0));
    }

    #[test]
    fn test_mapped_nodes_without_values_receive_facts() {
        let data = json!({
            "statement_type": "BALANCE_SHEET",
            "hierarchy": {
                "nodes": {
                    "us-gaap:AssetsAbstract": {"label": "Assets"},
                    "us-gaap:Cash": {"label": "Cash"},
                    "us-gaap:Assets": {"label": "Total assets"},
                    "us-gaap:Heading": {"label": "Other", "is_abstract": true}
                },
                "arcs": [
                    {"parent": "us-gaap:AssetsAbstract", "child": "us-gaap:Cash", "order": 1},
                    {"parent": "us-gaap:AssetsAbstract", "child": "us-gaap:Assets", "order": 2},
                    {"parent": "us-gaap:AssetsAbstract", "child": "us-gaap:Heading", "order": 3}
                ]
            }
        });
        let mut tree = MappedHierarchyBuilder::default().build_from_data(&data, "bs").unwrap();
        let cash = tree.find_by_concept("us-gaap:Cash").unwrap();
        assert_eq!(tree.node(cash).node_type, NodeType::Abstract);

        let mut index = FactIndex::new();
        index.add_fact(FactInstance::new("us-gaap:Cash", "c4", "1000"));
        index.add_fact(FactInstance::new("us-gaap:Assets", "c4", "1000"));
        index.add_fact(FactInstance::new("us-gaap:Heading", "c4", "7"));
        index.add_fact(FactInstance::new("us-gaap:AssetsAbstract", "c4", "7"));
        let report = attach_facts(&mut tree, &index, &DuplicateHandler::default(), Some("c4"));

        assert_eq!(report.attached, 2);
        assert!(report.is_clean());
        assert_eq!(tree.node(cash).node_type, NodeType::LineItem);
        assert_eq!(tree.node(cash).value, Some(1000.0));
        assert_eq!(tree.node(cash).metadata.context_ref.as_deref(), Some("c4"));

        let total = tree.node(tree.find_by_concept("us-gaap:Assets").unwrap());
        assert_eq!(total.node_type, NodeType::Total);
        assert_eq!(total.value, Some(1000.0));

        for concept in ["us-gaap:Heading", "us-gaap:AssetsAbstract"] {
            let node = tree.node(tree.find_by_concept(concept).unwrap());
            assert_eq!(node.node_type, NodeType::Abstract);
            assert_eq!(node.value, None);
        }
    }

    #[test]
    fn test_first_fact_context_without_default() {
        let mut tree = balance_sheet();
        let report = attach_facts(&mut tree, &index(), &DuplicateHandler::default(), None);
        let cash = tree.node(tree.find_by_concept("us-gaap:Cash").unwrap());
        assert_eq!(cash.metadata.context_ref.as_deref(), Some("c4"));
        assert_eq!(report.missing.len(), 1);
    }
}
