// Helpers shared by the tree builders, plus a facade over both of them
use crate::hierarchy::{Hierarchy, NodeId, TypingRules};
use crate::mapped_builder::MappedHierarchyBuilder;
use crate::model::NodeType;
use crate::position::{self, SharedRegistry, StatementTypeRegistry};
use crate::xbrl_builder::XbrlHierarchyBuilder;
use crate::{Config, Error, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Source fields tried, in order, for a node's numeric value.
pub const VALUE_FIELDS: &[&str] = &["value", "fact_value", "amount", "numeric_value"];

/// Strings that stand for "no value" in extracted data.
const EMPTY_VALUES: &[&str] = &["", "-", "N/A", "n/a"];

// ============================================================================
// Naming
// ============================================================================

/// Local part of a qualified concept name: `us-gaap:Cash` and
/// `us-gaap_Cash` both give `Cash`.
pub fn concept_local_name(concept: &str) -> &str {
    if let Some((_, local)) = concept.split_once(':') {
        return local;
    }
    match concept.rsplit_once('_') {
        Some((_, local)) if !local.is_empty() => local,
        _ => concept,
    }
}

/// Inserts spaces at CamelCase boundaries; `NetCashProvidedByEBITDAAdjustments`
/// reads `Net Cash Provided By EBITDA Adjustments`.
pub fn split_camel_case(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);

    for (i, c) in chars.iter().enumerate() {
        if i > 0 && c.is_uppercase() {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                out.push(' ');
            }
        }
        out.push(*c);
    }

    out
}

pub fn concept_to_label(concept: &str) -> String {
    split_camel_case(concept_local_name(concept))
}

/// Map key for a statement role: last URI segment without the
/// `Statement`/`Disclosure` noise, lowercased, `_`-separated.
pub fn role_to_key(role_uri: &str) -> String {
    let last = role_uri
        .rsplit(|c: char| c == '/' || c == '#')
        .find(|s| !s.is_empty())
        .unwrap_or(role_uri);
    let trimmed = last.replace("Statement", "").replace("Disclosure", "");

    let mut key = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_lowercase());
        } else if !key.ends_with('_') {
            key.push('_');
        }
    }

    let key = key.trim_matches('_');
    if key.is_empty() {
        "unknown".to_string()
    } else {
        key.to_string()
    }
}

/// `key`, or `key_2`, `key_3`, … when already taken.
pub fn unique_key<V>(map: &BTreeMap<String, V>, key: &str) -> String {
    if !map.contains_key(key) {
        return key.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", key, n))
        .find(|candidate| !map.contains_key(candidate))
        .unwrap_or_else(|| key.to_string())
}

// ============================================================================
// Node data extraction
// ============================================================================

/// Numeric reading of a JSON scalar. Strings lose their thousands
/// separators; placeholders such as `N/A` read as absent.
pub fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            if EMPTY_VALUES.contains(&cleaned.as_str()) {
                return None;
            }
            cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

/// First candidate field that yields a number.
pub fn extract_value(data: &Map<String, Value>) -> Option<f64> {
    VALUE_FIELDS
        .iter()
        .filter_map(|field| data.get(*field))
        .find_map(numeric)
}

/// Precision indicator; `INF` and anything unparsable are unknown.
pub fn parse_decimals(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn string_field<'a>(data: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| data.get(*k))
        .find_map(Value::as_str)
        .filter(|s| !s.is_empty())
}

pub fn bool_field(data: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().filter_map(|k| data.get(*k)).find_map(|v| match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().to_ascii_lowercase().parse().ok(),
        _ => None,
    })
}

/// Node type for pre-extracted node data.
pub fn determine_node_type(
    rules: &TypingRules,
    concept: &str,
    label: &str,
    value: Option<f64>,
    abstract_flag: Option<bool>,
) -> NodeType {
    if abstract_flag == Some(true) || concept.ends_with(rules.abstract_suffix.as_str()) {
        return NodeType::Abstract;
    }
    if rules.text_is_total(label) {
        return NodeType::Total;
    }
    if value.is_none() && abstract_flag != Some(false) {
        return NodeType::Abstract;
    }
    NodeType::LineItem
}

// ============================================================================
// Tree assembly
// ============================================================================

/// Attaches `child` unless it already has a parent. A rejected edge
/// (cycle, self-reference) is logged and skipped.
pub(crate) fn attach_first(tree: &mut Hierarchy, parent: NodeId, child: NodeId) -> bool {
    if tree.parent(child).is_some() {
        log::debug!(
            "Skipping second parent {} for {}",
            tree.node(parent).concept,
            tree.node(child).concept
        );
        return false;
    }
    match tree.add_child(parent, child) {
        Ok(()) => true,
        Err(e) => {
            log::debug!("Skipping edge: {}", e);
            false
        }
    }
}

/// Hangs every parentless node under the tree root. Returns how many moved.
pub(crate) fn attach_orphans(tree: &mut Hierarchy, nodes: &[NodeId]) -> usize {
    let root = tree.root();
    let mut attached = 0;
    for id in nodes {
        if *id != root && tree.parent(*id).is_none() && attach_first(tree, root, *id) {
            attached += 1;
        }
    }
    attached
}

/// Final pass shared by both builders: sort, then stamp positions.
pub(crate) fn finish_tree(tree: &mut Hierarchy, code: &str, default_context: Option<&str>) {
    tree.sort_children();
    position::assign_positions(tree, code, default_context);
}

// ============================================================================
// Facade
// ============================================================================

/// Picks the right builder for a path: a filing directory or linkbase XML
/// goes through the XBRL builder, a `.json` file through the mapped one.
/// Both share one registry so codes stay consistent across a run.
pub struct HierarchyBuilder {
    config: Config,
    registry: SharedRegistry,
    default_context: Option<String>,
}

impl HierarchyBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: StatementTypeRegistry::new().shared(),
            default_context: None,
        }
    }

    pub fn with_registry(mut self, registry: SharedRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_default_context(mut self, context: Option<&str>) -> Self {
        self.default_context = context.map(str::to_string);
        self
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn xbrl(&self) -> XbrlHierarchyBuilder {
        XbrlHierarchyBuilder::new(self.registry.clone())
            .with_rules(self.config.typing.clone())
            .with_default_context(self.default_context.as_deref())
    }

    pub fn mapped(&self) -> MappedHierarchyBuilder {
        MappedHierarchyBuilder::new(self.registry.clone())
            .with_rules(self.config.typing.clone())
            .with_default_context(self.default_context.as_deref())
    }

    pub fn build_path<P: AsRef<Path>>(&self, path: P) -> Result<BTreeMap<String, Hierarchy>> {
        let path = path.as_ref();

        if path.is_dir() {
            let mut builder = self.xbrl();
            let trees = builder.build_from_filing(path);
            return settle(trees, builder.last_error());
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        match extension.as_deref() {
            Some("json") => {
                let tree = self.mapped().build_from_file(path)?;
                let key = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(|s| s.to_lowercase())
                    .unwrap_or_else(|| "statement".to_string());
                Ok(BTreeMap::from([(key, tree)]))
            }
            Some("xml") => {
                let mut builder = self.xbrl();
                let trees = builder.build_from_linkbase(path);
                settle(trees, builder.last_error())
            }
            _ => Err(Error::Parse(format!(
                "Unsupported input {}: expected a filing directory, linkbase XML or JSON",
                path.display()
            ))),
        }
    }
}

fn settle(
    trees: BTreeMap<String, Hierarchy>,
    last_error: Option<&str>,
) -> Result<BTreeMap<String, Hierarchy>> {
    match last_error {
        Some(message) if trees.is_empty() => Err(Error::Parse(message.to_string())),
        _ => Ok(trees),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Node;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_concept_to_label() {
        assert_eq!(concept_to_label("us-gaap:AccountsPayableCurrent"), "Accounts Payable Current");
        assert_eq!(concept_to_label("us-gaap_CashAndCashEquivalents"), "Cash And Cash Equivalents");
        assert_eq!(concept_to_label("EBITDAMargin"), "EBITDA Margin");
        assert_eq!(concept_to_label("Revenue2023Total"), "Revenue2023 Total");
        assert_eq!(concept_local_name("Cash"), "Cash");
    }

    #[test]
    fn test_role_to_key() {
        assert_eq!(
            role_to_key("http://acme.com/role/ConsolidatedBalanceSheets"),
            "consolidatedbalancesheets"
        );
        assert_eq!(role_to_key("http://acme.com/role/StatementCashFlows"), "cashflows");
        assert_eq!(
            role_to_key("http://acme.com/role/Disclosure-Income Taxes (Details)"),
            "income_taxes_details"
        );
        assert_eq!(role_to_key("http://acme.com/role/Statement"), "unknown");
    }

    #[test]
    fn test_unique_key() {
        let mut map = BTreeMap::new();
        map.insert("bs".to_string(), 1);
        assert_eq!(unique_key(&map, "is"), "is");
        assert_eq!(unique_key(&map, "bs"), "bs_2");
        map.insert("bs_2".to_string(), 2);
        assert_eq!(unique_key(&map, "bs"), "bs_3");
    }

    #[test]
    fn test_extract_value_candidates() {
        let data = json!({"fact_value": "1,250,000", "amount": 3});
        assert_eq!(extract_value(data.as_object().unwrap()), Some(1_250_000.0));

        let data = json!({"value": "N/A", "numeric_value": 7.5});
        assert_eq!(extract_value(data.as_object().unwrap()), Some(7.5));

        let data = json!({"value": "-", "label": "Cash"});
        assert_eq!(extract_value(data.as_object().unwrap()), None);
    }

    #[test]
    fn test_parse_decimals() {
        assert_eq!(parse_decimals(&json!(-3)), Some(-3));
        assert_eq!(parse_decimals(&json!("-6")), Some(-6));
        assert_eq!(parse_decimals(&json!("INF")), None);
        assert_eq!(parse_decimals(&json!(null)), None);
    }

    #[test]
    fn test_determine_node_type() {
        let rules = TypingRules::default();
        let ty = |concept, label, value, flag| determine_node_type(&rules, concept, label, value, flag);
        assert_eq!(ty("x:Cash", "Cash", Some(1.0), Some(true)), NodeType::Abstract);
        assert_eq!(ty("x:AssetsAbstract", "Assets", Some(1.0), None), NodeType::Abstract);
        assert_eq!(ty("x:Assets", "Total assets", Some(1.0), None), NodeType::Total);
        assert_eq!(ty("x:Cash", "Cash", None, None), NodeType::Abstract);
        assert_eq!(ty("x:Cash", "Cash", None, Some(false)), NodeType::LineItem);
        assert_eq!(ty("x:Cash", "Cash", Some(1.0), None), NodeType::LineItem);
    }

    #[test]
    fn test_attach_first_keeps_first_parent() {
        let mut tree = Hierarchy::new(Node::root("Root", "root"));
        let root = tree.root();
        let a = tree.insert(Node::abstract_item("x:A", "A", 1.0));
        let b = tree.insert(Node::abstract_item("x:B", "B", 2.0));
        let c = tree.insert(Node::line_item("x:C", "C", Some(1.0)));

        assert!(attach_first(&mut tree, a, c));
        assert!(!attach_first(&mut tree, b, c));
        assert_eq!(tree.parent(c), Some(a));
        // c -> a would close a loop
        assert!(!attach_first(&mut tree, c, a));

        assert_eq!(attach_orphans(&mut tree, &[a, b, c]), 2);
        assert_eq!(tree.children(root), &[a, b]);
        assert_eq!(tree.node_count(), 4);
    }

    #[test]
    fn test_build_path_rejects_unknown_input() {
        let builder = HierarchyBuilder::new(Config::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();
        assert!(matches!(builder.build_path(&path), Err(Error::Parse(_))));
    }
}
