use crate::hierarchy::NodeId;
use crate::position;
use chrono::NaiveDate;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Tree nodes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Root,
    Abstract,
    LineItem,
    Total,
    DimensionMember,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Root => "root",
            NodeType::Abstract => "abstract",
            NodeType::LineItem => "line_item",
            NodeType::Total => "total",
            NodeType::DimensionMember => "dimension_member",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statement family detected from a role URI and its definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementKind {
    BalanceSheet,
    IncomeStatement,
    CashFlow,
    Equity,
    Other,
}

impl StatementKind {
    const BALANCE_SHEET_KEYWORDS: &'static [&'static str] = &[
        "balancesheet",
        "balance_sheet",
        "financialposition",
        "financial_position",
        "statementoffinancialposition",
    ];
    const INCOME_STATEMENT_KEYWORDS: &'static [&'static str] = &[
        "incomestatement",
        "income_statement",
        "operations",
        "profitloss",
        "profit_loss",
        "earnings",
        "comprehensiveincome",
    ];
    const CASH_FLOW_KEYWORDS: &'static [&'static str] = &["cashflow", "cash_flow", "cashflows"];
    const EQUITY_KEYWORDS: &'static [&'static str] = &[
        "stockholdersequity",
        "shareholdersequity",
        "equity",
        "changesinequity",
        "statementofequity",
    ];

    pub fn detect(role_uri: &str, definition: Option<&str>) -> Self {
        let text = format!("{} {}", role_uri, definition.unwrap_or("")).to_lowercase();
        let has = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));

        if has(Self::BALANCE_SHEET_KEYWORDS) {
            StatementKind::BalanceSheet
        } else if has(Self::INCOME_STATEMENT_KEYWORDS) {
            StatementKind::IncomeStatement
        } else if has(Self::CASH_FLOW_KEYWORDS) {
            StatementKind::CashFlow
        } else if has(Self::EQUITY_KEYWORDS) {
            StatementKind::Equity
        } else {
            StatementKind::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::BalanceSheet => "BALANCE_SHEET",
            StatementKind::IncomeStatement => "INCOME_STATEMENT",
            StatementKind::CashFlow => "CASH_FLOW",
            StatementKind::Equity => "EQUITY",
            StatementKind::Other => "OTHER",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural position of a node: statement code, depth and 1-based
/// sibling counter. Rendered as `BS-002-001`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub code: CompactString,
    pub level: u32,
    pub sibling: u32,
}

impl Position {
    pub fn new(code: &str, level: u32, sibling: u32) -> Self {
        Self {
            code: CompactString::from(code),
            level,
            sibling,
        }
    }

    /// Full identifier, with the normalized context appended when present.
    pub fn with_context(&self, context_ref: Option<&str>) -> String {
        position::format_id(&self.code, self.level, self.sibling, context_ref)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&position::format_position(&self.code, self.level, self.sibling))
    }
}

/// Metadata carried by a node. The keys consumed downstream have typed
/// fields; anything else lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_monetary: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl NodeMetadata {
    pub fn is_empty(&self) -> bool {
        *self == NodeMetadata::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "statement_type" => self.statement_type.clone(),
            "role_uri" => self.role_uri.clone(),
            "statement_name" => self.statement_name.clone(),
            "preferred_label" => self.preferred_label.clone(),
            "balance" => self.balance.clone(),
            "period_type" => self.period_type.clone(),
            "is_monetary" => self.is_monetary.map(|b| b.to_string()),
            "context_ref" => self.context_ref.clone(),
            "weight" => self.weight.map(|w| w.to_string()),
            _ => self.extra.get(key).cloned(),
        }
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match key {
            "statement_type" => self.statement_type = Some(value),
            "role_uri" => self.role_uri = Some(value),
            "statement_name" => self.statement_name = Some(value),
            "preferred_label" => self.preferred_label = Some(value),
            "balance" => self.balance = Some(value),
            "period_type" => self.period_type = Some(value),
            "is_monetary" => self.is_monetary = value.parse().ok(),
            "context_ref" => self.context_ref = Some(value),
            "weight" => self.weight = value.parse().ok(),
            _ => {
                self.extra.insert(key.to_string(), value);
            }
        }
    }
}

/// One element of a statement tree. Ownership lives in the arena; `parent`
/// is a navigation-only index and `children` is the owned, ordered list.
#[derive(Debug, Clone)]
pub struct Node {
    pub concept: CompactString,
    pub label: String,
    pub node_type: NodeType,
    pub order: f64,
    pub depth: u32,
    pub value: Option<f64>,
    pub decimals: Option<i32>,
    pub unit: Option<String>,
    /// Explicit abstract flag from the source data; `Some(false)` keeps a
    /// valueless node from being reported as abstract.
    pub abstract_flag: Option<bool>,
    pub metadata: NodeMetadata,
    pub position: Option<Position>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
}

impl Node {
    pub fn new(concept: &str, label: &str, node_type: NodeType) -> Self {
        Self {
            concept: CompactString::from(concept),
            label: label.to_string(),
            node_type,
            order: 0.0,
            depth: 0,
            value: None,
            decimals: None,
            unit: None,
            abstract_flag: None,
            metadata: NodeMetadata::default(),
            position: None,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn root(label: &str, concept: &str) -> Self {
        Self::new(concept, label, NodeType::Root)
    }

    pub fn abstract_item(concept: &str, label: &str, order: f64) -> Self {
        Self::new(concept, label, NodeType::Abstract).with_order(order)
    }

    pub fn line_item(concept: &str, label: &str, value: Option<f64>) -> Self {
        let mut node = Self::new(concept, label, NodeType::LineItem);
        node.value = value;
        node
    }

    pub fn with_order(mut self, order: f64) -> Self {
        self.order = order;
        self
    }

    pub fn with_value(mut self, value: f64, decimals: Option<i32>) -> Self {
        self.value = Some(value);
        self.decimals = decimals;
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    #[inline]
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Structural position without context, once assigned.
    pub fn position_str(&self) -> Option<String> {
        self.position.as_ref().map(|p| p.to_string())
    }

    /// Position plus the node's normalized context reference.
    pub fn position_id(&self) -> Option<String> {
        self.position
            .as_ref()
            .map(|p| p.with_context(self.metadata.context_ref.as_deref()))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)?;
        if let Some(value) = self.value {
            write!(f, " = {}", value)?;
        }
        if !self.children.is_empty() {
            write!(f, " ({} children)", self.children.len())?;
        }
        Ok(())
    }
}

// ============================================================================
// Facts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    Instant,
    Duration,
}

impl PeriodKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instant" => Some(PeriodKind::Instant),
            "duration" => Some(PeriodKind::Duration),
            _ => None,
        }
    }
}

/// One reported fact occurrence for a concept in a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactInstance {
    pub concept: String,
    pub context_ref: String,
    pub value: Option<String>,
    pub unit: Option<String>,
    pub decimals: Option<i32>,
    pub period_type: Option<PeriodKind>,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

impl FactInstance {
    pub fn new(concept: &str, context_ref: &str, value: &str) -> Self {
        Self {
            concept: concept.to_string(),
            context_ref: context_ref.to_string(),
            value: Some(value.to_string()),
            unit: None,
            decimals: None,
            period_type: None,
            period_start: None,
            period_end: None,
            dimensions: BTreeMap::new(),
        }
    }

    pub fn with_decimals(mut self, decimals: i32) -> Self {
        self.decimals = Some(decimals);
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn numeric_value(&self) -> Option<f64> {
        let raw = self.value.as_deref()?;
        let cleaned: String = raw.chars().filter(|c| *c != ',').collect();
        let cleaned = cleaned.trim();
        if cleaned.is_empty() {
            return None;
        }
        cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
    }

    #[inline]
    pub fn has_numeric_value(&self) -> bool {
        self.numeric_value().is_some()
    }

    #[inline]
    pub fn is_dimensional(&self) -> bool {
        !self.dimensions.is_empty()
    }

    pub fn period_end_date(&self) -> Option<NaiveDate> {
        self.period_end.as_deref().and_then(parse_date)
    }

    pub fn period_start_date(&self) -> Option<NaiveDate> {
        self.period_start.as_deref().and_then(parse_date)
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    // Instants are sometimes written as full timestamps
    let date = s.trim().get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_numeric_value_strips_commas() {
        let fact = FactInstance::new("us-gaap:Assets", "c1", "1,234,567");
        assert_eq!(fact.numeric_value(), Some(1_234_567.0));

        let text = FactInstance::new("dei:EntityRegistrantName", "c1", "Acme Corp");
        assert!(!text.has_numeric_value());
    }

    #[test]
    fn test_period_dates() {
        let mut fact = FactInstance::new("us-gaap:Revenues", "d1", "10");
        fact.period_start = Some("2023-01-01".to_string());
        fact.period_end = Some("2023-12-31T00:00:00".to_string());
        assert_eq!(fact.period_start_date(), NaiveDate::from_ymd_opt(2023, 1, 1));
        assert_eq!(fact.period_end_date(), NaiveDate::from_ymd_opt(2023, 12, 31));
    }

    #[test]
    fn test_metadata_typed_and_extra_keys() {
        let mut meta = NodeMetadata::default();
        meta.insert("balance", "debit");
        meta.insert("is_monetary", "true");
        meta.insert("source", "mapper");
        assert_eq!(meta.balance.as_deref(), Some("debit"));
        assert_eq!(meta.is_monetary, Some(true));
        assert_eq!(meta.get("source").as_deref(), Some("mapper"));
        assert!(!meta.is_empty());
    }

    #[test]
    fn test_statement_kind_detection() {
        let detect = |uri: &str| StatementKind::detect(uri, None);
        assert_eq!(
            detect("http://acme.com/role/ConsolidatedBalanceSheets"),
            StatementKind::BalanceSheet
        );
        assert_eq!(
            detect("http://acme.com/role/ConsolidatedStatementsOfOperations"),
            StatementKind::IncomeStatement
        );
        assert_eq!(detect("http://acme.com/role/CashFlows"), StatementKind::CashFlow);
        assert_eq!(
            StatementKind::detect("http://acme.com/role/R5", Some("Statement of Stockholders Equity")),
            StatementKind::Equity
        );
        assert_eq!(
            StatementKind::detect("http://acme.com/role/R9", Some("Segment Information")),
            StatementKind::Other
        );
        assert_eq!(StatementKind::CashFlow.to_string(), "CASH_FLOW");
    }

    #[test]
    fn test_position_id_uses_context() {
        let mut node = Node::line_item("us-gaap:Cash", "Cash", Some(5.0));
        node.position = Some(Position::new("BS", 2, 1));
        node.metadata.context_ref = Some("c-4".to_string());
        assert_eq!(node.position_str().as_deref(), Some("BS-002-001"));
        assert_eq!(node.position_id().as_deref(), Some("BS-002-001-c4"));
    }
}
