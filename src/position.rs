// Position identifiers and the statement-type code registry
use crate::hierarchy::Hierarchy;
use crate::model::Position;
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

pub const CODE_LENGTH: usize = 2;
pub const FALLBACK_CODE: &str = "XX";
pub const UNKNOWN_TYPE: &str = "UNKNOWN";

// Highest offset probed inside the first word
const MAX_LETTER_OFFSET: usize = 10;
const CODE_ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Registry handle shared between builders running on different threads.
pub type SharedRegistry = Arc<Mutex<StatementTypeRegistry>>;

/// Append-only, bidirectional map between uppercase statement-type names
/// and their two-character codes.
#[derive(Debug, Clone, Default)]
pub struct StatementTypeRegistry {
    type_to_code: AHashMap<String, String>,
    code_to_type: AHashMap<String, String>,
}

impl StatementTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    /// Returns the code bound to `statement_type`, generating and binding a
    /// new one the first time the (uppercased) type is seen.
    pub fn get_or_generate_code(&mut self, statement_type: &str) -> String {
        let key = statement_type.trim().to_uppercase();
        if let Some(code) = self.type_to_code.get(&key) {
            return code.clone();
        }

        let code = self.generate_code(&key);
        log::debug!("Registered statement type {} as {}", key, code);
        self.type_to_code.insert(key.clone(), code.clone());
        // An exhausted digest probe can hand out a bound code; keep the
        // original reverse binding in that case
        self.code_to_type.entry(code.clone()).or_insert(key);
        code
    }

    pub fn code_for(&self, statement_type: &str) -> Option<&str> {
        self.type_to_code
            .get(&statement_type.trim().to_uppercase())
            .map(String::as_str)
    }

    pub fn statement_type(&self, code: &str) -> Option<&str> {
        self.code_to_type
            .get(&code.to_uppercase())
            .map(String::as_str)
    }

    /// `(type, code)` pairs sorted by type name.
    pub fn registered_types(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .type_to_code
            .iter()
            .map(|(t, c)| (t.clone(), c.clone()))
            .collect();
        pairs.sort();
        pairs
    }

    pub fn len(&self) -> usize {
        self.type_to_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.type_to_code.is_empty()
    }

    pub fn clear(&mut self) {
        self.type_to_code.clear();
        self.code_to_type.clear();
    }

    /// Formats a full identifier, registering the statement type if needed.
    pub fn encode(
        &mut self,
        statement_type: &str,
        level: u32,
        sibling: u32,
        context_ref: Option<&str>,
    ) -> String {
        let code = self.get_or_generate_code(statement_type);
        format_id(&code, level, sibling, context_ref)
    }

    pub fn decode(&self, id: &str) -> ParsedPositionId {
        parse_position_id(id, self)
    }

    fn is_available(&self, code: &str, key: &str) -> bool {
        match self.code_to_type.get(code) {
            Some(bound) => bound == key,
            None => true,
        }
    }

    fn generate_code(&self, key: &str) -> String {
        let words: Vec<Vec<char>> = key
            .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
            .filter(|w| !w.is_empty())
            .map(|w| w.chars().collect())
            .collect();

        let Some(first) = words.first() else {
            if self.is_available(FALLBACK_CODE, key) {
                return FALLBACK_CODE.to_string();
            }
            return self.digest_code(key);
        };

        let mut candidates: Vec<String> = Vec::new();
        if let Some(second) = words.get(1) {
            candidates.push([first[0], second[0]].iter().collect());
        }
        if first.len() >= 2 {
            candidates.push(first[..2].iter().collect());
        }
        for offset in 1..first.len().min(MAX_LETTER_OFFSET) {
            candidates.push([first[0], first[offset]].iter().collect());
        }

        candidates
            .into_iter()
            .find(|code| self.is_available(code, key))
            .unwrap_or_else(|| self.digest_code(key))
    }

    /// Deterministic fallback: FNV-1a digest, probing forward through the
    /// alphanumeric code space when the digest itself is taken.
    fn digest_code(&self, key: &str) -> String {
        let hash = fnv1a(key.as_bytes());
        let digest = format!("{:02X}", hash & 0xFF);
        if self.is_available(&digest, key) {
            return digest;
        }

        let space = CODE_ALPHABET.len() * CODE_ALPHABET.len();
        let start = hash as usize % space;
        for step in 0..space {
            let idx = (start + step) % space;
            let code: String = [
                CODE_ALPHABET[idx / CODE_ALPHABET.len()] as char,
                CODE_ALPHABET[idx % CODE_ALPHABET.len()] as char,
            ]
            .iter()
            .collect();
            if self.is_available(&code, key) {
                return code;
            }
        }

        log::warn!("Statement type code space exhausted for {}", key);
        digest
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

// ============================================================================
// Formatting and parsing
// ============================================================================

/// `{CODE}-{LEVEL:03}-{SIBLING:03}`
pub fn format_position(code: &str, level: u32, sibling: u32) -> String {
    format!("{}-{:03}-{:03}", code, level, sibling)
}

/// Drops `-` and `_` so `c-4`, `c_4` and `c4` all read `c4`.
pub fn normalize_context_ref(context_ref: &str) -> String {
    context_ref
        .trim()
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect()
}

pub fn add_context_to_position(position: &str, context_ref: &str) -> String {
    let context = normalize_context_ref(context_ref);
    if context.is_empty() {
        position.to_string()
    } else {
        format!("{}-{}", position, context)
    }
}

pub fn format_id(code: &str, level: u32, sibling: u32, context_ref: Option<&str>) -> String {
    let position = format_position(code, level, sibling);
    match context_ref {
        Some(context) => add_context_to_position(&position, context),
        None => position,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResolvedType {
    Known(String),
    Unknown,
}

impl ResolvedType {
    pub fn as_str(&self) -> &str {
        match self {
            ResolvedType::Known(name) => name,
            ResolvedType::Unknown => UNKNOWN_TYPE,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, ResolvedType::Known(_))
    }
}

impl fmt::Display for ResolvedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedPositionId {
    pub code: String,
    pub statement_type: ResolvedType,
    pub level: u32,
    pub sibling: u32,
    pub context: Option<String>,
    /// Identifier without the context suffix.
    pub position: String,
}

impl Default for ParsedPositionId {
    fn default() -> Self {
        Self {
            code: String::new(),
            statement_type: ResolvedType::Unknown,
            level: 0,
            sibling: 0,
            context: None,
            position: String::new(),
        }
    }
}

/// Inverse of [`format_id`]. Never fails: malformed input yields the
/// defaults and unparsable numbers read as 0.
pub fn parse_position_id(id: &str, registry: &StatementTypeRegistry) -> ParsedPositionId {
    let parts: Vec<&str> = id.trim().split('-').collect();
    if parts.len() < 3 {
        return ParsedPositionId::default();
    }

    let code = parts[0].to_string();
    let level = parts[1].parse().unwrap_or(0);
    let sibling = parts[2].parse().unwrap_or(0);
    let context: String = parts[3..].concat();

    let statement_type = match registry.statement_type(&code) {
        Some(name) => ResolvedType::Known(name.to_string()),
        None => ResolvedType::Unknown,
    };

    ParsedPositionId {
        position: format_position(&code, level, sibling),
        code,
        statement_type,
        level,
        sibling,
        context: (!context.is_empty()).then_some(context),
    }
}

/// Stamps every node with its position in one pre-order walk. Must run
/// after the final sort. Nodes without a context reference get
/// `default_context`. Returns the number of nodes stamped.
pub fn assign_positions(tree: &mut Hierarchy, code: &str, default_context: Option<&str>) -> usize {
    let order: Vec<_> = tree.preorder(tree.root()).collect();
    let mut counters: Vec<u32> = Vec::new();

    for id in &order {
        let node = tree.node_mut(*id);
        let depth = node.depth as usize;
        // Deeper counters belong to a finished sibling subtree
        counters.truncate(depth + 1);
        if counters.len() <= depth {
            counters.resize(depth + 1, 0);
        }
        counters[depth] += 1;

        node.position = Some(Position::new(code, node.depth, counters[depth]));
        if node.metadata.context_ref.is_none() {
            node.metadata.context_ref = default_context.map(str::to_string);
        }
    }

    order.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Node;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_standard_statement_codes() {
        let mut registry = StatementTypeRegistry::new();
        assert_eq!(registry.get_or_generate_code("BALANCE_SHEET"), "BS");
        assert_eq!(registry.get_or_generate_code("INCOME_STATEMENT"), "IS");
        assert_eq!(registry.get_or_generate_code("CASH_FLOW"), "CF");
        assert_eq!(registry.get_or_generate_code("EQUITY"), "EQ");
        assert_eq!(registry.get_or_generate_code("OTHER"), "OT");
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_registry_idempotent_and_case_insensitive() {
        let mut registry = StatementTypeRegistry::new();
        let first = registry.get_or_generate_code("BALANCE_SHEET");
        assert_eq!(registry.get_or_generate_code("BALANCE_SHEET"), first);
        assert_eq!(registry.get_or_generate_code("balance_sheet"), first);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.statement_type("bs"), Some("BALANCE_SHEET"));
    }

    #[test]
    fn test_collisions_fall_through_strategies() {
        let mut registry = StatementTypeRegistry::new();
        assert_eq!(registry.get_or_generate_code("BALANCE_SHEET"), "BS");
        // BS taken, falls to the first two letters
        assert_eq!(registry.get_or_generate_code("BALANCE_SUMMARY"), "BA");
        // BS and BA taken, offset probing reaches N
        assert_eq!(registry.get_or_generate_code("BANK_STATEMENT"), "BN");
        assert_eq!(registry.code_for("bank_statement"), Some("BN"));
        assert_eq!(registry.code_for("bank-statement"), None, "separators are part of the key");
    }

    #[test]
    fn test_non_ascii_letters_start_words() {
        let mut registry = StatementTypeRegistry::new();
        assert_eq!(registry.get_or_generate_code("BILANZ_ÜBERSICHT"), "BÜ");
        assert_eq!(registry.get_or_generate_code("ÉTAT FINANCIER"), "ÉF");
        assert_eq!(registry.statement_type("bü"), Some("BILANZ_ÜBERSICHT"));
    }

    #[test]
    fn test_digest_fallback_terminates() {
        let mut registry = StatementTypeRegistry::new();
        // A single letter has no letter-based candidate
        let code = registry.get_or_generate_code("B");
        assert_eq!(code.len(), CODE_LENGTH);
        assert!(code.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(StatementTypeRegistry::new().get_or_generate_code("B"), code);

        assert_eq!(registry.get_or_generate_code("__"), FALLBACK_CODE);
        // A second wordless type cannot reuse the fallback code
        let other = registry.get_or_generate_code("--");
        assert_ne!(other, FALLBACK_CODE);
        assert_eq!(other.len(), CODE_LENGTH);

        let mut crowded = StatementTypeRegistry::new();
        crowded.code_to_type.insert(code.clone(), "SOMETHING_ELSE".to_string());
        let probed = crowded.get_or_generate_code("B");
        assert_ne!(probed, code);
        assert_eq!(probed.len(), CODE_LENGTH);
    }

    #[test]
    fn test_format_and_parse_example() {
        let mut registry = StatementTypeRegistry::new();
        let code = registry.get_or_generate_code("BALANCE_SHEET");
        let id = format_id(&code, 2, 1, Some("c-4"));
        assert_eq!(id, "BS-002-001-c4");

        let parsed = parse_position_id(&id, &registry);
        assert_eq!(parsed.code, "BS");
        assert_eq!(parsed.level, 2);
        assert_eq!(parsed.sibling, 1);
        assert_eq!(parsed.context.as_deref(), Some("c4"));
        assert_eq!(parsed.statement_type, ResolvedType::Known("BALANCE_SHEET".to_string()));
        assert_eq!(parsed.position, "BS-002-001");
    }

    #[test]
    fn test_round_trip() {
        let mut registry = StatementTypeRegistry::new();
        for (ty, level, sibling, context) in [
            ("CASH_FLOW", 0, 1, Some("FY2023")),
            ("EQUITY", 999, 999, Some("ctx_2023-12-31")),
            ("INCOME_STATEMENT", 7, 42, None),
        ] {
            let id = registry.encode(ty, level, sibling, context);
            let parsed = registry.decode(&id);
            assert_eq!(parsed.level, level);
            assert_eq!(parsed.sibling, sibling);
            assert_eq!(parsed.context, context.map(normalize_context_ref));
            assert_eq!(parsed.statement_type.as_str(), ty);
        }
    }

    #[test]
    fn test_context_normalization() {
        for raw in ["c-4", "c_4", "c4"] {
            assert_eq!(normalize_context_ref(raw), "c4");
        }
        assert_eq!(add_context_to_position("IS-001-003", "-_"), "IS-001-003");
    }

    #[test]
    fn test_parse_never_fails() {
        let registry = StatementTypeRegistry::new();
        assert_eq!(parse_position_id("garbage", &registry), ParsedPositionId::default());
        assert_eq!(parse_position_id("", &registry), ParsedPositionId::default());

        let parsed = parse_position_id("ZZ-abc-002", &registry);
        assert_eq!(parsed.statement_type, ResolvedType::Unknown);
        assert_eq!(parsed.statement_type.to_string(), "UNKNOWN");
        assert_eq!(parsed.level, 0);
        assert_eq!(parsed.sibling, 2);
        assert_eq!(parsed.context, None);
    }

    #[test]
    fn test_assign_positions_resets_deeper_counters() {
        let mut tree = Hierarchy::new(Node::root("Balance Sheet", "role:bs"));
        let root = tree.root();
        let assets = tree.insert(Node::abstract_item("x:AssetsAbstract", "Assets", 1.0));
        let cash = tree.insert(Node::line_item("x:Cash", "Cash", Some(1.0)));
        let recv = tree.insert(Node::line_item("x:Receivables", "Receivables", Some(2.0)));
        let liabs = tree.insert(Node::abstract_item("x:LiabilitiesAbstract", "Liabilities", 2.0));
        let debt = tree.insert(Node::line_item("x:Debt", "Debt", Some(3.0)));
        tree.add_child(root, assets).unwrap();
        tree.add_child(assets, cash).unwrap();
        tree.add_child(assets, recv).unwrap();
        tree.add_child(root, liabs).unwrap();
        tree.add_child(liabs, debt).unwrap();
        tree.node_mut(debt).metadata.context_ref = Some("c_9".to_string());

        assert_eq!(assign_positions(&mut tree, "BS", Some("c-1")), 6);

        let ids: Vec<String> = tree
            .preorder(root)
            .filter_map(|id| tree.node(id).position_id())
            .collect();
        assert_eq!(
            ids,
            vec![
                "BS-000-001-c1",
                "BS-001-001-c1",
                "BS-002-001-c1",
                "BS-002-002-c1",
                "BS-001-002-c1",
                "BS-002-001-c9",
            ]
        );
    }
}
