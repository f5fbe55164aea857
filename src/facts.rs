// Fact loading and lookup by concept and context
use crate::builder::{parse_decimals, string_field};
use crate::model::{FactInstance, PeriodKind};
use crate::{Error, Result};
use ahash::{AHashMap, AHashSet};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Period and dimensional scope of a context.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextInfo {
    pub id: String,
    pub period_type: Option<PeriodKind>,
    pub instant: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub dimensions: BTreeMap<String, String>,
}

impl ContextInfo {
    fn from_json(id: &str, data: &Map<String, Value>) -> Self {
        // Period fields may sit under "period" or on the context itself
        let period = data.get("period").and_then(Value::as_object).unwrap_or(data);

        let instant = string_field(period, &["instant"]).map(str::to_string);
        let start_date = string_field(period, &["startDate", "start_date"]).map(str::to_string);
        let end_date = string_field(period, &["endDate", "end_date"]).map(str::to_string);
        let period_type = if instant.is_some() {
            Some(PeriodKind::Instant)
        } else if start_date.is_some() || end_date.is_some() {
            Some(PeriodKind::Duration)
        } else {
            None
        };

        Self {
            id: id.to_string(),
            period_type,
            instant,
            start_date,
            end_date,
            dimensions: string_map(data.get("dimensions")),
        }
    }

    pub fn is_dimensional(&self) -> bool {
        !self.dimensions.is_empty()
    }
}

/// Facts indexed by exact concept, by a separator-agnostic key, by bare
/// local name and by context.
#[derive(Debug, Default)]
pub struct FactIndex {
    facts: Vec<FactInstance>,
    by_concept: AHashMap<String, Vec<usize>>,
    by_key: AHashMap<String, Vec<usize>>,
    by_local_name: AHashMap<String, Vec<usize>>,
    by_context: AHashMap<String, Vec<usize>>,
    contexts: AHashMap<String, ContextInfo>,
    units: AHashMap<String, String>,
    dropped: usize,
}

/// `ifrs-full:Assets` and `ifrs-full_Assets` both map to `ifrs_full_assets`.
pub fn normalize_concept(concept: &str) -> String {
    concept
        .replace(|c: char| c == ':' || c == '-', "_")
        .to_lowercase()
}

/// Concept without its prefix, split on `:` or else on the first `_`.
pub fn fact_local_name(concept: &str) -> &str {
    if let Some((_, local)) = concept.split_once(':') {
        return local;
    }
    match concept.split_once('_') {
        Some((_, local)) if !local.is_empty() => local,
        _ => concept,
    }
}

impl FactIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        let data: Value = serde_json::from_str(&text)?;
        self.load_value(&data)
    }

    /// Loads facts, contexts and units from either a flat document or one
    /// wrapped in `"instance"`. Returns the number of facts indexed.
    pub fn load_value(&mut self, data: &Value) -> Result<usize> {
        let root = data
            .as_object()
            .ok_or_else(|| Error::Parse("Fact document must be a JSON object".to_string()))?;
        let instance = root.get("instance").and_then(Value::as_object);
        let section = |name: &str| root.get(name).or_else(|| instance.and_then(|i| i.get(name)));

        if let Some(contexts) = section("contexts") {
            self.load_contexts(contexts);
        }
        if let Some(units) = section("units") {
            self.load_units(units);
        }

        let facts: &[Value] = match section("facts") {
            Some(Value::Array(facts)) => facts.as_slice(),
            Some(_) => return Err(Error::Parse("\"facts\" must be an array".to_string())),
            None => &[],
        };

        let before = self.facts.len();
        for fact in facts.iter().filter_map(Value::as_object) {
            match self.fact_from_json(fact) {
                Some(fact) => {
                    self.add_fact(fact);
                }
                None => self.dropped += 1,
            }
        }

        let loaded = self.facts.len() - before;
        log::info!(
            "Indexed {} facts ({} dropped), {} contexts, {} units",
            loaded,
            self.dropped,
            self.contexts.len(),
            self.units.len()
        );
        Ok(loaded)
    }

    fn load_contexts(&mut self, contexts: &Value) {
        match contexts {
            Value::Object(map) => {
                for (id, data) in map {
                    if let Some(data) = data.as_object() {
                        self.contexts.insert(id.clone(), ContextInfo::from_json(id, data));
                    }
                }
            }
            Value::Array(list) => {
                for data in list.iter().filter_map(Value::as_object) {
                    if let Some(id) = string_field(data, &["id", "context_id"]) {
                        self.contexts.insert(id.to_string(), ContextInfo::from_json(id, data));
                    }
                }
            }
            _ => log::warn!("Ignoring contexts section that is neither a map nor a list"),
        }
    }

    fn load_units(&mut self, units: &Value) {
        let measure = |data: &Value| match data {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => string_field(obj, &["measure", "unit", "name"]).map(str::to_string),
            _ => None,
        };
        match units {
            Value::Object(map) => {
                for (id, data) in map {
                    let text = measure(data).unwrap_or_else(|| id.clone());
                    self.units.insert(id.clone(), text);
                }
            }
            Value::Array(list) => {
                for data in list.iter().filter_map(Value::as_object) {
                    if let Some(id) = string_field(data, &["id", "unit_id"]) {
                        let text = string_field(data, &["measure", "unit", "name"]).unwrap_or(id);
                        self.units.insert(id.to_string(), text.to_string());
                    }
                }
            }
            _ => log::warn!("Ignoring units section that is neither a map nor a list"),
        }
    }

    fn fact_from_json(&self, data: &Map<String, Value>) -> Option<FactInstance> {
        let concept = string_field(data, &["concept", "name", "qname"])?;
        let Some(context_ref) = string_field(data, &["context_ref", "contextRef"]) else {
            log::debug!("Dropping fact {} without context", concept);
            return None;
        };

        let value = ["value", "fact_value"]
            .iter()
            .filter_map(|k| data.get(*k))
            .find_map(scalar_text);

        let mut fact = FactInstance {
            concept: concept.to_string(),
            context_ref: context_ref.to_string(),
            value,
            unit: string_field(data, &["unit", "unit_ref", "unitRef"]).map(str::to_string),
            decimals: data.get("decimals").and_then(parse_decimals),
            period_type: None,
            period_start: None,
            period_end: None,
            dimensions: string_map(data.get("dimensions")),
        };

        match self.contexts.get(context_ref).filter(|c| c.period_type.is_some()) {
            Some(context) => {
                fact.period_type = context.period_type;
                fact.period_start = context.start_date.clone();
                fact.period_end = context.instant.clone().or_else(|| context.end_date.clone());
                if fact.dimensions.is_empty() {
                    fact.dimensions = context.dimensions.clone();
                }
            }
            None => {
                fact.period_type = string_field(data, &["period_type"]).and_then(PeriodKind::parse);
                fact.period_start =
                    string_field(data, &["period_start", "startDate"]).map(str::to_string);
                fact.period_end =
                    string_field(data, &["period_end", "endDate", "instant"]).map(str::to_string);
            }
        }

        Some(fact)
    }

    /// Indexes one fact. Facts without a context reference are dropped.
    pub fn add_fact(&mut self, fact: FactInstance) -> bool {
        if fact.context_ref.trim().is_empty() {
            self.dropped += 1;
            return false;
        }

        let idx = self.facts.len();
        self.by_concept.entry(fact.concept.clone()).or_default().push(idx);
        self.by_key
            .entry(normalize_concept(&fact.concept))
            .or_default()
            .push(idx);
        self.by_local_name
            .entry(fact_local_name(&fact.concept).to_lowercase())
            .or_default()
            .push(idx);
        self.by_context
            .entry(fact.context_ref.clone())
            .or_default()
            .push(idx);
        self.facts.push(fact);
        true
    }

    fn collect(&self, indices: Option<&Vec<usize>>) -> Vec<&FactInstance> {
        indices
            .map(|ids| ids.iter().map(|i| &self.facts[*i]).collect())
            .unwrap_or_default()
    }

    /// Facts for a concept in any separator style. When the normalized key
    /// finds nothing, falls back to the bare local name, which can match
    /// the same name in another namespace; that fallback is deduplicated by
    /// (concept, context).
    pub fn get_facts_for_concept(&self, concept: &str) -> Vec<&FactInstance> {
        let found = self.collect(self.by_key.get(&normalize_concept(concept)));
        if !found.is_empty() {
            return found;
        }

        let mut seen = AHashSet::new();
        self.collect(self.by_local_name.get(&fact_local_name(concept).to_lowercase()))
            .into_iter()
            .filter(|f| seen.insert((f.concept.as_str(), f.context_ref.as_str())))
            .collect()
    }

    /// Facts for a concept restricted to one context.
    pub fn get_facts(&self, concept: &str, context_ref: &str) -> Vec<&FactInstance> {
        self.get_facts_for_concept(concept)
            .into_iter()
            .filter(|f| f.context_ref == context_ref)
            .collect()
    }

    pub fn get_facts_exact(&self, concept: &str) -> Vec<&FactInstance> {
        self.collect(self.by_concept.get(concept))
    }

    pub fn numeric_facts_for_concept(&self, concept: &str) -> Vec<&FactInstance> {
        self.get_facts_for_concept(concept)
            .into_iter()
            .filter(|f| f.has_numeric_value())
            .collect()
    }

    pub fn facts_for_context(&self, context_ref: &str) -> Vec<&FactInstance> {
        self.collect(self.by_context.get(context_ref))
    }

    /// Facts grouped by (concept, context), in key order.
    pub fn groups(&self) -> BTreeMap<(&str, &str), Vec<&FactInstance>> {
        let mut groups: BTreeMap<(&str, &str), Vec<&FactInstance>> = BTreeMap::new();
        for fact in &self.facts {
            groups
                .entry((fact.concept.as_str(), fact.context_ref.as_str()))
                .or_default()
                .push(fact);
        }
        groups
    }

    pub fn available_contexts(&self) -> Vec<&str> {
        let mut contexts: Vec<&str> = self.by_context.keys().map(String::as_str).collect();
        contexts.sort_unstable();
        contexts
    }

    pub fn context_info(&self, context_ref: &str) -> Option<&ContextInfo> {
        self.contexts.get(context_ref)
    }

    pub fn unit(&self, unit_ref: &str) -> Option<&str> {
        self.units.get(unit_ref).map(String::as_str)
    }

    pub fn facts(&self) -> &[FactInstance] {
        &self.facts
    }

    #[inline]
    pub fn total_facts(&self) -> usize {
        self.facts.len()
    }

    pub fn numeric_fact_count(&self) -> usize {
        self.facts.iter().filter(|f| f.has_numeric_value()).count()
    }

    pub fn concept_count(&self) -> usize {
        self.by_concept.len()
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| scalar_text(v).map(|v| (k.clone(), v)))
                .collect()
        })
        .unwrap_or_default()
}
