// Linkbase processing for XBRL
use crate::model::StatementKind;
use crate::{Error, Result};
use ahash::{AHashMap, AHashSet};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const STANDARD_LABEL_ROLE: &str = "http://www.xbrl.org/2003/role/label";

pub const PRESENTATION_SUFFIX: &str = "_pre.xml";
pub const CALCULATION_SUFFIX: &str = "_cal.xml";
pub const DEFINITION_SUFFIX: &str = "_def.xml";
pub const LABEL_SUFFIX: &str = "_lab.xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkbaseKind {
    Presentation,
    Calculation,
    Definition,
}

impl LinkbaseKind {
    fn link_element(self) -> &'static [u8] {
        match self {
            LinkbaseKind::Presentation => b"presentationLink",
            LinkbaseKind::Calculation => b"calculationLink",
            LinkbaseKind::Definition => b"definitionLink",
        }
    }

    fn arc_element(self) -> &'static [u8] {
        match self {
            LinkbaseKind::Presentation => b"presentationArc",
            LinkbaseKind::Calculation => b"calculationArc",
            LinkbaseKind::Definition => b"definitionArc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Locator {
    pub label: String,
    pub href: String,
    pub concept: String,
}

impl Locator {
    pub fn new(label: &str, href: &str) -> Self {
        Self {
            label: label.to_string(),
            href: href.to_string(),
            concept: concept_from_href(href).to_string(),
        }
    }
}

/// `schema.xsd#us-gaap_Assets` -> `us-gaap_Assets`; without a fragment the
/// last path segment is used.
pub fn concept_from_href(href: &str) -> &str {
    match href.split_once('#') {
        Some((_, fragment)) => fragment,
        None => href.rsplit('/').next().unwrap_or(href),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Arc {
    pub from: String,
    pub to: String,
    pub order: f64,
    /// Calculation only; 1.0 elsewhere.
    pub weight: f64,
    pub preferred_label: Option<String>,
    #[serde(rename = "use")]
    pub use_attr: String,
    pub priority: i32,
}

impl Arc {
    pub fn new(from: &str, to: &str, order: f64) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            order,
            weight: 1.0,
            preferred_label: None,
            use_attr: "optional".to_string(),
            priority: 0,
        }
    }

    pub fn is_prohibited(&self) -> bool {
        self.use_attr == "prohibited"
    }
}

/// Locators and arcs of one extended link (one statement).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatementRole {
    pub role_uri: String,
    pub title: Option<String>,
    pub kind: LinkbaseKind,
    pub locators: BTreeMap<String, Locator>,
    pub arcs: Vec<Arc>,
    /// Concepts that appear as arc sources but never as targets.
    pub roots: Vec<String>,
}

impl StatementRole {
    /// Assembles a role from raw locators and arcs. Arcs whose endpoints
    /// are not known locators are dropped.
    pub fn new(
        role_uri: &str,
        title: Option<&str>,
        kind: LinkbaseKind,
        locators: Vec<Locator>,
        arcs: Vec<Arc>,
    ) -> Self {
        let locators: BTreeMap<String, Locator> = locators
            .into_iter()
            .map(|loc| (loc.label.clone(), loc))
            .collect();

        let total = arcs.len();
        let arcs: Vec<Arc> = arcs
            .into_iter()
            .filter(|arc| locators.contains_key(&arc.from) && locators.contains_key(&arc.to))
            .collect();
        if arcs.len() < total {
            log::debug!(
                "Dropped {} arcs with unknown endpoints in {}",
                total - arcs.len(),
                role_uri
            );
        }

        let targets: AHashSet<&str> = arcs.iter().map(|a| a.to.as_str()).collect();
        let mut seen = AHashSet::new();
        let mut roots = Vec::new();
        for arc in &arcs {
            if targets.contains(arc.from.as_str()) || !seen.insert(arc.from.as_str()) {
                continue;
            }
            if let Some(loc) = locators.get(&arc.from) {
                roots.push(loc.concept.clone());
            }
        }

        Self {
            role_uri: role_uri.to_string(),
            title: title.map(str::to_string),
            kind,
            locators,
            arcs,
            roots,
        }
    }

    pub fn statement_kind(&self) -> StatementKind {
        StatementKind::detect(&self.role_uri, self.title.as_deref())
    }

    /// Concept behind a locator label.
    pub fn concept(&self, label: &str) -> Option<&str> {
        self.locators.get(label).map(|l| l.concept.as_str())
    }

    pub fn arcs_from<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a Arc> + 'a {
        self.arcs.iter().filter(move |a| a.from == label)
    }

    /// Last segment of the role URI.
    pub fn short_name(&self) -> &str {
        self.role_uri
            .rsplit(|c: char| c == '/' || c == '#')
            .find(|s| !s.is_empty())
            .unwrap_or(&self.role_uri)
    }

    pub fn is_empty(&self) -> bool {
        self.arcs.is_empty()
    }
}

// ============================================================================
// Labels
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelEntry {
    pub role: String,
    pub lang: Option<String>,
    pub text: String,
}

/// Concept labels from a label linkbase.
#[derive(Debug, Clone, Default)]
pub struct LabelSet {
    labels: AHashMap<String, Vec<LabelEntry>>,
}

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, concept: &str, role: &str, lang: Option<&str>, text: &str) {
        self.labels
            .entry(concept.to_string())
            .or_default()
            .push(LabelEntry {
                role: role.to_string(),
                lang: lang.map(str::to_string),
                text: text.to_string(),
            });
    }

    /// Preferred role first, then the standard label, then whatever exists.
    pub fn get(&self, concept: &str, preferred_role: Option<&str>) -> Option<&str> {
        let entries = self.labels.get(concept)?;
        preferred_role
            .and_then(|role| entries.iter().find(|e| e.role == role))
            .or_else(|| entries.iter().find(|e| e.role == STANDARD_LABEL_ROLE))
            .or_else(|| entries.first())
            .map(|e| e.text.as_str())
    }

    pub fn entries(&self, concept: &str) -> &[LabelEntry] {
        self.labels.get(concept).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

// ============================================================================
// File discovery
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkbaseFiles {
    pub presentation: Option<PathBuf>,
    pub calculation: Option<PathBuf>,
    pub definition: Option<PathBuf>,
    pub label: Option<PathBuf>,
}

impl LinkbaseFiles {
    pub fn found(&self) -> usize {
        [&self.presentation, &self.calculation, &self.definition, &self.label]
            .iter()
            .filter(|p| p.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.found() == 0
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Reads linkbase documents into [`StatementRole`]s. The `parse_*` entry
/// points never fail: a broken document yields nothing and the message is
/// kept in [`LinkbaseParser::last_error`]. The `try_parse_*` variants
/// return the error instead.
#[derive(Debug, Default)]
pub struct LinkbaseParser {
    last_error: Option<String>,
}

impl LinkbaseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn parse_presentation_linkbase<P: AsRef<Path>>(&mut self, path: P) -> Vec<StatementRole> {
        self.parse_file(LinkbaseKind::Presentation, path.as_ref())
    }

    pub fn parse_calculation_linkbase<P: AsRef<Path>>(&mut self, path: P) -> Vec<StatementRole> {
        self.parse_file(LinkbaseKind::Calculation, path.as_ref())
    }

    pub fn parse_definition_linkbase<P: AsRef<Path>>(&mut self, path: P) -> Vec<StatementRole> {
        self.parse_file(LinkbaseKind::Definition, path.as_ref())
    }

    pub fn parse_label_linkbase<P: AsRef<Path>>(&mut self, path: P) -> LabelSet {
        let path = path.as_ref();
        let result = read_text(path).and_then(|text| Self::try_parse_labels(&text));
        self.settle(result, path)
    }

    /// Non-raising parse of an in-memory document.
    pub fn parse_str(&mut self, kind: LinkbaseKind, text: &str) -> Vec<StatementRole> {
        let result = Self::try_parse_roles(kind, text);
        self.settle(result, Path::new("<memory>"))
    }

    pub fn try_parse_presentation(text: &str) -> Result<Vec<StatementRole>> {
        Self::try_parse_roles(LinkbaseKind::Presentation, text)
    }

    pub fn try_parse_calculation(text: &str) -> Result<Vec<StatementRole>> {
        Self::try_parse_roles(LinkbaseKind::Calculation, text)
    }

    pub fn try_parse_roles(kind: LinkbaseKind, text: &str) -> Result<Vec<StatementRole>> {
        let mut reader = Reader::from_str(strip_bom(text));
        let mut roles = Vec::new();
        let mut current: Option<RoleAccumulator> = None;
        let mut open = 0usize;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    open += 1;
                    Self::on_role_element(kind, &e, false, &mut current)?;
                }
                Event::Empty(e) => {
                    Self::on_role_element(kind, &e, true, &mut current)?;
                }
                Event::End(e) => {
                    open = open.saturating_sub(1);
                    if e.local_name().as_ref() == kind.link_element() {
                        if let Some(acc) = current.take() {
                            roles.push(acc.finish(kind));
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if open != 0 {
            return Err(Error::Parse(format!(
                "Unexpected end of linkbase: {} unclosed elements",
                open
            )));
        }

        log::debug!("Parsed {} {:?} roles", roles.len(), kind);
        Ok(roles)
    }

    fn on_role_element(
        kind: LinkbaseKind,
        e: &BytesStart<'_>,
        is_empty: bool,
        current: &mut Option<RoleAccumulator>,
    ) -> Result<()> {
        let name = e.local_name();
        let name = name.as_ref();

        if name == kind.link_element() {
            let attrs = read_attrs(e)?;
            match attr(&attrs, "role") {
                Some(role) if !is_empty => {
                    *current = Some(RoleAccumulator::new(role, attr(&attrs, "title")));
                }
                Some(role) => log::debug!("Skipping empty link {}", role),
                None => log::debug!("Skipping link element without role"),
            }
            return Ok(());
        }

        let Some(acc) = current.as_mut() else {
            return Ok(());
        };

        if name == b"loc" {
            let attrs = read_attrs(e)?;
            if let (Some(label), Some(href)) = (attr(&attrs, "label"), attr(&attrs, "href")) {
                acc.locators.push(Locator::new(label, href));
            }
        } else if name == kind.arc_element() {
            let attrs = read_attrs(e)?;
            let (Some(from), Some(to)) = (attr(&attrs, "from"), attr(&attrs, "to")) else {
                log::debug!("Skipping arc without endpoints in {}", acc.role_uri);
                return Ok(());
            };

            let mut arc = Arc::new(from, to, parse_or(attr(&attrs, "order"), 0.0));
            if kind == LinkbaseKind::Calculation {
                arc.weight = parse_or(attr(&attrs, "weight"), 1.0);
            }
            arc.preferred_label = attr(&attrs, "preferredLabel").map(str::to_string);
            if let Some(use_attr) = attr(&attrs, "use") {
                arc.use_attr = use_attr.to_string();
            }
            arc.priority = parse_or(attr(&attrs, "priority"), 0);
            acc.arcs.push(arc);
        }

        Ok(())
    }

    pub fn try_parse_labels(text: &str) -> Result<LabelSet> {
        let mut reader = Reader::from_str(strip_bom(text));
        let mut set = LabelSet::new();
        let mut link = LabelLinkAccumulator::default();
        let mut resource: Option<(String, LabelEntry)> = None;
        let mut open = 0usize;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    open += 1;
                    match e.local_name().as_ref() {
                        b"label" => {
                            let attrs = read_attrs(&e)?;
                            resource = attr(&attrs, "label").map(|label| {
                                (
                                    label.to_string(),
                                    LabelEntry {
                                        role: attr(&attrs, "role")
                                            .unwrap_or(STANDARD_LABEL_ROLE)
                                            .to_string(),
                                        lang: attr(&attrs, "lang").map(str::to_string),
                                        text: String::new(),
                                    },
                                )
                            });
                        }
                        other => link.on_element(other, &e)?,
                    }
                }
                Event::Empty(e) => link.on_element(e.local_name().as_ref(), &e)?,
                Event::Text(t) => {
                    if let Some((_, entry)) = resource.as_mut() {
                        entry.text.push_str(&t.unescape()?);
                    }
                }
                Event::CData(c) => {
                    if let Some((_, entry)) = resource.as_mut() {
                        entry.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
                Event::End(e) => {
                    open = open.saturating_sub(1);
                    match e.local_name().as_ref() {
                        b"label" => {
                            if let Some((label, mut entry)) = resource.take() {
                                entry.text = entry.text.trim().to_string();
                                link.resources.entry(label).or_default().push(entry);
                            }
                        }
                        b"labelLink" => std::mem::take(&mut link).resolve_into(&mut set),
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if open != 0 {
            return Err(Error::Parse(format!(
                "Unexpected end of label linkbase: {} unclosed elements",
                open
            )));
        }
        // Label resources outside a labelLink wrapper
        link.resolve_into(&mut set);
        Ok(set)
    }

    /// Locates linkbase files in `dir` by filename suffix. Not recursive;
    /// when several files share a suffix the first in name order wins.
    pub fn find_linkbase_files<P: AsRef<Path>>(dir: P) -> Result<LinkbaseFiles> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let mut files = LinkbaseFiles::default();
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let name = name.to_lowercase();
            let slot = if name.ends_with(PRESENTATION_SUFFIX) {
                &mut files.presentation
            } else if name.ends_with(CALCULATION_SUFFIX) {
                &mut files.calculation
            } else if name.ends_with(DEFINITION_SUFFIX) {
                &mut files.definition
            } else if name.ends_with(LABEL_SUFFIX) {
                &mut files.label
            } else {
                continue;
            };
            if slot.is_none() {
                *slot = Some(path);
            }
        }

        Ok(files)
    }

    fn parse_file(&mut self, kind: LinkbaseKind, path: &Path) -> Vec<StatementRole> {
        let result = read_text(path).and_then(|text| Self::try_parse_roles(kind, &text));
        self.settle(result, path)
    }

    fn settle<T: Default>(&mut self, result: Result<T>, path: &Path) -> T {
        match result {
            Ok(value) => {
                self.last_error = None;
                value
            }
            Err(e) => {
                log::warn!("Failed to parse {}: {}", path.display(), e);
                self.last_error = Some(e.to_string());
                T::default()
            }
        }
    }
}

struct RoleAccumulator {
    role_uri: String,
    title: Option<String>,
    locators: Vec<Locator>,
    arcs: Vec<Arc>,
}

impl RoleAccumulator {
    fn new(role_uri: &str, title: Option<&str>) -> Self {
        Self {
            role_uri: role_uri.to_string(),
            title: title.map(str::to_string),
            locators: Vec::new(),
            arcs: Vec::new(),
        }
    }

    fn finish(self, kind: LinkbaseKind) -> StatementRole {
        StatementRole::new(
            &self.role_uri,
            self.title.as_deref(),
            kind,
            self.locators,
            self.arcs,
        )
    }
}

#[derive(Default)]
struct LabelLinkAccumulator {
    // locator label -> concept
    locators: AHashMap<String, String>,
    // resource label -> labels
    resources: AHashMap<String, Vec<LabelEntry>>,
    arcs: Vec<(String, String)>,
}

impl LabelLinkAccumulator {
    fn on_element(&mut self, name: &[u8], e: &BytesStart<'_>) -> Result<()> {
        match name {
            b"loc" => {
                let attrs = read_attrs(e)?;
                if let (Some(label), Some(href)) = (attr(&attrs, "label"), attr(&attrs, "href")) {
                    self.locators
                        .insert(label.to_string(), concept_from_href(href).to_string());
                }
            }
            b"labelArc" => {
                let attrs = read_attrs(e)?;
                if let (Some(from), Some(to)) = (attr(&attrs, "from"), attr(&attrs, "to")) {
                    self.arcs.push((from.to_string(), to.to_string()));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn resolve_into(self, set: &mut LabelSet) {
        for (from, to) in &self.arcs {
            let (Some(concept), Some(entries)) = (self.locators.get(from), self.resources.get(to))
            else {
                continue;
            };
            for entry in entries {
                set.insert(concept, &entry.role, entry.lang.as_deref(), &entry.text);
            }
        }
    }
}

fn read_text(path: &Path) -> Result<String> {
    let data = std::fs::read(path)?;
    String::from_utf8(data).map_err(|_| Error::Parse("Invalid UTF-8 in linkbase".to_string()))
}

// Skip BOM if present
fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

/// Attributes keyed by local name, so `xlink:from` reads as `from`.
fn read_attrs(e: &BytesStart<'_>) -> Result<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.push((key, value));
    }
    Ok(attrs)
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn parse_or<T: std::str::FromStr>(value: Option<&str>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
