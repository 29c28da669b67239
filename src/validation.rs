//! Validation System - Four Layers, One Gate
//!
//! Rules produce structured violations and never short-circuit each other.
//! Layers 1-3 look at one fragment at a time; layer 4 needs the whole run.
//! A run may publish only when every layer of every fragment is clean and
//! no run-level rule fired.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use crate::config::LimitsConfig;
use crate::content::PageId;
use crate::escape::unwrap_cdata;
use crate::fragment::{
    outline, raw_body, Fragment, FragmentOutline, OutlineError, BODY_ELEMENT, FILE_NAME_PATTERN,
    ROOT_ELEMENT,
};
use crate::hashing::sha256_hex;
use crate::templates::{NavKind, Navigation};

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static WELL_FORMED_CHECKS: AtomicU32 = AtomicU32::new(0);

/// Number of fragments that went through layer 1 since the last reset.
#[cfg(feature = "test-hooks")]
pub fn get_well_formed_check_count() -> u32 {
    WELL_FORMED_CHECKS.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_well_formed_check_count() {
    WELL_FORMED_CHECKS.store(0, Ordering::SeqCst);
}

static STYLE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<style[^>]*>(.*?)</style>").expect("style pattern is valid")
});

/// (rule, description, pattern) screened against every embedded page.
static SECURITY_PATTERNS: LazyLock<Vec<(&'static str, &'static str, Regex)>> =
    LazyLock::new(|| {
        [
            ("event_handler", "inline event handler attribute", r"(?i)\son[a-z]+\s*="),
            ("eval_call", "eval() call", r"\beval\s*\("),
            ("function_constructor", "Function() constructor call", r"\bFunction\s*\("),
            (
                "javascript_url",
                "javascript: URL in a link attribute",
                r#"(?i)\b(?:href|src|action|formaction)\s*=\s*["']?\s*javascript:"#,
            ),
        ]
        .into_iter()
        .map(|(rule, description, pattern)| {
            (rule, description, Regex::new(pattern).expect("security pattern is valid"))
        })
        .collect()
    });

const SNIPPET_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    WellFormed,
    Schema,
    Security,
    Integration,
}

impl Layer {
    pub const ALL: [Layer; 4] = [
        Layer::WellFormed,
        Layer::Schema,
        Layer::Security,
        Layer::Integration,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub page: Option<PageId>,
    pub layer: Layer,
    pub rule: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl ValidationViolation {
    pub fn new(layer: Layer, rule: &str, message: impl Into<String>) -> Self {
        Self {
            page: None,
            layer,
            rule: rule.to_string(),
            message: message.into(),
            location: None,
            expected: None,
            actual: None,
        }
    }

    pub fn for_page(mut self, page: PageId) -> Self {
        self.page = Some(page);
        self
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn expected_actual(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerResult {
    pub layer: Layer,
    pub passed: bool,
    pub violations: Vec<ValidationViolation>,
}

impl LayerResult {
    pub fn new(layer: Layer, violations: Vec<ValidationViolation>) -> Self {
        Self {
            layer,
            passed: violations.is_empty(),
            violations,
        }
    }
}

/// Verdict for one fragment across all four layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub page: PageId,
    pub file_name: String,
    pub layers: Vec<LayerResult>,
}

impl ValidationResult {
    pub fn new(page: PageId, file_name: &str, layers: Vec<LayerResult>) -> Self {
        Self {
            valid: layers.iter().all(|l| l.passed),
            page,
            file_name: file_name.to_string(),
            layers,
        }
    }

    pub fn push_layer(&mut self, result: LayerResult) {
        self.valid &= result.passed;
        self.layers.push(result);
    }

    pub fn layer(&self, layer: Layer) -> Option<&LayerResult> {
        self.layers.iter().find(|l| l.layer == layer)
    }

    pub fn violations(&self) -> impl Iterator<Item = &ValidationViolation> {
        self.layers.iter().flat_map(|l| l.violations.iter())
    }
}

/// A fragment plus its parse, shared by every rule.
#[derive(Debug, Clone)]
pub struct FragmentSubject {
    pub fragment: Fragment,
    pub outline: Result<FragmentOutline, OutlineError>,
}

impl FragmentSubject {
    pub fn new(fragment: Fragment) -> Self {
        #[cfg(feature = "test-hooks")]
        WELL_FORMED_CHECKS.fetch_add(1, Ordering::SeqCst);

        let outline = outline(&fragment.xml);
        Self { fragment, outline }
    }

    pub fn page(&self) -> PageId {
        self.fragment.page
    }

    /// The embedded page, recovered as well as the fragment allows.
    pub fn payload(&self) -> Cow<'_, str> {
        match &self.outline {
            Ok(parsed) => Cow::Borrowed(&parsed.payload),
            Err(_) => raw_body(&self.fragment.xml)
                .and_then(unwrap_cdata)
                .map(Cow::Owned)
                .unwrap_or(Cow::Borrowed(&self.fragment.xml)),
        }
    }
}

/// Validation rule trait - produces violations for one fragment
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn layer(&self) -> Layer;
    fn validate(&self, subject: &FragmentSubject) -> Vec<ValidationViolation>;
}

/// Everything a run-level rule gets to see.
pub struct RunInput<'a> {
    pub subjects: &'a [&'a FragmentSubject],
    pub expected: &'a [PageId],
    pub shared_stylesheet: &'a str,
}

/// Run-level rule trait - needs every fragment of the run at once
pub trait RunRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn layer(&self) -> Layer;
    fn validate(&self, input: &RunInput<'_>) -> Vec<ValidationViolation>;
}

fn violation(rule: &dyn ValidationRule, subject: &FragmentSubject, message: impl Into<String>) -> ValidationViolation {
    ValidationViolation::new(rule.layer(), rule.name(), message).for_page(subject.page())
}

fn snippet(text: &str, start: usize) -> String {
    text[start..].chars().take(SNIPPET_CHARS).collect()
}

// --- Layer 1: well-formedness ---

pub struct WellFormedRule;

impl ValidationRule for WellFormedRule {
    fn name(&self) -> &'static str { "xml_parse" }
    fn layer(&self) -> Layer { Layer::WellFormed }

    fn validate(&self, subject: &FragmentSubject) -> Vec<ValidationViolation> {
        match &subject.outline {
            Ok(_) => vec![],
            Err(e) => vec![violation(self, subject, format!("XML parse error: {}", e.message))
                .at(format!("byte {}", e.position))],
        }
    }
}

// --- Layer 2: structure and size ---

pub struct SingleRootRule;

impl ValidationRule for SingleRootRule {
    fn name(&self) -> &'static str { "single_root" }
    fn layer(&self) -> Layer { Layer::Schema }

    fn validate(&self, subject: &FragmentSubject) -> Vec<ValidationViolation> {
        let Ok(parsed) = &subject.outline else { return vec![] };
        if parsed.roots.len() == 1 && parsed.roots[0] == ROOT_ELEMENT {
            return vec![];
        }
        vec![violation(self, subject, "fragment must have exactly one root element")
            .expected_actual(format!("<{ROOT_ELEMENT}>"), parsed.roots.join(", "))]
    }
}

pub struct SingleBodyRule;

impl ValidationRule for SingleBodyRule {
    fn name(&self) -> &'static str { "single_body" }
    fn layer(&self) -> Layer { Layer::Schema }

    fn validate(&self, subject: &FragmentSubject) -> Vec<ValidationViolation> {
        let Ok(parsed) = &subject.outline else { return vec![] };
        let mut violations = vec![];
        if parsed.root_children.len() != 1 || parsed.root_children[0] != BODY_ELEMENT {
            violations.push(
                violation(self, subject, "root must contain exactly one body-replacement element")
                    .expected_actual(format!("<{BODY_ELEMENT}>"), parsed.root_children.join(", ")),
            );
        }
        if parsed.body_extras > 0 {
            violations.push(
                violation(self, subject, "body-replacement element may only hold CDATA")
                    .expected_actual("0 other nodes", format!("{} other nodes", parsed.body_extras)),
            );
        }
        violations
    }
}

pub struct FragmentSizeRule {
    pub max_bytes: usize,
}

impl ValidationRule for FragmentSizeRule {
    fn name(&self) -> &'static str { "fragment_size" }
    fn layer(&self) -> Layer { Layer::Schema }

    fn validate(&self, subject: &FragmentSubject) -> Vec<ValidationViolation> {
        let actual = subject.fragment.byte_len;
        if actual <= self.max_bytes {
            return vec![];
        }
        vec![violation(self, subject, format!(
            "fragment is {actual} bytes, maximum is {} bytes",
            self.max_bytes
        ))
        .expected_actual(format!("<= {} bytes", self.max_bytes), format!("{actual} bytes"))]
    }
}

pub struct ContentSizeRule {
    pub max_bytes: usize,
}

impl ValidationRule for ContentSizeRule {
    fn name(&self) -> &'static str { "content_size" }
    fn layer(&self) -> Layer { Layer::Schema }

    fn validate(&self, subject: &FragmentSubject) -> Vec<ValidationViolation> {
        let actual = subject.payload().len();
        if actual <= self.max_bytes {
            return vec![];
        }
        vec![violation(self, subject, format!(
            "embedded page is {actual} bytes, maximum is {} bytes",
            self.max_bytes
        ))
        .expected_actual(format!("<= {} bytes", self.max_bytes), format!("{actual} bytes"))]
    }
}

pub struct FileNameRule;

impl ValidationRule for FileNameRule {
    fn name(&self) -> &'static str { "file_name" }
    fn layer(&self) -> Layer { Layer::Schema }

    fn validate(&self, subject: &FragmentSubject) -> Vec<ValidationViolation> {
        let name = &subject.fragment.file_name;
        let encoded = FILE_NAME_PATTERN
            .captures(name)
            .and_then(|caps| caps[1].parse::<u16>().ok());
        if encoded == Some(subject.page().get()) {
            return vec![];
        }
        vec![violation(self, subject, "file name does not match page-<id>.xml")
            .expected_actual(format!("page-{}.xml", subject.page()), name.clone())]
    }
}

// --- Layer 3: security screening ---

pub struct SecurityPatternRule;

impl ValidationRule for SecurityPatternRule {
    fn name(&self) -> &'static str { "security_pattern" }
    fn layer(&self) -> Layer { Layer::Security }

    fn validate(&self, subject: &FragmentSubject) -> Vec<ValidationViolation> {
        let payload = subject.payload();
        let mut violations = vec![];
        for (rule, description, pattern) in SECURITY_PATTERNS.iter() {
            for m in pattern.find_iter(&payload) {
                let matched = m.as_str().trim_start();
                violations.push(
                    ValidationViolation::new(self.layer(), rule, format!("{description} `{matched}`"))
                        .for_page(subject.page())
                        .at(format!("payload byte {}: {}", m.start(), snippet(&payload, m.start())))
                        .expected_actual("no match", matched),
                );
            }
        }
        violations
    }
}

pub struct CdataTerminatorRule;

impl ValidationRule for CdataTerminatorRule {
    fn name(&self) -> &'static str { "cdata_terminator" }
    fn layer(&self) -> Layer { Layer::Security }

    fn validate(&self, subject: &FragmentSubject) -> Vec<ValidationViolation> {
        let Some(raw) = raw_body(&subject.fragment.xml) else { return vec![] };
        let raw = raw.trim();
        let mut violations = vec![];
        if !raw.starts_with("<![CDATA[") {
            violations.push(violation(self, subject, "body payload does not start with a CDATA section"));
        }
        for (idx, _) in raw.match_indices("]]>") {
            let after = &raw[idx + 3..];
            if after.trim().is_empty() || after.starts_with("<![CDATA[") {
                continue;
            }
            violations.push(
                violation(self, subject, "literal `]]>` ends the CDATA payload early")
                    .at(format!("body byte {idx}: {}", snippet(raw, idx))),
            );
        }
        violations
    }
}

// --- Layer 4: integration, per fragment ---

pub struct PageIdPresentRule;

impl ValidationRule for PageIdPresentRule {
    fn name(&self) -> &'static str { "page_id_present" }
    fn layer(&self) -> Layer { Layer::Integration }

    fn validate(&self, subject: &FragmentSubject) -> Vec<ValidationViolation> {
        let id = subject.page().to_string();
        let payload = subject.payload();
        let found = payload.match_indices(&id).any(|(idx, _)| {
            let before = payload[..idx].chars().next_back();
            let after = payload[idx + id.len()..].chars().next();
            !before.is_some_and(|c| c.is_ascii_digit()) && !after.is_some_and(|c| c.is_ascii_digit())
        });
        if found {
            return vec![];
        }
        vec![violation(self, subject, format!("page id {id} does not appear in the rendered page"))]
    }
}

pub struct NavigationRule {
    pub nav: Navigation,
}

impl NavigationRule {
    fn rule_name(kind: NavKind) -> &'static str {
        match kind {
            NavKind::Prev => "prev_link",
            NavKind::Next => "next_link",
            NavKind::Index => "index_link",
        }
    }
}

impl ValidationRule for NavigationRule {
    fn name(&self) -> &'static str { "navigation" }
    fn layer(&self) -> Layer { Layer::Integration }

    fn validate(&self, subject: &FragmentSubject) -> Vec<ValidationViolation> {
        let payload = subject.payload();
        let page = subject.page();
        let link = |id: PageId| format!("href=\"{}\"", self.nav.href(id));
        let mut violations = vec![];

        for kind in [NavKind::Prev, NavKind::Next, NavKind::Index] {
            let rule = Self::rule_name(kind);
            match self.nav.target(page, kind) {
                Some(target) if !payload.contains(&link(target)) => violations.push(
                    ValidationViolation::new(self.layer(), rule, format!("missing link to page {target}"))
                        .for_page(page)
                        .expected_actual(link(target), "absent"),
                ),
                None => {
                    let outside = page.offset(if kind == NavKind::Prev { -1 } else { 1 });
                    if let Some(outside) = outside.filter(|id| payload.contains(&link(*id))) {
                        violations.push(
                            ValidationViolation::new(
                                self.layer(),
                                rule,
                                format!("links to page {outside} outside the configured range"),
                            )
                            .for_page(page)
                            .expected_actual("disabled link", link(outside)),
                        );
                    }
                }
                Some(_) => {}
            }
        }
        violations
    }
}

// --- Run-level rules ---

pub struct FragmentCountRule {
    pub max_fragments: usize,
}

impl RunRule for FragmentCountRule {
    fn name(&self) -> &'static str { "fragment_count" }
    fn layer(&self) -> Layer { Layer::Schema }

    fn validate(&self, input: &RunInput<'_>) -> Vec<ValidationViolation> {
        let actual = input.subjects.len();
        if actual <= self.max_fragments {
            return vec![];
        }
        vec![ValidationViolation::new(
            self.layer(),
            self.name(),
            format!("run produces {actual} fragments, maximum is {}", self.max_fragments),
        )
        .expected_actual(format!("<= {}", self.max_fragments), actual.to_string())]
    }
}

pub struct StylesheetDriftRule;

impl RunRule for StylesheetDriftRule {
    fn name(&self) -> &'static str { "stylesheet_drift" }
    fn layer(&self) -> Layer { Layer::Integration }

    fn validate(&self, input: &RunInput<'_>) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        let mut reference: Option<(PageId, String)> = None;
        let shared = input.shared_stylesheet.trim();

        for subject in input.subjects {
            let payload = subject.payload();
            let Some(block) = STYLE_BLOCK.captures(&payload).and_then(|c| c.get(1)) else {
                violations.push(
                    ValidationViolation::new(self.layer(), "stylesheet_missing", "page has no <style> block")
                        .for_page(subject.page()),
                );
                continue;
            };
            if !shared.is_empty() && !block.as_str().contains(shared) {
                violations.push(
                    ValidationViolation::new(
                        self.layer(),
                        "stylesheet_missing",
                        "<style> block does not carry the shared stylesheet",
                    )
                    .for_page(subject.page()),
                );
            }

            let digest = sha256_hex(block.as_str().as_bytes());
            match &reference {
                None => reference = Some((subject.page(), digest)),
                Some((first, expected)) if *expected != digest => violations.push(
                    ValidationViolation::new(
                        self.layer(),
                        self.name(),
                        format!("stylesheet differs from page {first}"),
                    )
                    .for_page(subject.page())
                    .expected_actual(expected.clone(), digest),
                ),
                Some(_) => {}
            }
        }
        violations
    }
}

pub struct PageSetRule;

impl RunRule for PageSetRule {
    fn name(&self) -> &'static str { "page_set" }
    fn layer(&self) -> Layer { Layer::Integration }

    fn validate(&self, input: &RunInput<'_>) -> Vec<ValidationViolation> {
        let mut produced: BTreeMap<PageId, usize> = BTreeMap::new();
        for subject in input.subjects {
            *produced.entry(subject.page()).or_default() += 1;
        }
        let expected: BTreeSet<PageId> = input.expected.iter().copied().collect();
        let mut violations = vec![];

        for id in &expected {
            if !produced.contains_key(id) {
                violations.push(
                    ValidationViolation::new(self.layer(), "missing_page", format!("no fragment for page {id}"))
                        .for_page(*id),
                );
            }
        }
        for (id, count) in &produced {
            if !expected.contains(id) {
                violations.push(
                    ValidationViolation::new(
                        self.layer(),
                        "unexpected_page",
                        format!("fragment for page {id} is outside the configured set"),
                    )
                    .for_page(*id),
                );
            }
            if *count > 1 {
                violations.push(
                    ValidationViolation::new(
                        self.layer(),
                        "duplicate_page",
                        format!("page {id} has {count} fragments"),
                    )
                    .for_page(*id)
                    .expected_actual("1", count.to_string()),
                );
            }
        }
        violations
    }
}

/// Validator orchestrates rules; nothing here decides to stop early
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
    run_rules: Vec<Box<dyn RunRule>>,
}

impl Validator {
    pub fn new(limits: &LimitsConfig, nav: &Navigation) -> Self {
        Self {
            rules: vec![
                Box::new(WellFormedRule),
                Box::new(SingleRootRule),
                Box::new(SingleBodyRule),
                Box::new(FragmentSizeRule { max_bytes: limits.max_fragment_bytes }),
                Box::new(ContentSizeRule { max_bytes: limits.max_content_bytes }),
                Box::new(FileNameRule),
                Box::new(SecurityPatternRule),
                Box::new(CdataTerminatorRule),
                Box::new(PageIdPresentRule),
                Box::new(NavigationRule { nav: nav.clone() }),
            ],
            run_rules: vec![
                Box::new(FragmentCountRule { max_fragments: limits.max_fragments }),
                Box::new(StylesheetDriftRule),
                Box::new(PageSetRule),
            ],
        }
    }

    fn run_layer(&self, layer: Layer, subject: &FragmentSubject) -> LayerResult {
        let violations = self
            .rules
            .iter()
            .filter(|rule| rule.layer() == layer)
            .flat_map(|rule| rule.validate(subject))
            .collect();
        LayerResult::new(layer, violations)
    }

    /// Layers 1-3 for one fragment. Independent of every other page.
    pub fn validate_fragment(&self, subject: &FragmentSubject) -> Vec<LayerResult> {
        [Layer::WellFormed, Layer::Schema, Layer::Security]
            .into_iter()
            .map(|layer| self.run_layer(layer, subject))
            .collect()
    }

    /// Layer 4 per fragment, in `subjects` order.
    pub fn validate_integration(&self, subject: &FragmentSubject) -> LayerResult {
        self.run_layer(Layer::Integration, subject)
    }

    /// Rules that can only be decided once every page is in.
    pub fn validate_run(&self, input: &RunInput<'_>) -> Vec<ValidationViolation> {
        self.run_rules
            .iter()
            .flat_map(|rule| rule.validate(input))
            .collect()
    }

    /// All four layers for one fragment, ignoring run-level rules.
    pub fn validate(&self, subject: &FragmentSubject) -> ValidationResult {
        let layers = Layer::ALL
            .into_iter()
            .map(|layer| self.run_layer(layer, subject))
            .collect();
        ValidationResult::new(subject.page(), &subject.fragment.file_name, layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::PageContent;
    use crate::fragment::assemble;
    use crate::templates::tests::{id, nav, TEST_TEMPLATE};
    use crate::templates::{resolve, Template};

    const CSS: &str = "body{margin:0}";

    fn subject_for(page: u32, body: &str, n: &Navigation) -> FragmentSubject {
        let template = Template::parse(TEST_TEMPLATE, CSS, "console.log('ready');").unwrap();
        let doc = resolve(&template, &PageContent::new(id(page), body), n).unwrap();
        FragmentSubject::new(assemble(&doc).unwrap())
    }

    fn raw_subject(page: u32, xml: &str) -> FragmentSubject {
        FragmentSubject::new(Fragment {
            page: id(page),
            file_name: format!("page-{page}.xml"),
            xml: xml.to_string(),
            byte_len: xml.len(),
        })
    }

    fn rules_fired(result: &ValidationResult) -> Vec<String> {
        result.violations().map(|v| v.rule.clone()).collect()
    }

    #[test]
    fn test_clean_fragment_passes_all_layers() {
        let n = nav(100, 102);
        let validator = Validator::new(&LimitsConfig::default(), &n);
        let result = validator.validate(&subject_for(101, "Just words.", &n));
        assert!(result.valid, "{:?}", rules_fired(&result));
        assert_eq!(result.layers.len(), 4);
    }

    #[test]
    fn test_malformed_fragments_fail_well_formed_layer() {
        let n = nav(100, 100);
        let validator = Validator::new(&LimitsConfig::default(), &n);
        let cases = [
            "<fragment><set-body><![CDATA[100]]></set-body></fragment>&bogus;",
            r#"<fragment a="1" a="2"><set-body><![CDATA[100]]></set-body></fragment>"#,
            "<fragment><set-body><![CDATA[100\u{1}]]></set-body></fragment>",
            "<fragment><!-- a -- b --><set-body><![CDATA[100]]></set-body></fragment>",
        ];
        for xml in cases {
            let result = validator.validate(&raw_subject(100, xml));
            let layer = result.layer(Layer::WellFormed).unwrap();
            assert!(!layer.passed, "accepted {xml:?}");
            assert_eq!(layer.violations[0].rule, "xml_parse");
        }
    }

    #[test]
    fn test_javascript_url_only_in_link_attributes() {
        let n = nav(100, 102);
        let validator = Validator::new(&LimitsConfig::default(), &n);
        let result = validator.validate(&subject_for(101, r#"<a href="javascript:alert(1)">x</a>"#, &n));
        let hit = result.violations().find(|v| v.rule == "javascript_url").unwrap();
        assert_eq!(hit.layer, Layer::Security);
        assert_eq!(hit.page, Some(id(101)));

        let prose = validator.validate(&subject_for(101, "javascript: is a scheme", &n));
        assert!(prose.valid, "{:?}", rules_fired(&prose));
    }

    #[test]
    fn test_content_size_limit() {
        let n = nav(100, 102);
        let limits = LimitsConfig { max_content_bytes: 1_000, ..LimitsConfig::default() };
        let validator = Validator::new(&limits, &n);

        let result = validator.validate(&subject_for(101, &"y".repeat(2_000), &n));
        let fired = rules_fired(&result);
        assert!(fired.contains(&"content_size".to_string()));
        assert!(!fired.contains(&"fragment_size".to_string()));
        let hit = result.violations().find(|v| v.rule == "content_size").unwrap();
        assert_eq!(hit.expected.as_deref(), Some("<= 1000 bytes"));

        let small = validator.validate(&subject_for(101, "short", &n));
        assert!(!rules_fired(&small).contains(&"content_size".to_string()));
    }

    #[test]
    fn test_event_handler_is_flagged() {
        let n = nav(100, 102);
        let validator = Validator::new(&LimitsConfig::default(), &n);
        let result = validator.validate(&subject_for(101, "<img src=x onerror=alert(1)>", &n));

        assert!(!result.valid);
        let security = result.layer(Layer::Security).unwrap();
        assert!(!security.passed);
        let hit = &security.violations[0];
        assert_eq!(hit.rule, "event_handler");
        assert!(hit.message.contains("onerror="));
        assert!(result.layer(Layer::WellFormed).unwrap().passed);
    }

    #[test]
    fn test_eval_and_function_constructor() {
        let n = nav(100, 102);
        let validator = Validator::new(&LimitsConfig::default(), &n);
        let result = validator.validate(&subject_for(101, "eval (x); new Function('y')", &n));
        let fired = rules_fired(&result);
        assert!(fired.contains(&"eval_call".to_string()));
        assert!(fired.contains(&"function_constructor".to_string()));

        let ok = validator.validate(&subject_for(101, "medieval (times) and myFunction(1)", &n));
        assert!(ok.valid, "{:?}", rules_fired(&ok));
    }

    #[test]
    fn test_split_terminator_is_accepted() {
        let n = nav(100, 102);
        let validator = Validator::new(&LimitsConfig::default(), &n);
        // Content is text-escaped, so only trusted script can carry `]]>`.
        let template = Template::parse(TEST_TEMPLATE, CSS, "if (a[b[0]]>1) {}").unwrap();
        let doc = resolve(&template, &PageContent::new(id(101), "words"), &n).unwrap();
        let subject = FragmentSubject::new(assemble(&doc).unwrap());
        assert!(subject.fragment.xml.contains("]]]]><![CDATA[>"));

        let result = validator.validate(&subject);
        assert!(result.valid, "{:?}", rules_fired(&result));
        assert!(subject.payload().contains("a[b[0]]>1"));
    }

    #[test]
    fn test_literal_terminator_is_rejected() {
        let n = nav(100, 100);
        let validator = Validator::new(&LimitsConfig::default(), &n);
        let xml = "<fragment><set-body><![CDATA[a]]>b]]></set-body></fragment>";
        let result = validator.validate(&raw_subject(100, xml));
        assert!(!result.layer(Layer::Security).unwrap().passed);
        assert!(rules_fired(&result).contains(&"cdata_terminator".to_string()));
    }

    #[test]
    fn test_malformed_xml_still_runs_later_layers() {
        let n = nav(100, 100);
        let validator = Validator::new(&LimitsConfig::default(), &n);
        let xml = "<fragment><set-body><![CDATA[<p onclick=go()>]]></fragment>";
        let result = validator.validate(&raw_subject(100, xml));

        let well_formed = result.layer(Layer::WellFormed).unwrap();
        assert!(!well_formed.passed);
        assert!(well_formed.violations[0].location.as_deref().unwrap().starts_with("byte "));
        assert!(!result.layer(Layer::Security).unwrap().passed);
        assert!(!result.layer(Layer::Integration).unwrap().passed);
    }

    #[test]
    fn test_structure_rules() {
        let n = nav(100, 100);
        let validator = Validator::new(&LimitsConfig::default(), &n);
        let xml = "<fragment><set-body><![CDATA[100]]></set-body><set-body/></fragment>";
        let fired = rules_fired(&validator.validate(&raw_subject(100, xml)));
        assert!(fired.contains(&"single_body".to_string()));
        assert!(!fired.contains(&"single_root".to_string()));

        let xml = "<wrapper><set-body><![CDATA[100]]></set-body></wrapper>";
        let fired = rules_fired(&validator.validate(&raw_subject(100, xml)));
        assert!(fired.contains(&"single_root".to_string()));
    }

    #[test]
    fn test_size_ceiling_reports_actual_and_maximum() {
        let n = nav(100, 102);
        let limits = LimitsConfig { max_fragment_bytes: 600, ..LimitsConfig::default() };
        let validator = Validator::new(&limits, &n);
        let result = validator.validate(&subject_for(101, &"x".repeat(2000), &n));

        let schema = result.layer(Layer::Schema).unwrap();
        let size = schema.violations.iter().find(|v| v.rule == "fragment_size").unwrap();
        assert!(size.message.contains("maximum is 600 bytes"));
        assert_eq!(size.expected.as_deref(), Some("<= 600 bytes"));
    }

    #[test]
    fn test_file_name_must_encode_page() {
        let n = nav(100, 102);
        let validator = Validator::new(&LimitsConfig::default(), &n);
        let mut subject = subject_for(101, "words", &n);
        subject.fragment.file_name = "page-102.xml".to_string();
        assert!(rules_fired(&validator.validate(&subject)).contains(&"file_name".to_string()));
    }

    #[test]
    fn test_navigation_rules() {
        let n = nav(100, 102);
        let validator = Validator::new(&LimitsConfig::default(), &n);
        for page in [100, 101, 102] {
            let result = validator.validate_integration(&subject_for(page, "words", &n));
            assert!(result.passed, "page {page}: {:?}", result.violations);
        }

        // Rendered against a wider range, page 102 links to 103, which
        // the narrower run configuration does not contain.
        let wide = nav(100, 105);
        let result = validator.validate_integration(&subject_for(102, "words", &wide));
        assert_eq!(result.violations[0].rule, "next_link");
    }

    #[test]
    fn test_prev_and_index_link_rules() {
        let n = nav(100, 102);
        let validator = Validator::new(&LimitsConfig::default(), &n);

        // Rendered as the first page of 101..=102: no link back to 100,
        // and the index link points at 101.
        let narrow = nav(101, 102);
        let result = validator.validate_integration(&subject_for(101, "words", &narrow));
        let fired: Vec<&str> = result.violations.iter().map(|v| v.rule.as_str()).collect();
        assert!(fired.contains(&"prev_link"), "{fired:?}");
        assert!(fired.contains(&"index_link"), "{fired:?}");
        assert!(!fired.contains(&"next_link"), "{fired:?}");

        // Page 101 rendered over a wider range links back to 100, which the
        // run configuration starting at 101 excludes.
        let late = Validator::new(&LimitsConfig::default(), &narrow);
        let result = late.validate_integration(&subject_for(101, "words", &n));
        let prev = result.violations.iter().find(|v| v.rule == "prev_link").unwrap();
        assert_eq!(prev.expected.as_deref(), Some("disabled link"));

        let moved_index = Navigation { index: id(102), ..nav(100, 102) };
        let strict = Validator::new(&LimitsConfig::default(), &moved_index);
        let result = strict.validate_integration(&subject_for(100, "words", &n));
        let fired: Vec<&str> = result.violations.iter().map(|v| v.rule.as_str()).collect();
        assert_eq!(fired, vec!["index_link"]);
    }

    #[test]
    fn test_page_set_and_count() {
        let n = nav(100, 103);
        let limits = LimitsConfig { max_fragments: 2, ..LimitsConfig::default() };
        let validator = Validator::new(&limits, &n);
        let subjects: Vec<_> = [100, 101, 102].map(|p| subject_for(p, "words", &n)).into();
        let refs: Vec<&FragmentSubject> = subjects.iter().collect();
        let expected: Vec<PageId> = (100..=103).map(id).collect();

        let violations = validator.validate_run(&RunInput {
            subjects: &refs,
            expected: &expected,
            shared_stylesheet: CSS,
        });
        let missing = violations.iter().find(|v| v.rule == "missing_page").unwrap();
        assert_eq!(missing.page, Some(id(103)));
        assert!(violations.iter().any(|v| v.rule == "fragment_count"));
        assert!(!violations.iter().any(|v| v.rule == "stylesheet_drift"));
        assert!(!violations.iter().any(|v| v.rule == "unexpected_page"));
        assert!(!violations.iter().any(|v| v.rule == "duplicate_page"));
    }

    #[test]
    fn test_unexpected_and_duplicate_pages() {
        let n = nav(100, 102);
        let validator = Validator::new(&LimitsConfig::default(), &n);
        let subjects: Vec<_> = [100, 101, 101, 102].map(|p| subject_for(p, "words", &n)).into();
        let refs: Vec<&FragmentSubject> = subjects.iter().collect();
        let expected = [id(100), id(101)];

        let violations = validator.validate_run(&RunInput {
            subjects: &refs,
            expected: &expected,
            shared_stylesheet: CSS,
        });
        let unexpected: Vec<_> = violations.iter().filter(|v| v.rule == "unexpected_page").collect();
        assert_eq!(unexpected.len(), 1);
        assert_eq!(unexpected[0].page, Some(id(102)));
        let duplicate: Vec<_> = violations.iter().filter(|v| v.rule == "duplicate_page").collect();
        assert_eq!(duplicate.len(), 1);
        assert_eq!(duplicate[0].page, Some(id(101)));
        assert!(!violations.iter().any(|v| v.rule == "missing_page"));
    }

    #[test]
    fn test_stylesheet_drift_detected() {
        let n = nav(100, 101);
        let validator = Validator::new(&LimitsConfig::default(), &n);
        let a = subject_for(100, "words", &n);
        let template = Template::parse(TEST_TEMPLATE, "body{margin:1px}", "").unwrap();
        let doc = resolve(&template, &PageContent::new(id(101), "words"), &n).unwrap();
        let b = FragmentSubject::new(assemble(&doc).unwrap());

        let refs = [&a, &b];
        let expected = [id(100), id(101)];
        let violations = validator.validate_run(&RunInput {
            subjects: &refs,
            expected: &expected,
            shared_stylesheet: CSS,
        });
        let drift = violations.iter().find(|v| v.rule == "stylesheet_drift").unwrap();
        assert_eq!(drift.page, Some(id(101)));
        assert!(violations.iter().any(|v| v.rule == "stylesheet_missing"));
    }
}
