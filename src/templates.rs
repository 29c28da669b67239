//! Template System - One Page Template, Closed Placeholder Vocabulary
//!
//! A template is an HTML document carrying `{{NAME}}` tokens. Resolution
//! substitutes every token in a single pass, so text inserted for one
//! placeholder is never scanned for further tokens.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

use crate::content::{PageContent, PageId};
use crate::escape::{escape_for_html_attribute, escape_for_html_text};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([A-Z_]+)\}\}").expect("placeholder pattern is valid"));

/// Anything a template author plausibly meant as a placeholder.
static PLACEHOLDER_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_]+)\s*\}\}").expect("placeholder-like pattern is valid")
});

/// Markers a resolved document must contain exactly once.
const STRUCTURAL_MARKERS: [&str; 6] = [
    "<!doctype html>",
    "<head>",
    "</head>",
    "<body",
    "</body>",
    "</html>",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Placeholder {
    Content,
    PageId,
    PrevLink,
    NextLink,
    IndexLink,
    Stylesheet,
    Script,
    Title,
    Category,
}

impl Placeholder {
    pub const ALL: [Placeholder; 9] = [
        Placeholder::Content,
        Placeholder::PageId,
        Placeholder::PrevLink,
        Placeholder::NextLink,
        Placeholder::IndexLink,
        Placeholder::Stylesheet,
        Placeholder::Script,
        Placeholder::Title,
        Placeholder::Category,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Placeholder::Content => "CONTENT",
            Placeholder::PageId => "PAGE_ID",
            Placeholder::PrevLink => "PREV_LINK",
            Placeholder::NextLink => "NEXT_LINK",
            Placeholder::IndexLink => "INDEX_LINK",
            Placeholder::Stylesheet => "STYLESHEET",
            Placeholder::Script => "SCRIPT",
            Placeholder::Title => "TITLE",
            Placeholder::Category => "CATEGORY",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    pub fn required(self) -> bool {
        !matches!(self, Placeholder::Title | Placeholder::Category)
    }
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("cannot read template file `{0}`")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("unknown placeholder {{{{{0}}}}} in template")]
    UnknownPlaceholder(String),

    #[error("malformed placeholder `{0}` in template")]
    MalformedPlaceholder(String),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("page {page} is outside the configured range {first}..={last}")]
    PageOutOfRange {
        page: PageId,
        first: PageId,
        last: PageId,
    },

    #[error("template is missing required placeholders: {}", .0.join(", "))]
    MissingPlaceholders(Vec<&'static str>),

    #[error("resolved document contains `{marker}` {count} times, expected exactly once")]
    MalformedDocument { marker: &'static str, count: usize },
}

/// The shared page template plus the assets it inlines.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    stylesheet: String,
    script: String,
    placeholders: BTreeSet<Placeholder>,
}

impl Template {
    pub fn parse(
        source: impl Into<String>,
        stylesheet: impl Into<String>,
        script: impl Into<String>,
    ) -> Result<Self, TemplateError> {
        let source = source.into();
        let mut placeholders = BTreeSet::new();
        for caps in PLACEHOLDER_LIKE.captures_iter(&source) {
            let (token, name) = (&caps[0], &caps[1]);
            if token.len() != name.len() + 4 {
                return Err(TemplateError::MalformedPlaceholder(token.to_string()));
            }
            let placeholder = Placeholder::from_name(name)
                .ok_or_else(|| TemplateError::UnknownPlaceholder(name.to_string()))?;
            placeholders.insert(placeholder);
        }

        Ok(Self {
            source,
            stylesheet: stylesheet.into(),
            script: script.into(),
            placeholders,
        })
    }

    pub fn load(html: &Path, stylesheet: &Path, script: &Path) -> Result<Self, TemplateError> {
        let read = |path: &Path| {
            fs::read_to_string(path).map_err(|e| TemplateError::Io(path.to_path_buf(), e))
        };
        Self::parse(read(html)?, read(stylesheet)?, read(script)?)
    }

    pub fn stylesheet(&self) -> &str {
        &self.stylesheet
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn placeholders(&self) -> &BTreeSet<Placeholder> {
        &self.placeholders
    }

    fn missing_required(&self) -> Vec<&'static str> {
        Placeholder::ALL
            .into_iter()
            .filter(|p| p.required() && !self.placeholders.contains(p))
            .map(Placeholder::name)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavKind {
    Prev,
    Next,
    Index,
}

impl NavKind {
    fn label(self) -> &'static str {
        match self {
            NavKind::Prev => "Previous",
            NavKind::Next => "Next",
            NavKind::Index => "Index",
        }
    }

    fn class(self) -> &'static str {
        match self {
            NavKind::Prev => "nav-prev",
            NavKind::Next => "nav-next",
            NavKind::Index => "nav-index",
        }
    }
}

/// Bounds and link shape of the configured page set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    pub first: PageId,
    pub last: PageId,
    pub index: PageId,
    pub href_prefix: String,
}

impl Navigation {
    pub fn contains(&self, page: PageId) -> bool {
        (self.first..=self.last).contains(&page)
    }

    /// Link target for `kind` as seen from `page`; `None` at the bounds.
    pub fn target(&self, page: PageId, kind: NavKind) -> Option<PageId> {
        match kind {
            NavKind::Prev if page > self.first => page.offset(-1),
            NavKind::Next if page < self.last => page.offset(1),
            NavKind::Index => Some(self.index),
            _ => None,
        }
    }

    /// Attribute-escaped `href` value for a page.
    pub fn href(&self, page: PageId) -> String {
        escape_for_html_attribute(&format!("{}{}", self.href_prefix, page))
    }

    fn render_link(&self, page: PageId, kind: NavKind) -> String {
        match self.target(page, kind) {
            Some(target) => format!(
                r#"<a class="nav-link {}" href="{}">{}</a>"#,
                kind.class(),
                self.href(target),
                kind.label()
            ),
            None => format!(
                r#"<span class="nav-link {} nav-disabled" aria-disabled="true">{}</span>"#,
                kind.class(),
                kind.label()
            ),
        }
    }
}

/// A complete, self-contained HTML page for one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDocument {
    pub page: PageId,
    pub html: String,
}

/// Substitute `page` into `template`.
pub fn resolve(
    template: &Template,
    page: &PageContent,
    nav: &Navigation,
) -> Result<ResolvedDocument, ResolveError> {
    if !nav.contains(page.id) {
        return Err(ResolveError::PageOutOfRange {
            page: page.id,
            first: nav.first,
            last: nav.last,
        });
    }

    let missing = template.missing_required();
    if !missing.is_empty() {
        return Err(ResolveError::MissingPlaceholders(missing));
    }

    let mut html = String::with_capacity(template.source.len() + page.body.len() * 2);
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(&template.source) {
        let Some(whole) = caps.get(0) else { continue };
        html.push_str(&template.source[last..whole.start()]);
        // Template::parse already rejected unknown names.
        if let Some(placeholder) = Placeholder::from_name(&caps[1]) {
            html.push_str(&substitution(template, page, nav, placeholder));
        }
        last = whole.end();
    }
    html.push_str(&template.source[last..]);

    check_structure(&html)?;
    Ok(ResolvedDocument { page: page.id, html })
}

fn substitution(
    template: &Template,
    page: &PageContent,
    nav: &Navigation,
    placeholder: Placeholder,
) -> String {
    match placeholder {
        Placeholder::Content => render_body(&page.body),
        Placeholder::PageId => page.id.to_string(),
        Placeholder::PrevLink => nav.render_link(page.id, NavKind::Prev),
        Placeholder::NextLink => nav.render_link(page.id, NavKind::Next),
        Placeholder::IndexLink => nav.render_link(page.id, NavKind::Index),
        Placeholder::Stylesheet => template.stylesheet.clone(),
        Placeholder::Script => template.script.clone(),
        Placeholder::Title => match &page.title {
            Some(title) => escape_for_html_text(title),
            None => format!("Page {}", page.id),
        },
        Placeholder::Category => page
            .category
            .as_deref()
            .map(escape_for_html_text)
            .unwrap_or_default(),
    }
}

/// Blank-line separated paragraphs, each escaped for HTML text.
fn render_body(body: &str) -> String {
    let normalized = body.replace("\r\n", "\n");
    normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", escape_for_html_text(p)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn check_structure(html: &str) -> Result<(), ResolveError> {
    let lowered = html.to_ascii_lowercase();
    for marker in STRUCTURAL_MARKERS {
        let count = lowered.matches(marker).count();
        if count != 1 {
            return Err(ResolveError::MalformedDocument { marker, count });
        }
    }
    Ok(())
}
