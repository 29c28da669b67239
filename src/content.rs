//! Content Source - one plain-text unit per page
//!
//! Layout: `<content_dir>/<id>.txt`, optionally starting with a TOML
//! front-matter block fenced by `+++` lines.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Lowest identifier any page may carry.
pub const MIN_PAGE_ID: u16 = 100;
/// Highest identifier any page may carry.
pub const MAX_PAGE_ID: u16 = 999;

const FRONT_MATTER_FENCE: &str = "+++";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct PageId(u16);

impl PageId {
    pub fn new(raw: u32) -> Result<Self, ContentError> {
        match u16::try_from(raw) {
            Ok(id) if (MIN_PAGE_ID..=MAX_PAGE_ID).contains(&id) => Ok(Self(id)),
            _ => Err(ContentError::IdOutOfDomain(raw)),
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }

    /// Neighbouring id, if it stays inside the identifier domain.
    pub fn offset(self, delta: i32) -> Option<Self> {
        let raw = i32::from(self.0) + delta;
        u32::try_from(raw).ok().and_then(|r| Self::new(r).ok())
    }
}

impl TryFrom<u16> for PageId {
    type Error = ContentError;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        Self::new(u32::from(raw))
    }
}

impl From<PageId> for u16 {
    fn from(id: PageId) -> Self {
        id.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("page id {0} is outside {MIN_PAGE_ID}..={MAX_PAGE_ID}")]
    IdOutOfDomain(u32),

    #[error("cannot read content `{0}`")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("invalid front matter in `{0}`")]
    FrontMatter(PathBuf, #[source] toml::de::Error),

    #[error("unterminated front matter in `{0}`")]
    UnterminatedFrontMatter(PathBuf),

    #[error("page {0} has an empty body")]
    EmptyBody(PageId),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FrontMatter {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    category: Option<String>,
}

/// Immutable input for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContent {
    pub id: PageId,
    pub body: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl PageContent {
    pub fn new(id: PageId, body: impl Into<String>) -> Self {
        Self {
            id,
            body: body.into(),
            title: None,
            category: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Parse one content file's text.
    pub fn parse(id: PageId, path: &Path, text: &str) -> Result<Self, ContentError> {
        let (front, body) = split_front_matter(path, text)?;
        let front = match front {
            Some(raw) => toml::from_str::<FrontMatter>(raw)
                .map_err(|e| ContentError::FrontMatter(path.to_path_buf(), e))?,
            None => FrontMatter::default(),
        };

        let body = body.trim();
        if body.is_empty() {
            return Err(ContentError::EmptyBody(id));
        }

        Ok(Self {
            id,
            body: body.to_string(),
            title: front.title,
            category: front.category,
        })
    }
}

fn split_front_matter<'a>(
    path: &Path,
    text: &'a str,
) -> Result<(Option<&'a str>, &'a str), ContentError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let Some(after_open) = text.strip_prefix(FRONT_MATTER_FENCE) else {
        return Ok((None, text));
    };
    let Some(after_open) = after_open
        .strip_prefix("\r\n")
        .or_else(|| after_open.strip_prefix('\n'))
    else {
        return Ok((None, text));
    };

    let mut offset = 0;
    for line in after_open.split_inclusive('\n') {
        if line.trim_end() == FRONT_MATTER_FENCE {
            let front = &after_open[..offset];
            let body = &after_open[offset + line.len()..];
            return Ok((Some(front), body));
        }
        offset += line.len();
    }
    Err(ContentError::UnterminatedFrontMatter(path.to_path_buf()))
}

/// One candidate content file and the outcome of reading it.
#[derive(Debug)]
pub struct ContentUnit {
    pub path: PathBuf,
    pub page: Result<PageContent, ContentError>,
}

impl ContentUnit {
    /// Id encoded in the file name, if it is a valid page id.
    pub fn id(&self) -> Option<PageId> {
        match &self.page {
            Ok(page) => Some(page.id),
            Err(_) => id_from_path(&self.path).and_then(|raw| PageId::new(raw).ok()),
        }
    }
}

impl From<PageContent> for ContentUnit {
    fn from(page: PageContent) -> Self {
        Self {
            path: PathBuf::from(format!("{}.txt", page.id)),
            page: Ok(page),
        }
    }
}

/// Read every `<digits>.txt` file in `dir`, ordered by number.
///
/// Only failing to list the directory is an error; per-file failures are
/// returned inside the units.
pub fn load_dir(dir: &Path) -> Result<Vec<ContentUnit>, ContentError> {
    let entries = fs::read_dir(dir).map_err(|e| ContentError::Io(dir.to_path_buf(), e))?;

    let mut candidates = vec![];
    for entry in entries {
        let path = entry
            .map_err(|e| ContentError::Io(dir.to_path_buf(), e))?
            .path();
        match id_from_path(&path) {
            Some(raw) => candidates.push((raw, path)),
            None => debug!(path = %path.display(), "skipping non-content file"),
        }
    }
    candidates.sort();

    Ok(candidates
        .into_iter()
        .map(|(raw, path)| {
            let page = PageId::new(raw).and_then(|id| {
                let text =
                    fs::read_to_string(&path).map_err(|e| ContentError::Io(path.clone(), e))?;
                PageContent::parse(id, &path, &text)
            });
            ContentUnit { path, page }
        })
        .collect())
}

fn id_from_path(path: &Path) -> Option<u32> {
    if path.extension()? != "txt" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}
