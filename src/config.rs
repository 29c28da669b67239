//! Run configuration for `fragforge.toml`.
//!
//! | Section    | Purpose                                        |
//! |------------|------------------------------------------------|
//! | `[pages]`  | Identifier range, index page, link prefix      |
//! | `[paths]`  | Content, template, shared assets, output       |
//! | `[limits]` | Fragment size, fragment count, content size    |
//!
//! ```toml
//! [pages]
//! first = 100
//! last = 120
//! index = 100
//!
//! [paths]
//! content_dir = "content"
//! output_dir = "fragments"
//!
//! [limits]
//! max_fragment_bytes = 262144
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::content::{PageId, MAX_PAGE_ID, MIN_PAGE_ID};
use crate::templates::Navigation;

/// Platform ceiling for a single fragment document.
pub const DEFAULT_MAX_FRAGMENT_BYTES: usize = 256 * 1024;
/// Platform ceiling for the number of fragments in one deployment.
pub const DEFAULT_MAX_FRAGMENTS: usize = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error when reading `{0}`")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Config file parsing error")]
    Toml(#[from] toml::de::Error),

    #[error("Config validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub pages: PagesConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PagesConfig {
    #[serde(default = "default_first")]
    pub first: u32,
    #[serde(default = "default_last")]
    pub last: u32,
    #[serde(default = "default_first")]
    pub index: u32,
    #[serde(default = "default_href_prefix")]
    pub href_prefix: String,
}

fn default_first() -> u32 { u32::from(MIN_PAGE_ID) }
fn default_last() -> u32 { u32::from(MAX_PAGE_ID) }
fn default_href_prefix() -> String { "/page/".into() }

impl Default for PagesConfig {
    fn default() -> Self {
        Self {
            first: default_first(),
            last: default_last(),
            index: default_first(),
            href_prefix: default_href_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "default_content_dir")]
    pub content_dir: PathBuf,
    #[serde(default = "default_template")]
    pub template: PathBuf,
    #[serde(default = "default_stylesheet")]
    pub stylesheet: PathBuf,
    #[serde(default = "default_script")]
    pub script: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_content_dir() -> PathBuf { "content".into() }
fn default_template() -> PathBuf { "templates/page.html".into() }
fn default_stylesheet() -> PathBuf { "templates/shared.css".into() }
fn default_script() -> PathBuf { "templates/shared.js".into() }
fn default_output_dir() -> PathBuf { "fragments".into() }

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            content_dir: default_content_dir(),
            template: default_template(),
            stylesheet: default_stylesheet(),
            script: default_script(),
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    #[serde(default = "default_max_fragment_bytes")]
    pub max_fragment_bytes: usize,
    #[serde(default = "default_max_fragments")]
    pub max_fragments: usize,
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
}

fn default_max_fragment_bytes() -> usize { DEFAULT_MAX_FRAGMENT_BYTES }
fn default_max_fragments() -> usize { DEFAULT_MAX_FRAGMENTS }
fn default_max_content_bytes() -> usize { DEFAULT_MAX_FRAGMENT_BYTES * 3 / 4 }

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_fragment_bytes: default_max_fragment_bytes(),
            max_fragments: default_max_fragments(),
            max_content_bytes: default_max_content_bytes(),
        }
    }
}

impl RunConfig {
    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; relative paths are taken from the file's directory.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let mut config = Self::from_toml(&content)?;
        if let Some(base) = path.parent() {
            config.paths.rebase(base);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));
        let pages = &self.pages;
        for (field, value) in [("first", pages.first), ("last", pages.last), ("index", pages.index)] {
            if PageId::new(value).is_err() {
                return invalid(format!(
                    "pages.{field} = {value} is outside {MIN_PAGE_ID}..={MAX_PAGE_ID}"
                ));
            }
        }
        if pages.first > pages.last {
            return invalid(format!(
                "pages.first ({}) is greater than pages.last ({})",
                pages.first, pages.last
            ));
        }
        if !(pages.first..=pages.last).contains(&pages.index) {
            return invalid(format!(
                "pages.index ({}) is outside {}..={}",
                pages.index, pages.first, pages.last
            ));
        }

        let limits = &self.limits;
        for (field, value) in [
            ("max_fragment_bytes", limits.max_fragment_bytes),
            ("max_fragments", limits.max_fragments),
            ("max_content_bytes", limits.max_content_bytes),
        ] {
            if value == 0 {
                return invalid(format!("limits.{field} must be greater than zero"));
            }
        }
        Ok(())
    }

    /// Navigation bounds for the configured page set.
    pub fn navigation(&self) -> Result<Navigation, ConfigError> {
        let id = |raw: u32| PageId::new(raw).map_err(|e| ConfigError::Validation(e.to_string()));
        Ok(Navigation {
            first: id(self.pages.first)?,
            last: id(self.pages.last)?,
            index: id(self.pages.index)?,
            href_prefix: self.pages.href_prefix.clone(),
        })
    }

    /// Every identifier the run is expected to produce, ascending.
    pub fn expected_pages(&self) -> Vec<PageId> {
        (self.pages.first..=self.pages.last)
            .filter_map(|raw| PageId::new(raw).ok())
            .collect()
    }
}

impl PathsConfig {
    fn rebase(&mut self, base: &Path) {
        for path in [
            &mut self.content_dir,
            &mut self.template,
            &mut self.stylesheet,
            &mut self.script,
            &mut self.output_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}
