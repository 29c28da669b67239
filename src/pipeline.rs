//! Conversion Pipeline - Single Entry Point
//!
//! `Idle -> Resolving -> Validating -> Publishing -> Published`, or
//! `-> Aborted` as soon as the aggregate verdict has any violation.
//!
//! CRITICAL: publishing happens only after every layer ran on every page.
//! Either all fragments of a run land in the output directory or none do.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, RunConfig};
use crate::content::{load_dir, ContentError, ContentUnit, PageId};
use crate::fragment::{assemble, Fragment};
use crate::hashing::compute_run_digest;
use crate::templates::{resolve, Navigation, Template, TemplateError};
use crate::validation::{
    FragmentSubject, RunInput, ValidationResult, ValidationViolation, Validator,
};
use crate::ENGINE_VERSION;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Content source error: {0}")]
    Content(#[from] ContentError),

    #[error("Output directory `{0}` is not writable")]
    OutputNotWritable(PathBuf, #[source] io::Error),

    #[error("Publishing to `{0}` failed")]
    Publish(PathBuf, #[source] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Resolving,
    Validating,
    /// Terminal state of a check-only run that passed.
    Validated,
    Publishing,
    Published,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageErrorKind {
    Input,
    Assembly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageError {
    pub kind: PageErrorKind,
    pub message: String,
}

impl PageError {
    fn new(kind: PageErrorKind, err: &dyn std::error::Error) -> Self {
        Self {
            kind,
            message: error_chain(err),
        }
    }
}

/// `err` followed by each of its sources, joined with `: `.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Outcome for one content unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageReport {
    pub page: Option<PageId>,
    pub source: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub byte_len: Option<usize>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub error: Option<PageError>,
    #[serde(default)]
    pub validation: Option<ValidationResult>,
}

impl PageReport {
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.validation.as_ref().is_some_and(|v| v.valid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub engine_version: String,
    pub state: RunState,
    pub passed: bool,
    pub pages: Vec<PageReport>,
    pub run_violations: Vec<ValidationViolation>,
    /// Digest over every assembled fragment, stable across identical runs.
    pub digest: String,
    pub published: Vec<String>,
}

impl RunReport {
    /// Every violation in the run, per-page ones first.
    pub fn violations(&self) -> impl Iterator<Item = &ValidationViolation> {
        self.pages
            .iter()
            .filter_map(|p| p.validation.as_ref())
            .flat_map(ValidationResult::violations)
            .chain(self.run_violations.iter())
    }

    pub fn page_errors(&self) -> impl Iterator<Item = (&PageReport, &PageError)> {
        self.pages
            .iter()
            .filter_map(|p| p.error.as_ref().map(|e| (p, e)))
    }
}

/// Per-page state carried from resolution into validation.
struct PageWork {
    report: PageReport,
    fragment: Option<Fragment>,
    subject: Option<FragmentSubject>,
}

impl PageWork {
    fn failed(report: PageReport) -> Self {
        Self {
            report,
            fragment: None,
            subject: None,
        }
    }
}

/// The conversion pipeline - single entry point for a run
pub struct ConversionPipeline {
    config: RunConfig,
    nav: Navigation,
    template: Template,
    validator: Validator,
    state: RunState,
}

impl ConversionPipeline {
    pub fn new(config: RunConfig, template: Template) -> Result<Self, PipelineError> {
        config.validate()?;
        let nav = config.navigation()?;
        let validator = Validator::new(&config.limits, &nav);
        Ok(Self {
            config,
            nav,
            template,
            validator,
            state: RunState::Idle,
        })
    }

    /// Build a pipeline whose template and assets come from `config.paths`.
    pub fn from_config(config: RunConfig) -> Result<Self, PipelineError> {
        let paths = &config.paths;
        let template = Template::load(&paths.template, &paths.stylesheet, &paths.script)?;
        Self::new(config, template)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Read the configured content directory.
    pub fn load_content(&self) -> Result<Vec<ContentUnit>, PipelineError> {
        Ok(load_dir(&self.config.paths.content_dir)?)
    }

    /// Convert, validate and, if everything passes, publish.
    pub fn run(&mut self, units: Vec<ContentUnit>) -> Result<RunReport, PipelineError> {
        self.execute(units, true)
    }

    /// Convert and validate without touching the output directory.
    pub fn check(&mut self, units: Vec<ContentUnit>) -> Result<RunReport, PipelineError> {
        self.execute(units, false)
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "run state");
        self.state = next;
    }

    fn execute(&mut self, units: Vec<ContentUnit>, publish: bool) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        let output_dir = self.config.paths.output_dir.clone();
        self.transition(RunState::Idle);

        if publish {
            if let Err(e) = ensure_writable(&output_dir) {
                self.transition(RunState::Aborted);
                return Err(e);
            }
        }

        self.transition(RunState::Resolving);
        info!(run_id = %run_id, pages = units.len(), "resolving pages");
        let mut work: Vec<PageWork> = {
            let (template, nav) = (&self.template, &self.nav);
            units
                .into_par_iter()
                .map(|unit| resolve_unit(template, nav, unit))
                .collect()
        };

        self.transition(RunState::Validating);
        {
            let validator = &self.validator;
            work.par_iter_mut().for_each(|page| {
                if let Some(fragment) = page.fragment.take() {
                    let subject = FragmentSubject::new(fragment);
                    let layers = validator.validate_fragment(&subject);
                    page.report.validation =
                        Some(ValidationResult::new(subject.page(), &subject.fragment.file_name, layers));
                    page.subject = Some(subject);
                }
            });
        }

        // Integration checks need the complete, ordered set.
        for page in &mut work {
            if let (Some(subject), Some(result)) = (&page.subject, &mut page.report.validation) {
                result.push_layer(self.validator.validate_integration(subject));
            }
        }
        let subjects: Vec<&FragmentSubject> = work.iter().filter_map(|w| w.subject.as_ref()).collect();
        let expected = self.config.expected_pages();
        let run_violations = self.validator.validate_run(&RunInput {
            subjects: &subjects,
            expected: &expected,
            shared_stylesheet: self.template.stylesheet(),
        });

        let manifest: BTreeMap<&str, String> = subjects
            .iter()
            .map(|s| (s.fragment.file_name.as_str(), s.fragment.digest()))
            .collect();
        let digest = compute_run_digest(&manifest)?;

        let passed = work.iter().all(|w| w.report.passed()) && run_violations.is_empty();
        let fragments: Vec<&Fragment> = subjects.iter().map(|s| &s.fragment).collect();

        let mut report = RunReport {
            run_id,
            generated_at: Utc::now(),
            engine_version: ENGINE_VERSION.to_string(),
            state: self.state,
            passed,
            pages: vec![],
            run_violations,
            digest,
            published: vec![],
        };

        if !passed {
            report.pages = work.into_iter().map(|w| w.report).collect();
            self.transition(RunState::Aborted);
            report.state = self.state;
            log_failures(&report);
            return Ok(report);
        }

        if !publish {
            self.transition(RunState::Validated);
            report.state = self.state;
            report.pages = work.into_iter().map(|w| w.report).collect();
            info!(pages = report.pages.len(), "validation passed, nothing published");
            return Ok(report);
        }

        self.transition(RunState::Publishing);
        if let Err(e) = publish_all(&output_dir, &fragments) {
            self.transition(RunState::Aborted);
            return Err(e);
        }
        report.published = fragments.iter().map(|f| f.file_name.clone()).collect();
        self.transition(RunState::Published);
        report.state = self.state;
        report.pages = work.into_iter().map(|w| w.report).collect();
        info!(
            fragments = report.published.len(),
            output = %output_dir.display(),
            digest = %report.digest,
            "published fragments"
        );
        Ok(report)
    }
}

fn resolve_unit(template: &Template, nav: &Navigation, unit: ContentUnit) -> PageWork {
    let mut report = PageReport {
        page: unit.id(),
        source: unit.path.display().to_string(),
        file_name: None,
        byte_len: None,
        digest: None,
        error: None,
        validation: None,
    };

    let page = match unit.page {
        Ok(page) => page,
        Err(e) => {
            warn!(source = %report.source, error = %e, "content unit rejected");
            report.error = Some(PageError::new(PageErrorKind::Input, &e));
            return PageWork::failed(report);
        }
    };

    let doc = match resolve(template, &page, nav) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(page = %page.id, error = %e, "page resolution failed");
            report.error = Some(PageError::new(PageErrorKind::Input, &e));
            return PageWork::failed(report);
        }
    };

    match assemble(&doc) {
        Ok(fragment) => {
            debug!(page = %page.id, bytes = fragment.byte_len, "fragment assembled");
            report.file_name = Some(fragment.file_name.clone());
            report.byte_len = Some(fragment.byte_len);
            report.digest = Some(fragment.digest());
            PageWork {
                report,
                fragment: Some(fragment),
                subject: None,
            }
        }
        Err(e) => {
            warn!(page = %page.id, error = %e, "fragment assembly failed");
            report.error = Some(PageError::new(PageErrorKind::Assembly, &e));
            PageWork::failed(report)
        }
    }
}

fn log_failures(report: &RunReport) {
    for (page, error) in report.page_errors() {
        warn!(source = %page.source, kind = ?error.kind, "{}", error.message);
    }
    for v in report.violations() {
        warn!(
            page = ?v.page.map(PageId::get),
            layer = ?v.layer,
            rule = %v.rule,
            location = v.location.as_deref().unwrap_or("-"),
            "{}",
            v.message
        );
    }
    warn!(
        pages = report.pages.len(),
        violations = report.violations().count(),
        "run aborted, nothing published"
    );
}

fn parent_dir(dir: &Path) -> &Path {
    dir.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Fail fast when the run could never be published. Creates nothing.
fn ensure_writable(output_dir: &Path) -> Result<(), PipelineError> {
    let unwritable = |e| PipelineError::OutputNotWritable(output_dir.to_path_buf(), e);
    if output_dir.exists() {
        if !output_dir.is_dir() {
            return Err(unwritable(io::Error::other("not a directory")));
        }
        tempfile::NamedTempFile::new_in(output_dir).map_err(unwritable)?;
    }
    // Staging happens next to the output directory; its parents are
    // created at publish time.
    let parent = parent_dir(output_dir);
    let existing = parent
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("."));
    tempfile::tempdir_in(existing).map_err(unwritable)?;
    Ok(())
}

/// Stage every fragment beside `output_dir`, then swap directories.
fn publish_all(output_dir: &Path, fragments: &[&Fragment]) -> Result<(), PipelineError> {
    let failed = |e| PipelineError::Publish(output_dir.to_path_buf(), e);
    let parent = parent_dir(output_dir);
    fs::create_dir_all(parent).map_err(failed)?;

    let staging = tempfile::Builder::new()
        .prefix(".fragforge-staging-")
        .tempdir_in(parent)
        .map_err(failed)?;
    for fragment in fragments {
        fs::write(staging.path().join(&fragment.file_name), &fragment.xml).map_err(failed)?;
    }

    let previous = tempfile::Builder::new()
        .prefix(".fragforge-previous-")
        .tempdir_in(parent)
        .map_err(failed)?;
    let previous_output = previous.path().join("output");

    let had_output = output_dir.exists();
    if had_output {
        fs::rename(output_dir, &previous_output).map_err(failed)?;
    }
    if let Err(e) = fs::rename(staging.path(), output_dir) {
        if had_output {
            if let Err(restore) = fs::rename(&previous_output, output_dir) {
                warn!(error = %restore, "could not restore previous output directory");
            }
        }
        return Err(failed(e));
    }
    // `staging` now points at a moved directory; dropping it is a no-op.
    // `previous` removes the old fragments on drop.
    Ok(())
}
