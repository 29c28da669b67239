//! FragForge Core - Gateway Fragment Compiler
//!
//! Turns per-page text into policy fragments a gateway can splice into its
//! responses, and refuses to publish anything that fails validation.
//!
//! # The Four Gates (Non-Negotiable)
//! 1. Fragments Are Well-Formed XML
//! 2. Fragments Fit The Platform Limits
//! 3. Fragments Carry No Script Injection
//! 4. The Page Set Is Complete And Consistent

pub mod config;
pub mod content;
pub mod escape;
pub mod fragment;
pub mod hashing;
pub mod pipeline;
pub mod telemetry;
pub mod templates;
pub mod validation;

pub use config::{ConfigError, RunConfig};
pub use content::{ContentError, ContentUnit, PageContent, PageId};
pub use escape::{escape_for_cdata, escape_for_html_attribute, escape_for_html_text, unwrap_cdata};
pub use fragment::{assemble, AssemblyError, Fragment};
pub use hashing::{canonical_json, compute_run_digest, sha256_hex};
pub use pipeline::{error_chain, ConversionPipeline, PageReport, PipelineError, RunReport, RunState};
pub use templates::{resolve, Navigation, Placeholder, ResolveError, ResolvedDocument, Template, TemplateError};
pub use validation::{Layer, LayerResult, ValidationResult, ValidationViolation, Validator};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
