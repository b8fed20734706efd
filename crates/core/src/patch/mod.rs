//! The call-replacement pipeline: locate call sites, resolve the
//! replacement function, then validate and rewrite each site.
//!
//! Every stage takes the image explicitly. Failures that make the whole run
//! pointless (unsupported architecture, missing symbol, missing section,
//! missing replacement) are returned as [`PatchError`] before anything is
//! written. Everything else is per site and ends up in the [`PatchReport`].

mod apply;
mod locate;
mod resolve;

pub use apply::{patch_all, pattern_mismatch, select_mode};
use apply::{check_encoder_mode, patch_sites};
pub use locate::locate_calls;
pub use resolve::{find_function_in_range, find_section, resolve_replacement};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PatchConfig;
use crate::model::Argument;
use crate::services::encoder::{EncoderMode, InstructionEncoder};
use crate::services::image::BinaryImage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("Unsupported architecture: {arch} with {address_size}-byte addresses (x86 family only)")]
    UnsupportedArchitecture { arch: String, address_size: usize },
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("Section not found: {0}")]
    SectionNotFound(String),
    #[error("No function matching '{needle}' in section {section}")]
    ReplacementNotFound { section: String, needle: String },
    #[error("Encoder emits {}-bit code but the image is {}-bit", .encoder.bitness(), .image.bitness())]
    EncoderModeMismatch { image: EncoderMode, encoder: EncoderMode },
}

/// What happened at one call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PatchOutcome {
    Patched { original: Vec<u8>, replacement: Vec<u8> },
    SkippedPatternMismatch { reason: String },
    SkippedAssemblyFailure { error: String },
    SkippedLengthMismatch { original_len: Option<usize>, replacement_len: usize },
    SkippedNoFunction,
    SkippedWriteFailure { error: String },
}

impl PatchOutcome {
    pub fn is_patched(&self) -> bool {
        matches!(self, PatchOutcome::Patched { .. })
    }

    /// Short label for tables and logs.
    pub fn label(&self) -> &'static str {
        match self {
            PatchOutcome::Patched { .. } => "patched",
            PatchOutcome::SkippedPatternMismatch { .. } => "skipped: pattern mismatch",
            PatchOutcome::SkippedAssemblyFailure { .. } => "skipped: assembly failure",
            PatchOutcome::SkippedLengthMismatch { .. } => "skipped: length mismatch",
            PatchOutcome::SkippedNoFunction => "skipped: no containing function",
            PatchOutcome::SkippedWriteFailure { .. } => "skipped: write failure",
        }
    }
}

/// Per-site record, including disassembly before and after for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitePatch {
    pub address: u64,
    pub caller: String,
    pub args: Vec<Argument>,
    pub before: Option<String>,
    pub after: Option<String>,
    #[serde(flatten)]
    pub outcome: PatchOutcome,
}

/// Result of one full pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchReport {
    pub source_symbol: String,
    pub replacement: u64,
    pub sites: Vec<SitePatch>,
}

impl PatchReport {
    pub fn patched_count(&self) -> usize {
        self.sites.iter().filter(|s| s.outcome.is_patched()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.sites.len() - self.patched_count()
    }

    /// Addresses that were rewritten, in processing order.
    pub fn writes(&self) -> Vec<u64> {
        self.sites.iter().filter(|s| s.outcome.is_patched()).map(|s| s.address).collect()
    }
}

/// Runs the whole pipeline against `image` with the given encoder.
pub fn replace_calls(
    image: &mut dyn BinaryImage,
    config: &PatchConfig,
    encoder: &dyn InstructionEncoder,
) -> Result<PatchReport, PatchError> {
    let mode = select_mode(image).inspect_err(|e| warn!(error = %e, "aborting"))?;
    run(image, config, mode, encoder)
}

/// [`replace_calls`] with an [`IcedEncoder`](crate::services::encoder::IcedEncoder)
/// in the mode matching the image's address width.
#[cfg(feature = "iced-encoder")]
pub fn replace_calls_with_default_encoder(
    image: &mut dyn BinaryImage,
    config: &PatchConfig,
) -> Result<PatchReport, PatchError> {
    let mode = select_mode(image).inspect_err(|e| warn!(error = %e, "aborting"))?;
    let encoder = crate::services::encoder::IcedEncoder::new(mode);
    run(image, config, mode, &encoder)
}

/// Everything after the architecture gate, which the caller has already run.
fn run(
    image: &mut dyn BinaryImage,
    config: &PatchConfig,
    mode: EncoderMode,
    encoder: &dyn InstructionEncoder,
) -> Result<PatchReport, PatchError> {
    check_encoder_mode(mode, encoder)?;

    let sites = locate_calls(image, &config.source_symbol)?;

    let section = find_section(image, &config.target_section).ok_or_else(|| {
        warn!(section = %config.target_section, "section not found");
        PatchError::SectionNotFound(config.target_section.clone())
    })?;
    let replacement = find_function_in_range(image, &section, &config.target_name_substring)
        .ok_or_else(|| {
            warn!(needle = %config.target_name_substring, "replacement not found");
            PatchError::ReplacementNotFound {
                section: config.target_section.clone(),
                needle: config.target_name_substring.clone(),
            }
        })?;

    info!(
        sites = sites.len(),
        replacement = format_args!("{replacement:#x}"),
        "replacing calls to {} with {}",
        config.source_symbol,
        config.target_name_substring
    );
    let patches = patch_sites(image, &sites, replacement, encoder);

    let report =
        PatchReport { source_symbol: config.source_symbol.clone(), replacement, sites: patches };
    info!(patched = report.patched_count(), skipped = report.skipped_count(), "run finished");
    Ok(report)
}
