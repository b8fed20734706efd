use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use callpatch_core::config::PatchConfig;
use callpatch_core::patch::{replace_calls_with_default_encoder, PatchOutcome, PatchReport};
use callpatch_core::services::backends::ElfImage;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::commands::resolve_config;
use crate::{default_output_path, sha256_bytes, sha256_file};

/// Arguments of `callpatch patch`.
#[derive(Debug, Clone, Default)]
pub struct PatchArgs {
    pub binary: String,
    pub output: Option<String>,
    pub config: Option<String>,
    pub source_symbol: Option<String>,
    pub target_section: Option<String>,
    pub target_name: Option<String>,
    pub json: bool,
}

/// Machine-readable summary printed by `patch --json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PatchSummary {
    pub binary: String,
    pub output: String,
    pub input_sha256: String,
    pub output_sha256: String,
    pub started_at: String,
    pub finished_at: String,
    pub config: PatchConfig,
    pub report: PatchReport,
}

/// Rewrite eligible call sites of `args.binary` and save the result.
///
/// Nothing is written when the run aborts (unsupported architecture,
/// missing symbol, section or replacement).
pub fn patch_command(args: PatchArgs) -> Result<()> {
    let started_at = Utc::now().to_rfc3339();
    let binary = Path::new(&args.binary);
    if !binary.exists() {
        return Err(anyhow!("Binary file does not exist: {}", binary.display()));
    }

    let config = resolve_config(
        args.config.as_deref(),
        args.source_symbol,
        args.target_section,
        args.target_name,
    )?;
    let output = args.output.map(PathBuf::from).unwrap_or_else(|| default_output_path(binary));

    let input_sha256 = sha256_file(binary)?;
    let mut image = ElfImage::open(binary)
        .with_context(|| format!("Failed to load ELF image {}", binary.display()))?;
    let report = replace_calls_with_default_encoder(&mut image, &config)
        .with_context(|| format!("Patching {} aborted", binary.display()))?;

    image.save(&output).with_context(|| format!("Failed to write {}", output.display()))?;
    let output_sha256 = sha256_bytes(image.bytes());
    info!(output = %output.display(), patched = report.patched_count(), "saved patched image");

    let summary = PatchSummary {
        binary: binary.display().to_string(),
        output: output.display().to_string(),
        input_sha256,
        output_sha256,
        started_at,
        finished_at: Utc::now().to_rfc3339(),
        config,
        report,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &PatchSummary) {
    let report = &summary.report;
    println!(
        "Patched {} of {} call(s) to {} -> {} at {:#x}",
        report.patched_count(),
        report.sites.len(),
        summary.config.source_symbol,
        summary.config.target_name_substring,
        report.replacement
    );
    for site in &report.sites {
        let detail = match &site.outcome {
            PatchOutcome::Patched { .. } => site.after.clone().unwrap_or_default(),
            PatchOutcome::SkippedPatternMismatch { reason } => reason.clone(),
            PatchOutcome::SkippedAssemblyFailure { error }
            | PatchOutcome::SkippedWriteFailure { error } => error.clone(),
            PatchOutcome::SkippedLengthMismatch { original_len, replacement_len } => format!(
                "{} byte(s) available, {} needed",
                original_len.map(|n| n.to_string()).unwrap_or_else(|| "?".into()),
                replacement_len
            ),
            PatchOutcome::SkippedNoFunction => String::new(),
        };
        println!("  {:#x} in {}: {} {}", site.address, site.caller, site.outcome.label(), detail);
    }
    println!("Output: {}", summary.output);
    println!("SHA-256: {} -> {}", summary.input_sha256, summary.output_sha256);
}
