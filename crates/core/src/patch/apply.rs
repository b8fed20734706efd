use tracing::{debug, info, warn};

use crate::model::{Argument, ArgumentKind, CallSite};
use crate::patch::{PatchError, PatchOutcome, SitePatch};
use crate::services::encoder::{EncoderMode, InstructionEncoder};
use crate::services::image::BinaryImage;

/// Architecture identifiers accepted as the x86 family.
const SUPPORTED_ARCHES: &[&str] = &["x86_64", "amd64", "x86", "i386"];

/// Gate run once before any site is touched: x86 family, 4- or 8-byte addresses.
pub fn select_mode(image: &dyn BinaryImage) -> Result<EncoderMode, PatchError> {
    let arch = image.architecture();
    let unsupported = || PatchError::UnsupportedArchitecture {
        arch: arch.to_string(),
        address_size: image.address_size(),
    };
    if !SUPPORTED_ARCHES.contains(&arch.to_lowercase().as_str()) {
        return Err(unsupported());
    }
    EncoderMode::from_address_size(image.address_size()).ok_or_else(unsupported)
}

/// Why a call site's arguments rule it out, or `None` if it is eligible.
///
/// Only one shape is safe to redirect: exactly one argument that is a plain
/// variable. A literal first argument is a format string that may carry
/// specifiers, and extra arguments mean the callee is used variadically.
pub fn pattern_mismatch(args: &[Argument]) -> Option<String> {
    match args {
        [arg] => match arg.kind {
            ArgumentKind::Variable => None,
            ArgumentKind::Computed => {
                Some(format!("argument `{}` is a computed expression", arg.expr))
            }
            ArgumentKind::Literal => Some(format!("argument `{}` is a literal", arg.expr)),
        },
        [] => Some("call has no arguments".to_string()),
        more => Some(format!("call has {} arguments, expected 1", more.len())),
    }
}

/// Rewrites every eligible site into `call replacement`.
///
/// Sites are processed in the given order and independently: a failure on
/// one site is recorded in its outcome and the batch moves on. Writes that
/// already happened stay applied.
pub fn patch_all(
    image: &mut dyn BinaryImage,
    sites: &[CallSite],
    replacement: u64,
    encoder: &dyn InstructionEncoder,
) -> Result<Vec<SitePatch>, PatchError> {
    let mode = select_mode(image)?;
    check_encoder_mode(mode, encoder)?;
    Ok(patch_sites(image, sites, replacement, encoder))
}

/// The encoder must emit code for the width the image was selected for.
pub(crate) fn check_encoder_mode(
    mode: EncoderMode,
    encoder: &dyn InstructionEncoder,
) -> Result<(), PatchError> {
    if mode == encoder.mode() {
        return Ok(());
    }
    let err = PatchError::EncoderModeMismatch { image: mode, encoder: encoder.mode() };
    warn!(error = %err, "aborting");
    Err(err)
}

/// [`patch_all`] after the gate has passed.
pub(crate) fn patch_sites(
    image: &mut dyn BinaryImage,
    sites: &[CallSite],
    replacement: u64,
    encoder: &dyn InstructionEncoder,
) -> Vec<SitePatch> {
    let mut patches = Vec::with_capacity(sites.len());
    for site in sites {
        patches.push(patch_site(image, site, replacement, encoder));
    }
    patches
}

fn patch_site(
    image: &mut dyn BinaryImage,
    site: &CallSite,
    replacement: u64,
    encoder: &dyn InstructionEncoder,
) -> SitePatch {
    let address = site.address;
    let before = image.disassembly_at(address);
    let mut record = SitePatch {
        address,
        caller: site.caller.name.clone(),
        args: site.args.clone(),
        before: before.clone(),
        after: None,
        outcome: PatchOutcome::SkippedNoFunction,
    };

    if let Some(reason) = pattern_mismatch(&site.args) {
        debug!(address = format_args!("{address:#x}"), %reason, "skipping call");
        record.outcome = PatchOutcome::SkippedPatternMismatch { reason };
        return record;
    }

    if image.functions_containing(address).is_empty() {
        warn!(address = format_args!("{address:#x}"), "no function contains call site");
        return record;
    }

    info!(
        address = format_args!("{address:#x}"),
        original = before.as_deref().unwrap_or("?"),
        "eligible call"
    );

    let asm = format!("call {replacement:#x}");
    let encoding = match encoder.assemble(&asm, address) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(address = format_args!("{address:#x}"), error = %e, "assembly failed");
            record.outcome = PatchOutcome::SkippedAssemblyFailure { error: e.to_string() };
            return record;
        }
    };

    let original_len = image.instruction_length(address);
    if original_len != Some(encoding.len()) {
        warn!(
            address = format_args!("{address:#x}"),
            original = ?original_len,
            replacement = encoding.len(),
            "encoded length differs from original instruction"
        );
        record.outcome = PatchOutcome::SkippedLengthMismatch {
            original_len,
            replacement_len: encoding.len(),
        };
        return record;
    }

    let original = image.read(address, encoding.len()).unwrap_or_default();
    if let Err(e) = image.write(address, &encoding) {
        warn!(address = format_args!("{address:#x}"), error = %e, "write failed");
        record.outcome = PatchOutcome::SkippedWriteFailure { error: e.to_string() };
        return record;
    }

    // The write may have changed which function the host thinks owns the site.
    if let Some(function) = image.functions_containing(address).into_iter().next() {
        image.reanalyze(&function);
        debug!(function = %function.name, start = format_args!("{:#x}", function.start), "reanalyzed");
    }

    record.after = image.disassembly_at(address);
    info!(
        address = format_args!("{address:#x}"),
        patched = record.after.as_deref().unwrap_or("?"),
        "call redirected"
    );
    record.outcome = PatchOutcome::Patched { original, replacement: encoding };
    record
}
