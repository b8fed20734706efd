use tracing::{debug, info, warn};

use crate::model::{CallSite, IrInstruction};
use crate::patch::PatchError;
use crate::services::image::BinaryImage;

/// Finds every direct call to `symbol_name`.
///
/// The symbol is matched by exact raw name. References that are not plain
/// `call target` instructions (tail jumps, indirect calls, address loads) are
/// left out. Read-only: repeated calls on an unmodified image agree.
pub fn locate_calls(
    image: &dyn BinaryImage,
    symbol_name: &str,
) -> Result<Vec<CallSite>, PatchError> {
    let Some(symbol) = image.symbol_by_raw_name(symbol_name) else {
        warn!(symbol = %symbol_name, "symbol not found");
        return Err(PatchError::SymbolNotFound(symbol_name.to_string()));
    };

    let mut sites = Vec::new();
    for xref in image.code_refs(symbol.address) {
        // First containing function per host order.
        let Some(caller) = image.functions_containing(xref.from).into_iter().next() else {
            debug!(address = format_args!("{:#x}", xref.from), "reference outside any function");
            continue;
        };

        match image.call_instruction_at(&caller, xref.from) {
            Some(IrInstruction::Call { params, .. }) => {
                info!(
                    address = format_args!("{:#x}", xref.from),
                    caller = %caller.name,
                    args = params.len(),
                    "found call to {}",
                    symbol.name
                );
                sites.push(CallSite { address: xref.from, caller, args: params });
            }
            Some(IrInstruction::ControlTransfer { kind }) => {
                debug!(address = format_args!("{:#x}", xref.from), ?kind, "not a direct call");
            }
            Some(IrInstruction::Other) | None => {
                debug!(address = format_args!("{:#x}", xref.from), "non-call reference");
            }
        }
    }

    Ok(sites)
}
