use std::path::Path;

use anyhow::{Context, Result};
use callpatch_core::model::Argument;
use callpatch_core::patch::{locate_calls, pattern_mismatch};
use callpatch_core::services::backends::ElfImage;
use serde::{Deserialize, Serialize};

/// One located call site as shown by `list-calls`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CallSiteRow {
    pub address: u64,
    pub caller: String,
    pub args: Vec<Argument>,
    pub eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Locate calls to `symbol` without modifying anything.
pub fn list_calls_command(binary: &str, symbol: &str, json: bool) -> Result<()> {
    let binary = Path::new(binary);
    let image = ElfImage::open(binary)
        .with_context(|| format!("Failed to load ELF image {}", binary.display()))?;
    let rows: Vec<CallSiteRow> = locate_calls(&image, symbol)?
        .into_iter()
        .map(|site| {
            let reason = pattern_mismatch(&site.args);
            CallSiteRow {
                address: site.address,
                caller: site.caller.name,
                args: site.args,
                eligible: reason.is_none(),
                reason,
            }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No calls to {symbol} found.");
        return Ok(());
    }

    println!("Calls to {symbol} ({}):", rows.len());
    for row in rows {
        let args = row.args.iter().map(|a| a.expr.as_str()).collect::<Vec<_>>().join(", ");
        let status = match &row.reason {
            None => "eligible".to_string(),
            Some(reason) => format!("skip: {reason}"),
        };
        println!("  {:#x}  {}({})  in {}  [{}]", row.address, symbol, args, row.caller, status);
    }
    Ok(())
}
