use anyhow::Result;
use callpatch::commands::{init_config_command, list_calls_command, patch_command, PatchArgs};
use clap::{ArgAction, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Rewrites printf call sites into puts calls in x86 ELF binaries.
///
/// This CLI is a thin wrapper around `callpatch-core` (exposed in code as
/// `callpatch_core`). Locating, validating, and encoding all live in the
/// library.
#[derive(Parser, Debug)]
#[command(
    name = "callpatch",
    version,
    about = "Rewrite eligible printf call sites into calls to puts",
    long_about = None
)]
struct Cli {
    /// Log more to stderr (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rewrite every eligible call site and save the patched binary.
    ///
    /// A site is eligible when the call passes exactly one plain variable.
    /// Other sites are reported and left alone.
    Patch {
        /// ELF binary to patch. It is never modified in place unless
        /// `--output` points at it.
        #[arg(long)]
        binary: String,

        /// Where to write the result. Defaults to `<binary>.patched`.
        #[arg(long)]
        output: Option<String>,

        /// YAML or JSON patch config. Defaults apply when omitted.
        #[arg(long)]
        config: Option<String>,

        /// Symbol whose call sites are rewritten (default: printf).
        #[arg(long)]
        source_symbol: Option<String>,

        /// Section searched for the replacement (default: .plt.sec).
        #[arg(long)]
        target_section: Option<String>,

        /// Substring naming the replacement function (default: puts).
        #[arg(long)]
        target_name: Option<String>,

        /// Emit a JSON run summary instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List calls to a symbol and whether each would be patched.
    ListCalls {
        /// ELF binary to inspect.
        #[arg(long)]
        binary: String,

        /// Raw symbol name to look up.
        #[arg(long, default_value = "printf")]
        symbol: String,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Write the default patch config (YAML or JSON by extension).
    InitConfig {
        #[arg(long, default_value = "callpatch.yml")]
        path: String,

        /// Overwrite an existing file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Print the core library version.
    Version,
}

fn init_tracing(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    // Default to printing the version if no command is provided.
    match cli.command.unwrap_or(Command::Version) {
        Command::Patch {
            binary,
            output,
            config,
            source_symbol,
            target_section,
            target_name,
            json,
        } => patch_command(PatchArgs {
            binary,
            output,
            config,
            source_symbol,
            target_section,
            target_name,
            json,
        })?,
        Command::ListCalls { binary, symbol, json } => list_calls_command(&binary, &symbol, json)?,
        Command::InitConfig { path, force } => init_config_command(&path, force)?,
        Command::Version => println!("callpatch v{}", callpatch_core::version()),
    }

    Ok(())
}
