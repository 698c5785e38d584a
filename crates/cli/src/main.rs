use anyhow::Result;
use bootscope::commands::{
    analyze_command, history_command, log_guids_command, lookup_command, AnalyzeOptions,
    LOG_GUIDS_EXIT_ERROR,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// UEFI Boot Services call and protocol GUID recovery CLI.
///
/// This CLI is a thin wrapper around `bootscope-core` (exposed in code as
/// `bootscope_core`). All substantive logic lives in the library so it can be
/// tested thoroughly and reused from other frontends.
#[derive(Parser, Debug)]
#[command(
    name = "bootscope",
    version,
    about = "Recover UEFI Boot Services calls and protocol GUIDs from firmware modules",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a module: locate Boot Services calls, recover and resolve the
    /// protocol GUIDs passed to them, then annotate the module.
    ///
    /// Annotations are saved under `.bootscope/annotations` so a later run
    /// only applies what is still missing.
    Analyze {
        /// Path to the EFI module (PE/TE image).
        module: String,

        /// Disassembly backend.
        #[arg(long, default_value = "capstone")]
        backend: String,

        /// Project root directory. Defaults to the current working directory.
        #[arg(long, default_value = ".")]
        root: String,

        /// Scan config (YAML or JSON). Defaults to `.bootscope/config.yaml` when present.
        #[arg(long)]
        config: Option<String>,

        /// Report only; do not write annotations.
        #[arg(long, default_value_t = false)]
        no_annotate: bool,

        /// Also sweep data regions for GUIDs no call references.
        #[arg(long, default_value_t = false)]
        sweep: bool,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Do not record the run in the project database.
        #[arg(long, default_value_t = false)]
        no_history: bool,
    },

    /// Append the module's proprietary GUIDs to the Markdown GUID log.
    ///
    /// Exits with status 1 after logging, -1 when the module is rejected and 2
    /// on any other failure.
    LogGuids {
        /// Path to the EFI module.
        module: String,

        /// Log file. Defaults to `log/pp_guids.md` under the project root.
        #[arg(long)]
        log: Option<String>,

        /// Disassembly backend.
        #[arg(long, default_value = "capstone")]
        backend: String,

        /// Project root directory. Defaults to the current working directory.
        #[arg(long, default_value = ".")]
        root: String,

        /// Scan config (YAML or JSON).
        #[arg(long)]
        config: Option<String>,
    },

    /// Resolve a GUID string (`xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`) against the databases.
    Lookup {
        guid: String,

        /// Project root directory, for its scan config.
        #[arg(long, default_value = ".")]
        root: String,

        /// Scan config (YAML or JSON).
        #[arg(long)]
        config: Option<String>,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Show recorded analysis runs.
    History {
        /// Project root directory. Defaults to the current working directory.
        #[arg(long, default_value = ".")]
        root: String,

        /// Only runs of this module.
        #[arg(long)]
        module: Option<String>,

        /// List distinct proprietary GUIDs across all runs instead.
        #[arg(long, default_value_t = false)]
        proprietary: bool,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bootscope=info,bootscope_core=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Command::Analyze {
            module,
            backend,
            root,
            config,
            no_annotate,
            sweep,
            json,
            no_history,
        } => {
            let options = AnalyzeOptions {
                backend,
                root,
                config,
                annotate: !no_annotate,
                sweep,
                json,
                history: !no_history,
            };
            analyze_command(&module, &options)?;
        }
        Command::LogGuids { module, log, backend, root, config } => {
            let code =
                match log_guids_command(&module, log.as_deref(), &backend, &root, config.as_deref())
                {
                    Ok(code) => code,
                    Err(err) => {
                        eprintln!("Error: {err:?}");
                        LOG_GUIDS_EXIT_ERROR
                    }
                };
            std::process::exit(code);
        }
        Command::Lookup { guid, root, config, json } => {
            lookup_command(&guid, &root, config.as_deref(), json)?
        }
        Command::History { root, module, proprietary, json } => {
            history_command(&root, module.as_deref(), proprietary, json)?
        }
    }

    Ok(())
}
