use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use sbjit::config::JitConfig;
use sbjit::jit::dispatcher;
use sbjit::jit::{CompileOutcome, HelperTable, JitCompiler};
use sbjit::program::loader::ProgramFile;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum FormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "sbjit")]
#[command(about = "x86-64 JIT for sandboxed register VM programs", long_about = None)]
struct Cli {
    /// Log every compiler pass
    #[arg(long, global = true)]
    trace_jit: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a program file and print the generated code
    Compile {
        /// Program description (TOML)
        file: PathBuf,
        /// JIT configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = FormatArg::Human)]
        format: FormatArg,
    },
    /// Emit a dispatcher for the given function addresses
    Dispatch {
        /// Address the dispatcher will be loaded at
        #[arg(long, value_parser = parse_addr)]
        base: usize,
        /// Target addresses (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_addr)]
        funcs: Vec<usize>,
        #[arg(long, value_enum, default_value_t = FormatArg::Human)]
        format: FormatArg,
    },
}

fn parse_addr(s: &str) -> Result<usize, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Serialize)]
struct CompileReport {
    name: String,
    entry: usize,
    len: usize,
    passes: usize,
    exentries: usize,
    addrs: Vec<usize>,
    code: String,
}

#[derive(Serialize)]
struct DispatchReport {
    base: usize,
    len: usize,
    code: String,
}

fn init_logging(trace_jit: bool) {
    let default = if trace_jit { "sbjit=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_compile(file: &Path, config: Option<&Path>, format: FormatArg) -> Result<(), String> {
    let config = match config {
        Some(path) => JitConfig::load(path).map_err(|e| format!("error: {}", e))?,
        None => JitConfig::default(),
    };
    let program_file = ProgramFile::load(file).map_err(|e| format!("error: {}", e))?;
    let mut prog = program_file.to_program().map_err(|e| format!("error: {}", e))?;

    let mut helpers = HelperTable::new();
    for helper in &program_file.helpers {
        helpers.insert(helper.id, helper.addr as usize);
    }

    let compiler = JitCompiler::new(config);
    let compiled = match compiler
        .compile(&mut prog, &helpers)
        .map_err(|e| format!("error: {}", e))?
    {
        CompileOutcome::Compiled(compiled) => compiled,
        CompileOutcome::Pending(pending) => {
            return Err(format!(
                "error: '{}' calls sub-programs that are not loaded ({} bytes converged)",
                prog.name,
                pending.context().code_len()
            ));
        }
    };

    let report = CompileReport {
        name: compiled.name().to_string(),
        entry: compiled.entry(),
        len: compiled.code().len(),
        passes: compiled.passes(),
        exentries: compiled.extable().len(),
        addrs: compiled.addrs().to_vec(),
        code: hex(compiled.code()),
    };
    match format {
        FormatArg::Human => {
            println!("{}: {} bytes, {} passes", report.name, report.len, report.passes);
            println!("entry: {:#x}", report.entry);
            println!("exception table entries: {}", report.exentries);
            for (i, off) in report.addrs.iter().take(report.addrs.len() - 1).enumerate() {
                println!("  insn {:4} @ {:#06x}", i, off);
            }
            println!("{}", report.code);
        }
        FormatArg::Json => {
            let json = serde_json::to_string_pretty(&report).map_err(|e| format!("error: {}", e))?;
            println!("{}", json);
        }
    }
    Ok(())
}

fn run_dispatch(base: usize, funcs: &[usize], format: FormatArg) -> Result<(), String> {
    let code = dispatcher::emit_dispatcher(funcs, Some(base)).map_err(|e| format!("error: {}", e))?;
    let report = DispatchReport {
        base,
        len: code.len(),
        code: hex(&code),
    };
    match format {
        FormatArg::Human => {
            println!("dispatcher @ {:#x}: {} bytes", report.base, report.len);
            println!("{}", report.code);
        }
        FormatArg::Json => {
            let json = serde_json::to_string_pretty(&report).map_err(|e| format!("error: {}", e))?;
            println!("{}", json);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.trace_jit);

    let result = match cli.command {
        Commands::Compile {
            file,
            config,
            format,
        } => run_compile(&file, config.as_deref(), format),
        Commands::Dispatch { base, funcs, format } => run_dispatch(base, &funcs, format),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
