// CLI binary: failures are reported on stderr and turned into exit codes.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::rc::Rc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vbscript::runtime::error::RuntimeError;
use vbscript::runtime::object::{HostObject, InvokeKind, MemberInfo, ParamKind};
use vbscript::runtime::value::{self, Value};
use vbscript::script::error::Diagnostic;
use vbscript::{settings, Engine, Execution, HostError, ModuleScope, TracePoint, TraceSink};

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "vbscript-cli", about = "Compile and run VBScript files", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine settings file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print every executed top-level statement to stderr
    #[arg(long, global = true)]
    trace: bool,

    /// Abort execution after this many milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Output raw JSON instead of formatted text
    #[arg(long, global = true)]
    json: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and execute a script or page
    Run { file: PathBuf },
    /// Compile only and report diagnostics
    Check { file: PathBuf },
}

// ── Host objects ─────────────────────────────────────────────────

const ANY: ParamKind = ParamKind::Any;

fn display(value: &Value) -> String {
    let value = value::unwrap_default(value).unwrap_or_else(|_| value.clone());
    value.repr_string()
}

fn write_stdout(text: &str) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(text.as_bytes());
}

/// `WScript.Echo a, b, ...`
struct WScript;

const WSCRIPT_MEMBERS: [MemberInfo; 6] = [
    MemberInfo::method("Echo", &[]),
    MemberInfo::method("Echo", &[ANY]),
    MemberInfo::method("Echo", &[ANY, ANY]),
    MemberInfo::method("Echo", &[ANY, ANY, ANY]),
    MemberInfo::method("Echo", &[ANY, ANY, ANY, ANY]),
    MemberInfo::method("Echo", &[ANY, ANY, ANY, ANY, ANY]),
];

impl HostObject for WScript {
    fn type_name(&self) -> &str {
        "WScript"
    }

    fn members(&self) -> &[MemberInfo] {
        &WSCRIPT_MEMBERS
    }

    fn invoke(&self, _member: usize, _kind: InvokeKind, args: &[Value]) -> Result<Value, RuntimeError> {
        let line: Vec<String> = args.iter().map(display).collect();
        write_stdout(&format!("{}\n", line.join(" ")));
        Ok(Value::Empty)
    }
}

/// `Response.Write` and the `Response.WriteBlock` calls generated for a
/// page's literal text.
struct Response {
    blocks: Vec<String>,
}

const RESPONSE_MEMBERS: [MemberInfo; 2] = [
    MemberInfo::method("Write", &[ANY]),
    MemberInfo::method("WriteBlock", &[ParamKind::Typed(value::VbType::Long)]),
];

impl HostObject for Response {
    fn type_name(&self) -> &str {
        "Response"
    }

    fn members(&self) -> &[MemberInfo] {
        &RESPONSE_MEMBERS
    }

    fn invoke(&self, member: usize, _kind: InvokeKind, args: &[Value]) -> Result<Value, RuntimeError> {
        let arg = args.first().ok_or_else(|| RuntimeError::wrong_argument_count("Response"))?;
        if member == 0 {
            write_stdout(&display(arg));
        } else {
            let index = usize::try_from(value::to_i64(arg)?).map_err(|_| RuntimeError::subscript_out_of_range())?;
            let block = self.blocks.get(index).ok_or_else(RuntimeError::subscript_out_of_range)?;
            write_stdout(block);
        }
        Ok(Value::Empty)
    }
}

struct StderrTrace;

impl TraceSink for StderrTrace {
    fn statement(&self, point: &TracePoint) {
        eprintln!("trace: {}:{}:{}", point.unit, point.start_line, point.start_column);
    }
}

// ── Commands ─────────────────────────────────────────────────────

fn print_diagnostics(diagnostics: &[Diagnostic], raw_json: bool) {
    if raw_json {
        println!("{}", serde_json::to_string_pretty(diagnostics).unwrap_or_default());
        return;
    }
    for diagnostic in diagnostics {
        eprintln!("{diagnostic}");
    }
}

fn report(error: &HostError, raw_json: bool) {
    match error {
        HostError::Compile(failure) => print_diagnostics(&failure.diagnostics, raw_json),
        HostError::Script(exception) if raw_json => {
            println!("{}", serde_json::to_string_pretty(exception).unwrap_or_default());
        }
        other => eprintln!("Error: {other}"),
    }
}

fn run(engine: &Engine, file: &Path, cli: &Cli) -> Result<(), HostError> {
    let unit = engine.compile_file(file)?;
    let scope = ModuleScope::new();
    scope.add_object("WScript", Rc::new(WScript));
    scope.add_object(
        "Response",
        Rc::new(Response {
            blocks: unit.literal_blocks.clone(),
        }),
    );
    let trace = StderrTrace;
    let execution = Execution {
        trace: cli.trace.then_some(&trace as &dyn TraceSink),
        ..Execution::default()
    };
    engine.execute_with(&unit, &scope, execution)?;
    Ok(())
}

fn check(engine: &Engine, file: &Path, raw_json: bool) -> Result<(), HostError> {
    engine.compile_file(file)?;
    if raw_json {
        print_diagnostics(&[], true);
    } else {
        eprintln!("{}: ok", file.display());
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let mut engine_settings = match &cli.config {
        Some(path) => match settings::load_settings(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error: {e}");
                process::exit(2);
            }
        },
        None => settings::EngineSettings::default(),
    };
    if cli.trace {
        engine_settings.trace = true;
    }
    if let Some(ms) = cli.timeout_ms {
        engine_settings.script_timeout_ms = Some(ms);
    }
    let engine = Engine::new(engine_settings);

    let result = match &cli.command {
        Commands::Run { file } => run(&engine, file, &cli),
        Commands::Check { file } => check(&engine, file, cli.json),
    };
    if let Err(e) = result {
        report(&e, cli.json);
        process::exit(1);
    }
}
