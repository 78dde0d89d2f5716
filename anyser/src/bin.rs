//! `anyser-cli`: a worked-example command line front end over
//! `anyser-core`'s parser, printer, scanner and converter, plus the
//! demonstration host binding in `anyser::Bind`. Not the host-binding
//! contract itself (spec.md §6.2) — a smoke-test surface for it.

use clap::{Parser, Subcommand, ValueEnum};

use anyser_core::{parser, printer, scan, ConvertPolicy};

#[derive(Parser)]
#[command(name = "anyser-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Parse, print, scan and convert self-describing (T, V) values", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, ValueEnum)]
enum TextMode {
    Strict,
    Liberal,
    Json,
}

impl From<TextMode> for parser::ParseMode {
    fn from(m: TextMode) -> Self {
        match m {
            TextMode::Strict => parser::ParseMode::Strict,
            TextMode::Liberal => parser::ParseMode::Liberal,
            TextMode::Json => parser::ParseMode::Json,
        }
    }
}

#[derive(Copy, Clone, ValueEnum)]
enum PrintFormat {
    Native,
    Json,
}

impl From<PrintFormat> for printer::PrintMode {
    fn from(m: PrintFormat) -> Self {
        match m {
            PrintFormat::Native => printer::PrintMode::Native,
            PrintFormat::Json => printer::PrintMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Parse a text literal into its (T, V) wire pair, printed as type
    /// string + hex value bytes.
    Parse {
        text: String,
        #[arg(long, value_enum, default_value_t = TextMode::Strict)]
        mode: TextMode,
    },
    /// Render a (T, V) wire pair back to text.
    Print {
        #[arg(long)]
        type_str: String,
        #[arg(long)]
        hex: String,
        #[arg(long, value_enum, default_value_t = PrintFormat::Native)]
        format: PrintFormat,
        /// Truncate the rendering after this many bytes.
        #[arg(long)]
        max_len: Option<usize>,
    },
    /// Validate a (T, V) wire pair without materializing it.
    Scan {
        #[arg(long)]
        type_str: String,
        #[arg(long)]
        hex: String,
        /// Recursively validate nested `any` payloads too.
        #[arg(long)]
        recursive: bool,
    },
    /// Convert a (T, V) wire pair into a different target type.
    Convert {
        #[arg(long)]
        from_type: String,
        #[arg(long)]
        to_type: String,
        #[arg(long)]
        hex: String,
        /// Comma-separated policy bits: bool,ints,ints_narrowing,double,
        /// expected,any,aux,tuple_list,all.
        #[arg(long, default_value = "")]
        policy: String,
    },
}

impl std::fmt::Display for TextMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TextMode::Strict => "strict",
            TextMode::Liberal => "liberal",
            TextMode::Json => "json",
        })
    }
}

impl std::fmt::Display for PrintFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PrintFormat::Native => "native",
            PrintFormat::Json => "json",
        })
    }
}

fn parse_policy(spec: &str) -> ConvertPolicy {
    let mut policy = ConvertPolicy::NONE;
    for tok in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        policy = policy.union(match tok {
            "bool" => ConvertPolicy::BOOL,
            "ints" => ConvertPolicy::INTS,
            "ints_narrowing" => ConvertPolicy::INTS_NARROWING,
            "double" => ConvertPolicy::DOUBLE,
            "expected" => ConvertPolicy::EXPECTED,
            "any" => ConvertPolicy::ANY,
            "aux" => ConvertPolicy::AUX,
            "tuple_list" => ConvertPolicy::TUPLE_LIST,
            "all" => ConvertPolicy::ALL,
            other => {
                eprintln!("unknown policy bit '{other}', ignoring");
                ConvertPolicy::NONE
            }
        });
    }
    policy
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("hex string must have an even number of digits".into());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    match cli.command {
        Command::Parse { text, mode } => {
            let parsed = parser::parse_value(&text, mode.into()).map_err(|e| e.to_string())?;
            println!("type: {}", parsed.ty);
            println!("value: {}", to_hex(&parsed.val));
        }
        Command::Print { type_str, hex, format, max_len } => {
            let val = from_hex(&hex)?;
            let out = printer::print_value(anyser_core::codec::AnyView::new(&type_str, &val), format.into(), max_len);
            match out {
                printer::PrintOutcome::Complete(s) => println!("{s}"),
                printer::PrintOutcome::TooLong(s) => {
                    println!("{s}");
                    eprintln!("(truncated: exceeded max_len)");
                }
            }
        }
        Command::Scan { type_str, hex, recursive } => {
            let val = from_hex(&hex)?;
            match scan::scan(&type_str, &val, recursive) {
                Ok((tlen, vlen)) => println!("ok: consumed {tlen} type byte(s), {vlen} value byte(s)"),
                Err(e) => return Err(e.to_string()),
            }
        }
        Command::Convert { from_type, to_type, hex, policy } => {
            let val = from_hex(&hex)?;
            let policy = parse_policy(&policy);
            let mut unplaced = Vec::new();
            let out = anyser_core::convert(&from_type, &val, &to_type, policy, Some(&mut unplaced)).map_err(|e| e.to_string())?;
            println!("value: {}", to_hex(&out));
            for u in &unplaced {
                println!("unplaced error at (source {}, target {}): {}", u.source_offset, u.target_offset, u.error.message);
            }
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
