//! Command-line parsing for the `master` and `worker` subcommands.

use std::path::PathBuf;

pub const USAGE: &str = "\
Usage: rowfarm master --worker <addr>... [options]
       rowfarm worker [options]

Master options:
  --worker <addr>         Worker as host or host:port; repeat for each worker
  --size <n>              Dimension of the random input matrices [default: 20]
  --matrix-a <file>       Load A from a text file (requires --matrix-b)
  --matrix-b <file>       Load B from a text file (requires --matrix-a)
  --seed <u64>            Seed for random input matrices
  --output <file>         Write the result matrix here instead of stdout
  --report <file>         Write the per-row dispatch report as JSON
  --verify                Compare against a local multiplication

Worker options:
  --bind <host>           Address to listen on [default: 0.0.0.0]
  --port <port>           Port to listen on [default: 10000]
  --max-connections <k>   Connections served at once [default: 1]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Master(MasterArgs),
    Worker(WorkerArgs),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterArgs {
    pub workers: Vec<String>,
    pub size: Option<usize>,
    pub matrices: Option<(PathBuf, PathBuf)>,
    pub seed: Option<u64>,
    pub output: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub verify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerArgs {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
}

/// Parse `argv`. An empty error message means help was requested.
pub fn parse_args(args: &[String]) -> Result<Command, String> {
    match args.get(1).map(String::as_str) {
        Some("master") => parse_master(&args[2..]).map(Command::Master),
        Some("worker") => parse_worker(&args[2..]).map(Command::Worker),
        Some("--help" | "-h") => Err(String::new()),
        Some(other) => Err(format!("unknown command: {other}")),
        None => Err("missing command: master or worker".to_string()),
    }
}

fn parse_master(args: &[String]) -> Result<MasterArgs, String> {
    let mut parsed = MasterArgs::default();
    let mut matrix_a: Option<PathBuf> = None;
    let mut matrix_b: Option<PathBuf> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--worker" => {
                i += 1;
                parsed.workers.push(value(args, i, "--worker")?.to_string());
            }
            "--size" => {
                i += 1;
                parsed.size = Some(number(args, i, "--size")?);
            }
            "--matrix-a" => {
                i += 1;
                matrix_a = Some(PathBuf::from(value(args, i, "--matrix-a")?));
            }
            "--matrix-b" => {
                i += 1;
                matrix_b = Some(PathBuf::from(value(args, i, "--matrix-b")?));
            }
            "--seed" => {
                i += 1;
                parsed.seed = Some(number(args, i, "--seed")?);
            }
            "--output" => {
                i += 1;
                parsed.output = Some(PathBuf::from(value(args, i, "--output")?));
            }
            "--report" => {
                i += 1;
                parsed.report = Some(PathBuf::from(value(args, i, "--report")?));
            }
            "--verify" => parsed.verify = true,
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    if parsed.workers.is_empty() {
        return Err("at least one --worker is required".to_string());
    }
    parsed.matrices = match (matrix_a, matrix_b) {
        (Some(a), Some(b)) => Some((a, b)),
        (None, None) => None,
        _ => return Err("--matrix-a and --matrix-b must be given together".to_string()),
    };
    if parsed.matrices.is_some() && (parsed.size.is_some() || parsed.seed.is_some()) {
        return Err("--size and --seed only apply to random matrices".to_string());
    }
    Ok(parsed)
}

fn parse_worker(args: &[String]) -> Result<WorkerArgs, String> {
    let mut parsed = WorkerArgs::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                i += 1;
                parsed.bind = Some(value(args, i, "--bind")?.to_string());
            }
            "--port" => {
                i += 1;
                parsed.port = Some(number(args, i, "--port")?);
            }
            "--max-connections" => {
                i += 1;
                parsed.max_connections = Some(number(args, i, "--max-connections")?);
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(parsed)
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn number<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, String> {
    let raw = value(args, i, flag)?;
    raw.parse()
        .map_err(|_| format!("{flag} expects a number, got '{raw}'"))
}
