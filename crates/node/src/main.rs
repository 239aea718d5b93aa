use utxoscan_log as logging;
use utxoscan_log::{log_info, log_warn};

mod store;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use serde_json::json;
use utxoscan_primitives::hash::script_hash;
use utxoscan_primitives::{bytes_from_hex, hash_to_hex};
use utxoscan_scanner::{
    BlockFiles, BlockchainScanner, MemoryChain, ProgressCallback, ScanPhase, ScanSummary,
    ScannerConfig, ScriptFilter, TxResolution,
};

use crate::store::{open_store, Backend, Store};

const DEFAULT_DATA_DIR: &str = "./data";
const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";

#[derive(Clone, Debug)]
struct Config {
    backend: Backend,
    data_dir: PathBuf,
    blocks_dir: Option<PathBuf>,
    threads: Option<usize>,
    files_per_batch: Option<u32>,
    lookahead: Option<usize>,
    batches_per_link: Option<usize>,
    track: Vec<Vec<u8>>,
    start_height: Option<u32>,
    check: bool,
    progress: bool,
    resolve_only: bool,
    sync_commits: bool,
    json: bool,
    log_level: logging::Level,
    log_format: logging::Format,
    log_timestamps: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Fjall,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            blocks_dir: None,
            threads: None,
            files_per_batch: None,
            lookahead: None,
            batches_per_link: None,
            track: Vec::new(),
            start_height: None,
            check: true,
            progress: true,
            resolve_only: false,
            sync_commits: false,
            json: false,
            log_level: logging::Level::Info,
            log_format: logging::Format::Text,
            log_timestamps: true,
        }
    }
}

impl Config {
    fn blocks_dir(&self) -> PathBuf {
        self.blocks_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("blocks"))
    }

    fn scanner_config(&self) -> ScannerConfig {
        let mut config = ScannerConfig {
            report_progress: self.progress,
            ..ScannerConfig::default()
        };
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(files) = self.files_per_batch {
            config.files_per_batch = files;
        }
        if let Some(lookahead) = self.lookahead {
            config.lookahead = lookahead;
        }
        if let Some(per_link) = self.batches_per_link {
            config.batches_per_link = per_link;
        }
        config.with_progress(progress_logger())
    }
}

#[derive(Debug)]
enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

fn main() {
    let action = match parse_args_from(std::env::args().skip(1)) {
        Ok(action) => action,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };
    let result = match action {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("utxoscand {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run(config),
    };
    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });

    std::fs::create_dir_all(&config.data_dir)
        .map_err(|err| format!("failed to create {}: {err}", config.data_dir.display()))?;
    let _lock = lock_data_dir(&config.data_dir)?;
    if config.track.is_empty() {
        log_warn!("no --track scripts given; only block metadata will be indexed");
    }
    if config.backend == Backend::Memory {
        log_warn!("memory backend selected; scan results are discarded on exit");
    }

    let blocks_dir = config.blocks_dir();
    let blocks = Arc::new(
        BlockFiles::open(&blocks_dir)
            .map_err(|err| format!("failed to open {}: {err}", blocks_dir.display()))?,
    );
    let chain = Arc::new(
        MemoryChain::load_from(blocks.as_ref())
            .map_err(|err| format!("failed to load headers: {err}"))?,
    );
    log_info!("loaded {} header(s) from {}", chain.len(), blocks_dir.display());

    let store = Arc::new(open_store(
        config.backend,
        &config.data_dir,
        config.sync_commits,
    )?);
    let filter = Arc::new(ScriptFilter::with_scripts(config.track.iter()));
    let scanner = BlockchainScanner::new(
        store,
        chain,
        blocks,
        filter,
        config.scanner_config(),
    )
    .map_err(|err| err.to_string())?;

    if config.resolve_only {
        let resolution = scanner.resolve_tx_hashes().map_err(|err| err.to_string())?;
        print_resolution(&resolution, config.json);
        return Ok(());
    }

    let scanned = if config.check {
        scanner.scan(config.start_height.unwrap_or(0))
    } else {
        let start = config.start_height.unwrap_or_else(|| {
            scanner
                .top_scanned()
                .map_or(0, |tip| tip.height.saturating_add(1))
        });
        scanner.scan_nocheck(start)
    };
    let summary = scanned.map_err(|err| err.to_string())?;
    print_summary(&scanner, &config, &summary)
}

/// Logs each phase change and every whole percent of progress.
fn progress_logger() -> ProgressCallback {
    let last: Mutex<Option<(ScanPhase, u32)>> = Mutex::new(None);
    Arc::new(move |phase: ScanPhase, fraction: f64, eta_secs: u64, threads: usize| {
        let percent = (fraction * 100.0).floor() as u32;
        let mut last = last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *last == Some((phase, percent)) {
            return;
        }
        *last = Some((phase, percent));
        log_info!(
            "{} {percent}% (eta {eta_secs}s, {threads} thread(s))",
            phase.as_str()
        );
    })
}

fn print_resolution(resolution: &TxResolution, as_json: bool) {
    if as_json {
        let value = json!({
            "resolved": resolution.resolved.len(),
            "rejected": resolution.rejected.len(),
            "unresolved": resolution
                .unresolved
                .iter()
                .map(hash_to_hex)
                .collect::<Vec<_>>(),
        });
        println!("{value}");
        return;
    }
    println!(
        "resolved {} hash(es), rejected {} candidate(s), {} unresolved",
        resolution.resolved.len(),
        resolution.rejected.len(),
        resolution.unresolved.len()
    );
    for hash in &resolution.unresolved {
        println!("  unresolved {}", hash_to_hex(hash));
    }
}

fn print_summary(
    scanner: &BlockchainScanner<Store>,
    config: &Config,
    summary: &ScanSummary,
) -> Result<(), String> {
    let utxos = scanner.utxos();
    let mut addresses = Vec::with_capacity(config.track.len());
    for script in &config.track {
        let hash = script_hash(script);
        let owned: Vec<_> = utxos.iter().filter(|out| out.script_hash == hash).collect();
        let balance: i64 = owned.iter().map(|out| out.value).sum();
        let history = scanner.history(&hash).map_err(|err| err.to_string())?;
        addresses.push((to_hex(script), owned.len(), balance, history.len()));
    }

    if config.json {
        let value = json!({
            "start_height": summary.start_height,
            "top_height": summary.top.map(|tip| tip.height),
            "top_hash": summary.top.map(|tip| hash_to_hex(&tip.hash)),
            "rewound": summary.rewound,
            "blocks": summary.blocks,
            "events": summary.events,
            "utxos": utxos.len(),
            "resolved": summary.resolution.resolved.len(),
            "unresolved": summary.resolution.unresolved.len(),
            "addresses": addresses
                .iter()
                .map(|(script, count, balance, history)| json!({
                    "script": script,
                    "utxos": count,
                    "balance": balance,
                    "history": history,
                }))
                .collect::<Vec<_>>(),
        });
        println!("{value}");
        return Ok(());
    }

    match summary.top {
        Some(tip) => println!("top {} {}", tip.height, hash_to_hex(&tip.hash)),
        None => println!("top unset"),
    }
    println!(
        "scanned {} block(s) from height {}, {} event(s), {} rewound",
        summary.blocks, summary.start_height, summary.events, summary.rewound
    );
    for (script, count, balance, history) in &addresses {
        println!("  {script}: {count} utxo(s), balance {balance}, {history} event(s)");
    }
    Ok(())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            Err(format!(
                "data dir {} is already locked ({}); lock file {}",
                data_dir.display(),
                match holder.trim() {
                    "" => "another scan may be running",
                    held => held,
                },
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {}: {err}",
            data_dir.display()
        )),
    }
}

fn parse_value<T: FromStr>(flag: &str, value: Option<String>) -> Result<T, String> {
    let value = value.ok_or_else(|| format!("missing value for {flag}\n{}", usage()))?;
    value
        .parse()
        .map_err(|_| format!("invalid value '{value}' for {flag}\n{}", usage()))
}

fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut config = Config::default();
    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" | "help" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" | "version" => return Ok(CliAction::PrintVersion),
            "--backend" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --backend\n{}", usage()))?;
                config.backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
            }
            "--data-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --data-dir\n{}", usage()))?;
                config.data_dir = PathBuf::from(value);
            }
            "--blocks-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --blocks-dir\n{}", usage()))?;
                config.blocks_dir = Some(PathBuf::from(value));
            }
            "--threads" => config.threads = Some(parse_value("--threads", args.next())?),
            "--files-per-batch" => {
                config.files_per_batch = Some(parse_value("--files-per-batch", args.next())?)
            }
            "--lookahead" => config.lookahead = Some(parse_value("--lookahead", args.next())?),
            "--batches-per-link" => {
                config.batches_per_link = Some(parse_value("--batches-per-link", args.next())?)
            }
            "--start-height" => {
                config.start_height = Some(parse_value("--start-height", args.next())?)
            }
            "--track" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --track\n{}", usage()))?;
                let script = bytes_from_hex(&value)
                    .filter(|script| !script.is_empty())
                    .ok_or_else(|| format!("invalid script hex '{value}'\n{}", usage()))?;
                config.track.push(script);
            }
            "--no-check" => config.check = false,
            "--no-progress" => config.progress = false,
            "--resolve" => config.resolve_only = true,
            "--sync-commits" => config.sync_commits = true,
            "--json" => config.json = true,
            "--log-level" | "--loglevel" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-level\n{}", usage()))?;
                config.log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
            }
            "--log-format" | "--logformat" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-format\n{}", usage()))?;
                config.log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
            }
            "--log-timestamps" | "--logtimestamps" => config.log_timestamps = true,
            "--no-log-timestamps" | "--no-logtimestamps" => config.log_timestamps = false,
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }
    Ok(CliAction::Run(config))
}

fn usage() -> String {
    [
        "Usage:",
        "  utxoscand [options]",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --backend  Storage backend to use (memory|fjall) (default: fjall)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --blocks-dir  Directory holding blkNNNNN.dat files (default: <data-dir>/blocks)",
        "  --track <hex>  Output script to track; repeatable",
        "  --start-height <n>  Height to scan from (default: resume)",
        "  --no-check  Skip the merkle check of committed data before scanning",
        "  --resolve  Only resolve transaction hashes missing a hint, then exit",
        "  --threads <n>  Scan worker threads (default: available cores)",
        "  --files-per-batch <n>  Block files per scan batch (default: 1)",
        "  --lookahead <n>  Batches in flight ahead of the commit point (default: 10)",
        "  --batches-per-link <n>  Batches committed per atomic write (default: 1)",
        "  --sync-commits  fsync every commit (fjall backend)",
        "  --no-progress  Do not log scan progress",
        "  --json  Print the summary as JSON",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Prefix log lines with timestamps (default)",
        "  --no-log-timestamps  Omit log timestamps",
    ]
    .join("\n")
}
