use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::fmt;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use witnessd_core::chains;
use witnessd_core::config::Config;
use witnessd_core::datadir::{DataDir, DataDirError};
use witnessd_core::declaration::{Declaration, Modality};
use witnessd_core::engine::{document_fingerprint, Engine, EngineError};
use witnessd_core::evidence::{self, Tier};
use witnessd_core::keyhierarchy;
use witnessd_core::vdf;
use witnessd_core::wal;

#[derive(Parser)]
#[command(author, version, about = "Cryptographic authorship witnessing CLI", long_about = None)]
struct Cli {
    /// Data directory (default: $WITNESSD_DATA_DIR or ~/.witnessd)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and device identity
    Init,
    /// Create a checkpoint for a file
    Commit {
        /// Path to the file to checkpoint
        file: PathBuf,
        /// Commit message
        #[arg(short, long)]
        message: Option<String>,
        /// Target VDF duration in seconds (default: time since last commit)
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Show checkpoint history for a file
    Log {
        file: PathBuf,
    },
    /// Verify a tracked document, an evidence packet, or a legacy chain
    Verify {
        file: PathBuf,
        /// Treat the file as a legacy JSON chain
        #[arg(long)]
        legacy: bool,
    },
    /// Export an evidence packet
    Export {
        file: PathBuf,
        /// Evidence tier: basic, standard, enhanced, maximum
        #[arg(short = 't', long, default_value = "basic")]
        tier: String,
        /// Output file (default: <file>.evidence.json)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
    /// Collect and sign an authorship declaration
    Declare {
        file: PathBuf,
    },
    /// Calibrate VDF performance for this machine
    Calibrate {
        /// Calibration duration in seconds
        #[arg(long, default_value_t = 2)]
        seconds: u64,
    },
    /// Show status and configuration
    Status,
    /// List all tracked documents
    List,
}

/// Exit 1: bad invocation, missing state, or failed verification.
#[derive(Debug)]
struct VerificationFailed(String);

impl fmt::Display for VerificationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for VerificationFailed {}

#[derive(Debug)]
struct UsageError(String);

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UsageError {}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprintln!("witnessd: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<UsageError>().is_some()
            || cause.downcast_ref::<VerificationFailed>().is_some()
        {
            return 1;
        }
        if let Some(DataDirError::NotInitialized(_)) = cause.downcast_ref::<DataDirError>() {
            return 1;
        }
        if let Some(EngineError::DataDir(DataDirError::NotInitialized(_))) =
            cause.downcast_ref::<EngineError>()
        {
            return 1;
        }
    }
    2
}

fn run(cli: Cli) -> Result<()> {
    let data_dir = DataDir::resolve(cli.data_dir);

    match cli.command {
        Commands::Init => cmd_init(&data_dir),
        Commands::Commit {
            file,
            message,
            duration,
        } => cmd_commit(data_dir, &file, message, duration),
        Commands::Log { file } => cmd_log(data_dir, &file),
        Commands::Verify { file, legacy } => cmd_verify(data_dir, &file, legacy),
        Commands::Export { file, tier, output } => cmd_export(data_dir, &file, &tier, output),
        Commands::Declare { file } => cmd_declare(data_dir, &file),
        Commands::Calibrate { seconds } => cmd_calibrate(&data_dir, seconds),
        Commands::Status => cmd_status(data_dir),
        Commands::List => cmd_list(data_dir),
    }
}

fn cmd_init(data_dir: &DataDir) -> Result<()> {
    let identity = Engine::init(data_dir).context("initialization failed")?;
    println!("Initialized witnessd in {}", data_dir.root().display());
    println!("  device id:   {}", identity.device_id);
    println!("  fingerprint: {}", identity.fingerprint);
    Ok(())
}

fn cmd_commit(
    data_dir: DataDir,
    file: &PathBuf,
    message: Option<String>,
    duration: Option<u64>,
) -> Result<()> {
    let mut engine = Engine::open(data_dir)?;
    let event = engine.commit(file, message, duration.map(Duration::from_secs))?;

    let ordinal = engine.events_for(file)?.len().saturating_sub(1);
    println!("Committed checkpoint {ordinal} for {}", file.display());
    println!("  event hash:     {}", hex::encode(event.event_hash));
    println!("  content hash:   {}", hex::encode(event.content_hash));
    println!("  size delta:     {:+} bytes", event.size_delta);
    println!("  vdf iterations: {}", event.vdf_iterations);
    println!("  edit regions:   {}", event.regions.len());
    Ok(())
}

fn cmd_log(data_dir: DataDir, file: &PathBuf) -> Result<()> {
    let engine = Engine::open(data_dir)?;
    let events = engine.events_for(file)?;
    if events.is_empty() {
        return Err(anyhow!(UsageError(format!(
            "no checkpoints recorded for {}",
            file.display()
        ))));
    }

    for (i, event) in events.iter().enumerate() {
        let when = chrono::DateTime::from_timestamp_nanos(event.timestamp_ns);
        println!(
            "checkpoint {i}  {}  {} bytes ({:+})",
            when.format("%Y-%m-%d %H:%M:%S"),
            event.file_size,
            event.size_delta
        );
        println!("  event hash: {}", hex::encode(event.event_hash));
        if let Some(msg) = &event.context_msg {
            println!("  message:    {msg}");
        }
    }

    let total = engine.total_vdf_time(file)?;
    println!("total proven time: {:.1}s", total.as_secs_f64());
    Ok(())
}

fn cmd_verify(data_dir: DataDir, file: &PathBuf, legacy: bool) -> Result<()> {
    if legacy {
        return verify_legacy_chain(file);
    }

    // Evidence packets are self-contained; everything else is a tracked
    // document verified against the store.
    if let Ok(data) = fs::read(file) {
        if let Ok(packet) = evidence::Packet::decode(&data) {
            if packet.format == evidence::FORMAT {
                return verify_packet(&packet);
            }
        }
    }

    verify_document(data_dir, file)
}

fn verify_legacy_chain(file: &PathBuf) -> Result<()> {
    let chain = chains::Chain::load(file)?;
    match chain.verify() {
        Ok(()) => {
            let summary = chain.summary();
            println!(
                "legacy chain OK: {} checkpoints, {:.1}s proven",
                summary.checkpoint_count,
                summary.total_elapsed_time.as_secs_f64()
            );
            Ok(())
        }
        Err(err) => Err(anyhow!(VerificationFailed(format!(
            "legacy chain invalid: {err}"
        )))),
    }
}

fn verify_packet(packet: &evidence::Packet) -> Result<()> {
    let result = packet.verify();
    println!("evidence packet ({} tier)", packet.tier.as_str());
    println!("  chain:         {}", status(result.chain_valid));
    if let Some(ok) = result.declaration_valid {
        println!("  declaration:   {}", status(ok));
    }
    if let Some(ok) = result.key_hierarchy_valid {
        println!("  key hierarchy: {}", status(ok));
    }
    for error in &result.errors {
        println!("  ! {error}");
    }

    if result.all_valid() {
        Ok(())
    } else {
        Err(anyhow!(VerificationFailed(
            "evidence packet failed verification".to_string()
        )))
    }
}

fn verify_document(data_dir: DataDir, file: &PathBuf) -> Result<()> {
    let engine = Engine::open(data_dir)?;
    let stats = engine.stats()?;
    let verification = engine.verify_document(file)?;

    if verification.chain.events == 0 {
        return Err(anyhow!(UsageError(format!(
            "no checkpoints recorded for {}",
            file.display()
        ))));
    }

    println!("store integrity: {}", status(stats.integrity_ok));
    if let Some(reason) = &stats.integrity_error {
        println!("  ! {reason}");
    }
    println!(
        "chain: {} ({} events, {:.1}s proven)",
        status(verification.chain.valid),
        verification.chain.events,
        verification.chain.total_vdf_time.as_secs_f64()
    );
    for error in &verification.chain.errors {
        println!("  ! {error}");
    }
    if let Some(ok) = verification.certificate_valid {
        println!("session certificate: {}", status(ok));
    }
    if let Some(ok) = verification.signatures_valid {
        println!(
            "ratchet signatures: {} ({} signed events)",
            status(ok),
            verification.signed_events
        );
    }

    let all_ok = stats.integrity_ok
        && verification.chain.valid
        && verification.certificate_valid.unwrap_or(true)
        && verification.signatures_valid.unwrap_or(true);
    if all_ok {
        Ok(())
    } else {
        Err(anyhow!(VerificationFailed(
            "document failed verification".to_string()
        )))
    }
}

fn status(ok: bool) -> &'static str {
    if ok {
        "OK"
    } else {
        "FAILED"
    }
}

fn cmd_export(
    data_dir: DataDir,
    file: &PathBuf,
    tier: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let tier = Tier::parse(tier).map_err(|err| anyhow!(UsageError(err.to_string())))?;
    let engine = Engine::open(data_dir)?;

    let events = engine.events_for(file)?;
    if events.is_empty() {
        return Err(anyhow!(UsageError(format!(
            "no checkpoints recorded for {}",
            file.display()
        ))));
    }

    let mut builder = evidence::Builder::new(&events, engine.vdf_params(), tier)?;

    let declaration_path = declaration_path(file);
    if declaration_path.exists() {
        let declaration = Declaration::decode(&fs::read(&declaration_path)?)?;
        builder = builder.with_declaration(&declaration);
    }

    if tier >= Tier::Standard {
        let record_path = keyhierarchy::session_state_path(
            &engine.data_dir().sessions_dir(),
            &document_fingerprint(&events[0].file_path),
        );
        if record_path.exists() {
            let record = keyhierarchy::load_session_record(&record_path)?;
            let evidence = keyhierarchy::evidence_from_record(engine.identity(), &record);
            builder = builder.with_key_hierarchy(&evidence);
        }
    }

    if tier >= Tier::Enhanced {
        builder = builder.with_hardware(&engine.identity().device_id);
    }

    if tier >= Tier::Maximum {
        if let Ok(session) =
            witnessd_core::sentinel::TrackingSession::load(&engine.data_dir().tracking_dir())
        {
            let wal_path = engine
                .data_dir()
                .wal_dir()
                .join(format!("{}.wal", session.session_id));
            if wal_path.exists() {
                let report = wal::recover(&wal_path, &session.session_id)?;
                builder = builder.with_keystroke(&session.session_id, &report);
            }
        }
    }

    let packet = builder.build();
    let out_path = output.unwrap_or_else(|| {
        let mut path = file.clone();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        path.set_file_name(format!("{name}.evidence.json"));
        path
    });
    fs::write(&out_path, packet.encode()?)?;

    println!(
        "Exported {} tier evidence to {}",
        packet.tier.as_str(),
        out_path.display()
    );
    println!("  checkpoints: {}", packet.document.checkpoints);
    println!(
        "  proven time: {:.1}s",
        packet.document.total_vdf_time.as_secs_f64()
    );
    println!("  chain hash:  {}", packet.chain_hash);
    Ok(())
}

fn declaration_path(file: &PathBuf) -> PathBuf {
    let mut path = file.clone();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.set_file_name(format!("{name}.declaration.json"));
    path
}

fn cmd_declare(data_dir: DataDir, file: &PathBuf) -> Result<()> {
    let engine = Engine::open(data_dir)?;
    let events = engine.events_for(file)?;
    let last = events.last().ok_or_else(|| {
        anyhow!(UsageError(format!(
            "no checkpoints recorded for {}; commit before declaring",
            file.display()
        )))
    })?;

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    let modality = loop {
        let answer = prompt(&mut lines, "Input modality [keyboard/dictation/mixed]: ")?;
        match Modality::parse(answer.trim()) {
            Some(modality) => break modality,
            None => println!("please answer keyboard, dictation, or mixed"),
        }
    };

    let tools_line = prompt(&mut lines, "AI tools used (comma-separated, empty for none): ")?;
    let ai_tools: Vec<String> = tools_line
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    let statement = loop {
        let answer = prompt(&mut lines, "Statement about how this document was written:\n> ")?;
        if answer.trim().is_empty() {
            println!("a statement is required");
            continue;
        }
        break answer.trim().to_string();
    };

    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.display().to_string());

    let signing_key = engine.master_signing_key()?;
    let declaration = Declaration::new(
        name,
        last.content_hash,
        last.event_hash,
        modality,
        statement,
    )
    .with_ai_tools(ai_tools)
    .sign(&signing_key)?;

    let out_path = declaration_path(file);
    fs::write(&out_path, declaration.encode()?)?;
    println!("Signed declaration written to {}", out_path.display());
    Ok(())
}

fn prompt(
    lines: &mut std::io::Lines<std::io::StdinLock>,
    message: &str,
) -> Result<String> {
    print!("{message}");
    io::stdout().flush()?;
    match lines.next() {
        Some(line) => Ok(line?),
        None => Err(anyhow!(UsageError("stdin closed".to_string()))),
    }
}

fn cmd_calibrate(data_dir: &DataDir, seconds: u64) -> Result<()> {
    println!("Calibrating VDF for {seconds}s...");
    let params = vdf::calibrate(Duration::from_secs(seconds))?;

    let config_path = data_dir.config_path();
    let mut config = Config::load_or_default(&config_path)?;
    config.set_vdf_parameters(params);
    config.persist(&config_path)?;

    println!(
        "  {} iterations/second ({} min, {} max)",
        params.iterations_per_second, params.min_iterations, params.max_iterations
    );
    Ok(())
}

fn cmd_status(data_dir: DataDir) -> Result<()> {
    println!("data directory: {}", data_dir.root().display());
    if !data_dir.is_initialized() {
        println!("not initialized (run `witnessd init`)");
        return Ok(());
    }

    let engine = Engine::open(data_dir)?;
    let stats = engine.stats()?;
    let params = engine.vdf_params();

    println!("identity: {}", engine.identity().fingerprint);
    println!("device id: {}", engine.identity().device_id);
    println!(
        "events: {} across {} files",
        stats.event_count, stats.file_count
    );
    println!("store integrity: {}", status(stats.integrity_ok));
    println!("rolling chain hash: {}", hex::encode(stats.rolling_chain_hash));
    println!(
        "vdf: {} iterations/second ({})",
        params.iterations_per_second,
        if params.calibrated {
            "calibrated"
        } else {
            "defaults"
        }
    );
    Ok(())
}

fn cmd_list(data_dir: DataDir) -> Result<()> {
    let engine = Engine::open(data_dir)?;
    let files = engine.list_files()?;
    if files.is_empty() {
        println!("no tracked documents");
        return Ok(());
    }

    for (path, last_ts, count) in files {
        let when = chrono::DateTime::from_timestamp_nanos(last_ts);
        println!(
            "{path}  {count} checkpoints, last {}",
            when.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
