use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bottler::archive::{ArchiveOptions, ArchiveWriter, PackRoot};
use bottler::batch;
use bottler::codec::CompressionAlgorithm;
use bottler::crypto::{Argon2Kdf, LocalKeyring, DEFAULT_KDF_ITERATIONS};
use bottler::digest::HashAlgorithm;
use bottler::fs::{LocalFs, Overwrite};
use bottler::layers::{Decryption, Encryption, EncryptionInfo};
use bottler::scan::{display_path, scan, ErrorPolicy, Lister, ScanEvent, ScanHandler, UnpackOptions, Unpacker};
use bottler::BottleError;
use chrono::{TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bottler", about = "Pack and unpack nested bottle archives")]
struct Cli {
    /// Default log level; RUST_LOG overrides it.
    #[arg(long, global = true, default_value = "warn")]
    log_level: LevelFilter,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct KeyArgs {
    /// Password for password-encrypted archives
    #[arg(short, long)]
    password: Option<String>,
    /// Keyring JSON file: {"identity": NAME, "secrets": {NAME: HEX}}
    #[arg(long)]
    keyring: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack files and folders into one archive
    Pack {
        #[arg(short, long)]
        output: PathBuf,
        /// JSON file with ArchiveOptions; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,
        /// Compression: zstd, lz4, brotli, none
        #[arg(short, long)]
        compress: Option<String>,
        /// Compression level (zstd scale; brotli 0-11; ignored for lz4)
        #[arg(short, long)]
        level: Option<i32>,
        /// Hash: sha512, sha256, blake3, none
        #[arg(long)]
        hash: Option<String>,
        /// Encrypt for these recipients (needs --keyring)
        #[arg(short, long)]
        recipient: Vec<String>,
        /// Argon2 time cost for --password
        #[arg(long, default_value_t = DEFAULT_KDF_ITERATIONS)]
        iterations: u32,
        #[command(flatten)]
        keys: KeyArgs,
        #[arg(required = true, num_args = 1..)]
        inputs: Vec<PathBuf>,
    },
    /// Unpack archives
    Unpack {
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        /// Replace files that already exist
        #[arg(short, long)]
        force: bool,
        /// Skip files that fail instead of stopping
        #[arg(short, long)]
        keep_going: bool,
        /// Archives to process at once
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,
        #[command(flatten)]
        keys: KeyArgs,
        #[arg(required = true, num_args = 1..)]
        archives: Vec<PathBuf>,
    },
    /// List archive contents
    List {
        #[arg(long)]
        json: bool,
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,
        #[command(flatten)]
        keys: KeyArgs,
        #[arg(required = true, num_args = 1..)]
        archives: Vec<PathBuf>,
    },
    /// Show an archive's layers and integrity
    Info {
        #[command(flatten)]
        keys: KeyArgs,
        archive: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    match cli.command {
        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { output, config, compress, level, hash, recipient, iterations, keys, inputs } => {
            let mut opts = match config {
                Some(path) => ArchiveOptions::from_json(&std::fs::read_to_string(path)?)?,
                None       => ArchiveOptions::default(),
            };
            if let Some(name) = compress {
                opts.compression = parse_or_none(&name, CompressionAlgorithm::from_name, "compression")?;
            }
            if let Some(name) = hash {
                opts.hash = parse_or_none(&name, HashAlgorithm::from_name, "hash")?;
            }
            if let Some(level) = level {
                opts.level = level;
            }
            opts.encryption = match (keys.password, recipient.is_empty()) {
                (Some(_), false) => return Err("use either --password or --recipient, not both".into()),
                (Some(password), true) => Some(Encryption::Password {
                    password,
                    kdf: Arc::new(Argon2Kdf::default()),
                    iterations,
                }),
                (None, false) => Some(Encryption::Recipients {
                    service:    Arc::new(load_keyring(keys.keyring.as_deref())?),
                    recipients: recipient,
                }),
                (None, true) => None,
            };

            let name = output
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "archive".into());
            let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0);
            let root = PackRoot::from_inputs(&inputs, &name, now_ns);

            let summary = ArchiveWriter::new(&LocalFs, opts)
                .on_progress(|file, n| tracing::trace!(file, bytes = n, "progress"))
                .pack_to_path(&root, &output)?;
            println!(
                "Created: {} ({} files, {} folders, {} bytes)",
                output.display(),
                summary.files,
                summary.folders,
                summary.bytes
            );
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { output_dir, force, keep_going, jobs, keys, archives } => {
            let decryption = decryption(&keys)?;
            let options = UnpackOptions {
                overwrite:    if force { Overwrite::Replace } else { Overwrite::Refuse },
                error_policy: if keep_going { ErrorPolicy::Continue } else { ErrorPolicy::Abort },
            };
            let results = batch::run(&archives, jobs, |archive| {
                let mut unpacker = Unpacker::new(&LocalFs, &output_dir, options, decryption.clone());
                let report = scan(open(archive)?, &mut unpacker)?;
                report.verify()?;
                Ok((report, unpacker.failed))
            });

            let mut failed = 0;
            for (archive, result) in archives.iter().zip(results) {
                match result {
                    Ok((report, skipped)) => {
                        println!("Unpacked {} ({} files) to {}", archive.display(), report.files, output_dir.display());
                        for (path, error) in skipped {
                            eprintln!("  skipped {path}: {error}");
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}: {e}", archive.display());
                    }
                }
            }
            if failed > 0 {
                return Err(format!("{failed} archive(s) failed").into());
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { json, jobs, keys, archives } => {
            let decryption = decryption(&keys)?;
            let results = batch::run(&archives, jobs, |archive| {
                let mut lister = Lister::new(decryption.clone());
                let report = scan(open(archive)?, &mut lister)?;
                Ok((report, lister.entries))
            });

            let mut failed = 0;
            for (archive, result) in archives.iter().zip(results) {
                let (report, entries) = match result {
                    Ok(listed) => listed,
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}: {e}", archive.display());
                        continue;
                    }
                };
                if json {
                    let doc = serde_json::json!({
                        "archive": archive,
                        "entries": entries,
                        "report":  report,
                    });
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                    continue;
                }
                println!("Archive: {}", archive.display());
                println!("{:<10} {:>12}  {:<19}  Path", "Mode", "Size", "Modified");
                for entry in &entries {
                    let meta = &entry.metadata;
                    let size = if meta.is_folder { "-".to_string() } else { meta.size.to_string() };
                    println!("{:<10} {:>12}  {:<19}  {}", mode_string(meta.mode, meta.is_folder), size,
                             format_time(meta.modified_ns), entry.path);
                }
                for outcome in &report.hashes {
                    let verdict = if outcome.valid { "ok" } else { "MISMATCH" };
                    println!("  {} {}  {}", outcome.algorithm.name(), verdict, outcome.digest_hex);
                }
            }
            if failed > 0 {
                return Err(format!("{failed} archive(s) failed").into());
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { keys, archive } => {
            let mut info = InfoHandler { decryption: decryption(&keys)?, lines: Vec::new(), depth: 0 };
            let result = scan(open(&archive)?, &mut info);

            println!("── Bottle archive ──────────────────────────────────────");
            println!("  Path           {}", archive.display());
            for line in &info.lines {
                println!("  {line}");
            }
            match result {
                Ok(report) => {
                    println!("  Files          {}", report.files);
                    println!("  Folders        {}", report.folders);
                    println!("  Content bytes  {}", report.bytes);
                    if report.unknown_skipped > 0 {
                        println!("  Unknown        {} bottle(s) skipped", report.unknown_skipped);
                    }
                    report.verify()?;
                }
                Err(BottleError::MissingDecryptionKey) => {
                    println!("  (contents encrypted; pass --password or --keyring to look inside)");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}

// ── Info handler ─────────────────────────────────────────────────────────────

/// Records the layer structure as it is crossed.
struct InfoHandler {
    decryption: Decryption,
    lines:      Vec<String>,
    depth:      usize,
}

impl ScanHandler for InfoHandler {
    fn on_event(&mut self, event: &ScanEvent<'_>) -> bottler::Result<()> {
        let indent = "  ".repeat(self.depth);
        let line = match event {
            ScanEvent::HashStart { algorithm } => {
                self.depth += 1;
                format!("{indent}hashed         {}", algorithm.name())
            }
            ScanEvent::HashEnd { outcome } => {
                self.depth = self.depth.saturating_sub(1);
                let verdict = if outcome.valid { "valid" } else { "INVALID" };
                format!("{}digest         {verdict} {}", "  ".repeat(self.depth), outcome.digest_hex)
            }
            ScanEvent::CompressionStart { algorithm } => {
                self.depth += 1;
                format!("{indent}compressed     {}", algorithm.name())
            }
            ScanEvent::EncryptionStart { info } => {
                self.depth += 1;
                format!("{indent}encrypted      {}{}", info.cipher.name(), describe_keys(info))
            }
            ScanEvent::CompressionEnd | ScanEvent::EncryptionEnd => {
                self.depth = self.depth.saturating_sub(1);
                return Ok(());
            }
            ScanEvent::FolderStart { path, .. } if path.len() == 1 => {
                format!("{indent}root folder    {}", display_path(path))
            }
            ScanEvent::File { path, metadata } if path.len() == 1 => {
                format!("{indent}root file      {} ({} bytes)", display_path(path), metadata.size)
            }
            ScanEvent::UnknownBottle { kind } => format!("{indent}unknown kind   {kind}"),
            _ => return Ok(()),
        };
        self.lines.push(line);
        Ok(())
    }

    fn decrypt_key(&mut self, info: &EncryptionInfo) -> bottler::Result<Vec<u8>> {
        self.decryption.resolve(info)
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_logging(level: LevelFilter) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let fmt = tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr);
    tracing_subscriber::registry().with(filter).with(fmt).init();
}

fn open(path: &Path) -> bottler::Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

fn parse_or_none<T>(name: &str, parse: fn(&str) -> Option<T>, what: &str) -> Result<Option<T>, Box<dyn Error>> {
    if name.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    parse(name).map(Some).ok_or_else(|| format!("unknown {what} algorithm '{name}'").into())
}

fn load_keyring(path: Option<&Path>) -> Result<LocalKeyring, Box<dyn Error>> {
    let path = path.ok_or("--keyring is required for recipient encryption")?;
    Ok(LocalKeyring::from_json(&std::fs::read_to_string(path)?)?)
}

fn decryption(keys: &KeyArgs) -> Result<Decryption, Box<dyn Error>> {
    Ok(match (&keys.password, &keys.keyring) {
        (Some(password), _) => Decryption::Password {
            password: password.clone(),
            kdf:      Arc::new(Argon2Kdf::default()),
        },
        (None, Some(path)) => Decryption::KeyService(Arc::new(load_keyring(Some(path))?)),
        (None, None) => Decryption::None,
    })
}

fn describe_keys(info: &EncryptionInfo) -> String {
    let mut out = String::new();
    if !info.keymap.is_empty() {
        out.push_str(&format!(", recipients: {}", info.recipients().collect::<Vec<_>>().join(", ")));
    }
    if let Some(kdf) = &info.kdf {
        out.push_str(&format!(", password (argon2id, {} iterations)", kdf.iterations));
    }
    out
}

fn mode_string(mode: u32, is_folder: bool) -> String {
    let mut out = String::with_capacity(10);
    out.push(if is_folder { 'd' } else { '-' });
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        out.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    out
}

fn format_time(ns: i64) -> String {
    let secs = ns.div_euclid(1_000_000_000);
    let nanos = ns.rem_euclid(1_000_000_000) as u32;
    match Utc.timestamp_opt(secs, nanos).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None    => "-".into(),
    }
}
