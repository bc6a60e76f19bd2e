use std::path::PathBuf;

use anyhow::{anyhow, Context};
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use otpbreak::round::{from_hex, to_hex};
use otpbreak::{
    BreakValidator, CandidateOtp, ChainIndex, ChainLookup, ChainTableBuilder, CpuAccelerator,
    EngineConfig, MalformedPolicy, ScanOptions, ScanSession, SqliteChainStore, StopPolicy,
    TableReader, TableWriter,
};

/// Searches OTP-MD5 (S/Key) chains for breaks against a precomputed table
///
/// A break is a round at which a candidate OTP's chain reaches the endpoint of a table chain. If
/// the table chain passes through the OTP itself, its previous value is the next password of the
/// OTP's sequence.
#[derive(Debug, StructOpt)]
enum Cli {
    /// Compute a table block file of chains over a linear seed range
    Build {
        /// First seed
        #[structopt(long, default_value = "0")]
        start: u64,
        /// Number of chains
        #[structopt(long, default_value = "65536")]
        count: u64,
        /// Rounds in each chain
        #[structopt(long, default_value = "65536")]
        rounds: u64,
        /// Chains computed and committed per batch
        #[structopt(long, default_value = "65536")]
        batch: u64,
        /// Rounds per accelerator dispatch, 0 for one dispatch per batch
        #[structopt(long, default_value = "0")]
        perexec: u32,
        /// Accelerator threads, 0 for one per CPU
        #[structopt(long, default_value = "0")]
        threads: usize,
        /// Continue an interrupted build of the same range
        #[structopt(long)]
        resume: bool,
        /// Block file to write
        #[structopt(parse(from_os_str))]
        output: PathBuf,
    },
    /// Load a table block file into a SQLite database
    ImportSql {
        #[structopt(parse(from_os_str))]
        table: PathBuf,
        #[structopt(parse(from_os_str))]
        db: PathBuf,
        /// Skip malformed records instead of aborting
        #[structopt(long)]
        skip_malformed: bool,
    },
    /// Scan candidate OTPs against a table
    Scan {
        /// Table block file, loaded into memory
        #[structopt(long, parse(from_os_str), required_unless = "db")]
        table: Option<PathBuf>,
        /// SQLite table database, queried in place
        #[structopt(long, parse(from_os_str), conflicts_with = "table")]
        db: Option<PathBuf>,
        /// Rounds the table chains were built with
        #[structopt(long, default_value = "65536")]
        table_rounds: u64,
        /// Highest candidate round probed
        #[structopt(long, default_value = "268435456")]
        rounds: u64,
        /// Rounds per snapshot
        #[structopt(long, default_value = "1024")]
        batch: u32,
        /// Random test OTPs to generate when no --otp is given
        #[structopt(long, default_value = "64")]
        num: usize,
        /// Candidate OTP in RFC 2289 hex; may be repeated
        #[structopt(long = "otp")]
        otps: Vec<String>,
        /// Index bucket bits
        #[structopt(long, default_value = "22")]
        bits: u32,
        #[structopt(long, default_value = "0")]
        threads: usize,
        /// Candidate groups scanned on separate threads
        #[structopt(long, default_value = "1")]
        groups: usize,
        /// Stop scanning a candidate at its first confirmed break
        #[structopt(long)]
        stop_on_first: bool,
        /// Probe each snapshot while the next one is computed
        #[structopt(long)]
        pipelined: bool,
        #[structopt(long)]
        skip_malformed: bool,
        /// Directory for the break files
        #[structopt(long, parse(from_os_str), default_value = ".")]
        out: PathBuf,
    },
    /// Print the OTP for a seed, passphrase and sequence number
    Otp {
        seed: String,
        passphrase: String,
        sequence: u64,
    },
}

fn malformed(skip: bool) -> MalformedPolicy {
    if skip {
        MalformedPolicy::Skip
    } else {
        MalformedPolicy::Abort
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::from_args() {
        Cli::Build {
            start,
            count,
            rounds,
            batch,
            perexec,
            threads,
            resume,
            output,
        } => {
            let config = EngineConfig {
                table_start: start,
                table_count: count,
                table_rounds: rounds,
                table_batch: batch,
                rounds_per_dispatch: perexec,
                threads,
                ..EngineConfig::default()
            };
            config.validate()?;
            build(&config, resume, &output)
        }
        Cli::ImportSql {
            table,
            db,
            skip_malformed,
        } => {
            let store = SqliteChainStore::open(&db)
                .with_context(|| anyhow!("Could not open database: '{}'", db.display()))?;
            let records = TableReader::open(&table)
                .with_context(|| anyhow!("Could not open table: '{}'", table.display()))?;
            let imported = store.import(records, malformed(skip_malformed))?;
            println!("{}", imported);
            Ok(())
        }
        Cli::Scan {
            table,
            db,
            table_rounds,
            rounds,
            batch,
            num,
            otps,
            bits,
            threads,
            groups,
            stop_on_first,
            pipelined,
            skip_malformed,
            out,
        } => {
            let config = EngineConfig {
                table_rounds,
                scan_horizon: rounds,
                scan_batch: batch,
                candidate_count: if otps.is_empty() { num } else { otps.len() },
                bucket_bits: bits,
                threads,
                stop_policy: if stop_on_first {
                    StopPolicy::StopOnFirstConfirmed
                } else {
                    StopPolicy::CollectAll
                },
                pipelined,
                malformed: malformed(skip_malformed),
                ..EngineConfig::default()
            };
            config.validate()?;

            let mut candidates = candidates(&config, &otps)?;
            let index: Box<dyn ChainLookup> = match (table, db) {
                (Some(table), _) => {
                    let mut index = ChainIndex::new(config.bucket_bits)?;
                    let records = TableReader::open(&table)
                        .with_context(|| anyhow!("Could not open table: '{}'", table.display()))?;
                    index.bulk_load(records, config.malformed)?;
                    Box::new(index)
                }
                (None, Some(db)) => Box::new(
                    SqliteChainStore::open(&db)
                        .with_context(|| anyhow!("Could not open database: '{}'", db.display()))?,
                ),
                (None, None) => return Err(anyhow!("one of --table or --db is required")),
            };

            scan(&config, index.as_ref(), &mut candidates, groups, &out)
        }
        Cli::Otp {
            seed,
            passphrase,
            sequence,
        } => {
            println!("{}", to_hex(otpbreak::create(&seed, &passphrase, sequence)));
            Ok(())
        }
    }
}

fn build(config: &EngineConfig, resume: bool, output: &PathBuf) -> anyhow::Result<()> {
    let accel = CpuAccelerator::new(config.threads)?;
    let builder = ChainTableBuilder::new(
        &accel,
        config.table_rounds,
        config.table_batch,
        config.rounds_per_dispatch,
    )?;

    let written = if resume {
        builder.resume(output, config.table_start, config.table_count)?
    } else {
        let mut writer = TableWriter::create(output)
            .with_context(|| anyhow!("Could not open file for writing: '{}'", output.display()))?;
        builder.build_into(&mut writer, config.table_start, config.table_count)?
    };
    info!(written, path = %output.display(), "table written");
    Ok(())
}

fn candidates(config: &EngineConfig, otps: &[String]) -> anyhow::Result<Vec<CandidateOtp>> {
    if otps.is_empty() {
        let mut rng = rand::thread_rng();
        return Ok((0..config.candidate_count)
            .map(|_| CandidateOtp::random(&mut rng))
            .collect());
    }
    otps.iter()
        .map(|text| {
            from_hex(text)
                .map(CandidateOtp::new)
                .ok_or_else(|| anyhow!("Expected an OTP as 16 hex digits, but found: '{}'", text))
        })
        .collect()
}

fn scan(
    config: &EngineConfig,
    index: &dyn ChainLookup,
    candidates: &mut [CandidateOtp],
    groups: usize,
    out: &PathBuf,
) -> anyhow::Result<()> {
    let accel = CpuAccelerator::new(config.threads)?;
    let session = ScanSession::new(
        &accel,
        index,
        BreakValidator::new(config.table_rounds),
        ScanOptions::from(config),
    );
    let result = session.run_groups(candidates, groups);

    // Breaks found before a failure are still worth keeping.
    for candidate in candidates.iter() {
        let path = candidate
            .save(out)
            .with_context(|| anyhow!("Could not write break file for {}", candidate))?;
        if !candidate.confirmed.is_empty() {
            println!("{}\t{}", candidate, path.display());
        }
    }

    let report = result?;
    info!(
        breaks = report.breaks,
        confirmed = report.confirmed,
        faulted = report.faulted,
        "scan complete"
    );
    Ok(())
}
