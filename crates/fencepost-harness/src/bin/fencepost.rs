//! CLI entrypoint for the fencepost tooling.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use fencepost_core::{Options, TokenStyle};
use fencepost_harness::env_cmd::{self, EnvRequest, OPTIONS_ENV, Shell};
use fencepost_harness::structured_log::LogEmitter;
use fencepost_harness::{HarnessError, TortureConfig, codes, torture};

/// Tooling for the fencepost debugging heap.
#[derive(Debug, Parser)]
#[command(name = "fencepost")]
#[command(about = "Configure and exercise the fencepost debugging heap")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print shell code setting FENCEPOST_OPTIONS, or dump the current value.
    Env {
        /// Tag or token replacing the debug flags.
        tag: Option<String>,
        /// Output for Bourne shells.
        #[arg(short = 'b', long, conflicts_with = "c_shell")]
        bourne: bool,
        /// Output for C shells.
        #[arg(short = 'C', long)]
        c_shell: bool,
        /// Write flags as long tokens instead of a hex mask.
        #[arg(short = 'L', long, conflicts_with = "short_tokens")]
        long_tokens: bool,
        /// Write flags as short tokens instead of a hex mask.
        #[arg(short = 'S', long)]
        short_tokens: bool,
        /// Watch a user pointer: `0x<hex>[:<count>]`.
        #[arg(short = 'a', long)]
        address: Option<String>,
        /// Clear every setting not given.
        #[arg(short = 'c', long)]
        clear: bool,
        /// Debug mask (hex with 0x, or decimal).
        #[arg(short = 'd', long = "debug-mask", value_parser = parse_mask)]
        debug: Option<u32>,
        /// Validate the heap every N operations (0 unsets).
        #[arg(short = 'i', long)]
        interval: Option<u32>,
        /// Keep other settings when a tag is given.
        #[arg(short = 'k', long)]
        keep: bool,
        /// Log file; `%p` expands to the process id.
        #[arg(short = 'l', long)]
        logfile: Option<String>,
        /// Token to remove from the current flags.
        #[arg(short = 'm', long, action = ArgAction::Append)]
        minus: Vec<String>,
        /// Print what would be set without emitting shell code.
        #[arg(short = 'n', long)]
        no_changes: bool,
        /// Lock fast-path retries (0 unsets).
        #[arg(short = 'o', long)]
        lock_on: Option<u32>,
        /// Token to add to the current flags.
        #[arg(short = 'p', long, action = ArgAction::Append)]
        plus: Vec<String>,
        /// Drop other settings when a tag is given.
        #[arg(short = 'r', long)]
        remove: bool,
        /// Explain the flags when dumping.
        #[arg(short = 'v', long)]
        verbose: bool,
    },
    /// Print the message for an error code.
    Errno {
        /// Code to look up; all codes when omitted.
        code: Option<u32>,
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List debug tokens and tags.
    Tokens {
        /// More detail per token (repeat for short names and masks).
        #[arg(short = 'v', long, action = ArgAction::Count)]
        verbose: u8,
        /// List tags instead of tokens.
        #[arg(short = 't', long)]
        tags: bool,
    },
    /// Run a seeded randomized workload against an in-process heap.
    Torture {
        /// Seed (decimal or 0x...).
        #[arg(long, default_value = "0xF3ACE905", value_parser = parse_u64)]
        seed: u64,
        #[arg(long, default_value_t = 10_000)]
        iterations: u64,
        /// Most allocations live at once.
        #[arg(long, default_value_t = 256)]
        max_live: usize,
        /// Largest request size in bytes.
        #[arg(long, default_value_t = 3 * 4096)]
        max_size: usize,
        /// Option string for the heap flags (e.g. `check-fence,free-blank`).
        #[arg(long, default_value = "check-fence,free-blank,alloc-blank")]
        options: String,
        /// Heap validation interval in operations.
        #[arg(long, default_value_t = 500)]
        check_every: u64,
        /// Address space reserved for the arena, in MiB.
        #[arg(long, default_value_t = 256)]
        arena_mib: usize,
        /// JSONL log of every operation.
        #[arg(long)]
        log: Option<PathBuf>,
    },
}

fn parse_u64(raw: &str) -> Result<u64, String> {
    let raw = raw.replace('_', "");
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    }
    .map_err(|e| format!("invalid number '{raw}': {e}"))
}

fn parse_mask(raw: &str) -> Result<u32, String> {
    let value = parse_u64(raw)?;
    u32::try_from(value).map_err(|_| format!("mask '{raw}' does not fit in 32 bits"))
}

fn run_env(
    req: &EnvRequest,
    shell: Shell,
    style: TokenStyle,
    no_changes: bool,
    verbose: bool,
) -> Result<(), HarnessError> {
    let raw = std::env::var(OPTIONS_ENV).unwrap_or_default();
    let current = Options::parse(&raw)?;
    let change = env_cmd::apply(current, req)?;
    for warning in &change.warnings {
        eprintln!("fencepost: warning: {warning}");
    }
    if !change.changed {
        eprint!("{}", env_cmd::describe(&change.options, verbose));
        return Ok(());
    }
    let value = env_cmd::render(&change.options, style);
    let code = shell.export(OPTIONS_ENV, &value);
    if no_changes || verbose {
        eprintln!("Outputed:");
        eprint!("{code}");
    }
    if !no_changes {
        print!("{code}");
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Env {
            tag,
            bourne,
            c_shell,
            long_tokens,
            short_tokens,
            address,
            clear,
            debug,
            interval,
            keep,
            logfile,
            minus,
            no_changes,
            lock_on,
            plus,
            remove,
            verbose,
        } => {
            let shell = if bourne {
                Shell::Bourne
            } else if c_shell {
                Shell::CShell
            } else {
                Shell::detect(std::env::var("SHELL").ok().as_deref())
            };
            let style = if long_tokens {
                TokenStyle::Long
            } else if short_tokens {
                TokenStyle::Short
            } else {
                TokenStyle::Hex
            };
            let req = EnvRequest {
                tag,
                debug,
                plus,
                minus,
                address,
                interval,
                lock_on,
                log: logfile,
                clear,
                remove_with_tag: remove,
                keep,
            };
            run_env(&req, shell, style, no_changes, verbose)?;
        }
        Command::Errno { code, json } => match (code, json) {
            (Some(code), false) => println!("{}", codes::describe(code)),
            (None, false) => print!("{}", codes::table()),
            (Some(code), true) => {
                let row = codes::rows().into_iter().find(|row| row.code == code);
                let row = row.ok_or(HarnessError::UnknownCode(code))?;
                println!("{}", serde_json::to_string_pretty(&row)?);
            }
            (None, true) => println!("{}", serde_json::to_string_pretty(&codes::rows())?),
        },
        Command::Tokens { verbose, tags } => {
            if tags {
                print!("{}", env_cmd::list_tags());
            } else {
                print!("{}", env_cmd::list_tokens(verbose));
            }
        }
        Command::Torture {
            seed,
            iterations,
            max_live,
            max_size,
            options,
            check_every,
            arena_mib,
            log,
        } => {
            let flags = Options::parse(&options)
                .map_err(HarnessError::from)?
                .flags_or_empty();
            let config = TortureConfig {
                seed,
                iterations,
                max_live,
                max_size,
                flags,
                arena_bytes: arena_mib << 20,
                check_every,
            };
            eprintln!("Running {iterations} ops with seed {seed:#x} and flags {flags}");
            let report = match log {
                Some(path) => {
                    let run_id = format!("torture-{seed:x}");
                    let mut emitter = LogEmitter::to_file(&path, &run_id)?;
                    torture::run(&config, Some(&mut emitter))?
                }
                None => torture::run::<std::io::Sink>(&config, None)?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
