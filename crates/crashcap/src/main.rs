use std::path::PathBuf;
use std::process;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use crashcap_core::config::HandlerConfig;
use crashcap_core::error::CaptureResult;
use crashcap_core::{handler, DumpTarget, Writer};
use crashcap_utils::{info, init_logging, init_logging_with_level, LogFormat, LogGuard, LogLevel, LoggingError};

/// Generate minidumps of deliberate faults and on-demand snapshots.
#[derive(Parser, Debug)]
#[command(name = "crashcap")]
#[command(version)]
#[command(about = "Generate minidumps for testing crash scenarios", long_about = None)]
struct Cli
{
    /// Directory for fault dumps and on-demand dumps
    #[arg(short, long, default_value = "./dumps", global = true)]
    output: PathBuf,

    /// File name prefix for fault dumps
    #[arg(short, long, default_value = HandlerConfig::DEFAULT_PREFIX, global = true)]
    prefix: String,

    /// Write fault dumps to exactly this path instead of generated names
    #[arg(long, global = true)]
    dump_file: Option<PathBuf>,

    /// Leave the Unix timestamp out of generated dump names
    #[arg(long, default_value_t = false, global = true)]
    no_timestamp: bool,

    /// Install the fault handlers before running the command
    #[arg(short = 'H', long, default_value_t = false, global = true)]
    install_handler: bool,

    /// Log at debug level
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Log output format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Write a minidump of this process without crashing
    Dump
    {
        /// File name without the .dmp extension
        #[arg(short, long, default_value = "manual_dump")]
        name: String,
    },
    /// Install the handlers and trigger a fault (debug builds only)
    Crash
    {
        /// Fault to trigger
        kind: FaultType,
        /// Uninstall the handlers again before faulting, so no dump is written
        #[arg(long, default_value_t = false)]
        uninstall: bool,
        /// Fault on a freshly spawned worker thread instead of the main thread
        #[arg(long, default_value_t = false)]
        thread: bool,
    },
    /// List the fault types `crash` can trigger
    List,
    /// Install the handlers and wait for a fault or Ctrl+C
    Interactive
    {
        /// Seconds to wait before exiting (0 waits until Ctrl+C)
        #[arg(short, long, default_value_t = 0)]
        timeout: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum FaultType
{
    Segfault,
    Abort,
    BusError,
    DivideByZero,
    IllegalInstruction,
    StackOverflow,
    Breakpoint,
}

impl FaultType
{
    const ALL: [FaultType; 7] = [
        FaultType::Segfault,
        FaultType::Abort,
        FaultType::BusError,
        FaultType::DivideByZero,
        FaultType::IllegalInstruction,
        FaultType::StackOverflow,
        FaultType::Breakpoint,
    ];

    fn description(self) -> &'static str
    {
        match self {
            FaultType::Segfault => "Invalid memory write causing SIGSEGV",
            FaultType::Abort => "Process abort causing SIGABRT",
            FaultType::BusError => "Access past the end of a truncated file mapping causing SIGBUS",
            FaultType::DivideByZero => "Integer division by zero causing SIGFPE",
            FaultType::IllegalInstruction => "Invalid CPU instruction causing SIGILL",
            FaultType::StackOverflow => "Unbounded recursion exhausting the stack",
            FaultType::Breakpoint => "Software breakpoint causing SIGTRAP",
        }
    }

    fn name(self) -> String
    {
        self.to_possible_value()
            .map_or_else(|| format!("{self:?}"), |value| value.get_name().to_string())
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main()
{
    let cli = Cli::parse();

    // Held until exit so buffered file output is flushed
    let _log_guard = match setup_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn setup_logging(cli: &Cli) -> Result<LogGuard, LoggingError>
{
    if !cli.verbose && cli.log_format.is_none() {
        return init_logging();
    }
    let level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };
    init_logging_with_level(level, cli.log_format.unwrap_or_default())
}

fn run_command(cli: Cli) -> CliResult
{
    if cli.install_handler {
        install_handlers(&cli)?;
    }

    match cli.command {
        Commands::Dump { ref name } => {
            let path = cli.output.join(format!("{name}.dmp"));
            info!(path = %path.display(), "Writing on-demand dump");
            let mut writer = Writer::create()?;
            let report = writer.write_dump(&path)?;
            writer.free();

            println!("Minidump written to: {}", report.path.display());
            println!("  Bytes:   {}", report.bytes_written);
            println!("  Threads: {}", report.threads);
            println!("  Modules: {}", report.modules);
            if report.is_partial() {
                println!("  Partial: {:?}", report.incomplete);
            }
            Ok(())
        }
        Commands::Crash { kind, uninstall, thread } => {
            if !cli.install_handler {
                install_handlers(&cli)?;
            }
            if uninstall {
                handler::uninstall();
                println!("Handlers uninstalled, no dump will be written");
            }
            println!("Triggering fault: {}", kind.description());
            if thread {
                trigger_on_worker(kind)
            } else {
                trigger(kind)
            }
        }
        Commands::List => {
            println!("Available fault types:");
            for kind in FaultType::ALL {
                println!("  {:<20} {}", kind.name(), kind.description());
            }
            println!("\nExample usage:");
            println!("  crashcap crash segfault");
            println!("  crashcap crash abort --thread");
            println!("  crashcap --dump-file /tmp/a.dmp crash divide-by-zero");
            println!("  crashcap dump --name my_dump");
            Ok(())
        }
        Commands::Interactive { timeout } => {
            if !cli.install_handler {
                install_handlers(&cli)?;
            }
            println!("Fault handlers are active; faults in this process are captured");
            match &cli.dump_file {
                Some(path) => println!("Dump file: {}", path.display()),
                None => println!("Output directory: {}", cli.output.display()),
            }
            wait_for_exit(timeout)?;
            handler::uninstall();
            Ok(())
        }
    }
}

fn install_handlers(cli: &Cli) -> CaptureResult<()>
{
    let config = match &cli.dump_file {
        Some(path) => HandlerConfig::file(path),
        None => HandlerConfig::new(DumpTarget::directory(&cli.output))
            .with_prefix(cli.prefix.clone())
            .with_timestamp(!cli.no_timestamp),
    };
    handler::install(config.with_pre_dump(announce_crash))?;
    println!("Fault handlers installed");
    Ok(())
}

/// Runs inside the fault handler, so only a raw `write(2)`
fn announce_crash()
{
    const MESSAGE: &[u8] = b"Crash detected! Writing minidump...\n";
    // SAFETY: write(2) is async-signal-safe and MESSAGE is a static buffer
    unsafe {
        libc::write(libc::STDERR_FILENO, MESSAGE.as_ptr().cast(), MESSAGE.len());
    }
}

fn wait_for_exit(timeout: u64) -> CliResult
{
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    if timeout > 0 {
        println!("Waiting {timeout} seconds (Ctrl+C exits early)...");
        if rx.recv_timeout(Duration::from_secs(timeout)).is_err() {
            println!("Timeout reached, exiting...");
        }
    } else {
        println!("Press Ctrl+C to exit...");
        let _ = rx.recv();
    }
    Ok(())
}

/// Fault on a new thread set up the way a host sets up its workers
fn trigger_on_worker(kind: FaultType) -> CliResult
{
    let worker = thread::Builder::new()
        .name("crash-worker".to_string())
        .spawn(move || {
            handler::register_current_thread().map_err(|e| e.to_string())?;
            trigger(kind).map_err(|e| e.to_string())
        })?;
    worker.join().map_err(|_| "crash worker panicked")??;
    Ok(())
}

#[cfg(debug_assertions)]
fn trigger(kind: FaultType) -> CliResult
{
    use crashcap_core::triggers;

    match kind {
        FaultType::Segfault => triggers::trigger_segfault(),
        FaultType::Abort => triggers::trigger_abort(),
        FaultType::BusError => triggers::trigger_bus_error(),
        FaultType::DivideByZero => triggers::trigger_divide_by_zero(),
        FaultType::IllegalInstruction => triggers::trigger_illegal_instruction(),
        FaultType::StackOverflow => triggers::trigger_stack_overflow(),
        FaultType::Breakpoint => triggers::trigger_breakpoint(),
    }
    Err(format!("{} did not terminate the process", kind.name()).into())
}

#[cfg(not(debug_assertions))]
fn trigger(kind: FaultType) -> CliResult
{
    Err(format!("cannot trigger {}: fault triggers are only built in debug builds", kind.name()).into())
}
