use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use ewsafe_wipe::crypto::certificates::render_certificate;
use ewsafe_wipe::crypto::AttestationPipeline;
use ewsafe_wipe::engine::{ProgressSink, WipeEngine, WipeLog};
use ewsafe_wipe::ui::ProgressBar;
use ewsafe_wipe::{patterns, platform, CancelToken, Device};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Parser)]
#[command(name = "ewsafe")]
#[command(about = "Secure block-device erasure with signed wipe certificates")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List detected block devices
    List {
        /// Show geometry and transport details
        #[arg(short, long)]
        detailed: bool,
    },

    /// Wipe a device and issue a signed certificate
    Wipe {
        /// Device path (e.g. /dev/sdb)
        #[arg(short, long)]
        device: String,

        /// Erase method id (see `ewsafe methods`)
        #[arg(short, long, default_value = "nist_purge")]
        method: String,

        /// Skip the interactive confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Verify a previously issued certificate
    Verify {
        /// Path to the certificate JSON
        certificate: PathBuf,
    },

    /// List the erase method catalog
    Methods,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.debug);
    if let Err(e) = setup_signal_handlers() {
        eprintln!("{} {e:#}", "warning:".yellow());
    }

    let outcome = match cli.command {
        Commands::List { detailed } => cmd_list(detailed),
        Commands::Wipe {
            device,
            method,
            yes,
        } => cmd_wipe(&device, &method, yes).await,
        Commands::Verify { certificate } => cmd_verify(&certificate),
        Commands::Methods => cmd_methods(),
    };

    match outcome {
        Ok(()) => {}
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            std::process::exit(1);
        }
    }
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ewsafe_wipe={default_level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn setup_signal_handlers() -> Result<()> {
    use signal_hook::{consts::SIGINT, iterator::Signals};

    let mut signals = Signals::new([SIGINT])?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            if sig == SIGINT {
                eprintln!("\n{}", "Interrupt received, stopping after the current buffer...".yellow());
                ewsafe_wipe::set_interrupted();
            }
        }
    });

    Ok(())
}

fn cmd_list(detailed: bool) -> Result<()> {
    let engine = WipeEngine::new(platform::native());
    let devices = engine.list_devices().context("device enumeration failed")?;

    if devices.is_empty() {
        println!("No candidate block devices found.");
        return Ok(());
    }

    println!("{}", "Detected devices:".bold());
    for device in &devices {
        println!(
            "  {}  {}  {}  [{}]",
            device.path.cyan(),
            device.model,
            device.size_human(),
            device.medium_class.as_str()
        );
        if detailed {
            println!(
                "      serial: {}  interface: {}  sector: {} B  fingerprint: {}",
                device.serial, device.interface, device.sector_bytes, device.fingerprint()
            );
        }
    }

    Ok(())
}

fn cmd_methods() -> Result<()> {
    println!("{}", "Available erase methods:".bold());
    for method in patterns::catalog() {
        println!(
            "  {:14} {:3} passes  {}",
            method.id.cyan(),
            method.total_passes(),
            method.name
        );
        println!("                 standards: {}", method.compliance.join(", "));
    }
    Ok(())
}

async fn cmd_wipe(device_path: &str, method_id: &str, yes: bool) -> Result<()> {
    if patterns::method(method_id).is_none() {
        bail!("unknown method '{method_id}'; run `ewsafe methods`");
    }

    let adapter = platform::native();
    let engine = Arc::new(WipeEngine::new(adapter));

    let device = find_device(&engine, device_path)?;

    println!("{}", "Target device:".bold());
    println!(
        "  {}  {}  {}  [{}]  serial {}",
        device.path.cyan(),
        device.model,
        device.size_human(),
        device.medium_class.as_str(),
        device.serial
    );
    println!(
        "  method: {} ({} passes)",
        method_id,
        patterns::method(method_id).map(|m| m.total_passes()).unwrap_or(0)
    );

    if !yes {
        println!(
            "\n{}",
            "ALL DATA ON THIS DEVICE WILL BE IRREVERSIBLY DESTROYED."
                .red()
                .bold()
        );
        print!("Type 'ERASE' to confirm: ");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if input.trim() != "ERASE" {
            bail!("confirmation not given; nothing was written");
        }
    }

    let cancel = CancelToken::new();
    let bar = Arc::new(Mutex::new(ProgressBar::new(48)));
    let total_bytes = device.logical_bytes;
    let bar_sink = bar.clone();
    let progress: ProgressSink = Box::new(move |percent, _message| {
        let done = (percent / 100.0 * total_bytes as f64) as u64;
        bar_sink
            .lock()
            .unwrap()
            .render(percent, Some(done), Some(total_bytes));
    });

    // The wipe runs in its own worker; the async caller just awaits it
    let worker_engine = engine.clone();
    let worker_device = device.clone();
    let worker_method = method_id.to_string();
    let worker_cancel = cancel.clone();
    let log: WipeLog = tokio::task::spawn_blocking(move || {
        worker_engine.wipe(&worker_device, &worker_method, &worker_cancel, &progress)
    })
    .await
    .context("wipe worker panicked")?;

    bar.lock().unwrap().finish();
    print_wipe_summary(&log);

    if !log.success {
        bail!("wipe did not complete successfully; no certificate issued");
    }

    let pipeline = AttestationPipeline::open_default()?;
    let certificate = pipeline.issue(&log)?;
    println!("\n{}", render_certificate(&certificate));
    println!(
        "Certificate written to {}",
        pipeline
            .certificate_path(&certificate.certificate_id)
            .display()
    );

    Ok(())
}

fn cmd_verify(path: &PathBuf) -> Result<()> {
    let pipeline = AttestationPipeline::open_default()?;
    let valid = pipeline
        .verify_file(path)
        .with_context(|| format!("cannot verify {}", path.display()))?;

    if valid {
        println!("{} certificate is authentic and unmodified", "VALID:".green().bold());
        Ok(())
    } else {
        bail!("certificate failed verification: content or signature mismatch");
    }
}

fn find_device(engine: &WipeEngine, device_path: &str) -> Result<Device> {
    let devices = engine.list_devices().context("device enumeration failed")?;
    devices
        .into_iter()
        .find(|d| d.path == device_path)
        .with_context(|| format!("device {device_path} not found in enumeration"))
}

fn print_wipe_summary(log: &WipeLog) {
    println!("\n{}", "Wipe summary:".bold());
    println!("  state          : {:?}", log.terminal_state);
    println!(
        "  passes         : {}/{}",
        log.passes_completed, log.total_passes
    );
    println!(
        "  hardware erase : {}",
        if log.hardware_erase_used { "yes" } else { "no" }
    );
    println!(
        "  verification   : {}",
        if log.verification_passed {
            "passed".green().to_string()
        } else {
            "flagged".yellow().to_string()
        }
    );
    if let Some(note) = &log.verification_note {
        println!("  note           : {note}");
    }
    if log.bad_sectors.count > 0 {
        println!(
            "  bad sectors    : {} (offsets {:?}..{:?})",
            log.bad_sectors.count, log.bad_sectors.min_offset, log.bad_sectors.max_offset
        );
    }
    println!(
        "  duration       : {}",
        humantime::format_duration(std::time::Duration::from_secs(log.duration_seconds))
    );
    for error in &log.errors {
        println!("  {} {error}", "!".yellow());
    }
    println!(
        "  result         : {}",
        if log.success {
            "SUCCESS".green().bold().to_string()
        } else {
            "FAILED".red().bold().to_string()
        }
    );
}
