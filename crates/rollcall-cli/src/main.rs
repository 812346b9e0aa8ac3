use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::config::Config;
use rollcall_core::detector::OnnxFaceDetector;
use rollcall_core::recognizer::train_from_dir;
use rollcall_core::{
    annotate, engine, AttendanceRecord, AttendanceStore, Detector, EngineHandle, FrameFeed,
    SessionEvent, SystemClock,
};
use rollcall_hw::{Camera, WebcamBackend};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    /// Log debug output (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session in the foreground; Enter, q, or Ctrl-C stops it
    Run {
        /// Write the last annotated frame to this PNG on exit
        #[arg(long)]
        preview: Option<PathBuf>,
    },
    /// Capture face images of one person into the dataset
    Enroll {
        /// Person's name (also the dataset sub-directory)
        name: String,
        /// Number of face images to capture
        #[arg(short, long, default_value_t = 50)]
        samples: usize,
    },
    /// Train the recognizer and label map from the dataset
    Train,
    /// Show today's attendance
    Today,
    /// Show recorded attendance, optionally for one day
    History {
        /// Day to show (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Copy the attendance ledger to another CSV file
    Export {
        dest: PathBuf,
    },
    /// List V4L2 capture devices
    Devices,
    /// Ask rollcalld to start a session
    Start,
    /// Ask rollcalld to stop its session
    Stop,
    /// Show rollcalld status
    Status,
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn start(&self) -> zbus::Result<()>;
    async fn stop(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = Config::from_env();
    let store = AttendanceStore::new(&config.ledger_path);

    match cli.command {
        Commands::Run { preview } => run_foreground(config, store, preview).await?,
        Commands::Enroll { name, samples } => {
            tokio::task::spawn_blocking(move || enroll(&config, &name, samples)).await??
        }
        Commands::Train => tokio::task::spawn_blocking(move || train(&config)).await??,
        Commands::Today => {
            let today = chrono::Local::now().date_naive();
            print_records(&store.records_on(today)?);
        }
        Commands::History { date } => {
            let records = match date {
                Some(date) => store.records_on(date)?,
                None => store.read_all()?,
            };
            print_records(&records);
        }
        Commands::Export { dest } => {
            let rows = store.export(&dest)?;
            println!("exported {rows} records to {}", dest.display());
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("no capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Start => {
            daemon().await?.start().await?;
            println!("session started");
        }
        Commands::Stop => {
            daemon().await?.stop().await?;
            println!("session stopping");
        }
        Commands::Status => {
            let status = daemon().await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }

    Ok(())
}

async fn daemon() -> Result<AttendanceProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("cannot reach the session bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not running")
}

/// Drive one session on the local webcam, printing the session log.
async fn run_foreground(
    config: Config,
    store: AttendanceStore,
    preview: Option<PathBuf>,
) -> Result<()> {
    let (engine, mut events) = engine::spawn(WebcamBackend::new(config), SystemClock, store)?;
    let frames = engine.subscribe_frames();
    engine.start()?;
    println!("press Enter or q to stop");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut stop_sent = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{event}");
                if matches!(event, SessionEvent::Stopped(_)) {
                    break;
                }
            }
            line = stdin.next_line(), if stdin_open && !stop_sent => match line {
                Ok(Some(line)) if is_quit(&line) => stop_sent = request_stop(&engine).await,
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c(), if !stop_sent => {
                stop_sent = request_stop(&engine).await;
            }
        }
    }

    if let Some(path) = preview {
        write_preview(&frames, &path)?;
    }
    Ok(())
}

fn is_quit(line: &str) -> bool {
    let line = line.trim();
    line.is_empty() || line.eq_ignore_ascii_case("q")
}

async fn request_stop(engine: &EngineHandle) -> bool {
    match engine.stop_when_ready().await {
        Ok(()) => true,
        Err(e) => {
            eprintln!("stop not accepted: {e}");
            false
        }
    }
}

fn write_preview(frames: &FrameFeed, path: &Path) -> Result<()> {
    let latest = frames.borrow().clone();
    let Some(latest) = latest else {
        eprintln!("no frame captured; preview not written");
        return Ok(());
    };
    annotate::render(&latest)
        .save(path)
        .with_context(|| format!("failed to write preview {}", path.display()))?;
    println!("preview written to {}", path.display());
    Ok(())
}

/// Capture `samples` face crops of one person from the webcam.
fn enroll(config: &Config, name: &str, samples: usize) -> Result<()> {
    let name = name.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        bail!("invalid name: {name:?}");
    }

    let dir = config.dataset_dir.join(name);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let mut detector = OnnxFaceDetector::load(&config.detector_model_path())?;
    let mut camera = Camera::open(&config.camera_device)?.stream(config.warmup_frames)?;
    println!("capturing {samples} images of {name}; look at the camera");

    // Give up if faces stop showing up for a long stretch.
    let max_frames = samples.saturating_mul(20).max(100);
    let mut count = 0usize;
    for _ in 0..max_frames {
        if count >= samples {
            break;
        }
        let frame = camera.capture()?;
        let before = count;
        for bbox in detector.detect(&frame)? {
            if count >= samples {
                break;
            }
            let Some(face) = frame.crop(&bbox) else {
                continue;
            };
            count += 1;
            let path = dir.join(format!("{name}_{count}.png"));
            image::GrayImage::from_raw(face.width, face.height, face.data)
                .context("face crop does not match its size")?
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::debug!(path = %path.display(), "saved face");
        }
        if count / 10 > before / 10 {
            println!("{count}/{samples}");
        }
    }

    println!("saved {count} images to {}", dir.display());
    if count < samples {
        eprintln!("stopped early: no face in view");
    }
    Ok(())
}

fn train(config: &Config) -> Result<()> {
    let (model, identities) = train_from_dir(&config.dataset_dir)?;

    let model_path = config.recognizer_model_path();
    model.save(&model_path)?;
    let labels_path = config.labels_path();
    identities.save(&labels_path)?;

    println!(
        "trained on {} images of {} people",
        model.len(),
        identities.len()
    );
    println!("recognizer saved to {}", model_path.display());
    println!("labels saved to {}", labels_path.display());
    Ok(())
}

fn print_records(records: &[AttendanceRecord]) {
    if records.is_empty() {
        println!("no attendance recorded");
        return;
    }
    for r in records {
        println!("{:<24} {}", r.name, r.timestamp_string());
    }
    println!("{} records", records.len());
}
