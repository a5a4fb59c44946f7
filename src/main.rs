use anyhow::{bail, Context};
use catrender::bridge::{BatchRequest, Bridge, RenderEvent, RenderRequest};
use catrender::job::RenderJob;
use catrender::platform::Platform;
use catrender::queue::JobQueue;
use catrender::rendering::worker::{self, WorkerRequest, WorkerResponse};
use catrender::rendering::{self, HostCapability, HtmlRenderer};
use catrender::storage::Storage;
use catrender::RenderConfig;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "catrender", version, about = "Render catalogue pages to images")]
struct Cli {
    /// Storage root (overrides `files_dir` from the config)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Snapshot,
    Worker,
    #[cfg(feature = "cdp")]
    Chrome,
}

#[derive(Subcommand)]
enum Command {
    /// Render one HTML file straight to storage
    Render {
        html: PathBuf,
        #[arg(long)]
        file_name: String,
        #[arg(long, default_value = catrender::DEFAULT_FOLDER)]
        folder: String,
        #[arg(long, value_enum, default_value = "snapshot")]
        backend: Backend,
    },
    /// Enqueue a JSON array of `{html, fileName}` jobs and drain the queue
    RenderBatch {
        jobs: PathBuf,
        #[arg(long)]
        folder: Option<String>,
        /// Persist the jobs without running them
        #[arg(long)]
        enqueue_only: bool,
    },
    /// Run a legacy `renderData` batch through the foreground service
    Legacy { data: PathBuf },
    /// Move persisted pending jobs into the queue and drain it
    Resume,
    /// Persist a JSON array of jobs for the next resume
    SavePending { jobs: PathBuf },
    /// Serve worker messages as JSON lines on stdin/stdout
    Worker,
    List {
        #[arg(default_value = catrender::DEFAULT_FOLDER)]
        folder: String,
    },
    Clear {
        #[arg(default_value = catrender::DEFAULT_FOLDER)]
        folder: String,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<RenderConfig> {
    let mut config = match &cli.config {
        Some(path) => RenderConfig::from_file(path)?,
        None => RenderConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.files_dir = root.clone();
    }
    Ok(config)
}

fn read_jobs(path: &PathBuf) -> anyhow::Result<Vec<RenderJob>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_str(&raw).with_context(|| format!("parsing jobs in {}", path.display()))?)
}

fn print_event(event: &RenderEvent) {
    if let Ok(line) = serde_json::to_string(event) {
        println!("{}", line);
    }
}

/// Run due units until nothing due is left
fn drain(queue: &JobQueue) {
    loop {
        let ran = queue.run_pending();
        if ran == 0 || queue.pending().is_empty() {
            break;
        }
    }
    let left = queue.pending().len();
    if left > 0 {
        log::warn!("{} units are waiting for a retry", left);
    }
}

fn serve_worker() -> io::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut accepting = true;

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let responses = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(WorkerRequest::RenderImage(req)) if accepting => {
                vec![worker::progress_for(&req), worker::handle_render(&req)]
            }
            Ok(WorkerRequest::RenderImage(req)) => {
                log::debug!("Ignoring render of {} after cancel", req.product_id);
                Vec::new()
            }
            Ok(WorkerRequest::Cancel) => {
                accepting = false;
                vec![WorkerResponse::Cancelled]
            }
            Err(e) => {
                log::warn!("Ignoring malformed worker message: {}", e);
                Vec::new()
            }
        };
        for resp in responses {
            if let Ok(s) = serde_json::to_string(&resp) {
                writeln!(out, "{}", s)?;
            }
        }
        out.flush()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let storage = Storage::new(&config.files_dir);

    match cli.command {
        Command::Render {
            html,
            file_name,
            folder,
            backend,
        } => {
            let html = std::fs::read_to_string(&html).with_context(|| format!("reading {}", html.display()))?;
            let renderer: Box<dyn HtmlRenderer> = match backend {
                Backend::Snapshot => rendering::select_backend(HostCapability::NativeSurface, &config)?,
                Backend::Worker => rendering::select_backend(HostCapability::WorkerOnly, &config)?,
                #[cfg(feature = "cdp")]
                Backend::Chrome => Box::new(rendering::snapshot::SnapshotRenderer::with_chrome_surface(&config)?),
            };
            let job = RenderJob::new(html, file_name).in_folder(folder);
            let artifact = tokio::task::spawn_blocking(move || renderer.render(&job).map(|a| (job, a))).await?;
            let (job, artifact) = artifact?;
            if !storage.write(&job.folder_name, &job.file_name, &artifact.bytes) {
                bail!("failed to save {}/{}", job.folder_name, job.file_name);
            }
            println!(
                "{} ({}x{})",
                storage.artifact_path(&job.folder_name, &job.file_name).display(),
                artifact.width,
                artifact.height
            );
        }
        Command::RenderBatch {
            jobs,
            folder,
            enqueue_only,
        } => {
            let default_folder = config.default_folder.clone();
            let bridge = Bridge::new(Platform::headless(storage), config)?;
            bridge.on_event(Arc::new(print_event));
            let render_jobs = read_jobs(&jobs)?;
            if enqueue_only {
                // persisted only; the queue worker is left stopped
                let folder = folder.unwrap_or(default_folder);
                let count = bridge.queue().enqueue_batch(render_jobs, Some(&folder))?;
                println!("{} render jobs enqueued", count);
            } else {
                let reply = bridge
                    .render_batch(BatchRequest {
                        render_jobs,
                        folder_name: folder,
                    })
                    .await?;
                println!("{}", reply.message);
                let queue = bridge.queue().clone();
                tokio::task::spawn_blocking(move || drain(&queue)).await?;
            }
        }
        Command::Legacy { data } => {
            let raw = std::fs::read_to_string(&data).with_context(|| format!("reading {}", data.display()))?;
            let render_data: serde_json::Value = serde_json::from_str(&raw)?;
            let bridge = Bridge::new(Platform::headless(storage), config)?;
            bridge.on_event(Arc::new(print_event));
            let reply = bridge
                .start_rendering(serde_json::json!({ "renderData": render_data }))
                .await?;
            println!("{}", reply.message);
            while bridge.get_status().await.is_running {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
        Command::Resume => {
            let bridge = Bridge::new(Platform::headless(storage), config)?;
            bridge.on_event(Arc::new(print_event));
            let outcome = bridge.start_background_rendering().await?;
            println!("{:?}", outcome);
            bridge.queue().shutdown();
            let queue = bridge.queue().clone();
            tokio::task::spawn_blocking(move || drain(&queue)).await?;
        }
        Command::SavePending { jobs } => {
            let jobs = read_jobs(&jobs)?;
            let count = jobs.len();
            if !Platform::headless(storage).pending_jobs().save(&jobs) {
                bail!("failed to save pending jobs");
            }
            println!("saved {} pending jobs", count);
        }
        Command::Worker => {
            tokio::task::spawn_blocking(serve_worker).await??;
        }
        Command::List { folder } => {
            for name in storage.list(&folder) {
                println!("{}", name);
            }
            println!("{} bytes in {}", storage.size(&folder), storage.root().join(&folder).display());
        }
        Command::Clear { folder } => {
            if !storage.clear(&folder) {
                bail!("failed to clear {}", folder);
            }
        }
    }

    Ok(())
}
