mod config;
mod error;
mod exporter;
mod manager;
mod metrics;
mod pipeline;
mod renderer;

use anyhow::Context;
use clap::Parser;
use common::{Request, Response};
use config::{Config, LoggingConfig};
use manager::{JobManager, ManagerSettings};
use metrics::MetricsCollector;
use pipeline::{PipelineSettings, PrintPipeline};
use renderer::GlabelsRenderer;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML or TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.or_else(default_config_path).as_deref())?;
    setup_logging(&config.logging)?;
    log::info!("Starting labelq-daemon...");

    let max_parallel = config.max_parallel();
    let renderer = Arc::new(GlabelsRenderer::new(
        config.render.program.clone(),
        config.render.base_args.clone(),
        max_parallel,
    ));
    let pipeline = Arc::new(PrintPipeline::new(
        renderer,
        PipelineSettings {
            template_dir: config.render.template_dir.clone(),
            output_dir: config.render.output_dir.clone(),
            temp_dir: config.render.temp_dir.clone(),
            keep_intermediate_files: config.render.keep_intermediate_files,
            timeout: config.render_timeout(),
        },
    ));
    log::info!(
        "Templates from {:?}, PDFs to {:?}, keep CSV: {}",
        pipeline.settings().template_dir,
        pipeline.settings().output_dir,
        pipeline.settings().keep_intermediate_files
    );

    let metrics = Arc::new(MetricsCollector::new());
    let manager = Arc::new(JobManager::new(
        pipeline,
        metrics.clone(),
        ManagerSettings {
            max_parallel,
            retention: config.retention_window(),
            auto_cleanup_output: config.retention.auto_cleanup_output,
            sweep_interval: config.sweep_interval(),
        },
    ));
    manager.start_workers();

    let socket_path = config.server.socket_path.clone();
    let listener = bind_socket(&socket_path)?;
    log::info!("Listening on {}", socket_path.display());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let socket = match accepted {
                    Ok((socket, _)) => socket,
                    Err(e) => {
                        log::error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let manager = manager.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(socket, &manager, &metrics).await {
                        log::error!("Client connection error: {:#}", e);
                    }
                });
            }
        }
    }

    log::info!("Shutting down ({} workers)", manager.max_parallel());
    manager.shutdown().await;
    if let Err(e) = std::fs::remove_file(&socket_path) {
        log::warn!("Failed to remove socket {}: {}", socket_path.display(), e);
    }
    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    [common::DEFAULT_CONFIG_PATH, common::USER_CONFIG_PATH]
        .into_iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn bind_socket(socket_path: &Path) -> anyhow::Result<UnixListener> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory {:?}", parent))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind {:?}", socket_path))?;

    // Set socket permissions to allow all users to connect
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(socket_path)?.permissions();
    perms.set_mode(0o666);
    std::fs::set_permissions(socket_path, perms)?;

    Ok(listener)
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            log::error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Received Ctrl-C"),
        _ = terminate.recv() => log::info!("Received SIGTERM"),
    }
}

async fn handle_client(socket: UnixStream, manager: &JobManager, metrics: &MetricsCollector) -> anyhow::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let resp = match common::ipc::decode_line::<Request>(&line) {
            Ok(req) => {
                log::debug!("Received request: {:?}", req);
                dispatch(req, manager, metrics)
            }
            Err(e) => Response::Error(format!("Malformed request: {}", e)),
        };
        writer.write_all(&common::ipc::encode_line(&resp)?).await?;
    }
    Ok(())
}

fn dispatch(req: Request, manager: &JobManager, metrics: &MetricsCollector) -> Response {
    match req {
        Request::Submit(label_request) => match label_request.validate() {
            Ok(valid) => Response::Submitted(manager.submit(valid)),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::GetJob(id) => Response::JobDetail(manager.get(&id)),
        Request::ListJobs { limit } => Response::JobList(manager.list(limit)),
        Request::Stats => Response::Stats(manager.stats()),
        Request::Metrics => Response::Metrics(metrics.export()),
    }
}

fn setup_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let level = log::LevelFilter::from_str(&logging.level)
        .with_context(|| format!("Invalid log level: {}", logging.level))?;

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    if let Some(ref path) = logging.output {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{settings as pipeline_settings, MockRenderer};
    use common::{JobStatus, LabelRequest};
    use serde_json::json;
    use std::time::Duration;

    fn setup(root: &Path) -> (Arc<JobManager>, Arc<MetricsCollector>) {
        let pipeline = Arc::new(PrintPipeline::new(
            Arc::new(MockRenderer::default()),
            pipeline_settings(root, false),
        ));
        let metrics = Arc::new(MetricsCollector::new());
        let manager = Arc::new(JobManager::new(
            pipeline,
            metrics.clone(),
            ManagerSettings {
                max_parallel: 1,
                retention: Duration::from_secs(3600),
                auto_cleanup_output: true,
                sweep_interval: None,
            },
        ));
        (manager, metrics)
    }

    fn label_request(template: &str) -> LabelRequest {
        LabelRequest {
            template_name: template.to_string(),
            data: serde_json::from_value(json!([{"ITEM": "A001"}])).unwrap(),
            copies: 1,
        }
    }

    #[tokio::test]
    async fn test_dispatch_rejects_invalid_request_without_creating_job() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, metrics) = setup(dir.path());

        match dispatch(Request::Submit(label_request("invalid.txt")), &manager, &metrics) {
            Response::Error(msg) => assert!(msg.contains("template_name must have .glabels extension")),
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(manager.jobs_total(), 0);
        assert!(manager.list(10).is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_submit_get_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, metrics) = setup(dir.path());

        let id = match dispatch(Request::Submit(label_request("Demo.GLABELS")), &manager, &metrics) {
            Response::Submitted(id) => id,
            other => panic!("expected submitted, got {:?}", other),
        };

        match dispatch(Request::GetJob(id.clone()), &manager, &metrics) {
            Response::JobDetail(Some(job)) => {
                assert_eq!(job.status, JobStatus::Pending);
                assert_eq!(job.template, "Demo.glabels");
            }
            other => panic!("expected job detail, got {:?}", other),
        }
        match dispatch(Request::GetJob("missing".into()), &manager, &metrics) {
            Response::JobDetail(None) => {}
            other => panic!("expected not found, got {:?}", other),
        }
        match dispatch(Request::ListJobs { limit: 5 }, &manager, &metrics) {
            Response::JobList(jobs) => assert_eq!(jobs.len(), 1),
            other => panic!("expected list, got {:?}", other),
        }
        match dispatch(Request::Stats, &manager, &metrics) {
            Response::Stats(stats) => {
                assert_eq!(stats.jobs_total, 1);
                assert_eq!(stats.pending, 1);
            }
            other => panic!("expected stats, got {:?}", other),
        }
        match dispatch(Request::Metrics, &manager, &metrics) {
            Response::Metrics(text) => assert!(text.contains("labelq_jobs_submitted_total 1")),
            other => panic!("expected metrics, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, metrics) = setup(dir.path());
        manager.start_workers();

        let socket_path = dir.path().join("run").join("labelq.sock");
        let listener = bind_socket(&socket_path).unwrap();
        let server_manager = manager.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            handle_client(socket, &server_manager, &metrics).await.unwrap();
        });

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let req = Request::Submit(label_request("demo.glabels"));
        writer.write_all(&common::ipc::encode_line(&req).unwrap()).await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let id = match common::ipc::decode_line::<Response>(&line).unwrap() {
            Response::Submitted(id) => id,
            other => panic!("expected submitted, got {:?}", other),
        };

        writer.write_all(b"garbage\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(matches!(
            common::ipc::decode_line::<Response>(&line).unwrap(),
            Response::Error(_)
        ));

        // poll until the worker finishes, like a client would
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let req = Request::GetJob(id.clone());
            writer.write_all(&common::ipc::encode_line(&req).unwrap()).await.unwrap();
            let line = lines.next_line().await.unwrap().unwrap();
            if let Response::JobDetail(Some(job)) = common::ipc::decode_line::<Response>(&line).unwrap() {
                if job.status == JobStatus::Done {
                    break;
                }
            }
            assert!(std::time::Instant::now() < deadline, "job never finished");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        manager.shutdown().await;
    }
}
