use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use crate::error::RenderError;

/// Cap on captured renderer stderr; anything beyond is drained and dropped.
pub const MAX_STDERR_BYTES: usize = 64 * 1024;

/// How long a timed-out renderer gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// One call into the external renderer.
#[derive(Debug, Clone)]
pub struct RenderInvocation {
    pub output_path: PathBuf,
    pub template_path: PathBuf,
    pub input_path: PathBuf,
    pub extra_args: Vec<String>,
}

impl RenderInvocation {
    /// Arguments in `glabels-3-batch` form: `--output=OUT --input=CSV [extra..] TEMPLATE`.
    pub fn args(&self) -> Vec<OsString> {
        let mut output = OsString::from("--output=");
        output.push(&self.output_path);
        let mut input = OsString::from("--input=");
        input.push(&self.input_path);

        let mut args = vec![output, input];
        args.extend(self.extra_args.iter().map(OsString::from));
        args.push(self.template_path.clone().into_os_string());
        args
    }
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, invocation: &RenderInvocation, timeout: Duration) -> Result<(), RenderError>;
}

/// Runs the gLabels batch binary, at most `max_parallel` processes at once.
pub struct GlabelsRenderer {
    program: PathBuf,
    base_args: Vec<String>,
    permits: Arc<Semaphore>,
}

impl GlabelsRenderer {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>, max_parallel: usize) -> Self {
        Self {
            program: program.into(),
            base_args,
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }
}

#[async_trait]
impl Renderer for GlabelsRenderer {
    async fn render(&self, invocation: &RenderInvocation, timeout: Duration) -> Result<(), RenderError> {
        let _permit = self.permits.acquire().await.map_err(|_| {
            RenderError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, "renderer is shut down"))
        })?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut child = cmd.spawn().map_err(RenderError::Spawn)?;
        log::debug!(
            "Renderer pid {:?} started for {}",
            child.id(),
            invocation.output_path.display()
        );

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_STDERR_BYTES)));

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(RenderError::Wait(e)),
            Err(_) => {
                log::warn!(
                    "Renderer pid {:?} exceeded timeout of {}s, terminating",
                    child.id(),
                    timeout.as_secs_f64()
                );
                terminate(&mut child).await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return Err(RenderError::Timeout(timeout));
            }
        };

        // A helper forked by the renderer can keep stderr open after the
        // renderer itself has exited; the drain shares the same deadline.
        let stderr = match stderr_task {
            Some(mut task) => match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(joined) => joined.unwrap_or_default(),
                Err(_) => {
                    task.abort();
                    log::warn!(
                        "Renderer exited with {} but stderr stayed open past {}s",
                        status,
                        timeout.as_secs_f64()
                    );
                    return Err(RenderError::Timeout(timeout));
                }
            },
            None => String::new(),
        };

        log::debug!(
            "Renderer finished with {} in {:.2}s",
            status,
            started.elapsed().as_secs_f64()
        );
        if status.success() {
            Ok(())
        } else {
            Err(RenderError::Exit { code: status.code(), stderr })
        }
    }
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

            // Give it a moment to clean up
            if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
    }

    if let Err(e) = child.kill().await {
        log::warn!("Failed to kill renderer: {}", e);
    }
}

async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    // Tests drive `/bin/sh <script>` so the script itself is never exec'd.
    fn sh_renderer(dir: &Path, body: &str, max_parallel: usize) -> GlabelsRenderer {
        let script = dir.join("render.sh");
        std::fs::write(&script, body).unwrap();
        GlabelsRenderer::new(
            "/bin/sh",
            vec![script.to_string_lossy().into_owned()],
            max_parallel,
        )
    }

    fn invocation(dir: &Path) -> RenderInvocation {
        RenderInvocation {
            output_path: dir.join("out.pdf"),
            template_path: dir.join("demo.glabels"),
            input_path: dir.join("labels.csv"),
            extra_args: vec![],
        }
    }

    #[test]
    fn test_invocation_args_order() {
        let inv = RenderInvocation {
            output_path: PathBuf::from("/out/a.pdf"),
            template_path: PathBuf::from("/tpl/demo.glabels"),
            input_path: PathBuf::from("/tmp/a.csv"),
            extra_args: vec!["--copies=3".to_string()],
        };
        assert_eq!(
            inv.args(),
            ["--output=/out/a.pdf", "--input=/tmp/a.csv", "--copies=3", "/tpl/demo.glabels"]
                .map(OsString::from)
        );
    }

    #[tokio::test]
    async fn test_success_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = sh_renderer(
            dir.path(),
            "for a in \"$@\"; do case \"$a\" in --output=*) out=\"${a#--output=}\";; esac; done\nprintf pdf > \"$out\"\n",
            1,
        );
        let inv = invocation(dir.path());

        renderer.render(&inv, Duration::from_secs(10)).await.unwrap();
        assert_eq!(std::fs::read_to_string(&inv.output_path).unwrap(), "pdf");
        assert_eq!(renderer.permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = sh_renderer(dir.path(), "echo 'merge failed' >&2\nexit 3\n", 1);

        match renderer.render(&invocation(dir.path()), Duration::from_secs(10)).await {
            Err(RenderError::Exit { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr.trim(), "merge failed");
            }
            other => panic!("expected exit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stderr_capture_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = sh_renderer(
            dir.path(),
            "head -c 200000 /dev/zero | tr '\\000' x >&2\nexit 1\n",
            1,
        );

        match renderer.render(&invocation(dir.path()), Duration::from_secs(10)).await {
            Err(RenderError::Exit { stderr, .. }) => assert_eq!(stderr.len(), MAX_STDERR_BYTES),
            other => panic!("expected exit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = sh_renderer(dir.path(), "exec sleep 30\n", 1);

        let started = Instant::now();
        let err = renderer
            .render(&invocation(dir.path()), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(renderer.permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_timeout_covers_stderr_held_by_background_helper() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = sh_renderer(dir.path(), "sleep 6 &\nexit 1\n", 1);

        let started = Instant::now();
        let err = renderer
            .render(&invocation(dir.path()), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Timeout(_)), "got {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(renderer.permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = GlabelsRenderer::new(dir.path().join("no-such-renderer"), vec![], 1);

        let err = renderer
            .render(&invocation(dir.path()), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_semaphore_serializes_processes() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = sh_renderer(dir.path(), "sleep 0.3\n", 1);
        let inv = invocation(dir.path());

        let started = Instant::now();
        let (a, b) = tokio::join!(
            renderer.render(&inv, Duration::from_secs(10)),
            renderer.render(&inv, Duration::from_secs(10)),
        );
        a.unwrap();
        b.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(600));
    }
}
