use common::Record;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use crate::error::{PrintError, RenderError};
use crate::exporter;
use crate::renderer::{RenderInvocation, Renderer};

/// Longest stderr excerpt carried into a job's error text.
const STDERR_EXCERPT_CHARS: usize = 1024;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub template_dir: PathBuf,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub keep_intermediate_files: bool,
    pub timeout: Duration,
}

/// JSON records → CSV → renderer → PDF, for one job at a time.
pub struct PrintPipeline {
    renderer: Arc<dyn Renderer>,
    settings: PipelineSettings,
}

/// The CSV handed to the renderer, and what happens to it afterwards.
enum Intermediate {
    Retained(PathBuf),
    Ephemeral(tempfile::TempPath),
}

impl Intermediate {
    fn path(&self) -> &Path {
        match self {
            Intermediate::Retained(path) => path.as_path(),
            Intermediate::Ephemeral(path) => &**path,
        }
    }

    fn finish(self) {
        match self {
            Intermediate::Retained(path) => {
                log::debug!("Kept CSV file: {}", path.display());
            }
            Intermediate::Ephemeral(path) => {
                let display = path.to_path_buf();
                match path.close() {
                    Ok(()) => log::debug!("Deleted temp CSV: {}", display.display()),
                    Err(e) => log::warn!("Cannot delete temp CSV {}: {}", display.display(), e),
                }
            }
        }
    }
}

impl PrintPipeline {
    pub fn new(renderer: Arc<dyn Renderer>, settings: PipelineSettings) -> Self {
        Self { renderer, settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn run(
        &self,
        job_id: &str,
        template_name: &str,
        records: &[Record],
        copies: u32,
        filename: &str,
    ) -> Result<PathBuf, PrintError> {
        let template_path = self.resolve_template(template_name).await?;

        tokio::fs::create_dir_all(&self.settings.output_dir).await?;
        let output_path = self.settings.output_dir.join(filename);

        let intermediate = self.prepare_intermediate(job_id).await?;
        let result = self
            .export_and_render(job_id, &template_path, intermediate.path(), records, copies, &output_path)
            .await;
        intermediate.finish();

        result.map(|()| output_path)
    }

    /// Case-insensitive file-name match inside the template directory.
    pub async fn resolve_template(&self, template_name: &str) -> Result<PathBuf, PrintError> {
        if !common::job::has_template_extension(template_name) {
            return Err(PrintError::InvalidTemplate(template_name.to_string()));
        }

        let mut entries = match tokio::fs::read_dir(&self.settings.template_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PrintError::TemplateNotFound(template_name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().eq_ignore_ascii_case(template_name) {
                return Ok(entry.path());
            }
        }

        Err(PrintError::TemplateNotFound(template_name.to_string()))
    }

    async fn prepare_intermediate(&self, job_id: &str) -> Result<Intermediate, PrintError> {
        if self.settings.keep_intermediate_files {
            tokio::fs::create_dir_all(&self.settings.temp_dir).await?;
            Ok(Intermediate::Retained(self.settings.temp_dir.join(format!("{}.csv", job_id))))
        } else {
            let file = tempfile::Builder::new()
                .prefix(&format!("labels_{}_", job_id))
                .suffix(".csv")
                .tempfile()?;
            Ok(Intermediate::Ephemeral(file.into_temp_path()))
        }
    }

    async fn export_and_render(
        &self,
        job_id: &str,
        template_path: &Path,
        csv_path: &Path,
        records: &[Record],
        copies: u32,
        output_path: &Path,
    ) -> Result<(), PrintError> {
        exporter::export_csv(records, csv_path, None)?;

        let invocation = RenderInvocation {
            output_path: output_path.to_path_buf(),
            template_path: template_path.to_path_buf(),
            input_path: csv_path.to_path_buf(),
            extra_args: copies_args(copies),
        };

        let started = Instant::now();
        log::debug!(
            "START job_id={}, template={}, copies={}",
            job_id,
            template_path.display(),
            copies
        );

        match self.renderer.render(&invocation, self.settings.timeout).await {
            Ok(()) => {
                log::info!(
                    "job_id={} finished in {:.2}s -> {}",
                    job_id,
                    started.elapsed().as_secs_f64(),
                    output_path.display()
                );
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "job_id={} failed after {:.2}s: {}",
                    job_id,
                    started.elapsed().as_secs_f64(),
                    e
                );
                Err(map_render_error(e))
            }
        }
    }
}

fn copies_args(copies: u32) -> Vec<String> {
    if copies > 1 {
        vec![format!("--copies={}", copies)]
    } else {
        Vec::new()
    }
}

fn map_render_error(err: RenderError) -> PrintError {
    match err {
        RenderError::Timeout(limit) => PrintError::Timeout(limit),
        RenderError::Exit { code, stderr } => PrintError::RenderFailed {
            code,
            stderr: truncate_stderr(&stderr),
        },
        RenderError::Spawn(e) | RenderError::Wait(e) => PrintError::Spawn(e.to_string()),
    }
}

fn truncate_stderr(stderr: &str) -> String {
    match stderr.char_indices().nth(STDERR_EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &stderr[..cut]),
        None => stderr.to_string(),
    }
}
