use std::time::Duration;

/// Failure of a single renderer process invocation.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("renderer timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("renderer exited with {}", exit_label(.code))]
    Exit { code: Option<i32>, stderr: String },
    #[error("failed to spawn renderer: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to wait for renderer: {0}")]
    Wait(#[source] std::io::Error),
}

/// Everything that can end a job in `failed`.
#[derive(Debug, thiserror::Error)]
pub enum PrintError {
    #[error("gLabels template not found: {0}")]
    TemplateNotFound(String),
    #[error("Only .glabels templates are allowed: {0}")]
    InvalidTemplate(String),
    #[error("No label data to generate CSV")]
    EmptyInput,
    #[error("Label PDF generation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("Label PDF generation failed (rc={})\n{stderr}", exit_label(.code))]
    RenderFailed { code: Option<i32>, stderr: String },
    #[error("Job cancelled: {0}")]
    Cancelled(String),
    #[error("Renderer unavailable: {0}")]
    Spawn(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_failed_message_carries_code_and_stderr() {
        let err = PrintError::RenderFailed { code: Some(3), stderr: "bad merge".into() };
        assert_eq!(err.to_string(), "Label PDF generation failed (rc=3)\nbad merge");

        let killed = PrintError::RenderFailed { code: None, stderr: String::new() };
        assert!(killed.to_string().contains("rc=signal"));
    }

    #[test]
    fn test_timeout_message() {
        let err = RenderError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "renderer timed out after 1.5s");
    }
}
