use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Required template file extension, compared case-insensitively.
pub const TEMPLATE_EXTENSION: &str = ".glabels";

/// One label's worth of merge data: field name to scalar value, in the
/// order the caller wrote them.
pub type Record = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        JobId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A print request as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelRequest {
    pub template_name: String,
    pub data: Vec<Record>,
    #[serde(default = "default_copies")]
    pub copies: u32,
}

fn default_copies() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("template_name must have .glabels extension")]
    TemplateExtension,
    #[error("copies must be at least 1")]
    Copies,
    #[error("data must contain at least one record")]
    NoRecords,
}

impl LabelRequest {
    /// Check the request shape and normalize the template extension case
    /// (`demo.GLABELS` becomes `demo.glabels`).
    pub fn validate(mut self) -> Result<Self, ValidationError> {
        if !has_template_extension(&self.template_name) {
            return Err(ValidationError::TemplateExtension);
        }
        if !self.template_name.ends_with(TEMPLATE_EXTENSION) {
            let stem_len = self.template_name.len() - TEMPLATE_EXTENSION.len();
            self.template_name.truncate(stem_len);
            self.template_name.push_str(TEMPLATE_EXTENSION);
        }
        if self.copies == 0 {
            return Err(ValidationError::Copies);
        }
        if self.data.is_empty() {
            return Err(ValidationError::NoRecords);
        }
        Ok(self)
    }
}

pub fn has_template_extension(name: &str) -> bool {
    name.len() > TEMPLATE_EXTENSION.len()
        && name
            .get(name.len() - TEMPLATE_EXTENSION.len()..)
            .is_some_and(|ext| ext.eq_ignore_ascii_case(TEMPLATE_EXTENSION))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub template: String,
    /// Intended output PDF name, set at submission even if the job fails.
    pub filename: String,
    /// Where the PDF actually landed; only set once the job is `done`.
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub request: LabelRequest,
}

impl Job {
    pub fn pending(id: JobId, request: LabelRequest, filename: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            template: request.template_name.clone(),
            filename,
            output_path: None,
            error: None,
            created_at: now,
            updated_at: now,
            request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(template: &str, copies: u32) -> LabelRequest {
        LabelRequest {
            template_name: template.to_string(),
            data: vec![json!({"ITEM": "A001"}).as_object().unwrap().clone()],
            copies,
        }
    }

    #[test]
    fn test_validate_rejects_wrong_extension() {
        let err = request("invalid.txt", 1).validate().unwrap_err();
        assert_eq!(err, ValidationError::TemplateExtension);
        assert_eq!(err.to_string(), "template_name must have .glabels extension");

        assert!(request(".glabels", 1).validate().is_err());
    }

    #[test]
    fn test_validate_normalizes_extension_case() {
        let req = request("Demo.GLABELS", 1).validate().unwrap();
        assert_eq!(req.template_name, "Demo.glabels");
    }

    #[test]
    fn test_validate_copies_and_data() {
        assert_eq!(request("demo.glabels", 0).validate().unwrap_err(), ValidationError::Copies);

        let mut empty = request("demo.glabels", 1);
        empty.data.clear();
        assert_eq!(empty.validate().unwrap_err(), ValidationError::NoRecords);
    }

    #[test]
    fn test_copies_default_to_one() {
        let req: LabelRequest =
            serde_json::from_str(r#"{"template_name":"demo.glabels","data":[{"A":1}]}"#).unwrap();
        assert_eq!(req.copies, 1);
    }

    #[test]
    fn test_record_keeps_field_order() {
        let req: LabelRequest = serde_json::from_str(
            r#"{"template_name":"demo.glabels","data":[{"Z":1,"A":2,"M":3}]}"#,
        )
        .unwrap();
        let keys: Vec<&String> = req.data[0].keys().collect();
        assert_eq!(keys, ["Z", "A", "M"]);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Done).unwrap(), "\"done\"");
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_job_ids_are_distinct_v4() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
        assert_eq!(&a.as_str()[14..15], "4");
    }
}
