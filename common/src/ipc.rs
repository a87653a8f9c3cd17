use serde::{de::DeserializeOwned, Deserialize, Serialize};
use crate::job::{Job, JobId, LabelRequest};

/// Messages are framed as one JSON document per line.
#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    Submit(LabelRequest),
    GetJob(JobId),
    ListJobs { limit: usize },
    Stats,
    Metrics,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Submitted(JobId),
    Error(String),
    JobList(Vec<Job>),
    JobDetail(Option<Job>),
    Stats(StatsSnapshot),
    Metrics(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub jobs_total: u64,
    pub queue_depth: u64,
    pub max_parallel: usize,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

pub fn encode_line<T: Serialize>(msg: &T) -> anyhow::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> anyhow::Result<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}
