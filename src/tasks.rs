// Submit-and-poll client for the asynchronous image generation API.
//
// `submit` posts a generation request and returns the task id the
// service assigns; `poll` then fetches the task on a fixed interval until
// it reaches a terminal status (or the optional deadline passes).

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::TaskApiConfig;
use crate::error::{ApiError, Result};

/// Remote task state. Unrecognised strings are treated as still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[serde(alias = "queued", alias = "submitted")]
    Pending,
    #[serde(alias = "processing")]
    Running,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// The `data` object of a task status response.
#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "unknown_status")]
    pub status: TaskStatus,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub error: Option<Value>,
}

fn unknown_status() -> TaskStatus {
    TaskStatus::Unknown
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub images: Vec<TaskImage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskImage {
    pub url: ImageUrl,
}

/// `url` is a list on this API, but a bare string is accepted too.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImageUrl {
    One(String),
    Many(Vec<String>),
}

impl ImageUrl {
    pub fn first(&self) -> Option<&str> {
        match self {
            ImageUrl::One(url) => Some(url.as_str()),
            ImageUrl::Many(urls) => urls.first().map(String::as_str),
        }
    }
}

impl Task {
    /// Progress percentage, clamped to 0..=100.
    pub fn progress(&self) -> u32 {
        self.progress.unwrap_or(0.0).clamp(0.0, 100.0) as u32
    }

    pub fn image_urls(&self) -> Vec<&str> {
        self.result
            .iter()
            .flat_map(|r| r.images.iter())
            .filter_map(|img| img.url.first())
            .collect()
    }

    pub fn first_image_url(&self) -> Option<&str> {
        self.image_urls().into_iter().next()
    }

    fn failure_reason(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(
                other
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            ),
        }
    }
}

/// Body of the generation request.
#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    size: &'a str,
    n: u32,
    resolution: &'a str,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub task_id: String,
    pub latency: Duration,
}

/// How a poll ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed { url: String, elapsed: Duration },
    Failed { reason: Option<String> },
}

impl PollOutcome {
    pub fn url(&self) -> Option<&str> {
        match self {
            PollOutcome::Completed { url, .. } => Some(url),
            PollOutcome::Failed { .. } => None,
        }
    }
}

/// Blocking client for the task API.
#[derive(Clone)]
pub struct TaskClient {
    client: Client,
    base_url: String,
    model: String,
    size: String,
    n: u32,
    resolution: String,
    language: String,
    poll_interval: Duration,
    poll_timeout: Option<Duration>,
}

impl TaskClient {
    pub fn from_config(config: &TaskApiConfig) -> Result<Self> {
        let key = config.api_key()?;
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| ApiError::InvalidHeader("Authorization"))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(TaskClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            size: config.size.clone(),
            n: config.n,
            resolution: config.resolution.clone(),
            language: config.language.clone(),
            poll_interval: config.poll_interval(),
            poll_timeout: config.poll_timeout(),
        })
    }

    /// POST the generation request and pull `data[0].task_id` out of the
    /// response.
    pub fn submit(&self, prompt: &str) -> Result<Submission> {
        let body = GenerationRequest {
            model: &self.model,
            prompt,
            size: &self.size,
            n: self.n,
            resolution: &self.resolution,
        };
        let started = Instant::now();
        let res = self
            .client
            .post(format!("{}/v1/images/generations", self.base_url))
            .json(&body)
            .send()?;
        let status = res.status();
        let text = res.text()?;
        let latency = started.elapsed();
        if !status.is_success() {
            return Err(ApiError::Status { status, body: text });
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| ApiError::Malformed(format!("{e}: {text}")))?;
        let task_id = json
            .pointer("/data/0/task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Malformed(format!("no data[0].task_id in {text}")))?
            .to_string();
        debug!(%task_id, latency_ms = latency.as_millis() as u64, "task submitted");
        Ok(Submission { task_id, latency })
    }

    /// Fetch the task once.
    pub fn fetch(&self, task_id: &str) -> Result<Task> {
        let res = self
            .client
            .get(format!("{}/v1/tasks/{task_id}", self.base_url))
            .query(&[("language", self.language.as_str())])
            .send()?;
        let text = res.text()?;
        let json: Value = serde_json::from_str(&text)
            .map_err(|e| ApiError::Malformed(format!("{e}: {text}")))?;
        let data = json
            .get("data")
            .filter(|d| d.is_object())
            .ok_or_else(|| ApiError::Malformed(format!("no task data in {text}")))?;
        serde_json::from_value(data.clone()).map_err(|e| ApiError::Malformed(e.to_string()))
    }

    /// Poll until the task completes or fails. `on_tick` sees every
    /// observed state together with that request's latency.
    pub fn poll<F>(&self, task_id: &str, mut on_tick: F) -> Result<PollOutcome>
    where
        F: FnMut(&Task, Duration),
    {
        let started = Instant::now();
        loop {
            let req_started = Instant::now();
            let task = self.fetch(task_id)?;
            on_tick(&task, req_started.elapsed());

            match task.status {
                TaskStatus::Completed => {
                    let url = task
                        .first_image_url()
                        .ok_or_else(|| ApiError::Malformed(format!("task {task_id} completed without an image url")))?
                        .to_string();
                    let elapsed = started.elapsed();
                    info!(task_id, elapsed_s = elapsed.as_secs_f64(), "task completed");
                    return Ok(PollOutcome::Completed { url, elapsed });
                }
                TaskStatus::Failed => {
                    return Ok(PollOutcome::Failed {
                        reason: task.failure_reason(),
                    })
                }
                _ => {}
            }

            if let Some(limit) = self.poll_timeout {
                if started.elapsed() >= limit {
                    return Err(ApiError::Timeout {
                        task_id: task_id.to_string(),
                        seconds: limit.as_secs(),
                    });
                }
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Submit, then poll the resulting task. `on_tick` also receives the
    /// task id, since status payloads do not always repeat it.
    pub fn run_pipeline<S, F>(&self, prompt: &str, on_submit: S, mut on_tick: F) -> Result<PollOutcome>
    where
        S: FnOnce(&Submission),
        F: FnMut(&str, &Task, Duration),
    {
        let submission = self.submit(prompt)?;
        on_submit(&submission);
        let task_id = submission.task_id.as_str();
        self.poll(task_id, |task, latency| on_tick(task_id, task, latency))
    }
}
