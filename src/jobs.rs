// The runnable jobs. Each one wires a client to the worker pool and
// returns a `BatchReport`; printing is left to the caller through the
// progress callbacks so the same jobs can run under the menu or in tests.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::api::{ApiClient, LOOKUP_MAX_PAGES};
use crate::batch::{run_pool, BatchReport, Outcome, Progress};
use crate::error::{ApiError, Result};
use crate::gemini::{self, ExtractedImage, GeminiClient, InlineData};
use crate::sheet::{self, TokenRow};
use crate::tasks::{PollOutcome, TaskClient, TaskStatus};
use crate::tokens::{short_key, token_name, KeyIndex, TokenPayload};

/// First ten characters of a prompt, for log lines.
pub fn prompt_label(prompt: &str) -> String {
    let mut label: String = prompt.chars().take(10).collect();
    if prompt.chars().count() > 10 {
        label.push_str("...");
    }
    label
}

// ---------------------------------------------------------------------
// Token administration
// ---------------------------------------------------------------------

/// Parameters of a bulk create.
#[derive(Debug, Clone)]
pub struct CreateTokens {
    pub count: usize,
    pub quota: f64,
    pub group: String,
    /// `yyyymmdd`, used in token names and the output file name.
    pub date: String,
    pub workers: usize,
}

impl CreateTokens {
    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(format!("{}_tokens_{}.xlsx", self.date, self.count))
    }
}

pub fn today() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

/// Create `count` tokens; successful `(name, key)` pairs come back in
/// completion order.
pub fn create_tokens<C>(api: &ApiClient, job: &CreateTokens, on_done: C) -> BatchReport<TokenRow>
where
    C: FnMut(Progress<'_, TokenRow>),
{
    let report = run_pool(
        (0..job.count).collect(),
        job.workers,
        |n| {
            let name = token_name(&job.date, job.count, job.quota, n);
            let payload = TokenPayload::create(name.clone(), job.quota, job.group.clone());
            match api.create_token(&payload) {
                Ok(key) => Outcome::Success(TokenRow { name, key }),
                Err(e) => {
                    warn!(%name, error = %e, "token creation failed");
                    Outcome::failure(name, e)
                }
            }
        },
        on_done,
    );
    info!(succeeded = report.summary.succeeded, failed = report.summary.failed, "create job finished");
    report
}

/// Write the created tokens to `path`.
pub fn save_created(path: &Path, created: &[TokenRow]) -> Result<()> {
    sheet::write_token_sheet(path, created)
}

/// Delete tokens by id. Blank ids fail without a request.
pub fn delete_by_ids<C>(api: &ApiClient, ids: Vec<String>, workers: usize, on_done: C) -> BatchReport<String>
where
    C: FnMut(Progress<'_, String>),
{
    let report = run_pool(
        ids,
        workers,
        |id| {
            let id = id.trim().to_string();
            if id.is_empty() {
                return Outcome::failure(id, "empty id");
            }
            match api.delete_token(&id) {
                Ok(()) => Outcome::Success(id),
                Err(e) => {
                    warn!(%id, error = %e, "delete failed");
                    Outcome::failure(id, e)
                }
            }
        },
        on_done,
    );
    info!(succeeded = report.summary.succeeded, failed = report.summary.failed, "delete job finished");
    report
}

/// Delete the tokens whose keys appear in `keys`. Keys the server does
/// not know are skipped.
pub fn delete_by_keys<C>(
    api: &ApiClient,
    keys: Vec<String>,
    index: &KeyIndex,
    workers: usize,
    on_done: C,
) -> BatchReport<String>
where
    C: FnMut(Progress<'_, String>),
{
    let report = run_pool(
        keys,
        workers,
        |key| {
            let label = short_key(&key);
            let Some(id) = index.get(&key) else {
                return Outcome::skipped(label, "not on the server (already deleted?)");
            };
            match api.delete_token(&id.to_string()) {
                Ok(()) => Outcome::Success(label),
                Err(e) => {
                    warn!(key = %label, error = %e, "delete failed");
                    Outcome::failure(label, e)
                }
            }
        },
        on_done,
    );
    info!(
        succeeded = report.summary.succeeded,
        skipped = report.summary.skipped,
        failed = report.summary.failed,
        "key-log delete job finished"
    );
    report
}

/// A token moved to a new group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupChange {
    pub name: String,
    pub from: String,
    pub to: String,
}

/// Move every listed token into `target_group`. Tokens already there
/// are skipped.
pub fn update_groups<C>(
    api: &ApiClient,
    rows: Vec<TokenRow>,
    target_group: &str,
    workers: usize,
    on_done: C,
) -> BatchReport<GroupChange>
where
    C: FnMut(Progress<'_, GroupChange>),
{
    let report = run_pool(
        rows,
        workers,
        |row| {
            let token = match api.find_token(Some(&row.name), &row.key, LOOKUP_MAX_PAGES) {
                Ok(Some(token)) => token,
                Ok(None) => return Outcome::failure(row.name, "token not found"),
                Err(e) => return Outcome::failure(row.name, format!("lookup failed: {e}")),
            };
            if token.group == target_group {
                return Outcome::skipped(row.name, "group already matches");
            }
            match api.update_token(&TokenPayload::with_group(&token, target_group)) {
                Ok(()) => Outcome::Success(GroupChange {
                    name: row.name,
                    from: token.group,
                    to: target_group.to_string(),
                }),
                Err(e) => {
                    warn!(name = %row.name, error = %e, "group update failed");
                    Outcome::failure(row.name, format!("update failed: {e}"))
                }
            }
        },
        on_done,
    );
    info!(
        succeeded = report.summary.succeeded,
        skipped = report.summary.skipped,
        failed = report.summary.failed,
        "group update job finished"
    );
    report
}

// ---------------------------------------------------------------------
// Image generation
// ---------------------------------------------------------------------

/// Intermediate events of a submit-and-poll run, emitted from workers.
#[derive(Debug, Clone)]
pub enum TaskEvent<'a> {
    Submitted {
        prompt: &'a str,
        task_id: &'a str,
        latency: Duration,
    },
    Polled {
        task_id: &'a str,
        status: TaskStatus,
        progress: u32,
        latency: Duration,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub prompt: String,
    pub url: String,
    pub elapsed: Duration,
}

/// Run every prompt's pipeline at once and wait for all of them.
pub fn generate_images<E, C>(client: &TaskClient, prompts: Vec<String>, on_event: E, on_done: C) -> BatchReport<GeneratedImage>
where
    E: Fn(TaskEvent<'_>) + Sync,
    C: FnMut(Progress<'_, GeneratedImage>),
{
    let workers = prompts.len();
    run_pool(
        prompts,
        workers,
        |prompt| {
            let mut task_id = String::new();
            let result = client.run_pipeline(
                &prompt,
                |submission| {
                    task_id = submission.task_id.clone();
                    on_event(TaskEvent::Submitted {
                        prompt: &prompt,
                        task_id: &submission.task_id,
                        latency: submission.latency,
                    });
                },
                |id, task, latency| {
                    on_event(TaskEvent::Polled {
                        task_id: id,
                        status: task.status,
                        progress: task.progress(),
                        latency,
                    })
                },
            );
            let label = prompt_label(&prompt);
            match result {
                Ok(PollOutcome::Completed { url, elapsed }) => Outcome::Success(GeneratedImage { prompt, url, elapsed }),
                Ok(PollOutcome::Failed { reason }) => {
                    let reason = reason.unwrap_or_else(|| "task failed".into());
                    warn!(%task_id, %reason, "task failed");
                    Outcome::failure(label, reason)
                }
                Err(e) => {
                    warn!(%task_id, error = %e, "pipeline failed");
                    Outcome::failure(label, e)
                }
            }
        },
        on_done,
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedGeneration {
    pub index: usize,
    pub response_path: PathBuf,
    pub image_path: PathBuf,
    pub latency: Duration,
}

/// One `generateContent` call: archive the raw JSON, then save the image.
pub fn generate_one(
    client: &GeminiClient,
    index: usize,
    prompt: &str,
    reference: Option<&InlineData>,
    out_dir: &Path,
) -> Result<SavedGeneration> {
    let reply = client.generate(prompt, reference)?;
    let latency = reply.latency;
    let response_path = gemini::save_response_json(out_dir, index, &reply.body)?;
    let response = reply.into_response()?;

    let image_path = match gemini::extract_image(&response)? {
        ExtractedImage::Inline { ext, bytes } => gemini::save_image(out_dir, index, &ext, &bytes)?,
        ExtractedImage::Remote(url) => {
            let bytes = client.download(&url)?;
            gemini::save_image(out_dir, index, &remote_extension(&url), &bytes)?
        }
    };
    Ok(SavedGeneration {
        index,
        response_path,
        image_path,
        latency,
    })
}

fn remote_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit_once('.') {
        Some((_, ext)) if !ext.contains('/') && (1..=4).contains(&ext.len()) => {
            match ext.to_ascii_lowercase().as_str() {
                "jpeg" => "jpg".into(),
                other => other.to_string(),
            }
        }
        _ => "png".into(),
    }
}

/// Send every prompt concurrently; each response lands in `out_dir`.
pub fn generate_gemini<C>(
    client: &GeminiClient,
    prompts: Vec<String>,
    reference: Option<&InlineData>,
    out_dir: &Path,
    on_done: C,
) -> BatchReport<SavedGeneration>
where
    C: FnMut(Progress<'_, SavedGeneration>),
{
    let workers = prompts.len();
    run_pool(
        prompts.into_iter().enumerate().collect(),
        workers,
        |(index, prompt)| match generate_one(client, index, &prompt, reference, out_dir) {
            Ok(saved) => Outcome::Success(saved),
            Err(e) => {
                warn!(index, error = %e, "generation failed");
                Outcome::failure(format!("request {index}"), describe(&e))
            }
        },
        on_done,
    )
}

fn describe(err: &ApiError) -> String {
    if err.is_quota_error() {
        format!("quota exhausted: {err}")
    } else {
        err.to_string()
    }
}
