// UI layer: the interactive menu built on `dialoguer`. Each entry asks
// for its parameters (pre-filled from the config, so pressing Enter runs
// the job with the configured values), runs one job from `jobs`, and
// prints per-unit lines plus a summary.

use anyhow::{Context, Result};
use crossterm::style::Stylize;
use dialoguer::{Confirm, Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::{ApiClient, INDEX_MAX_PAGES};
use crate::batch::{Outcome, Progress, Summary};
use crate::config::Config;
use crate::gemini::{GeminiClient, InlineData};
use crate::jobs::{self, CreateTokens, TaskEvent};
use crate::sheet;
use crate::tasks::TaskClient;
use crate::tokens::short_key;

/// Main interactive menu. Runs until the user picks "Exit". A failing job
/// prints its error and returns to the menu.
pub fn main_menu(config: Config) -> Result<()> {
    let items = [
        "Generate images (submit and poll)",
        "Generate images (generateContent)",
        "Create tokens",
        "Delete tokens listed in a spreadsheet",
        "Delete tokens found in a key log",
        "Move tokens to another group",
        "Check token balance",
        "Exit",
    ];
    loop {
        let selection = Select::new().items(&items).default(0).interact()?;
        let outcome = match selection {
            0 => handle_generate_images(&config),
            1 => handle_generate_content(&config),
            2 => handle_create_tokens(&config),
            3 => handle_delete_from_sheet(&config),
            4 => handle_delete_from_log(&config),
            5 => handle_update_group(&config),
            6 => handle_balance(&config),
            _ => break,
        };
        if let Err(e) = outcome {
            println!("{} {:#}", "Error:".red().bold(), e);
        }
    }
    Ok(())
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(120));
    Ok(spinner)
}

fn batch_bar(total: usize) -> Result<ProgressBar> {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len}")?);
    Ok(bar)
}

/// `[3/10] OK name | detail` style line for one finished unit.
fn outcome_line<T>(progress: &Progress<'_, T>, success: impl FnOnce(&T) -> String) -> String {
    let counter = format!("[{}/{}]", progress.processed, progress.total);
    match progress.outcome {
        Outcome::Success(value) => format!("{counter} {} {}", "OK".green(), success(value)),
        Outcome::Failure { label, reason } => {
            format!("{counter} {} {label} | {reason}", "FAIL".red())
        }
        Outcome::Skipped { label, reason } => {
            format!("{counter} {} {label} | {reason}", "SKIP".yellow())
        }
    }
}

fn print_summary(title: &str, summary: &Summary) {
    println!("{}", "=".repeat(60));
    println!("{title} finished in {:.2}s", summary.elapsed.as_secs_f64());
    println!("  {} {}", "succeeded:".green(), summary.succeeded);
    if summary.skipped > 0 {
        println!("  {} {}", "skipped:  ".yellow(), summary.skipped);
    }
    println!("  {} {}", "failed:   ".red(), summary.failed);
}

fn ask_prompts(defaults: &[String]) -> Result<Vec<String>> {
    let joined: String = Input::new()
        .with_prompt("Prompts (separate with ';')")
        .default(defaults.join("; "))
        .interact_text()?;
    Ok(joined
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect())
}

fn ask_path(prompt: &str, default: Option<&str>) -> Result<PathBuf> {
    let mut input = Input::<String>::new();
    input.with_prompt(prompt);
    if let Some(d) = default {
        input.default(d.to_string());
    }
    let raw = input.interact_text()?;
    Ok(PathBuf::from(raw.trim().trim_matches('"')))
}

fn handle_generate_images(config: &Config) -> Result<()> {
    let client = TaskClient::from_config(&config.task_api)?;
    let prompts = ask_prompts(&config.task_api.prompts)?;
    if prompts.is_empty() {
        println!("No prompts given.");
        return Ok(());
    }

    println!("Running {} tasks in parallel...", prompts.len());
    let spinner = spinner("waiting for tasks")?;
    let report = jobs::generate_images(
        &client,
        prompts,
        |event| match event {
            TaskEvent::Submitted { prompt, task_id, latency } => spinner.println(format!(
                "{} task {task_id} | {:.2}ms | {prompt}",
                "submitted".green(),
                latency.as_secs_f64() * 1000.0
            )),
            TaskEvent::Polled { task_id, status, progress, latency } => spinner.println(format!(
                "{} task {task_id} | {progress}% | {status} | {:.2}ms",
                "polling".cyan(),
                latency.as_secs_f64() * 1000.0
            )),
        },
        |p| {
            spinner.println(outcome_line(&p, |img| {
                format!("{:.2}s | {}", img.elapsed.as_secs_f64(), img.url)
            }))
        },
    );
    spinner.finish_and_clear();
    print_summary("Image generation", &report.summary);
    Ok(())
}

fn handle_generate_content(config: &Config) -> Result<()> {
    let client = GeminiClient::from_config(&config.gemini)?;
    let prompts = ask_prompts(&config.gemini.prompts)?;
    if prompts.is_empty() {
        println!("No prompts given.");
        return Ok(());
    }
    let reference: String = Input::new()
        .with_prompt("Reference image (optional)")
        .allow_empty(true)
        .interact_text()?;
    let reference = match reference.trim() {
        "" => None,
        path => Some(
            InlineData::from_path(Path::new(path.trim_matches('"')))
                .with_context(|| format!("Failed to read reference image {path}"))?,
        ),
    };
    let out_dir = config.gemini.output_dir.clone();

    println!("Sending {} requests...", prompts.len());
    let spinner = spinner("waiting for responses")?;
    let report = jobs::generate_gemini(&client, prompts, reference.as_ref(), &out_dir, |p| {
        spinner.println(outcome_line(&p, |saved| {
            format!(
                "request {} | {:.2}s | {} | {}",
                saved.index,
                saved.latency.as_secs_f64(),
                saved.image_path.display(),
                saved.response_path.display()
            )
        }))
    });
    spinner.finish_and_clear();
    print_summary("Generation", &report.summary);
    println!("Finished at {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    Ok(())
}

fn handle_create_tokens(config: &Config) -> Result<()> {
    let api = ApiClient::from_config(&config.admin)?;
    let admin = &config.admin;
    let count: usize = Input::new()
        .with_prompt("How many tokens")
        .default(admin.create_count)
        .interact_text()?;
    let quota: f64 = Input::new()
        .with_prompt("Quota per token")
        .default(admin.quota)
        .interact_text()?;
    let group: String = Input::new()
        .with_prompt("Group")
        .default(admin.group.clone())
        .interact_text()?;

    let job = CreateTokens {
        count,
        quota,
        group,
        date: jobs::today(),
        workers: admin.max_workers,
    };
    let path = job.output_path();
    println!(
        "Creating {count} tokens on {} workers, saving to {}",
        job.workers,
        path.display()
    );
    if !Confirm::new().with_prompt("Continue?").default(true).interact()? {
        return Ok(());
    }

    let bar = batch_bar(count)?;
    let report = jobs::create_tokens(&api, &job, |p| {
        bar.inc(1);
        // Successes are only echoed every tenth token.
        let echo = match p.outcome {
            Outcome::Success(_) => p.processed % 10 == 0 || p.processed == p.total,
            _ => true,
        };
        if echo {
            bar.println(outcome_line(&p, |row| row.name.clone()));
        }
    });
    bar.finish_and_clear();
    print_summary("Token creation", &report.summary);

    jobs::save_created(&path, &report.successes)
        .with_context(|| format!("Failed to save {} (is it open elsewhere?)", path.display()))?;
    println!("Saved {} tokens to {}", report.successes.len(), path.display());
    Ok(())
}

fn handle_delete_from_sheet(config: &Config) -> Result<()> {
    let api = ApiClient::from_config(&config.admin)?;
    let path = ask_path("Spreadsheet with token ids", None)?;
    let column: String = Input::new()
        .with_prompt("Column")
        .default("A".to_string())
        .interact_text()?;
    let has_header = Confirm::new()
        .with_prompt("First row is a header?")
        .default(true)
        .interact()?;

    let ids = sheet::read_column(&path, &column, has_header)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if ids.is_empty() {
        println!("No ids found, nothing to delete.");
        return Ok(());
    }
    println!("Loaded {} ids from {}", ids.len(), path.display());
    if !Confirm::new()
        .with_prompt(format!("Delete {} tokens?", ids.len()))
        .default(false)
        .interact()?
    {
        return Ok(());
    }

    let bar = batch_bar(ids.len())?;
    let report = jobs::delete_by_ids(&api, ids, config.admin.max_workers, |p| {
        bar.inc(1);
        bar.println(outcome_line(&p, |id| format!("deleted id {id}")));
    });
    bar.finish_and_clear();
    print_summary("Delete", &report.summary);
    Ok(())
}

fn handle_delete_from_log(config: &Config) -> Result<()> {
    let api = ApiClient::from_config(&config.admin)?;
    let path = ask_path("Key log file", Some("key.txt"))?;
    let keys = sheet::read_key_log(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if keys.is_empty() {
        println!("No keys found. Lines should look like: 'anything | sk-xxxxx'");
        return Ok(());
    }
    println!("Extracted {} keys from {}", keys.len(), path.display());

    let spinner = spinner("fetching all tokens from the server")?;
    let index = api.fetch_key_index(INDEX_MAX_PAGES);
    spinner.finish_and_clear();
    let index = index.context("Failed to list server tokens")?;
    println!("Server currently holds {} tokens", index.len());

    let matched = keys.iter().filter(|k| index.get(k).is_some()).count();
    if matched == 0 {
        println!("None of the extracted keys exist on the server, nothing to delete.");
        return Ok(());
    }
    if !Confirm::new()
        .with_prompt(format!("Delete {matched} tokens?"))
        .default(false)
        .interact()?
    {
        return Ok(());
    }

    let bar = batch_bar(keys.len())?;
    let report = jobs::delete_by_keys(&api, keys, &index, config.admin.max_workers, |p| {
        bar.inc(1);
        bar.println(outcome_line(&p, |key| format!("deleted {key}")));
    });
    bar.finish_and_clear();
    print_summary("Delete", &report.summary);
    Ok(())
}

fn handle_update_group(config: &Config) -> Result<()> {
    let api = ApiClient::from_config(&config.admin)?;
    let path = ask_path("Token spreadsheet (name, key)", None)?;
    let target: String = Input::new()
        .with_prompt("Target group")
        .default(config.admin.target_group.clone())
        .interact_text()?;

    let rows = sheet::read_token_rows(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if rows.is_empty() {
        println!("No (name, key) rows found.");
        return Ok(());
    }
    println!(
        "Found {} tokens | target group: {target} | workers: {}",
        rows.len(),
        config.admin.max_workers
    );

    let bar = batch_bar(rows.len())?;
    let report = jobs::update_groups(&api, rows, &target, config.admin.max_workers, |p| {
        bar.inc(1);
        bar.println(outcome_line(&p, |change| {
            format!("{} | {} -> {}", change.name, change.from, change.to)
        }));
    });
    bar.finish_and_clear();
    print_summary("Group update", &report.summary);
    Ok(())
}

fn handle_balance(config: &Config) -> Result<()> {
    let api = ApiClient::from_config(&config.admin)?;
    let key: String = Input::new().with_prompt("Token key").interact_text()?;
    let key = key.trim();
    let balance = api
        .balance(key)
        .with_context(|| format!("Failed to look up {}", short_key(key)))?;
    println!("Remaining: {}", balance.remaining);
    println!("Used:      {}", balance.used);
    Ok(())
}
