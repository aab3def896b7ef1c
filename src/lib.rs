// Library root
// -----------
// The binary (`main.rs`) drives these modules from an interactive menu;
// everything below `ui` is usable without a terminal, which is how the
// tests exercise it.
//
// Module responsibilities:
// - `config`: layered settings (defaults, TOML file, environment).
// - `error`: the `ApiError` type returned by every client.
// - `api`: blocking client for the token administration endpoints.
// - `tokens`: token records, payloads and key/name helpers.
// - `tasks`: submit-and-poll client for the asynchronous image API.
// - `gemini`: client for the synchronous `generateContent` image API.
// - `batch`: bounded worker pool with success/failure/skip counting.
// - `sheet`: spreadsheet import/export and key-log parsing.
// - `jobs`: the runnable jobs, one per menu entry.
// - `ui`: terminal menu and progress output.
pub mod api;
pub mod batch;
pub mod config;
pub mod error;
pub mod gemini;
pub mod jobs;
pub mod sheet;
pub mod tasks;
pub mod tokens;
pub mod ui;
