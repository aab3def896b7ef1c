// Admin API client: a small blocking HTTP client for the token
// endpoints (`/api/token/...`). Every call opens its own request on the
// shared `reqwest` client, so one `ApiClient` can be used from many
// worker threads at once.

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AdminConfig;
use crate::error::{ApiError, Result};
use crate::tokens::{Balance, KeyIndex, Token, TokenList, TokenPayload};

/// Pages fetched when building a full key index.
pub const INDEX_MAX_PAGES: u32 = 200;
/// Pages scanned when a name search does not find a token.
pub const LOOKUP_MAX_PAGES: u32 = 10;

/// Blocking client for the token administration API. Holds the shared
/// `reqwest` client with the `new-api-user` / `Authorization` headers
/// baked in.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    list_timeout: Duration,
    page_size: u32,
}

/// Common response wrapper: `{ success, message, data }`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<Option<T>> {
        if self.success {
            Ok(self.data)
        } else {
            Err(ApiError::Rejected(
                self.message.unwrap_or_else(|| "request was not successful".into()),
            ))
        }
    }
}

impl ApiClient {
    fn with_timeouts(
        base_url: &str,
        user_id: &str,
        access_token: &str,
        request_timeout: Duration,
        list_timeout: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "new-api-user",
            HeaderValue::from_str(user_id).map_err(|_| ApiError::InvalidHeader("new-api-user"))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(access_token).map_err(|_| ApiError::InvalidHeader("Authorization"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()?;
        Ok(ApiClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            list_timeout,
            page_size: 100,
        })
    }

    /// Build a client from the `[admin]` config section. Fails early if
    /// credentials are missing.
    pub fn from_config(config: &AdminConfig) -> Result<Self> {
        let (user, token) = config.credentials()?;
        let mut api = Self::with_timeouts(
            &config.base_url,
            user,
            token,
            Duration::from_secs(config.request_timeout_secs),
            Duration::from_secs(config.list_timeout_secs),
        )?;
        api.page_size = config.page_size.max(1);
        Ok(api)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Create a token and return the key the server generated for it.
    pub fn create_token(&self, payload: &TokenPayload) -> Result<String> {
        debug!(name = %payload.name, "creating token");
        let res = self.client.post(self.url("/api/token/")).json(payload).send()?;
        let data: Option<String> = read_envelope(res, &[StatusCode::OK, StatusCode::CREATED])?;
        data.ok_or_else(|| ApiError::Malformed("create response has no key in `data`".into()))
    }

    /// DELETE `/api/token/{id}/`. The body is not inspected.
    pub fn delete_token(&self, id: &str) -> Result<()> {
        debug!(id, "deleting token");
        let res = self.client.delete(self.url(&format!("/api/token/{id}/"))).send()?;
        match res.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            status => Err(status_error(status, res)),
        }
    }

    /// PUT the full token record back.
    pub fn update_token(&self, payload: &TokenPayload) -> Result<()> {
        debug!(id = ?payload.id, group = %payload.group, "updating token");
        let res = self.client.put(self.url("/api/token/")).json(payload).send()?;
        read_envelope::<serde_json::Value>(res, &[StatusCode::OK, StatusCode::CREATED])?;
        Ok(())
    }

    /// One page of the token listing. Pages are zero-based.
    pub fn list_tokens(&self, page: u32) -> Result<Vec<Token>> {
        debug!(page, "listing tokens");
        let res = self
            .client
            .get(self.url("/api/token/"))
            .query(&[("p", page), ("size", self.page_size)])
            .timeout(self.list_timeout)
            .send()?;
        let list: Option<TokenList> = read_envelope(res, &[StatusCode::OK])?;
        Ok(list.map(TokenList::into_items).unwrap_or_default())
    }

    /// `/api/token/search`; `key` narrows the search to one token key.
    pub fn search_tokens(&self, keyword: &str, key: Option<&str>) -> Result<Vec<Token>> {
        debug!(keyword, "searching tokens");
        let mut req = self
            .client
            .get(self.url("/api/token/search"))
            .query(&[("keyword", keyword)]);
        if let Some(key) = key {
            req = req.query(&[("token", key)]);
        }
        let res = req.send()?;
        let list: Option<TokenList> = read_envelope(res, &[StatusCode::OK])?;
        Ok(list.map(TokenList::into_items).unwrap_or_default())
    }

    /// Walk every page and index tokens by key. Paging stops at an empty
    /// or short page, or after `max_pages`. A failure on a later page
    /// keeps what was collected so far.
    pub fn fetch_key_index(&self, max_pages: u32) -> Result<KeyIndex> {
        let mut index = KeyIndex::new();
        for page in 0..max_pages {
            let items = match self.list_tokens(page) {
                Ok(items) => items,
                Err(e) if page == 0 => return Err(e),
                Err(e) => {
                    warn!(page, error = %e, "stopping token listing early");
                    break;
                }
            };
            if items.is_empty() {
                break;
            }
            index.extend(&items);
            if items.len() < self.page_size as usize {
                break;
            }
        }
        Ok(index)
    }

    /// Find the full record for a token: name search first, then a
    /// bounded scan of the listing.
    pub fn find_token(&self, name: Option<&str>, key: &str, max_pages: u32) -> Result<Option<Token>> {
        if let Some(name) = name {
            match self.search_tokens(name, None) {
                Ok(found) => {
                    if let Some(token) = found.into_iter().find(|t| t.matches(Some(name), key)) {
                        return Ok(Some(token));
                    }
                }
                Err(e) => debug!(name, error = %e, "search failed, falling back to listing"),
            }
        }

        for page in 0..max_pages {
            let items = self.list_tokens(page)?;
            if items.is_empty() {
                break;
            }
            let short = items.len() < self.page_size as usize;
            if let Some(token) = items.into_iter().find(|t| t.matches(name, key)) {
                return Ok(Some(token));
            }
            if short {
                break;
            }
        }
        Ok(None)
    }

    /// Remaining/used quota of the token with this key.
    pub fn balance(&self, key: &str) -> Result<Balance> {
        let found = self.search_tokens("", Some(key))?;
        found
            .first()
            .map(Token::balance)
            .ok_or_else(|| ApiError::Malformed(format!("no token found for key {key}")))
    }
}

fn status_error(status: StatusCode, res: Response) -> ApiError {
    let body = res.text().unwrap_or_default();
    ApiError::Status { status, body }
}

/// Check the status against `ok`, then unwrap the `{success, data}` envelope.
fn read_envelope<T: DeserializeOwned>(res: Response, ok: &[StatusCode]) -> Result<Option<T>> {
    let status = res.status();
    if !ok.contains(&status) {
        return Err(status_error(status, res));
    }
    let text = res.text()?;
    let envelope: Envelope<T> = serde_json::from_str(&text)
        .map_err(|e| ApiError::Malformed(format!("{e}: {text}")))?;
    envelope.into_data()
}
