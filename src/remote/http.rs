use reqwest::{Client, Response};
use serde_json::Value;
use urlencoding::encode;

use super::{children_of, Page, Remote};
use crate::error::{FirebakError, Result};

/// REST client for a single Firebase Realtime Database.
#[derive(Debug, Clone)]
pub struct FirebaseClient {
    http: Client,
    base_url: String,
    secret: String,
}

impl FirebaseClient {
    /// `name` is the database name, e.g. `myapp` for `https://myapp.firebaseio.com`.
    pub fn new(name: &str, secret: &str) -> Result<Self> {
        Self::with_base_url(&format!("https://{name}.firebaseio.com"), secret)
    }

    pub fn with_base_url(base_url: &str, secret: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("firebak/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| transport_error(base_url, err))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `<base>/<encoded segments>.json`; the root is `<base>/.json`.
    fn node_url(&self, path: &str) -> String {
        let encoded = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}.json", self.base_url, encoded)
    }

    fn rules_url(&self) -> String {
        format!("{}/.settings/rules/.json", self.base_url)
    }

    async fn read(&self, url: &str, params: &[(&str, String)]) -> Result<(Vec<u8>, Value)> {
        tracing::debug!(url, "GET");
        let response = self
            .http
            .get(url)
            .query(&[("auth", self.secret.as_str())])
            .query(params)
            .send()
            .await
            .map_err(|err| transport_error(url, err))?;
        let body = checked_body(url, response).await?;
        let value = serde_json::from_slice(&body)
            .map_err(|err| FirebakError::network(url, format!("invalid JSON response: {err}")))?;
        Ok((body, value))
    }

    async fn write(&self, url: &str, body: String) -> Result<()> {
        tracing::debug!(url, bytes = body.len(), "PUT");
        let response = self
            .http
            .put(url)
            .query(&[("auth", self.secret.as_str())])
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| transport_error(url, err))?;
        checked_body(url, response).await?;
        Ok(())
    }
}

async fn checked_body(url: &str, response: Response) -> Result<Vec<u8>> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FirebakError::network(url, format!("{status}: {body}")));
    }
    response
        .bytes()
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(|err| transport_error(url, err))
}

/// reqwest errors print the request URL, which carries `?auth=<secret>`.
fn transport_error(url: &str, err: reqwest::Error) -> FirebakError {
    FirebakError::network(url, err.without_url())
}

/// Firebase expects `orderBy`/`startAt` arguments as JSON strings.
fn json_quote(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

impl Remote for FirebaseClient {
    async fn authenticate(&self) -> Result<()> {
        self.get_shallow("").await.map(|_| ())
    }

    async fn fetch_page(&self, path: &str, start_at: &str, limit: usize) -> Result<Page> {
        let url = self.node_url(path);
        let (body, value) = self
            .read(
                &url,
                &[
                    ("format", "export".to_string()),
                    ("orderBy", json_quote("$key")),
                    ("startAt", json_quote(start_at)),
                    ("limitToFirst", limit.to_string()),
                ],
            )
            .await?;
        Ok(Page {
            entries: children_of(value),
            bytes: body.len(),
        })
    }

    async fn get_shallow(&self, path: &str) -> Result<Value> {
        let url = self.node_url(path);
        // The REST API rejects `shallow` combined with other query parameters.
        self.read(&url, &[("shallow", "true".to_string())])
            .await
            .map(|(_, value)| value)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let url = self.node_url(path);
        self.read(&url, &[]).await.map(|(_, value)| value)
    }

    async fn set(&self, path: &str, value: &Value) -> Result<()> {
        self.write(&self.node_url(path), value.to_string()).await
    }

    async fn get_rules(&self) -> Result<String> {
        let url = self.rules_url();
        tracing::debug!(url, "GET rules");
        let response = self
            .http
            .get(&url)
            .query(&[("auth", self.secret.as_str())])
            .send()
            .await
            .map_err(|err| transport_error(&url, err))?;
        let body = checked_body(&url, response).await?;
        String::from_utf8(body)
            .map_err(|err| FirebakError::network(&url, format!("rules are not UTF-8: {err}")))
    }

    async fn set_rules(&self, rules: &str) -> Result<()> {
        self.write(&self.rules_url(), rules.to_string()).await
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!(base_url = %self.base_url, "closing database session");
        Ok(())
    }
}
