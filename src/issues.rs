use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::constants::USER_AGENT;
use crate::geo::Coordinate;

/// Opaque issue identifier. The backend sends numbers; other sources may
/// send strings, so both are accepted and kept as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct IssueId(String);

impl IssueId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IssueId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IssueId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for IssueId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

impl<'de> Deserialize<'de> for IssueId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(s) => Self(s),
            RawId::Unsigned(n) => Self(n.to_string()),
            RawId::Signed(n) => Self(n.to_string()),
        })
    }
}

/// An issue as listed by the remote service. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueSummary {
    pub id: IssueId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub vouch_count: Option<u32>,
}

impl IssueSummary {
    pub fn new(id: impl Into<IssueId>, title: impl Into<String>, coordinate: Option<Coordinate>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            latitude: coordinate.map(|c| c.latitude),
            longitude: coordinate.map(|c| c.longitude),
            category: None,
            status: None,
            created_at: None,
            vouch_count: None,
        }
    }

    /// The issue's location, if it has a usable one.
    pub fn coordinate(&self) -> Option<Coordinate> {
        let c = Coordinate::new(self.latitude?, self.longitude?);
        c.is_valid().then_some(c)
    }
}

/// The external issue-fetch collaborator.
pub trait IssueSource: Send + Sync + 'static {
    fn fetch(&self) -> impl Future<Output = Result<Vec<IssueSummary>>> + Send;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IssuesResponse {
    Envelope { issues: Vec<IssueSummary> },
    Bare(Vec<IssueSummary>),
}

pub fn parse_issues(body: &[u8]) -> Result<Vec<IssueSummary>> {
    let response: IssuesResponse =
        serde_json::from_slice(body).context("Unrecognised issues payload")?;
    Ok(match response {
        IssuesResponse::Envelope { issues } => issues,
        IssuesResponse::Bare(issues) => issues,
    })
}

pub struct HttpIssueSource {
    client: reqwest::Client,
    url: String,
}

impl HttpIssueSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build issues HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl IssueSource for HttpIssueSource {
    fn fetch(&self) -> impl Future<Output = Result<Vec<IssueSummary>>> + Send {
        async move {
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .with_context(|| format!("Cannot reach issues service at {}", self.url))?;

            let status = response.status();
            if !status.is_success() {
                bail!("Issues service returned {}", status);
            }

            let body = response.bytes().await?;
            let issues = parse_issues(&body)?;
            debug!("Fetched {} issues", issues.len());
            Ok(issues)
        }
    }
}
