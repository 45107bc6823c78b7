//! Qdrant REST backend.
//!
//! Talks to `POST /collections/{name}/points/search` and `GET /collections`.
//! When no collection is pinned in the config, the collection is picked per
//! request from the curriculum and subject (see [`resolve_collection`]).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{IndexQuery, IndexResults, SearchFilters, VectorIndex};
use crate::error::BackendError;
use crate::model::{FragmentMetadata, RetrievedFragment, SourceType};

/// Connection settings for a Qdrant instance.
#[derive(Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// Fixed collection; `None` resolves one per request.
    pub collection: Option<String>,
    /// Send subject, grade and source type as a payload filter. Off by
    /// default because ingested payloads are not guaranteed to carry them;
    /// the retriever still drops points whose payload names another
    /// subject or grade.
    pub filter_payload: bool,
    pub timeout: Duration,
}

impl std::fmt::Debug for QdrantConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("collection", &self.collection)
            .field("filter_payload", &self.filter_payload)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            api_key: None,
            collection: None,
            filter_payload: false,
            timeout: Duration::from_secs(30),
        }
    }
}

fn normalise(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Pick the collection that best matches a curriculum and subject.
///
/// Candidates are tried in order: `{curriculum}_{subject}`, `*_{subject}`,
/// `{curriculum}_*`, `{subject}`, `*{subject}*`, any name containing the
/// curriculum, then the first collection. Among several wildcard matches a
/// name containing both curriculum and subject wins. Names are compared
/// lowercased with spaces replaced by underscores.
pub fn resolve_collection(collections: &[String], curriculum: &str, subject: &str) -> Option<String> {
    if collections.is_empty() {
        return None;
    }
    let cur = normalise(curriculum);
    let subj = normalise(subject);

    let exact = format!("{cur}_{subj}");
    if let Some(c) = collections.iter().find(|c| **c == exact) {
        return Some(c.clone());
    }

    let suffix = format!("_{subj}");
    let prefix = format!("{cur}_");
    let wildcards: [&dyn Fn(&str) -> bool; 3] = [
        &|name: &str| name.ends_with(&suffix),
        &|name: &str| name.starts_with(&prefix),
        &|name: &str| name == subj,
    ];
    for (i, matches) in wildcards.iter().enumerate() {
        let found: Vec<&String> = collections.iter().filter(|c| matches(c.as_str())).collect();
        if found.is_empty() {
            continue;
        }
        if i == 2 {
            return Some(found[0].clone());
        }
        let both = found.iter().find(|c| c.contains(&cur) && c.contains(&subj));
        return Some((*both.unwrap_or(&found[0])).clone());
    }

    let containing: Vec<&String> = collections.iter().filter(|c| c.contains(&subj)).collect();
    if !containing.is_empty() {
        let both = containing.iter().find(|c| c.contains(&cur));
        return Some((*both.unwrap_or(&containing[0])).clone());
    }

    collections
        .iter()
        .find(|c| c.contains(&cur))
        .or_else(|| collections.first())
        .cloned()
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SearchBody<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Value>,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<serde_json::Map<String, Value>>,
}

#[derive(Deserialize)]
struct CollectionsResponse {
    result: CollectionsResult,
}

#[derive(Deserialize)]
struct CollectionsResult {
    collections: Vec<CollectionDescription>,
}

#[derive(Deserialize)]
struct CollectionDescription {
    name: String,
}

fn payload_filter(filters: &SearchFilters) -> Option<Value> {
    let mut must = Vec::new();
    if let Some(subject) = &filters.subject {
        must.push(json!({ "key": "subject", "match": { "value": subject } }));
    }
    if let Some(grade) = &filters.grade {
        must.push(json!({ "key": "grade", "match": { "value": grade } }));
    }
    if !filters.source_types.is_empty() {
        let any: Vec<&str> = filters.source_types.iter().map(SourceType::as_str).collect();
        must.push(json!({ "key": "source_type", "match": { "any": any } }));
    }
    if must.is_empty() {
        None
    } else {
        Some(json!({ "must": must }))
    }
}

fn string_field(payload: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| payload.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Turn a scored point into a fragment. Text is read from `text` or
/// `content`, falling back to the `_node_content` JSON blob that
/// LlamaIndex-ingested collections store.
fn point_to_fragment(point: ScoredPoint) -> Option<RetrievedFragment> {
    let payload = point.payload.unwrap_or_default();
    let text = string_field(&payload, &["text", "content"]).or_else(|| {
        let node = payload.get("_node_content")?.as_str()?;
        let node: Value = serde_json::from_str(node).ok()?;
        node.get("text")?.as_str().map(str::to_string)
    })?;

    let id = match &point.id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let source_type = string_field(&payload, &["source_type", "type"])
        .and_then(|s| s.parse().ok())
        .unwrap_or(SourceType::CurriculumStandard);
    let tags = payload
        .get("tags")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let metadata = FragmentMetadata {
        subject: string_field(&payload, &["subject"]),
        grade: string_field(&payload, &["grade"]),
        tags,
    };
    Some(RetrievedFragment::new(id, source_type, text, point.score, metadata))
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// [`VectorIndex`] backed by a Qdrant server.
#[derive(Debug, Clone)]
pub struct QdrantIndex {
    config: QdrantConfig,
    client: Client,
}

impl QdrantIndex {
    pub fn new(config: QdrantConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.url.trim_end_matches('/'))
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn collection_for(&self, filters: &SearchFilters) -> Result<String, BackendError> {
        if let Some(c) = &self.config.collection {
            return Ok(c.clone());
        }
        let names = self.list_collections().await?;
        let resolved = resolve_collection(
            &names,
            filters.curriculum.as_deref().unwrap_or_default(),
            filters.subject.as_deref().unwrap_or_default(),
        )
        .ok_or_else(|| BackendError::Status {
            status: 404,
            message: "no collections found in Qdrant".to_string(),
        })?;
        tracing::debug!(collection = %resolved, "resolved Qdrant collection");
        Ok(resolved)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        message: message.chars().take(300).collect(),
    })
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn name(&self) -> &str {
        "qdrant"
    }

    async fn search(&self, query: IndexQuery<'_>) -> Result<IndexResults, BackendError> {
        let collection = self.collection_for(query.filters).await?;
        let body = SearchBody {
            vector: query.vector,
            limit: query.limit,
            with_payload: true,
            filter: if self.config.filter_payload {
                payload_filter(query.filters)
            } else {
                None
            },
        };
        let request = self
            .client
            .post(self.url(&format!("/collections/{collection}/points/search")))
            .json(&body);
        let response = check_status(self.authed(request).send().await?).await?;
        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        let total = parsed.result.len();
        let fragments: Vec<RetrievedFragment> =
            parsed.result.into_iter().filter_map(point_to_fragment).collect();
        if fragments.len() < total {
            tracing::debug!(
                skipped = total - fragments.len(),
                "Qdrant points without text payload skipped"
            );
        }
        Ok(IndexResults::in_collection(fragments, collection))
    }

    async fn list_collections(&self) -> Result<Vec<String>, BackendError> {
        let request = self.client.get(self.url("/collections"));
        let response = check_status(self.authed(request).send().await?).await?;
        let parsed: CollectionsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(parsed.result.collections.into_iter().map(|c| c.name).collect())
    }
}
