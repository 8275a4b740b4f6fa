//! Firestore REST implementation of [`DocumentClient`].
//!
//! Records are stored with typed Firestore values:
//! `position` (integer), `event_id` and `tenant_id` (strings), and `payload`
//! (the event JSON as a string). The document id is the zero-padded position,
//! so a create with an explicit `documentId` is a create-if-absent.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use timeline_protocol::{TimelineError, TimelineResult};
use timeline_routing::DocumentStoreConfig;
use tracing::{debug, instrument};

use crate::document::{DocumentClient, DocumentRecord, InsertOutcome};

const DEFAULT_ENDPOINT: &str = "https://firestore.googleapis.com/v1";
const PAGE_SIZE: usize = 300;

#[derive(Debug, Clone)]
pub struct FirestoreClient {
    http: reqwest::Client,
    documents_url: String,
    access_token: Option<String>,
}

impl FirestoreClient {
    pub fn new(
        endpoint: &str,
        project_id: &str,
        database: &str,
        access_token: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            documents_url: format!(
                "{}/projects/{project_id}/databases/{database}/documents",
                endpoint.trim_end_matches('/')
            ),
            access_token,
        }
    }

    /// Fails when the configured token env var is not set.
    pub fn from_config(config: &DocumentStoreConfig) -> TimelineResult<Self> {
        let access_token = match &config.access_token_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                TimelineError::Storage(format!(
                    "document store access token env var {var} is not set"
                ))
            })?),
            None => None,
        };
        Ok(Self::new(
            config.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT),
            &config.project_id,
            &config.database,
            access_token,
        ))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn encode(record: &DocumentRecord) -> TimelineResult<Value> {
        Ok(json!({
            "fields": {
                "position": { "integerValue": record.position.to_string() },
                "event_id": { "stringValue": record.event_id },
                "tenant_id": { "stringValue": record.tenant_id },
                "payload": { "stringValue": serde_json::to_string(&record.payload)? },
            }
        }))
    }
}

#[derive(Debug, Deserialize)]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<FirestoreDocument>,
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FirestoreDocument {
    name: String,
    #[serde(default)]
    fields: HashMap<String, FirestoreValue>,
}

#[derive(Debug, Deserialize)]
struct FirestoreValue {
    #[serde(default, rename = "stringValue")]
    string_value: Option<String>,
    #[serde(default, rename = "integerValue")]
    integer_value: Option<String>,
}

impl FirestoreDocument {
    fn string_field(&self, field: &str) -> TimelineResult<&str> {
        self.fields
            .get(field)
            .and_then(|value| value.string_value.as_deref())
            .ok_or_else(|| self.missing(field))
    }

    fn missing(&self, field: &str) -> TimelineError {
        TimelineError::Serialization(format!("document {} has no {field} field", self.name))
    }

    fn into_record(self) -> TimelineResult<DocumentRecord> {
        let position = self
            .fields
            .get("position")
            .and_then(|value| value.integer_value.as_deref())
            .and_then(|raw| raw.parse::<u64>().ok())
            .ok_or_else(|| self.missing("position"))?;
        let payload = serde_json::from_str(self.string_field("payload")?)?;
        Ok(DocumentRecord {
            position,
            event_id: self.string_field("event_id")?.to_owned(),
            tenant_id: self.string_field("tenant_id")?.to_owned(),
            payload,
        })
    }
}

fn transport_error(error: reqwest::Error) -> TimelineError {
    TimelineError::Storage(format!("document store request failed: {error}"))
}

#[async_trait]
impl DocumentClient for FirestoreClient {
    #[instrument(skip(self, record), fields(position = record.position))]
    async fn insert(
        &self,
        collection: &str,
        record: &DocumentRecord,
    ) -> TimelineResult<InsertOutcome> {
        let url = format!("{}/{collection}", self.documents_url);
        let document_id = format!("{:020}", record.position);
        let response = self
            .authorize(self.http.post(&url))
            .query(&[("documentId", document_id.as_str())])
            .json(&Self::encode(record)?)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(InsertOutcome::Inserted),
            StatusCode::CONFLICT => Ok(InsertOutcome::Conflict),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(TimelineError::Storage(format!(
                    "document store insert into {collection} failed with {status}: {body}"
                )))
            }
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, collection: &str) -> TimelineResult<Vec<DocumentRecord>> {
        let url = format!("{}/{collection}", self.documents_url);
        let page_size = PAGE_SIZE.to_string();
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("orderBy", "position"), ("pageSize", page_size.as_str())];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let response = self
                .authorize(self.http.get(&url))
                .query(&query)
                .send()
                .await
                .map_err(transport_error)?;

            if response.status() == StatusCode::NOT_FOUND {
                break;
            }
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(TimelineError::Storage(format!(
                    "document store list of {collection} failed with {status}: {body}"
                )));
            }

            let page: ListDocumentsResponse = response.json().await.map_err(transport_error)?;
            for document in page.documents {
                records.push(document.into_record()?);
            }

            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(count = records.len(), "documents listed");
        Ok(records)
    }
}
