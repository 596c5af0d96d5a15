//! Pipeline events and the document they are recorded on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Free-form metadata attached to a document and carried through events.
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ─── Events ──────────────────────────────────────────────────────────────────

/// Discriminant of an [`Event`], used to check stage wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Received,
    Ingested,
    Enhanced,
    Assembled,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Received => "received",
            EventKind::Ingested => "ingested",
            EventKind::Enhanced => "enhanced",
            EventKind::Assembled => "assembled",
        })
    }
}

/// One stage output. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Received(Received),
    Ingested(Ingested),
    Enhanced(Enhanced),
    Assembled(Assembled),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Received(_) => EventKind::Received,
            Event::Ingested(_) => EventKind::Ingested,
            Event::Enhanced(_) => EventKind::Enhanced,
            Event::Assembled(_) => EventKind::Assembled,
        }
    }
}

/// Parsed document handed over by the document-processing collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Received {
    pub document_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Where the document came from, if it is a local file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
}

impl Received {
    /// A received document with a fresh id.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            document_id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            metadata: Metadata::new(),
            source_path: None,
        }
    }

    pub fn with_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = document_id.into();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_source_path(mut self, path: impl Into<String>) -> Self {
        self.source_path = Some(path.into());
        self
    }
}

/// Validated document with derived title and size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingested {
    pub title: String,
    pub content: String,
    /// Content size in characters.
    pub content_size: usize,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
}

/// A question and its answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

/// Document with generated summary, key points, Q&A, and topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enhanced {
    pub title: String,
    pub content_size: usize,
    pub summary: String,
    pub key_points: Vec<String>,
    pub qa: Vec<QaPair>,
    pub topics: Vec<String>,
    pub metadata: Metadata,
}

/// Final structured notebook. Never formatted for display here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assembled {
    pub title: String,
    pub summary: String,
    pub qa_pairs: Vec<QaPair>,
    pub highlights: Vec<String>,
    pub topics: Vec<String>,
    pub metadata: Metadata,
}

// ─── Document ────────────────────────────────────────────────────────────────

/// A document moving through the pipeline.
///
/// The event log only grows; entries are stage outputs in stage order.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    id: String,
    content: String,
    metadata: Metadata,
    events: Vec<Event>,
}

impl Document {
    pub fn from_received(received: &Received) -> Self {
        Self {
            id: received.document_id.clone(),
            content: received.content.clone(),
            metadata: received.metadata.clone(),
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn final_event(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Consume the document, keeping only its final event.
    pub fn into_final_event(mut self) -> Option<Event> {
        self.events.pop()
    }

    pub(crate) fn append(&mut self, event: Event) {
        self.events.push(event);
    }

    pub(crate) fn into_events(self) -> Vec<Event> {
        self.events
    }
}
