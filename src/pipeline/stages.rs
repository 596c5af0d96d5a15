//! The document stages: ingest → enhance → assemble.
//!
//! Tool servers are consulted best effort by default: a failed lookup is
//! recorded in the event's metadata and the stage carries on. A stage built
//! with [`ToolUse::Required`] propagates tool failures instead.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::tool_client::{ToolResult, ToolValue};

use super::errors::StageError;
use super::stage::{Stage, StageContext};
use super::types::{Assembled, Enhanced, Event, EventKind, Ingested, Metadata, QaPair};

/// Server names the stages talk to.
pub const FILESYSTEM_SERVER: &str = "filesystem";
pub const MEMORY_SERVER: &str = "memory";

const MAX_TITLE_CHARS: usize = 120;
const MEMORY_OBSERVATION_CHARS: usize = 1000;
const MAX_RELATIONS: usize = 10;
const KEY_POINT_RELATIONS: usize = 3;
const KEY_POINT_LABEL_CHARS: usize = 50;
const MAX_HIGHLIGHTS: usize = 5;

/// How a stage treats tool-server failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolUse {
    /// Skip tools entirely.
    Off,
    /// Record failures in metadata and continue.
    #[default]
    BestEffort,
    /// Fail the stage on any tool failure.
    Required,
}

fn chars_prefix(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn unexpected(expected: EventKind, actual: &Event) -> StageError {
    StageError::UnexpectedEvent {
        expected,
        actual: actual.kind(),
    }
}

/// Run a tool call under `mode`, folding best-effort failures into `None`.
async fn consult(
    ctx: &StageContext,
    mode: ToolUse,
    server: &str,
    tool: &str,
    params: ToolValue,
    failures: &mut Vec<String>,
) -> Result<Option<ToolResult>, StageError> {
    if mode == ToolUse::Off || (!ctx.has_tools() && mode == ToolUse::BestEffort) {
        return Ok(None);
    }
    match ctx.call_tool(server, tool, params, None).await {
        Ok(result) if result.is_success() => Ok(Some(result)),
        Ok(result) => {
            let reason = format!("{server}.{tool}: {:?}", result.outcome);
            if mode == ToolUse::Required {
                return Err(StageError::Collaborator { reason });
            }
            failures.push(reason);
            Ok(None)
        }
        Err(e) if mode == ToolUse::Required => Err(e),
        Err(e) => {
            tracing::warn!(
                document_id = ctx.document_id(),
                server,
                tool,
                error = %e,
                "tool lookup failed, continuing without it"
            );
            failures.push(format!("{server}.{tool}: {e}"));
            Ok(None)
        }
    }
}

// ─── Ingest ──────────────────────────────────────────────────────────────────

/// Validates the received document and derives its title and size.
#[derive(Debug, Clone, Default)]
pub struct IngestStage {
    tools: ToolUse,
}

impl IngestStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tools(mut self, tools: ToolUse) -> Self {
        self.tools = tools;
        self
    }
}

/// Title from metadata, else the first non-empty line, else "Untitled".
fn derive_title(content: &str, metadata: &Metadata) -> String {
    if let Some(title) = metadata.get("title").and_then(|t| t.as_str()) {
        if !title.trim().is_empty() {
            return chars_prefix(title.trim(), MAX_TITLE_CHARS);
        }
    }
    content
        .lines()
        .map(|line| line.trim().trim_start_matches('#').trim())
        .find(|line| !line.is_empty())
        .map(|line| chars_prefix(line, MAX_TITLE_CHARS))
        .unwrap_or_else(|| "Untitled".to_string())
}

#[async_trait]
impl Stage for IngestStage {
    fn name(&self) -> &str {
        "ingest"
    }

    fn input_kind(&self) -> EventKind {
        EventKind::Received
    }

    fn output_kind(&self) -> EventKind {
        EventKind::Ingested
    }

    async fn handle(&self, input: &Event, ctx: &StageContext) -> Result<Event, StageError> {
        let Event::Received(received) = input else {
            return Err(unexpected(EventKind::Received, input));
        };

        let content = received.content.trim();
        if content.is_empty() {
            return Err(StageError::InvalidInput {
                reason: "document content is empty".into(),
            });
        }

        let title = derive_title(content, &received.metadata);
        let content_size = content.chars().count();
        let mut metadata = received.metadata.clone();
        metadata.insert("content_size".into(), json!(content_size));
        metadata.insert("ingested_at".into(), json!(Utc::now().to_rfc3339()));

        if let Some(path) = received.source_path.as_deref() {
            let mut failures = Vec::new();
            let info = consult(
                ctx,
                self.tools,
                FILESYSTEM_SERVER,
                "get_file_info",
                ToolValue::map([("path", ToolValue::from(path))]),
                &mut failures,
            )
            .await?;

            let parent = std::path::Path::new(path)
                .parent()
                .map(|p| p.display().to_string())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| ".".to_string());
            let listing = consult(
                ctx,
                self.tools,
                FILESYSTEM_SERVER,
                "list_directory",
                ToolValue::map([("path", ToolValue::from(parent))]),
                &mut failures,
            )
            .await?;

            if self.tools != ToolUse::Off && ctx.has_tools() {
                metadata.insert(
                    "file_metadata".into(),
                    json!({
                        "file_accessible": info.is_some(),
                        "file_info": info.and_then(|r| r.payload().cloned()).map(serde_json::Value::from),
                        "directory_listing": listing.and_then(|r| r.payload().cloned()).map(serde_json::Value::from),
                        "errors": failures,
                    }),
                );
            }
        }

        tracing::debug!(
            document_id = ctx.document_id(),
            title = %title,
            content_size,
            "document ingested"
        );
        Ok(Event::Ingested(Ingested {
            title,
            content: content.to_string(),
            content_size,
            metadata,
            source_path: received.source_path.clone(),
        }))
    }
}

// ─── Enhance ─────────────────────────────────────────────────────────────────

/// Generated content for one document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Enhancement {
    pub summary: String,
    pub key_points: Vec<String>,
    pub questions: Vec<String>,
    pub answers: Vec<String>,
    pub topics: Vec<String>,
    pub metadata: Metadata,
}

/// External content generator (e.g. a language-model client).
#[async_trait]
pub trait ContentEnhancer: Send + Sync {
    async fn enhance(&self, document: &Ingested) -> Result<Enhancement, StageError>;
}

/// Deterministic enhancer built from the document text alone.
///
/// Stands in when no generator is available.
#[derive(Debug, Clone, Default)]
pub struct ExtractiveEnhancer;

impl ExtractiveEnhancer {
    fn sentences(content: &str) -> Vec<String> {
        content
            .split(['.', '!', '?', '\n'])
            .map(str::trim)
            .filter(|s| s.split_whitespace().count() >= 3)
            .map(str::to_string)
            .collect()
    }

    fn topics(content: &str) -> Vec<String> {
        let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for word in content.split(|c: char| !c.is_alphanumeric()) {
            if word.chars().count() >= 6 {
                *counts.entry(word.to_lowercase()).or_default() += 1;
            }
        }
        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.into_iter().take(4).map(|(word, _)| word).collect()
    }
}

#[async_trait]
impl ContentEnhancer for ExtractiveEnhancer {
    async fn enhance(&self, document: &Ingested) -> Result<Enhancement, StageError> {
        let sentences = Self::sentences(&document.content);
        let lead = sentences.iter().take(3).cloned().collect::<Vec<_>>().join(". ");
        let summary = if lead.is_empty() {
            format!("'{}' contains {} characters.", document.title, document.content_size)
        } else {
            format!("{lead}.")
        };

        let mut metadata = Metadata::new();
        metadata.insert("enhancement_model".into(), json!("extractive"));

        Ok(Enhancement {
            summary,
            key_points: sentences.iter().take(5).cloned().collect(),
            questions: vec![
                "What is this document about?".into(),
                "How much content does it contain?".into(),
            ],
            answers: vec![
                format!("It is titled '{}'.", document.title),
                format!("{} characters.", document.content_size),
            ],
            topics: Self::topics(&document.content),
            metadata,
        })
    }
}

/// Generates summary, key points, Q&A, and topics, and records the document
/// in the memory server's knowledge graph.
pub struct EnhanceStage {
    enhancer: Arc<dyn ContentEnhancer>,
    tools: ToolUse,
}

impl EnhanceStage {
    pub fn new(enhancer: Arc<dyn ContentEnhancer>) -> Self {
        Self {
            enhancer,
            tools: ToolUse::default(),
        }
    }

    pub fn with_tools(mut self, tools: ToolUse) -> Self {
        self.tools = tools;
        self
    }
}

fn knowledge_graph_calls(doc: &Ingested, enhancement: &Enhancement) -> (ToolValue, ToolValue) {
    let entities = json!({
        "entities": [{
            "name": doc.title,
            "entityType": "document",
            "observations": [chars_prefix(&doc.content, MEMORY_OBSERVATION_CHARS)],
        }]
    });

    let relations: Vec<serde_json::Value> = enhancement
        .topics
        .iter()
        .map(|topic| json!({"from": doc.title, "to": topic, "relationType": "has_topic"}))
        .chain(
            enhancement
                .key_points
                .iter()
                .take(KEY_POINT_RELATIONS)
                .map(|point| {
                    json!({
                        "from": doc.title,
                        "to": chars_prefix(point, KEY_POINT_LABEL_CHARS),
                        "relationType": "key_point",
                    })
                }),
        )
        .take(MAX_RELATIONS)
        .collect();

    (
        ToolValue::from(entities),
        ToolValue::from(json!({ "relations": relations })),
    )
}

#[async_trait]
impl Stage for EnhanceStage {
    fn name(&self) -> &str {
        "enhance"
    }

    fn input_kind(&self) -> EventKind {
        EventKind::Ingested
    }

    fn output_kind(&self) -> EventKind {
        EventKind::Enhanced
    }

    async fn handle(&self, input: &Event, ctx: &StageContext) -> Result<Event, StageError> {
        let Event::Ingested(doc) = input else {
            return Err(unexpected(EventKind::Ingested, input));
        };

        let enhancement = self.enhancer.enhance(doc).await?;
        if enhancement.questions.len() != enhancement.answers.len() {
            return Err(StageError::Collaborator {
                reason: format!(
                    "{} questions but {} answers",
                    enhancement.questions.len(),
                    enhancement.answers.len()
                ),
            });
        }

        let mut metadata = doc.metadata.clone();
        metadata.extend(enhancement.metadata.clone());

        if self.tools != ToolUse::Off && (ctx.has_tools() || self.tools == ToolUse::Required) {
            let (entities, relations) = knowledge_graph_calls(doc, &enhancement);
            let mut entity_failures = Vec::new();
            let mut relation_failures = Vec::new();

            // Both writes go out together; neither waits on the other.
            let (stored, related) = futures::join!(
                consult(
                    ctx,
                    self.tools,
                    MEMORY_SERVER,
                    "create_entities",
                    entities,
                    &mut entity_failures,
                ),
                consult(
                    ctx,
                    self.tools,
                    MEMORY_SERVER,
                    "create_relations",
                    relations,
                    &mut relation_failures,
                ),
            );
            let (stored, related) = (stored?, related?);

            entity_failures.extend(relation_failures);
            metadata.insert(
                "knowledge_graph".into(),
                json!({
                    "document_stored": stored.is_some(),
                    "relations_created": related.is_some(),
                    "errors": entity_failures,
                }),
            );
        }

        let qa = enhancement
            .questions
            .into_iter()
            .zip(enhancement.answers)
            .map(|(question, answer)| QaPair {
                question: question.trim().to_string(),
                answer: answer.trim().to_string(),
            })
            .collect();

        Ok(Event::Enhanced(Enhanced {
            title: doc.title.clone(),
            content_size: doc.content_size,
            summary: enhancement.summary.trim().to_string(),
            key_points: enhancement.key_points.iter().map(|p| p.trim().to_string()).collect(),
            qa,
            topics: enhancement.topics.iter().map(|t| t.trim().to_string()).collect(),
            metadata,
        }))
    }
}

// ─── Assemble ────────────────────────────────────────────────────────────────

/// Builds the final structured notebook.
#[derive(Debug, Clone, Default)]
pub struct AssembleStage;

#[async_trait]
impl Stage for AssembleStage {
    fn name(&self) -> &str {
        "assemble"
    }

    fn input_kind(&self) -> EventKind {
        EventKind::Enhanced
    }

    fn output_kind(&self) -> EventKind {
        EventKind::Assembled
    }

    async fn handle(&self, input: &Event, _ctx: &StageContext) -> Result<Event, StageError> {
        let Event::Enhanced(enhanced) = input else {
            return Err(unexpected(EventKind::Enhanced, input));
        };

        // Key points first, then topics not already covered.
        let mut seen = BTreeSet::new();
        let highlights: Vec<String> = enhanced
            .key_points
            .iter()
            .chain(enhanced.topics.iter())
            .filter(|h| !h.is_empty() && seen.insert(h.to_lowercase()))
            .take(MAX_HIGHLIGHTS)
            .cloned()
            .collect();

        let mut metadata = enhanced.metadata.clone();
        metadata.insert("content_size".into(), json!(enhanced.content_size));
        metadata.insert("qa_count".into(), json!(enhanced.qa.len()));
        metadata.insert("topic_count".into(), json!(enhanced.topics.len()));
        metadata.insert("key_point_count".into(), json!(enhanced.key_points.len()));
        metadata.insert("stage_count".into(), json!(3));
        metadata.insert("assembled_at".into(), json!(Utc::now().to_rfc3339()));

        Ok(Event::Assembled(Assembled {
            title: enhanced.title.clone(),
            summary: enhanced.summary.clone(),
            qa_pairs: enhanced.qa.clone(),
            highlights,
            topics: enhanced.topics.clone(),
            metadata,
        }))
    }
}

/// The standard three-stage document pipeline builder.
pub fn document_pipeline(
    enhancer: Arc<dyn ContentEnhancer>,
    tools: ToolUse,
) -> super::engine::PipelineBuilder {
    super::engine::PipelineEngine::builder()
        .stage(IngestStage::new().with_tools(tools))
        .stage(EnhanceStage::new(enhancer).with_tools(tools))
        .stage(AssembleStage)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
