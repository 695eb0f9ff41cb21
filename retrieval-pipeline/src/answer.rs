use std::collections::HashMap;
use std::fmt::Write as _;

use serde::Serialize;
use tracing::info;

use common::{error::AppError, storage::db::SurrealDbClient};

use crate::rag::{retrieve, QueryServices, RetrievalConfig, RetrievalMode, RetrievalOutcome};
use crate::tokenize::Stopwords;

const ANSWER_SYSTEM_PROMPT: &str = "You answer questions using only the supplied knowledge-graph \
    entities and document passages. Cite the source filenames you used in square brackets. \
    When the context does not contain the answer, say plainly that no relevant information \
    was found; never invent facts.";

const EMPTY_CONTEXT_ANSWER: &str =
    "No relevant information was found in this memory for this question.";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SourceDocument {
    pub document_id: String,
    pub filename: String,
    pub object_uri: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResult {
    pub answer: String,
    pub entities: Vec<String>,
    pub source_documents: Vec<SourceDocument>,
    pub mode: RetrievalMode,
}

/// Structured retrieval without any LLM call.
pub async fn memory_query(
    db: &SurrealDbClient,
    services: &dyn QueryServices,
    stopwords: &Stopwords,
    memory_id: &str,
    query: &str,
    config: RetrievalConfig,
) -> Result<RetrievalOutcome, AppError> {
    retrieve(db, services, stopwords, memory_id, query, config).await
}

/// Graph-Guided RAG answer with citations. Both retrieval paths have already
/// been tried by the core before this ever reports an empty context.
pub async fn question_answer(
    db: &SurrealDbClient,
    services: &dyn QueryServices,
    stopwords: &Stopwords,
    memory_id: &str,
    question: &str,
    config: RetrievalConfig,
) -> Result<AnswerResult, AppError> {
    let outcome = retrieve(db, services, stopwords, memory_id, question, config).await?;

    let entities: Vec<String> = outcome
        .entities
        .iter()
        .map(|context| context.entity.name.clone())
        .collect();
    let source_documents: Vec<SourceDocument> = outcome
        .documents
        .iter()
        .map(|doc| SourceDocument {
            document_id: doc.id.clone(),
            filename: doc.filename.clone(),
            object_uri: doc.object_uri.clone(),
        })
        .collect();

    if outcome.entities.is_empty() && outcome.chunks.is_empty() {
        return Ok(AnswerResult {
            answer: EMPTY_CONTEXT_ANSWER.to_string(),
            entities,
            source_documents,
            mode: outcome.mode,
        });
    }

    let user_prompt = build_answer_prompt(&outcome, question);
    info!(
        memory_id,
        mode = ?outcome.mode,
        system_prompt_chars = ANSWER_SYSTEM_PROMPT.len(),
        user_prompt_chars = user_prompt.chars().count(),
        "question_answer prompt assembled"
    );

    let answer = services.answer(ANSWER_SYSTEM_PROMPT, &user_prompt).await?;

    Ok(AnswerResult {
        answer,
        entities,
        source_documents,
        mode: outcome.mode,
    })
}

/// Compact rendering of entities with their neighbourhoods, the retained
/// chunks with their source filenames, and the question.
fn build_answer_prompt(outcome: &RetrievalOutcome, question: &str) -> String {
    let filenames: HashMap<&str, &str> = outcome
        .documents
        .iter()
        .map(|doc| (doc.id.as_str(), doc.filename.as_str()))
        .collect();

    let mut prompt = String::from("Knowledge graph context:\n");
    if outcome.entities.is_empty() {
        prompt.push_str("(no matching entities)\n");
    }
    for context in &outcome.entities {
        let entity = &context.entity;
        let _ = writeln!(
            prompt,
            "- {} ({}, {} mentions): {}",
            entity.name, entity.entity_type, entity.mentions, entity.description
        );
        for relation in &context.relations {
            let from = if relation.in_ == entity.id {
                entity.name.as_str()
            } else {
                context
                    .neighbours
                    .iter()
                    .find(|n| n.id == relation.in_)
                    .map(|n| n.name.as_str())
                    .unwrap_or("?")
            };
            let to = if relation.out == entity.id {
                entity.name.as_str()
            } else {
                context
                    .neighbours
                    .iter()
                    .find(|n| n.id == relation.out)
                    .map(|n| n.name.as_str())
                    .unwrap_or("?")
            };
            let _ = writeln!(
                prompt,
                "  {} --{}--> {}",
                from, relation.metadata.relation_type, to
            );
        }
    }

    prompt.push_str("\nDocument passages:\n");
    if outcome.chunks.is_empty() {
        prompt.push_str("(no passages above the relevance threshold)\n");
    }
    for chunk in &outcome.chunks {
        let filename = filenames
            .get(chunk.document_id.as_str())
            .copied()
            .unwrap_or(chunk.document_id.as_str());
        let _ = writeln!(prompt, "[{filename}] {}", chunk.text);
    }

    let _ = write!(prompt, "\nQuestion: {question}");
    prompt
}
