use std::collections::HashSet;

use serde::Deserialize;
use tracing::debug;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        indexes::ensure_entity_search_index,
        types::entity::{deserialize_flexible_id, Entity, EntityContext},
    },
};

use crate::tokenize::{tokenize, QueryToken, Stopwords};

#[derive(Debug, Deserialize)]
struct FtsScoreRow {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
}

/// Two-tier entity search: a scored pass over the accent-folding full-text
/// index, unioned with a CONTAINS fallback when the index tier comes back
/// thin. Results carry the entity's full context.
pub async fn search_entities(
    db: &SurrealDbClient,
    memory_id: &str,
    query: &str,
    limit: usize,
    stopwords: &Stopwords,
) -> Result<Vec<EntityContext>, AppError> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let tokens = tokenize(query, stopwords);
    debug!(
        memory_id,
        query,
        tokens = ?tokens.iter().map(|t| t.folded.as_str()).collect::<Vec<_>>(),
        "graph search tokenised"
    );
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    ensure_entity_search_index(db).await?;

    let mut ordered: Vec<Entity> = full_text_tier(db, memory_id, &tokens, limit).await?;
    debug!(
        memory_id,
        hits = ordered.len(),
        "graph search full-text tier"
    );

    if ordered.len() < limit.div_ceil(2) {
        let mut seen: HashSet<String> = ordered.iter().map(|e| e.id.clone()).collect();
        for entity in contains_tier(db, memory_id, &tokens).await? {
            if ordered.len() >= limit {
                break;
            }
            if seen.insert(entity.id.clone()) {
                ordered.push(entity);
            }
        }
        debug!(
            memory_id,
            hits = ordered.len(),
            "graph search after contains fallback"
        );
    }

    ordered.truncate(limit);

    let mut contexts = Vec::with_capacity(ordered.len());
    for entity in ordered {
        contexts.push(Entity::context(db, memory_id, entity).await?);
    }
    Ok(contexts)
}

/// Tier 1: BM25 over the folded entity-name index. Tokenisation already
/// reduced the query to plain word runs, which doubles as escaping of the
/// index's reserved characters.
async fn full_text_tier(
    db: &SurrealDbClient,
    memory_id: &str,
    tokens: &[QueryToken],
    limit: usize,
) -> Result<Vec<Entity>, AppError> {
    let terms = tokens
        .iter()
        .map(|t| t.folded.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let mut response = db
        .client
        .query(
            "SELECT id, search::score(0) AS score FROM entity \
             WHERE name @0@ $terms AND memory_id = $memory_id \
             ORDER BY score DESC \
             LIMIT $limit",
        )
        .bind(("terms", terms))
        .bind(("memory_id", memory_id.to_owned()))
        .bind(("limit", limit as i64))
        .await?;
    let rows: Vec<FtsScoreRow> = response.take(0)?;

    let ids: Vec<String> = rows.into_iter().map(|row| row.id).collect();
    let mut entities = Entity::get_many(db, &ids).await?;
    // get_many does not preserve request order; restore the score ranking.
    entities.sort_by_key(|e| ids.iter().position(|id| id == &e.id).unwrap_or(usize::MAX));
    Ok(entities)
}

/// Tier 2: substring match over the memory's entities, raw or folded token
/// against the lowercased name. Ordered by (tokens matched desc, mentions
/// desc).
async fn contains_tier(
    db: &SurrealDbClient,
    memory_id: &str,
    tokens: &[QueryToken],
) -> Result<Vec<Entity>, AppError> {
    let entities = Entity::list_by_memory(db, memory_id).await?;

    let mut matched: Vec<(usize, Entity)> = entities
        .into_iter()
        .filter_map(|entity| {
            let name = entity.name.to_lowercase();
            let hits = tokens
                .iter()
                .filter(|t| name.contains(&t.raw) || name.contains(&t.folded))
                .count();
            (hits > 0).then_some((hits, entity))
        })
        .collect();

    matched.sort_by(|(hits_a, a), (hits_b, b)| {
        hits_b
            .cmp(hits_a)
            .then(b.mentions.cmp(&a.mentions))
            .then(a.name.cmp(&b.name))
    });

    Ok(matched.into_iter().map(|(_, entity)| entity).collect())
}
