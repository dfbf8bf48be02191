//! Episode and fact retrieval.
//!
//! Keyword mode scores `0.6 * keyword_overlap + 0.4 * recency`; vector mode
//! (when enabled) scores by cosine similarity over summary embeddings and
//! falls back to keyword mode on any backend failure. Returned episodes get
//! their access bookkeeping bumped as a side effect.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use embedding::{cosine_similarity, EmbeddingService};
use memory_core::{Episode, EpisodeFilter, Fact, MemoryConfig, MemoryStore, Result};
use memory_extract::tokenize;

pub struct Retriever {
    store: Arc<dyn MemoryStore>,
    embedder: Option<Arc<dyn EmbeddingService>>,
    config: MemoryConfig,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        config: MemoryConfig,
        embedder: Option<Arc<dyn EmbeddingService>>,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    fn recency(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
        let days = (now - last).num_seconds() as f32 / 86_400.0;
        (1.0 - days / self.config.memory_decay_days as f32).max(0.0)
    }

    /// Retrieves the most relevant episodes and facts for a query.
    ///
    /// Empty query: top episodes by strength, top facts by confidence.
    /// Side effect: returned episodes get `access_count` incremented and
    /// `last_accessed_at` set to `now`, in one batched store transaction.
    pub async fn retrieve(
        &self,
        user_id: &str,
        query: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Episode>, Vec<Fact>)> {
        let limit = self.config.max_retrieval_results;
        let candidates = self
            .store
            .list_episodes(user_id, &EpisodeFilter::default())
            .await?;

        let mut episodes = match query {
            Some(q) if !q.trim().is_empty() => {
                match (&self.embedder, self.config.enable_vector_search) {
                    (Some(embedder), true) => match self.vector_rank(embedder, &candidates, q).await
                    {
                        Ok(ranked) => ranked,
                        Err(e) => {
                            warn!(error = %e, "vector retrieval failed, falling back to keywords");
                            self.keyword_rank(&candidates, q, now)
                        }
                    },
                    _ => self.keyword_rank(&candidates, q, now),
                }
            }
            _ => {
                let mut scored: Vec<(f32, Episode)> = candidates
                    .iter()
                    .map(|e| (e.strength(now, &self.config), e.clone()))
                    .collect();
                scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                scored.into_iter().map(|(_, e)| e).collect()
            }
        };
        episodes.truncate(limit);

        // Access bookkeeping happens in the same call as the read.
        let touched: Vec<_> = episodes.iter().map(|e| e.id).collect();
        self.store.touch_episodes(&touched, now).await?;
        for episode in &mut episodes {
            episode.access_count += 1;
            episode.last_accessed_at = now;
        }

        let facts = self.retrieve_facts(user_id, query, now).await?;

        debug!(
            user_id = user_id,
            episode_count = episodes.len(),
            fact_count = facts.len(),
            "retrieval complete"
        );
        Ok((episodes, facts))
    }

    /// `0.6 * overlap(query terms, episode keywords) + 0.4 * recency`.
    fn keyword_rank(&self, candidates: &[Episode], query: &str, now: DateTime<Utc>) -> Vec<Episode> {
        let terms = tokenize::keywords(query, 5);
        if terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(f32, Episode)> = candidates
            .iter()
            .map(|episode| {
                let matched = terms
                    .iter()
                    .filter(|t| {
                        episode.keywords.iter().any(|k| k.contains(t.as_str()))
                            || episode.summary.contains(t.as_str())
                    })
                    .count();
                let overlap = matched as f32 / terms.len() as f32;
                let score = 0.6 * overlap + 0.4 * self.recency(episode.last_accessed_at, now);
                (score, episode.clone())
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, e)| e).collect()
    }

    /// Cosine similarity over summary embeddings; entries below the
    /// similarity threshold are dropped.
    async fn vector_rank(
        &self,
        embedder: &Arc<dyn EmbeddingService>,
        candidates: &[Episode],
        query: &str,
    ) -> std::result::Result<Vec<Episode>, anyhow::Error> {
        let query_vector = embedder.embed(query).await?;

        let mut scored: Vec<(f32, Episode)> = Vec::new();
        for episode in candidates {
            let vector = match &episode.embedding {
                Some(v) => v.clone(),
                None => embedder.embed(&episode.summary).await?,
            };
            let similarity = cosine_similarity(&query_vector, &vector);
            if similarity >= self.config.similarity_threshold {
                scored.push((similarity, episode.clone()));
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().map(|(_, e)| e).collect())
    }

    /// Facts: prefix match on subject/object tokens, ranked by
    /// `confidence * recency`; top facts by confidence when there is no query.
    async fn retrieve_facts(
        &self,
        user_id: &str,
        query: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Fact>> {
        let limit = self.config.max_retrieval_results;
        let all = self.store.list_facts(user_id, None).await?;

        match query {
            Some(q) if !q.trim().is_empty() => {
                let terms = tokenize::keywords(q, 5);
                let mut scored: Vec<(f32, Fact)> = all
                    .into_iter()
                    .filter(|fact| {
                        let mut tokens = tokenize::tokenize(&fact.subject);
                        tokens.extend(tokenize::tokenize(&fact.object));
                        tokens.push(fact.subject.clone());
                        tokens.push(fact.object.clone());
                        terms
                            .iter()
                            .any(|t| tokens.iter().any(|tok| tok.starts_with(t.as_str())))
                    })
                    .map(|fact| {
                        let score = fact.confidence * self.recency(fact.last_seen_at, now);
                        (score, fact)
                    })
                    .collect();
                scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                Ok(scored.into_iter().take(limit).map(|(_, f)| f).collect())
            }
            _ => Ok(all.into_iter().take(limit).collect()),
        }
    }
}
