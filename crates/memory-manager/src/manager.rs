//! The memory manager: session lifecycle, context assembly, extraction
//! commits and maintenance.
//!
//! Locking: each session has its own mutex (appends and the end-of-session
//! freeze), each user a slot mutex (active-session uniqueness, commit, caps).
//! Extraction and embedding run outside any user lock; the lock is reacquired
//! to commit. Every public call takes a cancellation token honored at I/O
//! boundaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use embedding::EmbeddingService;
use memory_core::{
    Episode, EpisodeFilter, Fact, MemoryConfig, MemoryContext, MemoryError, MemoryStore,
    MessageRole, Result, SessionInfo, UserProfile,
};
use memory_extract::MemoryExtractor;

use crate::cache::{RetrievalCache, RetrievedBundle};
use crate::forgetter::Forgetter;
use crate::retriever::Retriever;
use crate::session::SessionHandle;

/// Per-user counters and the strength histogram (10 buckets over `[0, 1]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub user_id: String,
    pub episode_count: u64,
    pub fact_count: u64,
    pub has_profile: bool,
    pub strength_histogram: [u32; 10],
}

/// Bulk export payload. Field order is stable and collections are sorted by
/// id, so export -> import -> export round-trips byte-equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMemoryExport {
    pub user_id: String,
    pub profile: Option<UserProfile>,
    pub episodes: Vec<Episode>,
    pub facts: Vec<Fact>,
}

#[derive(Default)]
struct UserSlot {
    active: Option<Uuid>,
}

pub struct MemoryManager {
    config: MemoryConfig,
    store: Arc<dyn MemoryStore>,
    extractor: Arc<dyn MemoryExtractor>,
    embedder: Option<Arc<dyn EmbeddingService>>,
    retriever: Retriever,
    forgetter: Forgetter,
    cache: RetrievalCache,
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
    users: RwLock<HashMap<String, Arc<Mutex<UserSlot>>>>,
}

impl MemoryManager {
    pub fn new(
        config: MemoryConfig,
        store: Arc<dyn MemoryStore>,
        extractor: Arc<dyn MemoryExtractor>,
        embedder: Option<Arc<dyn EmbeddingService>>,
    ) -> Result<Self> {
        config.validate()?;
        let retriever = Retriever::new(store.clone(), config.clone(), embedder.clone());
        let forgetter = Forgetter::new(store.clone(), config.clone());
        let cache = RetrievalCache::new(
            config.enable_cache,
            Duration::from_secs(config.cache_ttl_secs),
        );
        Ok(Self {
            config,
            store,
            extractor,
            embedder,
            retriever,
            forgetter,
            cache,
            sessions: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    async fn user_slot(&self, user_id: &str) -> Arc<Mutex<UserSlot>> {
        let mut users = self.users.write().await;
        users
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UserSlot::default())))
            .clone()
    }

    /// Starts a session for the user, implicitly ending any prior active one
    /// (best effort: extraction errors there are logged, not propagated).
    pub async fn start_session(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionInfo> {
        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }
        let slot = self.user_slot(user_id).await;

        let (info, prior_handle) = {
            let mut slot_guard = slot.lock().await;

            // Unregister the prior session while holding the slot, so the
            // one-active-session invariant holds at every instant.
            let prior_handle = match slot_guard.active.take() {
                Some(prior_id) => self.sessions.write().await.remove(&prior_id),
                None => None,
            };

            let now = Utc::now();
            let info = SessionInfo {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                started_at: now,
                ended_at: None,
            };
            let handle = Arc::new(SessionHandle::new(
                info.clone(),
                2 * self.config.working_memory_size,
            ));
            self.sessions.write().await.insert(info.id, handle);
            slot_guard.active = Some(info.id);
            (info, prior_handle)
        };

        if let Err(e) = self.store.record_session_start(&info).await {
            self.sessions.write().await.remove(&info.id);
            let mut slot_guard = slot.lock().await;
            if slot_guard.active == Some(info.id) {
                slot_guard.active = None;
            }
            return Err(e);
        }

        if let Some(prior) = prior_handle {
            // The new session is already live; the stale commit targets the
            // old session id and may proceed concurrently with it.
            if let Err(e) = self.finalize_session(prior, cancel).await {
                warn!(user_id = user_id, error = %e, "implicit end of prior session failed");
            }
        }

        info!(user_id = user_id, session_id = %info.id, "session started");
        Ok(info)
    }

    /// Appends a message to the session's working memory. No network I/O.
    pub async fn add_message(
        &self,
        session_id: Uuid,
        role: MessageRole,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }
        let handle = self
            .sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(MemoryError::UnknownSession(session_id))?;

        let message = {
            let mut state = handle.state.lock().await;
            state.push(role, text, Utc::now())
        };

        if self.config.debug_retain_messages {
            self.store.persist_message(session_id, &message).await?;
        }
        Ok(())
    }

    /// Assembles the memory context for a session. With no explicit query the
    /// joined recent user messages are used as the retrieval query.
    pub async fn get_memory_context(
        &self,
        session_id: Uuid,
        query: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<MemoryContext> {
        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }
        let handle = self
            .sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(MemoryError::UnknownSession(session_id))?;

        let (user_id, working) = {
            let state = handle.state.lock().await;
            (state.info.user_id.clone(), state.messages())
        };

        let effective_query: Option<String> = query.map(str::to_string).or_else(|| {
            let joined = working
                .iter()
                .filter(|m| m.role == MessageRole::User)
                .map(|m| m.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            if joined.trim().is_empty() {
                None
            } else {
                Some(joined)
            }
        });
        let query_hash = RetrievalCache::query_hash(effective_query.as_deref());

        if let Some(bundle) = self.cache.get(&user_id, query_hash).await {
            debug!(user_id = %user_id, "retrieval cache hit");
            return Ok(MemoryContext {
                profile: bundle.profile,
                facts: bundle.facts,
                episodes: bundle.episodes,
                working,
            });
        }

        let profile = self.store.get_profile(&user_id).await?;
        let (episodes, facts) = self
            .retriever
            .retrieve(&user_id, effective_query.as_deref(), Utc::now())
            .await?;

        self.cache
            .put(
                &user_id,
                query_hash,
                RetrievedBundle {
                    profile: profile.clone(),
                    facts: facts.clone(),
                    episodes: episodes.clone(),
                },
            )
            .await;

        Ok(MemoryContext {
            profile,
            facts,
            episodes,
            working,
        })
    }

    /// Ends a session. Sessions below the compression threshold close without
    /// extraction and yield no episode. The session transitions to ended even
    /// when extraction or the commit fails.
    pub async fn end_session(
        &self,
        session_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<Episode>> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(&session_id)
            .ok_or(MemoryError::UnknownSession(session_id))?;

        let slot = self.user_slot(&handle.user_id).await;
        {
            let mut slot_guard = slot.lock().await;
            if slot_guard.active == Some(session_id) {
                slot_guard.active = None;
            }
        }

        self.finalize_session(handle, cancel).await
    }

    /// Shared end-of-session path for explicit and implicit ends. The handle
    /// is already unregistered, so racing `add_message` calls observe
    /// `UnknownSession` rather than being dropped silently.
    async fn finalize_session(
        &self,
        handle: Arc<SessionHandle>,
        cancel: &CancellationToken,
    ) -> Result<Option<Episode>> {
        let ended_at = Utc::now();
        let (session, messages, turns) = {
            let mut state = handle.state.lock().await;
            state.info.ended_at = Some(ended_at);
            (state.info.clone(), state.messages(), state.user_turns())
        };
        let user_id = session.user_id.clone();

        self.store.record_session_end(session.id, ended_at).await?;
        self.cache.invalidate_user(&user_id).await;

        if turns < self.config.episode_compress_threshold {
            debug!(
                session_id = %session.id,
                turns = turns,
                threshold = self.config.episode_compress_threshold,
                "session below compression threshold, no extraction"
            );
            return Ok(None);
        }

        // Extraction runs outside any user lock.
        let extraction = match self.extractor.extract(&messages, &user_id, cancel).await {
            Ok(extraction) => extraction,
            Err(MemoryError::Cancelled) => return Err(MemoryError::Cancelled),
            Err(e) => {
                warn!(
                    session_id = %session.id,
                    error = %e,
                    "extraction failed, session closed without episode"
                );
                return Ok(None);
            }
        };

        let summary_embedding = match (&self.embedder, self.config.enable_vector_search) {
            (Some(embedder), true) => match embedder.embed(&extraction.summary).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    warn!(error = %e, "summary embedding failed, storing episode without vector");
                    None
                }
            },
            _ => None,
        };

        // Reacquire the user slot to commit and re-check caps.
        let slot = self.user_slot(&user_id).await;
        let _guard = slot.lock().await;

        let commit_now = Utc::now();
        let mut profile = self
            .store
            .get_profile(&user_id)
            .await?
            .unwrap_or_else(|| UserProfile::new(&user_id, commit_now));
        extraction
            .profile_delta
            .apply(&mut profile, self.config.max_profile_tags, commit_now);

        let episode = Episode {
            id: Uuid::new_v4(),
            user_id: user_id.clone(),
            summary: extraction.summary,
            keywords: extraction.keywords,
            emotion: extraction.emotion,
            importance: extraction.importance,
            access_count: 0,
            created_at: commit_now,
            last_accessed_at: commit_now,
            source_session_id: session.id,
            embedding: summary_embedding,
        };
        let facts: Vec<Fact> = extraction
            .facts
            .iter()
            .map(|candidate| Fact {
                id: Uuid::new_v4(),
                user_id: user_id.clone(),
                subject: candidate.subject.clone(),
                predicate: candidate.predicate.clone(),
                object: candidate.object.clone(),
                confidence: candidate.confidence,
                created_at: commit_now,
                last_seen_at: commit_now,
            })
            .collect();

        self.store
            .commit_extraction(&user_id, &episode, &facts, &profile)
            .await?;

        // A cancelled call whose commit already landed does not roll back;
        // it only skips the sweep (a later maintenance call reclaims).
        if cancel.is_cancelled() {
            return Ok(Some(episode));
        }
        self.forgetter.enforce_caps(&user_id, commit_now).await?;
        self.forgetter.run_forget(&user_id, commit_now).await?;

        Ok(Some(episode))
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.store.get_profile(user_id).await
    }

    /// Full profile replace; the tag cap is enforced before write.
    pub async fn put_profile(&self, mut profile: UserProfile) -> Result<()> {
        profile.enforce_tag_cap(self.config.max_profile_tags);
        profile.updated_at = Utc::now();
        self.store.upsert_profile(&profile).await?;
        self.cache.invalidate_user(&profile.user_id).await;
        Ok(())
    }

    /// Bulk export preserving ids, deterministically ordered.
    pub async fn export_user(&self, user_id: &str) -> Result<UserMemoryExport> {
        let profile = self.store.get_profile(user_id).await?;
        let mut episodes = self
            .store
            .list_episodes(user_id, &EpisodeFilter::default())
            .await?;
        episodes.sort_by_key(|e| e.id);
        let mut facts = self.store.list_facts(user_id, None).await?;
        facts.sort_by_key(|f| f.id);
        Ok(UserMemoryExport {
            user_id: user_id.to_string(),
            profile,
            episodes,
            facts,
        })
    }

    /// Bulk import as an upsert; ids are preserved and caps re-enforced.
    pub async fn import_user(&self, export: &UserMemoryExport) -> Result<()> {
        let slot = self.user_slot(&export.user_id).await;
        let _guard = slot.lock().await;

        if let Some(profile) = &export.profile {
            let mut profile = profile.clone();
            profile.enforce_tag_cap(self.config.max_profile_tags);
            self.store.upsert_profile(&profile).await?;
        }
        for episode in &export.episodes {
            self.store.insert_episode(episode).await?;
        }
        for fact in &export.facts {
            self.store.upsert_fact(fact).await?;
        }

        self.forgetter.enforce_caps(&export.user_id, Utc::now()).await?;
        self.cache.invalidate_user(&export.user_id).await;
        info!(
            user_id = %export.user_id,
            episodes = export.episodes.len(),
            facts = export.facts.len(),
            "imported user memory"
        );
        Ok(())
    }

    /// Decay sweep for one user.
    pub async fn run_forget(&self, user_id: &str) -> Result<u64> {
        let removed = self.forgetter.run_forget(user_id, Utc::now()).await?;
        self.cache.invalidate_user(user_id).await;
        Ok(removed)
    }

    /// Cap enforcement for one user.
    pub async fn enforce_caps(&self, user_id: &str) -> Result<u64> {
        let removed = self.forgetter.enforce_caps(user_id, Utc::now()).await?;
        self.cache.invalidate_user(user_id).await;
        Ok(removed)
    }

    /// Maintenance sweep over every known user: caps, then decay.
    pub async fn cleanup(&self) -> Result<u64> {
        let now = Utc::now();
        let mut removed = 0;
        for user_id in self.store.list_user_ids().await? {
            removed += self.forgetter.enforce_caps(&user_id, now).await?;
            removed += self.forgetter.run_forget(&user_id, now).await?;
            self.cache.invalidate_user(&user_id).await;
        }
        Ok(removed)
    }

    pub async fn stats(&self, user_id: &str) -> Result<MemoryStats> {
        let episode_count = self.store.count_episodes(user_id).await?;
        let fact_count = self.store.count_facts(user_id).await?;
        let has_profile = self.store.get_profile(user_id).await?.is_some();

        let now = Utc::now();
        let mut strength_histogram = [0u32; 10];
        for episode in self
            .store
            .list_episodes(user_id, &EpisodeFilter::default())
            .await?
        {
            let strength = episode.strength(now, &self.config).clamp(0.0, 1.0);
            let bucket = ((strength * 10.0) as usize).min(9);
            strength_histogram[bucket] += 1;
        }

        Ok(MemoryStats {
            user_id: user_id.to_string(),
            episode_count,
            fact_count,
            has_profile,
            strength_histogram,
        })
    }
}
