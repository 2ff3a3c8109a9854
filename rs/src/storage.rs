//! Storage backends
//!
//! [`MemoryStorage`] keeps everything in process memory. [`FileStorage`]
//! keeps the same in-memory state and writes it through to a directory of
//! JSON files so the engine state survives restarts:
//!
//! ```text
//! <dir>/features/<content_id>.json   one file per content item
//! <dir>/similarity.json              similarity edges
//! <dir>/preferences.json             user preference weights
//! <dir>/interactions.jsonl           interaction log, one event per line
//! <dir>/index_checkpoint.json        batch index cursor
//! ```

use crate::models::{
    pair_key, ContentFeatures, ContentId, EngineStorage, IndexCursor, InteractionEvent,
    PreferenceChange, PreferenceType, PreferenceUpdate, SimilarityEdge, UserId,
    UserPreferenceWeight,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage directory error: {message}")]
    Directory { message: String },
}

type PreferenceKey = (UserId, PreferenceType, String);
type PreferenceMap = BTreeMap<PreferenceKey, UserPreferenceWeight>;
type EdgeMap = BTreeMap<(ContentId, ContentId), SimilarityEdge>;

/// Read-modify-write of one preference row; callers hold the write lock
fn apply_preference(
    preferences: &mut PreferenceMap,
    update: PreferenceUpdate,
    retention: f64,
) -> Option<PreferenceChange> {
    let key = (
        update.user_id,
        update.preference_type,
        update.preference_value.clone(),
    );
    if let Some(existing) = preferences.get_mut(&key) {
        let delta = existing.apply_smoothing(update.incoming, retention);
        return Some(PreferenceChange {
            preference: existing.clone(),
            delta,
            created: false,
        });
    }
    if update.incoming <= 0.0 || !update.incoming.is_finite() {
        return None;
    }
    let preference = UserPreferenceWeight::new(
        update.user_id,
        update.preference_type,
        update.preference_value,
        update.incoming,
    );
    preferences.insert(key, preference.clone());
    Some(PreferenceChange {
        delta: preference.weight,
        preference,
        created: true,
    })
}

/// Engine state shared by both backends
#[derive(Debug, Default)]
struct StoreState {
    features: BTreeMap<ContentId, ContentFeatures>,
    edges: EdgeMap,
    preferences: PreferenceMap,
    interactions: Vec<InteractionEvent>,
    event_ids: HashSet<Uuid>,
    checkpoint: Option<IndexCursor>,
}

impl StoreState {
    fn edges_for(&self, id: ContentId) -> Vec<SimilarityEdge> {
        self.edges
            .values()
            .filter(|e| e.content_a == id || e.content_b == id)
            .cloned()
            .collect()
    }

    fn remove_edges_for(&mut self, id: ContentId) -> usize {
        let before = self.edges.len();
        self.edges.retain(|(a, b), _| *a != id && *b != id);
        before - self.edges.len()
    }

    fn insert_edge_if_absent(&mut self, edge: SimilarityEdge) -> bool {
        if self.edges.contains_key(&edge.key()) {
            return false;
        }
        self.edges.insert(edge.key(), edge);
        true
    }

    fn preferences_for(&self, user_id: UserId) -> Vec<UserPreferenceWeight> {
        self.preferences
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Apply updates to a copy of the preference rows, leaving `self` as is
    fn preview_preferences(
        &self,
        updates: Vec<PreferenceUpdate>,
        retention: f64,
    ) -> (PreferenceMap, Vec<PreferenceChange>) {
        let mut preferences = self.preferences.clone();
        let changes = updates
            .into_iter()
            .filter_map(|update| apply_preference(&mut preferences, update, retention))
            .collect();
        (preferences, changes)
    }

    fn record_interaction(&mut self, event: InteractionEvent) -> bool {
        if !self.event_ids.insert(event.id) {
            return false;
        }
        self.interactions.push(event);
        true
    }

    fn interactions_since(
        &self,
        user_id: Option<UserId>,
        since: Option<DateTime<Utc>>,
    ) -> Vec<InteractionEvent> {
        self.interactions
            .iter()
            .filter(|e| user_id.map_or(true, |u| e.user_id == u))
            .filter(|e| since.map_or(true, |s| e.timestamp >= s))
            .cloned()
            .collect()
    }
}

/// Engine state held in process memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<StoreState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EngineStorage for MemoryStorage {
    async fn upsert_features(&self, features: ContentFeatures) -> crate::Result<()> {
        let mut state = self.state.write().await;
        state.features.insert(features.content_id, features);
        Ok(())
    }

    async fn get_features(&self, id: ContentId) -> crate::Result<Option<ContentFeatures>> {
        Ok(self.state.read().await.features.get(&id).cloned())
    }

    async fn get_all_features(&self) -> crate::Result<Vec<ContentFeatures>> {
        Ok(self.state.read().await.features.values().cloned().collect())
    }

    async fn remove_features(&self, id: ContentId) -> crate::Result<bool> {
        Ok(self.state.write().await.features.remove(&id).is_some())
    }

    async fn get_similarity(
        &self,
        a: ContentId,
        b: ContentId,
    ) -> crate::Result<Option<SimilarityEdge>> {
        Ok(self.state.read().await.edges.get(&pair_key(a, b)).cloned())
    }

    async fn insert_similarity_if_absent(&self, edge: SimilarityEdge) -> crate::Result<bool> {
        Ok(self.state.write().await.insert_edge_if_absent(edge))
    }

    async fn upsert_similarity(&self, edge: SimilarityEdge) -> crate::Result<()> {
        self.state.write().await.edges.insert(edge.key(), edge);
        Ok(())
    }

    async fn get_edges_for(&self, id: ContentId) -> crate::Result<Vec<SimilarityEdge>> {
        Ok(self.state.read().await.edges_for(id))
    }

    async fn invalidate_similarity(&self, id: ContentId) -> crate::Result<usize> {
        Ok(self.state.write().await.remove_edges_for(id))
    }

    async fn count_similarity_edges(&self) -> crate::Result<usize> {
        Ok(self.state.read().await.edges.len())
    }

    async fn get_preferences(&self, user_id: UserId) -> crate::Result<Vec<UserPreferenceWeight>> {
        Ok(self.state.read().await.preferences_for(user_id))
    }

    async fn record_interaction(&self, event: InteractionEvent) -> crate::Result<bool> {
        Ok(self.state.write().await.record_interaction(event))
    }

    async fn record_event(
        &self,
        event: InteractionEvent,
        updates: Vec<PreferenceUpdate>,
        retention: f64,
    ) -> crate::Result<Option<Vec<PreferenceChange>>> {
        let mut state = self.state.write().await;
        if !state.record_interaction(event) {
            return Ok(None);
        }
        let (preferences, changes) = state.preview_preferences(updates, retention);
        state.preferences = preferences;
        Ok(Some(changes))
    }

    async fn get_interactions(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> crate::Result<Vec<InteractionEvent>> {
        Ok(self.state.read().await.interactions_since(None, since))
    }

    async fn get_user_interactions(
        &self,
        user_id: UserId,
        since: Option<DateTime<Utc>>,
    ) -> crate::Result<Vec<InteractionEvent>> {
        Ok(self
            .state
            .read()
            .await
            .interactions_since(Some(user_id), since))
    }

    async fn load_index_checkpoint(&self) -> crate::Result<Option<IndexCursor>> {
        Ok(self.state.read().await.checkpoint)
    }

    async fn save_index_checkpoint(&self, cursor: Option<IndexCursor>) -> crate::Result<()> {
        self.state.write().await.checkpoint = cursor;
        Ok(())
    }
}

/// File-backed storage
///
/// All reads are served from memory; every mutation is written through to
/// disk while the write lock is held, so files never interleave.
pub struct FileStorage {
    /// Base directory for storage
    storage_dir: PathBuf,

    state: RwLock<StoreState>,
}

impl FileStorage {
    /// Open (or create) a storage directory and load its contents
    pub async fn new<P: AsRef<Path>>(storage_dir: P) -> Result<Self, StorageError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();

        if !storage_dir.exists() {
            fs::create_dir_all(&storage_dir).await?;
        }

        let metadata = fs::metadata(&storage_dir).await?;
        if !metadata.is_dir() {
            return Err(StorageError::Directory {
                message: format!("{} is not a directory", storage_dir.display()),
            });
        }

        let features_dir = storage_dir.join("features");
        if !features_dir.exists() {
            fs::create_dir_all(&features_dir).await?;
        }

        let storage = Self {
            storage_dir,
            state: RwLock::new(StoreState::default()),
        };
        storage.load().await?;
        Ok(storage)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn features_path(&self, id: ContentId) -> PathBuf {
        self.storage_dir.join("features").join(format!("{id}.json"))
    }

    fn similarity_path(&self) -> PathBuf {
        self.storage_dir.join("similarity.json")
    }

    fn preferences_path(&self) -> PathBuf {
        self.storage_dir.join("preferences.json")
    }

    fn interactions_path(&self) -> PathBuf {
        self.storage_dir.join("interactions.jsonl")
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.storage_dir.join("index_checkpoint.json")
    }

    async fn load(&self) -> Result<(), StorageError> {
        tracing::info!("Loading engine state from {}", self.storage_dir.display());
        let start = std::time::Instant::now();
        let mut state = self.state.write().await;

        let mut entries = fs::read_dir(self.storage_dir.join("features")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match read_json::<ContentFeatures>(&path).await {
                Ok(features) => {
                    state.features.insert(features.content_id, features);
                }
                Err(e) => {
                    tracing::warn!("Failed to load features from {}: {}", path.display(), e);
                }
            }
        }

        if self.similarity_path().exists() {
            let edges: Vec<SimilarityEdge> = read_json(&self.similarity_path()).await?;
            state.edges = edges.into_iter().map(|e| (e.key(), e)).collect();
        }

        if self.preferences_path().exists() {
            let preferences: Vec<UserPreferenceWeight> =
                read_json(&self.preferences_path()).await?;
            state.preferences = preferences
                .into_iter()
                .map(|p| {
                    (
                        (p.user_id, p.preference_type, p.preference_value.clone()),
                        p,
                    )
                })
                .collect();
        }

        if self.interactions_path().exists() {
            let content = fs::read_to_string(self.interactions_path()).await?;
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<InteractionEvent>(line) {
                    Ok(event) => {
                        state.record_interaction(event);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Skipping malformed interaction on line {}: {}",
                            line_no + 1,
                            e
                        );
                    }
                }
            }
        }

        if self.checkpoint_path().exists() {
            state.checkpoint = read_json(&self.checkpoint_path()).await?;
        }

        tracing::info!(
            "Loaded {} feature rows, {} edges, {} preferences, {} interactions in {:?}",
            state.features.len(),
            state.edges.len(),
            state.preferences.len(),
            state.interactions.len(),
            start.elapsed()
        );
        Ok(())
    }

    async fn save_edges(&self, edges: &EdgeMap) -> Result<(), StorageError> {
        let edges: Vec<&SimilarityEdge> = edges.values().collect();
        write_json(&self.similarity_path(), &edges).await
    }

    async fn save_preferences(&self, preferences: &PreferenceMap) -> Result<(), StorageError> {
        let preferences: Vec<&UserPreferenceWeight> = preferences.values().collect();
        write_json(&self.preferences_path(), &preferences).await
    }

    /// Persist an edited copy of the edge map, then commit it
    async fn commit_edges(&self, state: &mut StoreState, edges: EdgeMap) -> crate::Result<()> {
        self.save_edges(&edges)
            .await
            .context("Failed to save similarity edges")?;
        state.edges = edges;
        Ok(())
    }

    async fn append_interaction(&self, event: &InteractionEvent) -> crate::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.interactions_path())
            .await
            .context("Failed to open interaction log")?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to append to interaction log")?;
        Ok(())
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StorageError> {
    let content = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

/// Write via a temporary file and rename, so readers never see a partial file
async fn write_json<T: serde::Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StorageError> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait::async_trait]
impl EngineStorage for FileStorage {
    async fn upsert_features(&self, features: ContentFeatures) -> crate::Result<()> {
        let mut state = self.state.write().await;
        write_json(&self.features_path(features.content_id), &features)
            .await
            .context("Failed to save features to file")?;
        state.features.insert(features.content_id, features);
        Ok(())
    }

    async fn get_features(&self, id: ContentId) -> crate::Result<Option<ContentFeatures>> {
        Ok(self.state.read().await.features.get(&id).cloned())
    }

    async fn get_all_features(&self) -> crate::Result<Vec<ContentFeatures>> {
        Ok(self.state.read().await.features.values().cloned().collect())
    }

    async fn remove_features(&self, id: ContentId) -> crate::Result<bool> {
        let mut state = self.state.write().await;
        if !state.features.contains_key(&id) {
            return Ok(false);
        }
        fs::remove_file(self.features_path(id))
            .await
            .context("Failed to remove features file")?;
        state.features.remove(&id);
        Ok(true)
    }

    async fn get_similarity(
        &self,
        a: ContentId,
        b: ContentId,
    ) -> crate::Result<Option<SimilarityEdge>> {
        Ok(self.state.read().await.edges.get(&pair_key(a, b)).cloned())
    }

    async fn insert_similarity_if_absent(&self, edge: SimilarityEdge) -> crate::Result<bool> {
        let mut state = self.state.write().await;
        if state.edges.contains_key(&edge.key()) {
            return Ok(false);
        }
        let mut edges = state.edges.clone();
        edges.insert(edge.key(), edge);
        self.commit_edges(&mut state, edges).await?;
        Ok(true)
    }

    async fn upsert_similarity(&self, edge: SimilarityEdge) -> crate::Result<()> {
        let mut state = self.state.write().await;
        let mut edges = state.edges.clone();
        edges.insert(edge.key(), edge);
        self.commit_edges(&mut state, edges).await
    }

    async fn get_edges_for(&self, id: ContentId) -> crate::Result<Vec<SimilarityEdge>> {
        Ok(self.state.read().await.edges_for(id))
    }

    async fn invalidate_similarity(&self, id: ContentId) -> crate::Result<usize> {
        let mut state = self.state.write().await;
        let mut edges = state.edges.clone();
        edges.retain(|(a, b), _| *a != id && *b != id);
        let removed = state.edges.len() - edges.len();
        if removed > 0 {
            self.commit_edges(&mut state, edges).await?;
        }
        Ok(removed)
    }

    async fn count_similarity_edges(&self) -> crate::Result<usize> {
        Ok(self.state.read().await.edges.len())
    }

    async fn get_preferences(&self, user_id: UserId) -> crate::Result<Vec<UserPreferenceWeight>> {
        Ok(self.state.read().await.preferences_for(user_id))
    }

    async fn record_interaction(&self, event: InteractionEvent) -> crate::Result<bool> {
        let mut state = self.state.write().await;
        if state.event_ids.contains(&event.id) {
            return Ok(false);
        }
        self.append_interaction(&event).await?;
        Ok(state.record_interaction(event))
    }

    /// The log line is written before the preference file; a reload
    /// deduplicates a line repeated by a retry.
    async fn record_event(
        &self,
        event: InteractionEvent,
        updates: Vec<PreferenceUpdate>,
        retention: f64,
    ) -> crate::Result<Option<Vec<PreferenceChange>>> {
        let mut state = self.state.write().await;
        if state.event_ids.contains(&event.id) {
            return Ok(None);
        }
        let (preferences, changes) = state.preview_preferences(updates, retention);
        self.append_interaction(&event).await?;
        if !changes.is_empty() {
            self.save_preferences(&preferences)
                .await
                .context("Failed to save preferences")?;
        }
        state.record_interaction(event);
        state.preferences = preferences;
        Ok(Some(changes))
    }

    async fn get_interactions(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> crate::Result<Vec<InteractionEvent>> {
        Ok(self.state.read().await.interactions_since(None, since))
    }

    async fn get_user_interactions(
        &self,
        user_id: UserId,
        since: Option<DateTime<Utc>>,
    ) -> crate::Result<Vec<InteractionEvent>> {
        Ok(self
            .state
            .read()
            .await
            .interactions_since(Some(user_id), since))
    }

    async fn load_index_checkpoint(&self) -> crate::Result<Option<IndexCursor>> {
        Ok(self.state.read().await.checkpoint)
    }

    async fn save_index_checkpoint(&self, cursor: Option<IndexCursor>) -> crate::Result<()> {
        let mut state = self.state.write().await;
        write_json(&self.checkpoint_path(), &cursor)
            .await
            .context("Failed to save index checkpoint")?;
        state.checkpoint = cursor;
        Ok(())
    }
}
