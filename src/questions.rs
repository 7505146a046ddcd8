//! Question records and the store contract the search pipeline consumes.
//!
//! The real application keeps questions in its own database; this crate only
//! needs the handful of read paths below plus a way to write an embedding
//! back. [`JsonStore`] is a file-backed in-memory implementation of that
//! contract.

use crate::{
    semantic::{self, lexical::TextMatch, Neighbor},
    storage::{self, StorageManager},
    visibility::{is_visible, ApprovalStatus, Viewer},
};
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex, RwLock},
    time::Instant,
};

const QUESTIONS_FILE: &str = "questions.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionStatus {
    #[default]
    Open,
    Answered,
    Closed,
}

impl std::str::FromStr for QuestionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "OPEN" => Ok(QuestionStatus::Open),
            "ANSWERED" => Ok(QuestionStatus::Answered),
            "CLOSED" => Ok(QuestionStatus::Closed),
            other => anyhow::bail!("unknown question status {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Author {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Category {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Answer {
    pub id: u64,
    pub author_id: u64,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: u64,
    pub title: String,
    /// Legacy HTML or block-editor JSON
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: QuestionStatus,
    #[serde(default)]
    pub approval_status: ApprovalStatus,
    pub author: Author,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub answers: Vec<Answer>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Question {
    pub fn answer_count(&self) -> usize {
        self.answers.len()
    }

    /// The stored embedding, if it has the expected length.
    pub fn embedding_with_dimensions(&self, dimensions: usize) -> Option<&[f32]> {
        self.embedding
            .as_deref()
            .filter(|embedding| embedding.len() == dimensions)
    }
}

/// Everything a scan can be narrowed by. Visibility is always applied.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub viewer: Viewer,
    pub category_id: Option<u64>,
    pub author_id: Option<u64>,
    pub status: Option<QuestionStatus>,
    pub approval_status: Option<ApprovalStatus>,
    pub text: Option<TextMatch>,
    pub exclude: HashSet<u64>,
    pub limit: Option<usize>,
}

impl ScanFilter {
    pub fn for_viewer(viewer: Viewer) -> Self {
        Self {
            viewer,
            ..Default::default()
        }
    }

    /// Everything except the free-text match and the limit.
    pub fn admits(&self, question: &Question) -> bool {
        if self.exclude.contains(&question.id) {
            return false;
        }

        if !is_visible(&self.viewer, question.author.id, question.approval_status) {
            return false;
        }

        if let Some(category_id) = self.category_id {
            if !question.categories.iter().any(|c| c.id == category_id) {
                return false;
            }
        }

        if let Some(author_id) = self.author_id {
            if question.author.id != author_id {
                return false;
            }
        }

        if let Some(status) = self.status {
            if question.status != status {
                return false;
            }
        }

        if let Some(approval_status) = self.approval_status {
            if question.approval_status != approval_status {
                return false;
            }
        }

        true
    }
}

pub trait QuestionStore: Send + Sync {
    fn get(&self, id: u64) -> anyhow::Result<Option<Question>>;

    /// Filtered scan. With a text match the order is relational relevance,
    /// otherwise newest first.
    fn scan(&self, filter: &ScanFilter) -> anyhow::Result<Vec<Question>>;

    /// Nearest neighbours of `vector` among questions admitted by `filter`,
    /// closest first. Filtering happens before the limit is applied.
    fn nearest(
        &self,
        vector: &[f32],
        filter: &ScanFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<Neighbor>>;

    fn set_embedding(&self, id: u64, embedding: Vec<f32>) -> anyhow::Result<()>;

    /// Full records for `ids`. Unknown ids are skipped; order is not kept.
    fn fetch_many(&self, ids: &[u64]) -> anyhow::Result<Vec<Question>>;

    fn all_ids(&self) -> anyhow::Result<Vec<u64>>;
}

/// Questions kept in memory and mirrored to `questions.json`.
#[derive(Clone)]
pub struct JsonStore {
    list: Arc<RwLock<Vec<Question>>>,
    storage: Arc<dyn StorageManager>,
    /// Serializes file writes. Held while snapshotting and writing, never
    /// together with the list's write lock.
    save_lock: Arc<Mutex<()>>,
}

impl JsonStore {
    pub fn load(base_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let storage = storage::BackendLocal::new(base_path.as_ref())?;

        if !storage.exists(QUESTIONS_FILE) {
            log::info!(
                "Creating new question store at {:?}",
                storage.base_dir.join(QUESTIONS_FILE)
            );
            storage.write(QUESTIONS_FILE, b"[]")?;
        }

        let now = Instant::now();
        let raw = storage.read(QUESTIONS_FILE)?;
        let questions: Vec<Question> =
            serde_json::from_slice(&raw).context("questions.json is malformed")?;

        log::debug!(
            "took {}ms to read {} questions",
            now.elapsed().as_micros() as f64 / 1000.0,
            questions.len()
        );

        Ok(Self::with_storage(questions, Arc::new(storage)))
    }

    pub fn with_storage(questions: Vec<Question>, storage: Arc<dyn StorageManager>) -> Self {
        Self {
            list: Arc::new(RwLock::new(questions)),
            storage,
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn len(&self) -> usize {
        self.read().map(|list| list.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> anyhow::Result<std::sync::RwLockReadGuard<'_, Vec<Question>>> {
        self.list
            .read()
            .map_err(|e| anyhow!("question store lock poisoned: {e}"))
    }

    /// Writes the current list. The read lock is released before the file
    /// is touched, so lookups keep going during the write.
    fn save(&self) -> anyhow::Result<()> {
        let _guard = self
            .save_lock
            .lock()
            .map_err(|e| anyhow!("question file lock poisoned: {e}"))?;

        let data = {
            let questions = self.read()?;
            serde_json::to_vec_pretty(&*questions)?
        };

        self.storage.write(QUESTIONS_FILE, &data)?;
        Ok(())
    }
}

impl QuestionStore for JsonStore {
    fn get(&self, id: u64) -> anyhow::Result<Option<Question>> {
        Ok(self.read()?.iter().find(|q| q.id == id).cloned())
    }

    fn scan(&self, filter: &ScanFilter) -> anyhow::Result<Vec<Question>> {
        let questions = self.read()?;

        let mut output = match &filter.text {
            Some(text) => {
                let mut hits = questions
                    .iter()
                    .filter(|q| filter.admits(q))
                    .filter_map(|q| text.score(q).map(|hit| (hit, q)))
                    .collect::<Vec<_>>();

                hits.sort_by(|(a_hit, a), (b_hit, b)| {
                    b_hit
                        .cmp(a_hit)
                        .then_with(|| b.created_at.cmp(&a.created_at))
                        .then_with(|| b.id.cmp(&a.id))
                });

                hits.into_iter().map(|(_, q)| q.clone()).collect::<Vec<_>>()
            }
            None => {
                let mut list = questions
                    .iter()
                    .filter(|q| filter.admits(q))
                    .cloned()
                    .collect::<Vec<_>>();
                list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
                list
            }
        };

        if let Some(limit) = filter.limit {
            output.truncate(limit);
        }

        Ok(output)
    }

    fn nearest(
        &self,
        vector: &[f32],
        filter: &ScanFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<Neighbor>> {
        let questions = self.read()?;

        let candidates = questions
            .iter()
            .filter(|q| filter.admits(q))
            .filter(|q| filter.text.as_ref().map_or(true, |text| text.score(q).is_some()))
            .filter_map(|q| {
                q.embedding_with_dimensions(vector.len())
                    .map(|embedding| (q.id, embedding))
            });

        Ok(semantic::index::rank_nearest(vector, candidates, limit))
    }

    fn set_embedding(&self, id: u64, embedding: Vec<f32>) -> anyhow::Result<()> {
        {
            let mut questions = self
                .list
                .write()
                .map_err(|e| anyhow!("question store lock poisoned: {e}"))?;

            let question = questions
                .iter_mut()
                .find(|q| q.id == id)
                .ok_or_else(|| anyhow!("question with id {id} not found"))?;
            question.embedding = Some(embedding);
        }

        self.save()
    }

    fn fetch_many(&self, ids: &[u64]) -> anyhow::Result<Vec<Question>> {
        let wanted = ids.iter().copied().collect::<HashSet<_>>();
        Ok(self
            .read()?
            .iter()
            .filter(|q| wanted.contains(&q.id))
            .cloned()
            .collect())
    }

    fn all_ids(&self) -> anyhow::Result<Vec<u64>> {
        Ok(self.read()?.iter().map(|q| q.id).collect())
    }
}

/// Restores `ids` order over an unordered batch of records.
pub fn order_by_ids(ids: &[u64], questions: Vec<Question>) -> Vec<Question> {
    let mut by_id = questions
        .into_iter()
        .map(|q| (q.id, q))
        .collect::<HashMap<_, _>>();

    ids.iter().filter_map(|id| by_id.remove(id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::OnceLock;

    /// In-memory backend that checks whether the list is readable while
    /// the file is being written.
    #[derive(Default)]
    struct WatchingStorage {
        store: OnceLock<JsonStore>,
        readable_during_write: AtomicBool,
        data: Mutex<Vec<u8>>,
    }

    impl StorageManager for WatchingStorage {
        fn write(&self, _ident: &str, data: &[u8]) -> std::io::Result<()> {
            let readable = self
                .store
                .get()
                .is_some_and(|store| store.list.try_read().is_ok());
            self.readable_during_write.store(readable, Ordering::SeqCst);
            *self.data.lock().unwrap() = data.to_vec();
            Ok(())
        }

        fn read(&self, _ident: &str) -> std::io::Result<Vec<u8>> {
            Ok(self.data.lock().unwrap().clone())
        }

        fn exists(&self, _ident: &str) -> bool {
            true
        }
    }

    #[test]
    fn test_set_embedding_writes_without_holding_the_list() {
        let question: Question =
            serde_json::from_str(r#"{"id": 1, "title": "Visa letters", "author": {"id": 2, "name": "Ana"}}"#)
                .unwrap();

        let storage = Arc::new(WatchingStorage::default());
        let store = JsonStore::with_storage(vec![question], storage.clone());
        assert!(storage.store.set(store.clone()).is_ok());

        store.set_embedding(1, vec![0.5, 0.25]).unwrap();

        assert!(storage.readable_during_write.load(Ordering::SeqCst));
        let saved: Vec<Question> = serde_json::from_slice(&storage.data.lock().unwrap()).unwrap();
        assert_eq!(saved[0].embedding, Some(vec![0.5, 0.25]));
        assert_eq!(store.get(1).unwrap().unwrap().embedding, Some(vec![0.5, 0.25]));
    }
}
