use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration, TimeZone, Utc};

use crate::config::SemanticSearchConfig;
use crate::questions::{
    Answer, Author, Category, JsonStore, Question, QuestionStatus, QuestionStore, ScanFilter,
};
use crate::semantic::embeddings::EmbeddingError;
use crate::semantic::{Neighbor, ProviderKind, SearchService, TextEmbedder};
use crate::storage;
use crate::visibility::ApprovalStatus;

pub const DIMS: usize = 3;

pub fn config() -> SemanticSearchConfig {
    SemanticSearchConfig {
        dimensions: Some(DIMS),
        ..Default::default()
    }
}

pub fn question(id: u64, title: &str, author_id: u64, approval: ApprovalStatus) -> Question {
    Question {
        id,
        title: title.to_string(),
        content: String::new(),
        status: QuestionStatus::Open,
        approval_status: approval,
        author: Author {
            id: author_id,
            name: format!("user {author_id}"),
        },
        categories: vec![],
        tags: vec![],
        answers: vec![],
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(id as i64),
        embedding: None,
    }
}

pub fn approved(id: u64, title: &str) -> Question {
    question(id, title, 100 + id, ApprovalStatus::Approved)
}

pub fn with_embedding(mut q: Question, embedding: &[f32]) -> Question {
    q.embedding = Some(embedding.to_vec());
    q
}

pub fn with_category(mut q: Question, id: u64, name: &str) -> Question {
    q.categories.push(Category {
        id,
        name: name.to_string(),
    });
    q
}

pub fn with_answers(mut q: Question, count: usize) -> Question {
    for i in 0..count {
        q.answers.push(Answer {
            id: q.id * 100 + i as u64,
            author_id: 1,
            content: format!("answer {i}"),
            created_at: q.created_at,
        });
    }
    q
}

/// Store in a fresh temp dir. Keep the dir alive for the test's duration.
pub fn store(questions: Vec<Question>) -> (tempfile::TempDir, Arc<JsonStore>) {
    let tmp = tempfile::tempdir().unwrap();
    let backend = storage::BackendLocal::new(tmp.path()).unwrap();
    let store = JsonStore::with_storage(questions, Arc::new(backend));
    (tmp, Arc::new(store))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubMode {
    Ready,
    NoCredential,
    Down,
}

/// Embedder that maps text to fixed vectors by keyword and counts calls.
pub struct StubEmbedder {
    rules: Vec<(&'static str, Vec<f32>)>,
    default: Vec<f32>,
    mode: StubMode,
    calls: AtomicUsize,
    inputs: Mutex<Vec<String>>,
}

impl StubEmbedder {
    pub fn new(mode: StubMode) -> Self {
        Self {
            rules: vec![],
            default: vec![0.0, 0.0, 1.0],
            mode,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(vec![]),
        }
    }

    pub fn rule(mut self, keyword: &'static str, vector: &[f32]) -> Self {
        self.rules.push((keyword, vector.to_vec()));
        self
    }

    pub fn default_vector(mut self, vector: &[f32]) -> Self {
        self.default = vector.to_vec();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_input(&self) -> Option<String> {
        self.inputs.lock().unwrap().last().cloned()
    }
}

impl TextEmbedder for StubEmbedder {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn is_available(&self) -> bool {
        self.mode != StubMode::NoCredential
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(text.to_string());

        match self.mode {
            StubMode::NoCredential => Err(EmbeddingError::CredentialMissing(ProviderKind::Gemini)),
            StubMode::Down => Err(EmbeddingError::ProviderUnavailable(
                ProviderKind::Gemini,
                "503 Service Unavailable".to_string(),
            )),
            StubMode::Ready => {
                let text = text.to_lowercase();
                Ok(self
                    .rules
                    .iter()
                    .find(|(keyword, _)| text.contains(keyword))
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| self.default.clone()))
            }
        }
    }
}

/// Wraps a store and fails selected operations.
pub struct FlakyStore {
    pub inner: Arc<JsonStore>,
    pub fail_scan: AtomicBool,
    pub fail_nearest: AtomicBool,
    pub fail_set_embedding: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<JsonStore>) -> Self {
        Self {
            inner,
            fail_scan: AtomicBool::new(false),
            fail_nearest: AtomicBool::new(false),
            fail_set_embedding: AtomicBool::new(false),
        }
    }
}

impl QuestionStore for FlakyStore {
    fn get(&self, id: u64) -> anyhow::Result<Option<Question>> {
        self.inner.get(id)
    }

    fn scan(&self, filter: &ScanFilter) -> anyhow::Result<Vec<Question>> {
        if self.fail_scan.load(Ordering::SeqCst) {
            anyhow::bail!("connection reset");
        }
        self.inner.scan(filter)
    }

    fn nearest(
        &self,
        vector: &[f32],
        filter: &ScanFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<Neighbor>> {
        if self.fail_nearest.load(Ordering::SeqCst) {
            anyhow::bail!("operator does not exist: vector <=> vector");
        }
        self.inner.nearest(vector, filter, limit)
    }

    fn set_embedding(&self, id: u64, embedding: Vec<f32>) -> anyhow::Result<()> {
        if self.fail_set_embedding.load(Ordering::SeqCst) {
            anyhow::bail!("read-only replica");
        }
        self.inner.set_embedding(id, embedding)
    }

    fn fetch_many(&self, ids: &[u64]) -> anyhow::Result<Vec<Question>> {
        self.inner.fetch_many(ids)
    }

    fn all_ids(&self) -> anyhow::Result<Vec<u64>> {
        self.inner.all_ids()
    }
}

pub fn service<S: QuestionStore + ?Sized>(
    store: Arc<S>,
    embedder: StubEmbedder,
) -> (SearchService<S, StubEmbedder>, Arc<StubEmbedder>) {
    let embedder = Arc::new(embedder);
    (SearchService::new(config(), store, embedder.clone()), embedder)
}
