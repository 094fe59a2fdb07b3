use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::RwLock;

use tether_types::{ConversationMessage, TranscriptEntry};

const MESSAGES_FILE: &str = "ui_messages.json";
const TRANSCRIPT_FILE: &str = "api_conversation_history.json";

/// Durable store for a task's two logs. Saves replace the whole log.
#[async_trait]
pub trait TaskPersistence: Send + Sync {
    async fn save_messages(
        &self,
        task_id: &str,
        messages: &[ConversationMessage],
    ) -> anyhow::Result<()>;

    async fn save_transcript(
        &self,
        task_id: &str,
        transcript: &[TranscriptEntry],
    ) -> anyhow::Result<()>;

    async fn load_messages(&self, task_id: &str) -> anyhow::Result<Vec<ConversationMessage>>;

    async fn load_transcript(&self, task_id: &str) -> anyhow::Result<Vec<TranscriptEntry>>;
}

/// Backoff schedule for saves: an immediate attempt, then one retry per delay.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: vec![
                Duration::from_millis(100),
                Duration::from_millis(500),
                Duration::from_millis(1_500),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn new(backoff: Vec<Duration>) -> Self {
        Self { backoff }
    }

    pub fn attempts(&self) -> usize {
        self.backoff.len() + 1
    }
}

/// Runs `op` until it succeeds or the schedule is exhausted. Failure is
/// reported as `false` and logged, never raised.
pub async fn save_with_retry<F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut delays = policy.backoff.iter();
    let mut attempt = 1usize;
    loop {
        match op().await {
            Ok(()) => return true,
            Err(err) => match delays.next() {
                Some(delay) => {
                    tracing::debug!(what, attempt, error = %err, "save failed, retrying");
                    tokio::time::sleep(*delay).await;
                    attempt += 1;
                }
                None => {
                    tracing::warn!(what, attempts = attempt, error = %err, "save failed, giving up");
                    return false;
                }
            },
        }
    }
}

/// One directory per task holding pretty-printed JSON logs. Writes go to a
/// temp file first and are renamed into place.
pub struct JsonFileStore {
    base: PathBuf,
}

impl JsonFileStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)
            .await
            .with_context(|| format!("creating task store at {}", base.display()))?;
        Ok(Self { base })
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.base.join(task_id)
    }

    async fn write<T: Serialize + ?Sized>(&self, task_id: &str, file: &str, value: &T) -> anyhow::Result<()> {
        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir).await?;
        let payload = serde_json::to_string_pretty(value)?;
        let target = dir.join(file);
        let tmp = dir.join(format!(".{file}.tmp"));
        fs::write(&tmp, payload)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &target)
            .await
            .with_context(|| format!("replacing {}", target.display()))?;
        Ok(())
    }

    async fn read<T: DeserializeOwned>(&self, task_id: &str, file: &str) -> anyhow::Result<Vec<T>> {
        let path = self.task_dir(task_id).join(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).await?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

#[async_trait]
impl TaskPersistence for JsonFileStore {
    async fn save_messages(
        &self,
        task_id: &str,
        messages: &[ConversationMessage],
    ) -> anyhow::Result<()> {
        self.write(task_id, MESSAGES_FILE, messages).await
    }

    async fn save_transcript(
        &self,
        task_id: &str,
        transcript: &[TranscriptEntry],
    ) -> anyhow::Result<()> {
        self.write(task_id, TRANSCRIPT_FILE, transcript).await
    }

    async fn load_messages(&self, task_id: &str) -> anyhow::Result<Vec<ConversationMessage>> {
        self.read(task_id, MESSAGES_FILE).await
    }

    async fn load_transcript(&self, task_id: &str) -> anyhow::Result<Vec<TranscriptEntry>> {
        self.read(task_id, TRANSCRIPT_FILE).await
    }
}

/// In-process store, used by tests and dry runs. Can be told to fail the next
/// few saves.
#[derive(Default)]
pub struct MemoryPersistence {
    messages: RwLock<HashMap<String, Vec<ConversationMessage>>>,
    transcripts: RwLock<HashMap<String, Vec<TranscriptEntry>>>,
    failures_left: AtomicUsize,
    save_calls: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_saves(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> anyhow::Result<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            anyhow::bail!("injected save failure");
        }
        Ok(())
    }
}

#[async_trait]
impl TaskPersistence for MemoryPersistence {
    async fn save_messages(
        &self,
        task_id: &str,
        messages: &[ConversationMessage],
    ) -> anyhow::Result<()> {
        self.check_failure()?;
        self.messages
            .write()
            .await
            .insert(task_id.to_string(), messages.to_vec());
        Ok(())
    }

    async fn save_transcript(
        &self,
        task_id: &str,
        transcript: &[TranscriptEntry],
    ) -> anyhow::Result<()> {
        self.check_failure()?;
        self.transcripts
            .write()
            .await
            .insert(task_id.to_string(), transcript.to_vec());
        Ok(())
    }

    async fn load_messages(&self, task_id: &str) -> anyhow::Result<Vec<ConversationMessage>> {
        Ok(self
            .messages
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn load_transcript(&self, task_id: &str) -> anyhow::Result<Vec<TranscriptEntry>> {
        Ok(self
            .transcripts
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::{ContentBlock, MessageKind, Role, SayType};

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_third_attempt() {
        let store = MemoryPersistence::new();
        store.fail_next_saves(2);
        let started = tokio::time::Instant::now();

        let ok = save_with_retry(&RetryPolicy::default(), "messages", || {
            store.save_messages("task_a", &[])
        })
        .await;

        assert!(ok);
        assert_eq!(store.save_calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_schedule() {
        let store = MemoryPersistence::new();
        store.fail_next_saves(10);

        let ok = save_with_retry(&RetryPolicy::default(), "transcript", || {
            store.save_transcript("task_a", &[])
        })
        .await;

        assert!(!ok);
        assert_eq!(store.save_calls(), RetryPolicy::default().attempts());
    }

    #[tokio::test]
    async fn json_file_store_round_trips_both_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path()).await.expect("store");
        let messages = vec![ConversationMessage::new(
            7,
            MessageKind::Say(SayType::Text),
            Some("hello".to_string()),
        )];
        let transcript = vec![TranscriptEntry::new(
            Role::User,
            vec![ContentBlock::text("hi")],
        )];

        store.save_messages("task_x", &messages).await.expect("save messages");
        store
            .save_transcript("task_x", &transcript)
            .await
            .expect("save transcript");

        assert!(store.task_dir("task_x").join(MESSAGES_FILE).exists());
        assert!(!store.task_dir("task_x").join(".ui_messages.json.tmp").exists());
        assert_eq!(store.load_messages("task_x").await.expect("load"), messages);
        assert_eq!(
            store.load_transcript("task_x").await.expect("load").len(),
            1
        );
        assert!(store
            .load_messages("task_missing")
            .await
            .expect("load missing")
            .is_empty());
    }
}
