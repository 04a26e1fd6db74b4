//! Append-only conversational memory, bounded per dataset.
//!
//! Records are persisted as JSON Lines. Each append is a single write
//! followed by `sync_data`, so an interrupted write can only damage the last
//! line. On open the log is read up to the first line that does not parse and
//! the file is truncated there. Eviction and `clear` rewrite the log through a
//! temporary file and an atomic rename.
//!
//! A failed write or rewrite leaves both the log and the in-memory state as
//! they were before the call, and the error is returned.

use super::record::{AnswerSource, ConversationContext, MemoryRecord};
use crate::config::MemoryConfig;
use crate::error::{Result, ResultExt as _};
use crate::ingest::Fingerprint;
use crate::router::QuestionKind;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_records: usize,
    /// Serialized bytes per dataset. The newest record is always kept.
    pub max_bytes: Option<u64>,
}

impl RetentionPolicy {
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            max_records: config.max_records_per_dataset,
            max_bytes: config.max_bytes_per_dataset,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_config(&MemoryConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClearScope {
    Dataset(Fingerprint),
    All,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub total_records: usize,
    pub per_dataset: BTreeMap<Fingerprint, usize>,
    pub file_bytes: u64,
    pub path: Option<PathBuf>,
}

/// What has been asked about one dataset.
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetSummary {
    pub fingerprint: Fingerprint,
    /// User questions; recorded conclusions are not counted.
    pub total_questions: usize,
    pub by_kind: BTreeMap<QuestionKind, usize>,
    /// The most recent user questions, oldest first.
    pub recent: Vec<Arc<MemoryRecord>>,
    pub conclusions_recorded: usize,
}

impl DatasetSummary {
    pub fn asked(&self, kind: QuestionKind) -> usize {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Stored {
    seq: u64,
    bytes: u64,
    record: Arc<MemoryRecord>,
}

#[derive(Debug, Default)]
struct Inner {
    file: Option<File>,
    datasets: HashMap<Fingerprint, VecDeque<Stored>>,
    next_seq: u64,
}

impl Inner {
    fn push(&mut self, record: Arc<MemoryRecord>, bytes: u64) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.datasets
            .entry(record.fingerprint.clone())
            .or_default()
            .push_back(Stored { seq, bytes, record });
        seq
    }

    /// Evicts the oldest records of one dataset until it fits the policy.
    /// Returns them oldest first.
    fn enforce(&mut self, fingerprint: &Fingerprint, policy: RetentionPolicy) -> Vec<Stored> {
        let mut evicted = Vec::new();
        let Some(queue) = self.datasets.get_mut(fingerprint) else {
            return evicted;
        };
        while queue.len() > policy.max_records {
            evicted.extend(queue.pop_front());
        }
        if let Some(max_bytes) = policy.max_bytes {
            let mut total: u64 = queue.iter().map(|s| s.bytes).sum();
            while total > max_bytes && queue.len() > 1 {
                if let Some(old) = queue.pop_front() {
                    total -= old.bytes;
                    evicted.push(old);
                }
            }
        }
        evicted
    }

    /// Undoes a `push` of `seq` and the evictions it caused.
    fn rollback(&mut self, fingerprint: &Fingerprint, seq: u64, evicted: Vec<Stored>) {
        let Some(queue) = self.datasets.get_mut(fingerprint) else {
            return;
        };
        queue.retain(|s| s.seq != seq);
        for stored in evicted.into_iter().rev().filter(|s| s.seq != seq) {
            queue.push_front(stored);
        }
        if queue.is_empty() {
            self.datasets.remove(fingerprint);
        }
    }

    fn ordered(&self) -> Vec<&Stored> {
        let mut all: Vec<&Stored> = self.datasets.values().flatten().collect();
        all.sort_by_key(|s| s.seq);
        all
    }
}

fn encode(record: &MemoryRecord) -> Result<String> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open memory log {}", path.display()))
}

#[derive(Debug)]
pub struct MemoryStore {
    path: Option<PathBuf>,
    policy: RetentionPolicy,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// A store that lives only as long as the process.
    pub fn in_memory(policy: RetentionPolicy) -> Self {
        Self {
            path: None,
            policy,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Opens (or creates) a persisted store, recovering from a damaged tail.
    pub fn open(path: impl Into<PathBuf>, policy: RetentionPolicy) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create memory directory {}", parent.display())
            })?;
        }

        let mut inner = Inner::default();
        let mut good_len: u64 = 0;
        let mut total_len: u64 = 0;

        if path.exists() {
            let mut bytes = Vec::new();
            File::open(&path)
                .and_then(|mut f| f.read_to_end(&mut bytes))
                .with_context(|| format!("Failed to read memory log {}", path.display()))?;
            total_len = bytes.len() as u64;

            let mut rest = bytes.as_slice();
            while let Some(end) = rest.iter().position(|&b| b == b'\n') {
                let line = &rest[..end];
                match serde_json::from_slice::<MemoryRecord>(line) {
                    Ok(record) => {
                        let len = end as u64 + 1;
                        inner.push(Arc::new(record), len);
                        good_len += len;
                        rest = &rest[end + 1..];
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Memory log {} is corrupt at byte {good_len}: {e}",
                            path.display()
                        );
                        break;
                    }
                }
            }

            if good_len < total_len {
                tracing::warn!(
                    "Discarding {} bytes after the last valid record in {}",
                    total_len - good_len,
                    path.display()
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(good_len)?;
                file.sync_all()?;
            }
        }

        inner.file = Some(open_append(&path)?);
        let store = Self {
            path: Some(path),
            policy,
            inner: Mutex::new(inner),
        };

        // the cap may have shrunk since the log was written
        let mut guard = store.lock();
        let fingerprints: Vec<Fingerprint> = guard.datasets.keys().cloned().collect();
        let evicted: usize = fingerprints
            .iter()
            .map(|fp| guard.enforce(fp, store.policy).len())
            .sum();
        if evicted > 0 {
            tracing::info!("Evicted {evicted} records over the retention cap on open");
            store.rewrite(&mut guard)?;
        }
        drop(guard);

        tracing::debug!(
            records = store.stats().total_records,
            "Opened memory store at {:?}",
            store.path
        );
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Appends a record, evicting that dataset's oldest records if the cap is exceeded.
    pub fn append(&self, record: MemoryRecord) -> Result<Arc<MemoryRecord>> {
        let line = encode(&record)?;
        let record = Arc::new(record);
        let mut inner = self.lock();

        let start = match self.path.as_deref() {
            Some(path) => Some(Self::write_line(&mut inner, path, &line)?),
            None => None,
        };
        let seq = inner.push(Arc::clone(&record), line.len() as u64);

        let evicted = inner.enforce(&record.fingerprint, self.policy);
        if !evicted.is_empty() {
            tracing::info!(
                fingerprint = %record.fingerprint.short(),
                "Evicted {} oldest memory records",
                evicted.len()
            );
            if let Err(e) = self.rewrite(&mut inner) {
                inner.rollback(&record.fingerprint, seq, evicted);
                if let (Some(start), Some(file)) = (start, inner.file.as_ref()) {
                    Self::truncate(file, start);
                }
                self.reopen(&mut inner);
                return Err(e);
            }
        }
        Ok(record)
    }

    /// Appends one line to the log, reopening it if an earlier failure closed
    /// it. Returns the log length before the write. A partial write is cut
    /// back off.
    fn write_line(inner: &mut Inner, path: &Path, line: &str) -> Result<u64> {
        let file = match inner.file.take() {
            Some(file) => file,
            None => open_append(path)?,
        };
        let file = inner.file.insert(file);
        let start = file.metadata()?.len();
        if let Err(e) = file
            .write_all(line.as_bytes())
            .and_then(|()| file.sync_data())
        {
            Self::truncate(file, start);
            return Err(e).context("Failed to append memory record");
        }
        Ok(start)
    }

    fn truncate(file: &File, len: u64) {
        if let Err(e) = file.set_len(len).and_then(|()| file.sync_data()) {
            tracing::error!("Failed to cut memory log back to {len} bytes: {e}");
        }
    }

    /// Points the append handle at whatever is at the log path now.
    fn reopen(&self, inner: &mut Inner) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        inner.file = match open_append(path) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!("{e}; the next append will try again");
                None
            }
        };
    }

    /// Records of one dataset, oldest first.
    pub fn query(&self, fingerprint: &Fingerprint) -> Vec<Arc<MemoryRecord>> {
        let inner = self.lock();
        inner
            .datasets
            .get(fingerprint)
            .map(|q| q.iter().map(|s| Arc::clone(&s.record)).collect())
            .unwrap_or_default()
    }

    pub fn context(&self, fingerprint: &Fingerprint) -> ConversationContext {
        ConversationContext::new(self.query(fingerprint))
    }

    /// Every record, in insertion order.
    pub fn all(&self) -> Vec<Arc<MemoryRecord>> {
        let inner = self.lock();
        inner
            .ordered()
            .into_iter()
            .map(|s| Arc::clone(&s.record))
            .collect()
    }

    /// The only deletion path. Returns how many records were removed.
    pub fn clear(&self, scope: &ClearScope) -> Result<usize> {
        let mut inner = self.lock();
        let taken: Vec<(Fingerprint, VecDeque<Stored>)> = match scope {
            ClearScope::Dataset(fp) => inner
                .datasets
                .remove_entry(fp)
                .into_iter()
                .collect(),
            ClearScope::All => inner.datasets.drain().collect(),
        };
        if let Err(e) = self.rewrite(&mut inner) {
            inner.datasets.extend(taken);
            self.reopen(&mut inner);
            return Err(e);
        }
        let removed = taken.iter().map(|(_, q)| q.len()).sum();
        tracing::info!("Cleared {removed} memory records ({scope:?})");
        Ok(removed)
    }

    /// Question counts by kind and the last `recent` questions of one dataset.
    pub fn summary(&self, fingerprint: &Fingerprint, recent: usize) -> DatasetSummary {
        let records = self.query(fingerprint);
        let (conclusions, questions): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| r.source == AnswerSource::Conclusions);

        let mut by_kind = BTreeMap::new();
        for record in &questions {
            *by_kind.entry(record.kind).or_insert(0) += 1;
        }
        let skip = questions.len().saturating_sub(recent);
        DatasetSummary {
            fingerprint: fingerprint.clone(),
            total_questions: questions.len(),
            by_kind,
            recent: questions.into_iter().skip(skip).collect(),
            conclusions_recorded: conclusions.len(),
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let inner = self.lock();
        let per_dataset: BTreeMap<Fingerprint, usize> = inner
            .datasets
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(fp, q)| (fp.clone(), q.len()))
            .collect();
        let file_bytes = self
            .path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map_or(0, |m| m.len());
        MemoryStats {
            total_records: per_dataset.values().sum(),
            per_dataset,
            file_bytes,
            path: self.path.clone(),
        }
    }

    fn rewrite(&self, inner: &mut Inner) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut tmp = NamedTempFile::new_in(dir).context("Failed to create temp memory log")?;
        for stored in inner.ordered() {
            tmp.write_all(encode(&stored.record)?.as_bytes())?;
        }
        tmp.as_file().sync_data()?;

        // the old handle stays usable until the new log is in place
        tmp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace memory log {}", path.display()))?;
        self.reopen(inner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(fp: &str, question: &str) -> MemoryRecord {
        MemoryRecord::new(
            Fingerprint::from(fp),
            question,
            format!("answer to {question}"),
            QuestionKind::OpenEnded,
            AnswerSource::Fallback,
        )
    }

    fn policy(max_records: usize) -> RetentionPolicy {
        RetentionPolicy {
            max_records,
            max_bytes: None,
        }
    }

    fn questions(records: &[Arc<MemoryRecord>]) -> Vec<String> {
        records.iter().map(|r| r.question.clone()).collect()
    }

    #[test]
    fn test_summary_counts_questions_by_kind() {
        let store = MemoryStore::in_memory(policy(10));
        let fp = Fingerprint::from("a");
        let asked = [
            QuestionKind::Descriptive,
            QuestionKind::Correlation,
            QuestionKind::Descriptive,
            QuestionKind::Anomaly,
        ];
        for (i, kind) in asked.into_iter().enumerate() {
            let record = MemoryRecord::new(
                fp.clone(),
                format!("q{i}"),
                "answer",
                kind,
                AnswerSource::Engine,
            );
            store.append(record).expect("append");
        }
        store
            .append(MemoryRecord::new(
                fp.clone(),
                "conclusions",
                "done",
                QuestionKind::OpenEnded,
                AnswerSource::Conclusions,
            ))
            .expect("append");
        store.append(record("b", "elsewhere")).expect("append");

        let summary = store.summary(&fp, 2);
        assert_eq!(summary.total_questions, 4);
        assert_eq!(summary.asked(QuestionKind::Descriptive), 2);
        assert_eq!(summary.asked(QuestionKind::OpenEnded), 0);
        assert_eq!(questions(&summary.recent), vec!["q2", "q3"]);
        assert_eq!(summary.conclusions_recorded, 1);

        let empty = store.summary(&Fingerprint::from("none"), 5);
        assert_eq!(empty.total_questions, 0);
        assert!(empty.recent.is_empty());
    }

    #[test]
    fn test_cap_evicts_oldest_first() {
        let store = MemoryStore::in_memory(policy(3));
        for i in 0..5 {
            store.append(record("a", &format!("q{i}"))).expect("append");
        }
        store.append(record("b", "other")).expect("append");

        let a = store.query(&Fingerprint::from("a"));
        assert_eq!(questions(&a), vec!["q2", "q3", "q4"]);
        assert_eq!(store.query(&Fingerprint::from("b")).len(), 1);
        assert_eq!(store.stats().total_records, 4);
    }

    #[test]
    fn test_byte_cap_keeps_newest_record() {
        let store = MemoryStore::in_memory(RetentionPolicy {
            max_records: 100,
            max_bytes: Some(10),
        });
        store.append(record("a", "first")).expect("append");
        store.append(record("a", "second")).expect("append");
        assert_eq!(questions(&store.query(&Fingerprint::from("a"))), vec!["second"]);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("memory.jsonl");
        {
            let store = MemoryStore::open(&path, policy(10)).expect("open");
            store.append(record("a", "one")).expect("append");
            store.append(record("b", "two")).expect("append");
            store.append(record("a", "three")).expect("append");
        }
        let store = MemoryStore::open(&path, policy(10)).expect("reopen");
        assert_eq!(questions(&store.query(&Fingerprint::from("a"))), vec!["one", "three"]);
        assert_eq!(questions(&store.all()), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_truncated_tail_is_discarded() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("memory.jsonl");
        {
            let store = MemoryStore::open(&path, policy(10)).expect("open");
            store.append(record("a", "kept")).expect("append");
        }
        let good_len = std::fs::metadata(&path).expect("metadata").len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).expect("open raw");
            file.write_all(b"{\"id\":\"half a rec").expect("write garbage");
        }

        let store = MemoryStore::open(&path, policy(10)).expect("reopen");
        assert_eq!(questions(&store.all()), vec!["kept"]);
        assert_eq!(std::fs::metadata(&path).expect("metadata").len(), good_len);

        store.append(record("a", "after")).expect("append");
        drop(store);
        let store = MemoryStore::open(&path, policy(10)).expect("reopen");
        assert_eq!(questions(&store.all()), vec!["kept", "after"]);
    }

    #[test]
    fn test_records_after_corrupt_line_are_dropped() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("memory.jsonl");
        let good = encode(&record("a", "good")).expect("encode");
        let later = encode(&record("a", "later")).expect("encode");
        std::fs::write(&path, format!("{good}not json\n{later}")).expect("write");

        let store = MemoryStore::open(&path, policy(10)).expect("open");
        assert_eq!(questions(&store.all()), vec!["good"]);
    }

    #[test]
    fn test_clear_scopes() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("memory.jsonl");
        let store = MemoryStore::open(&path, policy(10)).expect("open");
        store.append(record("a", "one")).expect("append");
        store.append(record("b", "two")).expect("append");

        assert_eq!(
            store
                .clear(&ClearScope::Dataset(Fingerprint::from("a")))
                .expect("clear"),
            1
        );
        assert!(store.query(&Fingerprint::from("a")).is_empty());

        store.append(record("b", "three")).expect("append");
        drop(store);
        let store = MemoryStore::open(&path, policy(10)).expect("reopen");
        assert_eq!(questions(&store.all()), vec!["two", "three"]);

        assert_eq!(store.clear(&ClearScope::All).expect("clear"), 2);
        assert_eq!(store.stats().total_records, 0);
        assert_eq!(store.stats().file_bytes, 0);
    }

    /// Puts a non-empty directory where the log lives, so renaming over it fails.
    fn block_log_path(path: &Path) {
        std::fs::remove_file(path).expect("remove log");
        std::fs::create_dir(path).expect("create dir");
        std::fs::write(path.join("blocker"), b"x").expect("fill dir");
    }

    #[test]
    fn test_failed_eviction_rewrite_keeps_previous_state() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("memory.jsonl");
        let store = MemoryStore::open(&path, policy(1)).expect("open");
        store.append(record("a", "one")).expect("append");

        block_log_path(&path);
        assert!(store.append(record("a", "two")).is_err());
        assert_eq!(questions(&store.query(&Fingerprint::from("a"))), vec!["one"]);

        // appends without eviction also report the missing log
        std::fs::remove_dir_all(&path).expect("unblock");
        std::fs::create_dir(&path).expect("block again");
        assert!(store.append(record("b", "lost")).is_err());
        assert!(store.query(&Fingerprint::from("b")).is_empty());

        std::fs::remove_dir_all(&path).expect("unblock");
        store.append(record("b", "three")).expect("append");
        assert!(path.is_file());
        drop(store);

        let store = MemoryStore::open(&path, policy(1)).expect("reopen");
        assert_eq!(questions(&store.all()), vec!["three"]);
    }

    #[test]
    fn test_failed_clear_keeps_records() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("memory.jsonl");
        let store = MemoryStore::open(&path, policy(10)).expect("open");
        store.append(record("a", "one")).expect("append");
        store.append(record("b", "two")).expect("append");

        block_log_path(&path);
        assert!(store.clear(&ClearScope::All).is_err());
        assert_eq!(questions(&store.all()), vec!["one", "two"]);
    }

    #[test]
    fn test_concurrent_appends_keep_order_and_cap() {
        let store = Arc::new(MemoryStore::in_memory(policy(20)));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let fp = if t % 2 == 0 { "even" } else { "odd" };
                    for i in 0..10 {
                        store.append(record(fp, &format!("{t}:{i}"))).expect("append");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        for fp in ["even", "odd"] {
            let kept = questions(&store.query(&Fingerprint::from(fp)));
            assert_eq!(kept.len(), 20);
            // each writer's questions stay in the order it appended them
            for t in 0..8 {
                let own: Vec<usize> = kept
                    .iter()
                    .filter_map(|q| q.strip_prefix(&format!("{t}:")))
                    .map(|i| i.parse().expect("index"))
                    .collect();
                assert!(own.windows(2).all(|w| w[0] < w[1]), "{fp} {t}: {own:?}");
            }
        }
        assert_eq!(store.stats().total_records, 40);
    }

    #[test]
    fn test_shrunk_cap_applies_on_open() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("memory.jsonl");
        {
            let store = MemoryStore::open(&path, policy(10)).expect("open");
            for i in 0..4 {
                store.append(record("a", &format!("q{i}"))).expect("append");
            }
        }
        let store = MemoryStore::open(&path, policy(2)).expect("reopen");
        assert_eq!(questions(&store.all()), vec!["q2", "q3"]);
    }
}
