//! Bounded pool of editor buffers, one per content block.
//!
//! Buffers are non-authoritative caches of replicated text: content that
//! differs is replaced wholesale, never merged. The pool grows freely between
//! sweeps; [`BufferCache::sweep`] brings it back under the cap by disposing
//! the least recently accessed entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::time::Instant;

use crate::model::BlockId;

/// Default cap on live buffers.
pub const MAX_CACHED_BUFFERS: usize = 50;

/// A text buffer owned by the editor engine.
pub trait TextBuffer: Send {
    fn content(&self) -> String;
    fn set_content(&mut self, content: &str);
    fn language(&self) -> &str;
    fn set_language(&mut self, language: &str);
    /// Release native resources. Called exactly once, before removal.
    fn dispose(&mut self);
}

/// Allocates [`TextBuffer`]s.
pub trait EditorEngine: Send {
    fn create_buffer(&self, content: &str, language: &str) -> Box<dyn TextBuffer>;
}

/// Creation and disposal counters shared by a [`MemoryEngine`] and its buffers.
#[derive(Debug, Default)]
pub struct EngineStats {
    created: AtomicUsize,
    disposed: AtomicUsize,
}

impl EngineStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Buffers created and not yet disposed.
    pub fn live(&self) -> usize {
        self.created() - self.disposed()
    }
}

/// Engine backed by plain strings. Used headless and in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    stats: Arc<EngineStats>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }
}

impl EditorEngine for MemoryEngine {
    fn create_buffer(&self, content: &str, language: &str) -> Box<dyn TextBuffer> {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Box::new(MemoryBuffer {
            content: content.to_string(),
            language: language.to_string(),
            disposed: false,
            stats: self.stats.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MemoryBuffer {
    content: String,
    language: String,
    disposed: bool,
    stats: Arc<EngineStats>,
}

impl TextBuffer for MemoryBuffer {
    fn content(&self) -> String {
        self.content.clone()
    }

    fn set_content(&mut self, content: &str) {
        self.content = content.to_string();
    }

    fn language(&self) -> &str {
        &self.language
    }

    fn set_language(&mut self, language: &str) {
        self.language = language.to_string();
    }

    fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.stats.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct BufferEntry {
    buffer: Box<dyn TextBuffer>,
    last_accessed: Instant,
    /// Monotonic tie-breaker for equal timestamps.
    access_seq: u64,
}

/// Recency-bounded buffer pool.
pub struct BufferCache {
    engine: Option<Box<dyn EditorEngine>>,
    entries: HashMap<BlockId, BufferEntry>,
    max_buffers: usize,
    access_counter: u64,
}

impl BufferCache {
    pub fn new(max_buffers: usize) -> Self {
        Self {
            engine: None,
            entries: HashMap::new(),
            max_buffers,
            access_counter: 0,
        }
    }

    /// Install the engine that allocates buffers.
    pub fn attach_engine(&mut self, engine: Box<dyn EditorEngine>) {
        self.engine = Some(engine);
    }

    pub fn has_engine(&self) -> bool {
        self.engine.is_some()
    }

    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, block_id: BlockId) -> bool {
        self.entries.contains_key(&block_id)
    }

    fn next_seq(&mut self) -> u64 {
        self.access_counter += 1;
        self.access_counter
    }

    /// Return the block's buffer, creating it if needed.
    ///
    /// An existing entry is refreshed: its language is updated in place and
    /// differing content is replaced wholesale.
    ///
    /// # Panics
    ///
    /// Panics if no engine has been attached.
    pub fn get_or_create(
        &mut self,
        block_id: BlockId,
        initial_content: &str,
        language: &str,
    ) -> &mut dyn TextBuffer {
        let seq = self.next_seq();
        let now = Instant::now();
        let engine = self
            .engine
            .as_ref()
            .unwrap_or_else(|| panic!("BufferCache used before an editor engine was attached"));

        let entry = self.entries.entry(block_id).or_insert_with(|| {
            log::debug!("Creating buffer for block {block_id}");
            BufferEntry {
                buffer: engine.create_buffer(initial_content, language),
                last_accessed: now,
                access_seq: seq,
            }
        });
        entry.last_accessed = now;
        entry.access_seq = seq;
        if entry.buffer.language() != language {
            entry.buffer.set_language(language);
        }
        if entry.buffer.content() != initial_content {
            entry.buffer.set_content(initial_content);
        }
        entry.buffer.as_mut()
    }

    pub fn get(&self, block_id: BlockId) -> Option<&dyn TextBuffer> {
        self.entries.get(&block_id).map(|e| e.buffer.as_ref())
    }

    /// Replace a buffer's content. No-op when missing or unchanged.
    pub fn update_content(&mut self, block_id: BlockId, content: &str) -> bool {
        match self.entries.get_mut(&block_id) {
            Some(entry) if entry.buffer.content() != content => {
                entry.buffer.set_content(content);
                true
            }
            _ => false,
        }
    }

    /// Change a buffer's language tag in place. No-op when missing or unchanged.
    pub fn set_language(&mut self, block_id: BlockId, language: &str) -> bool {
        match self.entries.get_mut(&block_id) {
            Some(entry) if entry.buffer.language() != language => {
                entry.buffer.set_language(language);
                true
            }
            _ => false,
        }
    }

    /// Dispose one buffer, then remove it. Safe to repeat.
    pub fn dispose(&mut self, block_id: BlockId) -> bool {
        let Some(entry) = self.entries.get_mut(&block_id) else {
            return false;
        };
        entry.buffer.dispose();
        self.entries.remove(&block_id);
        true
    }

    /// Dispose every buffer, then empty the pool. Safe to repeat.
    pub fn dispose_all(&mut self) -> usize {
        let count = self.entries.len();
        for entry in self.entries.values_mut() {
            entry.buffer.dispose();
        }
        self.entries.clear();
        if count > 0 {
            log::debug!("Disposed {count} buffers");
        }
        count
    }

    /// Evict least recently accessed buffers until at most `max_buffers`
    /// remain. Returns the evicted block ids, oldest first.
    pub fn sweep(&mut self) -> Vec<BlockId> {
        let excess = self.entries.len().saturating_sub(self.max_buffers);
        if excess == 0 {
            return Vec::new();
        }

        let mut by_age: Vec<(Instant, u64, BlockId)> = self
            .entries
            .iter()
            .map(|(id, e)| (e.last_accessed, e.access_seq, *id))
            .collect();
        by_age.sort_unstable();

        let victims: Vec<BlockId> = by_age.into_iter().take(excess).map(|(_, _, id)| id).collect();
        for id in &victims {
            self.dispose(*id);
        }
        log::debug!("Sweep evicted {} buffers", victims.len());
        victims
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.dispose_all();
    }
}
