//! Process-scoped intern pools for strings, paths, symbols, and token text.
//!
//! Pip graphs reference names through small interned ids rather than owned
//! strings, which keeps the serialized graph compact and makes id equality
//! equivalent to value equality. The pools are thread-safe, created once at
//! engine startup, and passed explicitly to everything that needs them —
//! there is no global mutable state.
//!
//! Each pool serializes to its own engine-cache artifact; a graph is only
//! loadable together with the pools it was constructed against, which the
//! cache layer enforces through the artifact cohort.

use std::{collections::HashMap, marker::PhantomData, sync::Arc, sync::RwLock};

use color_eyre::{Result, eyre::eyre};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Marker for general strings (pip descriptions, argument fragments).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Str;

/// Marker for filesystem paths.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PathStr;

/// Marker for symbols (pip names, output value names).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Symbol;

/// Marker for token text (literal fragments carried through evaluation).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TokenText;

pub type StringTable = InternTable<Str>;
pub type PathTable = InternTable<PathStr>;
pub type SymbolTable = InternTable<Symbol>;
pub type TokenTextTable = InternTable<TokenText>;

pub type StringId = InternId<Str>;
pub type PathId = InternId<PathStr>;
pub type SymbolId = InternId<Symbol>;
pub type TokenTextId = InternId<TokenText>;

/// An id into one intern table. Ids are dense indexes assigned in interning
/// order, so a table and the ids minted from it serialize and reload
/// together without fixups.
#[derive(Display, Serialize, Deserialize)]
#[display("{_0}")]
#[serde(transparent)]
pub struct InternId<K>(u32, #[serde(skip)] PhantomData<K>);

// Manual impls: derived ones would bound on `K`, but ids are plain numbers
// regardless of the marker.
impl<K> Copy for InternId<K> {}
impl<K> Clone for InternId<K> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K> PartialEq for InternId<K> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<K> Eq for InternId<K> {}
impl<K> PartialOrd for InternId<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<K> Ord for InternId<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}
impl<K> std::hash::Hash for InternId<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}
impl<K> std::fmt::Debug for InternId<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InternId({})", self.0)
    }
}

impl<K> InternId<K> {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

struct Inner {
    entries: Vec<Arc<str>>,
    index: HashMap<Arc<str>, u32>,
}

/// A thread-safe intern pool.
///
/// Interning the same text twice returns the same id; resolving an id
/// returns the text. Reads vastly outnumber writes during evaluation, so the
/// pool is guarded by an `RwLock` rather than a mutex.
pub struct InternTable<K> {
    kind: PhantomData<K>,
    inner: RwLock<Inner>,
}

impl<K> Default for InternTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> InternTable<K> {
    pub fn new() -> Self {
        Self {
            kind: PhantomData,
            inner: RwLock::new(Inner {
                entries: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Intern the text, returning its id. Idempotent.
    pub fn intern(&self, text: impl AsRef<str>) -> InternId<K> {
        let text = text.as_ref();
        {
            let inner = self.inner.read().unwrap_or_else(|err| err.into_inner());
            if let Some(&id) = inner.index.get(text) {
                return InternId(id, PhantomData);
            }
        }
        let mut inner = self.inner.write().unwrap_or_else(|err| err.into_inner());
        if let Some(&id) = inner.index.get(text) {
            return InternId(id, PhantomData);
        }
        let id = inner.entries.len() as u32;
        let entry: Arc<str> = Arc::from(text);
        inner.entries.push(Arc::clone(&entry));
        inner.index.insert(entry, id);
        InternId(id, PhantomData)
    }

    /// Resolve an id back to its text. Errors on an id this table never
    /// minted, which indicates the id and table are from different cohorts.
    pub fn resolve(&self, id: InternId<K>) -> Result<Arc<str>> {
        let inner = self.inner.read().unwrap_or_else(|err| err.into_inner());
        inner
            .entries
            .get(id.0 as usize)
            .cloned()
            .ok_or_else(|| eyre!("intern id {} out of range (table has {})", id.0, inner.entries.len()))
    }

    /// Number of interned entries.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|err| err.into_inner());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the table for serialization: entries in id order.
    pub fn snapshot(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|err| err.into_inner());
        inner.entries.iter().map(|entry| entry.to_string()).collect()
    }

    /// Rebuild a table from a serialized snapshot. Ids minted by the
    /// original table resolve identically in the rebuilt one.
    pub fn from_snapshot(entries: Vec<String>) -> Self {
        let table = Self::new();
        {
            let mut inner = table.inner.write().unwrap_or_else(|err| err.into_inner());
            for (position, text) in entries.into_iter().enumerate() {
                let entry: Arc<str> = Arc::from(text.as_str());
                inner.entries.push(Arc::clone(&entry));
                inner.index.insert(entry, position as u32);
            }
        }
        table
    }
}

impl<K> PartialEq for InternTable<K> {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}
impl<K> Eq for InternTable<K> {}

impl<K> std::fmt::Debug for InternTable<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternTable").field("len", &self.len()).finish()
    }
}

/// The four intern pools the engine creates at startup and threads through
/// graph construction, serialization, and execution.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InternPools {
    pub strings: StringTable,
    pub paths: PathTable,
    pub symbols: SymbolTable,
    pub token_texts: TokenTextTable,
}

impl InternPools {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}
