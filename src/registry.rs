//! The ordered mod list. Index order is load order; `position` is the 1-based
//! rank and is rewritten for the whole list after every structural change.
//!
//! Each mutation is mirrored to the settings file before returning. When that
//! write fails the in-memory change is kept and the store error is returned.

use crate::{
    error::RegistryError,
    pool::{remove_with_empty_parents, CatalogueItem, StoragePools},
    profile::{ProfileStore, StoredMod},
};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Manual,
    /// `item` is unknown for entries written before identities were recorded
    /// and living outside the catalogue pool.
    Catalogue { item: Option<CatalogueItem> },
}

impl Origin {
    pub fn is_catalogue(&self) -> bool {
        matches!(self, Origin::Catalogue { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    pub display_name: String,
    pub source_path: PathBuf,
    pub enabled: bool,
    pub origin: Origin,
    pub position: usize,
}

impl PackageEntry {
    /// New entries start enabled; `position` is assigned when added.
    pub fn new(display_name: impl Into<String>, source_path: impl Into<PathBuf>, origin: Origin) -> Self {
        Self {
            display_name: display_name.into(),
            source_path: source_path.into(),
            enabled: true,
            origin,
            position: 0,
        }
    }

    fn from_stored(row: StoredMod, pools: &StoragePools) -> Self {
        let source_path = PathBuf::from(&row.file_path);
        let origin = if row.from_gamebanana {
            let recorded = row
                .category
                .zip(row.catalogue_id)
                .map(|(category, id)| CatalogueItem { category, id });
            Origin::Catalogue {
                item: recorded.or_else(|| pools.catalogue_item_of(&source_path)),
            }
        } else {
            Origin::Manual
        };
        Self {
            display_name: row.name,
            source_path,
            enabled: row.toggled_on,
            origin,
            position: 0,
        }
    }

    fn to_stored(&self) -> StoredMod {
        let item = match self.origin {
            Origin::Catalogue { item } => item,
            Origin::Manual => None,
        };
        StoredMod {
            name: self.display_name.clone(),
            file_path: self.source_path.to_string_lossy().into_owned(),
            toggled_on: self.enabled,
            from_gamebanana: self.origin.is_catalogue(),
            category: item.map(|item| item.category),
            catalogue_id: item.map(|item| item.id),
        }
    }
}

#[derive(Debug)]
pub struct Registry {
    entries: Vec<PackageEntry>,
    store: ProfileStore,
    /// Removal prunes emptied directories up to, but never including, this dir.
    storage_root: PathBuf,
}

impl Registry {
    pub fn new(store: ProfileStore, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            entries: Vec::new(),
            store,
            storage_root: storage_root.into(),
        }
    }

    /// Rebuilds the list from persisted rows without writing anything back.
    pub fn from_stored(
        store: ProfileStore,
        pools: &StoragePools,
        rows: Vec<StoredMod>,
    ) -> Self {
        let mut registry = Self::new(store, pools.root.clone());
        registry.entries = rows
            .into_iter()
            .map(|row| PackageEntry::from_stored(row, pools))
            .collect();
        registry.renumber();
        registry
    }

    pub fn entries(&self) -> &[PackageEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find_by_path(&self, path: &Path) -> Option<&PackageEntry> {
        self.entries.iter().find(|entry| entry.source_path == path)
    }

    /// Appends (or prepends when `at_end` is false) and returns the new position.
    pub fn add(&mut self, entry: PackageEntry, at_end: bool) -> Result<usize, RegistryError> {
        let position = if at_end {
            self.entries.push(entry);
            self.entries.len()
        } else {
            self.entries.insert(0, entry);
            1
        };
        self.renumber();
        tracing::debug!(position, "mod added");
        self.persist()?;
        Ok(position)
    }

    /// Drops the entry and deletes its installed file along with any directories
    /// that become empty. A failed delete is logged; the entry is still removed.
    pub fn remove(&mut self, position: usize) -> Result<PackageEntry, RegistryError> {
        let index = self.index_of(position)?;
        let entry = self.entries.remove(index);
        self.renumber();

        if let Err(err) = remove_with_empty_parents(&entry.source_path, &self.storage_root) {
            tracing::warn!(
                path = %entry.source_path.display(),
                error = %err,
                "failed to delete mod file"
            );
        }
        tracing::info!(name = %entry.display_name, "mod removed");
        self.persist()?;
        Ok(entry)
    }

    /// Blank names are ignored and return `Ok(false)`.
    pub fn rename(&mut self, position: usize, new_name: &str) -> Result<bool, RegistryError> {
        let index = self.index_of(position)?;
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Ok(false);
        }
        self.entries[index].display_name = new_name.to_string();
        self.persist()?;
        Ok(true)
    }

    pub fn set_enabled(&mut self, position: usize, enabled: bool) -> Result<(), RegistryError> {
        let index = self.index_of(position)?;
        self.entries[index].enabled = enabled;
        self.persist()
    }

    /// Moves the entry at `from` so it ends up at `to`. A `to` past the end
    /// lands last.
    pub fn reorder(&mut self, from: usize, to: usize) -> Result<(), RegistryError> {
        let from_index = self.index_of(from)?;
        if to == 0 {
            return Err(RegistryError::OutOfRange {
                position: to,
                len: self.entries.len(),
            });
        }
        let entry = self.entries.remove(from_index);
        let to_index = (to - 1).min(self.entries.len());
        self.entries.insert(to_index, entry);
        self.renumber();
        self.persist()
    }

    /// Circular, case-insensitive substring scan over display names starting at
    /// the 0-based `start` index. Returns the matching index.
    pub fn search(&self, term: &str, start: usize) -> Option<usize> {
        let len = self.entries.len();
        if len == 0 {
            return None;
        }
        let needle = term.to_lowercase();
        let start = if start >= len { 0 } else { start };
        (start..len)
            .chain(0..start)
            .find(|&index| self.entries[index].display_name.to_lowercase().contains(&needle))
    }

    fn persist(&self) -> Result<(), RegistryError> {
        let rows: Vec<StoredMod> = self.entries.iter().map(PackageEntry::to_stored).collect();
        if let Err(err) = self.store.save_mods(&rows) {
            tracing::warn!(error = %err, "mod list not saved");
            return Err(err.into());
        }
        Ok(())
    }

    fn renumber(&mut self) {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            entry.position = index + 1;
        }
    }

    fn index_of(&self, position: usize) -> Result<usize, RegistryError> {
        if position == 0 || position > self.entries.len() {
            return Err(RegistryError::OutOfRange {
                position,
                len: self.entries.len(),
            });
        }
        Ok(position - 1)
    }
}

/// Remembers where the next search should start. Changing the term starts
/// over from the top.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCursor {
    term: String,
    next: usize,
}

impl SearchCursor {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            next: 0,
        }
    }

    pub fn starting_at(mut self, index: usize) -> Self {
        self.next = index;
        self
    }

    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Finds the next match and moves past it; with no match the cursor resets.
    pub fn advance(&mut self, registry: &Registry) -> Option<usize> {
        match registry.search(&self.term, self.next) {
            Some(index) => {
                self.next = (index + 1) % registry.len();
                Some(index)
            }
            None => {
                self.next = 0;
                None
            }
        }
    }
}
