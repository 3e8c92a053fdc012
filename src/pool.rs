//! On-disk storage pools for installed packages.
//!
//! Catalogue downloads live under `GameBanana/<Mods|Sounds>/<id>/`, manual adds
//! under a flat `VPK Files/` pool with anonymous `Unnamed_VPK_<N>` names.

use crate::{config::AppDirs, deadlock::PACKAGE_EXTENSION};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs, io,
    path::{Component, Path, PathBuf},
};

pub const UNNAMED_PREFIX: &str = "Unnamed_VPK_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Mod,
    Sound,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Mod => "Mod",
            Category::Sound => "Sound",
        }
    }

    pub fn pool_dir_name(self) -> &'static str {
        match self {
            Category::Mod => "Mods",
            Category::Sound => "Sounds",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mod" | "mods" => Some(Category::Mod),
            "sound" | "sounds" => Some(Category::Sound),
            _ => None,
        }
    }

    fn from_pool_dir(name: &str) -> Option<Self> {
        match name {
            "Mods" => Some(Category::Mod),
            "Sounds" => Some(Category::Sound),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a catalogue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogueItem {
    pub category: Category,
    pub id: u64,
}

impl fmt::Display for CatalogueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.category, self.id)
    }
}

/// Where ingested content should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Manual,
    Catalogue(CatalogueItem),
}

#[derive(Debug, Clone)]
pub struct StoragePools {
    pub root: PathBuf,
    pub catalogue_root: PathBuf,
    pub manual: PathBuf,
}

impl StoragePools {
    pub fn new(dirs: &AppDirs) -> Self {
        Self {
            root: dirs.root.clone(),
            catalogue_root: dirs.gamebanana_dir(),
            manual: dirs.manual_pool(),
        }
    }

    pub fn category_pool(&self, category: Category) -> PathBuf {
        self.catalogue_root.join(category.pool_dir_name())
    }

    /// `<pool>/<id>/<archive stem>`; entry paths are joined below this.
    pub fn catalogue_dir(&self, item: CatalogueItem, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|stem| stem.to_os_string())
            .unwrap_or_else(|| "package".into());
        self.category_pool(item.category)
            .join(item.id.to_string())
            .join(stem)
    }

    /// Recovers the catalogue identity from a path inside a category pool.
    pub fn catalogue_item_of(&self, path: &Path) -> Option<CatalogueItem> {
        let rel = path.strip_prefix(&self.catalogue_root).ok()?;
        let mut parts = rel.components().filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        });
        let category = Category::from_pool_dir(parts.next()?)?;
        let id = parts.next()?.parse().ok()?;
        Some(CatalogueItem { category, id })
    }
}

/// Smallest `N` for which neither `Unnamed_VPK_<N>` nor `Unnamed_VPK_<N>.vpk` exists.
///
/// Only safe with a single writer; ingestion never runs concurrently.
pub fn next_unnamed_slot(pool: &Path) -> usize {
    let mut index = 0;
    loop {
        let bare = pool.join(format!("{UNNAMED_PREFIX}{index}"));
        let with_ext = pool.join(format!("{UNNAMED_PREFIX}{index}.{PACKAGE_EXTENSION}"));
        if !bare.exists() && !with_ext.exists() {
            return index;
        }
        index += 1;
    }
}

pub fn unnamed_path(pool: &Path, index: usize, with_extension: bool) -> PathBuf {
    if with_extension {
        pool.join(format!("{UNNAMED_PREFIX}{index}.{PACKAGE_EXTENSION}"))
    } else {
        pool.join(format!("{UNNAMED_PREFIX}{index}"))
    }
}

/// Deletes `path` (a file, or an empty directory) and then every ancestor that is
/// left empty, stopping below `stop_at`. Paths outside `stop_at` are left alone.
///
/// Returns how many filesystem entries were removed.
pub fn remove_with_empty_parents(path: &Path, stop_at: &Path) -> io::Result<usize> {
    if !path.starts_with(stop_at) || path == stop_at {
        return Ok(0);
    }

    let mut removed = 0;
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            if fs::read_dir(path)?.next().is_some() {
                return Ok(0);
            }
            fs::remove_dir(path)?;
            removed += 1;
        }
        Ok(_) => {
            fs::remove_file(path)?;
            removed += 1;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        match fs::read_dir(dir) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                current = dir.parent();
                continue;
            }
            Err(err) => return Err(err),
        }
        fs::remove_dir(dir)?;
        removed += 1;
        current = dir.parent();
    }

    tracing::debug!(path = %path.display(), removed, "pruned package path");
    Ok(removed)
}
