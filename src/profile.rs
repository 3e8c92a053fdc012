//! The settings document: game folder, helper tool paths and the ordered mod list.
//!
//! Every write is a whole-document read-modify-write that only touches the
//! fields being changed, so keys written by other versions survive.

use crate::{
    config::ToolPaths,
    error::StoreError,
    pool::Category,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

const GAME_FOLDER_KEY: &str = "game_folder_location";
const RAR_TOOL_KEY: &str = "rar_tool_location";
const MODS_KEY: &str = "mods";

/// One row of the persisted `mods` array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoredMod {
    pub name: String,
    pub file_path: String,
    pub toggled_on: bool,
    pub from_gamebanana: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalogue_id: Option<u64>,
}

impl StoredMod {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            name: string_field(obj, "name").unwrap_or_default(),
            file_path: string_field(obj, "file_path").unwrap_or_default(),
            toggled_on: bool_field(obj, "toggled_on"),
            from_gamebanana: bool_field(obj, "from_gamebanana"),
            category: string_field(obj, "category").and_then(|raw| Category::parse(&raw)),
            catalogue_id: obj.get("catalogue_id").and_then(Value::as_u64),
        })
    }
}

/// Everything the store hands back on load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub game_folder: Option<PathBuf>,
    pub tools: ToolPaths,
    pub mods: Vec<StoredMod>,
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a blank document on first run; an existing file is left untouched.
    pub fn ensure_exists(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            return Ok(());
        }
        self.save(&Profile::default())?;
        tracing::info!(path = %self.path.display(), "created settings file");
        Ok(())
    }

    /// Reads the document. Missing or mistyped fields are treated as blank; only
    /// an unreadable or non-object document is an error.
    pub fn load(&self) -> Result<Profile, StoreError> {
        if !self.path.exists() {
            self.ensure_exists()
                .map_err(|err| self.load_failure(err.to_string()))?;
            return Ok(Profile::default());
        }
        let doc = self
            .read_document()
            .map_err(|reason| self.load_failure(reason))?;

        let mods = doc
            .get(MODS_KEY)
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(StoredMod::from_value).collect())
            .unwrap_or_default();

        Ok(Profile {
            game_folder: path_field(&doc, GAME_FOLDER_KEY),
            tools: ToolPaths {
                rar_tool: path_field(&doc, RAR_TOOL_KEY),
            },
            mods,
        })
    }

    /// Rewrites every field this store owns.
    pub fn save(&self, profile: &Profile) -> Result<(), StoreError> {
        let mods = mods_value(&profile.mods).map_err(|reason| self.save_failure(reason))?;
        self.update(|doc| {
            doc.insert(GAME_FOLDER_KEY.into(), path_value(profile.game_folder.as_deref()));
            doc.insert(RAR_TOOL_KEY.into(), path_value(profile.tools.rar_tool.as_deref()));
            doc.insert(MODS_KEY.into(), mods);
        })
    }

    pub fn save_mods(&self, mods: &[StoredMod]) -> Result<(), StoreError> {
        let mods = mods_value(mods).map_err(|reason| self.save_failure(reason))?;
        self.update(|doc| {
            doc.insert(MODS_KEY.into(), mods);
        })
    }

    pub fn save_game_folder(&self, folder: &Path) -> Result<(), StoreError> {
        self.update(|doc| {
            doc.insert(GAME_FOLDER_KEY.into(), path_value(Some(folder)));
        })
    }

    pub fn save_rar_tool(&self, tool: &Path) -> Result<(), StoreError> {
        self.update(|doc| {
            doc.insert(RAR_TOOL_KEY.into(), path_value(Some(tool)));
        })
    }

    fn update(&self, apply: impl FnOnce(&mut Map<String, Value>)) -> Result<(), StoreError> {
        let mut doc = if self.path.exists() {
            self.read_document()
                .map_err(|reason| self.save_failure(reason))?
        } else {
            Map::new()
        };
        apply(&mut doc);
        self.write_document(&doc)
            .map_err(|reason| self.save_failure(reason))?;
        tracing::debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }

    fn read_document(&self) -> Result<Map<String, Value>, String> {
        let raw = fs::read_to_string(&self.path).map_err(|err| err.to_string())?;
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(doc)) => Ok(doc),
            Ok(_) => Err("settings document is not a JSON object".to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    fn write_document(&self, doc: &Map<String, Value>) -> Result<(), String> {
        let raw = serde_json::to_string_pretty(doc).map_err(|err| err.to_string())?;
        write_atomic_text(&self.path, &raw).map_err(|err| err.to_string())
    }

    fn load_failure(&self, reason: String) -> StoreError {
        StoreError::ConfigLoadFailure {
            path: self.path.clone(),
            reason,
        }
    }

    fn save_failure(&self, reason: String) -> StoreError {
        StoreError::ConfigSaveFailure {
            path: self.path.clone(),
            reason,
        }
    }
}

/// Writes through a sibling temp file and renames it into place, so a crash
/// leaves either the old or the new contents.
pub(crate) fn write_atomic_text(path: &Path, contents: &str) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut temp_name = OsString::from(file_name);
    temp_name.push(".tmp");
    let mut temp_path = parent.join(temp_name);
    if temp_path.exists() {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut temp_name = OsString::from(file_name);
        temp_name.push(format!(".{stamp}.tmp"));
        temp_path = parent.join(temp_name);
    }
    fs::write(&temp_path, contents)?;
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    Ok(())
}

fn mods_value(mods: &[StoredMod]) -> Result<Value, String> {
    serde_json::to_value(mods).map_err(|err| err.to_string())
}

fn path_value(path: Option<&Path>) -> Value {
    Value::String(
        path.map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default(),
    )
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn bool_field(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn path_field(obj: &Map<String, Value>, key: &str) -> Option<PathBuf> {
    string_field(obj, key)
        .filter(|raw| !raw.trim().is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, ProfileStore) {
        let temp = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(temp.path().join("settings.json"));
        (temp, store)
    }

    fn row(name: &str, enabled: bool) -> StoredMod {
        StoredMod {
            name: name.to_string(),
            file_path: format!("/mods/{name}.vpk"),
            toggled_on: enabled,
            from_gamebanana: false,
            category: None,
            catalogue_id: None,
        }
    }

    #[test]
    fn first_load_creates_blank_document() {
        let (_temp, store) = store();
        let profile = store.load().unwrap();
        assert_eq!(profile, Profile::default());

        let raw: Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(
            raw,
            serde_json::json!({
                "game_folder_location": "",
                "rar_tool_location": "",
                "mods": []
            })
        );
    }

    #[test]
    fn mods_round_trip_in_order() {
        let (_temp, store) = store();
        store.ensure_exists().unwrap();
        let mut catalogue = row("banana", true);
        catalogue.from_gamebanana = true;
        catalogue.category = Some(Category::Sound);
        catalogue.catalogue_id = Some(79236);
        let mods = vec![row("zeta", true), catalogue, row("alpha", false)];

        store.save_mods(&mods).unwrap();
        assert_eq!(store.load().unwrap().mods, mods);
    }

    #[test]
    fn saving_mods_keeps_other_fields() {
        let (_temp, store) = store();
        fs::write(
            store.path(),
            r#"{"game_folder_location": "/games/Deadlock", "rar_tool_location": "", "theme": "dark", "mods": []}"#,
        )
        .unwrap();

        store.save_mods(&[row("one", true)]).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["theme"], "dark");
        assert_eq!(raw["game_folder_location"], "/games/Deadlock");
        assert_eq!(raw["mods"][0]["name"], "one");
    }

    #[test]
    fn path_setters_touch_only_their_field() {
        let (_temp, store) = store();
        store.save_mods(&[row("kept", false)]).unwrap();
        store.save_game_folder(Path::new("/games/Deadlock")).unwrap();
        store.save_rar_tool(Path::new("/usr/bin/unrar")).unwrap();

        let profile = store.load().unwrap();
        assert_eq!(profile.game_folder, Some(PathBuf::from("/games/Deadlock")));
        assert_eq!(profile.tools.rar_tool, Some(PathBuf::from("/usr/bin/unrar")));
        assert_eq!(profile.mods, vec![row("kept", false)]);
    }

    #[test]
    fn load_tolerates_missing_and_mistyped_fields() {
        let (_temp, store) = store();
        fs::write(
            store.path(),
            r#"{"mods": [{"name": "a", "file_path": "/a.vpk", "toggled_on": "yes"}, 7, {"file_path": "/b.vpk", "toggled_on": true, "extra": 1}]}"#,
        )
        .unwrap();

        let profile = store.load().unwrap();
        assert_eq!(profile.game_folder, None);
        assert_eq!(profile.tools.rar_tool, None);
        assert_eq!(profile.mods.len(), 2);
        assert_eq!(profile.mods[0].name, "a");
        assert!(!profile.mods[0].toggled_on);
        assert_eq!(profile.mods[1].name, "");
        assert!(profile.mods[1].toggled_on);
        assert!(!profile.mods[1].from_gamebanana);
    }

    #[test]
    fn unparseable_document_fails_without_being_overwritten() {
        let (_temp, store) = store();
        fs::write(store.path(), "{ not json").unwrap();

        assert!(matches!(
            store.load(),
            Err(StoreError::ConfigLoadFailure { .. })
        ));
        assert!(matches!(
            store.save_mods(&[row("x", true)]),
            Err(StoreError::ConfigSaveFailure { .. })
        ));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "{ not json");
    }

    #[test]
    fn full_save_then_load_is_stable() {
        let (_temp, store) = store();
        let profile = Profile {
            game_folder: Some(PathBuf::from("/games/Deadlock")),
            tools: ToolPaths {
                rar_tool: Some(PathBuf::from("/opt/unrar")),
            },
            mods: vec![row("a", true), row("b", false)],
        };
        store.save(&profile).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, profile);

        let before = fs::read_to_string(store.path()).unwrap();
        store.save(&loaded).unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("out.txt");
        write_atomic_text(&path, "hello").unwrap();
        write_atomic_text(&path, "again").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "again");
        assert!(!temp.path().join("out.txt.tmp").exists());
    }
}
