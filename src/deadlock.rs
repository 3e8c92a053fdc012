use anyhow::{bail, Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const GAME_NAME: &str = "Deadlock";
pub const STEAM_APP_ID: &str = "1422450";
pub const PACKAGE_EXTENSION: &str = "vpk";

/// The engine only scans `pak01_dir` through `pak99_dir`.
pub const MAX_DEPLOYED: usize = 99;

const ADDONS_SUBDIR: [&str; 3] = ["game", "citadel", "addons"];
const GAMEINFO_SUBPATH: [&str; 3] = ["game", "citadel", "gameinfo.gi"];
const EXECUTABLE_SUBPATH: [&str; 4] = ["game", "bin", "win64", "deadlock.exe"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GamePaths {
    pub game_root: PathBuf,
    pub addons_dir: PathBuf,
    pub gameinfo_path: PathBuf,
    pub executable: PathBuf,
}

impl GamePaths {
    pub fn from_root(game_root: &Path) -> Self {
        Self {
            game_root: game_root.to_path_buf(),
            addons_dir: join_all(game_root, &ADDONS_SUBDIR),
            gameinfo_path: join_all(game_root, &GAMEINFO_SUBPATH),
            executable: join_all(game_root, &EXECUTABLE_SUBPATH),
        }
    }
}

pub fn detect_paths(game_root_override: Option<&Path>) -> Result<GamePaths> {
    let game_root = match game_root_override {
        Some(path) if !path.as_os_str().is_empty() => path.to_path_buf(),
        _ => find_game_root().context("locate Deadlock game directory")?,
    };

    if !looks_like_game_root(&game_root) {
        bail!(
            "invalid game root: expected game/citadel/addons and game/bin/win64/deadlock.exe in {}",
            game_root.display()
        );
    }

    Ok(GamePaths::from_root(&game_root))
}

/// A game folder is usable when both the addon dir and the executable exist.
pub fn looks_like_game_root(path: &Path) -> bool {
    join_all(path, &ADDONS_SUBDIR).is_dir() && join_all(path, &EXECUTABLE_SUBPATH).exists()
}

pub fn deployed_name(rank: usize) -> String {
    format!("pak{rank:02}_dir.{PACKAGE_EXTENSION}")
}

pub fn is_package_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(PACKAGE_EXTENSION))
        .unwrap_or(false)
}

fn find_game_root() -> Option<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(home) = dirs_home() {
        candidates.push(home.join(".local/share/Steam"));
        candidates.push(home.join(".steam/steam"));
    }
    candidates.push(PathBuf::from(r"C:\Program Files (x86)\Steam"));

    let mut libraries = Vec::new();
    for base in candidates {
        let vdf = base.join("steamapps").join("libraryfolders.vdf");
        if vdf.exists() {
            if let Ok(paths) = parse_steam_library_paths(&vdf) {
                libraries.extend(paths);
            }
        }
        libraries.push(base);
    }

    libraries
        .into_iter()
        .map(|lib| lib.join("steamapps").join("common").join(GAME_NAME))
        .find(|candidate| looks_like_game_root(candidate))
}

fn parse_steam_library_paths(path: &Path) -> Result<Vec<PathBuf>> {
    let raw = fs::read_to_string(path).context("read libraryfolders.vdf")?;
    Ok(library_paths_from_vdf(&raw))
}

fn library_paths_from_vdf(raw: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if !line.contains("\"path\"") {
            continue;
        }

        let parts: Vec<&str> = line.split('"').collect();
        if parts.len() >= 4 {
            let path = parts[3].replace("\\\\", "\\");
            paths.push(PathBuf::from(path));
        }
    }
    paths
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn join_all(base: &Path, parts: &[&str]) -> PathBuf {
    parts.iter().fold(base.to_path_buf(), |acc, part| acc.join(part))
}

#[cfg(test)]
pub(crate) fn fake_game_root(root: &Path) -> GamePaths {
    let paths = GamePaths::from_root(root);
    fs::create_dir_all(&paths.addons_dir).unwrap();
    fs::create_dir_all(paths.executable.parent().unwrap()).unwrap();
    fs::write(&paths.executable, b"MZ").unwrap();
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployed_names_are_zero_padded() {
        assert_eq!(deployed_name(1), "pak01_dir.vpk");
        assert_eq!(deployed_name(42), "pak42_dir.vpk");
        assert_eq!(deployed_name(99), "pak99_dir.vpk");
    }

    #[test]
    fn package_names_match_case_insensitively() {
        assert!(is_package_name("maps/thing.vpk"));
        assert!(is_package_name("LOUD.VPK"));
        assert!(!is_package_name("readme.txt"));
        assert!(!is_package_name("vpk"));
    }

    #[test]
    fn game_root_needs_addons_and_executable() {
        let temp = tempfile::tempdir().unwrap();
        assert!(!looks_like_game_root(temp.path()));
        fake_game_root(temp.path());
        assert!(looks_like_game_root(temp.path()));
        let paths = detect_paths(Some(temp.path())).unwrap();
        assert_eq!(paths.gameinfo_path, temp.path().join("game/citadel/gameinfo.gi"));
    }

    #[test]
    fn invalid_override_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        assert!(detect_paths(Some(temp.path())).is_err());
    }

    #[test]
    fn vdf_library_paths_are_extracted() {
        let raw = r#"
"libraryfolders"
{
    "0"
    {
        "path"		"/home/user/.local/share/Steam"
    }
    "1"
    {
        "path"		"D:\\SteamLibrary"
    }
}
"#;
        let paths = library_paths_from_vdf(raw);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/home/user/.local/share/Steam"),
                PathBuf::from(r"D:\SteamLibrary"),
            ]
        );
    }
}
