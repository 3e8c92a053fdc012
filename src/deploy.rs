use crate::{
    deadlock::{deployed_name, GamePaths, MAX_DEPLOYED},
    error::{DeployError, RegistryError},
    profile::write_atomic_text,
    registry::Registry,
};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// `gameinfo.gi` line the search-path directives must follow.
pub const GAMEINFO_ANCHOR: &str = "Game_Languagecitadel_*LANGUAGE*";

/// Inserted after the anchor, in this order, when absent from the file.
pub const GAMEINFO_DIRECTIVES: [&str; 3] = [
    "\t\t\tMod\t\t\t\t\tcitadel",
    "\t\t\tWrite\t\t\t\tcitadel",
    "\t\t\tGame\t\t\t\tcitadel/addons",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployReport {
    pub deployed: usize,
    pub skipped_missing: usize,
    /// Enabled mods were left out because every `pakNN_dir` slot was used.
    pub truncated: bool,
    pub gameinfo_lines_added: usize,
    pub evicted: Vec<StaleReference>,
}

impl DeployReport {
    pub fn any_evicted(&self) -> bool {
        !self.evicted.is_empty()
    }
}

/// A mod whose installed file vanished; it was dropped from the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleReference {
    pub name: String,
    pub path: PathBuf,
    /// False when the list change could not be written to the settings file.
    pub persisted: bool,
}

pub fn deploy_to_game(registry: &mut Registry, game: &GamePaths) -> Result<DeployReport, DeployError> {
    deploy(registry, &game.addons_dir, &game.gameinfo_path)
}

/// Patches `gameinfo.gi`, wipes the addon dir, then hard-links every enabled
/// mod in load order as `pak01_dir.vpk`, `pak02_dir.vpk`, ...
///
/// Ranks count linked files only, so disabled and missing mods leave no gaps.
/// Mods whose file is gone are evicted from the registry afterwards, also when
/// a later link aborts the run. A permission failure aborts straight away; the
/// addon dir may then be partly filled until the next successful run.
pub fn deploy(
    registry: &mut Registry,
    addon_dir: &Path,
    gameinfo_path: &Path,
) -> Result<DeployReport, DeployError> {
    let gameinfo_lines_added = patch_gameinfo(gameinfo_path)?;
    reset_addon_dir(addon_dir)?;

    let mut report = DeployReport {
        gameinfo_lines_added,
        ..DeployReport::default()
    };
    let mut stale = Vec::new();
    let mut aborted = None;

    for entry in registry.entries().iter().filter(|entry| entry.enabled) {
        if report.deployed == MAX_DEPLOYED {
            report.truncated = true;
            break;
        }

        let dest = addon_dir.join(deployed_name(report.deployed + 1));
        match fs::hard_link(&entry.source_path, &dest) {
            Ok(()) => report.deployed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(
                    name = %entry.display_name,
                    path = %entry.source_path.display(),
                    "mod file missing; removing it from the list"
                );
                report.skipped_missing += 1;
                stale.push((
                    entry.position,
                    entry.display_name.clone(),
                    entry.source_path.clone(),
                ));
            }
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                aborted = Some(DeployError::PermissionDenied(addon_dir.to_path_buf()));
                break;
            }
            Err(err) => {
                aborted = Some(DeployError::Link {
                    source_path: entry.source_path.clone(),
                    dest,
                    err,
                });
                break;
            }
        }
    }

    report.evicted = evict_stale(registry, stale);
    if let Some(err) = aborted {
        tracing::warn!(error = %err, evicted = report.evicted.len(), "deploy aborted");
        return Err(err);
    }

    tracing::info!(
        deployed = report.deployed,
        skipped = report.skipped_missing,
        truncated = report.truncated,
        "deploy complete"
    );
    Ok(report)
}

/// Removes `(position, name, path)` rows from the registry, highest position
/// first so earlier positions stay valid. Returned in load order.
fn evict_stale(
    registry: &mut Registry,
    stale: Vec<(usize, String, PathBuf)>,
) -> Vec<StaleReference> {
    let mut evicted = Vec::with_capacity(stale.len());
    for (position, name, path) in stale.into_iter().rev() {
        let persisted = match registry.remove(position) {
            Ok(_) => true,
            Err(RegistryError::Store(err)) => {
                tracing::warn!(error = %err, "eviction not saved");
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "stale entry already gone");
                continue;
            }
        };
        evicted.push(StaleReference {
            name,
            path,
            persisted,
        });
    }
    evicted.reverse();
    evicted
}

/// Ensures the three search-path directives follow the anchor line. Returns
/// how many lines were inserted; the file is only rewritten when that is
/// non-zero.
pub fn patch_gameinfo(path: &Path) -> Result<usize, DeployError> {
    let raw = fs::read_to_string(path).map_err(|err| DeployError::from_io(path, err))?;
    let Some((patched, added)) = patch_gameinfo_text(&raw) else {
        return Err(DeployError::GameConfig {
            path: path.to_path_buf(),
            reason: format!("anchor line `{GAMEINFO_ANCHOR}` not found"),
        });
    };
    if added > 0 {
        write_atomic_text(path, &patched).map_err(|err| DeployError::from_io(path, err))?;
        tracing::info!(path = %path.display(), added, "patched gameinfo.gi");
    }
    Ok(added)
}

/// `None` when the anchor is missing.
pub(crate) fn patch_gameinfo_text(raw: &str) -> Option<(String, usize)> {
    let newline = if raw.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = raw.split_inclusive('\n').map(str::to_string).collect();

    let anchor = lines
        .iter()
        .rposition(|line| normalize_line(line) == GAMEINFO_ANCHOR)?;

    let present: Vec<String> = lines.iter().map(|line| normalize_line(line)).collect();
    let missing: Vec<&str> = GAMEINFO_DIRECTIVES
        .iter()
        .copied()
        .filter(|directive| !present.iter().any(|line| *line == normalize_line(directive)))
        .collect();
    if missing.is_empty() {
        return Some((raw.to_string(), 0));
    }

    if !lines[anchor].ends_with('\n') {
        lines[anchor].push_str(newline);
    }
    for (offset, directive) in missing.iter().enumerate() {
        lines.insert(anchor + 1 + offset, format!("{directive}{newline}"));
    }
    Some((lines.concat(), missing.len()))
}

fn normalize_line(line: &str) -> String {
    line.chars()
        .filter(|ch| !matches!(ch, '\t' | '\r' | '\n'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn reset_addon_dir(dir: &Path) -> Result<(), DeployError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(DeployError::from_io(dir, err)),
    }
    fs::create_dir_all(dir).map_err(|err| DeployError::from_io(dir, err))
}
