use anyhow::{Context, Result};
use directories::BaseDirs;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

pub const APP_DIR_NAME: &str = "EZDeadlockModManager";
pub const HOME_ENV: &str = "VPKSMITH_HOME";
pub const SETTINGS_FILE: &str = "settings.json";
pub const LOG_FILE: &str = "vpksmith.log";
pub const LOG_ENV: &str = "VPKSMITH_LOG";

const RAR_TOOL_NAMES: [&str; 3] = ["unrar", "UnRAR.exe", "unrar.exe"];

/// Every directory the manager owns, all rooted at one application directory.
#[derive(Debug, Clone)]
pub struct AppDirs {
    pub root: PathBuf,
}

impl AppDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the application directory and creates it. There is no safe mode
    /// without it, so callers treat an error here as fatal.
    pub fn locate_or_create() -> Result<Self> {
        let root = match env::var_os(HOME_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => base_data_dir()?,
        };
        let dirs = Self::new(root);
        dirs.ensure()?;
        Ok(dirs)
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create application dir {:?}", self.root))?;
        Ok(())
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    pub fn gamebanana_dir(&self) -> PathBuf {
        self.root.join("GameBanana")
    }

    pub fn manual_pool(&self) -> PathBuf {
        self.root.join("VPK Files")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("Downloads")
    }
}

/// External helpers the ingestion path may shell out to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolPaths {
    pub rar_tool: Option<PathBuf>,
}

impl ToolPaths {
    /// Fills in a missing RAR tool from `PATH`. Never fails; absence only disables `.rar`.
    pub fn with_detected_rar_tool(mut self) -> Self {
        if self.rar_tool.is_none() {
            self.rar_tool = locate_rar_tool();
        }
        self
    }
}

pub fn locate_rar_tool() -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        for name in RAR_TOOL_NAMES {
            let candidate = dir.join(name);
            if is_executable_file(&candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join(APP_DIR_NAME))
}
