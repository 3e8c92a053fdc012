//! Catalogue downloads. Each request runs on its own thread with its own HTTP
//! agent and download folder; results come back over a channel and are picked
//! up by the control thread through [`DownloadCoordinator::poll`].

use crate::{error::AcquireRejection, pool::CatalogueItem};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{
    collections::HashMap,
    fs::{self, File},
    io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

pub const MAX_IN_FLIGHT: usize = 5;
pub const TEMP_DIR_PREFIX: &str = "EZDeadlockDownload_";

const API_BASE: &str = "https://gamebanana.com/apiv11";
const USER_AGENT: &str = concat!("vpksmith/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub file_name: String,
    pub download_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogueEntry {
    pub name: String,
    pub files: Vec<RemoteFile>,
}

/// Where catalogue entries are looked up and fetched from.
pub trait Catalogue: Send + Sync {
    fn resolve(&self, item: CatalogueItem) -> Result<CatalogueEntry>;
    fn fetch(&self, file: &RemoteFile, dest: &Path) -> Result<()>;
}

/// GameBanana's public JSON API.
#[derive(Debug, Clone)]
pub struct GameBanana {
    base_url: String,
}

impl Default for GameBanana {
    fn default() -> Self {
        Self {
            base_url: API_BASE.to_string(),
        }
    }
}

impl GameBanana {
    fn item_url(&self, item: CatalogueItem) -> String {
        format!(
            "{}/{}/{}?_csvProperties=_sName,_aFiles",
            self.base_url.trim_end_matches('/'),
            item.category.as_str(),
            item.id
        )
    }
}

#[derive(Debug, Deserialize)]
struct ApiItem {
    #[serde(rename = "_sName", default)]
    name: String,
    #[serde(rename = "_aFiles", default)]
    files: Vec<ApiFile>,
}

#[derive(Debug, Deserialize)]
struct ApiFile {
    #[serde(rename = "_sFile")]
    file: String,
    #[serde(rename = "_sDownloadUrl")]
    download_url: String,
}

impl From<ApiItem> for CatalogueEntry {
    fn from(item: ApiItem) -> Self {
        Self {
            name: item.name,
            files: item
                .files
                .into_iter()
                .map(|file| RemoteFile {
                    file_name: file.file,
                    download_url: file.download_url,
                })
                .collect(),
        }
    }
}

fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(REQUEST_TIMEOUT)
        .timeout_read(REQUEST_TIMEOUT)
        .timeout_write(REQUEST_TIMEOUT)
        .build()
}

impl Catalogue for GameBanana {
    fn resolve(&self, item: CatalogueItem) -> Result<CatalogueEntry> {
        let response = agent()
            .get(&self.item_url(item))
            .set("User-Agent", USER_AGENT)
            .call()
            .with_context(|| format!("look up {item}"))?;
        let parsed: ApiItem = response.into_json().context("decode catalogue entry")?;
        Ok(parsed.into())
    }

    fn fetch(&self, file: &RemoteFile, dest: &Path) -> Result<()> {
        let response = agent()
            .get(&file.download_url)
            .set("User-Agent", USER_AGENT)
            .call()
            .with_context(|| format!("download {}", file.file_name))?;
        let mut reader = response.into_reader();
        let mut out = File::create(dest).with_context(|| format!("create {dest:?}"))?;
        io::copy(&mut reader, &mut out).with_context(|| format!("write {dest:?}"))?;
        Ok(())
    }
}

/// The single message a download task sends when it ends.
#[derive(Debug, Clone)]
pub struct AcquisitionOutcome {
    pub item: CatalogueItem,
    /// Catalogue title, empty when the lookup failed.
    pub name: String,
    pub files: Vec<PathBuf>,
    pub temp_dir: PathBuf,
    /// False when at least one file (or the lookup) failed.
    pub complete: bool,
    pub errors: Vec<String>,
}

impl AcquisitionOutcome {
    /// Deletes the downloaded files, then the download folder if that left it empty.
    pub fn discard_files(&self) {
        for file in &self.files {
            if let Err(err) = fs::remove_file(file) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %file.display(), error = %err, "failed to delete download");
                }
            }
        }
        match fs::remove_dir(&self.temp_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::debug!(path = %self.temp_dir.display(), error = %err, "download folder kept");
            }
        }
    }
}

struct InFlight {
    handle: JoinHandle<()>,
}

/// Owns the table of running downloads. Registration and deregistration go
/// through one lock; duplicate and over-limit requests are refused, not queued.
pub struct DownloadCoordinator {
    catalogue: Arc<dyn Catalogue>,
    downloads_dir: PathBuf,
    in_flight: Mutex<HashMap<CatalogueItem, InFlight>>,
    tx: Sender<AcquisitionOutcome>,
    rx: Receiver<AcquisitionOutcome>,
}

impl DownloadCoordinator {
    pub fn new(catalogue: Arc<dyn Catalogue>, downloads_dir: impl Into<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            catalogue,
            downloads_dir: downloads_dir.into(),
            in_flight: Mutex::new(HashMap::new()),
            tx,
            rx,
        }
    }

    pub fn request(&self, item: CatalogueItem) -> Result<(), AcquireRejection> {
        let mut in_flight = self.lock();
        if in_flight.contains_key(&item) {
            return Err(AcquireRejection::AlreadyInFlight(item));
        }
        if in_flight.len() >= MAX_IN_FLIGHT {
            return Err(AcquireRejection::TooManyInFlight {
                limit: MAX_IN_FLIGHT,
            });
        }

        // Folder numbers are picked under the lock so two tasks never share one.
        let temp_dir = next_temp_dir(&self.downloads_dir);
        fs::create_dir_all(&temp_dir).map_err(|source| AcquireRejection::TempDir {
            path: temp_dir.clone(),
            source,
        })?;

        let catalogue = Arc::clone(&self.catalogue);
        let tx = self.tx.clone();
        let handle = thread::spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                run_download(catalogue.as_ref(), item, &temp_dir)
            }))
            .unwrap_or_else(|_| AcquisitionOutcome {
                item,
                name: String::new(),
                files: Vec::new(),
                temp_dir: temp_dir.clone(),
                complete: false,
                errors: vec!["download task panicked".to_string()],
            });
            let _ = tx.send(outcome);
        });
        in_flight.insert(item, InFlight { handle });
        tracing::info!(%item, "download started");
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Blocks up to `timeout` for the next finished download.
    pub fn wait_next(&self, timeout: Duration) -> Option<AcquisitionOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(self.finish(outcome)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn finish(&self, outcome: AcquisitionOutcome) -> AcquisitionOutcome {
        let entry = self.lock().remove(&outcome.item);
        if let Some(InFlight { handle }) = entry {
            if handle.join().is_err() {
                tracing::warn!(item = %outcome.item, "download thread did not exit cleanly");
            }
        }
        tracing::info!(
            item = %outcome.item,
            files = outcome.files.len(),
            complete = outcome.complete,
            "download finished"
        );
        outcome
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CatalogueItem, InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn run_download(catalogue: &dyn Catalogue, item: CatalogueItem, temp_dir: &Path) -> AcquisitionOutcome {
    let mut outcome = AcquisitionOutcome {
        item,
        name: String::new(),
        files: Vec::new(),
        temp_dir: temp_dir.to_path_buf(),
        complete: true,
        errors: Vec::new(),
    };

    let entry = match catalogue.resolve(item) {
        Ok(entry) => entry,
        Err(err) => {
            outcome.complete = false;
            outcome.errors.push(format!("{err:#}"));
            return outcome;
        }
    };
    outcome.name = entry.name;
    if entry.files.is_empty() {
        outcome.complete = false;
        outcome.errors.push(format!("{item} has no downloadable files"));
    }

    for file in &entry.files {
        match fetch_one(catalogue, file, temp_dir) {
            Ok(path) => outcome.files.push(path),
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(%item, file = %file.file_name, error = %message, "file download failed");
                outcome.complete = false;
                outcome.errors.push(message);
            }
        }
    }
    outcome
}

fn fetch_one(catalogue: &dyn Catalogue, file: &RemoteFile, temp_dir: &Path) -> Result<PathBuf> {
    let Some(name) = Path::new(&file.file_name).file_name() else {
        bail!("unusable file name {:?}", file.file_name);
    };
    let dest = temp_dir.join(name);
    if let Err(err) = catalogue.fetch(file, &dest) {
        let _ = fs::remove_file(&dest);
        return Err(err);
    }
    Ok(dest)
}

/// `Downloads/EZDeadlockDownload_<N>` for the smallest unused `N`.
fn next_temp_dir(downloads_dir: &Path) -> PathBuf {
    let mut index = 0usize;
    loop {
        let candidate = downloads_dir.join(format!("{TEMP_DIR_PREFIX}{index}"));
        if !candidate.exists() {
            return candidate;
        }
        index += 1;
    }
}
