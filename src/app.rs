use crate::{
    acquire::{AcquisitionOutcome, Catalogue, DownloadCoordinator, GameBanana},
    config::{AppDirs, ToolPaths},
    deadlock::{self, GamePaths, STEAM_APP_ID},
    dedup,
    deploy::{self, DeployReport},
    error::{AcquireRejection, DeployError, IngestError, IntegrityWarning, RegistryError, StoreError},
    importer::{self, IngestedPackage},
    pool::{CatalogueItem, Destination, StoragePools},
    profile::ProfileStore,
    registry::{Origin, PackageEntry, Registry, SearchCursor},
};
use anyhow::{bail, Context, Result};
use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
    time::Duration,
};

const FORBIDDEN_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// What happened to a batch of files handed to [`App::add_files`].
#[derive(Debug, Default)]
pub struct AddReport {
    /// Positions of newly created entries.
    pub added: Vec<usize>,
    /// Packages that overwrote an existing install.
    pub replaced: usize,
    /// Existing installs that a manual add turned out to duplicate.
    pub duplicates: Vec<PathBuf>,
    pub integrity_warnings: Vec<IntegrityWarning>,
    /// The file that stopped the batch; later files were not looked at.
    pub failed: Option<(PathBuf, IngestError)>,
    pub save_error: Option<RegistryError>,
}

#[derive(Debug)]
pub struct AcquisitionReport {
    pub item: CatalogueItem,
    pub name: String,
    pub add: AddReport,
    pub download_errors: Vec<String>,
}

impl AcquisitionReport {
    pub fn download_failed(&self) -> bool {
        !self.download_errors.is_empty()
    }
}

/// One running session: the mod list, settings and downloads, driven from a
/// single thread.
pub struct App {
    pub dirs: AppDirs,
    pools: StoragePools,
    store: ProfileStore,
    registry: Registry,
    tools: ToolPaths,
    game: Option<GamePaths>,
    search: SearchCursor,
    downloads: DownloadCoordinator,
    load_warning: Option<StoreError>,
}

impl App {
    /// Opens the default application directory. Failing to create it is fatal.
    pub fn initialize() -> Result<Self> {
        let dirs = AppDirs::locate_or_create()?;
        Self::open(dirs, Arc::new(GameBanana::default()))
    }

    pub fn open(dirs: AppDirs, catalogue: Arc<dyn Catalogue>) -> Result<Self> {
        dirs.ensure()?;
        let pools = StoragePools::new(&dirs);
        let store = ProfileStore::new(dirs.settings_path());

        let (profile, load_warning) = match store.load() {
            Ok(profile) => (profile, None),
            Err(err) => {
                tracing::warn!(error = %err, "starting with an empty mod list");
                (Default::default(), Some(err))
            }
        };

        let game = match deadlock::detect_paths(profile.game_folder.as_deref()) {
            Ok(game) => Some(game),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "game folder not found");
                None
            }
        };
        let tools = profile.tools.with_detected_rar_tool();
        let registry = Registry::from_stored(store.clone(), &pools, profile.mods);
        let downloads = DownloadCoordinator::new(catalogue, dirs.downloads_dir());

        tracing::info!(
            root = %dirs.root.display(),
            settings = %store.path().display(),
            mods = registry.len(),
            game_found = game.is_some(),
            "session opened"
        );
        Ok(Self {
            dirs,
            pools,
            store,
            registry,
            tools,
            game,
            search: SearchCursor::default(),
            downloads,
            load_warning,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn game(&self) -> Option<&GamePaths> {
        self.game.as_ref()
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    /// Set when the settings file could not be read at startup.
    pub fn load_warning(&self) -> Option<&StoreError> {
        self.load_warning.as_ref()
    }

    /// Ingests `files` in order and registers every package found. With a
    /// catalogue identity the files are filed under that item and named after
    /// `real_name`; otherwise they go to the manual pool and are checked for
    /// byte-identical duplicates first.
    pub fn add_files(
        &mut self,
        files: &[PathBuf],
        catalogue: Option<(CatalogueItem, &str)>,
    ) -> AddReport {
        let mut report = AddReport::default();
        let (destination, real_name) = match catalogue {
            Some((item, name)) => (Destination::Catalogue(item), sanitize_real_name(name)),
            None => (Destination::Manual, String::new()),
        };

        for file in files {
            let registry = &mut self.registry;
            let manual_pool = self.pools.manual.as_path();
            let ingested =
                importer::ingest(file, destination, &self.pools, &self.tools, |package| {
                    register_package(
                        registry,
                        manual_pool,
                        destination,
                        &real_name,
                        package,
                        &mut report,
                    )
                });
            if let Err(err) = ingested {
                tracing::warn!(path = %file.display(), error = %err, "add stopped");
                report.failed = Some((file.clone(), err));
                break;
            }
        }
        report
    }

    pub fn remove(&mut self, position: usize) -> Result<PackageEntry, RegistryError> {
        self.registry.remove(position)
    }

    pub fn rename(&mut self, position: usize, name: &str) -> Result<bool, RegistryError> {
        self.registry.rename(position, name)
    }

    pub fn set_enabled(&mut self, position: usize, enabled: bool) -> Result<(), RegistryError> {
        self.registry.set_enabled(position, enabled)
    }

    pub fn move_entry(&mut self, from: usize, to: usize) -> Result<(), RegistryError> {
        self.registry.reorder(from, to)
    }

    pub fn search_from(&mut self, term: &str, start: usize) -> Option<usize> {
        self.search = SearchCursor::new(term).starting_at(start);
        self.search.advance(&self.registry)
    }

    pub fn search_cursor(&self) -> &SearchCursor {
        &self.search
    }

    pub fn deploy(&mut self) -> Result<DeployReport, DeployError> {
        let Some(game) = &self.game else {
            return Err(DeployError::GameFolderMissing);
        };
        deploy::deploy_to_game(&mut self.registry, game)
    }

    pub fn launch_game(&self) -> Result<()> {
        let Some(game) = &self.game else {
            bail!("game folder not found; set it with `vpksmith set-game <dir>`");
        };
        if cfg!(windows) {
            Command::new(&game.executable)
                .current_dir(&game.game_root)
                .spawn()
                .with_context(|| format!("start {:?}", game.executable))?;
            return Ok(());
        }

        let url = format!("steam://rungameid/{STEAM_APP_ID}");
        let mut errors = Vec::new();
        for (command, args) in [("steam", vec![url.as_str()]), ("xdg-open", vec![url.as_str()])] {
            match Command::new(command)
                .args(&args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(_) => {
                    tracing::info!(command, "game launch requested");
                    return Ok(());
                }
                Err(err) => errors.push(format!("{command} failed: {err}")),
            }
        }
        bail!("could not launch the game: {}", errors.join("; "))
    }

    /// Validates and stores a new game folder. An invalid folder clears the
    /// current one and is not saved.
    pub fn set_game_folder(&mut self, folder: &Path) -> Result<&GamePaths> {
        if !deadlock::looks_like_game_root(folder) {
            self.game = None;
            bail!(
                "{} is not a Deadlock folder (needs game/citadel/addons and game/bin/win64/deadlock.exe)",
                folder.display()
            );
        }
        self.store
            .save_game_folder(folder)
            .context("save game folder")?;
        Ok(self.game.insert(GamePaths::from_root(folder)))
    }

    pub fn set_rar_tool(&mut self, tool: &Path) -> Result<(), StoreError> {
        self.tools.rar_tool = Some(tool.to_path_buf());
        self.store.save_rar_tool(tool)
    }

    pub fn request_download(&self, item: CatalogueItem) -> Result<(), AcquireRejection> {
        self.downloads.request(item)
    }

    pub fn has_pending_acquisitions(&self) -> bool {
        self.downloads.pending() > 0
    }

    pub fn wait_for_acquisition(&mut self, timeout: Duration) -> Option<AcquisitionReport> {
        let outcome = self.downloads.wait_next(timeout)?;
        Some(self.handle_acquisition(outcome))
    }

    /// Ingests what a download produced, then deletes the downloaded files and
    /// their folder.
    pub fn handle_acquisition(&mut self, outcome: AcquisitionOutcome) -> AcquisitionReport {
        let name = outcome.name.replace(',', "");
        let add = if outcome.files.is_empty() {
            AddReport::default()
        } else {
            self.add_files(&outcome.files, Some((outcome.item, &name)))
        };
        outcome.discard_files();
        if !outcome.complete {
            tracing::warn!(item = %outcome.item, "one or more files failed to download");
        }
        AcquisitionReport {
            item: outcome.item,
            name: sanitize_real_name(&name),
            add,
            download_errors: outcome.errors,
        }
    }
}

/// Registers one freshly extracted package. Manual packages are checked
/// against the manual pool first, so a later entry of the same archive sees
/// the earlier ones as installed.
fn register_package(
    registry: &mut Registry,
    manual_pool: &Path,
    destination: Destination,
    real_name: &str,
    package: IngestedPackage,
    report: &mut AddReport,
) {
    if package.replaced {
        report.replaced += 1;
    }
    let origin = match destination {
        Destination::Manual => {
            if let Some(existing) = manual_duplicate(registry, manual_pool, &package.path, report) {
                report.duplicates.push(existing);
                return;
            }
            Origin::Manual
        }
        Destination::Catalogue(item) => {
            if registry.find_by_path(&package.path).is_some() {
                return;
            }
            Origin::Catalogue { item: Some(item) }
        }
    };

    let name = display_name(real_name, &package.label());
    let entry = PackageEntry::new(name, package.path, origin);
    match registry.add(entry, true) {
        Ok(position) => report.added.push(position),
        Err(err) => {
            report.added.push(registry.len());
            report.save_error = Some(err);
        }
    }
}

fn manual_duplicate(
    registry: &Registry,
    manual_pool: &Path,
    candidate: &Path,
    report: &mut AddReport,
) -> Option<PathBuf> {
    let existing = match dedup::find_duplicate(candidate, manual_pool) {
        Ok(found) => found?,
        Err(err) => {
            tracing::warn!(path = %candidate.display(), error = %err, "duplicate scan failed");
            return None;
        }
    };
    if registry.find_by_path(&existing).is_none() {
        let warning = IntegrityWarning {
            existing: existing.clone(),
        };
        tracing::warn!(%warning, "integrity warning");
        report.integrity_warnings.push(warning);
    }
    Some(existing)
}

/// Strips characters that are not allowed in file names, then surrounding
/// whitespace and dots.
pub fn sanitize_real_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|ch| !FORBIDDEN_NAME_CHARS.contains(ch))
        .collect();
    cleaned.trim().trim_matches('.').to_string()
}

/// `Real Name (archive.zip/inner/pack.vpk)`, or just the parenthesised label
/// when there is no real name.
pub fn display_name(real_name: &str, label: &str) -> String {
    if real_name.is_empty() {
        format!("({label})")
    } else {
        format!("{real_name} ({label})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        acquire::{CatalogueEntry, RemoteFile},
        deadlock::fake_game_root,
        importer::fixtures::write_zip,
        pool::Category,
    };
    use pretty_assertions::assert_eq;
    use std::{collections::HashMap, fs};

    /// Serves in-memory files; `zip:` names are wrapped in a one-entry archive.
    #[derive(Default)]
    struct MemoryCatalogue {
        entries: HashMap<u64, (String, Vec<(String, Vec<u8>)>)>,
    }

    impl Catalogue for MemoryCatalogue {
        fn resolve(&self, item: CatalogueItem) -> anyhow::Result<CatalogueEntry> {
            let (name, files) = self
                .entries
                .get(&item.id)
                .with_context(|| format!("{item} not found"))?;
            Ok(CatalogueEntry {
                name: name.clone(),
                files: files
                    .iter()
                    .map(|(file, _)| RemoteFile {
                        file_name: file.clone(),
                        download_url: format!("mem://{}/{file}", item.id),
                    })
                    .collect(),
            })
        }

        fn fetch(&self, file: &RemoteFile, dest: &Path) -> anyhow::Result<()> {
            let (_, files) = self
                .entries
                .values()
                .find(|(_, files)| files.iter().any(|(name, _)| *name == file.file_name))
                .context("unknown file")?;
            let (_, data) = files
                .iter()
                .find(|(name, _)| *name == file.file_name)
                .context("unknown file")?;
            if file.file_name.ends_with(".zip") {
                write_zip(dest, &[("pack/inner.vpk", data.as_slice())]);
            } else {
                fs::write(dest, data)?;
            }
            Ok(())
        }
    }

    struct Fixture {
        temp: tempfile::TempDir,
        app: App,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_catalogue(MemoryCatalogue::default())
        }

        fn with_catalogue(catalogue: MemoryCatalogue) -> Self {
            let temp = tempfile::tempdir().unwrap();
            let dirs = AppDirs::new(temp.path().join("app"));
            let app = App::open(dirs, Arc::new(catalogue)).unwrap();
            Self { temp, app }
        }

        fn source(&self, name: &str, data: &[u8]) -> PathBuf {
            let dir = self.temp.path().join("incoming");
            fs::create_dir_all(&dir).unwrap();
            let path = dir.join(name);
            fs::write(&path, data).unwrap();
            path
        }

        fn names(&self) -> Vec<String> {
            self.app
                .registry()
                .entries()
                .iter()
                .map(|entry| entry.display_name.clone())
                .collect()
        }
    }

    fn mod_item(id: u64) -> CatalogueItem {
        CatalogueItem {
            category: Category::Mod,
            id,
        }
    }

    #[test]
    fn real_names_are_sanitized() {
        assert_eq!(sanitize_real_name("  Haze: <Red>?  "), "Haze Red");
        assert_eq!(sanitize_real_name("..dots..."), "dots");
        assert_eq!(sanitize_real_name("a/b\\c|d*e\"f"), "abcdef");
        assert_eq!(display_name("", "x.vpk"), "(x.vpk)");
        assert_eq!(display_name("Haze", "p.zip/a.vpk"), "Haze (p.zip/a.vpk)");
    }

    #[test]
    fn manual_add_registers_and_persists() {
        let mut fixture = Fixture::new();
        let source = fixture.source("cool.vpk", b"vpk bytes");

        let report = fixture.app.add_files(&[source], None);
        assert_eq!(report.added, vec![1]);
        assert!(report.failed.is_none());

        let entry = &fixture.app.registry().entries()[0];
        assert_eq!(entry.display_name, "(cool.vpk)");
        assert_eq!(entry.origin, Origin::Manual);
        assert_eq!(
            entry.source_path,
            fixture.app.dirs.manual_pool().join("Unnamed_VPK_0.vpk")
        );

        let reopened = App::open(fixture.app.dirs.clone(), Arc::new(MemoryCatalogue::default())).unwrap();
        assert_eq!(reopened.registry().entries(), fixture.app.registry().entries());
    }

    #[test]
    fn identical_manual_add_is_discarded() {
        let mut fixture = Fixture::new();
        let first = fixture.source("a.vpk", b"same");
        let second = fixture.source("b.vpk", b"same");
        fixture.app.add_files(&[first], None);

        let report = fixture.app.add_files(&[second], None);
        assert!(report.added.is_empty());
        let original = fixture.app.dirs.manual_pool().join("Unnamed_VPK_0.vpk");
        assert_eq!(report.duplicates, vec![original]);
        assert!(report.integrity_warnings.is_empty());
        assert_eq!(fixture.app.registry().len(), 1);
        assert!(!fixture.app.dirs.manual_pool().join("Unnamed_VPK_1.vpk").exists());
    }

    #[test]
    fn identical_entries_in_one_archive_keep_the_first() {
        let mut fixture = Fixture::new();
        let archive = fixture.temp.path().join("pack.zip");
        write_zip(&archive, &[("a.vpk", b"same"), ("b.vpk", b"same")]);

        let report = fixture.app.add_files(&[archive], None);

        assert_eq!(report.added, vec![1]);
        assert!(report.integrity_warnings.is_empty());
        let first = fixture.app.dirs.manual_pool().join("Unnamed_VPK_0").join("a.vpk");
        assert_eq!(report.duplicates, vec![first.clone()]);
        assert_eq!(fixture.names(), vec!["(pack.zip/a.vpk)".to_string()]);
        assert!(first.exists());
        assert!(!fixture.app.dirs.manual_pool().join("Unnamed_VPK_1").exists());
    }

    #[test]
    fn unregistered_twin_raises_integrity_warning() {
        let mut fixture = Fixture::new();
        let pool = fixture.app.dirs.manual_pool();
        fs::create_dir_all(&pool).unwrap();
        fs::write(pool.join("Unnamed_VPK_0.vpk"), b"orphan").unwrap();
        let source = fixture.source("again.vpk", b"orphan");

        let report = fixture.app.add_files(&[source], None);
        assert!(report.added.is_empty());
        assert_eq!(
            report.integrity_warnings,
            vec![IntegrityWarning {
                existing: pool.join("Unnamed_VPK_0.vpk")
            }]
        );
        assert!(fixture.app.registry().is_empty());
    }

    #[test]
    fn batch_stops_at_first_bad_file() {
        let mut fixture = Fixture::new();
        let files = vec![
            fixture.source("one.vpk", b"1"),
            fixture.source("notes.txt", b"2"),
            fixture.source("three.vpk", b"3"),
        ];

        let report = fixture.app.add_files(&files, None);
        assert_eq!(report.added, vec![1]);
        assert!(matches!(
            report.failed,
            Some((_, IngestError::UnsupportedFormat(_)))
        ));
        assert_eq!(fixture.names(), vec!["(one.vpk)"]);
        assert_eq!(fixture.app.store.load().unwrap().mods.len(), 1);
    }

    #[test]
    fn catalogue_readd_overwrites_without_new_entry() {
        let mut fixture = Fixture::new();
        let archive = fixture.temp.path().join("Quiet Guns.zip");
        write_zip(&archive, &[("sounds/a.vpk", b"v1"), ("readme.txt", b"hi")]);

        let first = fixture
            .app
            .add_files(&[archive.clone()], Some((mod_item(42), " Quiet: Guns. ")));
        assert_eq!(first.added, vec![1]);
        assert_eq!(fixture.names(), vec!["Quiet Guns (Quiet Guns.zip/sounds/a.vpk)"]);

        write_zip(&archive, &[("sounds/a.vpk", b"v2")]);
        let second = fixture
            .app
            .add_files(&[archive], Some((mod_item(42), "Quiet Guns")));
        assert!(second.added.is_empty());
        assert_eq!(second.replaced, 1);
        assert_eq!(fixture.app.registry().len(), 1);

        let entry = &fixture.app.registry().entries()[0];
        assert_eq!(fs::read(&entry.source_path).unwrap(), b"v2");
        assert_eq!(
            entry.origin,
            Origin::Catalogue {
                item: Some(mod_item(42))
            }
        );
    }

    #[test]
    fn remove_deletes_installed_file() {
        let mut fixture = Fixture::new();
        let source = fixture.source("gone.vpk", b"bye");
        fixture.app.add_files(&[source], None);
        let installed = fixture.app.registry().entries()[0].source_path.clone();

        fixture.app.remove(1).unwrap();
        assert!(!installed.exists());
        assert!(fixture.app.dirs.root.is_dir());
        assert!(fixture.app.store.load().unwrap().mods.is_empty());
    }

    #[test]
    fn deploy_requires_a_game_folder() {
        let mut fixture = Fixture::new();
        let not_a_game = fixture.temp.path().join("empty");
        fs::create_dir_all(&not_a_game).unwrap();

        assert!(fixture.app.set_game_folder(&not_a_game).is_err());
        assert!(matches!(
            fixture.app.deploy(),
            Err(DeployError::GameFolderMissing)
        ));
    }

    #[test]
    fn deploy_links_enabled_mods_into_game() {
        let mut fixture = Fixture::new();
        let game_root = fixture.temp.path().join("Deadlock");
        let game = fake_game_root(&game_root);
        fs::write(
            &game.gameinfo_path,
            "SearchPaths\n{\n\t\t\tGame_Language\t\tcitadel_*LANGUAGE*\n}\n",
        )
        .unwrap();
        fixture.app.set_game_folder(&game_root).unwrap();

        let files = vec![
            fixture.source("a.vpk", b"a"),
            fixture.source("b.vpk", b"b"),
        ];
        fixture.app.add_files(&files, None);
        fixture.app.set_enabled(1, false).unwrap();

        let report = fixture.app.deploy().unwrap();
        assert_eq!(report.deployed, 1);
        assert_eq!(fs::read(game.addons_dir.join("pak01_dir.vpk")).unwrap(), b"b");

        let saved = fixture.app.store.load().unwrap();
        assert_eq!(saved.game_folder, Some(game_root));
    }

    #[test]
    fn search_continues_after_previous_hit() {
        let mut fixture = Fixture::new();
        let files = vec![
            fixture.source("alpha.vpk", b"1"),
            fixture.source("beta.vpk", b"2"),
            fixture.source("alphabet.vpk", b"3"),
        ];
        fixture.app.add_files(&files, None);

        assert_eq!(fixture.app.search_from("ALPHA", 0), Some(0));
        assert_eq!(fixture.app.search_cursor().next_index(), 1);
        assert_eq!(fixture.app.search_from("ALPHA", 1), Some(2));
        assert_eq!(fixture.app.search_cursor().next_index(), 0);
        assert_eq!(fixture.app.search_from("beta", 2), Some(1));
        assert_eq!(fixture.app.search_from("nothing", 2), None);
        assert_eq!(fixture.app.search_cursor().next_index(), 0);
    }

    #[test]
    fn finished_download_is_ingested_and_cleaned_up() {
        let mut catalogue = MemoryCatalogue::default();
        catalogue.entries.insert(
            621072,
            (
                "Big, Hat".to_string(),
                vec![
                    ("hat.zip".to_string(), b"zipped".to_vec()),
                    ("extra.vpk".to_string(), b"plain".to_vec()),
                ],
            ),
        );
        let mut fixture = Fixture::with_catalogue(catalogue);

        fixture.app.request_download(mod_item(621072)).unwrap();
        assert!(fixture.app.has_pending_acquisitions());
        let report = fixture
            .app
            .wait_for_acquisition(Duration::from_secs(10))
            .expect("download finished");

        assert!(!report.download_failed());
        assert_eq!(report.name, "Big Hat");
        assert_eq!(report.add.added, vec![1, 2]);
        assert!(!fixture.app.has_pending_acquisitions());
        assert_eq!(
            fixture.names(),
            vec!["Big Hat (hat.zip/pack/inner.vpk)", "Big Hat (extra.vpk)"]
        );

        let pool = fixture.app.dirs.gamebanana_dir().join("Mods/621072");
        assert!(pool.join("hat/pack/inner.vpk").is_file());
        assert!(pool.join("extra/extra.vpk").is_file());
        let downloads = fixture.app.dirs.downloads_dir();
        assert_eq!(fs::read_dir(&downloads).unwrap().count(), 0);
    }

    #[test]
    fn failed_lookup_reports_without_adding() {
        let mut fixture = Fixture::new();
        fixture.app.request_download(mod_item(1)).unwrap();
        let report = fixture
            .app
            .wait_for_acquisition(Duration::from_secs(10))
            .expect("download finished");
        assert!(report.download_failed());
        assert!(report.add.added.is_empty());
        assert!(fixture.app.registry().is_empty());
    }

    #[test]
    fn unreadable_settings_start_empty_with_warning() {
        let temp = tempfile::tempdir().unwrap();
        let dirs = AppDirs::new(temp.path().join("app"));
        dirs.ensure().unwrap();
        fs::write(dirs.settings_path(), "{{{{").unwrap();

        let app = App::open(dirs, Arc::new(MemoryCatalogue::default())).unwrap();
        assert!(app.registry().is_empty());
        assert!(matches!(
            app.load_warning(),
            Some(StoreError::ConfigLoadFailure { .. })
        ));
    }
}
