use crate::{
    config::ToolPaths,
    deadlock::is_package_name,
    error::IngestError,
    pool::{next_unnamed_slot, unnamed_path, Destination, StoragePools},
};
use filetime::{set_file_mtime, FileTime};
use std::{
    fs::{self, File},
    io,
    path::{Component, Path, PathBuf},
    process::{Command, Stdio},
};
use time::{Date, Month, PrimitiveDateTime, Time as TimeOfDay};

/// One package file materialized into owned storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedPackage {
    pub path: PathBuf,
    /// File name of what the user or downloader handed us.
    pub source_name: String,
    /// Relative path inside the container; `None` for a bare package.
    pub entry_name: Option<String>,
    /// The destination already existed and was overwritten.
    pub replaced: bool,
}

impl IngestedPackage {
    /// `archive.zip/sub/pack.vpk`, or just `pack.vpk` for a bare file.
    pub fn label(&self) -> String {
        match &self.entry_name {
            Some(entry) => format!("{}/{}", self.source_name, entry),
            None => self.source_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    PlainFile,
    Zip,
    SevenZip,
    Rar,
}

impl ContainerKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "vpk" => Some(ContainerKind::PlainFile),
            "zip" => Some(ContainerKind::Zip),
            "7z" => Some(ContainerKind::SevenZip),
            "rar" => Some(ContainerKind::Rar),
            _ => None,
        }
    }
}

/// An opened input, able to list its package entries and extract one of them.
enum Container {
    PlainFile {
        path: PathBuf,
    },
    Zip {
        path: PathBuf,
        archive: zip::ZipArchive<File>,
    },
    SevenZip {
        path: PathBuf,
    },
    Rar {
        path: PathBuf,
        tool: PathBuf,
    },
}

impl Container {
    fn open(path: &Path, tools: &ToolPaths) -> Result<Self, IngestError> {
        let kind = ContainerKind::from_path(path)
            .ok_or_else(|| IngestError::UnsupportedFormat(path.to_path_buf()))?;
        let path = path.to_path_buf();
        match kind {
            ContainerKind::PlainFile => {
                if !path.is_file() {
                    return Err(IngestError::io(
                        &path,
                        io::Error::new(io::ErrorKind::NotFound, "package file not found"),
                    ));
                }
                Ok(Container::PlainFile { path })
            }
            ContainerKind::Zip => {
                let file = File::open(&path).map_err(|err| IngestError::io(&path, err))?;
                let archive =
                    zip::ZipArchive::new(file).map_err(|err| IngestError::corrupt(&path, err))?;
                Ok(Container::Zip { path, archive })
            }
            ContainerKind::SevenZip => {
                if !path.is_file() {
                    return Err(IngestError::io(
                        &path,
                        io::Error::new(io::ErrorKind::NotFound, "archive not found"),
                    ));
                }
                sevenz_rust::SevenZReader::open(&path, sevenz_rust::Password::empty())
                    .map_err(|err| IngestError::corrupt(&path, err))?;
                Ok(Container::SevenZip { path })
            }
            ContainerKind::Rar => {
                let tool = tools
                    .rar_tool
                    .clone()
                    .ok_or_else(|| IngestError::MissingExtractionTool(path.clone()))?;
                Ok(Container::Rar { path, tool })
            }
        }
    }

    fn path(&self) -> &Path {
        match self {
            Container::PlainFile { path }
            | Container::Zip { path, .. }
            | Container::SevenZip { path }
            | Container::Rar { path, .. } => path,
        }
    }

    fn is_archive(&self) -> bool {
        !matches!(self, Container::PlainFile { .. })
    }

    /// Names of entries that end in the package extension, in archive order.
    fn package_entries(&mut self) -> Result<Vec<String>, IngestError> {
        match self {
            Container::PlainFile { path } => Ok(vec![file_name_of(path)]),
            Container::Zip { archive, .. } => {
                let names = (0..archive.len())
                    .filter_map(|index| {
                        let file = archive.by_index_raw(index).ok()?;
                        if file.is_dir() || file.enclosed_name().is_none() {
                            return None;
                        }
                        let name = file.name().to_string();
                        is_package_name(&name).then_some(name)
                    })
                    .collect();
                Ok(names)
            }
            Container::SevenZip { path } => {
                let reader =
                    sevenz_rust::SevenZReader::open(path.as_path(), sevenz_rust::Password::empty())
                        .map_err(|err| IngestError::corrupt(path.as_path(), err))?;
                let names = reader
                    .archive()
                    .files
                    .iter()
                    .filter(|entry| !entry.is_directory() && is_package_name(entry.name()))
                    .map(|entry| entry.name().to_string())
                    .collect();
                Ok(names)
            }
            Container::Rar { path, tool } => {
                let output = run_rar_tool(tool, path, &["lb"], &[])?;
                let listing = String::from_utf8_lossy(&output);
                Ok(listing
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && is_package_name(line))
                    .map(str::to_string)
                    .collect())
            }
        }
    }

    fn extract_entry(&mut self, entry: &str, target: &Path) -> Result<(), IngestError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| IngestError::io(parent, err))?;
        }
        match self {
            Container::PlainFile { path } => {
                fs::copy(path.as_path(), target).map_err(|err| IngestError::io(target, err))?;
                Ok(())
            }
            Container::Zip { path, archive } => {
                let mut file = archive
                    .by_name(entry)
                    .map_err(|err| IngestError::corrupt(path.as_path(), err))?;
                let mut out = File::create(target).map_err(|err| IngestError::io(target, err))?;
                io::copy(&mut file, &mut out).map_err(|err| IngestError::io(target, err))?;
                if let Some(mtime) = file.last_modified().and_then(zip_time_to_unix) {
                    let _ = set_file_mtime(target, FileTime::from_unix_time(mtime, 0));
                }
                Ok(())
            }
            Container::SevenZip { path } => extract_7z_entry(path, entry, target),
            Container::Rar { path, tool } => {
                let bytes = run_rar_tool(tool, path, &["p", "-inul"], &[entry])?;
                fs::write(target, bytes).map_err(|err| IngestError::io(target, err))?;
                Ok(())
            }
        }
    }
}

/// Copies or extracts every package in `source` into owned storage, handing
/// each one to `on_package` as soon as it is on disk and before the next entry
/// is extracted. Returns how many packages were produced.
///
/// Existing destinations are overwritten and flagged `replaced`; nothing is ever
/// deleted here. Manual archives get one `Unnamed_VPK_<N>` slot per package entry.
pub fn ingest(
    source: &Path,
    destination: Destination,
    pools: &StoragePools,
    tools: &ToolPaths,
    mut on_package: impl FnMut(IngestedPackage),
) -> Result<usize, IngestError> {
    let mut container = Container::open(source, tools)?;
    let entries = container.package_entries()?;
    let source_name = file_name_of(container.path());
    tracing::debug!(
        source = %source.display(),
        entries = entries.len(),
        "scanned container"
    );

    let mut produced = 0;
    for entry in entries {
        let Some(relative) = safe_relative(&entry) else {
            tracing::warn!(entry = %entry, "skipping archive entry with unsafe path");
            continue;
        };
        let target = match destination {
            Destination::Catalogue(item) => {
                let base = pools.catalogue_dir(item, source);
                if container.is_archive() {
                    base.join(&relative)
                } else {
                    base.join(&source_name)
                }
            }
            Destination::Manual => {
                fs::create_dir_all(&pools.manual)
                    .map_err(|err| IngestError::io(&pools.manual, err))?;
                let slot = next_unnamed_slot(&pools.manual);
                if container.is_archive() {
                    unnamed_path(&pools.manual, slot, false).join(&relative)
                } else {
                    unnamed_path(&pools.manual, slot, true)
                }
            }
        };

        let replaced = target.exists();
        if replaced {
            tracing::info!(path = %target.display(), "package already installed; overwriting");
        }
        container.extract_entry(&entry, &target)?;
        produced += 1;
        on_package(IngestedPackage {
            path: target,
            source_name: source_name.clone(),
            entry_name: container.is_archive().then_some(entry),
            replaced,
        });
    }

    Ok(produced)
}

fn extract_7z_entry(path: &Path, entry: &str, target: &Path) -> Result<(), IngestError> {
    let mut reader = sevenz_rust::SevenZReader::open(path, sevenz_rust::Password::empty())
        .map_err(|err| IngestError::corrupt(path, err))?;

    let mut found = false;
    let mut write_error: Option<io::Error> = None;
    reader
        .for_each_entries(|archive_entry, data| {
            if archive_entry.name() != entry {
                if let Err(err) = io::copy(data, &mut io::sink()) {
                    write_error = Some(err);
                    return Ok(false);
                }
                return Ok(true);
            }
            found = true;
            let result = File::create(target).and_then(|mut out| io::copy(data, &mut out));
            if let Err(err) = result {
                write_error = Some(err);
            }
            Ok(false)
        })
        .map_err(|err| IngestError::corrupt(path, err))?;

    if let Some(err) = write_error {
        return Err(IngestError::io(target, err));
    }
    if !found {
        return Err(IngestError::corrupt(
            path,
            format!("entry {entry:?} vanished during extraction"),
        ));
    }
    Ok(())
}

fn run_rar_tool(
    tool: &Path,
    archive: &Path,
    args: &[&str],
    trailing: &[&str],
) -> Result<Vec<u8>, IngestError> {
    let output = Command::new(tool)
        .args(args)
        .arg(archive)
        .args(trailing)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = match output {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(IngestError::MissingExtractionTool(archive.to_path_buf()));
        }
        Err(err) => return Err(IngestError::io(tool, err)),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(IngestError::corrupt(
            archive,
            format!("rar tool failed: {}", stderr.trim()),
        ));
    }

    Ok(output.stdout)
}

/// Normalizes an archive entry name into a relative path, rejecting anything
/// that would climb out of its destination.
fn safe_relative(entry: &str) -> Option<PathBuf> {
    let normalized = entry.replace('\\', "/");
    let mut out = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    let month = Month::try_from(dt.month()).ok()?;
    let date = Date::from_calendar_date(dt.year() as i32, month, dt.day()).ok()?;
    let time = TimeOfDay::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    let datetime = PrimitiveDateTime::new(date, time).assume_utc();
    Some(datetime.unix_timestamp())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::{fs::File, io::Write, path::Path};
    use zip::write::SimpleFileOptions;

    pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, data) in entries {
            if name.ends_with('/') {
                writer
                    .add_directory(name.trim_end_matches('/'), SimpleFileOptions::default())
                    .unwrap();
                continue;
            }
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }
}
