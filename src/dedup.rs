use crate::pool::remove_with_empty_parents;
use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

const COMPARE_CHUNK: usize = 64 * 1024;

/// Returns the first file under `pool_root` whose bytes equal `candidate`'s.
/// The candidate itself is skipped. Traversal is sorted by file name so the
/// winner is stable for a given directory state.
pub fn find_identical(candidate: &Path, pool_root: &Path) -> io::Result<Option<PathBuf>> {
    let candidate_len = candidate.metadata()?.len();

    for entry in WalkDir::new(pool_root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable pool entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
    {
        let path = entry.path();
        if path == candidate {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "skipping unreadable pool entry"
                );
                continue;
            }
        };
        if meta.len() != candidate_len {
            continue;
        }
        if same_contents(candidate, path)? {
            return Ok(Some(path.to_path_buf()));
        }
    }

    Ok(None)
}

/// Looks for an installed twin of a freshly ingested manual package. On a hit
/// the fresh copy is deleted (with any ancestors it leaves empty, up to but not
/// including `pool_root`) and the path of the original is returned.
pub fn find_duplicate(candidate: &Path, pool_root: &Path) -> io::Result<Option<PathBuf>> {
    let Some(existing) = find_identical(candidate, pool_root)? else {
        return Ok(None);
    };
    tracing::info!(
        candidate = %candidate.display(),
        existing = %existing.display(),
        "duplicate package; discarding new copy"
    );
    remove_with_empty_parents(candidate, pool_root)?;
    Ok(Some(existing))
}

fn same_contents(left: &Path, right: &Path) -> io::Result<bool> {
    let mut left = BufReader::new(File::open(left)?);
    let mut right = match File::open(right) {
        Ok(file) => BufReader::new(file),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    let mut left_buf = vec![0u8; COMPARE_CHUNK];
    let mut right_buf = vec![0u8; COMPARE_CHUNK];
    loop {
        let read = read_full(&mut left, &mut left_buf)?;
        let other = read_full(&mut right, &mut right_buf)?;
        if read != other || left_buf[..read] != right_buf[..other] {
            return Ok(false);
        }
        if read == 0 {
            return Ok(true);
        }
    }
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
