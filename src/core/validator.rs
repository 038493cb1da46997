//! Content-hash validation of cloned devices.
//!
//! The validator keeps a [`HashIndex`] of every source file and, after a
//! device has been written, proves the destination holds exactly the same
//! set of contents. Paths are not compared, only hashes: the copy may land
//! under a different directory layout on the device.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::is_excluded;
use crate::error::{FlashError, Result};

/// Buffer size for streaming file contents into the hasher.
const BUFFER_SIZE: usize = 128 * 1024;

/// One generation of source hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashIndex {
    files: HashMap<PathBuf, blake3::Hash>,
    /// Sum of the top-level source modification times when built.
    fingerprint: Option<Duration>,
}

impl HashIndex {
    pub fn files(&self) -> &HashMap<PathBuf, blake3::Hash> {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// hash -> source paths carrying that content.
    fn reverse(&self) -> HashMap<blake3::Hash, Vec<PathBuf>> {
        let mut reverse: HashMap<blake3::Hash, Vec<PathBuf>> = HashMap::new();
        for (path, hash) in &self.files {
            reverse.entry(*hash).or_default().push(path.clone());
        }
        reverse
    }
}

/// How a reindex was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexOutcome {
    /// Source modification times were unchanged; the index was kept.
    Reused { files: usize },
    Rebuilt { files: usize },
}

/// A source file with no matching content at the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingFile {
    pub source: PathBuf,
    pub hash: blake3::Hash,
}

/// Result of comparing a destination tree against the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Destination files whose content matched a source file.
    pub matched: usize,
    /// Destination file whose content is not in the index. Checking stops there.
    pub unexpected: Option<PathBuf>,
    /// Indexed files never accounted for at the destination.
    pub missing: Vec<MissingFile>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.unexpected.is_none() && self.missing.is_empty()
    }
}

/// Shared validator consulted by every pipeline job.
///
/// A single lock spans each whole reindex and each whole verify, so a
/// reader never observes a half-built index.
#[derive(Clone)]
pub struct ChecksumValidator {
    sources: Arc<Vec<PathBuf>>,
    exclude: Arc<Vec<String>>,
    index: Arc<Mutex<HashIndex>>,
}

impl ChecksumValidator {
    pub fn new(sources: Vec<PathBuf>, exclude: Vec<String>) -> Self {
        Self {
            sources: Arc::new(sources),
            exclude: Arc::new(exclude),
            index: Arc::new(Mutex::new(HashIndex::default())),
        }
    }

    /// Copy of the current index.
    pub async fn snapshot(&self) -> HashIndex {
        self.index.lock().await.clone()
    }

    /// Rehash the sources unless their aggregate modification time is the
    /// same as for the current index.
    ///
    /// The mtime sum only covers the top-level source paths. Edits deep
    /// inside a source directory that leave those untouched are not seen.
    pub async fn reindex(&self) -> Result<ReindexOutcome> {
        let mut index = self.index.lock().await;

        let sources = self.sources.clone();
        let exclude = self.exclude.clone();

        let outcome = tokio::task::spawn_blocking({
            let current = index.fingerprint;
            move || -> Result<Option<HashIndex>> {
                let fingerprint = source_fingerprint(&sources)?;
                if current == Some(fingerprint) {
                    return Ok(None);
                }
                let files = hash_sources(&sources, &exclude)?;
                Ok(Some(HashIndex {
                    files,
                    fingerprint: Some(fingerprint),
                }))
            }
        })
        .await
        .map_err(|e| FlashError::Task(e.to_string()))??;

        match outcome {
            None => {
                debug!(files = index.len(), "Sources unchanged, reusing hash index");
                Ok(ReindexOutcome::Reused { files: index.len() })
            }
            Some(fresh) => {
                *index = fresh;
                info!(files = index.len(), "Indexed clone sources");
                Ok(ReindexOutcome::Rebuilt { files: index.len() })
            }
        }
    }

    /// Check that `root` holds exactly the indexed contents.
    ///
    /// Every destination file must consume a distinct indexed entry with the
    /// same hash; the first file whose hash is unknown fails the check
    /// immediately. Entries left over afterwards are reported missing.
    pub async fn verify(&self, root: &Path) -> Result<VerifyReport> {
        let index = self.index.lock().await;

        let root = root.to_path_buf();
        let exclude = self.exclude.clone();
        let reverse = index.reverse();

        let report = tokio::task::spawn_blocking(move || compare_tree(&root, &exclude, reverse))
            .await
            .map_err(|e| FlashError::Task(e.to_string()))??;

        if let Some(path) = &report.unexpected {
            warn!(file = %path.display(), "Destination file does not match any source");
        }
        for missing in &report.missing {
            warn!(
                file = %missing.source.display(),
                hash = %missing.hash,
                "Source file missing from destination"
            );
        }

        Ok(report)
    }
}

fn compare_tree(
    root: &Path,
    exclude: &[String],
    mut expected: HashMap<blake3::Hash, Vec<PathBuf>>,
) -> Result<VerifyReport> {
    let mut files = Vec::new();
    collect_files(root, exclude, Unreadable::Skip, &mut files)?;

    let mut report = VerifyReport::default();
    for file in files {
        let hash = hash_file_sync(&file)?;

        let Some(sources) = expected.get_mut(&hash) else {
            report.unexpected = Some(file);
            return Ok(report);
        };
        sources.pop();
        if sources.is_empty() {
            expected.remove(&hash);
        }
        report.matched += 1;
    }

    report.missing = expected
        .into_iter()
        .flat_map(|(hash, sources)| {
            sources
                .into_iter()
                .map(move |source| MissingFile { source, hash })
        })
        .collect();
    report.missing.sort_by(|a, b| a.source.cmp(&b.source));

    Ok(report)
}

/// Sum of the modification times of the top-level source paths.
fn source_fingerprint(sources: &[PathBuf]) -> Result<Duration> {
    let mut total = Duration::ZERO;
    for source in sources {
        let modified = std::fs::metadata(source)
            .and_then(|m| m.modified())
            .map_err(|e| FlashError::io(source, e))?;
        total += modified
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
    }
    Ok(total)
}

fn hash_sources(sources: &[PathBuf], exclude: &[String]) -> Result<HashMap<PathBuf, blake3::Hash>> {
    let mut files = Vec::new();
    for source in sources {
        // rsync applies the exclude rules to the top-level name too
        if is_excluded(source, exclude) {
            debug!(path = %source.display(), "Clone source is excluded, skipping");
            continue;
        }

        let metadata = std::fs::metadata(source).map_err(|e| FlashError::io(source, e))?;
        if metadata.is_file() {
            files.push(source.clone());
        } else if metadata.is_dir() {
            collect_files(source, exclude, Unreadable::Fail, &mut files)?;
        } else {
            warn!(path = %source.display(), "Skipping clone source, not a file or directory");
        }
    }

    files
        .into_iter()
        .map(|path| hash_file_sync(&path).map(|hash| (path, hash)))
        .collect()
}

/// What to do with a directory that cannot be listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unreadable {
    Fail,
    /// Skip it. A fresh ext4 carries a root-only `lost+found`.
    Skip,
}

/// Collect regular, non-excluded files below `dir`. Symlinks are not
/// followed and excluded directories are not entered.
fn collect_files(
    dir: &Path,
    exclude: &[String],
    unreadable: Unreadable,
    files: &mut Vec<PathBuf>,
) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if unreadable == Unreadable::Skip => {
            warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
            return Ok(());
        }
        Err(e) => return Err(FlashError::io(dir, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| FlashError::io(dir, e))?;
        let path = entry.path();
        if is_excluded(&path, exclude) {
            continue;
        }

        let metadata = path
            .symlink_metadata()
            .map_err(|e| FlashError::io(&path, e))?;

        if metadata.is_dir() {
            collect_files(&path, exclude, unreadable, files)?;
        } else if metadata.is_file() {
            files.push(path);
        }
    }

    Ok(())
}

/// Hash a file with BLAKE3, streaming in chunks.
fn hash_file_sync(path: &Path) -> Result<blake3::Hash> {
    let file = std::fs::File::open(path).map_err(|e| FlashError::io(path, e))?;
    let mut reader = std::io::BufReader::with_capacity(BUFFER_SIZE, file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| FlashError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::tempdir;

    fn write(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_reindex_hashes_files_and_skips_excluded() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        write(&src.join("a.txt"), b"alpha");
        write(&src.join("nested/b.bin"), b"beta");
        write(&src.join("notes.tmp"), b"scratch");

        let validator = ChecksumValidator::new(vec![src.clone()], vec![".tmp".to_string()]);
        let outcome = validator.reindex().await.unwrap();
        assert_eq!(outcome, ReindexOutcome::Rebuilt { files: 2 });

        let index = validator.snapshot().await;
        assert_eq!(index.files()[&src.join("a.txt")], blake3::hash(b"alpha"));
        assert!(!index.files().contains_key(&src.join("notes.tmp")));
    }

    #[tokio::test]
    async fn test_reindex_reuses_unchanged_sources() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        write(&src.join("a.txt"), b"alpha");

        let validator = ChecksumValidator::new(vec![src.clone()], vec![]);
        validator.reindex().await.unwrap();
        let first = validator.snapshot().await;

        let outcome = validator.reindex().await.unwrap();
        assert_eq!(outcome, ReindexOutcome::Reused { files: 1 });
        assert_eq!(validator.snapshot().await, first);
    }

    #[tokio::test]
    async fn test_reindex_rebuilds_when_top_level_changes() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        write(&src.join("a.txt"), b"alpha");

        let validator = ChecksumValidator::new(vec![src.clone()], vec![]);
        validator.reindex().await.unwrap();

        // Adding an entry bumps the directory mtime; force it forward in case
        // the filesystem has coarse timestamps.
        write(&src.join("b.txt"), b"beta");
        let later = std::fs::File::open(&src).unwrap();
        later
            .set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();

        let outcome = validator.reindex().await.unwrap();
        assert_eq!(outcome, ReindexOutcome::Rebuilt { files: 2 });
    }

    #[tokio::test]
    async fn test_single_file_source() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("image.iso");
        write(&file, b"iso");

        let validator = ChecksumValidator::new(vec![file.clone()], vec![]);
        validator.reindex().await.unwrap();
        assert_eq!(validator.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_contents_need_distinct_copies() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        write(&src.join("one.txt"), b"same");
        write(&src.join("two.txt"), b"same");

        let validator = ChecksumValidator::new(vec![src.clone()], vec![]);
        validator.reindex().await.unwrap();

        let dest = temp.path().join("dest");
        write(&dest.join("one.txt"), b"same");
        let report = validator.verify(&dest).await.unwrap();
        assert!(!report.passed());
        assert_eq!(report.missing.len(), 1);

        write(&dest.join("two.txt"), b"same");
        assert!(validator.verify(&dest).await.unwrap().passed());
    }

    #[tokio::test]
    async fn test_exclusion_covers_directories_dotfiles_and_compound_extensions() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        write(&src.join("keep.txt"), b"keep");
        write(&src.join("cache.tmp/inner.bin"), b"inner");
        write(&src.join(".tmp"), b"dot");
        write(&src.join("a.tar.gz"), b"archive");

        let exclude = vec![".tmp".to_string(), ".tar.gz".to_string()];
        let validator = ChecksumValidator::new(vec![src.clone()], exclude);
        validator.reindex().await.unwrap();

        let index = validator.snapshot().await;
        let indexed: Vec<&PathBuf> = index.files().keys().collect();
        assert_eq!(indexed, vec![&src.join("keep.txt")]);

        // What rsync leaves behind with the same rules
        let dest = temp.path().join("dest");
        write(&dest.join("src/keep.txt"), b"keep");
        assert!(validator.verify(&dest).await.unwrap().passed());
    }

    #[tokio::test]
    async fn test_excluded_top_level_source_is_skipped() {
        let temp = tempdir().unwrap();
        let kept = temp.path().join("payload");
        let dropped = temp.path().join("scratch.tmp");
        write(&kept.join("a.txt"), b"alpha");
        write(&dropped.join("b.txt"), b"beta");

        let validator = ChecksumValidator::new(vec![kept, dropped], vec![".tmp".to_string()]);
        assert_eq!(
            validator.reindex().await.unwrap(),
            ReindexOutcome::Rebuilt { files: 1 }
        );
    }

    #[tokio::test]
    async fn test_verify_skips_unreadable_destination_directories() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        write(&src.join("a.txt"), b"alpha");

        let validator = ChecksumValidator::new(vec![src.clone()], vec![]);
        validator.reindex().await.unwrap();

        let dest = temp.path().join("dest");
        write(&dest.join("src/a.txt"), b"alpha");
        let lost = dest.join("lost+found");
        std::fs::create_dir(&lost).unwrap();
        std::fs::set_permissions(&lost, std::fs::Permissions::from_mode(0o000)).unwrap();

        let report = validator.verify(&dest).await;

        std::fs::set_permissions(&lost, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(report.unwrap().passed());
    }

    #[tokio::test]
    async fn test_unreadable_source_directory_fails_reindex() {
        use std::os::unix::fs::PermissionsExt;

        if nix::unistd::Uid::effective().is_root() {
            // Root reads through any permission bits
            return;
        }

        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        write(&src.join("a.txt"), b"alpha");
        let locked = src.join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

        let validator = ChecksumValidator::new(vec![src.clone()], vec![]);
        let result = validator.reindex().await;

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(matches!(result, Err(FlashError::Io { .. })));
    }

    #[tokio::test]
    async fn test_symlinks_are_ignored() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        write(&src.join("a.txt"), b"alpha");
        std::os::unix::fs::symlink(src.join("a.txt"), src.join("link.txt")).unwrap();

        let validator = ChecksumValidator::new(vec![src.clone()], vec![]);
        validator.reindex().await.unwrap();
        assert_eq!(validator.snapshot().await.len(), 1);
    }
}
