//! The markdown vault: per-project, per-day session files.
//!
//! Every mutation takes a per-file `fd-lock` on a sidecar `<file>.lock`,
//! rebuilds the full contents in memory, writes them to a temp file in the
//! same directory, fsyncs and renames over the original. The sidecar outlives
//! the file it guards: writers blocked on it must contend on the same inode.

use std::{
    collections::HashSet,
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
};

use {
    chrono::NaiveDate,
    fd_lock::RwLock,
    serde::Serialize,
    tempfile::NamedTempFile,
    tracing::{debug, info, warn},
    uuid::Uuid,
    walkdir::WalkDir,
};

use crate::{
    codec::{self, CodecError},
    error::{MemoryError, Result},
    model::MemoryRecord,
};

const SESSION_SUFFIX: &str = "-session.md";

/// A record together with the file it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Located {
    pub record: MemoryRecord,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionFile {
    pub project: String,
    pub date: NaiveDate,
    pub path: PathBuf,
    pub records: usize,
}

/// Result of parsing one vault file during a scan.
#[derive(Debug)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub records: Result<Vec<MemoryRecord>, CodecError>,
}

#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_path(&self, project: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(project)
            .join(format!("{}{SESSION_SUFFIX}", date.format("%Y-%m-%d")))
    }

    /// Path of a vault file as stored in the index: relative, `/`-separated.
    pub fn relative(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Inverse of [`Vault::relative`].
    pub fn resolve(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    /// Append a record to its session file and return it with the final id.
    ///
    /// If the id already appears in that file a fresh one is generated.
    pub async fn append(&self, record: MemoryRecord) -> Result<(MemoryRecord, PathBuf)> {
        let path = self.session_path(&record.project, record.session_date());
        let target = path.clone();
        let record = blocking(&path, move || append_blocking(&target, record)).await?;
        info!(id = %record.id, path = %path.display(), "memory written to vault");
        Ok((record, path))
    }

    /// Remove records by id from one file. Returns how many were removed.
    ///
    /// A file left without records is deleted.
    pub async fn remove(&self, path: &Path, ids: HashSet<String>) -> Result<usize> {
        let target = path.to_path_buf();
        blocking(path, move || {
            rewrite_blocking(&target, |records| {
                records.retain(|r| !ids.contains(&r.id));
            })
        })
        .await
    }

    /// Replace the records of one file in place, keeping its header.
    pub async fn replace_records(&self, path: &Path, replacement: Vec<MemoryRecord>) -> Result<()> {
        let target = path.to_path_buf();
        blocking(path, move || {
            rewrite_blocking(&target, move |records| *records = replacement).map(|_| ())
        })
        .await
    }

    /// Read one file and return the record with exactly this id.
    pub async fn read_record(&self, path: &Path, id: &str) -> Result<Option<MemoryRecord>> {
        let records = self.read_file(path).await?;
        Ok(records.into_iter().find(|r| r.id == id))
    }

    pub async fn read_file(&self, path: &Path) -> Result<Vec<MemoryRecord>> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MemoryError::persistence(path, e)),
        };
        codec::decode_session(&text).map_err(|source| MemoryError::Codec {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Every `*.md` file under the vault, sorted by path. Hidden entries are skipped.
    pub async fn markdown_files(&self) -> Result<Vec<PathBuf>> {
        let root = self.root.clone();
        blocking(&self.root, move || markdown_files_blocking(&root)).await
    }

    /// Parse every vault file, reporting failures per file.
    pub async fn scan(&self) -> Result<Vec<ScannedFile>> {
        let mut scanned = Vec::new();
        for path in self.markdown_files().await? {
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| MemoryError::persistence(&path, e))?;
            let records = codec::decode_session(&text);
            scanned.push(ScannedFile { path, records });
        }
        Ok(scanned)
    }

    /// Find records whose id starts with `prefix` by scanning the vault.
    pub async fn find(&self, prefix: &str) -> Result<Vec<Located>> {
        let mut found = Vec::new();
        for file in self.scan().await? {
            match file.records {
                Ok(records) => found.extend(
                    records
                        .into_iter()
                        .filter(|r| r.id.starts_with(prefix))
                        .map(|record| Located {
                            record,
                            path: file.path.clone(),
                        }),
                ),
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "skipping unreadable vault file");
                },
            }
        }
        Ok(found)
    }

    /// Session files, newest first, optionally for one project.
    pub async fn list_sessions(
        &self,
        project: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<SessionFile>> {
        let mut sessions = Vec::new();
        for file in self.scan().await? {
            let Some((file_project, date)) = self.session_identity(&file.path) else {
                continue;
            };
            if project.is_some_and(|p| p != file_project) {
                continue;
            }
            let records = file.records.as_ref().map(Vec::len).unwrap_or(0);
            sessions.push(SessionFile {
                project: file_project,
                date,
                path: file.path,
                records,
            });
        }
        sessions.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.project.cmp(&b.project)));
        if let Some(limit) = limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    fn session_identity(&self, path: &Path) -> Option<(String, NaiveDate)> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = relative.components();
        let project = parts.next()?.as_os_str().to_str()?.to_string();
        let file_name = parts.next()?.as_os_str().to_str()?;
        if parts.next().is_some() {
            return None;
        }
        let date = file_name.strip_suffix(SESSION_SUFFIX)?;
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        Some((project, date))
    }
}

async fn blocking<T, F>(path: &Path, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MemoryError::persistence(path, io::Error::other(e)))?
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Run `f` while holding the exclusive per-file lock.
fn with_file_lock<T>(path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let dir = path
        .parent()
        .ok_or_else(|| MemoryError::persistence(path, io::Error::other("path has no parent")))?;
    std::fs::create_dir_all(dir).map_err(|e| MemoryError::persistence(dir, e))?;
    let lock_file = lock_path(path);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_file)
        .map_err(|e| MemoryError::persistence(&lock_file, e))?;
    let mut lock = RwLock::new(file);
    let _guard = lock
        .write()
        .map_err(|e| MemoryError::persistence(&lock_file, e))?;
    f()
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(MemoryError::persistence(path, e)),
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| MemoryError::persistence(path, io::Error::other("path has no parent")))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| MemoryError::persistence(dir, e))?;
    tmp.write_all(contents.as_bytes())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| MemoryError::persistence(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| MemoryError::persistence(path, e.error))?;
    Ok(())
}

fn append_blocking(path: &Path, mut record: MemoryRecord) -> Result<MemoryRecord> {
    with_file_lock(path, || {
        let existing = read_optional(path)?;
        let mut contents = match existing {
            Some(text) => {
                while codec::contains_id(&text, &record.id) {
                    let fresh = Uuid::now_v7().to_string();
                    debug!(old = %record.id, new = %fresh, "id already in session file, regenerating");
                    record.id = fresh;
                }
                let mut text = text;
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text
            },
            None => codec::session_header(&record.project, record.session_date()),
        };
        let encoded = codec::encode_record(&record).map_err(|source| MemoryError::Codec {
            path: path.to_path_buf(),
            source,
        })?;
        contents.push_str(&encoded);
        write_atomic(path, &contents)?;
        Ok(record)
    })
}

/// Decode, edit and rewrite a file under its lock. Returns the number of records dropped.
fn rewrite_blocking(
    path: &Path,
    edit: impl FnOnce(&mut Vec<MemoryRecord>),
) -> Result<usize> {
    with_file_lock(path, || {
        let Some(text) = read_optional(path)? else {
            return Ok(0);
        };
        let mut records = codec::decode_session(&text).map_err(|source| MemoryError::Codec {
            path: path.to_path_buf(),
            source,
        })?;
        let before = records.len();
        edit(&mut records);
        let removed = before.saturating_sub(records.len());

        if records.is_empty() {
            std::fs::remove_file(path).map_err(|e| MemoryError::persistence(path, e))?;
            info!(path = %path.display(), "removed empty session file");
            return Ok(removed);
        }

        let mut contents = codec::preamble(&text).to_string();
        for record in &records {
            let encoded = codec::encode_record(record).map_err(|source| MemoryError::Codec {
                path: path.to_path_buf(),
                source,
            })?;
            contents.push_str(&encoded);
        }
        write_atomic(path, &contents)?;
        Ok(removed)
    })
}

fn markdown_files_blocking(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            MemoryError::persistence(path, io::Error::other(e))
        })?;
        if entry.file_type().is_file() && entry.path().extension().is_some_and(|ext| ext == "md") {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use {
        super::*,
        crate::model::Category,
        chrono::{TimeZone, Utc},
        std::sync::Arc,
        tempfile::TempDir,
    };

    fn record(id: &str, title: &str) -> MemoryRecord {
        MemoryRecord {
            id: id.into(),
            title: title.into(),
            category: Category::Learning,
            tags: vec![],
            what: format!("what of {title}"),
            why: None,
            impact: None,
            details: None,
            related_files: vec![],
            source: None,
            project: "api".into(),
            created_at: Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn same_day_appends_share_one_file_in_order() {
        let tmp = TempDir::new().unwrap();
        let vault = Vault::new(tmp.path().join("vault"));

        let (a, path_a) = vault.append(record("id-a", "first")).await.unwrap();
        let (b, path_b) = vault.append(record("id-b", "second")).await.unwrap();
        assert_eq!(path_a, path_b);
        assert!(path_a.ends_with("api/2026-03-02-session.md"));

        let text = std::fs::read_to_string(&path_a).unwrap();
        assert!(text.starts_with("# api session 2026-03-02\n"));
        assert_eq!(vault.read_file(&path_a).await.unwrap(), vec![a, b]);
    }

    #[tokio::test]
    async fn duplicate_id_in_file_is_regenerated() {
        let tmp = TempDir::new().unwrap();
        let vault = Vault::new(tmp.path());
        let (first, _) = vault.append(record("same", "one")).await.unwrap();
        let (second, path) = vault.append(record("same", "two")).await.unwrap();
        assert_eq!(first.id, "same");
        assert_ne!(second.id, "same");
        assert_eq!(vault.read_file(&path).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_appends_all_persist() {
        let tmp = TempDir::new().unwrap();
        let vault = Arc::new(Vault::new(tmp.path()));
        let mut handles = Vec::new();
        for i in 0..16 {
            let vault = Arc::clone(&vault);
            handles.push(tokio::spawn(async move {
                vault
                    .append(record(&format!("id-{i:02}"), &format!("note {i}")))
                    .await
                    .unwrap()
            }));
        }
        let mut path = PathBuf::new();
        for handle in handles {
            path = handle.await.unwrap().1;
        }
        let mut ids: Vec<String> = vault
            .read_file(&path)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        assert_eq!(ids.len(), 16);
        assert_eq!(ids[0], "id-00");
        assert_eq!(ids[15], "id-15");
    }

    #[tokio::test]
    async fn remove_rewrites_and_deletes_empty_files() {
        let tmp = TempDir::new().unwrap();
        let vault = Vault::new(tmp.path());
        vault.append(record("keep", "kept")).await.unwrap();
        let (_, path) = vault.append(record("drop", "dropped")).await.unwrap();

        let removed = vault
            .remove(&path, HashSet::from(["drop".to_string()]))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let left = vault.read_file(&path).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "keep");
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("# api session"));

        vault
            .remove(&path, HashSet::from(["keep".to_string()]))
            .await
            .unwrap();
        assert!(!path.exists());
        assert!(lock_path(&path).exists());
        assert!(vault.markdown_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn emptying_remove_and_blocked_append_both_land() {
        let tmp = TempDir::new().unwrap();
        let vault = Vault::new(tmp.path());
        let (_, path) = vault.append(record("a", "first")).await.unwrap();
        let sidecar = lock_path(&path);

        // Hold the file lock so remove and append queue up behind it.
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder_path = sidecar.clone();
        let holder = std::thread::spawn(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&holder_path)
                .unwrap();
            let mut lock = RwLock::new(file);
            let _guard = lock.write().unwrap();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        locked_rx.recv().unwrap();

        let release = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            release_tx.send(()).unwrap();
        };
        let (removed, appended, ()) = tokio::join!(
            vault.remove(&path, HashSet::from(["a".to_string()])),
            vault.append(record("b", "second")),
            release,
        );
        holder.join().unwrap();
        assert_eq!(removed.unwrap(), 1);
        assert_eq!(appended.unwrap().0.id, "b");

        // A later writer must still serialize with anyone holding the sidecar.
        let (_, path) = vault.append(record("c", "third")).await.unwrap();
        vault
            .remove(&path, HashSet::from(["b".to_string()]))
            .await
            .unwrap();

        let ids: Vec<_> = vault
            .read_file(&path)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["c"]);
        assert!(sidecar.exists());
    }

    #[tokio::test]
    async fn interleaved_saves_and_deletes_keep_every_acknowledged_save() {
        let tmp = TempDir::new().unwrap();
        let vault = Arc::new(Vault::new(tmp.path()));
        let (_, path) = vault.append(record("seed", "seed")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..12 {
            let vault = Arc::clone(&vault);
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    let doomed = format!("drop-{i:02}");
                    vault.append(record(&doomed, "doomed")).await.unwrap();
                    vault.remove(&path, HashSet::from([doomed])).await.unwrap();
                    None
                } else {
                    let (saved, _) = vault
                        .append(record(&format!("keep-{i:02}"), "kept"))
                        .await
                        .unwrap();
                    Some(saved.id)
                }
            }));
        }
        vault
            .remove(&path, HashSet::from(["seed".to_string()]))
            .await
            .unwrap();

        let mut expected = Vec::new();
        for handle in handles {
            expected.extend(handle.await.unwrap());
        }
        expected.sort();
        let mut ids: Vec<_> = vault
            .read_file(&path)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn find_matches_prefixes_and_skips_bad_files() {
        let tmp = TempDir::new().unwrap();
        let vault = Vault::new(tmp.path());
        vault.append(record("0190aaaa-1", "a")).await.unwrap();
        vault.append(record("0190aaab-2", "b")).await.unwrap();
        std::fs::write(tmp.path().join("api").join("notes.md"), "<!-- echovault:memory x -->\n").unwrap();

        assert_eq!(vault.find("0190aaa").await.unwrap().len(), 2);
        let one = vault.find("0190aaab").await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].record.title, "b");
        assert!(vault.find("ffff").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sessions_are_listed_newest_first() {
        let tmp = TempDir::new().unwrap();
        let vault = Vault::new(tmp.path());
        let mut old = record("old", "old");
        old.created_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut other = record("other", "other");
        other.project = "web".into();
        vault.append(old).await.unwrap();
        vault.append(record("new", "new")).await.unwrap();
        vault.append(other).await.unwrap();

        let all = vault.list_sessions(None, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].date, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert_eq!(all[0].project, "api");
        assert_eq!(all[2].date, NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());

        let api = vault.list_sessions(Some("api"), Some(1)).await.unwrap();
        assert_eq!(api.len(), 1);
        assert_eq!(api[0].records, 1);
    }

    #[test]
    fn relative_paths_round_trip_through_resolve() {
        let vault = Vault::new("/home/me/vault");
        let path = vault.session_path("api", NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        let relative = vault.relative(&path);
        assert_eq!(relative, "api/2026-03-02-session.md");
        assert_eq!(vault.resolve(&relative), path);
    }
}
