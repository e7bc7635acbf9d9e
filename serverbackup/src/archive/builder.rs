//! Archive assembly: database dumps, directory trees, then METADATA.
//!
//! The archive is written to a staging file inside the backup directory and
//! renamed onto its final name only once the METADATA entry and the zstd
//! frame are complete. The staging name never matches the backup set
//! pattern, so retention can't observe a half-written archive, and a failed
//! build leaves earlier archives untouched.

use super::metadata::{Metadata, METADATA_ENTRY};
use super::ArchiveNaming;
use crate::capability::Capability;
use crate::config::{DatabaseSource, JobPlan};
use crate::executor::context::RunContext;
use crate::fs::walker::{walk_tree, EntryKind};
use crate::utils::errors::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tar::{EntryType, Header};
use tracing::{debug, info, warn};

/// zstd level for archives (the library default)
const COMPRESSION_LEVEL: i32 = 3;

const STAGING_PREFIX: &str = ".staging-";

/// A finished archive at its final path
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub path: PathBuf,
    pub metadata: Metadata,
    /// Entries written, METADATA included
    pub entries: usize,
    /// Compressed size on disk
    pub size_bytes: u64,
}

/// Dump output spooled to an anonymous file so its length is known up front
struct SpooledDump {
    entry_name: String,
    file: File,
    len: u64,
}

/// Running SHA-256 and byte count over every payload byte written
#[derive(Default)]
struct PayloadDigest {
    hasher: Sha256,
    len: u64,
}

/// Reader adapter yielding exactly `remaining` bytes of `inner` and feeding
/// them into a [`PayloadDigest`]. The tar header has already declared the
/// size, so a source that ends early is an `UnexpectedEof` error rather than
/// a short entry; anything past `remaining` is ignored.
struct DigestReader<'a, R> {
    inner: R,
    remaining: u64,
    digest: &'a mut PayloadDigest,
}

impl<'a, R: Read> DigestReader<'a, R> {
    fn new(inner: R, size: u64, digest: &'a mut PayloadDigest) -> Self {
        Self {
            inner,
            remaining: size,
            digest,
        }
    }
}

impl<R: Read> Read for DigestReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source ended {} bytes short of its recorded size", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        self.digest.hasher.update(&buf[..n]);
        self.digest.len += n as u64;
        Ok(n)
    }
}

/// Builds one archive per run from the job's configured sources
pub struct ArchiveBuilder {
    backup_dir: PathBuf,
    naming: ArchiveNaming,
    databases: Vec<DatabaseSource>,
    directories: Vec<PathBuf>,
    description: Option<String>,
    dump: Capability,
}

impl ArchiveBuilder {
    pub fn new(plan: &JobPlan) -> Self {
        Self {
            backup_dir: plan.backup_dir.clone(),
            naming: plan.naming.clone(),
            databases: plan.databases.clone(),
            directories: plan.directories.clone(),
            description: plan.description.clone(),
            dump: Capability::new("mysqldump", &plan.tools.mysqldump, plan.timeouts.dump()),
        }
    }

    /// Target path for an archive started at `timestamp`
    pub fn target_path(&self, timestamp: i64) -> PathBuf {
        self.backup_dir.join(self.naming.file_name(timestamp))
    }

    /// Build the archive. `timestamp` is the build start time recorded in METADATA.
    pub async fn build(&self, ctx: &RunContext, timestamp: i64) -> Result<BuiltArchive> {
        let target = self.target_path(timestamp);
        info!(job = %ctx.job, archive = %target.display(), "Starting archive build");

        // Fail fast before spending time on dumps
        for dir in &self.directories {
            check_source(dir)?;
        }

        let mut dumps = Vec::with_capacity(self.databases.len());
        for db in &self.databases {
            dumps.push(self.dump_database(db).await?);
        }

        let mut metadata = Metadata::new(timestamp);
        metadata.description = Some(
            self.description
                .clone()
                .unwrap_or_else(|| default_description(&ctx.job)),
        );

        let backup_dir = self.backup_dir.clone();
        let directories = self.directories.clone();
        let built = tokio::task::spawn_blocking(move || {
            write_archive(&backup_dir, &target, dumps, &directories, metadata)
        })
        .await
        .map_err(io::Error::other)??;

        info!(
            job = %ctx.job,
            archive = %built.path.display(),
            entries = built.entries,
            payload_bytes = built.metadata.len.unwrap_or(0),
            size_bytes = built.size_bytes,
            "Archive complete"
        );
        Ok(built)
    }

    async fn dump_database(&self, db: &DatabaseSource) -> Result<SpooledDump> {
        debug!(database = %db.database, "Dumping database");

        let spool = tempfile::tempfile_in(&self.backup_dir)?;
        let mut cmd = self.dump.command();
        cmd.arg(&db.database)
            .arg(format!("--user={}", db.user))
            .arg(format!("--password={}", db.password.expose()))
            .stdout(Stdio::from(spool.try_clone()?));

        self.dump
            .run(cmd)
            .await
            .map_err(|source| BackupError::DumpFailed {
                database: db.database.clone(),
                source,
            })?;

        let len = spool.metadata()?.len();
        info!(database = %db.database, bytes = len, "Database dumped");

        Ok(SpooledDump {
            entry_name: format!("{}.sql", db.database),
            file: spool,
            len,
        })
    }
}

/// Remove staging files left behind by runs that died mid-build. Only safe
/// while the job lock is held. Returns the removed paths.
pub fn sweep_staging(backup_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for entry in std::fs::read_dir(backup_dir)? {
        let entry = entry?;
        let is_staging = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(STAGING_PREFIX));
        if !is_staging || !entry.file_type()?.is_file() {
            continue;
        }

        let path = entry.path();
        warn!(staging = %path.display(), "Removing leftover staging file from an interrupted run");
        if crate::retention::remove_if_present(&path)? {
            removed.push(path);
        }
    }
    removed.sort();
    Ok(removed)
}

fn default_description(job: &str) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{job} on {host}")
}

/// A source directory must exist, be a directory, and be listable
fn check_source(dir: &Path) -> Result<()> {
    let unavailable = |source: io::Error| BackupError::SourceUnavailable {
        path: dir.to_path_buf(),
        source,
    };

    let meta = std::fs::metadata(dir).map_err(unavailable)?;
    if !meta.is_dir() {
        return Err(unavailable(io::Error::other("not a directory")));
    }
    std::fs::read_dir(dir).map_err(unavailable)?;
    Ok(())
}

/// Write all entries to a staging file and rename it onto `target`
fn write_archive(
    backup_dir: &Path,
    target: &Path,
    dumps: Vec<SpooledDump>,
    directories: &[PathBuf],
    mut metadata: Metadata,
) -> Result<BuiltArchive> {
    let mut staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(backup_dir)?;

    let mut digest = PayloadDigest::default();
    let mut entries = 0usize;
    let mtime = u64::try_from(metadata.timestamp).unwrap_or(0);

    {
        let encoder = zstd::stream::write::Encoder::new(staging.as_file_mut(), COMPRESSION_LEVEL)?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        for mut dump in dumps {
            dump.file.seek(SeekFrom::Start(0))?;
            let mut header = regular_header(dump.len, 0o600, mtime);
            let reader = DigestReader::new(&mut dump.file, dump.len, &mut digest);
            builder.append_data(&mut header, &dump.entry_name, reader)?;
            entries += 1;
        }

        for dir in directories {
            entries += append_tree(&mut builder, dir, &mut digest)?;
        }

        metadata.sha256 = Some(hex_digest(&digest.hasher));
        metadata.len = Some(digest.len);
        let record = serde_json::to_vec(&metadata)?;
        let mut header = regular_header(record.len() as u64, 0o644, mtime);
        builder.append_data(&mut header, METADATA_ENTRY, record.as_slice())?;
        entries += 1;

        builder.into_inner()?.finish()?;
    }

    staging.as_file().sync_all()?;
    staging.persist(target).map_err(|e| e.error)?;
    let size_bytes = std::fs::metadata(target)?.len();

    Ok(BuiltArchive {
        path: target.to_path_buf(),
        metadata,
        entries,
        size_bytes,
    })
}

/// Append one source directory recursively. Returns the number of entries.
fn append_tree<W: io::Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    digest: &mut PayloadDigest,
) -> Result<usize> {
    let unavailable = |path: &Path, source: io::Error| BackupError::SourceUnavailable {
        path: path.to_path_buf(),
        source,
    };

    debug!(directory = %root.display(), "Adding directory");
    let tree = walk_tree(root).map_err(|e| unavailable(root, e))?;

    for entry in &tree {
        match entry.kind {
            EntryKind::File => {
                let file = File::open(&entry.path).map_err(|e| unavailable(&entry.path, e))?;
                let meta = file.metadata().map_err(|e| unavailable(&entry.path, e))?;
                let mut header = Header::new_gnu();
                header.set_metadata(&meta);
                // Size as walked; later growth is cut off, shrinking is an error
                header.set_size(entry.size);
                let reader = DigestReader::new(file, entry.size, &mut *digest);
                builder
                    .append_data(&mut header, &entry.archive_path, reader)
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::UnexpectedEof => unavailable(&entry.path, e),
                        _ => BackupError::Io(e),
                    })?;
            }
            EntryKind::Directory | EntryKind::Symlink => {
                builder.append_path_with_name(&entry.path, &entry.archive_path)?;
            }
        }
    }

    Ok(tree.len())
}

fn regular_header(size: u64, mode: u32, mtime: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(mtime);
    header
}

fn hex_digest(hasher: &Sha256) -> String {
    hasher
        .clone()
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::read_archive_metadata;
    use crate::config::Config;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    /// Read every regular entry of an archive into memory
    pub(crate) fn read_entries(path: &Path) -> BTreeMap<String, Vec<u8>> {
        let file = File::open(path).unwrap();
        let mut archive = tar::Archive::new(zstd::stream::read::Decoder::new(file).unwrap());
        let mut entries = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            entries.insert(name, data);
        }
        entries
    }

    fn plan(root: &Path, extra: serde_json::Value) -> JobPlan {
        let mut json = serde_json::json!({
            "name": "shop",
            "backup_root": root,
        });
        json.as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        let config: Config = serde_json::from_value(json).unwrap();
        let plan = config.validate().unwrap();
        std::fs::create_dir_all(&plan.backup_dir).unwrap();
        plan
    }

    fn fake_dump(dir: &Path, body: &str) -> Vec<String> {
        let script = dir.join("fake-mysqldump.sh");
        std::fs::write(&script, body).unwrap();
        vec!["/bin/sh".to_string(), script.to_string_lossy().to_string()]
    }

    fn staging_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(STAGING_PREFIX)
            })
            .count()
    }

    #[tokio::test]
    async fn test_round_trip_single_database() {
        let root = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        let dump = fake_dump(tools.path(), "echo \"CREATE DATABASE $1;\"\n");
        let plan = plan(
            root.path(),
            serde_json::json!({
                "databases": [["shop", "root", "pw"]],
                "tools": {"mysqldump": dump},
            }),
        );

        let builder = ArchiveBuilder::new(&plan);
        let ctx = RunContext::new("shop", 1_700_000_000);
        let built = builder.build(&ctx, 1_700_000_000).await.unwrap();

        assert_eq!(built.path, plan.backup_dir.join("job-shop-1700000000.tar.zst"));
        assert_eq!(built.entries, 2);

        let entries = read_entries(&built.path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["shop.sql"], b"CREATE DATABASE shop;\n");

        let metadata: Metadata = serde_json::from_slice(&entries["METADATA"]).unwrap();
        assert_eq!(metadata.timestamp, 1_700_000_000);
        assert_eq!(metadata.len, Some(22));
        assert_eq!(metadata.sha256.as_deref().map(str::len), Some(64));
        assert!(metadata.description.is_some());

        assert_eq!(read_archive_metadata(&built.path).unwrap(), metadata);
        assert_eq!(staging_files(&plan.backup_dir), 0);
    }

    #[tokio::test]
    async fn test_dump_credentials_passed_as_flags() {
        let root = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        let dump = fake_dump(tools.path(), "echo \"$@\"\n");
        let plan = plan(
            root.path(),
            serde_json::json!({
                "databases": [["blog", "editor", "s3cret"]],
                "tools": {"mysqldump": dump},
            }),
        );

        let built = ArchiveBuilder::new(&plan)
            .build(&RunContext::new("shop", 10), 10)
            .await
            .unwrap();
        let entries = read_entries(&built.path);
        assert_eq!(entries["blog.sql"], b"blog --user=editor --password=s3cret\n");
    }

    #[tokio::test]
    async fn test_directories_embedded_under_original_paths() {
        let root = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        std::fs::create_dir(source.path().join("conf")).unwrap();
        std::fs::write(source.path().join("index.html"), b"<html/>").unwrap();
        std::fs::write(source.path().join("conf/site.conf"), b"listen 80;").unwrap();

        let plan = plan(
            root.path(),
            serde_json::json!({"directories": [source.path()]}),
        );
        let built = ArchiveBuilder::new(&plan)
            .build(&RunContext::new("shop", 20), 20)
            .await
            .unwrap();

        let prefix = crate::fs::walker::archive_root(source.path());
        let entries = read_entries(&built.path);
        let file = |rel: &str| prefix.join(rel).to_string_lossy().to_string();
        assert_eq!(entries[&file("index.html")], b"<html/>");
        assert_eq!(entries[&file("conf/site.conf")], b"listen 80;");
        assert_eq!(built.metadata.len, Some(17));
        assert_eq!(built.metadata.timestamp, 20);
    }

    #[tokio::test]
    async fn test_fixed_name_replaces_previous_archive() {
        let root = TempDir::new().unwrap();
        let plan = plan(
            root.path(),
            serde_json::json!({"include_timestamp_in_filename": false, "max_local_copies": 1}),
        );
        let builder = ArchiveBuilder::new(&plan);

        let first = builder.build(&RunContext::new("shop", 1), 1).await.unwrap();
        let second = builder.build(&RunContext::new("shop", 2), 2).await.unwrap();

        assert_eq!(first.path, second.path);
        assert_eq!(read_archive_metadata(&second.path).unwrap().timestamp, 2);
    }

    #[tokio::test]
    async fn test_dump_failure_leaves_no_archive() {
        let root = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        let dump = fake_dump(tools.path(), "echo partial; echo 'Access denied' >&2; exit 2\n");
        let plan = plan(
            root.path(),
            serde_json::json!({
                "databases": [["shop", "root", "wrong"]],
                "tools": {"mysqldump": dump},
            }),
        );
        let previous = plan.backup_dir.join("job-shop-5.tar.zst");
        std::fs::write(&previous, b"older generation").unwrap();

        let err = ArchiveBuilder::new(&plan)
            .build(&RunContext::new("shop", 100), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::DumpFailed { ref database, .. } if database == "shop"));

        assert!(!plan.backup_dir.join("job-shop-100.tar.zst").exists());
        assert_eq!(std::fs::read(&previous).unwrap(), b"older generation");
        assert_eq!(staging_files(&plan.backup_dir), 0);
    }

    #[tokio::test]
    async fn test_dump_timeout_is_dump_failure() {
        let root = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        let dump = fake_dump(tools.path(), "sleep 5\n");
        let mut plan = plan(
            root.path(),
            serde_json::json!({
                "databases": [["shop", "root", "pw"]],
                "tools": {"mysqldump": dump},
            }),
        );
        plan.timeouts.dump_secs = 1;

        let err = ArchiveBuilder::new(&plan)
            .build(&RunContext::new("shop", 100), 100)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BackupError::DumpFailed {
                source: crate::utils::errors::CapabilityError::Timeout { .. },
                ..
            }
        ));
        assert!(!plan.backup_dir.join("job-shop-100.tar.zst").exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_source_unavailable() {
        let root = TempDir::new().unwrap();
        let plan = plan(
            root.path(),
            serde_json::json!({"directories": ["/nonexistent/serverbackup/source"]}),
        );

        let err = ArchiveBuilder::new(&plan)
            .build(&RunContext::new("shop", 100), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::SourceUnavailable { .. }));
        assert_eq!(std::fs::read_dir(&plan.backup_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_digest_reader_stops_at_recorded_size() {
        let mut digest = PayloadDigest::default();
        let mut out = Vec::new();
        DigestReader::new(&b"hello, world"[..], 5, &mut digest)
            .read_to_end(&mut out)
            .unwrap();

        assert_eq!(out, b"hello");
        assert_eq!(digest.len, 5);
        assert_eq!(hex_digest(&digest.hasher), hex_digest(&Sha256::new_with_prefix(b"hello")));
    }

    #[test]
    fn test_shrunken_source_fails_the_entry() {
        let mut digest = PayloadDigest::default();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = regular_header(10, 0o644, 0);

        let err = builder
            .append_data(
                &mut header,
                "srv/www/index.html",
                DigestReader::new(&b"short"[..], 10, &mut digest),
            )
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_sweep_staging_removes_only_staging_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".staging-abc"), b"partial").unwrap();
        std::fs::write(dir.path().join("job-shop-1.tar.zst"), b"archive").unwrap();
        std::fs::write(dir.path().join(".serverbackup.lock"), b"1").unwrap();
        std::fs::create_dir(dir.path().join(".staging-dir")).unwrap();

        let removed = sweep_staging(dir.path()).unwrap();

        assert_eq!(removed, vec![dir.path().join(".staging-abc")]);
        assert!(dir.path().join("job-shop-1.tar.zst").exists());
        assert!(dir.path().join(".serverbackup.lock").exists());
        assert!(dir.path().join(".staging-dir").exists());
    }
}
