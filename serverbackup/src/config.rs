//! Configuration management for the backup runner.
//!
//! Loads the job description from a JSON (or TOML) file with environment
//! variable overrides, then validates it into a [`JobPlan`] before anything
//! touches the filesystem.

use crate::archive::ArchiveNaming;
use crate::retention::RetentionPolicy;
use crate::utils::errors::{BackupError, Result};
use config::{Environment, File, FileFormat};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the job configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/serverbackup.conf";

/// Prefix for environment overrides, e.g. `SERVERBACKUP_BACKUP_ROOT`.
const ENV_PREFIX: &str = "SERVERBACKUP";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Job name, used for the backup directory and archive file names
    pub name: String,

    /// Databases to dump
    #[serde(default)]
    pub databases: Vec<DatabaseSource>,

    /// Absolute directory paths to embed recursively
    #[serde(default)]
    pub directories: Vec<PathBuf>,

    /// s3cmd configuration file
    #[serde(default)]
    pub s3config: Option<PathBuf>,

    /// Destination bucket
    #[serde(default)]
    pub s3bucket: Option<String>,

    /// Deprecated age-based retention; wins over `max_local_copies`
    #[serde(default)]
    pub retention_days: Option<u32>,

    /// Count-based retention
    #[serde(default)]
    pub max_local_copies: Option<u32>,

    #[serde(default)]
    pub encryption_password: Option<Secret>,

    #[serde(default)]
    pub keep_encrypted_backup_after_upload: bool,

    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,

    #[serde(default = "default_include_timestamp")]
    pub include_timestamp_in_filename: bool,

    /// Free-form description stored in each archive's METADATA
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// One database to dump. Accepts either a `[database, user, password]`
/// triple or a table with those keys.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "DatabaseEntry")]
pub struct DatabaseSource {
    pub database: String,
    pub user: String,
    pub password: Secret,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DatabaseEntry {
    Triple(String, String, String),
    Table {
        database: String,
        user: String,
        password: String,
    },
}

impl From<DatabaseEntry> for DatabaseSource {
    fn from(entry: DatabaseEntry) -> Self {
        let (database, user, password) = match entry {
            DatabaseEntry::Triple(database, user, password) => (database, user, password),
            DatabaseEntry::Table {
                database,
                user,
                password,
            } => (database, user, password),
        };
        DatabaseSource {
            database,
            user,
            password: Secret(password),
        }
    }
}

/// A credential that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Command prefixes for the external tools. Each entry is an argv prefix,
/// so wrappers like `["docker", "exec", "db", "mysqldump"]` work too.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_mysqldump")]
    pub mysqldump: Vec<String>,

    #[serde(default = "default_gpg")]
    pub gpg: Vec<String>,

    #[serde(default = "default_s3cmd")]
    pub s3cmd: Vec<String>,
}

/// Upper bounds for external tool invocations, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_dump_secs")]
    pub dump_secs: u64,

    #[serde(default = "default_encrypt_secs")]
    pub encrypt_secs: u64,

    #[serde(default = "default_upload_secs")]
    pub upload_secs: u64,
}

// Default values
fn default_backup_root() -> PathBuf {
    PathBuf::from("/var/backups")
}

fn default_include_timestamp() -> bool {
    true
}

fn default_mysqldump() -> Vec<String> {
    vec!["mysqldump".to_string()]
}

fn default_gpg() -> Vec<String> {
    vec!["gpg".to_string()]
}

fn default_s3cmd() -> Vec<String> {
    vec!["s3cmd".to_string()]
}

fn default_dump_secs() -> u64 {
    60 * 60
}

fn default_encrypt_secs() -> u64 {
    60 * 60
}

fn default_upload_secs() -> u64 {
    2 * 60 * 60
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mysqldump: default_mysqldump(),
            gpg: default_gpg(),
            s3cmd: default_s3cmd(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dump_secs: default_dump_secs(),
            encrypt_secs: default_encrypt_secs(),
            upload_secs: default_upload_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn dump(&self) -> Duration {
        Duration::from_secs(self.dump_secs)
    }

    pub fn encrypt(&self) -> Duration {
        Duration::from_secs(self.encrypt_secs)
    }

    pub fn upload(&self) -> Duration {
        Duration::from_secs(self.upload_secs)
    }
}

/// Remote destination for finished archives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub s3config: PathBuf,
    pub bucket: String,
}

impl UploadTarget {
    pub fn destination(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

/// Encryption applied before upload.
#[derive(Debug, Clone)]
pub struct EncryptionSettings {
    pub passphrase: Secret,
    pub keep_after_upload: bool,
}

/// A validated job: everything a run needs, with no unchecked combinations left.
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub name: String,
    pub backup_dir: PathBuf,
    pub naming: ArchiveNaming,
    pub retention: Option<RetentionPolicy>,
    pub databases: Vec<DatabaseSource>,
    pub directories: Vec<PathBuf>,
    pub description: Option<String>,
    pub upload: Option<UploadTarget>,
    pub encryption: Option<EncryptionSettings>,
    pub tools: ToolsConfig,
    pub timeouts: TimeoutConfig,
}

/// Overrides are kept as strings; numeric and boolean fields are converted
/// when deserialised, so `SERVERBACKUP_NAME=007` stays `"007"`.
fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
}

impl Config {
    /// Load configuration from a file. `.toml` files are parsed as TOML,
    /// everything else as JSON.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::load(path, environment())
    }

    fn load(path: &Path, env: Environment) -> Result<Self> {
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => FileFormat::Toml,
            _ => FileFormat::Json,
        };

        let settings = config::Config::builder()
            .add_source(File::from(path).format(format))
            .add_source(env)
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Check every field and derive the job plan. Performs no I/O.
    pub fn validate(self) -> Result<JobPlan> {
        if self.name.trim().is_empty() {
            return Err(BackupError::Config("name must not be empty".into()));
        }
        if self.name.contains('/') || self.name == "." || self.name == ".." {
            return Err(BackupError::Config(format!(
                "name {:?} cannot be used as a directory name",
                self.name
            )));
        }

        if self.retention_days == Some(0) {
            return Err(BackupError::Config(
                "retention_days must be greater than 0".into(),
            ));
        }
        if self.max_local_copies == Some(0) {
            return Err(BackupError::Config(
                "max_local_copies must be greater than 0".into(),
            ));
        }

        let retention = RetentionPolicy::from_settings(self.retention_days, self.max_local_copies);
        if let Some(RetentionPolicy::CountBased { max_local_copies }) = retention {
            if !self.include_timestamp_in_filename && max_local_copies != 1 {
                return Err(BackupError::Config(format!(
                    "max_local_copies = {} requires include_timestamp_in_filename; \
                     without timestamps only one archive can exist",
                    max_local_copies
                )));
            }
        }
        if self.retention_days.is_some() && self.max_local_copies.is_some() {
            tracing::warn!(
                "Both retention_days and max_local_copies are set; using deprecated retention_days"
            );
        }

        if let Some(dir) = self.directories.iter().find(|d| !d.is_absolute()) {
            return Err(BackupError::Config(format!(
                "directory {} must be an absolute path",
                dir.display()
            )));
        }

        if let Some(db) = self.databases.iter().find(|db| db.database.trim().is_empty()) {
            return Err(BackupError::Config(format!(
                "database entry for user {:?} has an empty name",
                db.user
            )));
        }

        for (tool, argv) in [
            ("mysqldump", &self.tools.mysqldump),
            ("gpg", &self.tools.gpg),
            ("s3cmd", &self.tools.s3cmd),
        ] {
            if argv.is_empty() {
                return Err(BackupError::Config(format!("tools.{tool} must not be empty")));
            }
        }

        let upload = match (self.s3config, self.s3bucket) {
            (Some(s3config), Some(bucket)) => Some(UploadTarget { s3config, bucket }),
            (None, None) => None,
            (s3config, bucket) => {
                tracing::warn!(
                    has_s3config = s3config.is_some(),
                    has_s3bucket = bucket.is_some(),
                    "Upload needs both s3config and s3bucket; skipping upload"
                );
                None
            }
        };

        let encryption = match (self.encryption_password, &upload) {
            (Some(passphrase), Some(_)) => Some(EncryptionSettings {
                passphrase,
                keep_after_upload: self.keep_encrypted_backup_after_upload,
            }),
            (Some(_), None) => {
                tracing::info!("encryption_password set without an upload target; not encrypting");
                None
            }
            (None, _) => None,
        };

        Ok(JobPlan {
            backup_dir: self.backup_root.join(&self.name),
            naming: ArchiveNaming::new(&self.name, self.include_timestamp_in_filename),
            name: self.name,
            retention,
            databases: self.databases,
            directories: self.directories,
            description: self.description,
            upload,
            encryption,
            tools: self.tools,
            timeouts: self.timeouts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(r#"{"name": "web"}"#);
        assert!(config.databases.is_empty());
        assert!(config.directories.is_empty());
        assert_eq!(config.backup_root, PathBuf::from("/var/backups"));
        assert!(config.include_timestamp_in_filename);
        assert!(!config.keep_encrypted_backup_after_upload);
        assert_eq!(config.tools.mysqldump, vec!["mysqldump"]);
        assert_eq!(config.timeouts.upload(), Duration::from_secs(7200));

        let plan = config.validate().unwrap();
        assert_eq!(plan.backup_dir, PathBuf::from("/var/backups/web"));
        assert!(plan.retention.is_none());
        assert!(plan.upload.is_none());
    }

    #[test]
    fn test_database_triples_and_tables() {
        let config = parse(
            r#"{"name": "web", "databases": [
                ["shop", "root", "hunter2"],
                {"database": "blog", "user": "blog", "password": "pw"}
            ]}"#,
        );
        assert_eq!(config.databases.len(), 2);
        assert_eq!(config.databases[0].database, "shop");
        assert_eq!(config.databases[0].password.expose(), "hunter2");
        assert_eq!(config.databases[1].user, "blog");
    }

    #[test]
    fn test_secret_is_redacted() {
        let config = parse(r#"{"name": "web", "encryption_password": "topsecret"}"#);
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("topsecret"));
    }

    #[test]
    fn test_retention_days_takes_precedence() {
        let plan = parse(r#"{"name": "web", "retention_days": 7, "max_local_copies": 3}"#)
            .validate()
            .unwrap();
        assert_eq!(
            plan.retention,
            Some(RetentionPolicy::AgeBased { retention_days: 7 })
        );
    }

    #[test]
    fn test_zero_thresholds_rejected() {
        let err = parse(r#"{"name": "web", "retention_days": 0}"#).validate().unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
        let err = parse(r#"{"name": "web", "max_local_copies": 0}"#).validate().unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn test_fixed_filename_requires_single_copy() {
        let err = parse(
            r#"{"name": "web", "include_timestamp_in_filename": false, "max_local_copies": 2}"#,
        )
        .validate()
        .unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));

        let plan = parse(
            r#"{"name": "web", "include_timestamp_in_filename": false, "max_local_copies": 1}"#,
        )
        .validate()
        .unwrap();
        assert_eq!(
            plan.retention,
            Some(RetentionPolicy::CountBased { max_local_copies: 1 })
        );

        // Age policy wins, so the copy limit is never consulted
        parse(
            r#"{"name": "web", "include_timestamp_in_filename": false,
                "retention_days": 3, "max_local_copies": 2}"#,
        )
        .validate()
        .unwrap();
    }

    #[test]
    fn test_invalid_fixed_filename_rejected_before_io() {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            backup_root: root.path().to_path_buf(),
            ..parse(r#"{"name": "web", "include_timestamp_in_filename": false, "max_local_copies": 2}"#)
        };
        assert!(config.validate().is_err());
        assert!(!root.path().join("web").exists());
    }

    #[test]
    fn test_relative_directory_rejected() {
        let err = parse(r#"{"name": "web", "directories": ["srv/www"]}"#)
            .validate()
            .unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn test_bad_names_rejected() {
        assert!(parse(r#"{"name": ""}"#).validate().is_err());
        assert!(parse(r#"{"name": "a/b"}"#).validate().is_err());
        assert!(parse(r#"{"name": ".."}"#).validate().is_err());
    }

    #[test]
    fn test_upload_and_encryption_settings() {
        let plan = parse(
            r#"{"name": "web", "s3config": "/etc/s3cfg", "s3bucket": "backups",
                "encryption_password": "pw", "keep_encrypted_backup_after_upload": true}"#,
        )
        .validate()
        .unwrap();
        let upload = plan.upload.unwrap();
        assert_eq!(upload.destination(), "s3://backups");
        let encryption = plan.encryption.unwrap();
        assert!(encryption.keep_after_upload);
        assert_eq!(encryption.passphrase.expose(), "pw");
    }

    #[test]
    fn test_encryption_requires_upload_target() {
        let plan = parse(r#"{"name": "web", "encryption_password": "pw", "s3bucket": "b"}"#)
            .validate()
            .unwrap();
        assert!(plan.upload.is_none());
        assert!(plan.encryption.is_none());
    }

    #[test]
    fn test_empty_tool_command_rejected() {
        let err = parse(r#"{"name": "web", "tools": {"gpg": []}}"#)
            .validate()
            .unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = NamedTempFile::with_suffix(".conf").unwrap();
        write!(
            file,
            r#"{{"name": "db1", "databases": [["shop", "root", "pw"]], "max_local_copies": 4}}"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.name, "db1");
        assert_eq!(config.max_local_copies, Some(4));
        assert_eq!(config.databases[0].database, "shop");
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(
            file,
            "name = \"files\"\ndirectories = [\"/srv/www\"]\n\n[timeouts]\nupload_secs = 60\n"
        )
        .unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.directories, vec![PathBuf::from("/srv/www")]);
        assert_eq!(config.timeouts.upload_secs, 60);
        assert_eq!(config.timeouts.dump_secs, 3600);
    }

    #[test]
    fn test_env_overrides_keep_strings_verbatim() {
        let mut file = NamedTempFile::with_suffix(".conf").unwrap();
        write!(file, r#"{{"name": "db1", "s3config": "/etc/s3cfg"}}"#).unwrap();
        file.flush().unwrap();

        let overrides: config::Map<String, String> = [
            ("SERVERBACKUP_NAME", "007"),
            ("SERVERBACKUP_S3BUCKET", "2024"),
            ("SERVERBACKUP_MAX_LOCAL_COPIES", "4"),
            ("SERVERBACKUP_INCLUDE_TIMESTAMP_IN_FILENAME", "true"),
            ("SERVERBACKUP_TIMEOUTS__UPLOAD_SECS", "90"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = Config::load(file.path(), environment().source(Some(overrides))).unwrap();
        assert_eq!(config.name, "007");
        assert_eq!(config.s3bucket.as_deref(), Some("2024"));
        assert_eq!(config.max_local_copies, Some(4));
        assert!(config.include_timestamp_in_filename);
        assert_eq!(config.timeouts.upload_secs, 90);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::from_file(Path::new("/nonexistent/serverbackup.conf")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
