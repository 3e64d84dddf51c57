//! # Repository
//!
//! A node repository is a directory holding a single JSON file, `config`.
//! Its presence is the initialization marker: [`initialize`] creates it
//! exactly once and every later call returns what is already on disk.
//!
//! Writes go to a temporary file in the same directory which is then renamed
//! over the target, so a crash never leaves a truncated config behind. On
//! unix the config is readable by its owner only (it holds the private key).

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::{CONFIG_FILENAME, RepositoryConfig};
use crate::error::{ConfigError, InitError, RepoError};
use crate::identity::{KeyProtector, Unprotected};

/// Name of the file created and removed by [`check_writable`].
const PROBE_FILENAME: &str = ".nodeboot-write-probe";

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILENAME)
}

/// True iff `<root>/config` exists.
pub fn is_initialized(root: &Path) -> bool {
    config_path(root).is_file()
}

/// Verify that `root` can be written, creating it if needed.
pub fn check_writable(root: &Path) -> Result<(), RepoError> {
    if root.exists() {
        let probe = root.join(PROBE_FILENAME);
        return match fs::File::create(&probe) {
            Ok(file) => {
                drop(file);
                fs::remove_file(&probe).map_err(|source| classify(root, source))
            }
            Err(source) => Err(classify(root, source)),
        };
    }

    create_dir(root).map_err(|source| RepoError::PermissionDenied {
        path: root.to_path_buf(),
        source,
    })
}

fn classify(root: &Path, source: io::Error) -> RepoError {
    let path = root.to_path_buf();
    if source.kind() == io::ErrorKind::PermissionDenied {
        RepoError::PermissionDenied { path, source }
    } else {
        RepoError::Unexpected { path, source }
    }
}

#[cfg(unix)]
fn create_dir(root: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o775).create(root)
}

#[cfg(not(unix))]
fn create_dir(root: &Path) -> io::Result<()> {
    fs::create_dir_all(root)
}

/// Initialize `root` with an unprotected identity.
pub fn initialize(root: &Path) -> Result<RepositoryConfig, InitError> {
    initialize_with(root, &Unprotected)
}

/// Initialize `root` if needed, sealing a new private key with `protector`.
///
/// An existing repository is loaded and returned untouched.
pub fn initialize_with(root: &Path, protector: &dyn KeyProtector) -> Result<RepositoryConfig, InitError> {
    if is_initialized(root) {
        debug!(path = %root.display(), "repository already initialized");
        return Ok(load(root)?);
    }

    info!(path = %root.display(), "initializing node at {}", root.display());
    let config = RepositoryConfig::generate(protector)?;
    check_writable(root)?;
    write_config(root, &config)?;
    Ok(config)
}

pub fn load(root: &Path) -> Result<RepositoryConfig, ConfigError> {
    let path = config_path(root);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ConfigError::Missing { path }),
        Err(source) => return Err(ConfigError::Read { path, source }),
    };
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Malformed { path, source })
}

/// Overwrite the config of an initialized repository.
pub fn save(root: &Path, config: &RepositoryConfig) -> Result<(), InitError> {
    if !is_initialized(root) {
        return Err(ConfigError::Missing { path: config_path(root) }.into());
    }
    write_config(root, config)
}

fn write_config(root: &Path, config: &RepositoryConfig) -> Result<(), InitError> {
    let path = config_path(root);
    let mut json = serde_json::to_vec_pretty(config).map_err(|source| InitError::Serialize {
        path: path.clone(),
        source,
    })?;
    json.push(b'\n');

    let tmp = root.join(format!(".{CONFIG_FILENAME}.tmp"));
    let result = write_private(&tmp, &json).and_then(|()| fs::rename(&tmp, &path));
    if let Err(source) = result {
        let _ = fs::remove_file(&tmp);
        return Err(InitError::Write { path, source });
    }
    debug!(path = %path.display(), "config written");
    Ok(())
}

fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_directory_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_initialized(dir.path()));
        assert!(matches!(load(dir.path()), Err(ConfigError::Missing { .. })));
    }

    #[test]
    fn initialize_creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("repo");

        let config = initialize(&root).unwrap();

        assert!(is_initialized(&root));
        assert_eq!(load(&root).unwrap(), config);
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();

        let first = initialize(dir.path()).unwrap();
        let bytes_before = fs::read(config_path(dir.path())).unwrap();
        let modified_before = fs::metadata(config_path(dir.path())).unwrap().modified().unwrap();

        let second = initialize(dir.path()).unwrap();
        let bytes_after = fs::read(config_path(dir.path())).unwrap();
        let modified_after = fs::metadata(config_path(dir.path())).unwrap().modified().unwrap();

        assert_eq!(first.identity.peer_id, second.identity.peer_id);
        assert_eq!(bytes_before, bytes_after);
        assert_eq!(modified_before, modified_after);
    }

    #[test]
    fn initialize_leaves_no_stray_files() {
        let dir = tempfile::tempdir().unwrap();
        initialize(dir.path()).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![CONFIG_FILENAME.to_string()]);
    }

    #[test]
    fn malformed_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(config_path(dir.path()), b"{ not json").unwrap();

        assert!(matches!(load(dir.path()), Err(ConfigError::Malformed { .. })));
        assert!(matches!(
            initialize(dir.path()),
            Err(InitError::Config(ConfigError::Malformed { .. }))
        ));
    }

    #[test]
    fn save_requires_initialized_repo() {
        let dir = tempfile::tempdir().unwrap();
        let config = RepositoryConfig::generate(&Unprotected).unwrap();

        assert!(save(dir.path(), &config).is_err());
        assert!(!is_initialized(dir.path()));
    }

    #[test]
    fn save_persists_modifications() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = initialize(dir.path()).unwrap();
        config.swarm.conn_mgr.low_water = 3;

        save(dir.path(), &config).unwrap();

        assert_eq!(load(dir.path()).unwrap().swarm.conn_mgr.low_water, 3);
    }

    #[test]
    fn check_writable_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        check_writable(dir.path()).unwrap();
        check_writable(dir.path()).unwrap();

        assert!(!dir.path().join(PROBE_FILENAME).exists());
    }

    #[test]
    fn check_writable_keeps_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("test"), b"user data").unwrap();

        check_writable(dir.path()).unwrap();

        assert_eq!(fs::read(dir.path().join("test")).unwrap(), b"user data");
    }

    #[test]
    fn root_that_is_a_file_is_unexpected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("not-a-dir");
        fs::write(&root, b"").unwrap();

        let result = check_writable(&root);
        assert!(matches!(result, Err(RepoError::Unexpected { .. })), "unexpected {result:?}");

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["not-a-dir".to_string()]);
        assert!(initialize(&root).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn config_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        initialize(dir.path()).unwrap();

        let mode = fs::metadata(config_path(dir.path())).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn read_only_root_is_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("locked");
        fs::create_dir(&root).unwrap();
        fs::set_permissions(&root, fs::Permissions::from_mode(0o555)).unwrap();

        // Privileged users ignore directory permissions.
        if fs::File::create(root.join("privilege-check")).is_ok() {
            fs::set_permissions(&root, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let result = check_writable(&root);
        assert!(matches!(result, Err(RepoError::PermissionDenied { .. })));
        assert!(!root.join(PROBE_FILENAME).exists());

        assert!(initialize(&root).is_err());
        assert!(!is_initialized(&root));

        fs::set_permissions(&root, fs::Permissions::from_mode(0o755)).unwrap();
    }
}
