//! Signing key discovery.
//!
//! The secret used by [`crate::auth::build_authorization_header`] is never
//! shipped with this crate. It is provisioned locally as a base64 text file
//! (32-byte seed or 64-byte secret key once decoded) or handed in directly.
//!
//! Resolution walks an ordered list of [`KeyCandidate`]s built by the pure
//! [`candidates`] function; only [`resolve_with`] touches the filesystem.
//!
//! # Precedence
//!
//! 1. Inline secret (raw bytes or base64 string)
//! 2. Explicit key file path
//! 3. Path from `VAONIS_AUTH_KEY_FILE`
//! 4. `.auth_key` in the current working directory
//! 5. `.auth_key` next to the installed executable
//! 6. `auth_key` in the user config directory (`<config>/vaonis-link/`)
//!
//! Every file candidate is normalized (`~`, `.`, `..`, symlinks) and must land
//! under one of the allowed roots: working directory, home directory, temp
//! directory or the install directory. A caller-named path outside them is
//! rejected with `PathNotAllowed`; a default location outside them is skipped.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Result, VaonisError};

/// Environment variable overriding the key file location.
pub const KEY_FILE_ENV: &str = "VAONIS_AUTH_KEY_FILE";

/// File name looked up in the working and install directories.
pub const DEFAULT_KEY_FILE_NAME: &str = ".auth_key";

/// Raw Ed25519 secret bytes. Zeroed on drop, never printed.
#[derive(Clone)]
pub struct KeyMaterial(Zeroizing<Vec<u8>>);

impl KeyMaterial {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    /// Decodes a base64 blob, ignoring surrounding whitespace.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|e| VaonisError::InvalidKeyMaterial(format!("not valid base64: {}", e)))?;
        Ok(Self::from_bytes(decoded))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial(<{} bytes redacted>)", self.0.len())
    }
}

/// A secret handed in by the caller instead of a file.
#[derive(Clone)]
pub enum SecretInput {
    Bytes(Vec<u8>),
    Base64(String),
}

impl SecretInput {
    fn decode(&self) -> Result<KeyMaterial> {
        match self {
            SecretInput::Bytes(bytes) => Ok(KeyMaterial::from_bytes(bytes.clone())),
            SecretInput::Base64(encoded) => KeyMaterial::from_base64(encoded),
        }
    }
}

impl fmt::Debug for SecretInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretInput::Bytes(_) => f.write_str("SecretInput::Bytes(<redacted>)"),
            SecretInput::Base64(_) => f.write_str("SecretInput::Base64(<redacted>)"),
        }
    }
}

/// Caller-controlled inputs to key resolution.
#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    pub secret: Option<SecretInput>,
    pub key_file: Option<PathBuf>,
}

/// Process facts the resolver depends on, captured once so the precedence
/// policy can be exercised without touching the real environment.
#[derive(Debug, Clone)]
pub struct ResolverEnv {
    pub cwd: PathBuf,
    pub home: Option<PathBuf>,
    pub temp_dir: PathBuf,
    pub install_dir: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub env_key_file: Option<String>,
}

impl ResolverEnv {
    pub fn capture() -> Result<Self> {
        let install_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));

        Ok(Self {
            cwd: std::env::current_dir()?,
            home: dirs::home_dir(),
            temp_dir: std::env::temp_dir(),
            install_dir,
            config_dir: dirs::config_dir().map(|d| d.join("vaonis-link")),
            env_key_file: std::env::var(KEY_FILE_ENV).ok().filter(|v| !v.trim().is_empty()),
        })
    }

    /// Roots a key file may live under, normalized the same way candidates are.
    pub fn allowed_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.cwd.clone()];
        roots.extend(self.home.clone());
        roots.push(self.temp_dir.clone());
        roots.extend(self.install_dir.clone());
        roots
            .iter()
            .map(|root| normalize_path(root, &self.cwd))
            .collect()
    }
}

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Inline,
    ExplicitFile,
    Environment,
    WorkingDirectory,
    InstallDirectory,
    UserConfig,
}

#[derive(Debug, Clone)]
pub enum KeyCandidate<'a> {
    Inline(&'a SecretInput),
    File {
        source: KeySource,
        path: PathBuf,
        /// A missing required file ends the search instead of falling through.
        required: bool,
    },
}

impl KeyCandidate<'_> {
    pub fn source(&self) -> KeySource {
        match self {
            KeyCandidate::Inline(_) => KeySource::Inline,
            KeyCandidate::File { source, .. } => *source,
        }
    }
}

/// Builds the ordered candidate list. Pure: no filesystem access.
pub fn candidates<'a>(options: &'a KeyOptions, env: &ResolverEnv) -> Vec<KeyCandidate<'a>> {
    let mut list = Vec::new();

    if let Some(secret) = &options.secret {
        list.push(KeyCandidate::Inline(secret));
    }
    if let Some(path) = &options.key_file {
        list.push(KeyCandidate::File {
            source: KeySource::ExplicitFile,
            path: path.clone(),
            required: true,
        });
    }
    if let Some(path) = &env.env_key_file {
        list.push(KeyCandidate::File {
            source: KeySource::Environment,
            path: PathBuf::from(path),
            required: true,
        });
    }

    list.push(KeyCandidate::File {
        source: KeySource::WorkingDirectory,
        path: env.cwd.join(DEFAULT_KEY_FILE_NAME),
        required: false,
    });
    if let Some(dir) = &env.install_dir {
        list.push(KeyCandidate::File {
            source: KeySource::InstallDirectory,
            path: dir.join(DEFAULT_KEY_FILE_NAME),
            required: false,
        });
    }
    if let Some(dir) = &env.config_dir {
        list.push(KeyCandidate::File {
            source: KeySource::UserConfig,
            path: dir.join("auth_key"),
            required: false,
        });
    }

    list
}

/// Resolves key material against the live process environment.
pub fn resolve(options: &KeyOptions) -> Result<KeyMaterial> {
    let env = ResolverEnv::capture()?;
    resolve_with(options, &env)
}

/// Walks the candidate list and returns the first usable secret.
pub fn resolve_with(options: &KeyOptions, env: &ResolverEnv) -> Result<KeyMaterial> {
    let roots = env.allowed_roots();
    let mut looked_at = Vec::new();

    for candidate in candidates(options, env) {
        let source = candidate.source();
        match candidate {
            KeyCandidate::Inline(secret) => {
                debug!(?source, "Using inline key material");
                return secret.decode();
            }
            KeyCandidate::File { path, required, .. } => {
                let normalized = match ensure_allowed(&path, &env.cwd, &roots) {
                    Ok(normalized) => normalized,
                    Err(err) if required => return Err(err),
                    Err(_) => {
                        debug!(
                            ?source,
                            path = %path.display(),
                            "Skipping default location outside allowed roots"
                        );
                        looked_at.push(format!("{} (not allowed)", path.display()));
                        continue;
                    }
                };
                if normalized.is_file() {
                    debug!(?source, path = %normalized.display(), "Reading key file");
                    let raw = Zeroizing::new(fs::read_to_string(&normalized)?);
                    return KeyMaterial::from_base64(&raw);
                }
                if required {
                    return Err(VaonisError::KeyMaterialNotFound(
                        normalized.display().to_string(),
                    ));
                }
                looked_at.push(normalized.display().to_string());
            }
        }
    }

    Err(VaonisError::KeyMaterialNotFound(format!(
        "looked in {}",
        looked_at.join(", ")
    )))
}

/// Normalizes `path` and checks it sits under one of `roots`.
pub fn ensure_allowed(path: &Path, cwd: &Path, roots: &[PathBuf]) -> Result<PathBuf> {
    let normalized = normalize_path(path, cwd);
    if roots.iter().any(|root| normalized.starts_with(root)) {
        Ok(normalized)
    } else {
        Err(VaonisError::PathNotAllowed { path: normalized })
    }
}

/// Expands `~`, anchors relative paths at `cwd`, folds `.`/`..` and follows
/// symlinks for the part of the path that exists.
pub fn normalize_path(path: &Path, cwd: &Path) -> PathBuf {
    let expanded = expand_home(path);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };
    resolve_existing_prefix(&lexical_normalize(&absolute))
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();

    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return missing
                .iter()
                .rev()
                .fold(canonical, |acc, part| acc.join(part));
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox_env(dir: &TempDir) -> ResolverEnv {
        ResolverEnv {
            cwd: dir.path().to_path_buf(),
            home: None,
            temp_dir: dir.path().to_path_buf(),
            install_dir: None,
            config_dir: None,
            env_key_file: None,
        }
    }

    fn write_key(path: &Path, bytes: &[u8]) {
        fs::write(path, format!("{}\n", BASE64.encode(bytes))).unwrap();
    }

    #[test]
    fn test_candidate_order() {
        let env = ResolverEnv {
            cwd: PathBuf::from("/work"),
            home: Some(PathBuf::from("/home/u")),
            temp_dir: PathBuf::from("/tmp"),
            install_dir: Some(PathBuf::from("/opt/vaonis/bin")),
            config_dir: Some(PathBuf::from("/home/u/.config/vaonis-link")),
            env_key_file: Some("/home/u/key.b64".to_string()),
        };
        let options = KeyOptions {
            secret: Some(SecretInput::Bytes(vec![1; 32])),
            key_file: Some(PathBuf::from("explicit.key")),
        };

        let sources: Vec<_> = candidates(&options, &env)
            .iter()
            .map(KeyCandidate::source)
            .collect();
        assert_eq!(
            sources,
            vec![
                KeySource::Inline,
                KeySource::ExplicitFile,
                KeySource::Environment,
                KeySource::WorkingDirectory,
                KeySource::InstallDirectory,
                KeySource::UserConfig,
            ]
        );
    }

    #[test]
    fn test_inline_base64_wins() {
        let dir = TempDir::new().unwrap();
        write_key(&dir.path().join(DEFAULT_KEY_FILE_NAME), &[9; 32]);
        let options = KeyOptions {
            secret: Some(SecretInput::Base64(BASE64.encode([7u8; 64]))),
            key_file: None,
        };

        let key = resolve_with(&options, &sandbox_env(&dir)).unwrap();
        assert_eq!(key.as_bytes(), &[7u8; 64][..]);
    }

    #[test]
    fn test_explicit_file_is_trimmed_and_decoded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.key");
        write_key(&path, &[1; 64]);
        let options = KeyOptions {
            secret: None,
            key_file: Some(path),
        };

        let key = resolve_with(&options, &sandbox_env(&dir)).unwrap();
        assert_eq!(key.as_bytes(), &[1u8; 64][..]);
    }

    #[test]
    fn test_env_path_used_before_defaults() {
        let dir = TempDir::new().unwrap();
        write_key(&dir.path().join(DEFAULT_KEY_FILE_NAME), &[2; 32]);
        let env_path = dir.path().join("from-env.key");
        write_key(&env_path, &[3; 32]);
        let mut env = sandbox_env(&dir);
        env.env_key_file = Some(env_path.display().to_string());

        let key = resolve_with(&KeyOptions::default(), &env).unwrap();
        assert_eq!(key.as_bytes(), &[3u8; 32][..]);
    }

    #[test]
    fn test_falls_back_to_working_directory() {
        let dir = TempDir::new().unwrap();
        write_key(&dir.path().join(DEFAULT_KEY_FILE_NAME), &[4; 32]);

        let key = resolve_with(&KeyOptions::default(), &sandbox_env(&dir)).unwrap();
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn test_missing_everything_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = resolve_with(&KeyOptions::default(), &sandbox_env(&dir)).unwrap_err();
        assert!(matches!(err, VaonisError::KeyMaterialNotFound(_)));
    }

    #[test]
    fn test_missing_explicit_file_does_not_fall_through() {
        let dir = TempDir::new().unwrap();
        write_key(&dir.path().join(DEFAULT_KEY_FILE_NAME), &[4; 32]);
        let options = KeyOptions {
            secret: None,
            key_file: Some(dir.path().join("nope.key")),
        };

        let err = resolve_with(&options, &sandbox_env(&dir)).unwrap_err();
        assert!(matches!(err, VaonisError::KeyMaterialNotFound(_)));
    }

    #[test]
    fn test_path_outside_roots_is_rejected() {
        let allowed = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let secret = outside.path().join("stolen.key");
        write_key(&secret, &[5; 32]);

        let options = KeyOptions {
            secret: None,
            key_file: Some(secret),
        };
        let err = resolve_with(&options, &sandbox_env(&allowed)).unwrap_err();
        assert!(matches!(err, VaonisError::PathNotAllowed { .. }));
    }

    #[test]
    fn test_parent_traversal_is_rejected() {
        let root = TempDir::new().unwrap();
        let inner = root.path().join("inner");
        fs::create_dir(&inner).unwrap();
        write_key(&root.path().join("sibling.key"), &[6; 32]);

        let mut env = sandbox_env(&root);
        env.cwd = inner.clone();
        env.temp_dir = inner.clone();
        let options = KeyOptions {
            secret: None,
            key_file: Some(PathBuf::from("../sibling.key")),
        };

        let err = resolve_with(&options, &env).unwrap_err();
        assert!(matches!(err, VaonisError::PathNotAllowed { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escaping_roots_is_rejected() {
        let allowed = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("real.key");
        write_key(&target, &[8; 32]);
        let link = allowed.path().join("link.key");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let options = KeyOptions {
            secret: None,
            key_file: Some(link),
        };
        let err = resolve_with(&options, &sandbox_env(&allowed)).unwrap_err();
        assert!(matches!(err, VaonisError::PathNotAllowed { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_default_symlink_escaping_roots_is_skipped() {
        let allowed = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("real.key");
        write_key(&target, &[8; 32]);
        std::os::unix::fs::symlink(&target, allowed.path().join(DEFAULT_KEY_FILE_NAME)).unwrap();

        let err = resolve_with(&KeyOptions::default(), &sandbox_env(&allowed)).unwrap_err();
        assert!(matches!(err, VaonisError::KeyMaterialNotFound(_)));
    }

    #[test]
    fn test_default_location_outside_roots_falls_through() {
        let allowed = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let mut env = sandbox_env(&allowed);
        env.config_dir = Some(outside.path().join("vaonis-link"));

        let err = resolve_with(&KeyOptions::default(), &env).unwrap_err();
        assert!(matches!(err, VaonisError::KeyMaterialNotFound(_)));
    }

    #[test]
    fn test_normalize_folds_dots_for_missing_paths() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let normalized = normalize_path(Path::new("a/./b/../c.key"), dir.path());
        assert_eq!(normalized, base.join("a").join("c.key"));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = KeyMaterial::from_bytes(vec![0xAB; 32]);
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("171"));
        assert!(rendered.contains("redacted"));
    }
}
