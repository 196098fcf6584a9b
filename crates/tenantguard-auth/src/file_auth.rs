//! Static, file-sourced authentication backend
//!
//! The credential table is read once at construction. Each non-blank,
//! non-comment line has the shape:
//!
//! ```text
//! username:sha256$<salt-hex>$<digest-hex>[:role,role,...]
//! ```
//!
//! where `digest = SHA-256(salt || secret)`. Any deviation is a fatal
//! configuration error; the backend never starts with a partial table.

use std::collections::HashMap;
use std::path::Path;

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Error, Result, SecurityFailure};
use crate::identity::{AuthenticatedIdentity, Credentials};

const HASH_SCHEME: &str = "sha256";
const SALT_LEN: usize = 16;

/// Salted secret digest for one user
#[derive(Clone, PartialEq, Eq)]
struct SecretHash {
    salt: Vec<u8>,
    digest: Vec<u8>,
}

impl SecretHash {
    fn parse(field: &str) -> Option<Self> {
        let mut parts = field.split('$');
        let (scheme, salt, digest) = (parts.next()?, parts.next()?, parts.next()?);
        if scheme != HASH_SCHEME || parts.next().is_some() {
            return None;
        }
        let salt = hex::decode(salt).ok()?;
        let digest = hex::decode(digest).ok()?;
        (!salt.is_empty() && digest.len() == 32).then_some(Self { salt, digest })
    }

    fn matches(&self, secret: &[u8]) -> bool {
        constant_time_eq(&digest(&self.salt, secret), &self.digest)
    }
}

#[derive(Clone)]
struct StaticUser {
    hash: SecretHash,
    roles: Vec<String>,
}

/// Authenticates against a preloaded username → salted hash table
pub struct FileAuthenticationBackend {
    users: HashMap<String, StaticUser>,
}

impl FileAuthenticationBackend {
    /// Load the credential table from `path`
    ///
    /// Fails with [`Error::Config`] when the path is blank, does not name a
    /// readable file, or the content does not parse.
    pub fn from_path(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            return Err(Error::Config(
                "static credential file path is empty".into(),
            ));
        }

        let file = Path::new(path);
        if !file.is_file() {
            return Err(Error::Config(format!(
                "static credential file {} does not exist or is not a file",
                path
            )));
        }
        let contents = std::fs::read_to_string(file).map_err(|e| {
            Error::Config(format!("failed to read static credential file {}: {}", path, e))
        })?;

        let backend = Self::parse(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path, e)))?;
        info!(path = %path, users = backend.users.len(), "Loaded static credentials");
        Ok(backend)
    }

    /// Parse a credential table from its text form
    pub fn parse(contents: &str) -> std::result::Result<Self, String> {
        let mut users = HashMap::new();

        for (idx, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let lineno = idx + 1;

            let mut fields = line.splitn(3, ':');
            let username = fields.next().unwrap_or_default().trim();
            let hash = fields
                .next()
                .and_then(|f| SecretHash::parse(f.trim()))
                .ok_or_else(|| format!("line {}: expected username:{}$salt$digest", lineno, HASH_SCHEME))?;
            if username.is_empty() {
                return Err(format!("line {}: empty username", lineno));
            }
            let roles = fields
                .next()
                .map(|r| {
                    r.split(',')
                        .map(str::trim)
                        .filter(|r| !r.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            if users
                .insert(username.to_string(), StaticUser { hash, roles })
                .is_some()
            {
                return Err(format!("line {}: duplicate user {}", lineno, username));
            }
        }

        if users.is_empty() {
            return Err("no credential entries found".into());
        }
        Ok(Self { users })
    }

    /// Verify a username/secret pair
    pub fn authenticate(&self, credentials: &Credentials) -> Result<AuthenticatedIdentity> {
        let username = credentials.username();
        let Some(user) = self.users.get(username) else {
            warn!(username = %username, "Static authentication failed: unknown user");
            return Err(SecurityFailure::UnknownUser.into());
        };

        if !user.hash.matches(credentials.secret()) {
            warn!(username = %username, "Static authentication failed: bad credentials");
            return Err(SecurityFailure::BadCredentials.into());
        }

        debug!(username = %username, "Static authentication succeeded");
        Ok(AuthenticatedIdentity::from_static(username, user.roles.clone()))
    }

    /// Whether `username` is present in the table
    pub fn exists(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// This backend never issues a challenge, so callers must not ask again
    pub fn re_request_authentication(&self) -> bool {
        false
    }

    /// Number of loaded users
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether the table is empty (never true for a constructed backend)
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Produce a table hash field for `secret` with a fresh random salt
pub fn hash_secret(secret: &[u8]) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    format!(
        "{}${}${}",
        HASH_SCHEME,
        hex::encode(salt),
        hex::encode(digest(&salt, secret))
    )
}

fn digest(salt: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret);
    hasher.finalize().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn passwords() -> String {
        format!(
            "# static service accounts\nfoo:{}\n\nkibana:{}:viewer, ops\n",
            hash_secret(b"bar"),
            hash_secret(b"k1bana"),
        )
    }

    fn given_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn given_backend() -> (NamedTempFile, FileAuthenticationBackend) {
        let file = given_file(&passwords());
        let backend = FileAuthenticationBackend::from_path(file.path().to_str().unwrap()).unwrap();
        (file, backend)
    }

    #[test]
    fn test_empty_path_is_a_configuration_error() {
        for path in ["", "   "] {
            let err = FileAuthenticationBackend::from_path(path).err().unwrap();
            assert!(matches!(err, Error::Config(_)));
        }
    }

    #[test]
    fn test_nonexistent_path_is_a_configuration_error() {
        let err = FileAuthenticationBackend::from_path("/foo/bar").err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unparsable_content_is_a_configuration_error() {
        let file = given_file("random content");
        let err = FileAuthenticationBackend::from_path(file.path().to_str().unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_duplicate_users_are_rejected() {
        let contents = format!("foo:{}\nfoo:{}\n", hash_secret(b"a"), hash_secret(b"b"));
        assert!(FileAuthenticationBackend::parse(&contents)
            .err()
            .unwrap()
            .contains("duplicate"));
    }

    #[test]
    fn test_unknown_hash_scheme_is_rejected() {
        assert!(FileAuthenticationBackend::parse("foo:md5$00$00").is_err());
        assert!(FileAuthenticationBackend::parse("foo:sha256$zz$00").is_err());
    }

    #[test]
    fn test_unknown_user_fails_with_security_error() {
        let (_file, backend) = given_backend();
        let err = backend
            .authenticate(&Credentials::new("somerandomuser", "somepasswd"))
            .unwrap_err();
        assert!(matches!(err, Error::Security(SecurityFailure::UnknownUser)));
    }

    #[test]
    fn test_wrong_secret_fails_with_security_error() {
        let (_file, backend) = given_backend();
        let err = backend
            .authenticate(&Credentials::new("foo", "somepasswd"))
            .unwrap_err();
        assert!(matches!(err, Error::Security(SecurityFailure::BadCredentials)));
    }

    #[test]
    fn test_correct_secret_returns_identity_named_after_user() {
        let (_file, backend) = given_backend();
        let identity = backend.authenticate(&Credentials::new("foo", "bar")).unwrap();
        assert_eq!(identity.username, "foo");
        assert_eq!(identity.source, crate::identity::IdentitySource::Static);
        assert!(identity.roles.is_empty());
    }

    #[test]
    fn test_roles_column_becomes_role_hints() {
        let (_file, backend) = given_backend();
        let identity = backend
            .authenticate(&Credentials::new("kibana", "k1bana"))
            .unwrap();
        assert_eq!(identity.roles, vec!["viewer", "ops"]);
    }

    #[test]
    fn test_exists_reflects_table_membership() {
        let (_file, backend) = given_backend();
        assert!(backend.exists("foo"));
        assert!(!backend.exists("someuser"));
        assert_eq!(backend.len(), 2);
    }

    #[test]
    fn test_re_request_authentication_is_always_false() {
        let (_file, backend) = given_backend();
        assert!(!backend.re_request_authentication());
    }

    #[test]
    fn test_constant_time_eq_compares_content_and_length() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
