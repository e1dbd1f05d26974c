//! Secrets management for gitcache
//!
//! Remote credentials are stored separately from configuration to avoid
//! accidental sharing. The secrets file is located at
//! `~/.config/gitcache/secrets.toml` and must have restrictive permissions
//! (0600 on Unix).
//!
//! Loading priority:
//! 1. Environment variables (GITCACHE_TOKEN, GITCACHE_USERNAME)
//! 2. Secrets file (~/.config/gitcache/secrets.toml)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Credentials, Error, Result};

/// Secrets structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Secrets {
    /// Remote credentials
    pub remote: RemoteSecrets,
}

/// Credentials for the git remote
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteSecrets {
    /// Username; when absent the token is sent as the username
    pub username: Option<String>,
    /// Password or access token
    pub token: Option<String>,
}

impl Secrets {
    /// Load secrets from the default location
    ///
    /// Returns default (empty) secrets if file doesn't exist
    pub fn load() -> Result<Self> {
        let secrets_path = Self::default_secrets_path();

        if let Some(path) = secrets_path {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load secrets from a specific file with permission checking
    pub fn load_from_file(path: &Path) -> Result<Self> {
        // Check file permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let metadata = std::fs::metadata(path)
                .map_err(|e| Error::storage(format!("Failed to stat {}", path.display()), e))?;
            let mode = metadata.permissions().mode();

            // Check if file is readable by group or others (mode & 0o077)
            if mode & 0o077 != 0 {
                return Err(Error::Config(format!(
                    "Secrets file {} has insecure permissions {:o}. \
                     Please run: chmod 600 {}",
                    path.display(),
                    mode & 0o777,
                    path.display()
                )));
            }

            debug!(path = %path.display(), mode = format!("{:o}", mode & 0o777), "Secrets file permissions OK");
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::storage(format!("Failed to read {}", path.display()), e))?;
        let mut secrets: Secrets = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse secrets: {}", e)))?;

        // Trim whitespace from token
        if let Some(ref mut token) = secrets.remote.token {
            *token = token.trim().to_string();
        }

        Ok(secrets)
    }

    /// Get the default secrets file path
    ///
    /// Returns `~/.config/gitcache/secrets.toml` on Unix
    pub fn default_secrets_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("gitcache").join("secrets.toml"))
    }

    /// Resolve credentials with environment variable overrides
    ///
    /// Priority: GITCACHE_TOKEN / GITCACHE_USERNAME env vars > secrets file.
    /// Falls back to anonymous access when no token is configured.
    pub fn credentials(&self) -> Credentials {
        let username = non_empty_env("GITCACHE_USERNAME").or_else(|| {
            self.remote
                .username
                .as_ref()
                .filter(|u| !u.is_empty())
                .cloned()
        });

        let token = if let Some(token) = non_empty_env("GITCACHE_TOKEN") {
            debug!("Using token from GITCACHE_TOKEN environment variable");
            Some(token)
        } else {
            self.remote.token.as_ref().filter(|t| !t.is_empty()).map(|t| {
                debug!("Using token from secrets file");
                t.clone()
            })
        };

        credentials_from(username, token)
    }

    /// Create a template secrets file at the default location
    ///
    /// Creates parent directories if needed and sets secure permissions
    pub fn create_template() -> Result<PathBuf> {
        let path = Self::default_secrets_path()
            .ok_or_else(|| Error::Config("Could not determine secrets path".to_string()))?;

        // Create parent directory
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Don't overwrite existing file
        if path.exists() {
            return Err(Error::Config(format!(
                "Secrets file already exists at {}",
                path.display()
            )));
        }

        let template = r#"# gitcache secrets
# This file contains sensitive credentials - do not share or commit to version control
#
# IMPORTANT: This file must have restrictive permissions (chmod 600)

[remote]
# Leave username empty to send the token as the username (GitHub OAuth style)
username = ""
token = ""
"#;

        std::fs::write(&path, template)?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        warn!(path = %path.display(), "Created secrets template - please edit and add your token");

        Ok(path)
    }
}

/// Combine an optional username and token into credentials
pub fn credentials_from(username: Option<String>, token: Option<String>) -> Credentials {
    match (username, token) {
        (Some(username), Some(token)) => Credentials::user_pass(username, token),
        (None, Some(token)) => Credentials::token(token),
        (_, None) => Credentials::Anonymous,
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_secrets() {
        let secrets = Secrets::default();
        assert!(secrets.remote.token.is_none());
        assert!(secrets.remote.username.is_none());
    }

    #[test]
    fn test_parse_secrets() {
        let toml = r#"
[remote]
username = "g-tit"
token = "ghp_xxxxxxxxxxxx"
"#;
        let secrets: Secrets = toml::from_str(toml).unwrap();
        assert_eq!(secrets.remote.token, Some("ghp_xxxxxxxxxxxx".to_string()));
        assert_eq!(secrets.remote.username, Some("g-tit".to_string()));
    }

    #[test]
    fn test_credentials_from() {
        assert_eq!(credentials_from(None, None), Credentials::Anonymous);
        assert_eq!(
            credentials_from(Some("bob".to_string()), None),
            Credentials::Anonymous
        );
        assert_eq!(
            credentials_from(None, Some("tok".to_string())),
            Credentials::token("tok")
        );
        assert_eq!(
            credentials_from(Some("bob".to_string()), Some("pw".to_string())),
            Credentials::user_pass("bob", "pw")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_insecure_permissions_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[remote]\ntoken = \"test\"").unwrap();

        // Set world-readable permissions
        let perms = std::fs::Permissions::from_mode(0o644);
        std::fs::set_permissions(file.path(), perms).unwrap();

        let result = Secrets::load_from_file(file.path());
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("insecure permissions"));
    }

    #[cfg(unix)]
    #[test]
    fn test_secure_permissions_accepted() {
        use std::os::unix::fs::PermissionsExt;

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[remote]\ntoken = \"  ghp_test  \"").unwrap();

        // Set owner-only permissions
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(file.path(), perms).unwrap();

        let result = Secrets::load_from_file(file.path());
        assert!(result.is_ok());
        assert_eq!(result.unwrap().remote.token, Some("ghp_test".to_string()));
    }
}
