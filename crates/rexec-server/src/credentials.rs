use std::path::{Path, PathBuf};

use tracing::warn;

/// Decides whether a handshake's credentials open a session.
pub trait CredentialCheck: Send + Sync {
    fn check_credential(&self, username: &str, token: &str) -> bool;
}

/// `username:token` records, one per line. Re-read on every check so
/// edits apply to the next handshake.
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Blank lines and `#` comments are ignored, as are lines without a colon.
fn find_record(contents: &str, username: &str, token: &str) -> bool {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .any(|(user, secret)| user == username && secret == token)
}

impl CredentialCheck for TokenFile {
    fn check_credential(&self, username: &str, token: &str) -> bool {
        if username.is_empty() || token.is_empty() {
            return false;
        }
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => find_record(&contents, username, token),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cannot read token file");
                false
            }
        }
    }
}
