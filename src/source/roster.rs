use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use super::IdentityRoster;

/// Number of leading key characters used when a peer has no display name.
const SHORT_KEY_LEN: usize = 8;

/// Identity roster read from the proxy JSON config.
///
/// The parsed list is cached and re-read only when the file's modification
/// time changes.
pub struct ConfigFileRoster {
    path: PathBuf,
    cache: Mutex<Option<CachedRoster>>,
}

struct CachedRoster {
    modified: SystemTime,
    identities: Vec<String>,
}

#[derive(Deserialize)]
struct ProxyConfigFile {
    #[serde(default)]
    inbounds: Vec<Inbound>,
}

#[derive(Deserialize)]
struct Inbound {
    #[serde(default)]
    settings: Option<InboundSettings>,
}

#[derive(Deserialize)]
struct InboundSettings {
    #[serde(default)]
    clients: Vec<Client>,
}

#[derive(Deserialize)]
struct Client {
    #[serde(default)]
    email: Option<String>,
}

impl ConfigFileRoster {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityRoster for ConfigFileRoster {
    fn identities(&self) -> Result<Vec<String>> {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .with_context(|| format!("reading metadata of {}", self.path.display()))?;

        let mut cache = self.cache.lock();
        if let Some(cached) = cache.as_ref() {
            if cached.modified == modified {
                return Ok(cached.identities.clone());
            }
        }

        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading proxy config {}", self.path.display()))?;
        let identities = parse_identities(&data)
            .with_context(|| format!("parsing proxy config {}", self.path.display()))?;

        debug!(
            path = %self.path.display(),
            identities = identities.len(),
            "reloaded identity roster"
        );

        *cache = Some(CachedRoster {
            modified,
            identities: identities.clone(),
        });

        Ok(identities)
    }
}

/// Extracts `inbounds[].settings.clients[].email`, dropping empty and
/// duplicate entries while keeping first-seen order.
fn parse_identities(data: &str) -> Result<Vec<String>> {
    let file: ProxyConfigFile = serde_json::from_str(data)?;

    let mut seen = HashSet::new();
    let identities = file
        .inbounds
        .into_iter()
        .filter_map(|inbound| inbound.settings)
        .flat_map(|settings| settings.clients)
        .filter_map(|client| client.email)
        .map(|email| email.trim().to_string())
        .filter(|email| !email.is_empty() && seen.insert(email.clone()))
        .collect();

    Ok(identities)
}

/// Display names for VPN peers.
#[derive(Debug, Clone, Default)]
pub struct PeerNames {
    names: HashMap<String, String>,
}

impl PeerNames {
    pub fn new(names: HashMap<String, String>) -> Self {
        Self { names }
    }

    /// Returns the configured name, or a shortened key for unknown peers.
    pub fn display_name(&self, peer_id: &str) -> String {
        match self.names.get(peer_id) {
            Some(name) if !name.is_empty() => name.clone(),
            _ => short_key(peer_id),
        }
    }
}

fn short_key(peer_id: &str) -> String {
    match peer_id.char_indices().nth(SHORT_KEY_LEN) {
        Some((idx, _)) => format!("{}…", &peer_id[..idx]),
        None => peer_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::*;

    const CONFIG: &str = r#"{
        "log": {"loglevel": "warning"},
        "inbounds": [
            {"tag": "api", "protocol": "dokodemo-door"},
            {"tag": "vless-in", "settings": {"clients": [
                {"id": "1", "email": "alice@example.com"},
                {"id": "2", "email": "bob@example.com"},
                {"id": "3"}
            ]}},
            {"tag": "vmess-in", "settings": {"clients": [
                {"id": "4", "email": "alice@example.com"},
                {"id": "5", "email": "  "},
                {"id": "6", "email": "carol@example.com"}
            ]}}
        ]
    }"#;

    #[test]
    fn test_parse_identities_dedup_in_order() {
        let ids = parse_identities(CONFIG).expect("valid config");
        assert_eq!(
            ids,
            vec![
                "alice@example.com".to_string(),
                "bob@example.com".to_string(),
                "carol@example.com".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_identities_invalid_json() {
        assert!(parse_identities("{not json").is_err());
        assert!(parse_identities("{}").expect("empty object").is_empty());
    }

    #[test]
    fn test_roster_rereads_on_mtime_change() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(CONFIG.as_bytes()).expect("write config");
        file.flush().expect("flush");

        let roster = ConfigFileRoster::new(file.path());
        assert_eq!(roster.identities().expect("first read").len(), 3);

        // Same mtime: served from cache even though content changed.
        let original_mtime = std::fs::metadata(file.path())
            .and_then(|m| m.modified())
            .expect("mtime");
        std::fs::write(
            file.path(),
            r#"{"inbounds":[{"settings":{"clients":[{"email":"dave@example.com"}]}}]}"#,
        )
        .expect("rewrite");
        let f = std::fs::File::options()
            .write(true)
            .open(file.path())
            .expect("open");
        f.set_modified(original_mtime).expect("restore mtime");
        assert_eq!(roster.identities().expect("cached read").len(), 3);

        f.set_modified(original_mtime + Duration::from_secs(10))
            .expect("bump mtime");
        assert_eq!(
            roster.identities().expect("reloaded"),
            vec!["dave@example.com".to_string()]
        );
    }

    #[test]
    fn test_roster_missing_file() {
        let roster = ConfigFileRoster::new("/nonexistent/config.json");
        assert!(roster.identities().is_err());
    }

    #[test]
    fn test_peer_display_names() {
        let mut names = HashMap::new();
        names.insert("cGVlcjE=".to_string(), "laptop".to_string());
        let names = PeerNames::new(names);

        assert_eq!(names.display_name("cGVlcjE="), "laptop");
        assert_eq!(
            names.display_name("xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg="),
            "xTIBA5rb…"
        );
        assert_eq!(names.display_name("short"), "short");
    }
}
