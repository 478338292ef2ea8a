//! Machine identity sent with every control-plane request.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;

use crate::error::TransportError;

/// Agent version reported to the control plane.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Printable snapshot of a [`MachineIdentity`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MachineSummary {
    pub id: Option<String>,
    pub name: String,
    pub fqdn: String,
    pub host: String,
    pub user: String,
    pub version: String,
}

/// Who this agent is.
#[derive(Debug)]
pub struct MachineIdentity {
    id: RwLock<Option<String>>,
    id_file: PathBuf,
    pub name: String,
    pub fqdn: String,
    pub host: String,
    pub user: String,
    pub version: String,
}

impl MachineIdentity {
    /// Gather identity from the host, loading a persisted id from `id_file` if present.
    pub fn detect(id_file: PathBuf) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let name = host.split('.').next().unwrap_or(&host).to_string();
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();

        let id = read_id_file(&id_file);
        if let Some(ref id) = id {
            tracing::info!(client_id = %id, "Loaded client id");
        }

        Self {
            id: RwLock::new(id),
            id_file,
            name,
            fqdn: host.clone(),
            host,
            user,
            version: AGENT_VERSION.to_string(),
        }
    }

    pub fn id(&self) -> Option<String> {
        self.id.read().ok().and_then(|id| id.clone())
    }

    /// Store a new client id in memory and on disk.
    pub fn set_id(&self, id: &str) -> Result<(), TransportError> {
        let id = clean_id(id)
            .ok_or_else(|| TransportError::InvalidMessage("empty client id".into()))?;
        if let Some(parent) = self.id_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.id_file, serde_json::to_string(&id)?)?;
        if let Ok(mut slot) = self.id.write() {
            *slot = Some(id.clone());
        }
        tracing::info!(client_id = %id, "Client id saved");
        Ok(())
    }

    pub fn summary(&self) -> MachineSummary {
        MachineSummary {
            id: self.id(),
            name: self.name.clone(),
            fqdn: self.fqdn.clone(),
            host: self.host.clone(),
            user: self.user.clone(),
            version: self.version.clone(),
        }
    }

    /// Header pairs identifying this machine.
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ghosts-id", self.id().unwrap_or_default()),
            ("ghosts-name", self.name.clone()),
            ("ghosts-fqdn", self.fqdn.clone()),
            ("ghosts-host", self.host.clone()),
            ("ghosts-user", self.user.clone()),
            ("ghosts-version", self.version.clone()),
        ]
    }

    /// Identity headers for HTTP requests. Values that are not valid header text are skipped.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (key, value) in self.header_pairs() {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(key), value);
            }
        }
        headers
    }

    /// Fetch a client id from the control plane when none is stored yet.
    pub async fn ensure_id(
        &self,
        client: &reqwest::Client,
        url: &str,
    ) -> Result<String, TransportError> {
        if let Some(id) = self.id() {
            return Ok(id);
        }

        let response = client.get(url).headers(self.headers()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        self.set_id(&body)?;
        self.id()
            .ok_or_else(|| TransportError::InvalidMessage("client id not stored".into()))
    }
}

/// Ids arrive either as a JSON string or as bare text.
fn clean_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let id = serde_json::from_str::<String>(trimmed)
        .unwrap_or_else(|_| trimmed.trim_matches('"').to_string());
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

fn read_id_file(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    clean_id(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_id_variants() {
        assert_eq!(clean_id("\"abc\"\n").as_deref(), Some("abc"));
        assert_eq!(clean_id(" abc ").as_deref(), Some("abc"));
        assert_eq!(clean_id("  "), None);
    }

    #[test]
    fn set_id_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance").join("id.json");
        let identity = MachineIdentity::detect(path.clone());
        assert!(identity.id().is_none());

        identity.set_id("\"0f8fad5b-d9cb-469f-a165-70867728950e\"").unwrap();
        assert_eq!(
            identity.id().as_deref(),
            Some("0f8fad5b-d9cb-469f-a165-70867728950e")
        );

        let reloaded = MachineIdentity::detect(path);
        assert_eq!(reloaded.id(), identity.id());
    }

    #[test]
    fn headers_carry_identity() {
        let dir = tempfile::tempdir().unwrap();
        let identity = MachineIdentity::detect(dir.path().join("id.json"));
        let headers = identity.headers();
        assert_eq!(headers.get("ghosts-version").unwrap(), AGENT_VERSION);
        assert!(headers.contains_key("ghosts-host"));
        assert_eq!(identity.header_pairs().len(), 6);
    }

    #[test]
    fn summary_serializes_identity() {
        let dir = tempfile::tempdir().unwrap();
        let identity = MachineIdentity::detect(dir.path().join("id.json"));
        identity.set_id("abc").unwrap();

        let json = serde_json::to_value(identity.summary()).unwrap();
        assert_eq!(json["Id"], "abc");
        assert_eq!(json["Version"], AGENT_VERSION);
        assert_eq!(json["Host"], identity.host.as_str());
    }
}
