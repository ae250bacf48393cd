use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identity this worker registers under, stable across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIdentity {
    /// Worker id reported to the bundle service on every check-in.
    pub id: String,
    /// Free-form label the operator may use to target this worker.
    #[serde(default)]
    pub tag: Option<String>,
}

impl WorkerIdentity {
    fn normalize(&mut self) {
        self.id = self.id.trim().to_string();

        self.tag = self.tag.as_ref().map(|s| s.trim().to_string());
        if matches!(self.tag.as_deref(), Some(s) if s.is_empty()) {
            self.tag = None;
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

/// Path of the identity file under the user's config directory.
pub fn identity_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("bundle-worker").join("identity.json"))
}

/// Load the persisted identity, if one exists.
pub fn load_identity() -> anyhow::Result<Option<WorkerIdentity>> {
    let path = identity_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    let mut identity: WorkerIdentity = serde_json::from_str(&raw)?;
    identity.normalize();
    if identity.id.is_empty() {
        return Ok(None);
    }
    Ok(Some(identity))
}

/// Persist the identity atomically (write-temp-then-rename).
pub fn save_identity(identity: &WorkerIdentity) -> anyhow::Result<()> {
    let path = identity_path()?;
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid identity path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut identity = identity.clone();
    identity.normalize();

    let json = serde_json::to_string_pretty(&identity)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Load the persisted identity or mint and persist a fresh one.
///
/// `id_override` / `tag_override` come from the command line and take
/// precedence; an overridden identity is saved back so later runs without
/// the flags keep the same id.
pub fn ensure_identity(
    id_override: Option<String>,
    tag_override: Option<String>,
) -> anyhow::Result<WorkerIdentity> {
    let loaded = match load_identity() {
        Ok(v) => v,
        Err(err) => {
            eprintln!("warning: failed to read worker identity (will recreate): {err:#}");
            None
        }
    };

    let mut identity = loaded.unwrap_or_else(|| WorkerIdentity {
        id: uuid::Uuid::new_v4().to_string(),
        tag: None,
    });

    if let Some(id) = id_override {
        identity.id = id;
    }
    if tag_override.is_some() {
        identity.tag = tag_override;
    }
    identity.normalize();

    save_identity(&identity)?;
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_empty_tag() {
        let mut identity = WorkerIdentity {
            id: "  w-1  ".to_string(),
            tag: Some("   ".to_string()),
        };
        identity.normalize();
        assert_eq!(identity.id, "w-1");
        assert_eq!(identity.tag, None);
    }

    #[test]
    fn identity_round_trips_through_json() {
        let identity = WorkerIdentity {
            id: "w-2".to_string(),
            tag: Some("gpu-box".to_string()),
        };
        let raw = serde_json::to_string(&identity).unwrap();
        let back: WorkerIdentity = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.id, "w-2");
        assert_eq!(back.tag.as_deref(), Some("gpu-box"));
    }
}
