use crate::config::Config;
use std::path::Path;

pub type Result<T> = std::result::Result<T, ConfigIoError>;

#[derive(Debug)]
pub enum ConfigIoError {
    CreateDefault {
        path: String,
        source: Box<ConfigIoError>,
    },
    Read {
        path: String,
        source: std::io::Error,
    },
    ParseToml {
        path: String,
        source: toml::de::Error,
    },
    Invalid {
        path: String,
        reason: &'static str,
    },
    SerializeToml {
        source: toml::ser::Error,
    },
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    Write {
        path: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ConfigIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateDefault { path, .. } => {
                write!(f, "failed to create default config at {path}")
            }
            Self::Read { path, .. } => write!(f, "failed reading config file {path}"),
            Self::ParseToml { path, .. } => write!(f, "invalid TOML in {path}"),
            Self::Invalid { path, reason } => write!(f, "invalid config in {path}: {reason}"),
            Self::SerializeToml { .. } => write!(f, "failed serializing config to TOML"),
            Self::CreateDir { path, .. } => write!(f, "failed creating directory {path}"),
            Self::Write { path, .. } => write!(f, "failed writing config file {path}"),
        }
    }
}

impl std::error::Error for ConfigIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreateDefault { source, .. } => Some(source.as_ref()),
            Self::Read { source, .. } => Some(source),
            Self::ParseToml { source, .. } => Some(source),
            Self::SerializeToml { source } => Some(source),
            Self::CreateDir { source, .. } => Some(source),
            Self::Write { source, .. } => Some(source),
            Self::Invalid { .. } => None,
        }
    }
}

/// Loads `path`, writing a default config there first if it does not exist.
pub async fn load_or_create_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let shown = path.display().to_string();

    if !tokio::fs::try_exists(path)
        .await
        .map_err(|source| ConfigIoError::Read {
            path: shown.clone(),
            source,
        })?
    {
        let cfg = Config::default();
        save_config(path, &cfg)
            .await
            .map_err(|source| ConfigIoError::CreateDefault {
                path: shown,
                source: Box::new(source),
            })?;
        return Ok(cfg);
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigIoError::Read {
            path: shown.clone(),
            source,
        })?;
    let cfg: Config = toml::from_str(&content).map_err(|source| ConfigIoError::ParseToml {
        path: shown.clone(),
        source,
    })?;
    cfg.requery
        .validate()
        .map_err(|reason| ConfigIoError::Invalid {
            path: shown,
            reason,
        })?;
    Ok(cfg)
}

/// Writes `cfg` as pretty TOML via a temp file and rename.
pub async fn save_config(path: impl AsRef<Path>, cfg: &Config) -> Result<()> {
    let path = path.as_ref();
    let toml_string =
        toml::to_string_pretty(cfg).map_err(|source| ConfigIoError::SerializeToml { source })?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ConfigIoError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    tokio::fs::write(&tmp_path, toml_string)
        .await
        .map_err(|source| ConfigIoError::Write {
            path: tmp_path.display().to_string(),
            source,
        })?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|source| ConfigIoError::Write {
            path: path.display().to_string(),
            source,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("rust-mule-requery-config-{tag}-{nanos}"));
        p
    }

    #[tokio::test]
    async fn missing_config_is_created_with_defaults() {
        let root = temp_dir("create");
        let path = root.join("nested/config.toml");

        let cfg = load_or_create_config(&path).await.expect("create");
        assert!(path.exists());
        assert_eq!(cfg.requery, crate::config::RequeryConfig::default());

        let reloaded = load_or_create_config(&path).await.expect("reload");
        assert_eq!(reloaded.requery, cfg.requery);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn invalid_requery_section_is_rejected() {
        let root = temp_dir("invalid");
        std::fs::create_dir_all(&root).expect("mkdir");
        let path = root.join("config.toml");
        std::fs::write(&path, "[requery]\npoll_every_ms = 0\n").expect("write");

        let err = load_or_create_config(&path).await.expect_err("invalid");
        assert!(matches!(err, ConfigIoError::Invalid { .. }));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn broken_toml_reports_parse_error() {
        let root = temp_dir("parse");
        std::fs::create_dir_all(&root).expect("mkdir");
        let path = root.join("config.toml");
        std::fs::write(&path, "[requery\n").expect("write");

        let err = load_or_create_config(&path).await.expect_err("parse");
        assert!(matches!(err, ConfigIoError::ParseToml { .. }));
        let _ = std::fs::remove_dir_all(&root);
    }
}
