use dockscale_common::ServiceDefinition;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid service definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },
    #[error("Service defined twice: {0}")]
    Duplicate(String),
}

// Compose-shaped manifest; keys other than `image` are ignored.
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    services: BTreeMap<String, ManifestService>,
}

#[derive(Debug, Deserialize)]
struct ManifestService {
    image: Option<String>,
}

/// Immutable service name → image mapping, built once at start-up.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceDefinition>,
    reserved: String,
}

impl ServiceRegistry {
    /// Builds the registry, skipping the reserved control-plane name.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = ServiceDefinition>,
        reserved: &str,
    ) -> Result<Self, RegistryError> {
        let mut services = BTreeMap::new();
        for def in definitions {
            if def.name == reserved {
                info!(service = %def.name, "Skipping reserved control-plane service");
                continue;
            }
            validate(&def)?;
            if services.contains_key(&def.name) {
                return Err(RegistryError::Duplicate(def.name));
            }
            services.insert(def.name.clone(), def);
        }
        Ok(Self {
            services,
            reserved: reserved.to_string(),
        })
    }

    pub fn from_yaml_str(content: &str, reserved: &str) -> Result<Self, RegistryError> {
        let manifest: Manifest = serde_yaml::from_str(content)?;
        let mut definitions = Vec::with_capacity(manifest.services.len());
        for (name, service) in manifest.services {
            if name == reserved {
                info!(service = %name, "Skipping reserved control-plane service");
                continue;
            }
            let image = service.image.ok_or_else(|| RegistryError::InvalidDefinition {
                name: name.clone(),
                reason: "no image reference".to_string(),
            })?;
            definitions.push(ServiceDefinition::new(name, image));
        }
        Self::from_definitions(definitions, reserved)
    }

    /// Load registry from a manifest file
    pub async fn load_from_file(path: impl AsRef<Path>, reserved: &str) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RegistryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let registry = Self::from_yaml_str(&content, reserved)?;
        if registry.is_empty() {
            warn!(path = %path.display(), "Manifest defines no manageable services");
        }
        info!(path = %path.display(), services = registry.len(), "Loaded service registry");
        Ok(registry)
    }

    pub fn lookup(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.get(name)
    }

    /// All services, ordered by name.
    pub fn list_all(&self) -> impl Iterator<Item = &ServiceDefinition> {
        self.services.values()
    }

    pub fn reserved_name(&self) -> &str {
        &self.reserved
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn validate(def: &ServiceDefinition) -> Result<(), RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidDefinition {
        name: def.name.clone(),
        reason: reason.to_string(),
    };
    if def.name.trim().is_empty() {
        return Err(invalid("empty service name"));
    }
    if def.image_reference.trim().is_empty() {
        return Err(invalid("empty image reference"));
    }
    if def.image_reference.chars().any(char::is_whitespace) {
        return Err(invalid("image reference contains whitespace"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MANIFEST: &str = r#"
version: "3.8"
services:
  web:
    image: nginx:latest
    ports:
      - "80:80"
  api:
    image: ghcr.io/acme/api:1.4
    environment:
      - RUST_LOG=info
  control-plane:
    build: .
"#;

    #[test]
    fn test_parse_compose_manifest() {
        let registry = ServiceRegistry::from_yaml_str(MANIFEST, "control-plane").unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("web").unwrap().image_reference, "nginx:latest");
        assert!(registry.lookup("control-plane").is_none());

        let names: Vec<&str> = registry.list_all().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["api", "web"]);
    }

    #[test]
    fn test_missing_image_is_rejected() {
        let err = ServiceRegistry::from_yaml_str(MANIFEST, "something-else").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDefinition { ref name, .. } if name == "control-plane"));
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let err = ServiceRegistry::from_definitions(
            vec![ServiceDefinition::new("web", "  ")],
            "control-plane",
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDefinition { .. }));
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let err = ServiceRegistry::from_definitions(
            vec![
                ServiceDefinition::new("web", "nginx:latest"),
                ServiceDefinition::new("web", "nginx:1.25"),
            ],
            "control-plane",
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(ref name) if name == "web"));
    }

    #[test]
    fn test_manifest_without_services() {
        let registry = ServiceRegistry::from_yaml_str("version: '3'\n", "control-plane").unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MANIFEST.as_bytes()).unwrap();

        let registry = ServiceRegistry::load_from_file(file.path(), "control-plane")
            .await
            .unwrap();
        assert_eq!(registry.reserved_name(), "control-plane");
        assert!(registry.lookup("api").is_some());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = ServiceRegistry::load_from_file("/nonexistent/compose.yml", "control-plane")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Io { .. }));
    }
}
