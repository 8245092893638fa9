//! The capability surface a storage backend must provide, and the registry
//! that builds backends by identifier.

pub mod dropbox;

use crate::error::SnapshotError;
use crate::types::ListPage;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;

/// Streamed body of a successful download.
pub type ByteStream = BoxStream<'static, Result<Bytes, SnapshotError>>;

/// Operations the map and resolve phases need from a backend.
///
/// Implementations assume a valid bearer token is already installed. Errors
/// must keep transport failures (`SnapshotError::Transport`) apart from
/// non-success answers (`SnapshotError::Api`).
#[async_trait]
pub trait Remote: Send + Sync {
    /// Short identifier of the backend, e.g. `"dropbox"`.
    fn name(&self) -> &str;

    /// First page of a recursive listing under `path_prefix`.
    async fn list_root(&self, path_prefix: &str) -> Result<ListPage, SnapshotError>;

    /// Next page after `cursor`.
    async fn list_continue(&self, cursor: &str) -> Result<ListPage, SnapshotError>;

    /// Total bytes stored in the account.
    async fn total_remote_bytes_used(&self) -> Result<u64, SnapshotError>;

    /// Opens the byte stream of the file with backend id `entry_id`.
    async fn download_file(&self, entry_id: &str) -> Result<ByteStream, SnapshotError>;

    /// Human-readable account name, for diagnostics.
    async fn current_account_label(&self) -> Result<String, SnapshotError>;
}

/// Settings handed to a backend factory.
#[derive(Debug, Clone, Default)]
pub struct RemoteSettings {
    pub token: String,
    pub api_url: Option<String>,
    pub content_url: Option<String>,
}

/// Builds a backend from its settings.
pub type RemoteFactory = fn(&RemoteSettings) -> Result<Box<dyn Remote>, SnapshotError>;

/// Maps backend identifiers to factories.
#[derive(Clone, Default)]
pub struct RemoteRegistry {
    factories: BTreeMap<String, RemoteFactory>,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every backend shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(dropbox::BACKEND_ID, dropbox::factory);
        registry
    }

    /// Adds or replaces a backend.
    pub fn register(&mut self, id: &str, factory: RemoteFactory) {
        self.factories.insert(id.to_string(), factory);
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn build(
        &self,
        id: &str,
        settings: &RemoteSettings,
    ) -> Result<Box<dyn Remote>, SnapshotError> {
        let factory = self.factories.get(id).ok_or_else(|| {
            SnapshotError::Config(format!(
                "unknown backend '{}' (available: {})",
                id,
                self.ids().collect::<Vec<_>>().join(", ")
            ))
        })?;
        factory(settings)
    }
}

impl std::fmt::Debug for RemoteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    #[async_trait]
    impl Remote for Nothing {
        fn name(&self) -> &str {
            "nothing"
        }
        async fn list_root(&self, _: &str) -> Result<ListPage, SnapshotError> {
            Ok(ListPage::default())
        }
        async fn list_continue(&self, _: &str) -> Result<ListPage, SnapshotError> {
            Ok(ListPage::default())
        }
        async fn total_remote_bytes_used(&self) -> Result<u64, SnapshotError> {
            Ok(0)
        }
        async fn download_file(&self, _: &str) -> Result<ByteStream, SnapshotError> {
            Err(SnapshotError::Api {
                status: 404,
                body: String::new(),
            })
        }
        async fn current_account_label(&self) -> Result<String, SnapshotError> {
            Ok("nobody".to_string())
        }
    }

    fn nothing_factory(_: &RemoteSettings) -> Result<Box<dyn Remote>, SnapshotError> {
        Ok(Box::new(Nothing))
    }

    #[test]
    fn test_registry_builds_registered_backend() {
        let mut registry = RemoteRegistry::with_builtin();
        registry.register("nothing", nothing_factory);
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["dropbox", "nothing"]);

        let remote = registry.build("nothing", &RemoteSettings::default()).unwrap();
        assert_eq!(remote.name(), "nothing");
    }

    #[test]
    fn test_unknown_backend_is_config_error() {
        let registry = RemoteRegistry::with_builtin();
        match registry.build("ftp", &RemoteSettings::default()) {
            Err(SnapshotError::Config(msg)) => assert!(msg.contains("dropbox")),
            _ => panic!("expected config error"),
        }
    }
}
