//! Storage type registry.
//!
//! Maps each [`StorageKind`] to the factory that builds its transfer
//! client. Every kind registers once; a second registration is a conflict.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use stowage_core::config::TransferConfig;
use stowage_core::error::AppError;
use stowage_core::result::AppResult;
use stowage_entity::storage::{StorageEntity, StorageKind, legacy};

use crate::client::ChunkedTransferClient;

/// Base URLs of the HTTP providers. Overridable so tests can point the
/// clients at a local server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoints {
    /// Dropbox RPC endpoints.
    pub dropbox_api: String,
    /// Dropbox content (upload) endpoints.
    pub dropbox_content: String,
    /// Dropbox OAuth token endpoint.
    pub dropbox_token: String,
    /// Google Drive metadata API.
    pub google_api: String,
    /// Google Drive upload API.
    pub google_upload: String,
    /// Google OAuth token endpoint.
    pub google_token: String,
    /// Microsoft Graph.
    pub graph: String,
    /// Microsoft identity platform token endpoint.
    pub microsoft_token: String,
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            dropbox_api: "https://api.dropboxapi.com/2".to_string(),
            dropbox_content: "https://content.dropboxapi.com/2".to_string(),
            dropbox_token: "https://api.dropboxapi.com/oauth2/token".to_string(),
            google_api: "https://www.googleapis.com/drive/v3".to_string(),
            google_upload: "https://www.googleapis.com/upload/drive/v3".to_string(),
            google_token: "https://oauth2.googleapis.com/token".to_string(),
            graph: "https://graph.microsoft.com/v1.0".to_string(),
            microsoft_token: "https://login.microsoftonline.com/common/oauth2/v2.0/token"
                .to_string(),
        }
    }
}

impl ApiEndpoints {
    /// Every endpoint rooted at one base URL, for mock servers.
    pub fn rooted_at(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            dropbox_api: format!("{base}/dropbox/api"),
            dropbox_content: format!("{base}/dropbox/content"),
            dropbox_token: format!("{base}/dropbox/token"),
            google_api: format!("{base}/google/drive/v3"),
            google_upload: format!("{base}/google/upload/drive/v3"),
            google_token: format!("{base}/google/token"),
            graph: format!("{base}/graph"),
            microsoft_token: format!("{base}/microsoft/token"),
        }
    }
}

/// Everything a factory needs besides the storage record.
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// Transfer tuning knobs.
    pub transfer: TransferConfig,
    /// Directory packages are built in; the default-local storage folder.
    pub backup_dir: PathBuf,
    /// Provider base URLs.
    pub endpoints: ApiEndpoints,
}

/// Builds the transfer client for one storage kind.
#[async_trait]
pub trait ClientFactory: Send + Sync + fmt::Debug {
    /// Return the kind this factory serves.
    fn kind(&self) -> StorageKind;

    /// Build a client for `storage`. Must not perform network I/O beyond
    /// what the provider SDK does lazily.
    async fn build(
        &self,
        storage: &StorageEntity,
        context: &ClientContext,
    ) -> AppResult<Box<dyn ChunkedTransferClient>>;
}

/// Registry of client factories keyed by storage kind.
#[derive(Debug, Clone, Default)]
pub struct StorageRegistry {
    factories: BTreeMap<StorageKind, Arc<dyn ClientFactory>>,
}

impl StorageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every compiled-in provider.
    pub fn with_defaults() -> AppResult<Self> {
        let mut registry = Self::new();
        #[cfg(feature = "local")]
        {
            use crate::providers::local::LocalFactory;
            registry.register(Arc::new(LocalFactory::new(StorageKind::DefaultLocal)))?;
            registry.register(Arc::new(LocalFactory::new(StorageKind::Local)))?;
        }
        #[cfg(feature = "s3")]
        {
            use crate::providers::s3::S3Factory;
            registry.register(Arc::new(S3Factory::new(StorageKind::S3)))?;
            registry.register(Arc::new(S3Factory::new(StorageKind::S3Compatible)))?;
            registry.register(Arc::new(S3Factory::new(StorageKind::Backblaze)))?;
        }
        #[cfg(feature = "ftp")]
        registry.register(Arc::new(crate::providers::ftp::FtpFactory))?;
        #[cfg(feature = "sftp")]
        registry.register(Arc::new(crate::providers::sftp::SftpFactory))?;
        #[cfg(feature = "oauth-http")]
        {
            registry.register(Arc::new(crate::providers::dropbox::DropboxFactory))?;
            registry.register(Arc::new(crate::providers::gdrive::GDriveFactory))?;
            registry.register(Arc::new(crate::providers::onedrive::OneDriveFactory))?;
        }
        Ok(registry)
    }

    /// Register a factory. Each kind may be registered once.
    pub fn register(&mut self, factory: Arc<dyn ClientFactory>) -> AppResult<()> {
        let kind = factory.kind();
        if self.factories.contains_key(&kind) {
            return Err(AppError::conflict(format!(
                "Storage type {kind} ({}) is already registered",
                kind.code()
            )));
        }
        tracing::debug!(storage_type = %kind, code = kind.code(), "Registered storage type");
        self.factories.insert(kind, factory);
        Ok(())
    }

    /// Check if a kind has a factory.
    pub fn is_registered(&self, kind: StorageKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Registered kinds, in discriminant order.
    pub fn kinds(&self) -> Vec<StorageKind> {
        self.factories.keys().copied().collect()
    }

    /// Resolve the concrete kind of a persisted record from its type code
    /// and raw config, applying the legacy reroutes.
    pub fn resolve(&self, storage_type: i32, config: &Value) -> AppResult<StorageKind> {
        let kind = match config.as_object() {
            Some(fields) if legacy::is_legacy(config) => legacy::resolve_kind(storage_type, fields),
            _ => StorageKind::from_code(storage_type),
        }
        .ok_or_else(|| AppError::validation(format!("Unknown storage type {storage_type}")))?;

        if !self.is_registered(kind) {
            return Err(AppError::configuration(format!(
                "Storage type {kind} is not available in this build"
            )));
        }
        Ok(kind)
    }

    /// Build the client for a storage.
    pub async fn build(
        &self,
        storage: &StorageEntity,
        context: &ClientContext,
    ) -> AppResult<Box<dyn ChunkedTransferClient>> {
        let kind = storage.kind();
        let factory = self.factories.get(&kind).ok_or_else(|| {
            AppError::configuration(format!("Storage type {kind} is not registered"))
        })?;
        factory.build(storage, context).await
    }
}
