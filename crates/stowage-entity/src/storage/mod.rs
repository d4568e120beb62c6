//! Storage domain entities.

pub mod kind;
pub mod legacy;
pub mod model;
pub mod settings;

pub use kind::StorageKind;
pub use model::{NewStorage, StorageEntity};
pub use settings::{
    DefaultLocalSettings, DropboxSettings, FtpSettings, GDriveSettings, LocalSettings,
    OAuthToken, OneDriveSettings, S3Settings, SftpSettings, StorageSettings,
};
