//! Protocol clients, one per provider.

pub mod digest;

#[cfg(feature = "local")]
pub mod local;

#[cfg(feature = "s3")]
pub mod s3;

#[cfg(feature = "ftp")]
pub mod ftp;

#[cfg(feature = "sftp")]
pub mod sftp;

#[cfg(feature = "oauth-http")]
pub mod http;

#[cfg(feature = "oauth-http")]
pub mod oauth;

#[cfg(feature = "oauth-http")]
pub mod dropbox;

#[cfg(feature = "oauth-http")]
pub mod gdrive;

#[cfg(feature = "oauth-http")]
pub mod onedrive;
