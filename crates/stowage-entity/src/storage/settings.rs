//! Per-backend storage settings.
//!
//! [`StorageSettings`] is a tagged union selected by the storage kind. It is
//! persisted as the storage `config` column (JSON, optionally sealed).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::kind::StorageKind;

/// Settings for one configured storage, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageSettings {
    /// The default-local storage. Its folder is the configured backup directory.
    DefaultLocal(DefaultLocalSettings),
    /// Another local directory.
    Local(LocalSettings),
    /// Amazon S3.
    S3(S3Settings),
    /// S3-compatible endpoint.
    S3Compatible(S3Settings),
    /// Backblaze B2.
    Backblaze(S3Settings),
    /// Dropbox.
    Dropbox(DropboxSettings),
    /// Google Drive.
    #[serde(rename = "gdrive")]
    GDrive(GDriveSettings),
    /// OneDrive.
    #[serde(rename = "onedrive")]
    OneDrive(OneDriveSettings),
    /// FTP or FTPS.
    Ftp(FtpSettings),
    /// SFTP.
    Sftp(SftpSettings),
}

impl StorageSettings {
    /// The storage kind these settings belong to.
    pub fn kind(&self) -> StorageKind {
        match self {
            Self::DefaultLocal(_) => StorageKind::DefaultLocal,
            Self::Local(_) => StorageKind::Local,
            Self::S3(_) => StorageKind::S3,
            Self::S3Compatible(_) => StorageKind::S3Compatible,
            Self::Backblaze(_) => StorageKind::Backblaze,
            Self::Dropbox(_) => StorageKind::Dropbox,
            Self::GDrive(_) => StorageKind::GDrive,
            Self::OneDrive(_) => StorageKind::OneDrive,
            Self::Ftp(_) => StorageKind::Ftp,
            Self::Sftp(_) => StorageKind::Sftp,
        }
    }

    /// Retention cap. Zero or negative means unlimited.
    pub fn max_packages(&self) -> i32 {
        match self {
            Self::DefaultLocal(s) => s.max_packages,
            Self::Local(s) => s.max_packages,
            Self::S3(s) | Self::S3Compatible(s) | Self::Backblaze(s) => s.max_packages,
            Self::Dropbox(s) => s.max_packages,
            Self::GDrive(s) => s.max_packages,
            Self::OneDrive(s) => s.max_packages,
            Self::Ftp(s) => s.max_packages,
            Self::Sftp(s) => s.max_packages,
        }
    }

    /// Remote folder packages are written to. `None` for the default-local
    /// storage, whose folder is not configurable.
    pub fn storage_folder(&self) -> Option<&str> {
        match self {
            Self::DefaultLocal(_) => None,
            Self::Local(s) => Some(&s.folder),
            Self::S3(s) | Self::S3Compatible(s) | Self::Backblaze(s) => Some(&s.storage_folder),
            Self::Dropbox(s) => Some(&s.storage_folder),
            Self::GDrive(s) => Some(&s.storage_folder),
            Self::OneDrive(s) => Some(&s.storage_folder),
            Self::Ftp(s) => Some(&s.storage_folder),
            Self::Sftp(s) => Some(&s.storage_folder),
        }
    }

    /// OAuth credentials, for the kinds that use them.
    pub fn oauth_token(&self) -> Option<&OAuthToken> {
        match self {
            Self::Dropbox(s) => Some(&s.token),
            Self::GDrive(s) => Some(&s.token),
            Self::OneDrive(s) => Some(&s.token),
            _ => None,
        }
    }

    /// Replace the OAuth credentials after a refresh. Returns `false` for kinds
    /// without OAuth.
    pub fn set_oauth_token(&mut self, token: OAuthToken) -> bool {
        match self {
            Self::Dropbox(s) => s.token = token,
            Self::GDrive(s) => s.token = token,
            Self::OneDrive(s) => s.token = token,
            _ => return false,
        }
        true
    }

    /// Structural pre-flight check: every required field is present.
    ///
    /// This never touches the network. A storage failing it must not be
    /// used for transfers at all.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        let p = &mut problems;

        match self {
            Self::DefaultLocal(_) => {}
            Self::Local(s) => require(p, &s.folder, "folder"),
            Self::S3(s) => {
                require(p, &s.bucket, "bucket");
                require(p, &s.region, "region");
            }
            Self::S3Compatible(s) | Self::Backblaze(s) => {
                require(p, &s.bucket, "bucket");
                require(p, &s.endpoint, "endpoint");
                require(p, &s.access_key, "access_key");
                require(p, &s.secret_key, "secret_key");
            }
            Self::Dropbox(s) => {
                if s.token.access_token.is_empty() && s.token.refresh_token.is_empty() {
                    p.push("Dropbox is not authorized".to_string());
                }
            }
            Self::GDrive(s) => {
                require(p, &s.token.refresh_token, "refresh_token");
                require(p, &s.client_id, "client_id");
            }
            Self::OneDrive(s) => {
                require(p, &s.token.refresh_token, "refresh_token");
                require(p, &s.client_id, "client_id");
            }
            Self::Ftp(s) => {
                require(p, &s.server, "server");
                require(p, &s.username, "username");
                if s.port == 0 {
                    p.push("port must be non-zero".to_string());
                }
            }
            Self::Sftp(s) => {
                require(p, &s.server, "server");
                require(p, &s.username, "username");
                if s.password.is_empty() && s.private_key.is_empty() {
                    p.push("password or private_key is required".to_string());
                }
                if s.port == 0 {
                    p.push("port must be non-zero".to_string());
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

fn require(problems: &mut Vec<String>, value: &str, field: &str) {
    if value.trim().is_empty() {
        problems.push(format!("{field} is required"));
    }
}

/// OAuth 2.0 credentials held by the HTTP API backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    /// Bearer token sent with API requests.
    #[serde(default)]
    pub access_token: String,
    /// Long-lived token used to mint new access tokens.
    #[serde(default)]
    pub refresh_token: String,
    /// When the access token stops being accepted.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthToken {
    /// Whether the access token is missing or expires within `margin`.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        match self.expires_at {
            Some(at) => at - margin <= Utc::now(),
            None => false,
        }
    }
}

/// Default-local storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultLocalSettings {
    /// Retention cap.
    #[serde(default = "default_max_packages")]
    pub max_packages: i32,
}

impl Default for DefaultLocalSettings {
    fn default() -> Self {
        Self {
            max_packages: default_max_packages(),
        }
    }
}

/// Local directory storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSettings {
    /// Absolute destination directory.
    pub folder: String,
    /// Retention cap.
    #[serde(default = "default_max_packages")]
    pub max_packages: i32,
}

/// Settings shared by the S3 family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct S3Settings {
    /// Bucket name.
    pub bucket: String,
    /// Region. Compatible endpoints usually accept anything.
    #[serde(default = "default_region")]
    pub region: String,
    /// Endpoint URL for non-AWS services.
    #[serde(default)]
    pub endpoint: String,
    /// Access key ID. Empty means the ambient AWS credential chain.
    #[serde(default)]
    pub access_key: String,
    /// Secret access key.
    #[serde(default)]
    pub secret_key: String,
    /// Key prefix packages are written under.
    #[serde(default)]
    pub storage_folder: String,
    /// Storage class for new objects.
    #[serde(default = "default_storage_class")]
    pub storage_class: String,
    /// Use path-style addressing (required by most compatible endpoints).
    #[serde(default)]
    pub force_path_style: bool,
    /// Retention cap.
    #[serde(default = "default_max_packages")]
    pub max_packages: i32,
}

/// Dropbox settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DropboxSettings {
    /// OAuth credentials.
    #[serde(default)]
    pub token: OAuthToken,
    /// Dropbox app key (OAuth client id).
    #[serde(default)]
    pub app_key: String,
    /// Dropbox app secret.
    #[serde(default)]
    pub app_secret: String,
    /// Folder inside the app folder.
    #[serde(default)]
    pub storage_folder: String,
    /// Retention cap.
    #[serde(default = "default_max_packages")]
    pub max_packages: i32,
}

/// Google Drive settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GDriveSettings {
    /// OAuth credentials.
    #[serde(default)]
    pub token: OAuthToken,
    /// OAuth client id.
    #[serde(default)]
    pub client_id: String,
    /// OAuth client secret.
    #[serde(default)]
    pub client_secret: String,
    /// Slash-separated folder path under My Drive.
    #[serde(default)]
    pub storage_folder: String,
    /// Retention cap.
    #[serde(default = "default_max_packages")]
    pub max_packages: i32,
}

/// OneDrive settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OneDriveSettings {
    /// OAuth credentials.
    #[serde(default)]
    pub token: OAuthToken,
    /// Azure application id.
    #[serde(default)]
    pub client_id: String,
    /// Azure application secret.
    #[serde(default)]
    pub client_secret: String,
    /// Folder path under the drive root.
    #[serde(default)]
    pub storage_folder: String,
    /// OneDrive for Business account. Hash lookups on these may 404.
    #[serde(default)]
    pub is_business: bool,
    /// Retention cap.
    #[serde(default = "default_max_packages")]
    pub max_packages: i32,
}

/// FTP / FTPS settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FtpSettings {
    /// Host name or address.
    pub server: String,
    /// Control port.
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    /// Login name.
    pub username: String,
    /// Login password.
    #[serde(default)]
    pub password: String,
    /// Remote directory.
    #[serde(default)]
    pub storage_folder: String,
    /// Passive mode data connections.
    #[serde(default = "default_true")]
    pub passive: bool,
    /// Explicit FTPS (AUTH TLS).
    #[serde(default)]
    pub use_ftps: bool,
    /// Socket read/write timeout.
    #[serde(default = "default_ftp_timeout")]
    pub timeout_seconds: u64,
    /// Retention cap.
    #[serde(default = "default_max_packages")]
    pub max_packages: i32,
}

/// SFTP settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftpSettings {
    /// Host name or address.
    pub server: String,
    /// SSH port.
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    /// Login name.
    pub username: String,
    /// Password authentication.
    #[serde(default)]
    pub password: String,
    /// PEM private key for public-key authentication.
    #[serde(default)]
    pub private_key: String,
    /// Passphrase of the private key.
    #[serde(default)]
    pub private_key_password: String,
    /// Remote directory.
    #[serde(default)]
    pub storage_folder: String,
    /// Wall-clock limit for one chunk loop, independent of the worker slice.
    #[serde(default = "default_sftp_timeout")]
    pub timeout_seconds: u64,
    /// Retention cap.
    #[serde(default = "default_max_packages")]
    pub max_packages: i32,
}

fn default_max_packages() -> i32 {
    10
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_storage_class() -> String {
    "STANDARD".to_string()
}

fn default_ftp_port() -> u16 {
    21
}

fn default_sftp_port() -> u16 {
    22
}

fn default_ftp_timeout() -> u64 {
    15
}

fn default_sftp_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_json_shape() {
        let json = r#"{"kind":"ftp","server":"ftp.example.com","username":"bob"}"#;
        let settings: StorageSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.kind(), StorageKind::Ftp);
        match &settings {
            StorageSettings::Ftp(ftp) => {
                assert_eq!(ftp.port, 21);
                assert!(ftp.passive);
                assert_eq!(ftp.max_packages, 10);
            }
            other => panic!("unexpected variant {other:?}"),
        }
        let back = serde_json::to_value(&settings).unwrap();
        assert_eq!(back["kind"], "ftp");
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        let settings = StorageSettings::S3Compatible(S3Settings {
            bucket: "b".into(),
            ..S3Settings::default()
        });
        let problems = settings.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("endpoint")));
        assert!(problems.iter().any(|p| p.contains("access_key")));

        let aws = StorageSettings::S3(S3Settings {
            bucket: "b".into(),
            region: "eu-west-1".into(),
            ..S3Settings::default()
        });
        assert!(aws.validate().is_ok());
    }

    #[test]
    fn test_sftp_needs_some_credential() {
        let settings = StorageSettings::Sftp(SftpSettings {
            server: "h".into(),
            port: 22,
            username: "u".into(),
            password: String::new(),
            private_key: String::new(),
            private_key_password: String::new(),
            storage_folder: String::new(),
            timeout_seconds: 60,
            max_packages: 3,
        });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_token_refresh_margin() {
        let token = OAuthToken {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: Some(Utc::now() + Duration::seconds(30)),
        };
        assert!(token.needs_refresh(Duration::seconds(60)));
        assert!(!token.needs_refresh(Duration::seconds(5)));
        assert!(OAuthToken::default().needs_refresh(Duration::zero()));
    }

    #[test]
    fn test_set_oauth_token_only_on_oauth_kinds() {
        let mut dropbox = StorageSettings::Dropbox(DropboxSettings::default());
        let token = OAuthToken {
            access_token: "new".into(),
            ..OAuthToken::default()
        };
        assert!(dropbox.set_oauth_token(token.clone()));
        assert_eq!(dropbox.oauth_token(), Some(&token));

        let mut local = StorageSettings::DefaultLocal(DefaultLocalSettings::default());
        assert!(!local.set_oauth_token(token));
    }
}
