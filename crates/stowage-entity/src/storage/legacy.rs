//! Migration of pre-refactor flat storage records.
//!
//! Old records stored every backend's fields side by side in one flat map
//! (`ftp_server`, `s3_bucket`, `dropbox_access_token`, ...) with no `kind`
//! tag. They are converted once, at load time, into [`StorageSettings`];
//! the repository then re-saves the migrated record.

use chrono::{TimeZone, Utc};
use serde_json::{Map, Value};

use stowage_core::{AppError, AppResult};

use super::kind::{LEGACY_ONEDRIVE_CODE, StorageKind};
use super::settings::{
    DefaultLocalSettings, DropboxSettings, FtpSettings, GDriveSettings, LocalSettings, OAuthToken,
    OneDriveSettings, S3Settings, SftpSettings, StorageSettings,
};

/// Whether a stored config value predates the tagged layout.
pub fn is_legacy(config: &Value) -> bool {
    match config {
        Value::Object(map) => !map.contains_key("kind"),
        _ => false,
    }
}

/// Decide which kind a legacy record becomes.
///
/// The S3 code used to cover every S3-speaking service, told apart only by
/// the `s3_provider` field; those records move to the more specific kinds.
/// The pre-Graph OneDrive code moves to [`StorageKind::OneDrive`].
pub fn resolve_kind(storage_type: i32, fields: &Map<String, Value>) -> Option<StorageKind> {
    if storage_type == LEGACY_ONEDRIVE_CODE {
        return Some(StorageKind::OneDrive);
    }

    let kind = StorageKind::from_code(storage_type)?;
    if kind == StorageKind::S3 {
        return Some(match str_field(fields, "s3_provider").to_lowercase().as_str() {
            "other" => StorageKind::S3Compatible,
            "backblaze" => StorageKind::Backblaze,
            _ => StorageKind::S3,
        });
    }
    Some(kind)
}

/// Convert a legacy flat record into tagged settings.
pub fn migrate(storage_type: i32, config: &Value) -> AppResult<StorageSettings> {
    let fields = config.as_object().ok_or_else(|| {
        AppError::validation(format!(
            "Legacy storage config for type {storage_type} is not an object"
        ))
    })?;

    let kind = resolve_kind(storage_type, fields).ok_or_else(|| {
        AppError::validation(format!("Unknown legacy storage type {storage_type}"))
    })?;

    let settings = match kind {
        StorageKind::DefaultLocal => StorageSettings::DefaultLocal(DefaultLocalSettings {
            max_packages: max_files(fields, "local_max_files"),
        }),
        StorageKind::Local => StorageSettings::Local(LocalSettings {
            folder: str_field(fields, "local_storage_folder"),
            max_packages: max_files(fields, "local_max_files"),
        }),
        StorageKind::S3 => StorageSettings::S3(s3_settings(fields, false)),
        StorageKind::S3Compatible => StorageSettings::S3Compatible(s3_settings(fields, true)),
        StorageKind::Backblaze => StorageSettings::Backblaze(s3_settings(fields, true)),
        StorageKind::Dropbox => StorageSettings::Dropbox(DropboxSettings {
            token: token(fields, "dropbox"),
            app_key: str_field(fields, "dropbox_app_key"),
            app_secret: str_field(fields, "dropbox_app_secret"),
            storage_folder: str_field(fields, "dropbox_storage_folder"),
            max_packages: max_files(fields, "dropbox_max_files"),
        }),
        StorageKind::GDrive => StorageSettings::GDrive(GDriveSettings {
            token: token(fields, "gdrive"),
            client_id: str_field(fields, "gdrive_client_id"),
            client_secret: str_field(fields, "gdrive_client_secret"),
            storage_folder: str_field(fields, "gdrive_storage_folder"),
            max_packages: max_files(fields, "gdrive_max_files"),
        }),
        StorageKind::OneDrive => StorageSettings::OneDrive(OneDriveSettings {
            token: token(fields, "onedrive"),
            client_id: str_field(fields, "onedrive_client_id"),
            client_secret: str_field(fields, "onedrive_client_secret"),
            storage_folder: str_field(fields, "onedrive_storage_folder"),
            is_business: bool_field(fields, "onedrive_is_business", false),
            max_packages: max_files(fields, "onedrive_max_files"),
        }),
        StorageKind::Ftp => StorageSettings::Ftp(FtpSettings {
            server: str_field(fields, "ftp_server"),
            port: port_field(fields, "ftp_port", 21),
            username: str_field(fields, "ftp_username"),
            password: str_field(fields, "ftp_password"),
            storage_folder: str_field(fields, "ftp_storage_folder"),
            passive: bool_field(fields, "ftp_passive_mode", true),
            use_ftps: bool_field(fields, "ftp_ssl", false),
            timeout_seconds: int_field(fields, "ftp_timeout_in_secs").unwrap_or(15).max(1) as u64,
            max_packages: max_files(fields, "ftp_max_files"),
        }),
        StorageKind::Sftp => StorageSettings::Sftp(SftpSettings {
            server: str_field(fields, "sftp_server"),
            port: port_field(fields, "sftp_port", 22),
            username: str_field(fields, "sftp_username"),
            password: str_field(fields, "sftp_password"),
            private_key: str_field(fields, "sftp_private_key"),
            private_key_password: str_field(fields, "sftp_private_key_password"),
            storage_folder: str_field(fields, "sftp_storage_folder"),
            timeout_seconds: int_field(fields, "sftp_timeout_in_secs").unwrap_or(60).max(1) as u64,
            max_packages: max_files(fields, "sftp_max_files"),
        }),
    };

    Ok(settings)
}

fn s3_settings(fields: &Map<String, Value>, path_style: bool) -> S3Settings {
    let region = str_field(fields, "s3_region");
    S3Settings {
        bucket: str_field(fields, "s3_bucket"),
        region: if region.is_empty() {
            "us-east-1".to_string()
        } else {
            region
        },
        endpoint: str_field(fields, "s3_endpoint"),
        access_key: str_field(fields, "s3_access_key"),
        secret_key: str_field(fields, "s3_secret_key"),
        storage_folder: str_field(fields, "s3_storage_folder"),
        storage_class: {
            let class = str_field(fields, "s3_storage_class");
            if class.is_empty() {
                "STANDARD".to_string()
            } else {
                class
            }
        },
        force_path_style: path_style,
        max_packages: max_files(fields, "s3_max_files"),
    }
}

fn token(fields: &Map<String, Value>, prefix: &str) -> OAuthToken {
    let expires_at = int_field(fields, &format!("{prefix}_access_token_expires"))
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single());
    OAuthToken {
        access_token: str_field(fields, &format!("{prefix}_access_token")),
        refresh_token: str_field(fields, &format!("{prefix}_refresh_token")),
        expires_at,
    }
}

fn str_field(fields: &Map<String, Value>, key: &str) -> String {
    match fields.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn int_field(fields: &Map<String, Value>, key: &str) -> Option<i64> {
    match fields.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn bool_field(fields: &Map<String, Value>, key: &str, default: bool) -> bool {
    match fields.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => matches!(s.trim(), "1" | "true" | "on" | "yes"),
        _ => default,
    }
}

fn port_field(fields: &Map<String, Value>, key: &str, default: u16) -> u16 {
    int_field(fields, key)
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0)
        .unwrap_or(default)
}

fn max_files(fields: &Map<String, Value>, key: &str) -> i32 {
    int_field(fields, key)
        .and_then(|n| i32::try_from(n).ok())
        .unwrap_or(10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tagged_config_is_not_legacy() {
        assert!(!is_legacy(&json!({"kind": "local", "folder": "/x"})));
        assert!(is_legacy(&json!({"local_storage_folder": "/x"})));
    }

    #[test]
    fn test_s3_provider_reroutes_to_specific_kind() {
        let other = json!({
            "s3_provider": "other",
            "s3_bucket": "packages",
            "s3_endpoint": "https://minio.local",
            "s3_access_key": "ak",
            "s3_secret_key": "sk",
            "s3_max_files": "4"
        });
        let settings = migrate(4, &other).unwrap();
        assert_eq!(settings.kind(), StorageKind::S3Compatible);
        assert_eq!(settings.max_packages(), 4);
        match settings {
            StorageSettings::S3Compatible(s3) => assert!(s3.force_path_style),
            other => panic!("unexpected {other:?}"),
        }

        let b2 = json!({"s3_provider": "Backblaze", "s3_bucket": "b"});
        assert_eq!(migrate(4, &b2).unwrap().kind(), StorageKind::Backblaze);

        let aws = json!({"s3_provider": "amazon", "s3_bucket": "b"});
        assert_eq!(migrate(4, &aws).unwrap().kind(), StorageKind::S3);
    }

    #[test]
    fn test_legacy_onedrive_code_migrates() {
        let record = json!({
            "onedrive_refresh_token": "r",
            "onedrive_storage_folder": "Backups",
            "onedrive_is_business": 1
        });
        match migrate(LEGACY_ONEDRIVE_CODE, &record).unwrap() {
            StorageSettings::OneDrive(od) => {
                assert!(od.is_business);
                assert_eq!(od.token.refresh_token, "r");
                assert_eq!(od.storage_folder, "Backups");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ftp_fields_and_defaults() {
        let record = json!({
            "ftp_server": "ftp.example.com",
            "ftp_port": "0",
            "ftp_username": "u",
            "ftp_passive_mode": "0",
            "ftp_ssl": true
        });
        match migrate(2, &record).unwrap() {
            StorageSettings::Ftp(ftp) => {
                assert_eq!(ftp.port, 21);
                assert!(!ftp.passive);
                assert!(ftp.use_ftps);
                assert_eq!(ftp.max_packages, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(migrate(42, &json!({})).is_err());
        assert!(migrate(2, &json!("flat")).is_err());
    }
}
