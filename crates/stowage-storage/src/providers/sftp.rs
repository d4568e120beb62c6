//! SFTP client over libssh2.
//!
//! libssh2 is blocking, so every operation runs on the blocking pool with
//! the connection moved in and back out. The remote file size is the
//! offset oracle. The chunk loop enforces its own wall clock, bounded by
//! both the storage timeout and the worker slice, and reports a timeout
//! when it runs out.

use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::DateTime;
use ssh2::{ErrorCode, OpenFlags, OpenType, Session, Sftp};

use stowage_core::error::AppError;
use stowage_core::result::AppResult;
use stowage_entity::package::ResumeToken;
use stowage_entity::storage::{SftpSettings, StorageEntity, StorageKind, StorageSettings};

use crate::client::{
    ChunkProgress, ChunkRequest, ChunkedTransferClient, RemoteObject, TransferError,
    TransferResult, join_remote,
};
use crate::registry::{ClientContext, ClientFactory};

/// Size of one write inside the chunk loop.
const WRITE_BLOCK: usize = 32 * 1024;

/// libssh2 error codes.
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;

struct SftpConn {
    session: Session,
    sftp: Sftp,
}

/// SFTP transfer client.
pub struct SftpClient {
    settings: SftpSettings,
    chunk_size: u64,
    conn: Option<SftpConn>,
}

impl std::fmt::Debug for SftpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpClient")
            .field("server", &self.settings.server)
            .field("folder", &self.settings.storage_folder)
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

fn ssh_error(context: &str, err: ssh2::Error) -> TransferError {
    let message = format!("SFTP {context}: {err}");
    match err.code() {
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
        | ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED)
        | ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => TransferError::fatal(message),
        _ => TransferError::recoverable(message),
    }
}

fn is_missing(err: &ssh2::Error) -> bool {
    err.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE)
}

impl SftpClient {
    /// Create a client; the connection opens on first use.
    pub fn new(settings: SftpSettings, chunk_size: u64) -> Self {
        Self {
            settings,
            chunk_size: chunk_size.max(1),
            conn: None,
        }
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_seconds.max(1))
    }

    fn remote_path(&self, name: &str) -> PathBuf {
        PathBuf::from(join_remote(&self.settings.storage_folder, name))
    }

    fn connect(settings: &SftpSettings, timeout: Duration) -> TransferResult<SftpConn> {
        let addr = (settings.server.as_str(), settings.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransferError::fatal(format!("Cannot resolve {}", settings.server)))?;
        let tcp = TcpStream::connect_timeout(&addr, timeout)?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        let mut session = Session::new().map_err(|e| ssh_error("session", e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake().map_err(|e| ssh_error("handshake", e))?;

        if settings.private_key.is_empty() {
            session
                .userauth_password(&settings.username, &settings.password)
                .map_err(|e| ssh_error("password authentication", e))?;
        } else {
            let passphrase =
                (!settings.private_key_password.is_empty()).then_some(settings.private_key_password.as_str());
            session
                .userauth_pubkey_memory(&settings.username, None, &settings.private_key, passphrase)
                .map_err(|e| ssh_error("key authentication", e))?;
        }
        if !session.authenticated() {
            return Err(TransferError::fatal("SFTP authentication was rejected"));
        }

        let sftp = session.sftp().map_err(|e| ssh_error("subsystem", e))?;
        make_dirs(&sftp, &settings.storage_folder)?;
        tracing::debug!(server = %settings.server, folder = %settings.storage_folder, "SFTP session ready");
        Ok(SftpConn { session, sftp })
    }

    /// Run `op` on the blocking pool with the connection, reconnecting if
    /// needed. A connection that saw a recoverable error is dropped.
    async fn run<T, F>(&mut self, op: F) -> TransferResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SftpConn) -> TransferResult<T> + Send + 'static,
    {
        let existing = self.conn.take();
        let settings = self.settings.clone();
        let timeout = self.op_timeout();
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let conn = match existing {
                Some(conn) => conn,
                None => match Self::connect(&settings, timeout) {
                    Ok(conn) => conn,
                    Err(e) => return (None, Err(e)),
                },
            };
            let result = op(&conn);
            (Some(conn), result)
        })
        .await
        .map_err(|e| TransferError::recoverable(format!("SFTP worker panicked: {e}")))?;

        if !matches!(result, Err(TransferError::Recoverable(_))) {
            self.conn = conn;
        }
        result
    }
}

fn make_dirs(sftp: &Sftp, folder: &str) -> TransferResult<()> {
    let mut path = if folder.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    for segment in folder.split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
        match sftp.stat(&path) {
            Ok(stat) if stat.is_dir() => continue,
            Ok(_) => {
                return Err(TransferError::fatal(format!(
                    "{} exists and is not a directory",
                    path.display()
                )));
            }
            Err(_) => sftp
                .mkdir(&path, 0o755)
                .map_err(|e| ssh_error("mkdir", e))?,
        }
    }
    Ok(())
}

fn remote_size(sftp: &Sftp, path: &Path) -> TransferResult<Option<u64>> {
    match sftp.stat(path) {
        Ok(stat) => Ok(stat.size),
        Err(e) if is_missing(&e) => Ok(None),
        Err(e) => Err(ssh_error("stat", e)),
    }
}

/// Write up to `max` bytes of `source` from `start`, stopping at `wall`.
fn write_range(
    sftp: &Sftp,
    source: &Path,
    remote: &Path,
    start: u64,
    max: u64,
    wall: Instant,
) -> TransferResult<u64> {
    let mut flags = OpenFlags::WRITE | OpenFlags::CREATE;
    if start == 0 {
        flags |= OpenFlags::TRUNCATE;
    }
    let mut file = sftp
        .open_mode(remote, flags, 0o644, OpenType::File)
        .map_err(|e| ssh_error("open", e))?;
    file.seek(SeekFrom::Start(start))?;

    let mut local = std::fs::File::open(source)?;
    local.seek(SeekFrom::Start(start))?;
    let mut reader = local.take(max);
    let mut buf = vec![0u8; WRITE_BLOCK];
    let mut written = 0u64;
    loop {
        if Instant::now() >= wall {
            return Err(TransferError::timeout(format!(
                "SFTP chunk stopped after {written} bytes"
            )));
        }
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        written += n as u64;
    }
    file.flush()?;
    Ok(written)
}

#[async_trait]
impl ChunkedTransferClient for SftpClient {
    fn kind(&self) -> StorageKind {
        StorageKind::Sftp
    }

    async fn upload_whole(&mut self, source: &Path, dest: &str) -> TransferResult<()> {
        let source = source.to_path_buf();
        let remote = self.remote_path(dest);
        let wall = Instant::now() + self.op_timeout();
        self.run(move |conn| {
            write_range(&conn.sftp, &source, &remote, 0, u64::MAX, wall).map(|_| ())
        })
        .await
    }

    async fn upload_chunk(&mut self, request: ChunkRequest<'_>) -> TransferResult<ChunkProgress> {
        let remaining = request.remaining();
        if remaining.is_zero() {
            return Err(TransferError::timeout("No time left for an SFTP chunk"));
        }
        let wall = Instant::now() + remaining.min(self.op_timeout());
        let source = request.source.to_path_buf();
        let remote = self.remote_path(request.dest);
        let file_size = request.file_size;
        let chunk_size = self.chunk_size;

        let next = self
            .run(move |conn| {
                // Resume from whatever the server already holds.
                let start = match remote_size(&conn.sftp, &remote)? {
                    Some(size) if size <= file_size => size,
                    _ => 0,
                };
                let max = chunk_size.min(file_size - start);
                let written = write_range(&conn.sftp, &source, &remote, start, max, wall)?;
                Ok(start + written)
            })
            .await?;

        if !request.throttle.is_zero() {
            tokio::time::sleep(request.throttle).await;
        }
        if next >= file_size {
            return Ok(ChunkProgress::finished(file_size));
        }
        Ok(ChunkProgress::partial(next, ResumeToken::None))
    }

    async fn recover_offset(
        &mut self,
        dest: &str,
        file_size: u64,
        _token: &ResumeToken,
    ) -> TransferResult<ChunkProgress> {
        let remote = self.remote_path(dest);
        let size = self.run(move |conn| remote_size(&conn.sftp, &remote)).await?;
        Ok(match size {
            Some(size) if size == file_size => ChunkProgress::finished(file_size),
            Some(size) if size < file_size => ChunkProgress::partial(size, ResumeToken::None),
            _ => ChunkProgress::partial(0, ResumeToken::None),
        })
    }

    async fn abort(&mut self, dest: &str, _token: &ResumeToken) -> TransferResult<()> {
        self.delete(dest).await.map(|_| ())
    }

    async fn delete(&mut self, name: &str) -> TransferResult<bool> {
        let remote = self.remote_path(name);
        self.run(move |conn| match conn.sftp.unlink(&remote) {
            Ok(()) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(ssh_error("unlink", e)),
        })
        .await
    }

    async fn list_objects(&mut self) -> TransferResult<Vec<RemoteObject>> {
        let folder = if self.settings.storage_folder.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&self.settings.storage_folder)
        };
        self.run(move |conn| {
            let entries = conn
                .sftp
                .readdir(&folder)
                .map_err(|e| ssh_error("readdir", e))?;
            Ok(entries
                .into_iter()
                .filter(|(_, stat)| stat.is_file())
                .filter_map(|(path, stat)| {
                    let name = path.file_name()?.to_str()?.to_string();
                    Some(RemoteObject {
                        name,
                        size: stat.size.unwrap_or(0),
                        modified: stat
                            .mtime
                            .and_then(|t| DateTime::from_timestamp(t as i64, 0)),
                    })
                })
                .collect())
        })
        .await
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = conn.session.disconnect(None, "closing", None);
            })
            .await;
        }
    }
}

/// Factory for SFTP storages.
#[derive(Debug, Clone, Copy)]
pub struct SftpFactory;

#[async_trait]
impl ClientFactory for SftpFactory {
    fn kind(&self) -> StorageKind {
        StorageKind::Sftp
    }

    async fn build(
        &self,
        storage: &StorageEntity,
        context: &ClientContext,
    ) -> AppResult<Box<dyn ChunkedTransferClient>> {
        match &storage.settings {
            StorageSettings::Sftp(settings) => Ok(Box::new(SftpClient::new(
                settings.clone(),
                context.transfer.sftp_chunk_size_bytes,
            ))),
            other => Err(AppError::validation(format!(
                "SFTP factory cannot build a {} storage",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(folder: &str) -> SftpSettings {
        SftpSettings {
            server: "example.invalid".into(),
            port: 22,
            username: "backup".into(),
            password: "pw".into(),
            private_key: String::new(),
            private_key_password: String::new(),
            storage_folder: folder.into(),
            timeout_seconds: 30,
            max_packages: 5,
        }
    }

    #[test]
    fn remote_paths_join_folder() {
        let client = SftpClient::new(settings("/var/backups/"), 1024);
        assert_eq!(
            client.remote_path("a_archive.zip"),
            PathBuf::from("/var/backups/a_archive.zip")
        );
        let bare = SftpClient::new(settings(""), 1024);
        assert_eq!(bare.remote_path("a.zip"), PathBuf::from("a.zip"));
    }

    #[tokio::test]
    async fn test_expired_slice_is_a_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.zip");
        tokio::fs::write(&source, b"data").await.unwrap();

        let mut client = SftpClient::new(settings("/b"), 1024);
        let err = client
            .upload_chunk(ChunkRequest {
                source: &source,
                dest: "a.zip",
                file_size: 4,
                offset: 0,
                token: ResumeToken::None,
                deadline: tokio::time::Instant::now(),
                throttle: Duration::ZERO,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout(_)));
    }

    #[test]
    fn auth_failures_are_fatal() {
        let err = ssh2::Error::new(
            ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED),
            "denied",
        );
        assert!(ssh_error("auth", err).is_fatal());
        let err = ssh2::Error::new(ErrorCode::Session(-43), "socket");
        assert!(!ssh_error("send", err).is_fatal());
    }
}
