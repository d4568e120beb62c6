//! FTP and FTPS client.
//!
//! FTP has no upload session. The remote file's size (`SIZE`) is the
//! offset oracle and each chunk is appended with `APPE`, or with
//! `REST` + `STOR` on servers that lack `APPE`.

mod control;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use stowage_core::error::AppError;
use stowage_core::result::AppResult;
use stowage_entity::package::ResumeToken;
use stowage_entity::storage::{FtpSettings, StorageEntity, StorageKind, StorageSettings};

use self::control::{BoxedStream, Control, DataChannel, reply_error};
use crate::chunked::read_range;
use crate::client::{
    ChunkProgress, ChunkRequest, ChunkedTransferClient, RemoteObject, TransferError,
    TransferResult,
};
use crate::registry::{ClientContext, ClientFactory};

/// FTP transfer client. Holds one control connection per invocation.
#[derive(Debug)]
pub struct FtpClient {
    settings: FtpSettings,
    chunk_size: u64,
    verify_tls: bool,
    control: Option<Control>,
}

/// How a chunk is written at a non-zero offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppendMode {
    Appe,
    RestStor,
}

impl FtpClient {
    /// Create a client; the connection opens on first use.
    pub fn new(settings: FtpSettings, chunk_size: u64, verify_tls: bool) -> Self {
        Self {
            settings,
            chunk_size: chunk_size.max(1),
            verify_tls,
            control: None,
        }
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_seconds.max(1))
    }

    /// The logged-in control connection, positioned in the storage folder.
    async fn control(&mut self) -> TransferResult<&mut Control> {
        if self.control.is_none() {
            let control = self.login().await?;
            self.control = Some(control);
        }
        self.control
            .as_mut()
            .ok_or_else(|| TransferError::recoverable("FTP connection unavailable"))
    }

    async fn login(&self) -> TransferResult<Control> {
        let mut control =
            Control::connect(&self.settings.server, self.settings.port, self.op_timeout()).await?;
        if self.settings.use_ftps {
            control.upgrade_tls(self.verify_tls).await?;
        }

        let user = control
            .command(&format!("USER {}", self.settings.username))
            .await?;
        match user.code {
            230 => {}
            331 | 332 => {
                control
                    .expect(&format!("PASS {}", self.settings.password), &[230, 202])
                    .await?;
            }
            _ => return Err(reply_error("USER", &user)),
        }
        control.expect("TYPE I", &[200]).await?;
        enter_folder(&mut control, &self.settings.storage_folder).await?;
        tracing::debug!(
            server = %self.settings.server,
            folder = %self.settings.storage_folder,
            tls = self.settings.use_ftps,
            "FTP session ready"
        );
        Ok(control)
    }

    /// Size of a remote file, or `None` if it does not exist.
    async fn remote_size(&mut self, name: &str) -> TransferResult<Option<u64>> {
        let control = self.control().await?;
        let reply = control.command(&format!("SIZE {name}")).await?;
        match reply.code {
            213 => Ok(reply.text.trim().parse().ok()),
            550 => Ok(None),
            _ => Err(reply_error("SIZE", &reply)),
        }
    }

    /// Send `data` with `command` (`STOR` or `APPE`).
    async fn store(&mut self, command: &str, data: &[u8]) -> TransferResult<()> {
        let passive = self.settings.passive;
        let control = self.control().await?;
        let channel = control.data_channel(passive).await?;
        let reply = control.command(command).await?;
        if reply.code != 125 && reply.code != 150 {
            return Err(reply_error(command, &reply));
        }
        let mut stream = control.open_data(channel).await?;
        let timeout = control.timeout();
        write_all(&mut stream, data, timeout).await?;
        drop(stream);
        let done = control.read_reply().await?;
        if !done.is_complete() {
            return Err(reply_error(command, &done));
        }
        Ok(())
    }

    /// Append `data` at `offset`, trying `APPE` first.
    async fn append(&mut self, name: &str, offset: u64, data: &[u8]) -> TransferResult<AppendMode> {
        match self.store(&format!("APPE {name}"), data).await {
            Ok(()) => return Ok(AppendMode::Appe),
            Err(TransferError::Recoverable(message)) if is_not_implemented(&message) => {
                tracing::debug!("FTP server lacks APPE, falling back to REST");
            }
            Err(e) => return Err(e),
        }

        let control = self.control().await?;
        let rest = control.command(&format!("REST {offset}")).await?;
        if rest.code != 350 {
            return Err(TransferError::fatal(format!(
                "FTP server supports neither APPE nor REST ({} {})",
                rest.code, rest.text
            )));
        }
        self.store(&format!("STOR {name}"), data).await?;
        Ok(AppendMode::RestStor)
    }

    /// Write the next chunk after what the server holds. Returns where it
    /// started and how long it was.
    async fn send_chunk(&mut self, request: &ChunkRequest<'_>) -> TransferResult<(u64, u64)> {
        let start = if request.offset == 0 {
            0
        } else {
            match self.remote_size(request.dest).await? {
                Some(size) if size <= request.file_size => size,
                _ => 0,
            }
        };
        let len = self.chunk_size.min(request.file_size - start);
        let data = read_range(request.source, start, len).await?;

        if start == 0 {
            self.store(&format!("STOR {}", request.dest), &data).await?;
        } else {
            self.append(request.dest, start, &data).await?;
        }
        Ok((start, len))
    }

    async fn modified(&mut self, name: &str) -> TransferResult<Option<DateTime<Utc>>> {
        let control = self.control().await?;
        let reply = control.command(&format!("MDTM {name}")).await?;
        if reply.code != 213 {
            return Ok(None);
        }
        Ok(parse_mdtm(&reply.text))
    }
}

async fn enter_folder(control: &mut Control, folder: &str) -> TransferResult<()> {
    if folder.starts_with('/') {
        control.expect("CWD /", &[250, 200]).await?;
    }
    for segment in folder.split('/').filter(|s| !s.is_empty()) {
        let reply = control.command(&format!("CWD {segment}")).await?;
        if reply.is_complete() {
            continue;
        }
        let made = control.command(&format!("MKD {segment}")).await?;
        if made.code != 257 && made.code != 550 && made.code != 521 {
            return Err(reply_error("MKD", &made));
        }
        control.expect(&format!("CWD {segment}"), &[250, 200]).await?;
    }
    Ok(())
}

async fn write_all(stream: &mut BoxedStream, data: &[u8], timeout: Duration) -> TransferResult<()> {
    tokio::time::timeout(timeout, async {
        stream.write_all(data).await?;
        stream.shutdown().await
    })
    .await
    .map_err(|_| TransferError::recoverable("FTP data transfer timed out"))??;
    Ok(())
}

fn is_not_implemented(message: &str) -> bool {
    [" 500 ", " 502 ", " 504 "].iter().any(|code| message.contains(code))
}

/// `YYYYMMDDHHMMSS[.sss]` from an `MDTM` reply.
fn parse_mdtm(text: &str) -> Option<DateTime<Utc>> {
    let stamp = text.trim().get(..14)?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
        .ok()
        .map(|t| t.and_utc())
}

#[async_trait]
impl ChunkedTransferClient for FtpClient {
    fn kind(&self) -> StorageKind {
        StorageKind::Ftp
    }

    async fn upload_whole(&mut self, source: &Path, dest: &str) -> TransferResult<()> {
        let data = tokio::fs::read(source).await?;
        self.store(&format!("STOR {dest}"), &data).await
    }

    async fn upload_chunk(&mut self, request: ChunkRequest<'_>) -> TransferResult<ChunkProgress> {
        if request.remaining().is_zero() {
            return Err(TransferError::timeout("No time left for an FTP chunk"));
        }

        let slice = request.remaining();
        let sent = tokio::time::timeout(slice, self.send_chunk(&request)).await;
        let (start, len) = match sent {
            Ok(sent) => sent?,
            Err(_) => {
                // The data transfer's reply is still owed on this connection.
                self.control = None;
                return Err(TransferError::timeout("FTP chunk ran past the time slice"));
            }
        };

        let next = start + len;
        if !request.throttle.is_zero() {
            tokio::time::sleep(request.throttle).await;
        }
        if next >= request.file_size {
            return Ok(ChunkProgress::finished(request.file_size));
        }
        Ok(ChunkProgress::partial(next, ResumeToken::None))
    }

    async fn recover_offset(
        &mut self,
        dest: &str,
        file_size: u64,
        _token: &ResumeToken,
    ) -> TransferResult<ChunkProgress> {
        // A broken data transfer can leave the control connection unusable.
        self.control = None;
        Ok(match self.remote_size(dest).await? {
            Some(size) if size == file_size => ChunkProgress::finished(file_size),
            Some(size) if size < file_size => ChunkProgress::partial(size, ResumeToken::None),
            _ => ChunkProgress::partial(0, ResumeToken::None),
        })
    }

    async fn abort(&mut self, dest: &str, _token: &ResumeToken) -> TransferResult<()> {
        self.delete(dest).await.map(|_| ())
    }

    async fn delete(&mut self, name: &str) -> TransferResult<bool> {
        let control = self.control().await?;
        let reply = control.command(&format!("DELE {name}")).await?;
        match reply.code {
            250 | 200 => Ok(true),
            550 => Ok(false),
            _ => Err(reply_error("DELE", &reply)),
        }
    }

    async fn list_objects(&mut self) -> TransferResult<Vec<RemoteObject>> {
        let passive = self.settings.passive;
        let control = self.control().await?;
        let channel = control.data_channel(passive).await?;
        let reply = control.command("NLST").await?;
        let names = match reply.code {
            125 | 150 => {
                let mut stream = control.open_data(channel).await?;
                let mut listing = String::new();
                tokio::time::timeout(control.timeout(), stream.read_to_string(&mut listing))
                    .await
                    .map_err(|_| TransferError::recoverable("FTP listing timed out"))??;
                drop(stream);
                let done = control.read_reply().await?;
                if !done.is_complete() {
                    return Err(reply_error("NLST", &done));
                }
                listing
            }
            // Empty directory.
            450 | 550 => String::new(),
            _ => return Err(reply_error("NLST", &reply)),
        };

        let mut objects = Vec::new();
        for line in names.lines() {
            let name = line.trim().rsplit('/').next().unwrap_or_default().to_string();
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            // Directories have no size.
            let Some(size) = self.remote_size(&name).await? else {
                continue;
            };
            let modified = self.modified(&name).await?;
            objects.push(RemoteObject {
                name,
                size,
                modified,
            });
        }
        Ok(objects)
    }

    async fn close(&mut self) {
        if let Some(mut control) = self.control.take() {
            let _ = control.command("QUIT").await;
        }
    }
}

/// Factory for FTP storages.
#[derive(Debug, Clone, Copy)]
pub struct FtpFactory;

#[async_trait]
impl ClientFactory for FtpFactory {
    fn kind(&self) -> StorageKind {
        StorageKind::Ftp
    }

    async fn build(
        &self,
        storage: &StorageEntity,
        context: &ClientContext,
    ) -> AppResult<Box<dyn ChunkedTransferClient>> {
        match &storage.settings {
            StorageSettings::Ftp(settings) => Ok(Box::new(FtpClient::new(
                settings.clone(),
                context.transfer.ftp_chunk_size_bytes,
                context.transfer.verify_tls,
            ))),
            other => Err(AppError::validation(format!(
                "FTP factory cannot build a {} storage",
                other.kind()
            ))),
        }
    }
}
