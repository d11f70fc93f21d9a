//! RouterOS API client over TCP, optionally wrapped in TLS.

use super::protocol::{read_sentence, write_sentence, Reply, ReplyKind};
use super::{ClientError, RouterClient, RouterSession, SystemInfo};
use crate::router_store::{BackupKind, RouterConnectParams};
use async_trait::async_trait;
use chrono::Utc;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_native_tls::native_tls;
use tracing::{debug, info, warn};

/// Bytes requested per `/file/read` call.
const FILE_READ_CHUNK: usize = 32 * 1024;

/// Cap on the buffer reserved up front from the size the router reports.
const FILE_READ_MAX_PREALLOC: usize = FILE_READ_CHUNK * 64;

/// `/export file=` returns before the file shows up on some RouterOS builds.
const FILE_APPEAR_ATTEMPTS: u32 = 10;
const FILE_APPEAR_DELAY: Duration = Duration::from_millis(500);

trait ApiStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ApiStream for T {}

/// Production [`RouterClient`] for the RouterOS API service (`api` / `api-ssl`).
#[derive(Clone)]
pub struct ApiRouterClient {
    /// Accept self-signed router certificates. RouterOS ships with none, so
    /// most installations use one generated on the device.
    accept_invalid_certs: bool,
}

impl ApiRouterClient {
    pub fn new() -> Self {
        Self {
            accept_invalid_certs: true,
        }
    }

    pub fn with_certificate_validation(mut self, validate: bool) -> Self {
        self.accept_invalid_certs = !validate;
        self
    }

    async fn open_stream(
        &self,
        params: &RouterConnectParams,
    ) -> Result<Box<dyn ApiStream>, ClientError> {
        let address = format!("{}:{}", params.host, params.port);
        let tcp = TcpStream::connect(&address)
            .await
            .map_err(|e| ClientError::ConnectionFailed(format!("{}: {}", address, e)))?;
        let _ = tcp.set_nodelay(true);

        if !params.use_ssl {
            return Ok(Box::new(tcp));
        }

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .danger_accept_invalid_hostnames(self.accept_invalid_certs)
            .build()
            .map_err(|e| ClientError::ConnectionFailed(format!("TLS setup: {}", e)))?;
        let tls = tokio_native_tls::TlsConnector::from(connector)
            .connect(&params.host, tcp)
            .await
            .map_err(|e| ClientError::ConnectionFailed(format!("TLS handshake: {}", e)))?;
        Ok(Box::new(tls))
    }
}

impl Default for ApiRouterClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouterClient for ApiRouterClient {
    async fn connect(
        &self,
        params: &RouterConnectParams,
    ) -> Result<Box<dyn RouterSession>, ClientError> {
        let stream = self.open_stream(params).await?;
        let mut session = ApiSession {
            stream,
            host: params.host.clone(),
        };

        let replies = session
            .command(&[
                "/login".to_string(),
                format!("=name={}", params.username),
                format!("=password={}", params.password),
            ])
            .await
            .map_err(|e| match e {
                CommandError::Io(e) => ClientError::ConnectionFailed(e.to_string()),
                CommandError::Trap(msg) | CommandError::Fatal(msg) => {
                    ClientError::AuthenticationFailed(msg)
                }
            })?;

        // Pre-6.43 routers answer with a challenge instead of logging in.
        if replies.iter().any(|r| r.attribute("ret").is_some()) {
            session.close().await;
            return Err(ClientError::AuthenticationFailed(
                "router requires the legacy challenge login (RouterOS < 6.43)".to_string(),
            ));
        }

        info!("Logged in to router at {}:{}", params.host, params.port);
        Ok(Box::new(session))
    }
}

#[derive(Debug)]
enum CommandError {
    Io(io::Error),
    Trap(String),
    Fatal(String),
}

impl From<io::Error> for CommandError {
    fn from(e: io::Error) -> Self {
        CommandError::Io(e)
    }
}

impl From<CommandError> for ClientError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Io(e) => ClientError::ExportFailed(format!("I/O error: {}", e)),
            CommandError::Trap(msg) => ClientError::ExportFailed(msg),
            CommandError::Fatal(msg) => ClientError::ExportFailed(format!("fatal: {}", msg)),
        }
    }
}

struct ApiSession {
    stream: Box<dyn ApiStream>,
    host: String,
}

impl ApiSession {
    /// Sends one command and collects its replies up to `!done`.
    async fn command<S: AsRef<[u8]> + Sync>(
        &mut self,
        words: &[S],
    ) -> Result<Vec<Reply>, CommandError> {
        write_sentence(&mut self.stream, words).await?;

        let mut replies = Vec::new();
        let mut trap = None;
        loop {
            let reply = Reply::parse(read_sentence(&mut self.stream).await?)?;
            match reply.kind {
                ReplyKind::Done => {
                    if let Some(msg) = trap {
                        return Err(CommandError::Trap(msg));
                    }
                    replies.push(reply);
                    return Ok(replies);
                }
                ReplyKind::Trap => trap = Some(reply.message()),
                ReplyKind::Fatal => return Err(CommandError::Fatal(reply.message())),
                ReplyKind::Re | ReplyKind::Empty => replies.push(reply),
            }
        }
    }

    /// First `!re` of a print command. A trap reads as `None` so optional
    /// menus do not fail the whole probe.
    async fn print_first(&mut self, command: &str) -> Result<Option<Reply>, ClientError> {
        match self.command(&[command]).await {
            Ok(replies) => Ok(replies.into_iter().find(|r| r.kind == ReplyKind::Re)),
            Err(CommandError::Trap(msg)) => {
                debug!("{} trapped on {}: {}", command, self.host, msg);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn file_size(&mut self, name: &str) -> Result<Option<u64>, CommandError> {
        let replies = self
            .command(&[
                "/file/print".to_string(),
                "=.proplist=name,size".to_string(),
                format!("?name={}", name),
            ])
            .await?;
        Ok(replies
            .iter()
            .filter(|r| r.kind == ReplyKind::Re)
            .find_map(|r| r.attribute_str("size"))
            .map(|size| parse_size(&size)))
    }

    async fn wait_for_file(&mut self, name: &str) -> Result<u64, ClientError> {
        for attempt in 0..FILE_APPEAR_ATTEMPTS {
            if let Some(size) = self.file_size(name).await? {
                return Ok(size);
            }
            debug!(
                "File {} not yet present on {} (attempt {})",
                name,
                self.host,
                attempt + 1
            );
            tokio::time::sleep(FILE_APPEAR_DELAY).await;
        }
        Err(ClientError::ExportFailed(format!(
            "file {} never appeared on router",
            name
        )))
    }

    /// Reads a remote file with `/file/read` (RouterOS 7.13 and later).
    async fn read_file(&mut self, name: &str, size: u64) -> Result<Vec<u8>, ClientError> {
        let mut data = Vec::with_capacity(initial_capacity(size));
        loop {
            let replies = self
                .command(&[
                    "/file/read".to_string(),
                    format!("=file={}", name),
                    format!("=offset={}", data.len()),
                    format!("=chunk-size={}", FILE_READ_CHUNK),
                ])
                .await?;
            let chunk: Vec<u8> = replies
                .iter()
                .filter_map(|r| r.attribute("data"))
                .flatten()
                .copied()
                .collect();
            if chunk.is_empty() {
                break;
            }
            data.extend_from_slice(&chunk);
            if size > 0 && data.len() as u64 >= size {
                break;
            }
        }
        Ok(data)
    }

    async fn remove_file(&mut self, name: &str) {
        let result = self
            .command(&["/file/remove".to_string(), format!("=numbers={}", name)])
            .await;
        if let Err(e) = result {
            warn!("Failed to remove {} from {}: {:?}", name, self.host, e);
        }
    }
}

#[async_trait]
impl RouterSession for ApiSession {
    async fn identity(&mut self) -> Result<String, ClientError> {
        let replies = self.command(&["/system/identity/print"]).await?;
        replies
            .iter()
            .find_map(|r| r.attribute_str("name"))
            .ok_or_else(|| ClientError::ExportFailed("identity reply has no name".to_string()))
    }

    async fn system_info(&mut self) -> Result<SystemInfo, ClientError> {
        let identity = self.identity().await?;
        let resource = self.print_first("/system/resource/print").await?;
        let routerboard = self.print_first("/system/routerboard/print").await?;
        let field =
            |reply: &Option<Reply>, key: &str| reply.as_ref().and_then(|r| r.attribute_str(key));

        Ok(SystemInfo {
            identity,
            version: field(&resource, "version"),
            uptime: field(&resource, "uptime"),
            cpu_load: field(&resource, "cpu-load"),
            free_memory: field(&resource, "free-memory"),
            total_memory: field(&resource, "total-memory"),
            model: field(&routerboard, "model"),
            serial_number: field(&routerboard, "serial-number"),
        })
    }

    async fn export(&mut self, kind: BackupKind) -> Result<Vec<u8>, ClientError> {
        let base = format!("mtbk_{}", Utc::now().format("%Y%m%d%H%M%S"));
        let remote_file = format!("{}.{}", base, kind.extension());

        match kind {
            BackupKind::Full => {
                self.command(&[
                    "/system/backup/save".to_string(),
                    format!("=name={}", base),
                    "=dont-encrypt=yes".to_string(),
                ])
                .await?;
            }
            BackupKind::Config => {
                self.command(&["/export".to_string(), format!("=file={}", base)])
                    .await?;
            }
        }

        let size = self.wait_for_file(&remote_file).await?;
        let result = self.read_file(&remote_file, size).await;
        self.remove_file(&remote_file).await;

        let data = result?;
        if data.is_empty() {
            return Err(ClientError::ExportFailed(format!(
                "router returned an empty {}",
                remote_file
            )));
        }
        debug!(
            "Fetched {} ({} bytes) from {}",
            remote_file,
            data.len(),
            self.host
        );
        Ok(data)
    }

    async fn close(&mut self) {
        let _ = write_sentence(&mut self.stream, &["/quit"]).await;
        let _ = self.stream.shutdown().await;
    }
}

fn initial_capacity(reported_size: u64) -> usize {
    usize::try_from(reported_size)
        .unwrap_or(usize::MAX)
        .min(FILE_READ_MAX_PREALLOC)
}

/// Parses RouterOS sizes, which are plain bytes on v7 and may carry a unit
/// suffix (`12.3KiB`) on older builds.
fn parse_size(raw: &str) -> u64 {
    let raw = raw.trim().replace(' ', "");
    let (number, multiplier) = if let Some(n) = raw.strip_suffix("GiB") {
        (n, 1024.0 * 1024.0 * 1024.0)
    } else if let Some(n) = raw.strip_suffix("MiB") {
        (n, 1024.0 * 1024.0)
    } else if let Some(n) = raw.strip_suffix("KiB") {
        (n, 1024.0)
    } else {
        (raw.as_str(), 1.0)
    };
    number
        .parse::<f64>()
        .map(|n| (n * multiplier) as u64)
        .unwrap_or(0)
}
