//! In-process RouterOS API endpoint
//!
//! Speaks the sentence protocol well enough for the backup client: login,
//! identity, backup/export into an in-memory file table, `/file/print`,
//! `/file/read` and `/file/remove`.

#![allow(dead_code)]

use mikrotik_backup_server::router_client::{read_sentence, write_sentence};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const FULL_BACKUP_PAYLOAD: &[u8] = b"\x88\xac\xa1\xb1binary-backup-image";

struct RouterState {
    identity: String,
    username: String,
    password: String,
    files: Mutex<HashMap<String, Vec<u8>>>,
    logins: AtomicUsize,
    failed_logins: AtomicUsize,
    fail_exports: AtomicBool,
}

/// A fake MikroTik listening on an ephemeral localhost port.
///
/// Stops accepting connections when dropped.
pub struct FakeRouter {
    pub port: u16,
    state: Arc<RouterState>,
    accept_task: JoinHandle<()>,
}

impl FakeRouter {
    pub async fn spawn(identity: &str, username: &str, password: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake router");
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(RouterState {
            identity: identity.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            files: Mutex::new(HashMap::new()),
            logins: AtomicUsize::new(0),
            failed_logins: AtomicUsize::new(0),
            fail_exports: AtomicBool::new(false),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(socket, state).await;
                });
            }
        });

        Self {
            port,
            state,
            accept_task,
        }
    }

    pub fn logins(&self) -> usize {
        self.state.logins.load(Ordering::SeqCst)
    }

    pub fn failed_logins(&self) -> usize {
        self.state.failed_logins.load(Ordering::SeqCst)
    }

    /// Files currently stored on the device.
    pub fn remote_files(&self) -> Vec<String> {
        self.state.files.lock().unwrap().keys().cloned().collect()
    }

    pub fn set_fail_exports(&self, fail: bool) {
        self.state.fail_exports.store(fail, Ordering::SeqCst);
    }
}

impl Drop for FakeRouter {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn attributes(words: &[Vec<u8>]) -> HashMap<String, Vec<u8>> {
    let mut attrs = HashMap::new();
    for word in words.iter().skip(1) {
        let (prefix, rest) = match word.first() {
            Some(b'=') => ("", &word[1..]),
            Some(b'?') => ("?", &word[1..]),
            _ => continue,
        };
        if let Some(split) = rest.iter().position(|b| *b == b'=') {
            let key = format!("{}{}", prefix, String::from_utf8_lossy(&rest[..split]));
            attrs.insert(key, rest[split + 1..].to_vec());
        }
    }
    attrs
}

fn attr_str(attrs: &HashMap<String, Vec<u8>>, key: &str) -> String {
    attrs
        .get(key)
        .map(|v| String::from_utf8_lossy(v).to_string())
        .unwrap_or_default()
}

async fn done(socket: &mut TcpStream) -> std::io::Result<()> {
    write_sentence(socket, &["!done"]).await
}

async fn trap(socket: &mut TcpStream, message: &str) -> std::io::Result<()> {
    write_sentence(socket, &["!trap".to_string(), format!("=message={}", message)]).await?;
    done(socket).await
}

async fn serve_connection(mut socket: TcpStream, state: Arc<RouterState>) -> std::io::Result<()> {
    let mut logged_in = false;
    loop {
        let words = read_sentence(&mut socket).await?;
        let Some(command) = words.first().map(|w| String::from_utf8_lossy(w).to_string()) else {
            continue;
        };
        let attrs = attributes(&words);

        if command == "/quit" {
            return Ok(());
        }
        if command == "/login" {
            if attr_str(&attrs, "name") == state.username
                && attr_str(&attrs, "password") == state.password
            {
                state.logins.fetch_add(1, Ordering::SeqCst);
                logged_in = true;
                done(&mut socket).await?;
            } else {
                state.failed_logins.fetch_add(1, Ordering::SeqCst);
                trap(&mut socket, "invalid user name or password (6)").await?;
            }
            continue;
        }
        if !logged_in {
            write_sentence(&mut socket, &["!fatal", "not logged in"]).await?;
            return Ok(());
        }

        match command.as_str() {
            "/system/identity/print" => {
                write_sentence(
                    &mut socket,
                    &["!re".to_string(), format!("=name={}", state.identity)],
                )
                .await?;
                done(&mut socket).await?;
            }
            // No routerboard menu, like a CHR: that command traps below.
            "/system/resource/print" => {
                write_sentence(
                    &mut socket,
                    &[
                        "!re",
                        "=version=7.14.2 (stable)",
                        "=uptime=5d3h12m",
                        "=cpu-load=3",
                        "=free-memory=412000256",
                        "=total-memory=1073741824",
                    ],
                )
                .await?;
                done(&mut socket).await?;
            }
            "/system/backup/save" | "/export" => {
                if state.fail_exports.load(Ordering::SeqCst) {
                    trap(&mut socket, "not enough space").await?;
                    continue;
                }
                let (name, data) = if command == "/export" {
                    (
                        format!("{}.rsc", attr_str(&attrs, "file")),
                        format!(
                            "# by RouterOS 7.14\n/system identity\nset name={}\n",
                            state.identity
                        )
                        .into_bytes(),
                    )
                } else {
                    (
                        format!("{}.backup", attr_str(&attrs, "name")),
                        FULL_BACKUP_PAYLOAD.to_vec(),
                    )
                };
                state.files.lock().unwrap().insert(name, data);
                done(&mut socket).await?;
            }
            "/file/print" => {
                let name = attr_str(&attrs, "?name");
                let size = state.files.lock().unwrap().get(&name).map(|d| d.len());
                if let Some(size) = size {
                    write_sentence(
                        &mut socket,
                        &[
                            "!re".to_string(),
                            format!("=name={}", name),
                            format!("=size={}", size),
                        ],
                    )
                    .await?;
                }
                done(&mut socket).await?;
            }
            "/file/read" => {
                let name = attr_str(&attrs, "file");
                let offset: usize = attr_str(&attrs, "offset").parse().unwrap_or(0);
                let chunk_size: usize = attr_str(&attrs, "chunk-size").parse().unwrap_or(4096);
                let chunk = state.files.lock().unwrap().get(&name).map(|data| {
                    let start = offset.min(data.len());
                    let end = (start + chunk_size).min(data.len());
                    data[start..end].to_vec()
                });
                match chunk {
                    Some(chunk) => {
                        if !chunk.is_empty() {
                            let mut word = b"=data=".to_vec();
                            word.extend_from_slice(&chunk);
                            write_sentence(&mut socket, &[b"!re".to_vec(), word]).await?;
                        }
                        done(&mut socket).await?;
                    }
                    None => trap(&mut socket, "no such item").await?,
                }
            }
            "/file/remove" => {
                let name = attr_str(&attrs, "numbers");
                state.files.lock().unwrap().remove(&name);
                done(&mut socket).await?;
            }
            other => trap(&mut socket, &format!("no such command prefix {}", other)).await?,
        }
    }
}
