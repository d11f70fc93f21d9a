//! Scriptable in-process router client for tests.

use crate::router_client::{ClientError, RouterClient, RouterSession, SystemInfo};
use crate::router_store::{BackupKind, RouterConnectParams};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
struct Behavior {
    connect_delay: Duration,
    export_delay: Duration,
    connect_error: Option<ClientError>,
    export_error: Option<ClientError>,
    close_hangs: bool,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    exports: AtomicUsize,
    closes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[derive(Clone)]
pub struct FakeRouterClient {
    behavior: Arc<Mutex<Behavior>>,
    counters: Arc<Counters>,
    last_params: Arc<Mutex<Option<RouterConnectParams>>>,
}

impl FakeRouterClient {
    pub fn new() -> Self {
        Self {
            behavior: Arc::new(Mutex::new(Behavior {
                connect_delay: Duration::ZERO,
                export_delay: Duration::ZERO,
                connect_error: None,
                export_error: None,
                close_hangs: false,
                payload: b"# fake export\n/system identity set name=fake\n".to_vec(),
            })),
            counters: Arc::new(Counters::default()),
            last_params: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.behavior.lock().unwrap().connect_delay = delay;
        self
    }

    pub fn with_export_delay(self, delay: Duration) -> Self {
        self.behavior.lock().unwrap().export_delay = delay;
        self
    }

    /// Sessions never finish `close`, like a peer that stopped reading.
    pub fn with_hanging_close(self) -> Self {
        self.behavior.lock().unwrap().close_hangs = true;
        self
    }

    pub fn fail_connect(&self, error: Option<ClientError>) {
        self.behavior.lock().unwrap().connect_error = error;
    }

    pub fn fail_export(&self, error: Option<ClientError>) {
        self.behavior.lock().unwrap().export_error = error;
    }

    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn exports(&self) -> usize {
        self.counters.exports.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn last_params(&self) -> Option<RouterConnectParams> {
        self.last_params.lock().unwrap().clone()
    }
}

struct FakeSession {
    behavior: Behavior,
    counters: Arc<Counters>,
    closed: bool,
}

#[async_trait]
impl RouterClient for FakeRouterClient {
    async fn connect(
        &self,
        params: &RouterConnectParams,
    ) -> Result<Box<dyn RouterSession>, ClientError> {
        let behavior = self.behavior.lock().unwrap().clone();
        *self.last_params.lock().unwrap() = Some(params.clone());
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_in_flight.fetch_max(now, Ordering::SeqCst);

        // Dropping this future mid-connect also drops the session, which
        // releases its in-flight slot.
        let mut session = FakeSession {
            behavior: behavior.clone(),
            counters: Arc::clone(&self.counters),
            closed: false,
        };
        tokio::time::sleep(behavior.connect_delay).await;
        if let Some(error) = behavior.connect_error {
            session.release();
            return Err(error);
        }
        Ok(Box::new(session))
    }
}

impl FakeSession {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl RouterSession for FakeSession {
    async fn identity(&mut self) -> Result<String, ClientError> {
        Ok("fake".to_string())
    }

    async fn system_info(&mut self) -> Result<SystemInfo, ClientError> {
        Ok(SystemInfo {
            identity: self.identity().await?,
            version: Some("7.14.2 (stable)".to_string()),
            uptime: Some("1w2d".to_string()),
            model: Some("CCR2004-1G-12S+2XS".to_string()),
            ..Default::default()
        })
    }

    async fn export(&mut self, _kind: BackupKind) -> Result<Vec<u8>, ClientError> {
        self.counters.exports.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.behavior.export_delay).await;
        match &self.behavior.export_error {
            Some(error) => Err(error.clone()),
            None => Ok(self.behavior.payload.clone()),
        }
    }

    async fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        if self.behavior.close_hangs {
            std::future::pending::<()>().await;
        }
        self.release();
    }
}
