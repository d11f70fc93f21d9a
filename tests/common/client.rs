//! HTTP client for end-to-end tests
//!
//! Wraps reqwest with one method per endpoint. When API routes or request
//! formats change, update only this file.

#![allow(dead_code)]

use super::constants::*;
use reqwest::Response;
use serde_json::{json, Value};
use std::time::Duration;

pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ========================================================================
    // Routers
    // ========================================================================

    pub async fn list_routers(&self) -> Response {
        self.client.get(self.url("/api/routers")).send().await.unwrap()
    }

    pub async fn create_router(&self, body: Value) -> Response {
        self.client
            .post(self.url("/api/routers"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    /// Registers a router pointing at a local fake device and returns its id.
    pub async fn create_local_router(&self, name: &str, port: u16, password: &str) -> i64 {
        let response = self
            .create_router(json!({
                "name": name,
                "host": "127.0.0.1",
                "port": port,
                "username": ROUTER_USER,
                "password": password,
            }))
            .await;
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        let body: Value = response.json().await.unwrap();
        body["id"].as_i64().unwrap()
    }

    pub async fn get_router(&self, id: i64) -> Response {
        self.client
            .get(self.url(&format!("/api/routers/{}", id)))
            .send()
            .await
            .unwrap()
    }

    pub async fn update_router(&self, id: i64, body: Value) -> Response {
        self.client
            .put(self.url(&format!("/api/routers/{}", id)))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn delete_router(&self, id: i64) -> Response {
        self.client
            .delete(self.url(&format!("/api/routers/{}", id)))
            .send()
            .await
            .unwrap()
    }

    pub async fn test_router(&self, id: i64) -> Response {
        self.client
            .post(self.url(&format!("/api/routers/{}/test", id)))
            .send()
            .await
            .unwrap()
    }

    pub async fn router_runs(&self, id: i64) -> Response {
        self.client
            .get(self.url(&format!("/api/routers/{}/runs", id)))
            .send()
            .await
            .unwrap()
    }

    // ========================================================================
    // Connectivity and backups
    // ========================================================================

    pub async fn test_connection(&self, body: Value) -> Response {
        self.client
            .post(self.url("/api/test-connection"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn check_status(&self) -> Response {
        self.client
            .post(self.url("/api/check-status"))
            .send()
            .await
            .unwrap()
    }

    pub async fn backup_now(&self, router_id: i64, kind: &str) -> Response {
        self.client
            .post(self.url(&format!("/api/backup/{}?kind={}", router_id, kind)))
            .send()
            .await
            .unwrap()
    }

    pub async fn list_backups(&self) -> Response {
        self.client.get(self.url("/api/backups")).send().await.unwrap()
    }

    pub async fn list_backups_for(&self, router_id: i64) -> Response {
        self.client
            .get(self.url(&format!("/api/backups?router_id={}", router_id)))
            .send()
            .await
            .unwrap()
    }

    pub async fn download_backup(&self, id: i64) -> Response {
        self.client
            .get(self.url(&format!("/api/backups/{}/download", id)))
            .send()
            .await
            .unwrap()
    }

    pub async fn delete_backup(&self, id: i64) -> Response {
        self.client
            .delete(self.url(&format!("/api/backups/{}", id)))
            .send()
            .await
            .unwrap()
    }

    pub async fn prune_backups(&self, retention_days: u32) -> Response {
        self.client
            .post(self.url("/api/backups/prune"))
            .json(&json!({ "retention_days": retention_days }))
            .send()
            .await
            .unwrap()
    }

    // ========================================================================
    // Schedules and stats
    // ========================================================================

    pub async fn list_schedules(&self) -> Response {
        self.client
            .get(self.url("/api/schedules"))
            .send()
            .await
            .unwrap()
    }

    pub async fn create_schedule(&self, body: Value) -> Response {
        self.client
            .post(self.url("/api/schedules"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn delete_schedule(&self, id: i64) -> Response {
        self.client
            .delete(self.url(&format!("/api/schedules/{}", id)))
            .send()
            .await
            .unwrap()
    }

    pub async fn stats(&self) -> Response {
        self.client.get(self.url("/api/stats")).send().await.unwrap()
    }

    pub async fn metrics(&self) -> Response {
        self.client.get(self.url("/metrics")).send().await.unwrap()
    }
}
