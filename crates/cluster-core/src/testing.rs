//! In-memory services for unit tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::intent::JoinConfig;
use crate::service::{Disk, DiskLister, Result, Service, ServiceError, ServiceType};

/// PEM of a fresh self-signed certificate for `name`.
pub fn self_signed(name: &str) -> String {
    rcgen::generate_simple_self_signed(vec![name.to_string()])
        .unwrap()
        .cert
        .pem()
}

/// Shared record of calls made across several mock services.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }
}

pub struct MockService {
    kind: ServiceType,
    log: CallLog,
    fail: Mutex<Vec<&'static str>>,
    delay: Duration,
    members: Mutex<BTreeMap<String, String>>,
    disks: Option<Vec<Disk>>,
    blank_tokens: bool,
}

impl MockService {
    pub fn new(kind: ServiceType, log: &CallLog) -> Self {
        let mut members = BTreeMap::new();
        members.insert("host-a".to_string(), "10.0.0.1".to_string());

        Self {
            kind,
            log: log.clone(),
            fail: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            members: Mutex::new(members),
            disks: None,
            blank_tokens: false,
        }
    }

    /// Make `op` return an error.
    pub fn failing(self, op: &'static str) -> Self {
        self.fail.lock().unwrap().push(op);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_members(self, names: &[&str]) -> Self {
        {
            let mut members = self.members.lock().unwrap();
            members.clear();
            for (i, name) in names.iter().enumerate() {
                members.insert(name.to_string(), format!("10.0.0.{}", i + 1));
            }
        }
        self
    }

    /// Issue empty join tokens, as a subsystem with nothing to join does.
    pub fn with_blank_tokens(mut self) -> Self {
        self.blank_tokens = true;
        self
    }

    pub fn with_disks(mut self, disks: Vec<Disk>) -> Self {
        self.disks = Some(disks);
        self
    }

    pub fn shared(self) -> Arc<dyn Service> {
        Arc::new(self)
    }

    async fn call(&self, op: &'static str) -> Result<()> {
        self.log.push(format!("{}:{}:start", self.kind, op));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.push(format!("{}:{}", self.kind, op));

        if self.fail.lock().unwrap().contains(&op) {
            return Err(ServiceError::Request {
                service: self.kind,
                message: format!("{op} failed"),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Service for MockService {
    async fn bootstrap(&self, _ctx: &Context) -> Result<()> {
        self.call("bootstrap").await
    }

    async fn join(&self, _ctx: &Context, config: &JoinConfig) -> Result<()> {
        self.log.push(format!("{}:token:{}", self.kind, config.token));
        self.call("join").await
    }

    async fn issue_token(&self, _ctx: &Context, peer: &str) -> Result<String> {
        self.call("issue_token").await?;
        if self.blank_tokens {
            return Ok(String::new());
        }
        Ok(format!("{}-{}", self.kind, peer))
    }

    async fn delete_token(&self, _ctx: &Context, peer: &str) -> Result<()> {
        self.log.push(format!("{}:delete_token:{}", self.kind, peer));
        Ok(())
    }

    async fn cluster_members(&self, _ctx: &Context) -> Result<BTreeMap<String, String>> {
        self.call("cluster_members").await?;
        Ok(self.members.lock().unwrap().clone())
    }

    async fn delete_cluster_member(&self, _ctx: &Context, name: &str, _force: bool) -> Result<()> {
        self.call("delete_cluster_member").await?;
        self.members.lock().unwrap().remove(name);
        Ok(())
    }

    fn service_type(&self) -> ServiceType {
        self.kind
    }

    fn as_disk_lister(&self) -> Option<&dyn DiskLister> {
        self.disks.as_ref().map(|_| self as &dyn DiskLister)
    }
}

#[async_trait]
impl DiskLister for MockService {
    async fn list_disks(&self, _ctx: &Context) -> Result<Vec<Disk>> {
        Ok(self.disks.clone().unwrap_or_default())
    }
}
