pub mod fake;

use crate::retry::{OpError, OpResult};
use crate::settings::QemuConfig;
use async_trait::async_trait;
use log::warn;
use std::sync::Mutex as StdMutex;
use uuid::Uuid;
use virt::connect::Connect;
use virt::domain::Domain;

pub use fake::FakeHypervisorDriver;

/// Mirrors `virDomainState`. Only the values this runtime polls for are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => DomainState::Running,
            2 => DomainState::Blocked,
            3 => DomainState::Paused,
            4 => DomainState::ShuttingDown,
            5 => DomainState::Shutoff,
            6 => DomainState::Crashed,
            7 => DomainState::PmSuspended,
            _ => DomainState::NoState,
        }
    }
}

/// Thin abstraction over a libvirt connection. `create`/`shutdown`/etc. are
/// classified via [`OpError`] so the caller (the lifecycle engine) can
/// transparently reconnect exactly once on a transport failure without
/// retrying an operation that failed for a non-transport reason.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    async fn define(&self, uuid: Uuid, xml: &str) -> OpResult<()>;
    async fn create(&self, uuid: Uuid) -> OpResult<()>;
    async fn shutdown(&self, uuid: Uuid) -> OpResult<()>;
    async fn destroy(&self, uuid: Uuid) -> OpResult<()>;
    async fn suspend(&self, uuid: Uuid) -> OpResult<()>;
    async fn resume(&self, uuid: Uuid) -> OpResult<()>;
    async fn undefine(&self, uuid: Uuid) -> OpResult<()>;
    async fn state(&self, uuid: Uuid) -> OpResult<DomainState>;
}

/// Real driver, backed by `qemu:///system` through the `virt` crate.
///
/// Held behind a `Mutex` because `virt::connect::Connect` is not `Sync`; all
/// hypervisor calls run on the single lifecycle dispatcher task anyway (see
/// the concurrency notes on [`crate::lifecycle::LifecycleEngine`]), so this
/// never contends.
pub struct LibVirtDriver {
    uri: String,
    connection: StdMutex<Connect>,
    #[allow(dead_code)]
    qemu: QemuConfig,
}

impl LibVirtDriver {
    pub fn connect(uri: &str, qemu: QemuConfig) -> anyhow::Result<Self> {
        let connection = Connect::open(Some(uri))?;
        Ok(Self {
            uri: uri.to_string(),
            connection: StdMutex::new(connection),
            qemu,
        })
    }

    fn reconnect(&self) -> anyhow::Result<()> {
        let fresh = Connect::open(Some(&self.uri))?;
        *self.connection.lock().unwrap() = fresh;
        Ok(())
    }

    /// Run `op` against the current connection; on any libvirt error,
    /// reopen the connection once and retry `op` a single time.
    fn with_reconnect<T>(
        &self,
        op: impl Fn(&Connect) -> Result<T, virt::error::Error>,
    ) -> OpResult<T> {
        {
            let conn = self.connection.lock().unwrap();
            match op(&conn) {
                Ok(v) => return Ok(v),
                Err(e) => warn!("libvirt call failed, reconnecting once: {e}"),
            }
        }
        self.reconnect()
            .map_err(|e| OpError::Fatal(anyhow::anyhow!("reconnect to {} failed: {e}", self.uri)))?;
        let conn = self.connection.lock().unwrap();
        op(&conn).map_err(|e| OpError::Fatal(anyhow::anyhow!("libvirt call failed after reconnect: {e}")))
    }

    /// Look up `uuid` and run `op` against the resulting domain, both inside
    /// the same reconnect-once envelope as [`Self::with_reconnect`]. A stale
    /// domain handle after a reconnect is exactly the kind of transport
    /// failure this is meant to recover from.
    fn with_domain<T>(
        &self,
        uuid: Uuid,
        op: impl Fn(Domain) -> Result<T, virt::error::Error>,
    ) -> OpResult<T> {
        self.with_reconnect(|conn| {
            Domain::lookup_by_uuid_string(conn, &uuid.to_string()).and_then(&op)
        })
    }
}

#[async_trait]
impl HypervisorDriver for LibVirtDriver {
    async fn define(&self, _uuid: Uuid, xml: &str) -> OpResult<()> {
        self.with_reconnect(|conn| Domain::define_xml(conn, xml).map(|_| ()))
    }

    async fn create(&self, uuid: Uuid) -> OpResult<()> {
        self.with_domain(uuid, |domain| domain.create())
    }

    async fn shutdown(&self, uuid: Uuid) -> OpResult<()> {
        self.with_domain(uuid, |domain| domain.shutdown())
    }

    async fn destroy(&self, uuid: Uuid) -> OpResult<()> {
        self.with_domain(uuid, |domain| domain.destroy())
    }

    async fn suspend(&self, uuid: Uuid) -> OpResult<()> {
        self.with_domain(uuid, |domain| domain.suspend())
    }

    async fn resume(&self, uuid: Uuid) -> OpResult<()> {
        self.with_domain(uuid, |domain| domain.resume())
    }

    async fn undefine(&self, uuid: Uuid) -> OpResult<()> {
        self.with_domain(uuid, |domain| domain.undefine())
    }

    async fn state(&self, uuid: Uuid) -> OpResult<DomainState> {
        self.with_domain(uuid, |domain| domain.get_state())
            .map(|(raw, _reason)| DomainState::from_raw(raw))
    }
}
