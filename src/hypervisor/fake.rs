use super::{DomainState, HypervisorDriver};
use crate::retry::{OpError, OpResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

struct FakeDomain {
    xml: String,
    state: DomainState,
    /// Number of `state()` polls to report `ShuttingDown` before flipping to
    /// `Shutoff`, letting tests exercise the stop-polling loop deterministically.
    shutdown_polls_remaining: u32,
}

/// In-memory hypervisor double. Tests drive domains through exactly the
/// states `LifecycleEngine` polls for, without a real libvirt connection.
#[derive(Default)]
pub struct FakeHypervisorDriver {
    domains: Mutex<HashMap<Uuid, FakeDomain>>,
}

impl FakeHypervisorDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `shutdown()` on `uuid` take `polls` calls to `state()`
    /// before reporting `Shutoff`.
    pub fn set_shutdown_delay(&self, uuid: Uuid, polls: u32) {
        if let Some(domain) = self.domains.lock().unwrap().get_mut(&uuid) {
            domain.shutdown_polls_remaining = polls;
        }
    }

    pub fn domain_exists(&self, uuid: Uuid) -> bool {
        self.domains.lock().unwrap().contains_key(&uuid)
    }

    pub fn domain_xml(&self, uuid: Uuid) -> Option<String> {
        self.domains.lock().unwrap().get(&uuid).map(|d| d.xml.clone())
    }
}

#[async_trait]
impl HypervisorDriver for FakeHypervisorDriver {
    async fn define(&self, uuid: Uuid, xml: &str) -> OpResult<()> {
        self.domains.lock().unwrap().insert(
            uuid,
            FakeDomain {
                xml: xml.to_string(),
                state: DomainState::Shutoff,
                shutdown_polls_remaining: 0,
            },
        );
        Ok(())
    }

    async fn create(&self, uuid: Uuid) -> OpResult<()> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(&uuid)
            .ok_or_else(|| OpError::Fatal(anyhow::anyhow!("no such domain {uuid}")))?;
        domain.state = DomainState::Running;
        Ok(())
    }

    async fn shutdown(&self, uuid: Uuid) -> OpResult<()> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(&uuid)
            .ok_or_else(|| OpError::Fatal(anyhow::anyhow!("no such domain {uuid}")))?;
        domain.state = DomainState::ShuttingDown;
        Ok(())
    }

    async fn destroy(&self, uuid: Uuid) -> OpResult<()> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(&uuid)
            .ok_or_else(|| OpError::Fatal(anyhow::anyhow!("no such domain {uuid}")))?;
        domain.state = DomainState::Shutoff;
        Ok(())
    }

    async fn suspend(&self, uuid: Uuid) -> OpResult<()> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(&uuid)
            .ok_or_else(|| OpError::Fatal(anyhow::anyhow!("no such domain {uuid}")))?;
        domain.state = DomainState::Paused;
        Ok(())
    }

    async fn resume(&self, uuid: Uuid) -> OpResult<()> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(&uuid)
            .ok_or_else(|| OpError::Fatal(anyhow::anyhow!("no such domain {uuid}")))?;
        domain.state = DomainState::Running;
        Ok(())
    }

    async fn undefine(&self, uuid: Uuid) -> OpResult<()> {
        self.domains.lock().unwrap().remove(&uuid);
        Ok(())
    }

    async fn state(&self, uuid: Uuid) -> OpResult<DomainState> {
        let mut domains = self.domains.lock().unwrap();
        let domain = domains
            .get_mut(&uuid)
            .ok_or_else(|| OpError::Fatal(anyhow::anyhow!("no such domain {uuid}")))?;
        if domain.state == DomainState::ShuttingDown {
            if domain.shutdown_polls_remaining == 0 {
                domain.state = DomainState::Shutoff;
            } else {
                domain.shutdown_polls_remaining -= 1;
            }
        }
        Ok(domain.state)
    }
}
