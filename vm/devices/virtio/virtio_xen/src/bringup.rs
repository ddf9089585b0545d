// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Connection to the guest frontend.
//!
//! Bring-up finds the frontend entry in the store, creates an I/O-request
//! server for the register window and binds its event channel. Any failure
//! is retried with an exponential backoff, since the frontend may simply not
//! exist yet.

use crate::device::DeviceInner;
use crate::device::Frontend;
use crate::hypervisor::DomainId;
use crate::hypervisor::EventPort;
use crate::hypervisor::HvError;
use crate::hypervisor::Hypervisor;
use crate::hypervisor::IoreqServerId;
use crate::hypervisor::StoreError;
use crate::hypervisor::XenStore;
use crate::ioreq::IoreqPage;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BringupError {
    #[error("no frontend with base address {0:#x}")]
    NoFrontend(u64),
    #[error("store lookup failed")]
    Store(#[source] StoreError),
    #[error("invalid store value {value:?} at {path}")]
    InvalidValue { path: String, value: String },
    #[error("failed to query the vcpu count of domain {0}")]
    VcpuCount(DomainId, #[source] HvError),
    #[error("failed to create the ioreq server")]
    CreateServer(#[source] HvError),
    #[error("failed to map the mmio range to ioreq server {0}")]
    MapRange(IoreqServerId, #[source] HvError),
    #[error("failed to acquire the ioreq page of server {0}")]
    AcquirePage(IoreqServerId, #[source] HvError),
    #[error("failed to bind event port {0}")]
    BindChannel(EventPort, #[source] HvError),
    #[error("failed to enable ioreq server {0}")]
    EnableServer(IoreqServerId, #[source] HvError),
    #[error("bring-up was abandoned by a device reset")]
    Abandoned,
}

/// Progress of one bring-up attempt, for tracing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BringupStep {
    Discovering,
    ServerCreated,
    RangeMapped,
    ResourceAcquired,
    ChannelBound,
    Ready,
}

/// Exponential retry delay, shared by all failure causes.
#[derive(Debug, Clone)]
pub struct Backoff {
    failures: u32,
    base: Duration,
    max_shift: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_shift: u32) -> Self {
        Self {
            failures: 0,
            base,
            max_shift,
        }
    }

    /// Records a failure and returns how long to wait before the next try.
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.failures.min(self.max_shift);
        self.failures = self.failures.saturating_add(1);
        self.base
            .saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX))
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Resources held while the frontend is connected.
pub(crate) struct Connection {
    pub(crate) frontend: Frontend,
    pub(crate) server: IoreqServerId,
    pub(crate) page: Arc<dyn IoreqPage>,
    pub(crate) port: EventPort,
    pub(crate) vcpus: u32,
}

impl Connection {
    pub(crate) fn close(self, hv: &dyn Hypervisor) {
        hv.unbind(self.port);
        if let Err(err) = hv.set_ioreq_server_state(self.frontend.domid, self.server, false) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                server = self.server,
                "failed to disable ioreq server"
            );
        }
        hv.destroy_ioreq_server(self.frontend.domid, self.server);
    }
}

pub(crate) struct BringupState {
    pub(crate) backoff: Backoff,
    pub(crate) initialized: bool,
    /// Bumped by every device reset; an attempt started under an older
    /// epoch must not commit.
    pub(crate) epoch: u64,
    /// Identifies the most recently scheduled attempt. Older scheduled
    /// attempts are dropped when they come up.
    pub(crate) ticket: u64,
    pub(crate) watch: Option<u64>,
    pub(crate) connection: Option<Connection>,
}

impl BringupState {
    pub(crate) fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            initialized: false,
            epoch: 0,
            ticket: 0,
            watch: None,
            connection: None,
        }
    }

    pub(crate) fn port(&self) -> Option<EventPort> {
        self.connection.as_ref().map(|c| c.port)
    }

    pub(crate) fn page(&self) -> Option<Arc<dyn IoreqPage>> {
        self.connection.as_ref().map(|c| c.page.clone())
    }
}

fn parse_u64(path: &str, value: &str) -> Result<u64, BringupError> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| BringupError::InvalidValue {
        path: path.to_owned(),
        value: value.to_owned(),
    })
}

/// Walks `<root>/<domid>/<devid>` for the entry whose `base` matches.
pub(crate) fn discover(
    store: &dyn XenStore,
    root: &str,
    base: u64,
) -> Result<Frontend, BringupError> {
    for domain in store.directory(root).map_err(BringupError::Store)? {
        let Ok(domid) = domain.parse::<DomainId>() else {
            continue;
        };
        let domain_path = format!("{root}/{domain}");
        for device in store.directory(&domain_path).map_err(BringupError::Store)? {
            let Ok(devid) = device.parse::<u32>() else {
                continue;
            };
            let device_path = format!("{domain_path}/{device}");
            let base_path = format!("{device_path}/base");
            let value = match store.read(&base_path) {
                Ok(value) => value,
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(BringupError::Store(err)),
            };
            match parse_u64(&base_path, &value) {
                Ok(entry) if entry == base => {}
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "skipping frontend entry"
                    );
                    continue;
                }
            }
            let irq_path = format!("{device_path}/irq");
            let irq = store.read(&irq_path).map_err(BringupError::Store)?;
            let irq = parse_u64(&irq_path, &irq)?;
            let irq = u32::try_from(irq).map_err(|_| BringupError::InvalidValue {
                path: irq_path,
                value: irq.to_string(),
            })?;
            return Ok(Frontend {
                domid,
                devid,
                irq,
                base,
            });
        }
    }
    Err(BringupError::NoFrontend(base))
}

/// Releases whatever a failed attempt acquired.
struct Rollback<'a> {
    hv: &'a dyn Hypervisor,
    domid: DomainId,
    server: Option<IoreqServerId>,
    port: Option<EventPort>,
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if let Some(port) = self.port.take() {
            self.hv.unbind(port);
        }
        if let Some(server) = self.server.take() {
            self.hv.destroy_ioreq_server(self.domid, server);
        }
    }
}

impl DeviceInner {
    /// Schedules a bring-up attempt after `delay`, superseding any attempt
    /// scheduled before.
    pub(crate) fn schedule_bringup(&self, state: &mut BringupState, delay: Duration) {
        state.ticket += 1;
        let ticket = state.ticket;
        let epoch = state.epoch;
        let this = self.this.clone();
        self.work.schedule(
            delay,
            Box::new(move || {
                if let Some(this) = this.upgrade() {
                    this.run_bringup(epoch, ticket);
                }
            }),
        );
    }

    fn check_epoch(&self, epoch: u64, step: BringupStep) -> Result<(), BringupError> {
        if self.bringup.lock().epoch != epoch {
            return Err(BringupError::Abandoned);
        }
        tracing::debug!(?step, "bring-up");
        Ok(())
    }

    pub(crate) fn run_bringup(&self, epoch: u64, ticket: u64) {
        {
            let state = self.bringup.lock();
            if state.initialized || state.epoch != epoch || state.ticket != ticket {
                return;
            }
        }

        let result = self.connect(epoch);
        let mut state = self.bringup.lock();
        let result = result.and_then(|connection| {
            if state.epoch != epoch {
                connection.close(self.hv.as_ref());
                return Err(BringupError::Abandoned);
            }
            Ok(connection)
        });
        match result {
            Ok(connection) => {
                let frontend = connection.frontend;
                let port = connection.port;
                tracing::info!(
                    domid = frontend.domid,
                    devid = frontend.devid,
                    irq = frontend.irq,
                    server = connection.server,
                    port,
                    vcpus = connection.vcpus,
                    "virtio backend connected"
                );
                // Published under the bring-up lock so a concurrent
                // teardown sees the connection and the frontend together.
                state.connection = Some(connection);
                state.initialized = true;
                state.backoff.reset();
                self.state.lock().frontend = Some(frontend);
                self.hv.unmask(port);
                drop(state);
                tracing::debug!(step = ?BringupStep::Ready, "bring-up");
            }
            Err(BringupError::Abandoned) => {
                drop(state);
                tracing::info!("bring-up abandoned after device reset");
                self.reset_device();
            }
            Err(err) => {
                if state.ticket != ticket {
                    // A newer attempt is already queued.
                    return;
                }
                let delay = state.backoff.next_delay();
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    failures = state.backoff.failures(),
                    delay_ms = delay.as_millis() as u64,
                    "bring-up failed, retrying"
                );
                self.schedule_bringup(&mut state, delay);
            }
        }
    }

    fn connect(&self, epoch: u64) -> Result<Connection, BringupError> {
        let hv = self.hv.as_ref();
        self.check_epoch(epoch, BringupStep::Discovering)?;
        let frontend = discover(
            self.store.as_ref(),
            &self.config.store_root,
            self.config.base_address,
        )?;
        let domid = frontend.domid;
        let vcpus = hv
            .vcpu_count(domid)
            .map_err(|err| BringupError::VcpuCount(domid, err))?;

        let mut rollback = Rollback {
            hv,
            domid,
            server: None,
            port: None,
        };
        let server = hv
            .create_ioreq_server(domid)
            .map_err(BringupError::CreateServer)?;
        rollback.server = Some(server);
        self.check_epoch(epoch, BringupStep::ServerCreated)?;

        let base = self.config.base_address;
        hv.map_mmio_range_to_ioreq_server(domid, server, base..=base + self.config.mmio_size - 1)
            .map_err(|err| BringupError::MapRange(server, err))?;
        self.check_epoch(epoch, BringupStep::RangeMapped)?;

        let page = hv
            .acquire_ioreq_page(domid, server)
            .map_err(|err| BringupError::AcquirePage(server, err))?;
        self.check_epoch(epoch, BringupStep::ResourceAcquired)?;

        let remote_port = page.load(0).vp_eport;
        let this = self.this.clone();
        let port = hv
            .bind_interdomain(
                domid,
                remote_port,
                Box::new(move || {
                    if let Some(this) = this.upgrade() {
                        this.handle_ioreq_event();
                    }
                }),
            )
            .map_err(|err| BringupError::BindChannel(remote_port, err))?;
        rollback.port = Some(port);
        self.check_epoch(epoch, BringupStep::ChannelBound)?;

        hv.set_ioreq_server_state(domid, server, true)
            .map_err(|err| BringupError::EnableServer(server, err))?;

        rollback.server = None;
        rollback.port = None;
        Ok(Connection {
            frontend,
            server,
            page,
            port,
            vcpus,
        })
    }
}
