// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory stand-ins for the hypervisor, the store and the work queue.

use crate::dispatch::Job;
use crate::dispatch::WorkQueue;
use crate::hypervisor::DomainId;
use crate::hypervisor::EventHandler;
use crate::hypervisor::EventPort;
use crate::hypervisor::GrantHandle;
use crate::hypervisor::GrantMapOp;
use crate::hypervisor::GrantRef;
use crate::hypervisor::GrantUnmapOp;
use crate::hypervisor::HostPages;
use crate::hypervisor::HvError;
use crate::hypervisor::Hypervisor;
use crate::hypervisor::IoreqServerId;
use crate::hypervisor::StoreError;
use crate::hypervisor::WatchHandler;
use crate::hypervisor::XenStore;
use crate::hypervisor::GNTST_OKAY;
use crate::ioreq::IoRequest;
use crate::ioreq::IoreqFlags;
use crate::ioreq::IoreqPage;
use crate::ioreq::IOREQ_TYPE_COPY;
use crate::ioreq::STATE_IOREQ_READY;
use crate::ioreq::STATE_IORESP_READY;
use crate::spec::grant::XEN_PAGE_SIZE;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(filter)
            .try_init();
    });
}

/// Event port the frontend advertises in slot 0 of the ioreq page.
pub const REMOTE_PORT: EventPort = 17;

const GNTST_GENERAL_ERROR: i16 = -1;

/// A bring-up hypercall that can be made to fail.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MockStep {
    VcpuCount,
    CreateServer,
    MapRange,
    AcquirePage,
    Bind,
    Enable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockServer {
    pub domid: DomainId,
    pub range: Option<RangeInclusive<u64>>,
    pub enabled: bool,
}

pub struct MockIoreqPage {
    slots: Mutex<Vec<IoRequest>>,
}

impl IoreqPage for MockIoreqPage {
    fn load(&self, vcpu: u32) -> IoRequest {
        self.slots.lock()[vcpu as usize]
    }

    fn store(&self, vcpu: u32, req: &IoRequest) {
        self.slots.lock()[vcpu as usize] = *req;
    }
}

#[derive(Default)]
struct MockState {
    allocations: HashMap<usize, Box<[u8]>>,
    grants: HashMap<u32, (DomainId, GrantRef, bool)>,
    next_handle: u32,
    failing_grants: HashSet<GrantRef>,
    map_calls: usize,
    unmap_calls: usize,
    failing_steps: HashSet<MockStep>,
    servers: BTreeMap<IoreqServerId, MockServer>,
    next_server: IoreqServerId,
    handlers: HashMap<EventPort, Arc<dyn Fn() + Send + Sync>>,
    next_port: EventPort,
    unmasked: HashSet<EventPort>,
    notified: Vec<EventPort>,
    irq_levels: Vec<(u32, bool)>,
    create_hook: Option<Box<dyn FnOnce() + Send>>,
}

pub struct MockHypervisor {
    state: Mutex<MockState>,
    page: Arc<MockIoreqPage>,
}

impl MockHypervisor {
    pub fn new() -> Arc<Self> {
        let mut slot = IoRequest::new_zeroed();
        slot.vp_eport = REMOTE_PORT;
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_handle: 1,
                next_server: 1,
                next_port: 100,
                ..Default::default()
            }),
            page: Arc::new(MockIoreqPage {
                slots: Mutex::new(vec![slot; 2]),
            }),
        })
    }

    fn fails(&self, step: MockStep) -> Result<(), HvError> {
        if self.state.lock().failing_steps.contains(&step) {
            return Err(HvError::Errno(22));
        }
        Ok(())
    }

    pub fn fail_grant(&self, gref: GrantRef) {
        self.state.lock().failing_grants.insert(gref);
    }

    pub fn fail_step(&self, step: MockStep) {
        self.state.lock().failing_steps.insert(step);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_steps.clear();
        state.failing_grants.clear();
    }

    /// Runs `hook` from inside the next ioreq server creation.
    pub fn on_create_server(&self, hook: impl FnOnce() + Send + 'static) {
        self.state.lock().create_hook = Some(Box::new(hook));
    }

    /// Live grant mappings as `(domid, gref, writable)`, sorted.
    pub fn mapped_grants(&self) -> Vec<(DomainId, GrantRef, bool)> {
        let mut grants: Vec<_> = self.state.lock().grants.values().copied().collect();
        grants.sort();
        grants
    }

    pub fn map_calls(&self) -> usize {
        self.state.lock().map_calls
    }

    pub fn unmap_calls(&self) -> usize {
        self.state.lock().unmap_calls
    }

    pub fn allocated_pages(&self) -> usize {
        self.state
            .lock()
            .allocations
            .values()
            .map(|buf| buf.len() / XEN_PAGE_SIZE as usize)
            .sum()
    }

    pub fn servers(&self) -> Vec<(IoreqServerId, MockServer)> {
        self.state
            .lock()
            .servers
            .iter()
            .map(|(&id, server)| (id, server.clone()))
            .collect()
    }

    pub fn bound_ports(&self) -> Vec<EventPort> {
        let mut ports: Vec<_> = self.state.lock().handlers.keys().copied().collect();
        ports.sort();
        ports
    }

    pub fn is_unmasked(&self, port: EventPort) -> bool {
        self.state.lock().unmasked.contains(&port)
    }

    pub fn notified(&self) -> Vec<EventPort> {
        self.state.lock().notified.clone()
    }

    /// Last level driven on `irq`.
    pub fn irq_level(&self, irq: u32) -> bool {
        self.state
            .lock()
            .irq_levels
            .iter()
            .rev()
            .find(|(line, _)| *line == irq)
            .is_some_and(|&(_, level)| level)
    }

    pub fn irq_changes(&self) -> usize {
        self.state.lock().irq_levels.len()
    }

    /// Signals every bound port.
    pub fn fire_events(&self) {
        let handlers: Vec<_> = self.state.lock().handlers.values().cloned().collect();
        for handler in handlers {
            handler();
        }
    }

    /// Posts `req` in slot 0 as the hypervisor would, signals the backend
    /// and returns the slot afterwards.
    pub fn post_ioreq(&self, mut req: IoRequest) -> IoRequest {
        req.vp_eport = REMOTE_PORT;
        req.set_state(STATE_IOREQ_READY);
        self.page.store(0, &req);
        self.fire_events();
        self.page.load(0)
    }

    /// A guest access of `size` bytes at guest physical `addr`. Writes pass
    /// `Some(data)`. Returns the data of the completed request.
    pub fn guest_access(&self, addr: u64, size: u32, data: Option<u64>) -> u64 {
        let mut req = IoRequest::new_zeroed();
        req.addr = addr;
        req.size = size;
        req.count = 1;
        req.ty = IOREQ_TYPE_COPY;
        req.flags = IoreqFlags::new().with_dir(data.is_none());
        req.data = data.unwrap_or(0);
        let resp = self.post_ioreq(req);
        assert_eq!(resp.state(), STATE_IORESP_READY);
        resp.data
    }
}

impl Hypervisor for MockHypervisor {
    fn alloc_pages(&self, count: usize) -> Result<HostPages, HvError> {
        let buf = vec![0u8; count * XEN_PAGE_SIZE as usize].into_boxed_slice();
        let base = buf.as_ptr() as usize;
        self.state.lock().allocations.insert(base, buf);
        // SAFETY: the buffer stays allocated until free_pages.
        Ok(unsafe { HostPages::new(base, count) })
    }

    fn free_pages(&self, pages: HostPages) {
        let buf = self
            .state
            .lock()
            .allocations
            .remove(&pages.base())
            .expect("freeing unknown pages");
        assert_eq!(buf.len(), pages.count() * XEN_PAGE_SIZE as usize);
    }

    fn map_grant_refs(&self, ops: &mut [GrantMapOp]) -> Result<(), HvError> {
        let mut state = self.state.lock();
        state.map_calls += 1;
        for op in ops {
            assert!(
                state.allocations.iter().any(|(&base, buf)| {
                    op.host_addr >= base && op.host_addr < base + buf.len()
                }),
                "mapping into unallocated memory"
            );
            if state.failing_grants.contains(&op.gref) {
                op.status = GNTST_GENERAL_ERROR;
                continue;
            }
            let handle = state.next_handle;
            state.next_handle += 1;
            state
                .grants
                .insert(handle, (op.domid, op.gref, !op.readonly));
            op.status = GNTST_OKAY;
            op.handle = GrantHandle(handle);
        }
        Ok(())
    }

    fn unmap_grant_refs(&self, ops: &mut [GrantUnmapOp]) -> Result<(), HvError> {
        let mut state = self.state.lock();
        state.unmap_calls += 1;
        for op in ops {
            op.status = match state.grants.remove(&op.handle.0) {
                Some(_) => GNTST_OKAY,
                None => GNTST_GENERAL_ERROR,
            };
        }
        Ok(())
    }

    fn vcpu_count(&self, _domid: DomainId) -> Result<u32, HvError> {
        self.fails(MockStep::VcpuCount)?;
        Ok(2)
    }

    fn create_ioreq_server(&self, domid: DomainId) -> Result<IoreqServerId, HvError> {
        let hook = self.state.lock().create_hook.take();
        if let Some(hook) = hook {
            hook();
        }
        self.fails(MockStep::CreateServer)?;
        let mut state = self.state.lock();
        let id = state.next_server;
        state.next_server += 1;
        state.servers.insert(
            id,
            MockServer {
                domid,
                range: None,
                enabled: false,
            },
        );
        Ok(id)
    }

    fn map_mmio_range_to_ioreq_server(
        &self,
        domid: DomainId,
        server: IoreqServerId,
        range: RangeInclusive<u64>,
    ) -> Result<(), HvError> {
        self.fails(MockStep::MapRange)?;
        let mut state = self.state.lock();
        let server = state.servers.get_mut(&server).ok_or(HvError::Errno(2))?;
        assert_eq!(server.domid, domid);
        server.range = Some(range);
        Ok(())
    }

    fn set_ioreq_server_state(
        &self,
        _domid: DomainId,
        server: IoreqServerId,
        enabled: bool,
    ) -> Result<(), HvError> {
        if enabled {
            self.fails(MockStep::Enable)?;
        }
        let mut state = self.state.lock();
        let server = state.servers.get_mut(&server).ok_or(HvError::Errno(2))?;
        server.enabled = enabled;
        Ok(())
    }

    fn destroy_ioreq_server(&self, _domid: DomainId, server: IoreqServerId) {
        assert!(
            self.state.lock().servers.remove(&server).is_some(),
            "destroying unknown server {server}"
        );
    }

    fn acquire_ioreq_page(
        &self,
        _domid: DomainId,
        server: IoreqServerId,
    ) -> Result<Arc<dyn IoreqPage>, HvError> {
        self.fails(MockStep::AcquirePage)?;
        assert!(self.state.lock().servers.contains_key(&server));
        Ok(self.page.clone())
    }

    fn bind_interdomain(
        &self,
        _domid: DomainId,
        remote_port: EventPort,
        handler: EventHandler,
    ) -> Result<EventPort, HvError> {
        assert_eq!(remote_port, REMOTE_PORT);
        self.fails(MockStep::Bind)?;
        let mut state = self.state.lock();
        let port = state.next_port;
        state.next_port += 1;
        state.handlers.insert(port, Arc::from(handler));
        Ok(port)
    }

    fn unbind(&self, port: EventPort) {
        let mut state = self.state.lock();
        assert!(state.handlers.remove(&port).is_some(), "unbinding port {port}");
        state.unmasked.remove(&port);
    }

    fn unmask(&self, port: EventPort) {
        self.state.lock().unmasked.insert(port);
    }

    fn notify(&self, port: EventPort) {
        self.state.lock().notified.push(port);
    }

    fn set_irq_level(&self, _domid: DomainId, irq: u32, level: bool) -> Result<(), HvError> {
        self.state.lock().irq_levels.push((irq, level));
        Ok(())
    }
}

type StoreWatch = (String, Arc<dyn Fn(&str) + Send + Sync>);

#[derive(Default)]
pub struct MockStore {
    entries: Mutex<BTreeMap<String, String>>,
    watches: Mutex<BTreeMap<u64, StoreWatch>>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sets `path` and fires the watches above it.
    pub fn write(&self, path: &str, value: &str) {
        self.entries
            .lock()
            .insert(path.to_owned(), value.to_owned());
        let handlers: Vec<_> = self
            .watches
            .lock()
            .values()
            .filter(|(watched, _)| path.starts_with(watched.as_str()))
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(path);
        }
    }

    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }
}

impl XenStore for MockStore {
    fn directory(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{path}/");
        let mut children: Vec<String> = self
            .entries
            .lock()
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_owned())
            .collect();
        children.dedup();
        if children.is_empty() {
            return Err(StoreError::NotFound(path.to_owned()));
        }
        Ok(children)
    }

    fn read(&self, path: &str) -> Result<String, StoreError> {
        self.entries
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_owned()))
    }

    fn watch(&self, path: &str, handler: WatchHandler) -> Result<u64, StoreError> {
        let mut watches = self.watches.lock();
        let token = watches.keys().next_back().map_or(1, |last| last + 1);
        watches.insert(token, (path.to_owned(), Arc::from(handler)));
        Ok(token)
    }

    fn unwatch(&self, token: u64) {
        self.watches.lock().remove(&token);
    }
}

/// A [`WorkQueue`] that only runs jobs when told to.
#[derive(Default)]
pub struct ManualWorkQueue {
    jobs: Mutex<VecDeque<(Duration, Job)>>,
}

impl ManualWorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delays of the queued jobs, in submission order.
    pub fn delays(&self) -> Vec<Duration> {
        self.jobs.lock().iter().map(|(delay, _)| *delay).collect()
    }

    /// Runs the oldest job regardless of its delay.
    pub fn run_next(&self) -> Option<Duration> {
        let (delay, job) = self.jobs.lock().pop_front()?;
        job();
        Some(delay)
    }

    /// Runs jobs without delay, including ones they queue, until none is
    /// left.
    pub fn run_immediate(&self) {
        loop {
            let job = {
                let mut jobs = self.jobs.lock();
                let Some(index) = jobs.iter().position(|(delay, _)| delay.is_zero()) else {
                    break;
                };
                jobs.remove(index)
            };
            if let Some((_, job)) = job {
                job();
            }
        }
    }
}

impl WorkQueue for ManualWorkQueue {
    fn schedule(&self, delay: Duration, job: Job) {
        self.jobs.lock().push_back((delay, job));
    }
}
