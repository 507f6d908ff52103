//! Handing incoming calls to server workers.
//!
//! Workers park in an idle queue; calls that cannot be served right away
//! wait in an incoming queue. Per-service quotas guarantee every service
//! its minimum worker count while capping it at its maximum.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::Ordering;

use tokio::sync::oneshot;
use tracing::trace;

use crate::core::lock;

use super::call::Call;
use super::service::Service;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ServiceLoad {
    running: u32,
    min: u32,
    max: u32,
}

/// Per-service worker accounting.
///
/// `min_deficit` is the number of workers that must stay available so
/// every service can reach its minimum.
#[derive(Debug, Default)]
pub(crate) struct QuotaTable {
    services: HashMap<u16, ServiceLoad>,
    min_deficit: u32,
}

impl QuotaTable {
    pub(crate) fn register(&mut self, service: &Service) {
        self.services.insert(
            service.id,
            ServiceLoad {
                running: 0,
                min: service.min_procs,
                max: service.max_procs,
            },
        );
        self.min_deficit += service.min_procs;
    }

    /// Whether a call for `service_id` may start given `avail` idle workers.
    pub(crate) fn quota_ok(&self, service_id: u16, avail: usize) -> bool {
        let Some(load) = self.services.get(&service_id) else {
            return false;
        };
        if load.running >= load.max {
            return false;
        }
        if load.running < load.min {
            return true;
        }
        avail > self.min_deficit as usize
    }

    pub(crate) fn start(&mut self, service_id: u16) {
        if let Some(load) = self.services.get_mut(&service_id) {
            load.running += 1;
            if load.running <= load.min {
                self.min_deficit = self.min_deficit.saturating_sub(1);
            }
        }
    }

    pub(crate) fn finish(&mut self, service_id: u16) {
        if let Some(load) = self.services.get_mut(&service_id) {
            if load.running <= load.min && load.running > 0 {
                self.min_deficit += 1;
            }
            load.running = load.running.saturating_sub(1);
        }
    }

    pub(crate) fn running(&self, service_id: u16) -> u32 {
        self.services.get(&service_id).map_or(0, |load| load.running)
    }

    pub(crate) fn min_deficit(&self) -> u32 {
        self.min_deficit
    }

    /// Workers needed so every service can run at its maximum while the
    /// minimums stay reserved.
    pub(crate) fn worker_count(&self) -> u32 {
        let total_min: u32 = self.services.values().map(|load| load.min).sum();
        let extra = self
            .services
            .values()
            .map(|load| load.max - load.min)
            .max()
            .unwrap_or(0);
        total_min + extra
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    quota: QuotaTable,
    idle: VecDeque<oneshot::Sender<Arc<Call>>>,
    incoming: VecDeque<Arc<Call>>,
    closed: bool,
}

impl DispatchState {
    /// Pop the first queued call whose service is within quota.
    fn take_runnable(&mut self) -> Option<Arc<Call>> {
        let avail = self.idle.len() + 1;
        let position = self.incoming.iter().position(|call| {
            call.conn
                .service
                .as_ref()
                .is_some_and(|service| self.quota.quota_ok(service.id, avail))
        })?;
        let call = self.incoming.remove(position)?;
        self.claim(&call);
        Some(call)
    }

    fn claim(&mut self, call: &Arc<Call>) {
        if let Some(service) = &call.conn.service {
            self.quota.start(service.id);
        }
        call.claimed.store(true, Ordering::Release);
    }

    fn unclaim(&mut self, call: &Arc<Call>) {
        if call.claimed.swap(false, Ordering::AcqRel) {
            if let Some(service) = &call.conn.service {
                self.quota.finish(service.id);
            }
        }
    }
}

/// Dispatch lock and queues.
///
/// The dispatch lock may be taken while a call lock is held, never the
/// other way round.
#[derive(Debug, Default)]
pub(crate) struct Dispatcher {
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub(crate) fn register(&self, service: &Service) {
        lock(&self.state).quota.register(service);
    }

    pub(crate) fn worker_count(&self) -> u32 {
        lock(&self.state).quota.worker_count()
    }

    /// Offer a PRECALL call to an idle worker, queueing it otherwise.
    /// Returns whether a worker took it.
    pub(crate) fn offer(&self, call: &Arc<Call>) -> bool {
        let mut state = lock(&self.state);
        if call.claimed.load(Ordering::Acquire) || state.closed {
            return false;
        }
        let Some(service_id) = call.conn.service.as_ref().map(|s| s.id) else {
            return false;
        };

        while state.quota.quota_ok(service_id, state.idle.len()) {
            let Some(worker) = state.idle.pop_front() else {
                break;
            };
            state.claim(call);
            match worker.send(Arc::clone(call)) {
                Ok(()) => {
                    state.incoming.retain(|queued| !Arc::ptr_eq(queued, call));
                    return true;
                }
                Err(_) => state.unclaim(call),
            }
        }

        if !state.incoming.iter().any(|queued| Arc::ptr_eq(queued, call)) {
            trace!(service_id, queued = state.incoming.len(), "no worker available, call queued");
            state.incoming.push_back(Arc::clone(call));
        }
        false
    }

    /// Wait for the next call to serve. `None` once the dispatcher closed.
    pub(crate) async fn get_call(&self) -> Option<Arc<Call>> {
        let waiter = {
            let mut state = lock(&self.state);
            if state.closed {
                return None;
            }
            if let Some(call) = state.take_runnable() {
                return Some(call);
            }
            let (tx, rx) = oneshot::channel();
            state.idle.push_back(tx);
            rx
        };
        waiter.await.ok()
    }

    /// Release a call's worker slot.
    pub(crate) fn release(&self, call: &Arc<Call>) {
        lock(&self.state).unclaim(call);
    }

    /// Drop a call from the incoming queue.
    pub(crate) fn remove(&self, call: &Arc<Call>) {
        lock(&self.state)
            .incoming
            .retain(|queued| !Arc::ptr_eq(queued, call));
    }

    /// Stop handing out calls; idle workers wake with `None`.
    pub(crate) fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.idle.clear();
        state.incoming.clear();
    }

    pub(crate) fn idle_workers(&self) -> usize {
        lock(&self.state).idle.len()
    }

    pub(crate) fn queued_calls(&self) -> usize {
        lock(&self.state).incoming.len()
    }

    #[cfg(test)]
    pub(crate) fn quota_snapshot(&self, service_id: u16) -> (u32, u32) {
        let state = lock(&self.state);
        (state.quota.running(service_id), state.quota.min_deficit())
    }
}
