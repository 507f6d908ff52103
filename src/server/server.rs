//! Call execution.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::core::RuntimeError;
use crate::rpc::{RuntimeInner, RxCall, RxRuntime};

/// Errors that can occur starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// No service was registered before starting.
    #[error("no services registered")]
    NoServices,

    /// Runtime failure.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// A worker task panicked or was cancelled.
    #[error("worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// Runtime is shut down.
    #[error("server shut down")]
    Shutdown,
}

/// The worker pool of a runtime.
///
/// Starts one worker per guaranteed slot of every service plus enough
/// extra for the largest service to reach its ceiling. Each worker takes
/// the next dispatched call, runs the service's handler between its
/// `before` and `after` hooks and ends the call with the handler's status.
///
/// # Example
///
/// ```ignore
/// use rx_protocol::prelude::*;
///
/// let runtime = RxRuntime::bind(config).await?;
/// runtime.register_service(ServiceBuilder::new(1, Arc::new(Echo)).build()?)?;
/// let server = RxServer::start(&runtime)?;
/// // ...
/// runtime.shutdown();
/// server.join().await?;
/// ```
#[derive(Debug)]
pub struct RxServer {
    workers: Vec<JoinHandle<()>>,
}

impl RxServer {
    /// Spawn the workers for every service registered so far.
    pub fn start(runtime: &RxRuntime) -> Result<Self, ServerError> {
        Self::spawn(runtime.inner())
    }

    pub(crate) fn spawn(rt: &Arc<RuntimeInner>) -> Result<Self, ServerError> {
        if rt.is_closed() {
            return Err(ServerError::Shutdown);
        }
        let count = rt.dispatcher.worker_count();
        if count == 0 {
            return Err(ServerError::NoServices);
        }

        let workers = (0..count)
            .map(|id| tokio::spawn(worker(Arc::clone(rt), id)))
            .collect();
        info!(workers = count, "server started");
        Ok(Self { workers })
    }

    /// Number of worker tasks.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit. Workers exit once the runtime shuts
    /// down and their current call ends.
    pub async fn join(self) -> Result<(), ServerError> {
        for worker in self.workers {
            worker.await?;
        }
        Ok(())
    }
}

async fn worker(rt: Arc<RuntimeInner>, id: u32) {
    rt.pool.reserve(rt.config.window as usize + 2);
    trace!(worker = id, "worker ready");

    while let Some(call) = rt.dispatcher.get_call().await {
        if !rt.begin_server_call(&call) {
            continue;
        }
        let Some(service) = call.conn.service.clone() else {
            rt.finish_call(&call);
            continue;
        };

        let mut rx = RxCall::new(Arc::clone(&rt), call);
        debug!(
            worker = id,
            service_id = service.id,
            peer = %rx.peer_addr(),
            channel = rx.channel(),
            "serving call"
        );
        service.handler.before(&rx);
        let rc = service.handler.handle(&mut rx).await;
        service.handler.after(&rx, rc);
        if let Err(err) = rx.end(rc).await {
            debug!(worker = id, %err, "call ended with error");
        }
    }
    trace!(worker = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::core::{RxError, lock};
    use crate::rpc::{CallHandler, CallState, ServiceBuilder, TestRuntime};
    use crate::transport::{Header, PacketFlags, PacketType};

    fn request(flags: PacketFlags) -> Header {
        let mut header = Header::new(PacketType::Data);
        header.epoch = 3;
        header.cid = 0x100;
        header.call_number = 1;
        header.seq = 1;
        header.serial = 1;
        header.service_id = 1;
        header.flags = PacketFlags::CLIENT_INITIATED.with(flags);
        header
    }

    /// Ends every call with the status stored as service data and records
    /// the hook calls.
    #[derive(Default)]
    struct Hooked {
        before: AtomicU32,
        after: Mutex<Vec<(u32, i32)>>,
    }

    #[async_trait]
    impl CallHandler for Hooked {
        async fn handle(&self, call: &mut RxCall) -> i32 {
            call.service_data::<i32>().map_or(-1, |rc| *rc)
        }

        fn before(&self, _call: &RxCall) {
            self.before.fetch_add(1, Ordering::SeqCst);
        }

        fn after(&self, _call: &RxCall, rc: i32) {
            let before = self.before.load(Ordering::SeqCst);
            lock(&self.after).push((before, rc));
        }
    }

    #[test]
    fn test_start_without_services_fails() {
        let t = TestRuntime::new();
        assert!(matches!(RxServer::spawn(&t.rt), Err(ServerError::NoServices)));
    }

    #[tokio::test]
    async fn test_worker_reserves_packets() {
        let t = TestRuntime::server(1);
        let before = t.rt.pool.stats().total;
        let server = RxServer::spawn(&t.rt).unwrap();
        assert_eq!(server.worker_count(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(t.rt.pool.stats().total, before + 17);
    }

    #[tokio::test]
    async fn test_worker_echoes_request() {
        let t = TestRuntime::server(1);
        let _server = RxServer::spawn(&t.rt).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        t.inject(request(PacketFlags::LAST_PACKET), b"ping");

        let mut reply = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            reply = t
                .wire
                .take_headers()
                .into_iter()
                .find(|(header, _)| header.packet_type == PacketType::Data);
            if reply.is_some() {
                break;
            }
        }
        let (header, body) = reply.unwrap();
        assert_eq!(body, b"ping");
        assert!(header.flags.is_last_packet());
        assert!(!header.flags.is_client_initiated());

        let conn = lock(&t.rt.conns).values().next().cloned().unwrap();
        let call = lock(&conn.inner).calls[0].clone().unwrap();
        assert_eq!(call.state(), CallState::Dally);
    }

    #[tokio::test]
    async fn test_flush_then_end_sends_one_last_packet() {
        let t = TestRuntime::server(1);
        t.inject(request(PacketFlags::LAST_PACKET), b"ping");
        let call = t.rt.dispatcher.get_call().await.unwrap();
        assert!(t.rt.begin_server_call(&call));

        let mut rx = RxCall::new(Arc::clone(&t.rt), call);
        let mut body = Vec::new();
        rx.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"ping");
        rx.write(b"pong").await.unwrap();
        rx.flush().await.unwrap();
        // The reply is complete; nothing more may be written.
        assert_eq!(rx.write(b"more").await, Err(RxError::InvalidOperation));
        rx.end(0).await.unwrap();

        let sent: Vec<_> = t
            .sent_of(PacketType::Data)
            .iter()
            .map(|header| (header.seq, header.flags.is_last_packet()))
            .collect();
        assert_eq!(sent, vec![(1, true)]);
    }

    #[tokio::test]
    async fn test_end_without_reply_sends_empty_last_packet() {
        let t = TestRuntime::server(1);
        t.inject(request(PacketFlags::LAST_PACKET), b"ping");
        let call = t.rt.dispatcher.get_call().await.unwrap();
        assert!(t.rt.begin_server_call(&call));

        let mut rx = RxCall::new(Arc::clone(&t.rt), call);
        let mut body = Vec::new();
        rx.read_to_end(&mut body).await.unwrap();
        rx.end(0).await.unwrap();

        let sent = t.sent_of(PacketType::Data);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].seq, 1);
        assert!(sent[0].flags.is_last_packet());
    }

    #[tokio::test]
    async fn test_hooks_run_around_handler() {
        let t = TestRuntime::new();
        let hooked = Arc::new(Hooked::default());
        let service = ServiceBuilder::new(1, hooked.clone()).data(7i32).build().unwrap();
        t.rt.register_service(service).unwrap();
        let _server = RxServer::spawn(&t.rt).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        t.inject(request(PacketFlags::LAST_PACKET), b"ping");

        for _ in 0..50 {
            if !lock(&hooked.after).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // `before` ran first, `after` saw the handler's status.
        assert_eq!(*lock(&hooked.after), vec![(1, 7)]);
        assert_eq!(hooked.before.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let t = TestRuntime::server(1);
        let server = RxServer::spawn(&t.rt).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        t.rt.finalize();
        tokio::time::timeout(Duration::from_secs(1), server.join())
            .await
            .unwrap()
            .unwrap();
    }
}
