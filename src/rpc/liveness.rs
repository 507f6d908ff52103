//! Keep-alives, dead call detection and garbage collection.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::core::constants::*;
use crate::core::lock;
use crate::transport::{AckReason, EventHandle};

use super::call::{Call, CallInner, CallState};
use super::connection::Connection;
use super::runtime::{RuntimeInner, Task};

fn secs(seconds: u32) -> Duration {
    Duration::from_secs(u64::from(seconds))
}

impl RuntimeInner {
    /// (Re)arm a call's keep-alive timer.
    pub(crate) fn keepalive_on(&self, call: &Arc<Call>, c: &mut CallInner) {
        let ping = lock(&call.conn.inner).seconds_until_ping;
        let at = self.clock.now() + secs(ping);
        self.cancel_event(&mut c.keepalive_event);
        c.keepalive_event = Some(self.post_event(at, Task::KeepAlive(Arc::clone(call))));
    }

    pub(crate) fn keepalive_event(&self, call: &Arc<Call>, handle: EventHandle) {
        let mut c = lock(&call.inner);
        if c.keepalive_event != Some(handle) {
            return;
        }
        c.keepalive_event = None;
        if self.check_call(call, &mut c) {
            return;
        }

        let ping = lock(&call.conn.inner).seconds_until_ping;
        let now = self.clock.now();
        if c.state != CallState::Dally && now.saturating_since(c.last_send_time) >= secs(ping) {
            self.send_ack(call, &mut c, None, AckReason::Ping);
        }
        self.keepalive_on(call, &mut c);
    }

    /// Enforce the dead, idle and hard time limits. Returns `true` if the
    /// call was failed or freed.
    pub(crate) fn check_call(&self, call: &Arc<Call>, c: &mut CallInner) -> bool {
        let now = self.clock.now();
        let (dead, idle_dead, hard_dead) = {
            let inner = lock(&call.conn.inner);
            (inner.seconds_until_dead, inner.idle_dead_time, inner.hard_dead_time)
        };

        if now.saturating_since(c.last_receive_time) >= secs(dead) {
            if c.state == CallState::Active {
                debug!(channel = call.channel, "peer stopped responding");
                self.call_error(call, c, RX_CALL_DEAD);
            } else {
                self.free_call(call, c);
            }
            return true;
        }
        if c.state != CallState::Active {
            return false;
        }
        if !call.conn.is_client() && idle_dead > 0 {
            if c.start_wait.is_some_and(|since| now.saturating_since(since) >= secs(idle_dead)) {
                debug!(channel = call.channel, "request data never arrived");
                self.call_error(call, c, RX_CALL_TIMEOUT);
                return true;
            }
        }
        if hard_dead > 0 && now.saturating_since(c.start_time) >= secs(hard_dead) {
            debug!(channel = call.channel, "call exceeded its hard limit");
            self.call_error(call, c, RX_CALL_TIMEOUT);
            return true;
        }
        false
    }

    /// Periodic sweep: check every call, then drop idle server connections
    /// and unreferenced peers.
    pub(crate) fn reap(&self) {
        let now = self.clock.now();
        let conns: Vec<Arc<Connection>> = lock(&self.conns).values().cloned().collect();
        for conn in &conns {
            let calls = lock(&conn.inner).installed_calls();
            for call in &calls {
                let mut c = lock(&call.inner);
                self.check_call(call, &mut c);
            }
            if conn.is_client() {
                continue;
            }
            let idle = {
                let inner = lock(&conn.inner);
                inner.calls.iter().all(Option::is_none)
                    && inner.ref_count == 0
                    && now.saturating_since(inner.last_send_time) >= self.config.idle_connection_time
            };
            if idle {
                self.destroy_connection(conn);
            }
        }

        let mut removed = 0;
        lock(&self.peers).retain(|_, peer| {
            let state = lock(&peer.state);
            let idle = state.ref_count == 0
                && state
                    .idle_since
                    .is_some_and(|since| now.saturating_since(since) >= self.config.idle_peer_time);
            removed += usize::from(idle);
            !idle
        });
        if removed > 0 {
            trace!(removed, "idle peers dropped");
        }

        self.pool.wake_waiters();
        self.post_event(now + self.config.reap_interval, Task::Reap);
    }

    /// Tear a connection down, releasing its calls, security state and
    /// peer reference.
    pub(crate) fn destroy_connection(&self, conn: &Arc<Connection>) {
        let calls = lock(&conn.inner).installed_calls();
        for call in &calls {
            let mut c = lock(&call.inner);
            if conn.is_client() && c.delayed_ack_event.is_some() {
                self.cancel_event(&mut c.delayed_ack_event);
                self.send_ack_all(call, &mut c);
            }
            if c.state == CallState::Active {
                self.call_error(call, &mut c, RX_CALL_DEAD);
            } else {
                self.reset_call(call, &mut c);
            }
            self.dispatcher.remove(call);
        }

        let peer = {
            let mut inner = lock(&conn.inner);
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            inner.calls = Default::default();
            self.cancel_event(&mut inner.challenge_event);
            Arc::clone(&inner.peer)
        };
        conn.channel_free.notify_waiters();
        conn.with_security(|security, view| security.destroy_connection(view));
        {
            let mut conns = lock(&self.conns);
            if conns.get(&conn.key).is_some_and(|current| Arc::ptr_eq(current, conn)) {
                conns.remove(&conn.key);
            }
        }
        self.release_peer(&peer);
        debug!(
            cid = format_args!("{:#x}", conn.cid()),
            kind = ?conn.kind(),
            "connection destroyed"
        );
    }

    /// Destroy a released client connection once none of its calls is in
    /// progress.
    pub(crate) fn destroy_client_connection(&self, conn: &Arc<Connection>) {
        let calls = lock(&conn.inner).installed_calls();
        let busy = calls
            .iter()
            .any(|call| !matches!(call.state(), CallState::Dally | CallState::NotInit));
        if !busy {
            self.destroy_connection(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RxConfigBuilder, RxError};
    use crate::rpc::runtime::tests::TestRuntime;
    use crate::transport::{PacketFlags, PacketType};

    #[tokio::test]
    async fn test_keepalive_pings_idle_call() {
        let t = TestRuntime::new();
        let (_conn, _call) = t.client_call().await;
        t.advance(Duration::from_secs(2));
        let pings: Vec<_> = t
            .sent_acks()
            .into_iter()
            .filter(|(_, ack)| ack.reason == AckReason::Ping)
            .collect();
        assert_eq!(pings.len(), 1);
        assert!(pings[0].0.flags.is_request_ack());
    }

    #[tokio::test]
    async fn test_silent_peer_kills_active_call() {
        let t = TestRuntime::new();
        let (_conn, call) = t.client_call().await;
        t.advance(Duration::from_secs(11));
        assert_eq!(call.error(), None);
        t.advance(Duration::from_secs(1));
        assert_eq!(call.error(), Some(RxError::CallDead));
        assert!(lock(&call.inner).keepalive_event.is_none());
    }

    #[tokio::test]
    async fn test_dallying_call_is_freed() {
        let t = TestRuntime::new();
        let (conn, call) = t.client_call().await;
        t.rt.finish_call(&call);
        t.advance(Duration::from_secs(12));
        assert!(lock(&conn.inner).installed_calls().is_empty());
        assert_eq!(t.stats().calls_freed, 1);
        // The next call on the channel must not match stale packets.
        assert_eq!(lock(&conn.inner).call_numbers[0], 2);
    }

    #[tokio::test]
    async fn test_hard_dead_time() {
        let t = TestRuntime::new();
        let (conn, call) = t.client_call().await;
        lock(&conn.inner).hard_dead_time = 4;
        // Pings keep the call alive but cannot extend the hard limit.
        lock(&call.inner).last_receive_time = t.rt.clock.now() + Duration::from_secs(60);
        t.advance(Duration::from_secs(4));
        assert_eq!(call.error(), Some(RxError::CallTimeout));
    }

    #[test]
    fn test_server_idle_dead_time() {
        let t = TestRuntime::server(1);
        let mut header = crate::transport::Header::new(PacketType::Data);
        header.epoch = 3;
        header.cid = 0x100;
        header.call_number = 1;
        header.seq = 1;
        header.serial = 1;
        header.service_id = 1;
        header.flags.insert(PacketFlags::CLIENT_INITIATED);
        t.inject(header, b"partial");

        let conn = lock(&t.rt.conns).values().next().cloned().unwrap();
        lock(&conn.inner).idle_dead_time = 4;
        let call = lock(&conn.inner).calls[0].clone().unwrap();
        assert!(t.rt.begin_server_call(&call));
        {
            let mut c = lock(&call.inner);
            c.start_wait = Some(t.rt.clock.now());
            c.last_receive_time = t.rt.clock.now() + Duration::from_secs(60);
        }
        t.advance(Duration::from_secs(4));
        assert_eq!(call.error(), Some(RxError::CallTimeout));
    }

    #[tokio::test]
    async fn test_fifth_call_waits_for_a_channel() {
        let t = TestRuntime::new();
        let (conn, first) = t.client_call().await;
        for _ in 1..MAX_CALLS {
            t.rt.new_call(&conn).await.unwrap();
        }

        let rt = Arc::clone(&t.rt);
        let waiting_conn = Arc::clone(&conn);
        let waiter = tokio::spawn(async move { rt.new_call(&waiting_conn).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        t.rt.finish_call(&first);
        let call = waiter.await.unwrap().unwrap();
        assert_eq!(call.channel(), 0);
        assert_eq!(lock(&conn.inner).call_numbers[0], 2);
    }

    #[tokio::test]
    async fn test_reaper_drops_idle_server_connection_and_peer() {
        let t = TestRuntime::with_server_config(
            1,
            RxConfigBuilder::new()
                .idle_connection_time(Duration::from_secs(30))
                .idle_peer_time(Duration::from_secs(30))
                .reap_interval(Duration::from_secs(10))
                .build()
                .unwrap(),
        );
        let mut header = crate::transport::Header::new(PacketType::Data);
        header.epoch = 3;
        header.cid = 0x100;
        header.call_number = 1;
        header.seq = 1;
        header.serial = 1;
        header.service_id = 1;
        header.flags = PacketFlags::CLIENT_INITIATED.with(PacketFlags::LAST_PACKET);
        t.inject(header, b"bye");
        assert_eq!(t.stats().connections, 1);

        // The call dies after 12s of silence, the connection 30s after its
        // last send, the peer 30s after that.
        t.advance(Duration::from_secs(50));
        assert_eq!(t.stats().connections, 0);
        assert_eq!(t.stats().peers, 1);
        t.advance(Duration::from_secs(40));
        assert_eq!(t.stats().peers, 0);
    }

    #[tokio::test]
    async fn test_idle_connection_frees_dally_and_flags_active() {
        let t = TestRuntime::new();
        let (conn, active) = t.client_call().await;
        let dallying = t.rt.new_call(&conn).await.unwrap();
        t.rt.finish_call(&dallying);
        assert_eq!(dallying.state(), CallState::Dally);

        t.advance(Duration::from_secs(12));
        assert!(!dallying.is_installed());
        assert_eq!(t.stats().calls_freed, 1);

        // Still holding its slot until the owner ends it.
        assert_eq!(active.error(), Some(RxError::CallDead));
        assert_eq!(active.state(), CallState::Active);
        assert!(active.is_installed());

        assert_eq!(t.rt.finish_call(&active), RX_CALL_DEAD);
        assert_eq!(active.state(), CallState::Dally);
        assert!(active.is_installed());
    }

    #[tokio::test]
    async fn test_destroy_connection_fails_active_calls() {
        let t = TestRuntime::new();
        let (conn, call) = t.client_call().await;
        let other = t.rt.new_call(&conn).await.unwrap();
        t.rt.finish_call(&other);

        t.rt.destroy_connection(&conn);
        assert_eq!(call.error(), Some(RxError::CallDead));
        assert_eq!(other.state(), CallState::NotInit);
        assert!(lock(&conn.inner).destroyed);
        assert_eq!(t.stats().connections, 0);
        assert_eq!(conn.peer().info().ref_count, 0);
    }
}
