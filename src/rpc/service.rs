//! Services: what a server answers, with which security and how many
//! concurrent workers.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::RuntimeError;
use crate::core::constants::*;
use crate::security::{NULL_SECURITY_INDEX, NullSecurity, SecurityObject};

use super::call::RxCall;

/// Application code that executes one incoming call.
///
/// The handler reads the request from `call`, writes the reply and
/// returns the status the call should end with: zero for success,
/// anything else is sent to the client as an abort code.
///
/// `before` and `after` run on the worker around every `handle`, after the
/// call became active and before it is ended.
#[async_trait]
pub trait CallHandler: Send + Sync {
    /// Execute one call.
    async fn handle(&self, call: &mut RxCall) -> i32;

    /// Called before `handle`.
    fn before(&self, _call: &RxCall) {}

    /// Called with `handle`'s status, before the call is ended with it.
    fn after(&self, _call: &RxCall, _rc: i32) {}
}

/// Application data attached to a service.
pub type ServiceData = Arc<dyn Any + Send + Sync>;

/// A registered service.
pub struct Service {
    pub(crate) id: u16,
    pub(crate) name: String,
    pub(crate) security: Vec<Option<Arc<dyn SecurityObject>>>,
    pub(crate) handler: Arc<dyn CallHandler>,
    pub(crate) min_procs: u32,
    pub(crate) max_procs: u32,
    /// Seconds a server call may wait for its request; zero disables.
    pub(crate) idle_dead_time: u32,
    /// Dead time applied to the service's connections.
    pub(crate) conn_dead_time: u32,
    pub(crate) data: Option<ServiceData>,
}

impl Service {
    /// Service id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Human readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Guaranteed concurrent workers.
    pub fn min_procs(&self) -> u32 {
        self.min_procs
    }

    /// Concurrent worker ceiling.
    pub fn max_procs(&self) -> u32 {
        self.max_procs
    }

    /// Security object registered for `index`.
    pub fn security_object(&self, index: u8) -> Option<Arc<dyn SecurityObject>> {
        self.security.get(usize::from(index)).cloned().flatten()
    }

    /// The attached data, if it is a `T`.
    pub fn data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.data.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("security_classes", &self.security.iter().flatten().count())
            .field("min_procs", &self.min_procs)
            .field("max_procs", &self.max_procs)
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

/// Builder for [`Service`].
pub struct ServiceBuilder {
    id: u16,
    name: String,
    security: Vec<Option<Arc<dyn SecurityObject>>>,
    handler: Arc<dyn CallHandler>,
    min_procs: u32,
    max_procs: u32,
    idle_dead_time: u32,
    conn_dead_time: u32,
    data: Option<ServiceData>,
}

impl ServiceBuilder {
    /// Start a service with the given id and handler.
    pub fn new(id: u16, handler: Arc<dyn CallHandler>) -> Self {
        Self {
            id,
            name: format!("service-{id}"),
            security: Vec::new(),
            handler,
            min_procs: 1,
            max_procs: 1,
            idle_dead_time: DEFAULT_IDLE_DEAD_TIME,
            conn_dead_time: DEFAULT_CONN_DEAD_TIME,
            data: None,
        }
    }

    /// Set the service name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Accept connections using `object` at security index `index`.
    pub fn security(mut self, index: u8, object: Arc<dyn SecurityObject>) -> Self {
        let slot = usize::from(index);
        if self.security.len() <= slot {
            self.security.resize(slot + 1, None);
        }
        self.security[slot] = Some(object);
        self
    }

    /// Set the guaranteed and maximum number of concurrent workers.
    pub fn procs(mut self, min: u32, max: u32) -> Self {
        self.min_procs = min;
        self.max_procs = max;
        self
    }

    /// Seconds a call may wait for its request; zero disables the limit.
    pub fn idle_dead_time(mut self, seconds: u32) -> Self {
        self.idle_dead_time = seconds;
        self
    }

    /// Dead time for the service's connections.
    pub fn conn_dead_time(mut self, seconds: u32) -> Self {
        self.conn_dead_time = seconds;
        self
    }

    /// Attach application data, readable from every call of the service
    /// through [`RxCall::service_data`]. Replaces earlier data.
    pub fn data<T: Any + Send + Sync>(mut self, data: T) -> Self {
        self.data = Some(Arc::new(data));
        self
    }

    /// Validate and build. Without any security class the null class is
    /// installed at index 0.
    pub fn build(mut self) -> Result<Service, RuntimeError> {
        if self.max_procs == 0 || self.min_procs > self.max_procs {
            return Err(RuntimeError::Config(format!(
                "service {}: procs must satisfy 0 <= min <= max and max > 0, got {}..{}",
                self.id, self.min_procs, self.max_procs
            )));
        }
        if self.conn_dead_time == 0 {
            return Err(RuntimeError::Config(format!(
                "service {}: connection dead time must be non-zero",
                self.id
            )));
        }
        if self.security.iter().all(Option::is_none) {
            self = self.security(NULL_SECURITY_INDEX, Arc::new(NullSecurity::new()));
        }
        Ok(Service {
            id: self.id,
            name: self.name,
            security: self.security,
            handler: self.handler,
            min_procs: self.min_procs,
            max_procs: self.max_procs,
            idle_dead_time: self.idle_dead_time,
            conn_dead_time: self.conn_dead_time,
            data: self.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    #[async_trait]
    impl CallHandler for Nothing {
        async fn handle(&self, _call: &mut RxCall) -> i32 {
            0
        }
    }

    #[test]
    fn test_default_security_is_null() {
        let service = ServiceBuilder::new(3, Arc::new(Nothing)).build().unwrap();
        assert_eq!(service.id(), 3);
        assert_eq!(service.name(), "service-3");
        assert!(service.security_object(0).is_some());
        assert!(service.security_object(1).is_none());
    }

    #[test]
    fn test_security_slots() {
        let service = ServiceBuilder::new(1, Arc::new(Nothing))
            .security(2, Arc::new(NullSecurity::new()))
            .build()
            .unwrap();
        assert!(service.security_object(0).is_none());
        assert_eq!(service.security_object(2).map(|s| s.name()), Some("null"));
    }

    #[test]
    fn test_service_data_is_typed() {
        let service = ServiceBuilder::new(1, Arc::new(Nothing))
            .data(String::from("volumes"))
            .build()
            .unwrap();
        assert_eq!(service.data::<String>().as_deref().map(String::as_str), Some("volumes"));
        assert!(service.data::<u32>().is_none());

        let bare = ServiceBuilder::new(2, Arc::new(Nothing)).build().unwrap();
        assert!(bare.data::<String>().is_none());
    }

    #[test]
    fn test_invalid_procs() {
        let err = ServiceBuilder::new(1, Arc::new(Nothing)).procs(3, 2).build();
        assert!(matches!(err, Err(RuntimeError::Config(_))));
        let err = ServiceBuilder::new(1, Arc::new(Nothing)).procs(0, 0).build();
        assert!(matches!(err, Err(RuntimeError::Config(_))));
    }
}
