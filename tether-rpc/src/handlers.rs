//! Handler registries.
//!
//! A channel owns one registry of request handlers and one of
//! notification handlers. Handlers are async; the channel spawns each
//! invocation so a slow handler never stalls the read loop. Reserved
//! method names are only registrable through the framework-internal
//! entry points.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use hashbrown::HashMap;
use parking_lot::RwLock;

use tether_core::cancel::CancelToken;
use tether_core::error::{Error, Result};
use tether_core::value::Value;

use crate::envelope::{codes, WireError};
use crate::reserved::is_reserved;

/// What a request handler sees.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    pub method: String,
    pub params: Value,
    /// Fires on channel close, shutdown, or request timeout. Checked
    /// cooperatively.
    pub cancel: CancelToken,
}

/// Handler outcome: a result value, or a wire error sent back verbatim.
pub type HandlerResult = std::result::Result<Value, WireError>;

pub type RequestHandler = Arc<dyn Fn(RequestCtx) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

pub type NotificationHandler = Arc<dyn Fn(RequestCtx) -> BoxFuture<'static, ()> + Send + Sync>;

/// Box an async closure as a [`RequestHandler`].
pub fn request_handler<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(RequestCtx) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Box an async closure as a [`NotificationHandler`].
pub fn notification_handler<F, Fut>(f: F) -> NotificationHandler
where
    F: Fn(RequestCtx) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Method-name → handler maps for one channel.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    requests: RwLock<HashMap<String, RequestHandler>>,
    notifications: RwLock<HashMap<String, NotificationHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user request handler. Reserved names are refused.
    pub fn on_request(&self, method: impl Into<String>, handler: RequestHandler) -> Result<()> {
        let method = method.into();
        if is_reserved(&method) {
            return Err(Error::protocol(
                codes::INVALID_REQUEST,
                format!("method {method:?} is reserved for the framework"),
            ));
        }
        self.inner.requests.write().insert(method, handler);
        Ok(())
    }

    /// Register a user notification handler. Reserved names are refused.
    pub fn on_notification(
        &self,
        method: impl Into<String>,
        handler: NotificationHandler,
    ) -> Result<()> {
        let method = method.into();
        if is_reserved(&method) {
            return Err(Error::protocol(
                codes::INVALID_REQUEST,
                format!("method {method:?} is reserved for the framework"),
            ));
        }
        self.inner.notifications.write().insert(method, handler);
        Ok(())
    }

    /// Framework entry point for reserved request responders.
    ///
    /// # Panics
    ///
    /// Panics if `method` is not reserved; wiring a user method through
    /// here is a framework bug, not an input error.
    pub fn register_reserved_request(&self, method: &str, handler: RequestHandler) {
        assert!(is_reserved(method), "{method:?} is not a reserved method");
        self.inner
            .requests
            .write()
            .insert(method.to_string(), handler);
    }

    /// Framework entry point for reserved notification responders.
    ///
    /// # Panics
    ///
    /// Panics if `method` is not reserved.
    pub fn register_reserved_notification(&self, method: &str, handler: NotificationHandler) {
        assert!(is_reserved(method), "{method:?} is not a reserved method");
        self.inner
            .notifications
            .write()
            .insert(method.to_string(), handler);
    }

    #[must_use]
    pub fn request_handler_for(&self, method: &str) -> Option<RequestHandler> {
        self.inner.requests.read().get(method).cloned()
    }

    #[must_use]
    pub fn notification_handler_for(&self, method: &str) -> Option<NotificationHandler> {
        self.inner.notifications.read().get(method).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> RequestHandler {
        request_handler(|ctx: RequestCtx| async move { Ok(ctx.params) })
    }

    #[test]
    fn user_registration_rejects_reserved() {
        let registry = HandlerRegistry::new();
        let err = registry.on_request("__handshake__", echo()).unwrap_err();
        assert_eq!(err.code(), "protocol");
        assert!(registry.request_handler_for("__handshake__").is_none());
    }

    #[test]
    fn lookup_round_trip() {
        let registry = HandlerRegistry::new();
        registry.on_request("echo", echo()).unwrap();
        assert!(registry.request_handler_for("echo").is_some());
        assert!(registry.request_handler_for("missing").is_none());
    }

    #[test]
    fn reserved_registration_requires_reserved_name() {
        let registry = HandlerRegistry::new();
        registry.register_reserved_request("__ping__", echo());
        assert!(registry.request_handler_for("__ping__").is_some());
    }

    #[test]
    #[should_panic(expected = "not a reserved method")]
    fn reserved_registration_panics_on_user_name() {
        let registry = HandlerRegistry::new();
        registry.register_reserved_request("echo", echo());
    }
}
