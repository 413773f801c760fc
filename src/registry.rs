//! Write-once-at-startup, read-only-while-serving maps from short route to
//! handler or remote descriptor.

use std::{collections::HashMap, future::Future, marker::PhantomData, pin::Pin, sync::Arc};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    context::Context,
    error::Error,
    message::MessageKind,
    serializer::{JsonSerializer, Serializer},
};

/// A boxed, `Send` future, used to erase the concrete handler future type.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased entry point shared by local handlers and `User`-RPC remotes.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Invokes the handler against a raw (possibly already-decoded) payload.
    ///
    /// # Errors
    ///
    /// Returns whatever structured error the handler, or argument
    /// deserialization, produced.
    async fn call(&self, ctx: &Context, raw: Vec<u8>) -> Result<Vec<u8>, Error>;
}

struct TypedHandler<S, Req, Resp, F> {
    serializer: S,
    f: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<S, Req, Resp, F, Fut> Handler for TypedHandler<S, Req, Resp, F>
where
    S: Serializer + Clone,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Context, Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, Error>> + Send,
{
    async fn call(&self, ctx: &Context, raw: Vec<u8>) -> Result<Vec<u8>, Error> {
        let arg: Req = self
            .serializer
            .decode(&raw)
            .map_err(|e| Error::bad_request(e.to_string()))?;
        let resp = (self.f)(ctx.clone(), arg).await?;
        self.serializer
            .encode(&resp)
            .map_err(|e| Error::internal(e.to_string()))
    }
}

struct RawHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for RawHandler<F>
where
    F: Fn(Context, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, Error>> + Send,
{
    async fn call(&self, ctx: &Context, raw: Vec<u8>) -> Result<Vec<u8>, Error> {
        (self.f)(ctx.clone(), raw).await
    }
}

/// Wraps a typed async function as a [`Handler`], decoding the argument and
/// encoding the return value with the JSON reference serializer.
#[must_use]
pub fn typed<Req, Resp, F, Fut>(f: F) -> Arc<dyn Handler>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Error>> + Send + 'static,
{
    Arc::new(TypedHandler {
        serializer: JsonSerializer,
        f,
        _marker: PhantomData,
    })
}

/// Wraps a raw-bytes async function as a [`Handler`], skipping the
/// serializer entirely.
#[must_use]
pub fn raw<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Context, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, Error>> + Send + 'static,
{
    Arc::new(RawHandler { f })
}

/// Metadata about a registered handler or remote, populated at registration
/// time and never mutated afterwards.
pub struct Descriptor {
    /// Whether the argument bytes are passed through without decoding.
    pub raw_bytes: bool,
    /// Message kinds this entry accepts; an empty list means "all".
    pub allowed_kinds: Vec<MessageKind>,
    /// The type-erased callable.
    pub handler: Arc<dyn Handler>,
}

impl Descriptor {
    /// Whether `kind` is acceptable for this descriptor.
    #[must_use]
    pub fn accepts(&self, kind: MessageKind) -> bool {
        self.allowed_kinds.is_empty() || self.allowed_kinds.contains(&kind)
    }
}

/// Attempted to register a route that is already present.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("service already defined: {0}")]
pub struct AlreadyDefined(pub String);

/// A process-wide, route-keyed table of handlers (or remotes).
///
/// Write-only during startup registration; read-only once serving begins —
/// callers must stop calling [`Registry::register`] before the first lookup
/// to uphold that invariant (there is no internal enforcement, matching the
/// source's own startup/serving split).
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, Descriptor>,
}

impl Registry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self { Self { entries: HashMap::new() } }

    /// Registers `descriptor` under `short_route`.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyDefined`] if `short_route` is already registered.
    pub fn register(
        &mut self,
        short_route: impl Into<String>,
        descriptor: Descriptor,
    ) -> Result<(), AlreadyDefined> {
        let short_route = short_route.into();
        if self.entries.contains_key(&short_route) {
            return Err(AlreadyDefined(short_route));
        }
        self.entries.insert(short_route, descriptor);
        Ok(())
    }

    /// Looks up a descriptor by short route.
    #[must_use]
    pub fn get(&self, short_route: &str) -> Option<&Descriptor> { self.entries.get(short_route) }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether the registry has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::session::Session;

    fn ctx() -> Context { Context::new("room.echo", 1, Arc::new(Session::new(1))) }

    #[tokio::test]
    async fn typed_handler_round_trips_json() {
        let handler = typed(|_ctx: Context, msg: String| async move { Ok(msg) });
        let descriptor = Descriptor {
            raw_bytes: false,
            allowed_kinds: Vec::new(),
            handler,
        };
        let out = descriptor
            .handler
            .call(&ctx(), serde_json::to_vec("hi").expect("encode"))
            .await
            .expect("handler should succeed");
        let decoded: String = serde_json::from_slice(&out).expect("decode");
        assert_eq!(decoded, "hi");
    }

    #[tokio::test]
    async fn raw_handler_echoes_bytes() {
        let handler = raw(|_ctx: Context, bytes: Vec<u8>| async move { Ok(bytes) });
        let descriptor = Descriptor {
            raw_bytes: true,
            allowed_kinds: Vec::new(),
            handler,
        };
        let out = descriptor.handler.call(&ctx(), b"hi".to_vec()).await.expect("ok");
        assert_eq!(out, b"hi");
    }

    #[test]
    fn registration_rejects_duplicates() {
        let mut registry = Registry::new();
        let make = || Descriptor {
            raw_bytes: true,
            allowed_kinds: Vec::new(),
            handler: raw(|_ctx: Context, bytes: Vec<u8>| async move { Ok(bytes) }),
        };
        registry.register("room.echo", make()).expect("first registration succeeds");
        assert_eq!(
            registry.register("room.echo", make()),
            Err(AlreadyDefined("room.echo".to_owned()))
        );
    }

    #[test]
    fn accepts_respects_allow_list() {
        let descriptor = Descriptor {
            raw_bytes: true,
            allowed_kinds: vec![MessageKind::Request],
            handler: raw(|_ctx: Context, bytes: Vec<u8>| async move { Ok(bytes) }),
        };
        assert!(descriptor.accepts(MessageKind::Request));
        assert!(!descriptor.accepts(MessageKind::Notify));
    }
}
