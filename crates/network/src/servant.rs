//! Servants: the application objects whose methods are invoked by incoming quests.
//!
//! Each servant carries an explicit method table built once at registration. A method is
//! either typed (fixed input and output shapes, decoded and encoded by the table entry) or
//! generic (raw [`Arguments`] in, raw [`Arguments`] out). A servant built with
//! [`Servant::generic`] routes every method name to one generic handler.

use crate::{error::XicResult, message::Quest};
use async_trait::async_trait;
use futures::{
    future::{self, BoxFuture},
    FutureExt as _,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, fmt, future::Future, sync::Arc};
use thiserror::Error;
use xic_types::{opaque_failure, Arguments, Context, Exception, ARGUMENT_EXCEPTION};

/// The quest being dispatched, as seen by a servant.
#[derive(Debug, Clone)]
pub struct Current {
    txid: i64,
    service: String,
    method: String,
    context: Context,
    incoming: bool,
    peer: Option<Peer>,
}

impl Current {
    pub(crate) fn new(quest: &Quest, incoming: bool) -> Self {
        Self {
            txid: quest.txid,
            service: quest.service.clone(),
            method: quest.method.clone(),
            context: quest.context.clone(),
            incoming,
            peer: None,
        }
    }

    pub(crate) fn with_peer(mut self, peer: Peer) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Transaction id of the quest. Zero for oneway quests.
    pub fn txid(&self) -> i64 {
        self.txid
    }

    /// Target service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Target method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request context sent by the caller.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Whether the quest arrived on an accepted connection.
    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    /// The connection the quest arrived on, for calls back to the caller.
    ///
    /// `None` when the quest was dispatched without a connection. With inline dispatch a
    /// twoway call back waits on the read loop that must deliver its answer, so it only ends
    /// through the call timeout or a close.
    pub fn peer(&self) -> Option<&Peer> {
        self.peer.as_ref()
    }

    /// Raiser descriptor used in failure payloads: `method*service @`.
    pub fn raiser(&self) -> String {
        format!("{}*{} @", self.method, self.service)
    }
}

/// Raw call seam of a connection, independent of its stream type.
pub(crate) trait Invoker: Send + Sync {
    fn call_raw<'a>(
        &'a self,
        service: &'a str,
        method: &'a str,
        context: Context,
        args: Vec<u8>,
        oneway: bool,
    ) -> BoxFuture<'a, XicResult<Vec<u8>>>;

    fn endpoint(&self) -> &str;
}

/// Handle to the connection a quest arrived on.
#[derive(Clone)]
pub struct Peer {
    invoker: Arc<dyn Invoker>,
}

impl Peer {
    pub(crate) fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self { invoker }
    }

    /// Address of the connection's remote side.
    pub fn endpoint(&self) -> &str {
        self.invoker.endpoint()
    }

    /// Call `method` on `service` at the remote side and wait for the typed result.
    pub async fn invoke<I, O>(&self, service: &str, method: &str, args: &I) -> XicResult<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.invoke_with_context(service, method, Context::new(), args).await
    }

    /// Like [`Self::invoke`], sending request metadata along with the arguments.
    pub async fn invoke_with_context<I, O>(
        &self,
        service: &str,
        method: &str,
        context: Context,
        args: &I,
    ) -> XicResult<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let args = xic_types::encode(args)?;
        let out = self.invoker.call_raw(service, method, context, args, false).await?;
        Ok(xic_types::decode(&out)?)
    }

    /// Send a quest that expects no answer.
    pub async fn invoke_oneway<I>(&self, service: &str, method: &str, args: &I) -> XicResult<()>
    where
        I: Serialize + ?Sized,
    {
        let args = xic_types::encode(args)?;
        self.invoker.call_raw(service, method, Context::new(), args, true).await.map(drop)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer").field("endpoint", &self.endpoint()).finish()
    }
}

/// Failure returned by a servant method.
#[derive(Debug, Error)]
pub enum ServantError {
    /// A declared application exception.
    #[error(transparent)]
    Exception(#[from] Exception),
    /// Any other error. Only its message crosses the wire.
    #[error("{0}")]
    Other(String),
}

impl ServantError {
    /// Wrap an arbitrary error as an opaque failure.
    pub fn other(e: impl fmt::Display) -> Self {
        Self::Other(e.to_string())
    }

    /// Build the failure payload for an exceptional answer.
    pub fn to_failure(&self, raiser: &str) -> Arguments {
        match self {
            Self::Exception(ex) => ex.to_failure(raiser),
            Self::Other(message) => opaque_failure(raiser, message),
        }
    }
}

/// Future returned by a method table entry: the encoded output, or a failure.
pub type MethodFuture = BoxFuture<'static, Result<Vec<u8>, ServantError>>;

type MethodFn = Arc<dyn Fn(Current, Vec<u8>) -> MethodFuture + Send + Sync>;

/// A typed method table entry.
#[derive(Clone)]
pub struct TypedMethod {
    oneway: bool,
    call: MethodFn,
}

impl TypedMethod {
    /// Whether the method never produces a result.
    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    /// Decode the arguments, run the method, and encode its output.
    pub fn invoke(&self, current: Current, args: Vec<u8>) -> MethodFuture {
        (self.call)(current, args)
    }
}

impl fmt::Debug for TypedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedMethod").field("oneway", &self.oneway).finish_non_exhaustive()
    }
}

/// Handler invoked with raw argument dictionaries.
#[async_trait]
pub trait GenericServant: Send + Sync + 'static {
    /// Invoke `current.method()` with decoded arguments.
    async fn invoke(&self, current: Current, args: Arguments) -> Result<Arguments, ServantError>;
}

/// One resolved method.
#[derive(Clone)]
pub enum MethodEntry {
    /// Fixed input and output shapes.
    Typed(TypedMethod),
    /// Raw dictionaries in and out.
    Generic(Arc<dyn GenericServant>),
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Typed(method) => method.fmt(f),
            Self::Generic(_) => f.write_str("Generic"),
        }
    }
}

/// An object exposing named methods.
#[derive(Debug)]
pub struct Servant {
    name: String,
    methods: HashMap<String, MethodEntry>,
    catch_all: Option<MethodEntry>,
}

impl Servant {
    /// Start building a servant with a typed method table.
    pub fn builder(name: impl Into<String>) -> ServantBuilder {
        ServantBuilder { name: name.into(), methods: HashMap::new(), catch_all: None }
    }

    /// A servant that routes every method to one generic handler.
    pub fn generic(name: impl Into<String>, handler: Arc<dyn GenericServant>) -> Self {
        Self::builder(name).catch_all(handler).build()
    }

    /// The servant's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by name.
    pub fn resolve(&self, method: &str) -> Option<&MethodEntry> {
        self.methods.get(method).or(self.catch_all.as_ref())
    }
}

/// Builder for a [`Servant`]'s method table.
pub struct ServantBuilder {
    name: String,
    methods: HashMap<String, MethodEntry>,
    catch_all: Option<MethodEntry>,
}

impl ServantBuilder {
    /// Register a twoway method.
    pub fn method<I, O, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(Current, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ServantError>> + Send + 'static,
    {
        let call: MethodFn = Arc::new(move |current, args: Vec<u8>| match decode_input::<I>(&args)
        {
            Ok(input) => {
                let fut = f(current, input);
                async move {
                    let output = fut.await?;
                    xic_types::encode(&output).map_err(ServantError::other)
                }
                .boxed()
            }
            Err(e) => future::ready(Err(e)).boxed(),
        });
        self.methods.insert(name.into(), MethodEntry::Typed(TypedMethod { oneway: false, call }));
        self
    }

    /// Register a oneway method. Its result is never sent back.
    pub fn oneway<I, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        F: Fn(Current, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServantError>> + Send + 'static,
    {
        let call: MethodFn = Arc::new(move |current, args: Vec<u8>| match decode_input::<I>(&args)
        {
            Ok(input) => f(current, input).map(|res| res.map(|()| Vec::new())).boxed(),
            Err(e) => future::ready(Err(e)).boxed(),
        });
        self.methods.insert(name.into(), MethodEntry::Typed(TypedMethod { oneway: true, call }));
        self
    }

    /// Register a generic handler for one method name.
    pub fn generic_method(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn GenericServant>,
    ) -> Self {
        self.methods.insert(name.into(), MethodEntry::Generic(handler));
        self
    }

    /// Route method names missing from the table to a generic handler.
    pub fn catch_all(mut self, handler: Arc<dyn GenericServant>) -> Self {
        self.catch_all = Some(MethodEntry::Generic(handler));
        self
    }

    /// Finish the method table.
    pub fn build(self) -> Servant {
        Servant { name: self.name, methods: self.methods, catch_all: self.catch_all }
    }
}

fn decode_input<I: DeserializeOwned>(args: &[u8]) -> Result<I, ServantError> {
    xic_types::decode(args)
        .map_err(|e| Exception::new(ARGUMENT_EXCEPTION, 0, format!("invalid arguments: {e}")).into())
}
