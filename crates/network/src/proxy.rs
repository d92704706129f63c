//! Proxies bound to one service on one connection.

use crate::{connection::Connection, error::XicResult};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use xic_types::{Context, Value};

/// Calls methods of a single remote service.
///
/// The proxy's context is sent with every call.
pub struct Proxy<S> {
    connection: Connection<S>,
    service: String,
    context: Context,
}

impl<S> Proxy<S> {
    pub(crate) fn new(connection: Connection<S>, service: String) -> Self {
        Self { connection, service, context: Context::new() }
    }

    /// The service this proxy calls.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The connection carrying the calls.
    pub fn connection(&self) -> &Connection<S> {
        &self.connection
    }

    /// The context sent with every call.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Add an entry to the default context.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key, value);
        self
    }
}

impl<S> Proxy<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Call `method` and wait for the typed result.
    pub async fn invoke<I, O>(&self, method: &str, args: &I) -> XicResult<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.connection.invoke_with_context(&self.service, method, self.context.clone(), args).await
    }

    /// Send `method` without waiting for a result.
    pub async fn invoke_oneway<I>(&self, method: &str, args: &I) -> XicResult<()>
    where
        I: Serialize + ?Sized,
    {
        let args = xic_types::encode(args)?;
        self.connection.call(&self.service, method, self.context.clone(), args, true).await.map(drop)
    }
}

impl<S> Clone for Proxy<S> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            service: self.service.clone(),
            context: self.context.clone(),
        }
    }
}

impl<S> fmt::Debug for Proxy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("service", &self.service)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl<S> fmt::Display for Proxy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.connection)
    }
}
