//! The connection actor.
//!
//! A connection owns one byte stream. A single read loop task reads every message and routes
//! it: quests to the dispatch engine, answers to the pending-call table, checks to the
//! negotiator, and Hello/Bye to the lifecycle state. Writes from callers, the read loop, and
//! dispatch tasks are serialized by one async lock so frames never interleave.

use crate::{
    adapter::Adapter,
    codec::MessageCodec,
    dispatch::dispatch,
    error::{ProtocolError, XicError, XicResult},
    handshake::{CheckCommand, Negotiator},
    message::{Answer, Check, Message, MessageKind, Quest},
    pending::PendingCalls,
    proxy::Proxy,
    servant::{Current, Invoker, Peer},
    state::{ConState, StateCell},
};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use futures::{future::BoxFuture, FutureExt as _};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt as _, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{watch, Semaphore},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, trace, warn};
use xic_config::ConnectionConfig;
use xic_types::Context;

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod connection_tests;

/// Why the read loop stopped.
#[derive(Debug)]
enum LoopExit {
    /// The peer sent Bye. `reply` is set when the peer started the close and is owed a Bye.
    Graceful { reply: bool },
    /// The connection was shut locally.
    Shutdown,
    /// Protocol violation or IO failure.
    Fatal(ProtocolError),
}

/// Shared state of one connection.
struct ConnectionInner<S> {
    /// True for accepted connections.
    incoming: bool,
    /// Peer address, for logs and display.
    endpoint: String,
    config: ConnectionConfig,
    state: StateCell,
    pending: Arc<PendingCalls>,
    adapter: RwLock<Option<Arc<dyn Adapter>>>,
    negotiator: RwLock<Option<Arc<dyn Negotiator>>>,
    /// `None` once the connection is shut.
    writer: tokio::sync::Mutex<Option<WriteHalf<S>>>,
    /// Encoder for outgoing frames. Holds no buffer state for writes.
    write_codec: MessageCodec,
    /// Taken by the read loop on start, or dropped by a shut before start.
    reader: Mutex<Option<ReadHalf<S>>>,
    /// Set to true to stop the read loop.
    shutdown: watch::Sender<bool>,
    /// Bounds the number of quests dispatched in parallel.
    dispatch_permits: Arc<Semaphore>,
}

/// A xic connection over any byte stream.
///
/// Cloning is cheap and every clone drives the same connection.
pub struct Connection<S> {
    inner: Arc<ConnectionInner<S>>,
}

impl<S> Clone for Connection<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.inner.endpoint)
            .field("incoming", &self.inner.incoming)
            .field("state", &self.inner.state.load())
            .finish_non_exhaustive()
    }
}

impl<S> fmt::Display for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.inner.incoming { "incoming" } else { "outgoing" };
        write!(f, "{direction}/{}", self.inner.endpoint)
    }
}

impl Connection<TcpStream> {
    /// Connect to `endpoint` over TCP and start the read loop.
    pub async fn dial(endpoint: &str, config: ConnectionConfig) -> XicResult<Self> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        debug!(target: "xic::connection", %endpoint, "connected");

        let connection = Self::outgoing(stream, endpoint, config);
        connection.start();
        Ok(connection)
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a stream this side opened. The connection waits for the peer's Hello.
    pub fn outgoing(stream: S, endpoint: impl Into<String>, config: ConnectionConfig) -> Self {
        Self::new(stream, endpoint.into(), false, None, config)
    }

    /// Wrap a stream this side accepted. The connection greets the peer with Hello on start.
    pub fn incoming(
        stream: S,
        endpoint: impl Into<String>,
        adapter: Option<Arc<dyn Adapter>>,
        config: ConnectionConfig,
    ) -> Self {
        Self::new(stream, endpoint.into(), true, adapter, config)
    }

    fn new(
        stream: S,
        endpoint: String,
        incoming: bool,
        adapter: Option<Arc<dyn Adapter>>,
        config: ConnectionConfig,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (shutdown, _) = watch::channel(false);
        let inner = ConnectionInner {
            incoming,
            endpoint,
            state: StateCell::new(),
            pending: Arc::new(PendingCalls::new()),
            adapter: RwLock::new(adapter),
            negotiator: RwLock::new(None),
            writer: tokio::sync::Mutex::new(Some(writer)),
            write_codec: MessageCodec::new(config.max_message_size),
            reader: Mutex::new(Some(reader)),
            shutdown,
            dispatch_permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Spawn the read loop.
    ///
    /// Returns `None` if the loop was already started or the connection was closed first.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let reader = self.inner.reader.lock().take()?;
        Some(tokio::spawn(self.inner.clone().run(reader)))
    }

    /// Call `method` on `service` and wait for the typed result.
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
        let out = self.call(service, method, context, args, false).await?;
        Ok(xic_types::decode(&out)?)
    }

    /// Send a quest that expects no answer.
    ///
    /// Returns once the quest is written. Whatever the servant does with it is not reported.
    pub async fn invoke_oneway<I>(&self, service: &str, method: &str, args: &I) -> XicResult<()>
    where
        I: Serialize + ?Sized,
    {
        let args = xic_types::encode(args)?;
        self.call(service, method, Context::new(), args, true).await.map(drop)
    }

    /// Send a quest with encoded arguments.
    ///
    /// Calls issued before the handshake completes wait for it. The configured timeout bounds
    /// the whole call: the handshake wait, the quest write, and the wait for the answer. A
    /// write that misses the deadline force-closes the connection, since part of the frame may
    /// already be on the stream.
    pub(crate) async fn call(
        &self,
        service: &str,
        method: &str,
        context: Context,
        args: Vec<u8>,
        oneway: bool,
    ) -> XicResult<Vec<u8>> {
        let inner = &self.inner;
        let deadline = inner.config.timeout.map(|timeout| Instant::now() + timeout);

        if within(deadline, inner.state.wait_past_handshake()).await? != ConState::Active {
            return Err(XicError::ConnectionClosed);
        }

        let mut quest = Quest {
            txid: 0,
            service: service.to_string(),
            method: method.to_string(),
            context,
            args,
        };

        if oneway {
            inner.write_within(deadline, &Message::Quest(quest)).await?;
            return Ok(Vec::new());
        }

        // dropping `pending` on timeout or error unregisters the call
        let pending = inner.pending.register()?;
        quest.txid = pending.txid();
        trace!(target: "xic::connection", txid = quest.txid, %service, %method, "sending quest");
        inner.write_within(deadline, &Message::Quest(quest)).await?;

        within(deadline, pending.wait()).await?.inspect_err(|e| {
            trace!(target: "xic::connection", %service, %method, ?e, "call failed");
        })
    }

    /// Send a check command to the peer.
    pub async fn send_check(&self, check: Check) -> XicResult<()> {
        self.inner.write_message(&Message::Check(check)).await
    }

    /// Close the connection.
    ///
    /// A forced close shuts the stream at once. Otherwise Bye is sent and the read loop
    /// finishes the close when the peer's Bye arrives. Either way every pending call fails
    /// with [`XicError::ConnectionClosed`] and no new calls are accepted.
    pub async fn close(&self, force: bool) {
        self.inner.close(force).await
    }

    /// A proxy that sends every call to `service` on this connection.
    ///
    /// Service names containing `'@'` are rejected.
    pub fn create_proxy(&self, service: impl Into<String>) -> XicResult<Proxy<S>> {
        let service = service.into();
        if service.contains('@') {
            return Err(XicError::InvalidService(service));
        }
        Ok(Proxy::new(self.clone(), service))
    }
}

impl<S> Invoker for Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn call_raw<'a>(
        &'a self,
        service: &'a str,
        method: &'a str,
        context: Context,
        args: Vec<u8>,
        oneway: bool,
    ) -> BoxFuture<'a, XicResult<Vec<u8>>> {
        self.call(service, method, context, args, oneway).boxed()
    }

    fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }
}

impl<S> Connection<S> {
    /// Peer address.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Whether this side accepted the connection.
    pub fn is_incoming(&self) -> bool {
        self.inner.incoming
    }

    /// Whether the connection still accepts calls.
    pub fn is_live(&self) -> bool {
        self.inner.state.load().is_live()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConState {
        self.inner.state.load()
    }

    /// The per-call timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.config.timeout
    }

    /// The connection's configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// The adapter serving incoming quests.
    pub fn adapter(&self) -> Option<Arc<dyn Adapter>> {
        self.inner.adapter.read().clone()
    }

    /// Replace the adapter. Quests already being dispatched keep the previous one.
    pub fn set_adapter(&self, adapter: Option<Arc<dyn Adapter>>) {
        *self.inner.adapter.write() = adapter;
    }

    /// Set the participant receiving check commands.
    pub fn set_negotiator(&self, negotiator: Option<Arc<dyn Negotiator>>) {
        *self.inner.negotiator.write() = negotiator;
    }

    /// Number of calls waiting for an answer.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Wait until the connection is closed. Returns `Closed` or `Error`.
    pub async fn wait_closed(&self) -> ConState {
        self.inner.state.wait_closed().await
    }
}

impl<S> ConnectionInner<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Read loop entry point. Owns the read half until the loop exits.
    async fn run(self: Arc<Self>, mut reader: ReadHalf<S>) {
        let exit = tokio::select! {
            biased;
            _ = wait_for_shutdown(self.shutdown.subscribe()) => LoopExit::Shutdown,
            exit = self.serve(&mut reader) => exit,
        };
        drop(reader);

        match exit {
            LoopExit::Fatal(e) => {
                warn!(target: "xic::connection", endpoint = %self.endpoint, %e, "connection failed");
                // a forced close in progress explains the failure
                self.state.transition(|state| {
                    Some(if state == ConState::Close { ConState::Closed } else { ConState::Error })
                });
                self.shut().await;
            }
            LoopExit::Graceful { reply } => {
                if reply {
                    if let Err(e) = self.write_message(&Message::Bye).await {
                        debug!(target: "xic::connection", endpoint = %self.endpoint, ?e, "failed to reply bye");
                    }
                }
                self.shut().await;
                self.state.transition(|state| (state < ConState::Closed).then_some(ConState::Closed));
            }
            LoopExit::Shutdown => {
                self.state.transition(|state| (state < ConState::Closed).then_some(ConState::Closed));
            }
        }

        let failed = self.pending.fail_all(|| XicError::ConnectionClosed);
        debug!(
            target: "xic::connection",
            endpoint = %self.endpoint,
            state = ?self.state.load(),
            failed,
            "read loop exited"
        );
    }

    /// Greet the peer, then read and route messages until the connection ends.
    async fn serve(self: &Arc<Self>, reader: &mut ReadHalf<S>) -> LoopExit {
        if self.incoming {
            if let Err(e) = self.write_message(&Message::Hello).await {
                return match e {
                    XicError::Protocol(e) => LoopExit::Fatal(e),
                    _ => LoopExit::Shutdown,
                };
            }
            if !self.state.compare_and_set(ConState::Init, ConState::Active) {
                return LoopExit::Shutdown;
            }
        } else if !self.state.compare_and_set(ConState::Init, ConState::WaitingHello) {
            return LoopExit::Shutdown;
        }
        debug!(target: "xic::connection", endpoint = %self.endpoint, state = ?self.state.load(), "read loop started");

        let mut codec = MessageCodec::new(self.config.max_message_size);
        loop {
            let msg = match self.read_next(reader, &mut codec).await {
                Ok(msg) => msg,
                Err(e) => return LoopExit::Fatal(e),
            };
            match self.route(msg).await {
                Ok(None) => {}
                Ok(Some(exit)) => return exit,
                Err(e) => return LoopExit::Fatal(e),
            }
        }
    }

    /// Read one message. The idle timeout covers the wait for the header.
    async fn read_next(
        &self,
        reader: &mut ReadHalf<S>,
        codec: &mut MessageCodec,
    ) -> Result<Message, ProtocolError> {
        let header = match self.config.idle_timeout {
            Some(idle) => tokio::time::timeout(idle, codec.read_header(reader))
                .await
                .map_err(|_| ProtocolError::IdleTimeout)??,
            None => codec.read_header(reader).await?,
        };
        codec.read_body(reader, &header).await
    }

    /// Apply the lifecycle rules to one message. Returns an exit when the loop must stop.
    async fn route(self: &Arc<Self>, msg: Message) -> Result<Option<LoopExit>, ProtocolError> {
        match msg {
            Message::Quest(quest) => {
                let state = self.state.load();
                if state < ConState::Active {
                    return Err(ProtocolError::UnexpectedMessage { kind: MessageKind::Quest, state });
                }
                if state > ConState::Active {
                    trace!(target: "xic::connection", txid = quest.txid, ?state, "dropping quest");
                    return Ok(None);
                }
                self.handle_quest(quest).await;
            }
            Message::Answer(answer) => {
                self.pending.resolve(answer);
            }
            Message::Check(check) => {
                let state = self.state.load();
                if state != ConState::WaitingHello {
                    return Err(ProtocolError::UnexpectedMessage { kind: MessageKind::Check, state });
                }
                self.handle_check(check).await?;
            }
            Message::Hello => {
                if !self.state.compare_and_set(ConState::WaitingHello, ConState::Active) {
                    let state = self.state.load();
                    return Err(ProtocolError::UnexpectedMessage { kind: MessageKind::Hello, state });
                }
                debug!(target: "xic::connection", endpoint = %self.endpoint, "connection active");
            }
            Message::Bye => {
                let previous = self.state.transition(|state| {
                    matches!(state, ConState::Active | ConState::Close | ConState::Closing)
                        .then_some(ConState::Closed)
                });
                return match previous {
                    ConState::Active => Ok(Some(LoopExit::Graceful { reply: true })),
                    ConState::Close | ConState::Closing => {
                        Ok(Some(LoopExit::Graceful { reply: false }))
                    }
                    state => Err(ProtocolError::UnexpectedMessage { kind: MessageKind::Bye, state }),
                };
            }
        }
        Ok(None)
    }

    async fn close(&self, force: bool) {
        let next = if force { ConState::Close } else { ConState::Closing };
        let previous = self.state.transition(|state| state.is_live().then_some(next));
        if !previous.is_live() {
            return;
        }

        let failed = self.pending.fail_all(|| XicError::ConnectionClosed);
        debug!(target: "xic::connection", endpoint = %self.endpoint, force, failed, "closing");

        if force || previous == ConState::Init {
            self.shut().await;
        } else if let Err(e) = self.write_message(&Message::Bye).await {
            debug!(target: "xic::connection", endpoint = %self.endpoint, ?e, "failed to send bye");
            self.shut().await;
        }
    }

    /// Dispatch on the read loop, or on a task holding a permit when concurrent.
    async fn handle_quest(self: &Arc<Self>, quest: Quest) {
        let adapter = self.adapter.read().clone();
        let peer = Peer::new(Arc::new(Connection { inner: self.clone() }));
        let current = Current::new(&quest, self.incoming).with_peer(peer);

        if !self.config.is_concurrent() {
            if let Some(answer) = dispatch(adapter, current, quest).await {
                self.send_answer(answer).await;
            }
            return;
        }

        // waiting here applies backpressure to the peer
        let Ok(permit) = self.dispatch_permits.clone().acquire_owned().await else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            if let Some(answer) = dispatch(adapter, current, quest).await {
                this.send_answer(answer).await;
            }
            drop(permit);
        });
    }

    async fn send_answer(&self, answer: Answer) {
        let txid = answer.txid;
        if let Err(e) = self.write_message(&Message::Answer(answer)).await {
            debug!(target: "xic::connection", endpoint = %self.endpoint, txid, ?e, "failed to send answer");
        }
    }

    /// Decode the command for this side and hand it to the negotiator.
    async fn handle_check(&self, check: Check) -> Result<(), ProtocolError> {
        let command = CheckCommand::decode(&check, self.incoming)
            .map_err(|source| ProtocolError::Decode { kind: MessageKind::Check, source })?;
        if let CheckCommand::Unrecognized(name) = &command {
            debug!(target: "xic::connection", endpoint = %self.endpoint, command = %name, "ignoring check");
            return Ok(());
        }

        let negotiator = self.negotiator.read().clone();
        let Some(negotiator) = negotiator else {
            debug!(target: "xic::connection", endpoint = %self.endpoint, command = %check.command, "no negotiator");
            return Ok(());
        };

        if let Some(reply) = negotiator.on_check(command).and_then(|reply| reply.to_check()) {
            if let Err(e) = self.write_message(&Message::Check(reply)).await {
                debug!(target: "xic::connection", endpoint = %self.endpoint, ?e, "failed to send check");
            }
        }
        Ok(())
    }

    /// Write a caller's frame, bounded by the call deadline.
    async fn write_within(&self, deadline: Option<Instant>, msg: &Message) -> XicResult<()> {
        match within(deadline, self.write_message(msg)).await {
            Ok(res) => res,
            Err(e) => {
                debug!(target: "xic::connection", endpoint = %self.endpoint, "write timed out");
                self.close(true).await;
                Err(e)
            }
        }
    }

    /// Write one frame, giving up as soon as the connection is shut.
    ///
    /// A peer that stops reading blocks the write with the lock held. The shutdown flag drops
    /// that write and releases the lock so [`Self::shut`] can take the stream.
    async fn write_message(&self, msg: &Message) -> XicResult<()> {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(self.shutdown.subscribe()) => Err(XicError::ConnectionClosed),
            res = self.write_locked(msg) => res,
        }
    }

    /// Write one frame under the write lock.
    async fn write_locked(&self, msg: &Message) -> XicResult<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(XicError::ConnectionClosed);
        };
        self.write_codec.write_message(writer, msg).await?;
        Ok(())
    }

    /// Stop the read loop and close the stream. Idempotent.
    async fn shut(&self) {
        self.shutdown.send_replace(true);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                trace!(target: "xic::connection", endpoint = %self.endpoint, ?e, "shutdown failed");
            }
        }

        // the loop never started, so nothing else will finish the close
        if self.reader.lock().take().is_some() {
            self.state.transition(|state| (state < ConState::Closed).then_some(ConState::Closed));
            self.pending.fail_all(|| XicError::ConnectionClosed);
        }
    }
}

/// Resolve once the shutdown flag is set.
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run `fut`, bounded by `deadline` when one is set.
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> XicResult<F::Output> {
    match deadline {
        Some(deadline) => {
            tokio::time::timeout_at(deadline, fut).await.map_err(|_| XicError::Timeout)
        }
        None => Ok(fut.await),
    }
}
