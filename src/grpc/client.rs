//! Client-side call helpers.
//!
//! Both helpers are thin consumers of [`Engine::completion`]: every transport
//! interaction is one completion operation whose initiator touches the call
//! object on the I/O thread.
//!
//! - [`unary_call`]: one operation that starts the call and requests its
//!   finish; the transport fills a [`UnaryResponse`] before reporting the tag.
//! - [`ClientStream`]: start, then reads until a read fails, then exactly one
//!   finish. The sequence is finite and cannot be restarted.

use crate::grpc::status::{Code, RpcFault, RpcResult, Status};
use crate::runtime::{Completion, Engine};
use crate::tracing_compat::{debug, trace};
use crate::transport::{CompletionQueue, Tag};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

// ============================================================================
// Unary
// ============================================================================

struct UnarySlot<Rep> {
    status: Status,
    reply: Option<Rep>,
}

/// Where the transport writes the outcome of a unary call.
///
/// Cloning shares the slot. The transport must call [`finish`](Self::finish)
/// (or the individual setters) before it reports the call's tag.
pub struct UnaryResponse<Rep> {
    slot: Arc<Mutex<UnarySlot<Rep>>>,
}

impl<Rep> UnaryResponse<Rep> {
    fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(UnarySlot {
                status: Status::ok(),
                reply: None,
            })),
        }
    }

    /// Stores the final status and, for successful calls, the reply.
    pub fn finish(&self, status: Status, reply: Option<Rep>) {
        let mut slot = self.slot.lock();
        slot.status = status;
        slot.reply = reply;
    }

    /// Stores the reply message.
    pub fn set_reply(&self, reply: Rep) {
        self.slot.lock().reply = Some(reply);
    }

    /// Stores the final status.
    pub fn set_status(&self, status: Status) {
        self.slot.lock().status = status;
    }

    fn take(&self) -> (Status, Option<Rep>) {
        let mut slot = self.slot.lock();
        (std::mem::take(&mut slot.status), slot.reply.take())
    }
}

impl<Rep> Clone for UnaryResponse<Rep> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<Rep> fmt::Debug for UnaryResponse<Rep> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("UnaryResponse")
            .field("status", &slot.status)
            .field("has_reply", &slot.reply.is_some())
            .finish()
    }
}

/// Issues a unary call.
///
/// `start` runs on the I/O thread with the queue, the tag to report, and the
/// response slot to fill. The result is:
///
/// - `Err(UNKNOWN "unknown")` if the transport reports the operation failed,
/// - `Err(status)` if the call finished with a non-OK status,
/// - `Err(INTERNAL)` if an OK call delivered no reply,
/// - `Ok(reply)` otherwise.
pub fn unary_call<Q, Rep, F>(
    engine: &Engine<Q>,
    start: F,
) -> impl Future<Output = RpcResult<Rep>> + Send + 'static
where
    Q: CompletionQueue,
    Rep: Send + 'static,
    F: FnOnce(&Q, Tag, UnaryResponse<Rep>) + Send + 'static,
{
    let engine = engine.clone();
    async move {
        let response = UnaryResponse::new();
        let sink = response.clone();
        let ok = engine.completion(move |queue, tag| start(queue, tag, sink)).await;
        if !ok {
            debug!("unary call failed in transport");
            return Err(RpcFault::unknown());
        }
        let (status, reply) = response.take();
        if !status.is_ok() {
            return Err(status.into());
        }
        reply.ok_or_else(|| RpcFault::new(Code::Internal, "reply missing"))
    }
}

// ============================================================================
// Server streaming
// ============================================================================

/// Transport-side object of a server-streaming call.
///
/// Every method registers one asynchronous operation on the queue and must
/// eventually report `tag`.
pub trait StreamingCall<Q: CompletionQueue>: Send + 'static {
    /// Reply message type.
    type Reply: Send + 'static;

    /// Starts the call. Reported with `ok = false` if the call could not start.
    fn start(&mut self, queue: &Q, tag: Tag);

    /// Requests the next reply. Reported with `ok = false` once the stream is exhausted.
    fn read(&mut self, queue: &Q, tag: Tag);

    /// Takes the reply delivered by the last successful read.
    fn take_reply(&mut self) -> Option<Self::Reply>;

    /// Requests the final status.
    fn finish(&mut self, queue: &Q, tag: Tag);

    /// Returns the status delivered by [`finish`](Self::finish).
    fn status(&self) -> Status;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    Idle,
    Reading,
    Finished,
}

/// Lazy sequence of replies from a server-streaming call.
///
/// The first [`next`](Self::next) starts the call. Each following call
/// issues one read. The first failed read ends the sequence and issues the
/// finish operation, exactly once.
pub struct ClientStream<Q: CompletionQueue, C> {
    engine: Engine<Q>,
    call: Arc<Mutex<C>>,
    phase: StreamPhase,
    status: Option<Status>,
}

impl<Q, C> ClientStream<Q, C>
where
    Q: CompletionQueue,
    C: StreamingCall<Q>,
{
    /// Wraps `call`; nothing is issued until the first [`next`](Self::next).
    #[must_use]
    pub fn new(engine: &Engine<Q>, call: C) -> Self {
        Self {
            engine: engine.clone(),
            call: Arc::new(Mutex::new(call)),
            phase: StreamPhase::Idle,
            status: None,
        }
    }

    /// Returns the next reply, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<C::Reply> {
        match self.phase {
            StreamPhase::Finished => None,
            StreamPhase::Idle => {
                let ok = self.operation(C::start).await;
                if !ok {
                    debug!("stream start failed");
                    self.finish().await;
                    return None;
                }
                self.phase = StreamPhase::Reading;
                self.read().await
            }
            StreamPhase::Reading => self.read().await,
        }
    }

    /// Drains the stream, returning every reply and the final status.
    pub async fn collect(mut self) -> (Vec<C::Reply>, Status) {
        let mut replies = Vec::new();
        while let Some(reply) = self.next().await {
            replies.push(reply);
        }
        let status = self.status.take().unwrap_or_else(Status::unknown);
        (replies, status)
    }

    /// Returns the final status once the stream has ended.
    #[must_use]
    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    /// Returns true once the finish operation has been issued.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.phase == StreamPhase::Finished
    }

    async fn read(&mut self) -> Option<C::Reply> {
        let ok = self.operation(C::read).await;
        if ok {
            let reply = self.call.lock().take_reply();
            if reply.is_some() {
                trace!("stream reply received");
                return reply;
            }
        }
        self.finish().await;
        None
    }

    async fn finish(&mut self) {
        self.phase = StreamPhase::Finished;
        let ok = self.operation(C::finish).await;
        let status = if ok {
            self.call.lock().status()
        } else {
            Status::unknown()
        };
        debug!(code = %status.code(), "stream finished");
        self.status = Some(status);
    }

    fn operation<F>(&self, op: F) -> Completion<Q, impl FnOnce(&Q, Tag) + Send + 'static>
    where
        F: FnOnce(&mut C, &Q, Tag) + Send + 'static,
    {
        let call = Arc::clone(&self.call);
        self.engine
            .completion(move |queue: &Q, tag| op(&mut *call.lock(), queue, tag))
    }
}

impl<Q: CompletionQueue, C> fmt::Debug for ClientStream<Q, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStream")
            .field("engine", &self.engine.id())
            .field("phase", &self.phase)
            .field("status", &self.status)
            .finish()
    }
}
