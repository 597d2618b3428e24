//! Server-side accept loop for unary methods.
//!
//! [`serve`] keeps one request outstanding at a time. Each accepted call gets
//! a fresh call object and its own spawned handler task, so a slow handler
//! never delays the next accept. Handlers run either inline on the I/O
//! thread or on the worker pool, chosen per service with [`HandlerKind`].

use crate::grpc::status::{RpcFault, RpcResult, Status};
use crate::runtime::spawn::panic_message;
use crate::runtime::{Executor, StopToken};
use crate::tracing_compat::{debug, trace, warn};
use crate::transport::{CompletionQueue, Tag};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Where a handler body runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerKind {
    /// On the I/O thread. Only for handlers that never block.
    #[default]
    Inline,
    /// On the executor's worker pool.
    Blocking,
}

/// Transport-side object for one incoming unary call.
pub trait IncomingCall<Q: CompletionQueue>: Send + 'static {
    /// Request message type.
    type Request: Send + 'static;
    /// Reply message type.
    type Reply: Send + 'static;

    /// Asks the transport for the next incoming call; `tag` is reported once
    /// one has arrived, or with `ok = false` if the server is going away.
    fn request(&mut self, queue: &Q, tag: Tag);

    /// Takes the request delivered by a successful [`request`](Self::request).
    fn take_request(&mut self) -> Option<Self::Request>;

    /// Sends the reply (present only for OK) and the final status.
    fn finish(&mut self, queue: &Q, tag: Tag, reply: Option<Self::Reply>, status: Status);
}

/// Handler logic for a unary method.
pub trait UnaryService<Req, Rep>: Send + Sync + 'static {
    /// Produces the reply for `request`.
    ///
    /// Any error, like a panic, finishes the call with `UNKNOWN "unknown"`;
    /// the fault itself is only logged.
    fn handle(&self, request: &Req) -> RpcResult<Rep>;
}

impl<F, Req, Rep> UnaryService<Req, Rep> for F
where
    F: Fn(&Req) -> RpcResult<Rep> + Send + Sync + 'static,
{
    fn handle(&self, request: &Req) -> RpcResult<Rep> {
        self(request)
    }
}

/// Accepts calls until `stop` is signaled, returning how many were accepted.
///
/// `new_call` creates the call object for each accept. Before every accept
/// the loop passes through a [`Schedule`](crate::runtime::Schedule)
/// checkpoint bound to `stop`, which is where it notices the stop request.
pub async fn serve<Q, C, N, S>(
    executor: Executor<Q>,
    mut new_call: N,
    service: S,
    kind: HandlerKind,
    stop: StopToken,
) -> u64
where
    Q: CompletionQueue,
    C: IncomingCall<Q>,
    N: FnMut() -> C + Send + 'static,
    S: UnaryService<C::Request, C::Reply>,
{
    let service = Arc::new(service);
    let mut accepted = 0_u64;
    debug!(?kind, "serve loop started");

    loop {
        if executor.schedule().with_stop_token(stop.clone()).await.is_err() {
            break;
        }

        let call = Arc::new(Mutex::new(new_call()));
        let requester = Arc::clone(&call);
        let ok = executor
            .completion(move |queue: &Q, tag| requester.lock().request(queue, tag))
            .await;
        if !ok {
            trace!("request for incoming call failed");
            continue;
        }

        accepted += 1;
        trace!(accepted, "call accepted");
        drop(executor.spawn_local(handle_call(
            executor.clone(),
            call,
            Arc::clone(&service),
            kind,
        )));
    }

    debug!(accepted, "serve loop stopped");
    accepted
}

async fn handle_call<Q, C, S>(
    executor: Executor<Q>,
    call: Arc<Mutex<C>>,
    service: Arc<S>,
    kind: HandlerKind,
) where
    Q: CompletionQueue,
    C: IncomingCall<Q>,
    S: UnaryService<C::Request, C::Reply>,
{
    let request = call.lock().take_request();
    let Some(request) = request else {
        warn!("accepted call delivered no request");
        finish_call(&executor, call, None, Status::internal("request missing")).await;
        return;
    };
    let outcome = match kind {
        HandlerKind::Inline => run_guarded(service.as_ref(), &request),
        HandlerKind::Blocking => {
            let worker_service = Arc::clone(&service);
            executor
                .spawn_blocking(move || run_guarded(worker_service.as_ref(), &request))
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, "blocking handler did not run");
                    Err(RpcFault::unknown())
                })
        }
    };

    // Handler faults are not forwarded to the client; every failure finishes
    // with the same generic status.
    let (reply, status) = match outcome {
        Ok(reply) => (Some(reply), Status::ok()),
        Err(fault) => {
            debug!(code = %fault.code(), message = fault.message(), "handler failed");
            (None, Status::unknown())
        }
    };
    finish_call(&executor, call, reply, status).await;
}

async fn finish_call<Q, C>(
    executor: &Executor<Q>,
    call: Arc<Mutex<C>>,
    reply: Option<C::Reply>,
    status: Status,
) where
    Q: CompletionQueue,
    C: IncomingCall<Q>,
{
    let code = status.code();
    let finished = executor
        .completion(move |queue: &Q, tag| call.lock().finish(queue, tag, reply, status))
        .await;
    if finished {
        trace!(%code, "call finished");
    } else {
        debug!(%code, "finishing call failed in transport");
    }
}

fn run_guarded<Req, Rep, S>(service: &S, request: &Req) -> RpcResult<Rep>
where
    S: UnaryService<Req, Rep> + ?Sized,
{
    catch_unwind(AssertUnwindSafe(|| service.handle(request))).unwrap_or_else(|payload| {
        warn!(message = %panic_message(payload.as_ref()), "handler panicked");
        Err(RpcFault::unknown())
    })
}
