//! RPC helpers built on the engine's completion operations.
//!
//! Nothing here talks to a network. The transport's call objects implement
//! [`StreamingCall`] or [`IncomingCall`] (or, for unary client calls, fill a
//! [`UnaryResponse`]), and these helpers sequence the completion operations
//! around them.
//!
//! - [`status`]: status codes, [`RpcFault`] and [`RpcResult`]
//! - [`client`]: [`unary_call`] and [`ClientStream`]
//! - [`server`]: the [`serve`] accept loop
//!
//! # Example
//!
//! ```ignore
//! use cqbridge::grpc::{unary_call, Status};
//!
//! let reply = unary_call(executor.engine(), move |queue, tag, response| {
//!     stub.start_call(queue, tag, request, response);
//! })
//! .await?;
//! ```

pub mod client;
pub mod server;
pub mod status;

pub use client::{unary_call, ClientStream, StreamingCall, UnaryResponse};
pub use server::{serve, HandlerKind, IncomingCall, UnaryService};
pub use status::{Code, RpcFault, RpcResult, Status};
