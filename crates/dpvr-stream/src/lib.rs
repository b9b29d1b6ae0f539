//! Server-sent events fan-out.
//!
//! [`Broadcaster`] keeps the set of live sinks and pushes each published value to
//! all of them; [`StreamServer`] exposes it over HTTP as a `text/event-stream`.

pub mod broadcaster;
pub mod server;

pub use broadcaster::{
    encode_frame, Broadcaster, Sink, SinkClosed, SinkHandle, Subscription, SUBSCRIBER_QUEUE,
};
pub use server::StreamServer;
