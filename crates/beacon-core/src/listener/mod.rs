//! Inbound HTTP listener on the allocated port.
//!
//! - **Request**: minimal HTTP/1.x parsing into [`InboundRequest`]
//! - **Server**: [`CommandListener`], a blocking accept loop on a dedicated
//!   thread that forwards parsed requests over a bounded queue
//!
//! Command dispatch is left to whoever drains the queue.

pub mod request;
pub mod server;

pub use request::{parse_request, InboundRequest};
pub use server::CommandListener;
