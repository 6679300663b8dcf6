//! Tether RPC
//!
//! The envelope protocol and request channel that sit between
//! `tether-core`'s byte transports and the `tether` process supervisor:
//! - Request / response / notification envelopes (`envelope`)
//! - Framework-reserved methods and their payloads (`reserved`)
//! - The dense in-flight request table (`pending`)
//! - Async handler registries (`handlers`)
//! - The channel actor tying it all together (`channel`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod channel;
pub mod envelope;
pub mod handlers;
pub mod pending;
pub mod reserved;

pub mod prelude {
    pub use crate::channel::{ChannelEvent, ChannelOptions, RequestChannel, RequestOptions};
    pub use crate::envelope::{codes, Envelope, WireError, WireStyle};
    pub use crate::handlers::{
        notification_handler, request_handler, HandlerRegistry, RequestCtx,
    };
    pub use crate::reserved::{is_reserved, ShutdownReason};
}
