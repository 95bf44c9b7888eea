//! Lemma guest library
//!
//! Lets a process join a host-managed room on the local network and trade
//! named events with the host.
//!
//! # Architecture
//!
//! - **Discovery**: UDP `marco` broadcast until a host answers with `polo`
//! - **Session**: TCP connection to the host, registration, heartbeat
//! - **Protocol**: JSON array envelopes, 6-digit length-prefixed on TCP
//! - **Lemma**: owns both and falls back to discovery when a session drops
//!
//! # Usage
//!
//! ```ignore
//! let identity = Identity::new("Echo", "lab")?;
//! let lemma = Lemma::new(identity, LemmaConfig::default());
//!
//! let sender = lemma.sender();
//! lemma.connect_handler("Echo", move |_, value| {
//!     sender.send_message("EchoVerify", value);
//! });
//!
//! lemma.begin();
//! ```

pub mod config;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod handlers;
pub mod lemma;
pub mod protocol;
pub mod session;

#[cfg(test)]
mod test_host;

pub use config::{Identity, LemmaConfig, DEFAULT_DISCOVERY_PORT, DIALECT, VERSION};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use handlers::{Handler, HandlerTable};
pub use lemma::{ConnectionState, Lemma, LemmaSender};
pub use protocol::{EventValue, Message};
