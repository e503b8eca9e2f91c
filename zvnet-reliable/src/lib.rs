//! # zvnet-reliable - Windowed ARQ for datagram sessions
//!
//! `zvnet-reliable` turns an unreliable datagram path into a reliable, ordered
//! byte stream. It follows the KCP family of protocols: selective
//! acknowledgement, cumulative `una`, fast retransmit on duplicate acks, a
//! congestion window with slow start, and an RTO derived from a smoothed RTT
//! estimate.
//!
//! The engine is sans-IO. It never touches a socket or a clock:
//!
//! - inbound datagrams go in through [`Arq::input`],
//! - outbound datagrams come out through the [`std::io::Write`] sink given to
//!   [`Arq::new`], one `write` per datagram,
//! - timers advance only when [`Arq::update`] is called with a millisecond clock.
//!
//! This keeps it deterministic and lets callers embed it under their own lock or
//! event loop.
//!
//! ## Quick Start
//!
//! ```rust
//! use zvnet_reliable::{Arq, ArqConfig};
//!
//! # fn main() -> zvnet_reliable::Result<()> {
//! let mut a = Arq::new(1, ArqConfig::default(), Vec::new());
//! let mut b = Arq::new(1, ArqConfig::default(), Vec::new());
//!
//! a.send(b"hello")?;
//! a.update(0)?;
//! // `Vec<u8>` as the sink concatenates datagrams, fine for a single one
//! let wire = std::mem::take(a.output_mut());
//! b.input(&wire, 1)?;
//! assert_eq!(&b.recv().unwrap()[..], b"hello");
//! # Ok(())
//! # }
//! ```
//!
//! ## Flow Control
//!
//! [`Arq::send`] refuses new data with [`Error::SendBufferFull`] once
//! `send_buffer_cap` segments are queued or in flight. [`Arq::take_resumed`]
//! reports, exactly once, when the buffer drains below that mark again.
//!
//! ## Telemetry
//!
//! [`Arq::snd_nxt`], [`Arq::rcv_nxt`], [`Arq::rx_srtt`], [`Arq::nsnd_buf`] and
//! [`Arq::nrcv_buf`] expose the internal counters for diagnostics.

pub use arq::Arq;
pub use config::ArqConfig;
pub use error::{Error, Result};
pub use segment::{Command, HEADER_LEN};

mod arq;
pub mod config;
mod error;
mod segment;
