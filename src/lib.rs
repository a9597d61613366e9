//! qmux: a stream multiplexing protocol and runtime.
//!
//! qmux carries many independent, bidirectional byte streams ("channels")
//! over a single ordered, reliable transport — a deliberate reduction of
//! the SSH connection-layer multiplexing protocol (RFC 4254 §5) to just
//! the open/confirm/close handshake, per-direction sliding-window flow
//! control, and data framing, with authentication, encryption, and
//! channel-request subtypes stripped out.
//!
//! ```no_run
//! use tokio::net::TcpStream;
//! use qmux::Session;
//!
//! # async fn run() -> qmux::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:9999").await?;
//! let session = Session::new(stream);
//!
//! let channel = session.open().await?;
//! channel.write(b"hello").await?;
//!
//! let mut buf = [0u8; 5];
//! channel.read(&mut buf).await?;
//! assert_eq!(&buf, b"hello");
//! # Ok(())
//! # }
//! ```
//!
//! A transport is anything implementing [`tokio::io::AsyncRead`] +
//! [`tokio::io::AsyncWrite`]; it is the caller's job to dial, accept, and
//! (if needed) secure the connection before handing it to [`Session::new`].

mod buffer;
mod channel;
mod codec;
mod config;
mod error;
mod session;
mod table;
mod window;

pub use channel::{Channel, Direction};
pub use config::{INITIAL_WINDOW, MAX_PACKET_PAYLOAD};
pub use error::{Error, Result};
pub use session::Session;
