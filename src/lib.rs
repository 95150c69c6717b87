//! courier — asynchronous pipelining HTTP/1.x client.
//!
//! Built for transactional workloads (mail delivery, proxy relays, admin
//! RPC): requests submitted concurrently are multiplexed over a bounded
//! pool of pipelined connections per endpoint, with DNS, TLS (direct and
//! via CONNECT tunnels), redirects, authentication, 100-continue bodies,
//! per-attempt and overall timeouts, and retries with exponential backoff.
//!
//! ```no_run
//! use courier::{Client, Request, Settings};
//!
//! # async fn example() -> Result<(), courier::Error> {
//! let client = Client::new(Settings::default());
//! let req = Request::new(http::Method::GET, "http://127.0.0.1:8080/")?;
//! let response = client.submit(req).await?;
//! println!("{} {}", response.status, response.body.len());
//! # Ok(())
//! # }
//! ```

pub mod body;
pub mod client;
pub mod error;
pub mod peer_addr;
pub mod request;
pub mod response;
pub mod settings;
pub mod types;

mod connection;
mod dns;
mod host;
mod peer;
mod queue;
mod tls;
mod wire;

pub use body::Body;
pub use client::{Client, RequestHandle};
pub use error::Error;
pub use peer_addr::PeerAddress;
pub use request::{Delivery, Request, RequestState};
pub use response::Response;
pub use settings::{Settings, TlsSettings};
pub use types::RequestId;
