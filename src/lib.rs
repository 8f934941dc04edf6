#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! tjener is a threaded HTTP/1.x server built around a non-blocking
//! reactor core.
//!
//! One reactor thread multiplexes every listening socket and connection;
//! a fixed pool of worker threads runs the hosted [`Application`]. Within
//! a connection requests are serviced strictly in arrival order, so
//! pipelined responses always leave the wire in request order, while
//! different connections are serviced in parallel.
//!
//! ```no_run
//! use tjener::{serve, Body, Environ, StartResponse};
//!
//! fn hello(_env: &Environ, sr: &mut StartResponse) -> Body {
//!     sr.start(
//!         200,
//!         vec![("Content-Type".to_owned(), "text/plain".to_owned())],
//!     );
//!     Body::Full("hello\n".into())
//! }
//!
//! serve(hello, "127.0.0.1:8080").unwrap();
//! ```

pub mod adjustments;
pub mod app;
pub mod channel;
pub mod error;
pub mod net;
pub mod proto;
pub mod reactor;
pub mod server;
pub mod task;
pub mod trigger;

pub use adjustments::{Adjustments, ListenSpec};
pub use app::{Application, Body, Environ, FileWrapper, StartResponse};
pub use error::{Error, Result};
pub use server::{Handle, Server};

/// Binds `listen` with default [`Adjustments`] and runs the server until
/// interrupted.
pub fn serve<A: Application>(app: A, listen: &str) -> Result<()> {
    let mut server = Server::create(app, Adjustments::default(), listen)?;
    server.run();
    server.close();
    Ok(())
}
