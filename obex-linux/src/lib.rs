//! OBEX over tokio: frame transport, client session and operations,
//! server dispatcher, folder handler and daemon configuration.

pub mod client;
pub mod config;
pub mod handler;
pub mod operation;
pub mod server;
pub mod transport;

pub use client::{ClientSession, Reply};
pub use handler::FolderHandler;
pub use operation::{Operation, OperationKind};
pub use server::{serve, RequestHandler, ServerOperation, ServerOptions, ServerSession};
pub use transport::{Connector, FrameIo, TcpConnector, Trigger};
