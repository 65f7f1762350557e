//! The server side: the UDP end point, the session registry and the message dispatcher.

pub mod dispatcher;
pub mod end_point;
pub mod registry;
pub mod send_socket;

pub use dispatcher::{Dispatcher, DispatcherConfig, MessageHandler};
pub use end_point::{EndPoint, EndPointConfig};
pub use registry::SessionRegistry;
pub use send_socket::SendSocket;
