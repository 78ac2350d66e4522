//! Network infrastructure: printer-facing WebSocket sessions.
//!
//! - `session_manager` owns one supervised worker per registered printer and
//!   implements the command and file-listing seams of the application layer.
//! - `sdcp_transport` opens the real `ws://<ip>:<port>/websocket` links.

pub mod sdcp_transport;
pub mod session_manager;

pub use sdcp_transport::WebSocketTransport;
pub use session_manager::{
    LinkEvent, PrinterLink, PrinterTransport, SessionConfig, SessionManager, SessionSignal,
    SessionSnapshot, StatusBoard, TransportError,
};
