//! Session layer for the FC/FCoE initiator
//!
//! This crate tracks remote port sessions and the exchanges opened on them:
//! - the session table keyed by local and remote port identifiers
//! - the PLOGI / PRLI / LOGO login driver
//! - session state and events delivered to registered listeners
//! - exchange identifier allocation and inbound frame correlation

pub mod error;
pub mod events;
pub mod exchange;
pub mod login;
pub mod params;
pub mod session;
pub mod state;
pub mod table;

pub use error::{FcError, FcResult};
pub use events::{CallbackEventListener, SessionEvent, SessionEventListener};
pub use exchange::{Exchange, ExchangeManager};
pub use login::{ElsRequester, LoginConfig};
pub use params::{FcpParams, RemotePort, ServiceParams};
pub use session::{Session, SessionKey};
pub use state::SessionState;
pub use table::SessionTable;
