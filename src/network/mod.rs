//! Network layer
//!
//! Listeners, client sessions and the record relay. Clients receive the raw
//! record stream; nothing they send is interpreted.

pub mod listener;
pub mod relay;
pub mod session;

pub use listener::{Listener, ListenerError, ListenerManager, ListenerSpec, ListenerState};
pub use relay::{RelayDispatcher, RelayStatsSnapshot};
pub use session::{ClientRegistry, ClientSession, SessionId, SessionState};
