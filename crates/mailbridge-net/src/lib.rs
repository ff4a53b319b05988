// Boundaries to the two networks the bridge connects: the mail side
// (`RemoteConnector` / `RemoteClient`) and the chat side (`ChatTransport` /
// `Intent`), plus an application-service HTTP client and loopback
// implementations of both.

pub mod appservice;
pub mod error;
pub mod intent;
pub mod memory;
pub mod remote;

pub use appservice::AppServiceTransport;
pub use error::{IntentError, RemoteError};
pub use intent::{ChatTransport, CreateRoom, Intent, StateEvent};
pub use memory::{MemoryHomeserver, MemoryMailNetwork, TimelineEvent};
pub use remote::{MailNotification, RemoteClient, RemoteConnector};
