//! Client for a just-in-time privileged access service.
//!
//! Users request time-boxed access to an asset, admins approve or deny with
//! a step-up code, and an approved request can start one interactive
//! terminal session. Finished sessions can be replayed with their original
//! timing.

pub mod bridge;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod replay;
pub mod surface;
pub mod updates;

pub use bridge::{BridgeHandle, ChannelStatus, LiveBridge};
pub use config::ClientConfig;
pub use credentials::{CredentialStore, Credentials, FileCredentialStore, Identity, MemoryCredentialStore};
pub use error::{PamError, Result};
pub use gateway::{AuthSignal, Gateway, HttpTransport, ReqwestTransport};
pub use lifecycle::{JitRequest, JitStatus, NewJitRequest, Session, SessionController, SessionTicket};
pub use replay::{ReplayEngine, ReplayHandle, ReplayStatus};
pub use surface::{StdoutSurface, TerminalSurface};
pub use updates::{UpdateEvent, UpdatesFeed};
