//! Message assembly, the outbound relay and the delivery session.

pub mod message;
pub mod relay;
pub mod session;

pub use message::{AssetCache, BrandingConfig, MessageComposer};
pub use relay::{Relay, RelayTls, SmtpConfig, SmtpRelay, parse_mailbox};
pub use session::{
    DeliverySettings, SendEvent, SendSession, SessionConfig, SessionHandle, SessionReport,
    SessionState, StopSignal,
};
