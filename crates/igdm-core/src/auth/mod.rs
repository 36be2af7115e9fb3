//! Session storage, verification codes, and login.

pub mod authenticator;
pub mod codes;
pub mod session;

pub use authenticator::{AuthError, Authenticator, Credentials};
pub use codes::{CodeError, CodeInbox, CodeKind, CodeSource, FileCodeSource};
pub use session::SessionStore;
