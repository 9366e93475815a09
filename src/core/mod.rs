pub mod error;
pub mod pty_process;
pub mod registry;
pub mod session;
pub mod token_vault;

pub use error::{DispatchError, PtyError};
pub use pty_process::PtyProcess;
pub use registry::Registry;
pub use session::Session;
pub use token_vault::TokenVault;
