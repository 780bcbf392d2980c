//! Process side of canopy: PTY handles and the bridge the registry drives.

#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod bridge;
pub mod error;
mod output;
mod pty;

pub use bridge::OutputSink;
pub use bridge::PtyBridge;
pub use error::PtyError;
pub use output::HISTORY_LINES;
pub use output::OutputHistory;
pub use output::SessionOutput;
pub use pty::PtyHandle;
pub use pty::PtyReader;

pub type Result<T> = std::result::Result<T, PtyError>;
