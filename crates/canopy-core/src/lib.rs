//! Terminal output analysis engine for canopy.
//!
//! Raw PTY bytes arrive through a lock-free [`SharedRingBuffer`]; an analysis
//! worker running on its own thread turns them into agent lifecycle
//! transitions and artifacts, speaking the [`WorkerRequest`] /
//! [`WorkerEvent`] protocol with the host.

#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod artifacts;
pub mod detector;
mod error;
pub mod patterns;
pub mod protocol;
pub mod ring_buffer;
pub mod worker;

pub use artifacts::ArtifactExtractor;
pub use detector::AgentStateDetector;
pub use detector::Detection;
pub use error::RingBufferError;
pub use error::WorkerError;
pub use protocol::AgentState;
pub use protocol::Artifact;
pub use protocol::ArtifactBatch;
pub use protocol::ArtifactKind;
pub use protocol::StateChange;
pub use protocol::StateTrigger;
pub use protocol::TerminalRegistration;
pub use protocol::TerminalUpdate;
pub use protocol::UnknownAgentState;
pub use protocol::WorkerEnvelope;
pub use protocol::WorkerEvent;
pub use protocol::WorkerFailure;
pub use protocol::WorkerOutput;
pub use protocol::WorkerRequest;
pub use ring_buffer::DEFAULT_RING_CAPACITY;
pub use ring_buffer::Frame;
pub use ring_buffer::SharedRingBuffer;
pub use worker::ThreadWorkerFactory;
pub use worker::WorkerFactory;
pub use worker::WorkerHandle;
pub use worker::WorkerSettings;
