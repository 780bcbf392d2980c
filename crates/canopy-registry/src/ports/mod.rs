//! Collaborators the registry and its services are constructed with.

mod bridge;
mod clock;
mod renderer;
mod scheduler;
mod store;

pub use bridge::SharedBufferSource;
pub use bridge::SpawnRequest;
pub use bridge::SpawnedProcess;
pub use bridge::TerminalBridge;
pub use clock::Clock;
pub use clock::SystemClock;
pub use renderer::HeadlessRenderer;
pub use renderer::RenderPolicy;
pub use renderer::RendererPolicy;
pub use scheduler::Scheduler;
pub use scheduler::Task;
pub use scheduler::ThreadScheduler;
pub use store::StateStore;
