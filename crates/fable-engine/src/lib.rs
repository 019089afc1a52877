pub mod error;
pub mod generation;
pub mod lifecycle;
pub mod mock;
pub mod window;

pub use error::EngineError;
pub use generation::{GenerationHandle, GenerationObserver, GenerationOrchestrator, NoopObserver};
pub use lifecycle::{CoordinatorConfig, LifecycleState, TurnCoordinator, TurnOutcome};
pub use window::{build_window, HistoryWindow, HistoryWindowConfig, WindowStats};
