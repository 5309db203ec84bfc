pub mod callback;
pub mod clock;
pub mod engine;

pub use callback::{CallbackStatus, SnaCallback};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    AccessibilityResolver, DispatchEngine, EngineBuilder, EvictionListener, MessageQueue,
};
