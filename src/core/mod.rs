//! 核心编排层：重试策略、结果缓存、会话状态机、actor 运行时、轮次协调与会话引擎

pub mod actor;
pub mod cache;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod handle;
pub mod machine;
pub mod retry;
pub mod state;

pub use actor::{
    ConversationActor, ConversationHandle, Dependencies, OrchestrationSettings, SnapshotPersister,
    TransitionHook,
};
pub use cache::ResultCache;
pub use coordinator::TurnCoordinator;
pub use engine::{ConversationEngine, ConversationSpec};
pub use error::{StageError, TurnError};
pub use handle::StreamHandle;
pub use machine::{ConversationMachine, Effect, Event, Outcome, Ticket, Transition, TurnInput};
pub use retry::{RetryDecision, RetryPolicy};
pub use state::{
    ConversationContext, ConversationState, DetectPhase, MachineSnapshot, ReadDataPhase,
    RunningState, Stage, StageTimeouts,
};
