pub mod agent_loop;
pub mod judge;
pub mod middleware;
pub mod output_validator;
pub mod refine;
pub mod registry;

pub use agent_loop::{
    recursion_limit_for_tools, should_continue, AgentLoop, AgentLoopConfig, AgentState,
    AgentUpdate, ShouldContinue,
};
pub use judge::ModelJudgeValidator;
pub use middleware::{MessageWindow, MiddlewareChain, PatternGuard};
pub use output_validator::{FnValidator, JsonShapeValidator, OutputCleaner};
pub use refine::{
    generator_fn, FnGenerator, Generation, Generator, ModelGenerator, RefineLoop, RefineRoute,
    RefineState, RefineStatus, RefineUpdate,
};
pub use registry::ToolRegistry;
