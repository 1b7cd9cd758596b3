pub mod context;
pub mod executor;
pub mod result;
pub mod runtime;
pub mod state;
pub mod substitution;

pub use context::{Context, HandlerFn};
pub use executor::{dispatch_command, execute_sequence, execute_sequence_from};
pub use result::HandlerResult;
pub use runtime::Runtime;
pub use state::ExecutionState;
