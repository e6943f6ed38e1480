pub mod emitter;

pub use emitter::{StreamEmitter, ToolCallEmit, format_sse_event};
