pub mod approval;
pub mod ask_say;
pub mod clock;
pub mod config;
pub mod delegation;
pub mod error;
pub mod event_bus;
pub mod history;
pub mod persistence;
pub mod repetition_guard;
pub mod runtime;
pub mod stream_assembler;
pub mod task;
pub mod token_cost;
pub mod tools;

pub use approval::*;
pub use ask_say::*;
pub use clock::*;
pub use config::*;
pub use delegation::*;
pub use error::*;
pub use event_bus::*;
pub use history::*;
pub use persistence::*;
pub use repetition_guard::*;
pub use runtime::*;
pub use stream_assembler::*;
pub use task::*;
pub use token_cost::*;
pub use tools::*;
