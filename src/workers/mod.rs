//! Background workers that run independently of any request.

pub mod auto_completion;

pub use auto_completion::{AutoCompletionPoller, PollReport};
