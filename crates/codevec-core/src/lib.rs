//! Codevec Core Library
//!
//! Domain models and services for streaming answers: task dispatch, the
//! session channel message schema and the worker that produces the stream.

pub mod config;
pub mod error;
pub mod stream;
pub mod task;
pub mod worker;

pub use config::Config;
pub use error::{CodevecError, CodevecResult};
pub use stream::model::{ChannelMessage, MessageKind, Notice, Step, StreamEvent};
pub use task::model::{Task, TaskHandle, PROCESS_TASK};
pub use worker::answer::{AnswerSource, FragmentStream};
pub use worker::{TaskExecutor, WorkerPool};
