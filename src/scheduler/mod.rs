//! Task scheduling on top of Redis queues.
//!
//! - **QueueBackend**: delayed set, ready list, dead-letter set and the id index
//! - **ConcurrencyGate**: global cap on handlers running across all processes
//! - **Submitter**: registers tasks in the repository and enqueues them
//! - **Dispatcher**: worker pool that promotes, takes, runs and retries tasks
//!
//! # Architecture
//!
//! ```text
//!      ┌──────────────┐
//!      │  Submitter   │
//!      │  (CLI/tasks) │
//!      └──────┬───────┘
//!             │ execute_time in future?
//!      ┌──────┴──────────────┐
//!      ▼                     ▼
//! ┌──────────────┐  promote ┌──────────────┐  replay  ┌──────────────┐
//! │ task:delayed ├─────────►│  task:ready  │◄─────────┤  task:dead   │
//! └──────────────┘          └──────┬───────┘          └──────▲───────┘
//!                                  │ BRPOP                   │ failure
//!         ┌────────────────────────┼────────────────────┐    │
//!         ▼                        ▼                    ▼    │
//!    ┌─────────┐              ┌─────────┐          ┌─────────┐
//!    │ Worker 0│              │ Worker 1│          │ Worker N├─┘
//!    └─────────┘              └─────────┘          └─────────┘
//!         └──────── task:concurrency_lock ───────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use rcabench_dispatch::scheduler::{Dispatcher, HandlerRegistry, NewTask, RedisGate, RedisQueue};
//!
//! let queue = Arc::new(RedisQueue::connect(&config.redis_url).await?);
//! let gate = Arc::new(RedisGate::new(queue.connection()));
//!
//! let mut dispatcher = Dispatcher::new(config, queue, gate, db, events, handlers);
//! dispatcher
//!     .submitter()
//!     .submit(NewTask::new(TaskType::BuildImage, payload).immediate())
//!     .await?;
//! dispatcher.start().await?;
//! dispatcher.shutdown().await?;
//! ```

pub mod dispatcher;
pub mod gate;
pub mod handler;
pub mod memory;
pub mod queue;
pub mod submitter;
pub mod task;

pub use dispatcher::{Dispatcher, DispatcherError, PoolStats};
pub use gate::{ConcurrencyGate, MemoryGate, RedisGate};
pub use handler::{DispatchContext, HandlerError, HandlerRegistry, InFlightTasks, TaskHandler};
pub use memory::MemoryQueue;
pub use queue::{QueueBackend, QueueError, QueueName, QueueStats, RedisQueue};
pub use submitter::{CancelOutcome, NewTask, SubmitError, Submitter};
pub use task::{QueuedTask, RetrySchedule, Task, TaskState, TaskStatus, TaskType};
