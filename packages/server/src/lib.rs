//! Server package: the Postgres kernel and the services that run over it.
//!
//! - [`kernel`] - storage-plane implementations of the engine traits
//! - [`scheduler`] - weighted fair claims and the execution pool
//! - [`worker`] - per-claim execution with heartbeats and retry policy
//! - [`reclaimer`] - expired-lease sweep
//! - [`sweeper`] - unacked-signal redelivery and timer wakeups
//! - [`server`] - the HTTP collaborator surface
//!
//! Domain logic (planners, node handlers, tools) is registered by the
//! embedding application; this package only provides the substrate.

pub mod config;
pub mod kernel;
pub mod reclaimer;
pub mod scheduler;
pub mod server;
pub mod sweeper;
pub mod worker;

pub use config::Config;
pub use kernel::JobKernel;
pub use reclaimer::Reclaimer;
pub use scheduler::{default_queues, QueueConfig, Scheduler, SchedulerConfig, TicketWheel};
pub use sweeper::SignalSweeper;
pub use worker::{RetryPolicy, Worker, WorkerConfig};
