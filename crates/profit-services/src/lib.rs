//! profit-services — channels, worker agents, transfer engine and runners.
//! `profitd` serves the agents; `profit-ctl` drives runners.

pub mod agent;
pub mod channel;
pub mod cleanup_client;
pub mod dispatch;
pub mod event;
pub mod multichannel;
pub mod queue;
pub mod retry;
pub mod run_client;
pub mod runner;
pub mod transfer;
pub mod transport;

pub use channel::{Channel, ChannelError, ChannelOptions};
pub use event::Event;
pub use multichannel::MultiChannel;
pub use runner::{BackendUrl, BatchHandle, BatchReport, JobSpec, Runner, RunnerError};
pub use transport::{Endpoint, SshTarget};
