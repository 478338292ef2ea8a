//! Control-plane communication: delivery queue, persistent channel, polling
//! fallback, result reporting and machine identity.

pub mod connection;
pub mod identity;
pub mod queue;
pub mod reporter;
pub mod updates;

pub use connection::{Connection, ConnectionSettings};
pub use identity::{MachineIdentity, MachineSummary};
pub use queue::{QueueEntry, QueueEntryType, QueueReceiver, QueueSender, delivery_queue};
pub use reporter::{NullSink, Reporter, ResultSink};
pub use updates::{UpdatesClient, UpdateType};
