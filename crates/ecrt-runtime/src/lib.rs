#![doc = "Real-time core for the EtherCAT master runtime: cyclic scheduling, lock-free queues and event sequencing."]

pub mod clock;
pub mod realtime;
pub mod registry;
pub mod scheduler;
pub mod sequencer;
pub mod spsc;
pub mod stats_cell;

pub use clock::*;
pub use realtime::*;
pub use registry::{Handle, Registry};
pub use scheduler::*;
pub use sequencer::*;
pub use spsc::{channel, Consumer, HeadSlot, Producer, TailSlot, MAX_DEPTH};
pub use stats_cell::SharedStats;
