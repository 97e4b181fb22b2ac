//! Background execution: run lifecycle, the worker thread, and the two
//! channels that carry its results back to the host thread.
//!
//! Front ends only talk to [`Launcher`]; procedures only talk to
//! [`crate::engine::WorkerContext`].

mod channels;
mod controller;

#[cfg(test)]
pub(crate) use channels::delivery_channel;
pub(crate) use channels::DeliverySender;
pub use controller::Launcher;
