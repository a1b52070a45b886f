//! Emulated accelerator
//!
//! An in-process device whose memory is host memory and whose lanes defer work
//! until they are polled. It behaves like an asynchronous accelerator from the
//! dispatch loop's point of view: copies and launches are only enqueued, a
//! lane reports `Pending` for a configurable number of polls, and the work
//! runs when the lane is found complete or synchronized.
//!
//! # Lane ordering
//!
//! By default lanes only run when polled, and the dispatch loop polls the
//! oldest lane first, so lanes complete in submission order. In eager mode
//! work runs as soon as it is enqueued unless its lane is stalled, which lets
//! a younger lane finish before an older one the way concurrent streams do.
//! `wait_for` runs the producer lane's queued work immediately.
//!
//! # Fault injection
//!
//! Copies, launches and lane queries can be told to fail after a number of
//! successful calls. Failures are sticky, the way a real device that hit a
//! hard error keeps reporting it. A device can also be made unavailable
//! (its memory probe fails) or held (every lane stays `Pending` until
//! released), which lets tests pin the dispatch loop in a known state.
//!
//! # Statistics
//!
//! [`EmulatedStats`] counts enqueued operations and records the largest
//! number of threads ever observed inside lane methods at once. A correct
//! dispatch controller keeps that number at one.

mod device;
mod lane;

pub use device::{EmulatedDevice, EmulatedStats};
pub use lane::EmulatedLane;
