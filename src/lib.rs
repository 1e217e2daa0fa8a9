//! pidq is an active queue management (AQM) crate.
//!
//! pidq decides, for every packet arriving at a bounded FIFO queue, whether
//! to admit it or drop it. Instead of waiting for the queue to fill, a
//! discrete-time PID controller periodically recomputes a drop probability
//! from the gap between a target queue length and the observed queue length,
//! and admission attempts are rejected stochastically against that
//! probability. The result is a queue that hovers near its target occupancy,
//! trading a small controlled loss rate for lower queueing delay.
//!
//! It uses the following terminology:
//! * A *forced drop* is a rejection because the queue is at capacity.
//! * An *unforced drop* is a proactive, probability-based rejection made
//!   while capacity remains.
//! * The *target queue length* is the controller's set-point. It starts at a
//!   linearization-equilibrium value and steps once, at a configured time,
//!   to the final desired value.
//!
//! # Usage
//!
//! * The main interface for this crate is [disc::Disc], built through
//!   [disc::Builder].
//! * Construction requires a [policy::Policy], which carries the controller
//!   coefficients, the tick schedule, and the queue capacity. A default
//!   bounded FIFO is created automatically; callers with their own backing
//!   store implement [queue::PacketQueue], and callers steering a downstream
//!   device queue hand the builder a [sampler::QueueSampler].
//!
//! ```no_run
//! use pidq::disc::{Builder, Verdict};
//! use pidq::policy::Policy;
//!
//! # async {
//! let disc = Builder::<Vec<u8>>::new("eth0-aqm", Policy::default())
//!     .build()
//!     .unwrap();
//!
//! match disc.enqueue(vec![0u8; 1500]) {
//!     Verdict::Admitted => {}
//!     Verdict::Dropped(reason) => eprintln!("dropped: {reason}"),
//! }
//!
//! let _packet = disc.dequeue();
//! # };
//! ```
//!
//! # DTrace probes
//!
//! pidq contains a number of DTrace USDT probes, which fire as packets move
//! through the discipline and as the controller reacts. The full list of
//! probes is:
//!
//! - `enqueue-done`: Fires after a packet is admitted to the queue.
//! - `packet-dropped`: Fires when an admission attempt is rejected, with the
//!   drop reason.
//! - `control-tick`: Fires after each controller recomputation, with the new
//!   drop probability.
//! - `target-stepped`: Fires when the reference step-change replaces the
//!   controller's target queue length.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Probes are zero-cost unless they are explicitly
//! enabled, by tracing the program with the `dtrace(1)` command-line tool.
//!
//! On most systems, the USDT probes must be registered with the DTrace
//! kernel module, a technically fallible process. Registration is attempted
//! when a disc is built; a failure is logged and otherwise ignored, since an
//! uninstrumentable disc is still a functioning disc, and
//! [disc::Builder::build] reserves its error type for configuration
//! problems.

// Public API
pub mod controller;
pub mod disc;
pub mod policy;
pub mod queue;
pub mod sampler;

/// USDT probes for tracing how pidq admits, drops, and re-tunes.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "pidq")]
mod probes {
    /// Fires after a packet is appended to the backing queue, with the
    /// resulting queue depth.
    fn enqueue__done(disc: &str, depth: u64) {}

    /// Fires when an admission attempt is rejected, with the drop reason
    /// ("forced" or "unforced").
    fn packet__dropped(disc: &str, reason: &str) {}

    /// Fires after each controller tick, with the observed queue length and
    /// the saturated drop probability (formatted, since USDT arguments carry
    /// no floating point).
    fn control__tick(disc: &str, observed: u64, drop_probability: &str) {}

    /// Fires when the one-shot reference step replaces the target queue
    /// length.
    fn target__stepped(disc: &str, target: u64) {}
}
