//! Configuration options which can alter the behavior of the discipline.

use tokio::time::Duration;

/// Difference-equation coefficients for the discrete PID controller.
///
/// The controller recomputes its unsaturated output once per tick as
///
/// ```text
/// u_0 = a*u_1 + b*u_2 + c*e_0 + d*e_1 + e*e_2
/// ```
///
/// where `u_1`, `u_2` are the previous two unsaturated outputs and `e_0`,
/// `e_1`, `e_2` are the current and previous two queue-size errors. The
/// `u0` bias is the packet-loss ratio at the linearization equilibrium,
/// added after the recurrence.
///
/// These values are fit against a linearized model of the traffic the queue
/// carries; they are configured once and never change at runtime.
#[derive(Clone, Copy, Debug)]
pub struct Coefficients {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub u0: f64,
}

impl Default for Coefficients {
    fn default() -> Self {
        // A published tuning for a ~6.25 ms sampling period, derived by
        // Tustin discretization of the integral term and backward difference
        // of the derivative term.
        Self {
            a: 1.8290,
            b: -0.8290,
            c: -0.0002556,
            d: 0.0005043,
            e: -0.0002487,
            u0: 0.0085,
        }
    }
}

/// Policy which is applicable to a queue discipline.
#[derive(Clone, Debug)]
pub struct Policy {
    /// Controller difference-equation coefficients and equilibrium bias.
    pub coefficients: Coefficients,

    /// Interval between successive controller recomputations ("Tupdate").
    ///
    /// Its inverse is the sampling frequency the coefficients were derived
    /// for. Must be nonzero.
    pub update_period: Duration,

    /// Offset from disc activation at which the controller performs its
    /// first recomputation ("Supdate"). Before this point the disc runs
    /// open-loop and never drops proactively.
    pub update_start: Duration,

    /// Offset from disc activation at which the target queue length steps
    /// from [Self::equilibrium_target] to [Self::desired_target] ("Sstep").
    pub step_at: Duration,

    /// The maximum number of packets accepted by the discipline ("MaxSize").
    ///
    /// An enqueue attempt at this depth is a forced drop.
    pub max_size: usize,

    /// The target queue length at which the controller's model was
    /// linearized ("QueueSizeReferenceEQ"); the set-point until the step
    /// fires.
    pub equilibrium_target: usize,

    /// The desired target queue length after the step
    /// ("QueueSizeReferenceDQ").
    pub desired_target: usize,

    /// Derivative-term filter order ("N"). Recognized and carried, but the
    /// current recurrence folds any filtering into the coefficients, so this
    /// value is unused.
    pub filter_order: u32,

    /// Seed for the discipline's uniform random stream, which the early-drop
    /// test draws from. Fixed so a run is reproducible; the stream is owned
    /// by the controller and consumed by nothing else.
    pub rng_seed: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            coefficients: Coefficients::default(),
            update_period: Duration::from_micros(6250),
            update_start: Duration::from_secs(1),
            step_at: Duration::from_secs(81),
            max_size: 800,
            equilibrium_target: 175,
            desired_target: 475,
            filter_order: 0,
            rng_seed: 12345,
        }
    }
}
