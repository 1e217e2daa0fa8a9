//! The discrete-time PID controller behind the early-drop decision.
//!
//! The controller holds two steps of history and turns a queue-size error
//! sample into a saturated drop probability once per tick. It is pure state:
//! no timers, no I/O. The discipline's control task feeds it samples on a
//! schedule, which keeps the recurrence itself deterministic and testable in
//! isolation.

use crate::policy::Coefficients;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// Sentinel probability used until the first recomputation. The early-drop
// test compares `p < v` for v in [0, 1), so a negative p can never drop.
pub(crate) const OPEN_LOOP: f64 = -1.0;

/// One controller recomputation, as published to observers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlSample {
    /// The queue length sampled for this tick.
    pub observed: usize,

    /// The set-point in force during this tick.
    pub target: usize,

    /// The controller output after the equilibrium bias, before saturation.
    ///
    /// Not re-derivable from [ControlSample::drop_probability] once the
    /// clamp has flattened it, so both are recorded.
    pub unsaturated: f64,

    /// The saturated drop probability admission now tests against.
    pub drop_probability: f64,
}

/// Recomputes the drop probability from queue-size error samples.
///
/// The recurrence is
///
/// ```text
/// u_0 = a*u_1 + b*u_2 + c*e_0 + d*e_1 + e*e_2
/// ```
///
/// followed by the `u0` equilibrium bias and saturation into `[0, 1]`. The
/// histories store the *unbiased, unsaturated* outputs: the coefficients
/// were fit against the linearized model, and feeding the bias or the clamp
/// back through `u_1`/`u_2` would detune it.
#[derive(Debug)]
pub struct PidController {
    coefficients: Coefficients,

    // Live set-point; equals the equilibrium target until the reference
    // step fires.
    target: usize,

    // Saturated drop probability, OPEN_LOOP until the first update.
    drop_prob: f64,

    // One- and two-step histories of the unsaturated output and the
    // queue-size error.
    u1: f64,
    u2: f64,
    err1: f64,
    err2: f64,

    // Uniform [0, 1) stream for the early-drop test. Owned here exclusively;
    // nothing else may draw from it, so a fixed seed reproduces a run.
    rng: StdRng,
}

impl PidController {
    pub fn new(coefficients: Coefficients, target: usize, rng_seed: u64) -> Self {
        Self {
            coefficients,
            target,
            drop_prob: OPEN_LOOP,
            u1: 0.0,
            u2: 0.0,
            err1: 0.0,
            err2: 0.0,
            rng: StdRng::seed_from_u64(rng_seed),
        }
    }

    /// Feeds one observed queue length through the recurrence, returning the
    /// record of what was computed.
    pub fn update(&mut self, observed: usize) -> ControlSample {
        let k = self.coefficients;
        let err0 = self.target as f64 - observed as f64;

        // PID (Tustin integral term + backward-difference derivative term),
        // folded into a fixed second-order recurrence.
        let mut u0 =
            k.a * self.u1 + k.b * self.u2 + k.c * err0 + k.d * self.err1 + k.e * self.err2;

        // Shift history before the bias: u_1/u_2 must hold the raw output.
        self.u2 = self.u1;
        self.u1 = u0;
        self.err2 = self.err1;
        self.err1 = err0;

        u0 += k.u0;

        self.drop_prob = u0.clamp(0.0, 1.0);

        ControlSample {
            observed,
            target: self.target,
            unsaturated: u0,
            drop_probability: self.drop_prob,
        }
    }

    /// Decides whether the current admission attempt should be dropped
    /// proactively. Consumes one draw from the uniform stream.
    pub fn drop_early(&mut self) -> bool {
        let p = self.drop_prob;
        let v = self.rng.random::<f64>();

        if p < v {
            return false;
        }
        true
    }

    pub fn drop_probability(&self) -> f64 {
        self.drop_prob
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub(crate) fn set_target(&mut self, target: usize) {
        self.target = target;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn coefficients() -> Coefficients {
        Coefficients {
            a: 0.5,
            b: 0.25,
            c: 0.1,
            d: -0.05,
            e: 0.025,
            u0: 0.3,
        }
    }

    // Evaluates the recurrence with no hidden state, as a reference for the
    // stateful controller: returns the (unsaturated, saturated) pair per
    // sample.
    fn reference_sequence(k: Coefficients, target: f64, observed: &[usize]) -> Vec<(f64, f64)> {
        let mut out = Vec::new();
        // outputs[0] is the one-step history, outputs[1] two-step, unbiased.
        let mut outputs = [0.0f64; 2];
        let mut errors = [0.0f64; 2];

        for &n in observed {
            let e0 = target - n as f64;
            let raw = k.a * outputs[0]
                + k.b * outputs[1]
                + k.c * e0
                + k.d * errors[0]
                + k.e * errors[1];
            outputs = [raw, outputs[0]];
            errors = [e0, errors[0]];
            let biased = raw + k.u0;
            out.push((biased, biased.clamp(0.0, 1.0)));
        }
        out
    }

    #[test]
    fn recurrence_matches_reference() {
        let k = coefficients();
        let mut pid = PidController::new(k, 10, 1);
        let observed = [4, 7, 12, 9, 15, 10, 10, 2];

        for (n, (unsaturated, saturated)) in
            observed.iter().zip(reference_sequence(k, 10.0, &observed))
        {
            let sample = pid.update(*n);
            assert_eq!(sample.unsaturated, unsaturated, "observed length {n}");
            assert_eq!(sample.drop_probability, saturated, "observed length {n}");
        }
    }

    #[test]
    fn history_shift_precedes_bias() {
        // With a = 1 and every error coefficient zeroed, each output is
        // exactly the previous *stored* output plus the bias. If the biased
        // value leaked into history, the probability would ratchet up by u0
        // every tick instead of holding still.
        let k = Coefficients {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 0.0,
            e: 0.0,
            u0: 0.5,
        };
        let mut pid = PidController::new(k, 100, 1);

        for _ in 0..5 {
            assert_eq!(pid.update(40).drop_probability, 0.5);
        }
    }

    #[test]
    fn open_loop_never_drops() {
        let mut pid = PidController::new(coefficients(), 10, 12345);
        assert!(pid.drop_probability() < 0.0);

        for _ in 0..10_000 {
            assert!(!pid.drop_early());
        }
    }

    #[test]
    fn output_saturates_to_unit_interval() {
        let k = Coefficients {
            a: 0.0,
            b: 0.0,
            c: 1.0,
            d: 0.0,
            e: 0.0,
            u0: 0.0,
        };
        let mut pid = PidController::new(k, 500, 1);

        // Large positive error saturates high, large negative error low; the
        // unsaturated record keeps the raw value in both cases.
        let high = pid.update(0);
        assert_eq!(high.drop_probability, 1.0);
        assert_eq!(high.unsaturated, 500.0);

        let low = pid.update(1000);
        assert_eq!(low.drop_probability, 0.0);
        assert!(low.unsaturated < 0.0);
    }

    #[test]
    fn shipped_tuning_first_tick() {
        // With the default coefficient set, zeroed histories, and the queue
        // sitting exactly at the equilibrium target, the first tick's output
        // is the bare equilibrium bias.
        let mut pid = PidController::new(Coefficients::default(), 175, 12345);
        let sample = pid.update(175);
        assert_eq!(sample.drop_probability, 0.0085);
        assert_eq!(sample.unsaturated, 0.0085);

        // An empty queue at the same tick would have seen the full error
        // pull the output negative, saturating to zero.
        let mut pid = PidController::new(Coefficients::default(), 175, 12345);
        let sample = pid.update(0);
        assert_eq!(sample.drop_probability, 0.0);
        assert!((sample.unsaturated - (-0.0002556 * 175.0 + 0.0085)).abs() < 1e-12);
    }

    #[test]
    fn drop_fraction_converges_to_probability() {
        let mut pid = PidController::new(coefficients(), 10, 12345);
        pid.drop_prob = 0.3;

        let attempts = 100_000;
        let drops = (0..attempts).filter(|_| pid.drop_early()).count();
        let fraction = drops as f64 / attempts as f64;

        assert!(
            (0.29..=0.31).contains(&fraction),
            "drop fraction {fraction} too far from 0.3"
        );
    }

    #[test]
    fn fixed_seed_reproduces_decisions() {
        let mut first = PidController::new(coefficients(), 10, 99);
        let mut second = PidController::new(coefficients(), 10, 99);
        first.drop_prob = 0.5;
        second.drop_prob = 0.5;

        for _ in 0..1_000 {
            assert_eq!(first.drop_early(), second.drop_early());
        }
    }
}
