//! A queue discipline which admits or drops packets under PID control.

use crate::controller::{ControlSample, PidController, OPEN_LOOP};
use crate::policy::Policy;
#[cfg(feature = "probes")]
use crate::probes;
use crate::queue::{DropTailQueue, PacketQueue};
use crate::sampler::QueueSampler;

use debug_ignore::DebugIgnore;
use derive_where::derive_where;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{event, instrument, span, Instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Queue discipline cannot have packet classifiers")]
    Classifiers,

    #[error("Queue discipline cannot have child disciplines")]
    ChildDisciplines,

    #[error("Queue discipline needs exactly one backing queue, but {0} were attached")]
    QueueCount(usize),

    #[error("Controller update period must be nonzero")]
    ZeroUpdatePeriod,
}

/// Why an admission attempt was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The queue was at capacity. Reactive.
    Forced,

    /// The early-drop test fired while capacity remained. Proactive.
    Unforced,
}

impl DropReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DropReason::Forced => "forced",
            DropReason::Unforced => "unforced",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of a single enqueue attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Admitted,
    Dropped(DropReason),
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Verdict::Admitted)
    }
}

/// Cumulative counters for one disc.
///
/// Cloning hands out another handle onto the same counters. Counters only
/// ever grow; reading them never resets anything.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    forced_drops: Arc<AtomicUsize>,
    unforced_drops: Arc<AtomicUsize>,
    enqueued: Arc<AtomicUsize>,
    dequeued: Arc<AtomicUsize>,
}

impl Stats {
    /// The number of packets rejected for the given reason so far.
    pub fn drops(&self, reason: DropReason) -> usize {
        match reason {
            DropReason::Forced => self.forced_drops.load(Ordering::Relaxed),
            DropReason::Unforced => self.unforced_drops.load(Ordering::Relaxed),
        }
    }

    /// The number of packets admitted to the queue so far.
    pub fn enqueued(&self) -> usize {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// The number of packets handed back out of the queue so far.
    pub fn dequeued(&self) -> usize {
        self.dequeued.load(Ordering::Relaxed)
    }

    fn count_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Forced => &self.forced_drops,
            DropReason::Unforced => &self.unforced_drops,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The name of the disc, for instrumentation.
#[derive(Clone, Debug)]
pub(crate) struct Name(Arc<str>);

impl Name {
    pub(crate) fn new<S: Into<Arc<str>>>(name: S) -> Self {
        Self(name.into())
    }

    #[cfg_attr(not(feature = "probes"), allow(dead_code))]
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Distributes packets among the classes of a classful discipline.
///
/// [Disc] manages exactly one undivided queue and refuses to build when one
/// of these is attached; the trait exists so that classful disciplines and
/// this one can share a builder surface.
pub trait Classifier<T>: Send {
    fn classify(&self, packet: &T) -> usize;
}

// Everything the admission path and the scheduled events mutate, behind one
// lock so each of them runs to completion against a consistent view.
#[derive_where(Debug)]
struct Inner<T> {
    queue: DebugIgnore<Box<dyn PacketQueue<T>>>,
    controller: PidController,
}

/// Assembles and validates a [Disc].
///
/// A fresh builder produces a working disc: the backing queue defaults to a
/// [DropTailQueue] sized to the policy's capacity, and the controller samples
/// that same queue. The optional attachments cover the two supported
/// variations (a caller-owned backing store, an external length signal) and
/// the unsupported ones ([Builder::classifier], [Builder::child]), which are
/// rejected when the disc is built rather than silently ignored.
pub struct Builder<T> {
    name: Name,
    policy: Policy,
    queues: Vec<Box<dyn PacketQueue<T>>>,
    sampler: Option<Arc<dyn QueueSampler>>,
    classifiers: Vec<Box<dyn Classifier<T>>>,
    children: Vec<Builder<T>>,
}

impl<T: Send + 'static> Builder<T> {
    /// Starts a builder for a disc with the given instrumentation name.
    pub fn new<S: Into<Arc<str>>>(name: S, policy: Policy) -> Self {
        Self {
            name: Name::new(name),
            policy,
            queues: Vec::new(),
            sampler: None,
            classifiers: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Attaches a caller-supplied backing queue. At most one may be
    /// attached; with none, a [DropTailQueue] is created at build time.
    pub fn queue(mut self, queue: impl PacketQueue<T> + 'static) -> Self {
        self.queues.push(Box::new(queue));
        self
    }

    /// Points the controller's error signal at an external queue instead of
    /// the disc's own. The capacity check always uses the disc's own queue.
    pub fn sampler(mut self, sampler: Arc<dyn QueueSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Attaches a packet classifier. Unsupported; [Builder::build] will
    /// refuse the configuration.
    pub fn classifier(mut self, classifier: impl Classifier<T> + 'static) -> Self {
        self.classifiers.push(Box::new(classifier));
        self
    }

    /// Attaches a child discipline. Unsupported; [Builder::build] will
    /// refuse the configuration.
    pub fn child(mut self, child: Builder<T>) -> Self {
        self.children.push(child);
        self
    }

    /// Validates the configuration and activates the disc.
    ///
    /// On success both scheduled events are armed immediately: the one-shot
    /// reference step, then the controller's first tick. Validation failures
    /// leave nothing running.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self), fields(disc = %self.name), name = "Builder::build")]
    pub fn build(mut self) -> Result<Disc<T>, Error> {
        if !self.classifiers.is_empty() {
            return Err(Error::Classifiers);
        }
        if !self.children.is_empty() {
            return Err(Error::ChildDisciplines);
        }
        if self.policy.update_period.is_zero() {
            return Err(Error::ZeroUpdatePeriod);
        }
        let queue = match self.queues.pop() {
            None => Box::new(DropTailQueue::new(self.policy.max_size)) as Box<dyn PacketQueue<T>>,
            Some(queue) if self.queues.is_empty() => queue,
            Some(_) => return Err(Error::QueueCount(self.queues.len() + 1)),
        };

        let controller = PidController::new(
            self.policy.coefficients,
            self.policy.equilibrium_target,
            self.policy.rng_seed,
        );
        event!(
            Level::INFO,
            set_point = self.policy.equilibrium_target,
            "Activating at the linearization-equilibrium set-point"
        );

        let shared = Arc::new(Mutex::new(Inner {
            queue: DebugIgnore(queue),
            controller,
        }));
        let (sample_tx, sample_rx) = watch::channel(ControlSample {
            observed: 0,
            target: self.policy.equilibrium_target,
            unsaturated: OPEN_LOOP,
            drop_probability: OPEN_LOOP,
        });

        let activated = Instant::now();

        // Arm the step change ahead of the controller so that a step
        // scheduled at or before the first tick is visible to it.
        let step_task = tokio::task::spawn({
            let shared = shared.clone();
            let name = self.name.clone();
            let step_at = self.policy.step_at;
            let target = self.policy.desired_target;
            async move {
                sleep_until(activated + step_at).await;

                shared.lock().unwrap().controller.set_target(target);
                event!(
                    Level::INFO,
                    disc = %name,
                    set_point = target,
                    "Reference step-change: desired set-point now in force"
                );
                #[cfg(feature = "probes")]
                probes::target__stepped!(|| (name.as_str(), target as u64));
            }
        })
        .abort_handle();

        let tick_task = tokio::task::spawn({
            let shared = shared.clone();
            let name = self.name.clone();
            let sampler = self.sampler.clone();
            let update_start = self.policy.update_start;
            let update_period = self.policy.update_period;
            async move {
                let span = span!(Level::DEBUG, "pid_control", disc = %name);
                async move {
                    sleep_until(activated + update_start).await;

                    loop {
                        let sample = {
                            let mut inner = shared.lock().unwrap();
                            let observed = match &sampler {
                                Some(sampler) => sampler.sample(),
                                None => Some(inner.queue.len()),
                            };
                            observed.map(|length| inner.controller.update(length))
                        };

                        // Re-arm before publishing anything: losing a
                        // diagnostic sample is acceptable, delaying the next
                        // control action is not.
                        let next = Instant::now() + update_period;

                        match sample {
                            Some(sample) => {
                                event!(
                                    Level::TRACE,
                                    observed = sample.observed,
                                    unsaturated = sample.unsaturated,
                                    drop_probability = sample.drop_probability,
                                    "Recomputed drop probability"
                                );
                                #[cfg(feature = "probes")]
                                probes::control__tick!(|| (
                                    name.as_str(),
                                    sample.observed as u64,
                                    format!("{}", sample.drop_probability),
                                ));
                                sample_tx.send_replace(sample);
                            }
                            None => {
                                event!(
                                    Level::WARN,
                                    "Length sampler unavailable; keeping previous drop probability"
                                );
                            }
                        }

                        sleep_until(next).await;
                    }
                }
                .instrument(span)
                .await
            }
        })
        .abort_handle();

        #[cfg(feature = "probes")]
        if let Err(err) = usdt::register_probes() {
            event!(Level::WARN, err = %err, "Failed to register USDT probes");
        }

        Ok(Disc {
            name: self.name,
            policy: self.policy,
            shared,
            stats: Stats::default(),
            sample_rx,
            tick_task,
            step_task,
        })
    }
}

/// A PID-controlled queue discipline: one bounded FIFO whose admissions are
/// gated by a periodically recomputed drop probability.
pub struct Disc<T> {
    name: Name,
    policy: Policy,
    shared: Arc<Mutex<Inner<T>>>,
    stats: Stats,
    sample_rx: watch::Receiver<ControlSample>,
    tick_task: AbortHandle,
    step_task: AbortHandle,
}

impl<T: Send + 'static> Disc<T> {
    /// Shorthand for [Builder::new].
    pub fn builder<S: Into<Arc<str>>>(name: S, policy: Policy) -> Builder<T> {
        Builder::new(name, policy)
    }

    /// Decides the fate of one arriving packet.
    ///
    /// Exactly one outcome occurs per attempt: a forced drop when the queue
    /// is at capacity, an unforced drop when the early-drop test fires, or
    /// admission. The early-drop draw is taken before the capacity check, so
    /// the random stream advances once per attempt regardless of outcome;
    /// the capacity check still wins when both would reject.
    pub fn enqueue(&self, packet: T) -> Verdict {
        let mut inner = self.shared.lock().unwrap();
        let queued = inner.queue.len();
        let drop_early = inner.controller.drop_early();

        let reason = if queued >= self.policy.max_size {
            Some(DropReason::Forced)
        } else if drop_early {
            Some(DropReason::Unforced)
        } else {
            match inner.queue.push(packet) {
                Ok(()) => None,
                Err(err) => {
                    // The backing store refused the packet for reasons of
                    // its own; account for it with the queue-full drops.
                    event!(Level::WARN, err = %err, "Backing queue rejected a packet");
                    Some(DropReason::Forced)
                }
            }
        };

        match reason {
            Some(reason) => {
                drop(inner);
                self.stats.count_drop(reason);
                event!(Level::TRACE, reason = %reason, "Dropping packet before enqueue");
                #[cfg(feature = "probes")]
                probes::packet__dropped!(|| (self.name.as_str(), reason.as_str()));
                Verdict::Dropped(reason)
            }
            None => {
                let depth = inner.queue.len();
                drop(inner);
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                event!(Level::TRACE, depth, "Packet admitted");
                #[cfg(feature = "probes")]
                probes::enqueue__done!(|| (self.name.as_str(), depth as u64));
                Verdict::Admitted
            }
        }
    }

    /// Removes and returns the head packet, or `None` on an empty queue.
    /// Dequeueing performs no drop accounting.
    pub fn dequeue(&self) -> Option<T> {
        let packet = self.shared.lock().unwrap().queue.pop()?;
        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(packet)
    }

    /// The number of packets currently queued.
    ///
    /// This, [Disc::is_empty], [Disc::target], and [Disc::drop_probability]
    /// are the read-only view intended for components that need visibility
    /// without a handle on the queue itself.
    pub fn len(&self) -> usize {
        self.shared.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().unwrap().queue.is_empty()
    }

    /// The controller's live drop probability. Negative until the first
    /// controller tick, during which no proactive drop can occur.
    pub fn drop_probability(&self) -> f64 {
        self.shared.lock().unwrap().controller.drop_probability()
    }

    /// The controller's live target queue length.
    pub fn target(&self) -> usize {
        self.shared.lock().unwrap().controller.target()
    }

    /// Returns a reference to the disc's cumulative counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Watches the controller's tick records. The receiver always holds the
    /// most recent [ControlSample]; slow observers miss intermediate ticks
    /// rather than slowing the control loop down.
    pub fn monitor(&self) -> watch::Receiver<ControlSample> {
        self.sample_rx.clone()
    }

    /// Cancels both scheduled events: the periodic controller tick and the
    /// one-shot reference step. This runs ahead of any other teardown so no
    /// callback can fire against released state; dropping the disc does the
    /// same implicitly. Queued packets stay available through
    /// [Disc::dequeue].
    #[instrument(skip(self), fields(disc = %self.name), name = "Disc::terminate")]
    pub fn terminate(&self) {
        self.tick_task.abort();
        self.step_task.abort();
    }
}

impl<T> Drop for Disc<T> {
    fn drop(&mut self) {
        self.tick_task.abort();
        self.step_task.abort();
    }
}
