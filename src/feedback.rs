//! GPU driven instance counts.
//!
//! The height kernel scatters instances of every registered model across the terrain. Each model
//! owns a fixed slot of the shared instance buffer and an atomic counter, which the kernel
//! increments for every instance it writes. The counters are read back asynchronously: the CPU
//! only ever polls whether the cycle finished and keeps drawing the counts of the previous cycle
//! until it did.

use bevy::prelude::*;
use derive_more::derive::From;
use std::ops::Range;

/// The number of consecutive unsuccessful polls after which a stalled readback is reported.
pub const STALL_WARNING_POLLS: u32 = 600;

/// Access to the instance counters written by the GPU.
pub trait InstanceCounters {
    /// Returns whether the counters of the current cycle are available. Never blocks.
    fn poll_fence(&mut self) -> bool;

    /// The counter value of each model, in registration order.
    fn read_counters(&mut self) -> Vec<u32>;

    /// Sets all counters back to zero before the next cycle.
    fn reset_counters(&mut self);
}

/// Receives the instanced draw calls of all models.
pub trait InstancedDrawSink<P> {
    /// Switches to `program` for `model` and the following models sharing it. Returns `false` if
    /// it is not available for `model`.
    fn use_program(&mut self, model: ModelId, program: &P) -> bool;

    /// Draws a model with the instances in the given range of the instance buffer.
    fn draw_model(&mut self, model: ModelId, instances: Range<u32>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, From)]
pub struct ModelId(pub u32);

#[derive(Clone, Debug)]
pub struct InstancedModelSlot<P> {
    pub label: String,
    pub program: P,
    /// The probability of a terrain vertex to spawn an instance of this model.
    pub density: f32,
    /// The first instance of the model's slot.
    pub base_offset: u32,
    /// The number of instances written during the last completed cycle.
    pub instance_count: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FeedbackState {
    /// The counts of the last cycle have been read.
    #[default]
    Ready,
    /// A cycle was dispatched and its counts are not yet available.
    Pending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// The fence signaled and the new counts replaced the old ones.
    Swapped,
    /// The fence has not signaled yet, the previous counts stay in use.
    Stale,
    /// No cycle is in flight.
    Idle,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeedbackStats {
    pub completed_cycles: u64,
    /// Cycles that were replaced by a newer one before their counts were read.
    pub superseded_cycles: u64,
    pub stale_polls: u64,
    pub consecutive_stale_polls: u32,
}

#[derive(Clone, Debug)]
pub struct InstanceFeedback<P> {
    models: Vec<InstancedModelSlot<P>>,
    slot_size: u32,
    state: FeedbackState,
    stats: FeedbackStats,
}

impl<P: PartialEq> InstanceFeedback<P> {
    /// Creates the manager for slots of `slot_size` instances each.
    ///
    /// The kernel spawns at most one instance per model and vertex, so the slot size is the
    /// number of terrain vertices.
    pub fn new(slot_size: u32) -> Self {
        Self {
            models: Vec::new(),
            slot_size,
            state: default(),
            stats: default(),
        }
    }

    pub fn register_model(&mut self, label: impl Into<String>, program: P, density: f32) -> ModelId {
        let id = ModelId(self.models.len() as u32);

        self.models.push(InstancedModelSlot {
            label: label.into(),
            program,
            density,
            base_offset: id.0 * self.slot_size,
            instance_count: 0,
        });

        id
    }

    pub fn set_program(&mut self, model: ModelId, program: P) {
        if let Some(slot) = self.models.get_mut(model.0 as usize) {
            slot.program = program;
        }
    }

    pub fn models(&self) -> &[InstancedModelSlot<P>] {
        &self.models
    }

    pub fn model(&self, model: ModelId) -> Option<&InstancedModelSlot<P>> {
        self.models.get(model.0 as usize)
    }

    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    /// The number of instances the shared instance buffer has to hold.
    pub fn instance_buffer_len(&self) -> u32 {
        self.slot_size * self.models.len() as u32
    }

    pub fn state(&self) -> FeedbackState {
        self.state
    }

    pub fn stats(&self) -> FeedbackStats {
        self.stats
    }

    /// Starts a new cycle, right before the kernel is dispatched.
    ///
    /// An unread previous cycle is dropped, so the counts are never more than one cycle behind.
    pub fn arm_cycle(&mut self, counters: &mut impl InstanceCounters) {
        if self.state == FeedbackState::Pending {
            self.stats.superseded_cycles += 1;
            warn!("dropping an unread instance count cycle");
        }

        counters.reset_counters();
        self.state = FeedbackState::Pending;
        self.stats.consecutive_stale_polls = 0;
    }

    /// Checks the fence of the pending cycle without waiting for it.
    pub fn poll_and_maybe_swap(&mut self, counters: &mut impl InstanceCounters) -> PollOutcome {
        if self.state == FeedbackState::Ready {
            return PollOutcome::Idle;
        }

        if !counters.poll_fence() {
            self.stats.stale_polls += 1;
            self.stats.consecutive_stale_polls += 1;

            if self.stats.consecutive_stale_polls == STALL_WARNING_POLLS {
                warn!(
                    "the instance counts have not been read back for {STALL_WARNING_POLLS} frames"
                );
            }

            return PollOutcome::Stale;
        }

        let counts = counters.read_counters();

        for (index, model) in self.models.iter_mut().enumerate() {
            let count = counts.get(index).copied().unwrap_or(0);
            model.instance_count = count.min(self.slot_size);
        }

        counters.reset_counters();
        self.state = FeedbackState::Ready;
        self.stats.completed_cycles += 1;
        self.stats.consecutive_stale_polls = 0;

        PollOutcome::Swapped
    }

    /// Issues one instanced draw per model with instances, switching programs only when they
    /// differ from the previous model's. Returns the number of draws.
    pub fn issue_draw_calls(&self, sink: &mut impl InstancedDrawSink<P>) -> u32 {
        let mut current: Option<&P> = None;
        let mut draws = 0;

        for (index, model) in self.models.iter().enumerate() {
            if model.instance_count == 0 {
                continue;
            }

            if current != Some(&model.program) {
                if !sink.use_program(ModelId(index as u32), &model.program) {
                    current = None;
                    continue;
                }
                current = Some(&model.program);
            }

            let instances = model.base_offset..model.base_offset + model.instance_count;
            sink.draw_model(ModelId(index as u32), instances);
            draws += 1;
        }

        draws
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockCounters {
        values: Vec<u32>,
        signaled: bool,
        resets: u32,
    }

    impl MockCounters {
        fn new(models: usize) -> Self {
            Self {
                values: vec![0; models],
                ..default()
            }
        }

        fn increment(&mut self, model: usize, times: u32) {
            self.values[model] += times;
        }
    }

    impl InstanceCounters for MockCounters {
        fn poll_fence(&mut self) -> bool {
            self.signaled
        }

        fn read_counters(&mut self) -> Vec<u32> {
            self.values.clone()
        }

        fn reset_counters(&mut self) {
            self.values.iter_mut().for_each(|value| *value = 0);
            self.signaled = false;
            self.resets += 1;
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        unavailable: Vec<&'static str>,
        unavailable_models: Vec<u32>,
        calls: Vec<String>,
    }

    impl InstancedDrawSink<&'static str> for RecordingSink {
        fn use_program(&mut self, model: ModelId, program: &&'static str) -> bool {
            self.calls.push(format!("use {program}"));
            !self.unavailable.contains(program) && !self.unavailable_models.contains(&model.0)
        }

        fn draw_model(&mut self, model: ModelId, instances: Range<u32>) {
            self.calls.push(format!("draw {} {instances:?}", model.0));
        }
    }

    fn feedback() -> InstanceFeedback<&'static str> {
        let mut feedback = InstanceFeedback::new(100);
        feedback.register_model("grass", "foliage", 0.5);
        feedback.register_model("flowers", "foliage", 0.1);
        feedback.register_model("rocks", "solid", 0.01);
        feedback
    }

    #[test]
    fn slots_are_laid_out_by_registration() {
        let feedback = feedback();

        let offsets = feedback
            .models()
            .iter()
            .map(|model| model.base_offset)
            .collect::<Vec<_>>();

        assert_eq!(offsets, vec![0, 100, 200]);
        assert_eq!(feedback.instance_buffer_len(), 300);
    }

    #[test]
    fn completed_cycle_swaps_in_the_counts() {
        let mut feedback = feedback();
        let mut counters = MockCounters::new(3);

        feedback.arm_cycle(&mut counters);
        counters.increment(0, 42);
        counters.increment(2, 7);

        assert_eq!(
            feedback.poll_and_maybe_swap(&mut counters),
            PollOutcome::Stale
        );
        assert_eq!(feedback.model(ModelId(0)).unwrap().instance_count, 0);

        counters.signaled = true;

        assert_eq!(
            feedback.poll_and_maybe_swap(&mut counters),
            PollOutcome::Swapped
        );
        assert_eq!(feedback.state(), FeedbackState::Ready);
        assert_eq!(feedback.model(ModelId(0)).unwrap().instance_count, 42);
        assert_eq!(feedback.model(ModelId(1)).unwrap().instance_count, 0);
        assert_eq!(feedback.model(ModelId(2)).unwrap().instance_count, 7);

        // the next cycle starts from zero
        assert_eq!(counters.values, vec![0, 0, 0]);
        assert_eq!(
            feedback.poll_and_maybe_swap(&mut counters),
            PollOutcome::Idle
        );
    }

    #[test]
    fn stale_counts_stay_in_use() {
        let mut feedback = feedback();
        let mut counters = MockCounters::new(3);

        feedback.arm_cycle(&mut counters);
        counters.increment(1, 5);
        counters.signaled = true;
        feedback.poll_and_maybe_swap(&mut counters);

        feedback.arm_cycle(&mut counters);
        counters.increment(1, 9);

        for _ in 0..10 {
            assert_eq!(
                feedback.poll_and_maybe_swap(&mut counters),
                PollOutcome::Stale
            );
            assert_eq!(feedback.model(ModelId(1)).unwrap().instance_count, 5);
        }

        assert_eq!(feedback.stats().stale_polls, 10);
        assert_eq!(feedback.stats().consecutive_stale_polls, 10);
    }

    #[test]
    fn new_cycle_supersedes_an_unread_one() {
        let mut feedback = feedback();
        let mut counters = MockCounters::new(3);

        feedback.arm_cycle(&mut counters);
        counters.increment(0, 3);
        feedback.arm_cycle(&mut counters);

        assert_eq!(counters.values[0], 0);
        assert_eq!(feedback.stats().superseded_cycles, 1);
        assert_eq!(feedback.state(), FeedbackState::Pending);
    }

    #[test]
    fn counts_are_clamped_to_the_slot() {
        let mut feedback = feedback();
        let mut counters = MockCounters::new(3);

        feedback.arm_cycle(&mut counters);
        counters.increment(2, 1000);
        counters.signaled = true;
        feedback.poll_and_maybe_swap(&mut counters);

        assert_eq!(feedback.model(ModelId(2)).unwrap().instance_count, 100);
    }

    #[test]
    fn programs_switch_only_when_they_change() {
        let mut feedback = feedback();
        let mut counters = MockCounters::new(3);

        feedback.arm_cycle(&mut counters);
        counters.increment(0, 10);
        counters.increment(1, 20);
        counters.increment(2, 30);
        counters.signaled = true;
        feedback.poll_and_maybe_swap(&mut counters);

        let mut sink = RecordingSink::default();
        assert_eq!(feedback.issue_draw_calls(&mut sink), 3);
        assert_eq!(
            sink.calls,
            vec![
                "use foliage",
                "draw 0 0..10",
                "draw 1 100..120",
                "use solid",
                "draw 2 200..230",
            ]
        );
    }

    #[test]
    fn models_without_instances_or_program_are_skipped() {
        let mut feedback = feedback();
        let mut counters = MockCounters::new(3);

        feedback.arm_cycle(&mut counters);
        counters.increment(0, 10);
        counters.increment(2, 30);
        counters.signaled = true;
        feedback.poll_and_maybe_swap(&mut counters);

        let mut sink = RecordingSink {
            unavailable: vec!["solid"],
            ..default()
        };

        assert_eq!(feedback.issue_draw_calls(&mut sink), 1);
        assert_eq!(sink.calls, vec!["use foliage", "draw 0 0..10", "use solid"]);
    }

    #[test]
    fn shared_program_unavailable_for_one_model_still_draws_the_others() {
        let mut feedback = feedback();
        let mut counters = MockCounters::new(3);

        feedback.arm_cycle(&mut counters);
        counters.increment(0, 10);
        counters.increment(1, 20);
        counters.increment(2, 30);
        counters.signaled = true;
        feedback.poll_and_maybe_swap(&mut counters);

        // e.g. the mesh of the first model is not prepared yet
        let mut sink = RecordingSink {
            unavailable_models: vec![0],
            ..default()
        };

        assert_eq!(feedback.issue_draw_calls(&mut sink), 2);
        assert_eq!(
            sink.calls,
            vec![
                "use foliage",
                "use foliage",
                "draw 1 100..120",
                "use solid",
                "draw 2 200..230",
            ]
        );
    }
}
