use std::iter::FusedIterator;

use super::TimeIntegrator;
use crate::error::Result;
use crate::field::Field;
use crate::problem::Forcing;

/// State of the integration at one sampled step.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<'g> {
    pub step: usize,
    pub time: f64,
    pub field: Field<'g>,
}

/// Single-pass iterator over the snapshots of a [`TimeIntegrator`].
///
/// Each call to `next` advances the integrator to the next sample. After the
/// final step, or after an `Err` item, the iterator is exhausted. The
/// integrator remembers both the emitted initial state and a failed step, so
/// a new iterator over it continues where the last one stopped and yields
/// nothing once the run has ended.
pub struct Snapshots<'a, 'g, F: Forcing> {
    integrator: &'a mut TimeIntegrator<'g, F>,
    done: bool,
}

impl<'a, 'g, F: Forcing> Snapshots<'a, 'g, F> {
    pub(super) fn new(integrator: &'a mut TimeIntegrator<'g, F>) -> Self {
        Self {
            integrator,
            done: false,
        }
    }

    fn current(&self) -> Snapshot<'g> {
        Snapshot {
            step: self.integrator.step_index(),
            time: self.integrator.time(),
            field: self.integrator.state().clone(),
        }
    }
}

impl<'g, F: Forcing> Iterator for Snapshots<'_, 'g, F> {
    type Item = Result<Snapshot<'g>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.integrator.take_initial() {
            return Some(Ok(self.current()));
        }
        loop {
            if self.integrator.is_finished() {
                self.done = true;
                return None;
            }
            if let Err(err) = self.integrator.step() {
                self.done = true;
                return Some(Err(err));
            }
            let step = self.integrator.step_index();
            if self.integrator.is_finished() || step % self.integrator.sample_every() == 0 {
                return Some(Ok(self.current()));
            }
        }
    }
}

impl<F: Forcing> FusedIterator for Snapshots<'_, '_, F> {}
