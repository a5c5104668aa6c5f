//! Epoch-based learning rate schedule.

use crate::{common::*, config::SchedulerConfig};

/// Decays the learning rate by `gamma` once the epoch reaches each milestone.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiStepLr {
    base_lr: R64,
    milestones: Vec<usize>,
    gamma: R64,
}

/// A range of epochs sharing the same learning rate.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleSegment {
    pub epochs: Range<usize>,
    pub lr: f64,
}

impl MultiStepLr {
    pub fn new(base_lr: R64, config: &SchedulerConfig) -> Result<Self> {
        ensure!(base_lr > 0.0, "the lr must be positive");
        config.validate()?;

        let SchedulerConfig {
            ref milestones,
            gamma,
            ..
        } = *config;

        Ok(Self {
            base_lr,
            milestones: milestones.clone(),
            gamma,
        })
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr.raw()
    }

    /// The learning rate used in the epoch.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        let num_decays = self.milestones.partition_point(|&milestone| milestone <= epoch);
        self.base_lr.raw() * self.gamma.raw().powi(num_decays as i32)
    }

    /// Split `0..epochs` into ranges of constant learning rate.
    pub fn segments(&self, epochs: usize) -> Vec<ScheduleSegment> {
        let bounds: Vec<_> = iter::once(0)
            .chain(
                self.milestones
                    .iter()
                    .cloned()
                    .filter(|&milestone| milestone > 0 && milestone < epochs),
            )
            .chain(iter::once(epochs))
            .collect();

        bounds
            .into_iter()
            .tuple_windows()
            .filter(|(start, end)| start < end)
            .map(|(start, end)| ScheduleSegment {
                epochs: start..end,
                lr: self.lr_at(start),
            })
            .collect()
    }
}
