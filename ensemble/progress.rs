//! Progress reporting for the long-running fit stages.
//!
//! Fitting code opens a [`StageProgress`] for each stage it runs and calls
//! [`StageProgress::step`] as units of work complete; the tracker keeps the
//! running count and forwards [`StageEvent`]s to whatever observer the caller
//! supplied. The CLI renders them as progress bars, tests and benches pass
//! [`NoopFitProgress`].

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FitProgressStage {
    Imputation,
    BaseEstimators,
    CrossValidation,
    FinalRefit,
    MetaEstimator,
}

impl FitProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Imputation => "iterative imputation",
            Self::BaseEstimators => "base estimator fitting",
            Self::CrossValidation => "out-of-fold predictions",
            Self::FinalRefit => "full-data refit of base estimators",
            Self::MetaEstimator => "meta-estimator fit",
        }
    }

    /// What one step of the stage counts.
    pub fn unit(self) -> &'static str {
        match self {
            Self::Imputation => "rounds",
            Self::BaseEstimators | Self::FinalRefit => "estimators",
            Self::CrossValidation => "fold fits",
            Self::MetaEstimator => "fits",
        }
    }
}

impl fmt::Display for FitProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageEvent {
    /// The stage will run at most `total` steps.
    Started { total: usize },
    Advanced { completed: usize },
    /// `completed` may fall short of the announced total (early convergence).
    Finished { completed: usize },
}

pub trait FitProgressObserver {
    fn on_event(&mut self, stage: FitProgressStage, event: StageEvent);
}

#[derive(Default)]
pub struct NoopFitProgress;

impl FitProgressObserver for NoopFitProgress {
    fn on_event(&mut self, _stage: FitProgressStage, _event: StageEvent) {}
}

/// Step counter for one running stage.
pub struct StageProgress<'p> {
    observer: &'p mut dyn FitProgressObserver,
    stage: FitProgressStage,
    completed: usize,
}

impl<'p> StageProgress<'p> {
    pub fn begin(
        observer: &'p mut dyn FitProgressObserver,
        stage: FitProgressStage,
        total: usize,
    ) -> Self {
        observer.on_event(stage, StageEvent::Started { total });
        Self {
            observer,
            stage,
            completed: 0,
        }
    }

    pub fn step(&mut self) {
        self.completed += 1;
        self.observer.on_event(
            self.stage,
            StageEvent::Advanced {
                completed: self.completed,
            },
        );
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn finish(self) {
        self.observer.on_event(
            self.stage,
            StageEvent::Finished {
                completed: self.completed,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Vec<(FitProgressStage, StageEvent)>);

    impl FitProgressObserver for Recorder {
        fn on_event(&mut self, stage: FitProgressStage, event: StageEvent) {
            self.0.push((stage, event));
        }
    }

    #[test]
    fn tracker_counts_steps_and_reports_them_in_order() {
        let mut recorder = Recorder::default();
        let mut stage = StageProgress::begin(&mut recorder, FitProgressStage::CrossValidation, 3);
        stage.step();
        stage.step();
        assert_eq!(stage.completed(), 2);
        stage.finish();

        use StageEvent::*;
        let stage = FitProgressStage::CrossValidation;
        assert_eq!(
            recorder.0,
            vec![
                (stage, Started { total: 3 }),
                (stage, Advanced { completed: 1 }),
                (stage, Advanced { completed: 2 }),
                (stage, Finished { completed: 2 }),
            ]
        );
    }

    #[test]
    fn consecutive_stages_share_one_observer() {
        let mut recorder = Recorder::default();
        let observer: &mut dyn FitProgressObserver = &mut recorder;
        StageProgress::begin(&mut *observer, FitProgressStage::FinalRefit, 1).finish();
        let mut meta = StageProgress::begin(&mut *observer, FitProgressStage::MetaEstimator, 1);
        meta.step();
        meta.finish();
        let stages: Vec<_> = recorder.0.iter().map(|(s, _)| *s).collect();
        assert_eq!(stages[..2], [FitProgressStage::FinalRefit; 2]);
        assert_eq!(stages[2..], [FitProgressStage::MetaEstimator; 3]);
    }

    #[test]
    fn units_read_naturally() {
        assert_eq!(FitProgressStage::Imputation.unit(), "rounds");
        assert_eq!(FitProgressStage::CrossValidation.to_string(), "out-of-fold predictions");
    }
}
