//! Ordered reconcile steps.
//!
//! A reconcile is an ordered walk over idempotent steps. Each step observes
//! state and either lets the walk continue, asks for a requeue after a delay,
//! or stops the walk early. A step must reach the same outcome when re-run
//! from the same observable state, so a crashed walk resumes correctly from
//! the top on the next reconcile.

use vertiop_k8s_util::error::Result;

use tokio::time::Duration;
use tracing::{debug, trace};

/// Outcome of a single reconcile step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// Postcondition holds, move to the next step.
    Continue,
    /// Abort the walk and re-reconcile after the delay.
    Requeue(Duration),
    /// Abort the walk without scheduling an early requeue.
    Stop,
}

/// A reconciler that knows how to run one step by identifier. Identifiers
/// are plain enums so the pipeline order stays visible in one place.
#[allow(async_fn_in_trait)]
pub trait StepRunner {
    type Id: Copy + std::fmt::Debug;

    async fn run_step(&mut self, id: Self::Id) -> Result<StepResult>;
}

/// Walk `steps` top to bottom. Returns the requeue delay requested by the
/// step that short-circuited the walk, or `None` when the walk ran to the
/// end (or stopped without delay).
pub async fn walk<R: StepRunner>(runner: &mut R, steps: &[R::Id]) -> Result<Option<Duration>> {
    for id in steps {
        trace!(msg = format!("running step {id:?}"));
        match runner.run_step(*id).await? {
            StepResult::Continue => continue,
            StepResult::Requeue(delay) => {
                debug!(msg = format!("step {id:?} requeued after {delay:?}"));
                return Ok(Some(delay));
            }
            StepResult::Stop => {
                debug!(msg = format!("step {id:?} stopped the walk"));
                return Ok(None);
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod test {
    use super::{walk, StepResult, StepRunner};
    use vertiop_k8s_util::error::{Error, Result};

    use tokio::time::Duration;

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum TestStep {
        One,
        Two,
        Three,
    }

    struct Recorder {
        ran: Vec<TestStep>,
        outcome_for_two: StepResult,
        fail_two: bool,
    }

    impl StepRunner for Recorder {
        type Id = TestStep;

        async fn run_step(&mut self, id: TestStep) -> Result<StepResult> {
            self.ran.push(id);
            match id {
                TestStep::Two if self.fail_two => {
                    Err(Error::ExecTransient("boom".to_string()))
                }
                TestStep::Two => Ok(self.outcome_for_two),
                _ => Ok(StepResult::Continue),
            }
        }
    }

    const STEPS: &[TestStep] = &[TestStep::One, TestStep::Two, TestStep::Three];

    #[tokio::test]
    async fn test_walk_runs_in_order() {
        let mut r = Recorder {
            ran: vec![],
            outcome_for_two: StepResult::Continue,
            fail_two: false,
        };
        let requeue = walk(&mut r, STEPS).await.unwrap();
        assert_eq!(requeue, None);
        assert_eq!(r.ran, vec![TestStep::One, TestStep::Two, TestStep::Three]);
    }

    #[tokio::test]
    async fn test_walk_short_circuits_on_requeue() {
        let mut r = Recorder {
            ran: vec![],
            outcome_for_two: StepResult::Requeue(Duration::from_secs(7)),
            fail_two: false,
        };
        let requeue = walk(&mut r, STEPS).await.unwrap();
        assert_eq!(requeue, Some(Duration::from_secs(7)));
        assert_eq!(r.ran, vec![TestStep::One, TestStep::Two]);
    }

    #[tokio::test]
    async fn test_walk_stops_without_delay() {
        let mut r = Recorder {
            ran: vec![],
            outcome_for_two: StepResult::Stop,
            fail_two: false,
        };
        let requeue = walk(&mut r, STEPS).await.unwrap();
        assert_eq!(requeue, None);
        assert_eq!(r.ran, vec![TestStep::One, TestStep::Two]);
    }

    #[tokio::test]
    async fn test_walk_propagates_errors() {
        let mut r = Recorder {
            ran: vec![],
            outcome_for_two: StepResult::Continue,
            fail_two: true,
        };
        let err = walk(&mut r, STEPS).await.unwrap_err();
        assert!(matches!(err, Error::ExecTransient(_)));
        assert_eq!(r.ran, vec![TestStep::One, TestStep::Two]);
    }
}
