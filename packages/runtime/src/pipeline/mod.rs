//! Behavior pipeline engine.
//!
//! A [`Pipeline`] is an ordered list of [`Behavior`]s over one context type,
//! closed by exactly one [`Terminator`]. Composition is fixed when the
//! pipeline is built:
//!
//! 1. Behaviors run in registration order, each receiving a [`Next`] continuation
//! 2. A behavior may act before and after `next.run(ctx)`, or skip it to short-circuit
//! 3. The terminator performs the external effect and has no continuation
//!
//! Behaviors nest like scoped blocks: a failure deeper in the chain surfaces
//! through every already-entered behavior's post-`next` code before reaching
//! the caller of [`Pipeline::invoke`]. The engine never retries.

pub mod behaviors;
pub mod contexts;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use courier_core::Extensions;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::error::PipelineError;

pub use contexts::{
    IncomingContext, IncomingMessageInfo, OutgoingContext, PendingTransportOperations,
    SubscriptionContext,
};

// ---------------------------------------------------------------------------
// PipelineContext
// ---------------------------------------------------------------------------

/// Implemented by every context type a pipeline runs over.
pub trait PipelineContext: Send + 'static {
    /// The context-tree node owned by this operation.
    fn extensions(&self) -> &Arc<Extensions>;

    /// Token observed by every continuation of this invocation.
    fn cancellation(&self) -> &CancellationToken;
}

// ---------------------------------------------------------------------------
// Behavior / Terminator
// ---------------------------------------------------------------------------

/// One step of a pipeline.
#[async_trait]
pub trait Behavior<C: PipelineContext>: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    async fn invoke(&self, context: &mut C, next: Next<'_, C>) -> Result<(), PipelineError>;
}

/// The final step of a pipeline. Performs the actual external effect.
#[async_trait]
pub trait Terminator<C: PipelineContext>: Send + Sync {
    async fn terminate(&self, context: &mut C) -> Result<(), PipelineError>;
}

// ---------------------------------------------------------------------------
// Next
// ---------------------------------------------------------------------------

/// Continuation handed to a behavior; runs the rest of the chain.
pub struct Next<'a, C: PipelineContext> {
    behaviors: &'a [Arc<dyn Behavior<C>>],
    terminator: &'a dyn Terminator<C>,
    cancellation: &'a CancellationToken,
}

impl<'a, C: PipelineContext> Next<'a, C> {
    /// Runs the remaining behaviors and the terminator.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] without entering the next step if
    /// the invocation was cancelled, otherwise whatever the rest of the chain returns.
    pub async fn run(self, context: &mut C) -> Result<(), PipelineError> {
        if self.cancellation.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        match self.behaviors.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    behaviors: rest,
                    terminator: self.terminator,
                    cancellation: self.cancellation,
                };
                head.invoke(context, next).await
            }
            None => self.terminator.terminate(context).await,
        }
    }

    /// The token for this invocation.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        self.cancellation
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A frozen chain of behaviors plus its terminator.
pub struct Pipeline<C: PipelineContext> {
    name: &'static str,
    behaviors: Vec<Arc<dyn Behavior<C>>>,
    terminator: Arc<dyn Terminator<C>>,
}

impl<C: PipelineContext> Pipeline<C> {
    /// Starts building a pipeline named `name`.
    #[must_use]
    pub fn builder(name: &'static str) -> PipelineBuilder<C> {
        PipelineBuilder {
            name,
            behaviors: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Names of the configured behaviors, in execution order.
    #[must_use]
    pub fn behavior_names(&self) -> Vec<&'static str> {
        self.behaviors.iter().map(|b| b.name()).collect()
    }

    /// Runs the chain over `context`.
    ///
    /// # Errors
    ///
    /// Propagates the first failure of any behavior or the terminator.
    pub async fn invoke(&self, context: &mut C) -> Result<(), PipelineError> {
        let cancellation = context.cancellation().clone();
        let span = info_span!(
            "pipeline",
            pipeline = self.name,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let next = Next {
            behaviors: &self.behaviors,
            terminator: self.terminator.as_ref(),
            cancellation: &cancellation,
        };

        let start = Instant::now();
        let result = next.run(context).instrument(span.clone()).await;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        span.record("duration_ms", duration_ms);
        span.record("outcome", if result.is_ok() { "ok" } else { "error" });
        result
    }
}

/// Collects behaviors in order; [`terminate_with`](Self::terminate_with) freezes the pipeline.
pub struct PipelineBuilder<C: PipelineContext> {
    name: &'static str,
    behaviors: Vec<Arc<dyn Behavior<C>>>,
}

impl<C: PipelineContext> PipelineBuilder<C> {
    /// Appends a behavior.
    #[must_use]
    pub fn register(mut self, behavior: impl Behavior<C> + 'static) -> Self {
        self.behaviors.push(Arc::new(behavior));
        self
    }

    /// Appends an already shared behavior.
    #[must_use]
    pub fn register_shared(mut self, behavior: Arc<dyn Behavior<C>>) -> Self {
        self.behaviors.push(behavior);
        self
    }

    /// Appends every behavior from `behaviors`, in order.
    #[must_use]
    pub fn register_all(mut self, behaviors: impl IntoIterator<Item = Arc<dyn Behavior<C>>>) -> Self {
        self.behaviors.extend(behaviors);
        self
    }

    /// Sets the terminator and freezes the pipeline.
    #[must_use]
    pub fn terminate_with(self, terminator: impl Terminator<C> + 'static) -> Pipeline<C> {
        self.terminate_with_shared(Arc::new(terminator))
    }

    #[must_use]
    pub fn terminate_with_shared(self, terminator: Arc<dyn Terminator<C>>) -> Pipeline<C> {
        Pipeline {
            name: self.name,
            behaviors: self.behaviors,
            terminator,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct TestContext {
        extensions: Arc<Extensions>,
        cancellation: CancellationToken,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl TestContext {
        fn new() -> Self {
            Self {
                extensions: Extensions::root(),
                cancellation: CancellationToken::new(),
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl PipelineContext for TestContext {
        fn extensions(&self) -> &Arc<Extensions> {
            &self.extensions
        }

        fn cancellation(&self) -> &CancellationToken {
            &self.cancellation
        }
    }

    struct Recording {
        name: &'static str,
        call_next: bool,
    }

    #[async_trait]
    impl Behavior<TestContext> for Recording {
        async fn invoke(
            &self,
            context: &mut TestContext,
            next: Next<'_, TestContext>,
        ) -> Result<(), PipelineError> {
            context.log.lock().push(format!("{}-before", self.name));
            if !self.call_next {
                return Ok(());
            }
            let result = next.run(context).await;
            context.log.lock().push(format!("{}-after", self.name));
            result
        }
    }

    struct RecordingTerminator {
        fail: bool,
    }

    #[async_trait]
    impl Terminator<TestContext> for RecordingTerminator {
        async fn terminate(&self, context: &mut TestContext) -> Result<(), PipelineError> {
            context.log.lock().push("T".to_string());
            if self.fail {
                return Err(PipelineError::Handler(anyhow::anyhow!("terminator failed")));
            }
            Ok(())
        }
    }

    fn pipeline(b_calls_next: bool, terminator_fails: bool) -> Pipeline<TestContext> {
        Pipeline::builder("test")
            .register(Recording {
                name: "A",
                call_next: true,
            })
            .register(Recording {
                name: "B",
                call_next: b_calls_next,
            })
            .terminate_with(RecordingTerminator {
                fail: terminator_fails,
            })
    }

    #[tokio::test]
    async fn behaviors_nest_around_the_terminator() {
        let mut ctx = TestContext::new();
        pipeline(true, false).invoke(&mut ctx).await.unwrap();

        assert_eq!(
            ctx.entries(),
            vec!["A-before", "B-before", "T", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest_of_the_chain() {
        let mut ctx = TestContext::new();
        pipeline(false, false).invoke(&mut ctx).await.unwrap();

        // B returned without calling next: T never runs and B has no after-step.
        assert_eq!(ctx.entries(), vec!["A-before", "B-before", "A-after"]);
    }

    #[tokio::test]
    async fn failure_propagates_after_post_next_logic_runs() {
        let mut ctx = TestContext::new();
        let err = pipeline(true, true).invoke(&mut ctx).await.unwrap_err();

        assert!(matches!(err, PipelineError::Handler(_)));
        assert_eq!(
            ctx.entries(),
            vec!["A-before", "B-before", "T", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_the_first_step() {
        let mut ctx = TestContext::new();
        ctx.cancellation.cancel();

        let err = pipeline(true, false).invoke(&mut ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(ctx.entries().is_empty());
    }

    struct CancelThenContinue;

    #[async_trait]
    impl Behavior<TestContext> for CancelThenContinue {
        async fn invoke(
            &self,
            context: &mut TestContext,
            next: Next<'_, TestContext>,
        ) -> Result<(), PipelineError> {
            context.log.lock().push("cancel".to_string());
            next.cancellation().cancel();
            next.run(context).await
        }
    }

    #[tokio::test]
    async fn cancellation_mid_chain_skips_pending_steps() {
        let pipeline = Pipeline::builder("cancel")
            .register(CancelThenContinue)
            .register(Recording {
                name: "B",
                call_next: true,
            })
            .terminate_with(RecordingTerminator { fail: false });

        let mut ctx = TestContext::new();
        let err = pipeline.invoke(&mut ctx).await.unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(ctx.entries(), vec!["cancel"]);
    }

    #[test]
    fn behavior_names_follow_registration_order() {
        let names = pipeline(true, false).behavior_names();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n.ends_with("Recording")));
    }
}
