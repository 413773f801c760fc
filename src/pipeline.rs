//! Ordered before/after middleware run around every handler invocation.

use async_trait::async_trait;

use crate::{context::Context, error::Error};

/// The result of a handler invocation, threaded through the After chain so
/// middleware can observe both a success payload and an error at once and
/// choose which survives.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The handler (or a prior middleware) produced a payload.
    Success(Vec<u8>),
    /// The handler (or a prior middleware) produced an error.
    Failure(Error),
}

impl Outcome {
    /// Converts into a `Result`, consuming the outcome.
    #[must_use]
    pub fn into_result(self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Success(bytes) => Ok(bytes),
            Self::Failure(err) => Err(err),
        }
    }
}

/// Runs before the handler; may short-circuit the chain (and the handler
/// itself) by returning an error, but the After chain still runs.
#[async_trait]
pub trait BeforeMiddleware: Send + Sync {
    /// Inspects or rewrites the inbound payload.
    ///
    /// # Errors
    ///
    /// Returning an error skips the handler and every remaining Before
    /// middleware, but the After chain still observes it.
    async fn call(&self, ctx: &mut Context, input: Vec<u8>) -> Result<Vec<u8>, Error>;
}

/// Runs after the handler (or after a Before short-circuit); always runs,
/// and may rewrite the final error's code.
#[async_trait]
pub trait AfterMiddleware: Send + Sync {
    /// Inspects or rewrites the handler's outcome.
    async fn call(&self, ctx: &Context, outcome: Outcome) -> Outcome;
}

/// An ordered Before/After middleware chain.
#[derive(Default)]
pub struct Pipeline {
    before: Vec<Box<dyn BeforeMiddleware>>,
    after: Vec<Box<dyn AfterMiddleware>>,
}

impl Pipeline {
    /// Builds an empty pipeline.
    #[must_use]
    pub fn new() -> Self { Self { before: Vec::new(), after: Vec::new() } }

    /// Appends a Before middleware, run in registration order.
    #[must_use]
    pub fn with_before(mut self, middleware: impl BeforeMiddleware + 'static) -> Self {
        self.before.push(Box::new(middleware));
        self
    }

    /// Appends an After middleware, run in registration order.
    #[must_use]
    pub fn with_after(mut self, middleware: impl AfterMiddleware + 'static) -> Self {
        self.after.push(Box::new(middleware));
        self
    }

    /// Runs the Before chain, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by any Before middleware.
    pub async fn run_before(&self, ctx: &mut Context, mut input: Vec<u8>) -> Result<Vec<u8>, Error> {
        for middleware in &self.before {
            input = middleware.call(ctx, input).await?;
        }
        Ok(input)
    }

    /// Runs the After chain unconditionally, letting each middleware
    /// observe and potentially replace the running [`Outcome`].
    pub async fn run_after(&self, ctx: &Context, outcome: Outcome) -> Outcome {
        let mut outcome = outcome;
        for middleware in &self.after {
            outcome = middleware.call(ctx, outcome).await;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::session::Session;

    struct Uppercase;

    #[async_trait]
    impl BeforeMiddleware for Uppercase {
        async fn call(&self, _ctx: &mut Context, input: Vec<u8>) -> Result<Vec<u8>, Error> {
            Ok(input.to_ascii_uppercase())
        }
    }

    struct RejectEmpty;

    #[async_trait]
    impl BeforeMiddleware for RejectEmpty {
        async fn call(&self, _ctx: &mut Context, input: Vec<u8>) -> Result<Vec<u8>, Error> {
            if input.is_empty() {
                Err(Error::bad_request("empty payload"))
            } else {
                Ok(input)
            }
        }
    }

    struct RecordRan(std::sync::Arc<std::sync::atomic::AtomicBool>);

    #[async_trait]
    impl AfterMiddleware for RecordRan {
        async fn call(&self, _ctx: &Context, outcome: Outcome) -> Outcome {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            outcome
        }
    }

    fn ctx() -> Context { Context::new("svc.method", 1, Arc::new(Session::new(1))) }

    #[tokio::test]
    async fn before_chain_transforms_input_in_order() {
        let pipeline = Pipeline::new().with_before(Uppercase);
        let mut ctx = ctx();
        let out = pipeline.run_before(&mut ctx, b"hi".to_vec()).await.expect("no error");
        assert_eq!(out, b"HI");
    }

    #[tokio::test]
    async fn before_error_short_circuits() {
        let pipeline = Pipeline::new().with_before(RejectEmpty).with_before(Uppercase);
        let mut ctx = ctx();
        let err = pipeline
            .run_before(&mut ctx, Vec::new())
            .await
            .expect_err("empty input should be rejected");
        assert_eq!(err.code, crate::error::CODE_BAD_REQUEST);
    }

    #[tokio::test]
    async fn after_chain_always_runs_even_on_failure() {
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let pipeline = Pipeline::new().with_after(RecordRan(ran.clone()));
        let ctx = ctx();
        let outcome = pipeline
            .run_after(&ctx, Outcome::Failure(Error::internal("boom")))
            .await;
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(matches!(outcome, Outcome::Failure(_)));
    }
}
