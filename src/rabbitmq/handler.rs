use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::errors::HandlerError;
use crate::message::{Acknowledgement, Message};

/// Business logic bound to a subscription.
///
/// Returning `Err` is a failed attempt; the coordinator decides between
/// requeue and dead-letter from the error kind and the attempt number.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> Result<Acknowledgement, HandlerError>;
}

pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Acknowledgement, HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> Result<Acknowledgement, HandlerError> {
        (self.f)(message.clone()).await
    }
}

/// Wraps an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Acknowledgement, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
