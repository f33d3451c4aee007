//! 验证流水线 / Validation pipeline
//!
//! 作用于订阅输出的流过滤阶段。每个被丢弃的信封都会被确认，
//! 因此被拒绝的消息不会阻塞或污染队列。
//! Stream stages applied to a subscription's output. Every envelope a stage
//! drops is acknowledged first, so a rejected message never blocks its queue.

use std::pin::Pin;

use log::{debug, error, warn};
use serde_json::Value;
use tokio_stream::{Stream, StreamExt};

use super::envelope::Envelope;
use super::error::BusError;
use super::schema::Schema;

pub type EnvelopeStream<T = Value> = Pin<Box<dyn Stream<Item = Envelope<T>> + Send>>;

/// 通用信封流阶段 / Stages available on any envelope stream.
pub trait EnvelopeStreamExt<T>: Stream<Item = Envelope<T>> + Send + Sized + 'static
where
    T: Send + 'static,
{
    /// 谓词过滤：不满足的信封被确认并丢弃
    ///
    /// Pass through envelopes whose payload satisfies `predicate`; acknowledge
    /// and drop the rest. Filtering is not an error. Envelopes whose body
    /// failed to decode pass through untouched, so a later schema stage can
    /// classify them.
    fn filter_acked<P>(self, mut predicate: P) -> EnvelopeStream<T>
    where
        P: FnMut(&T) -> bool + Send + 'static,
    {
        let mut source = Box::pin(self);
        Box::pin(async_stream::stream! {
            while let Some(envelope) = source.next().await {
                if envelope.decode_error().is_some() || predicate(&envelope.data) {
                    yield envelope;
                    continue;
                }
                debug!(
                    "过滤并确认 {} 标签 {} / Filtered out and acked {} tag {}",
                    envelope.queue, envelope.delivery_tag(), envelope.queue, envelope.delivery_tag()
                );
                if let Err(e) = envelope.ack().await {
                    warn!("过滤确认失败: {} / Ack of filtered envelope failed: {}", e, e);
                }
            }
        })
    }
}

impl<S, T> EnvelopeStreamExt<T> for S
where
    S: Stream<Item = Envelope<T>> + Send + 'static,
    T: Send + 'static,
{
}

/// 模式验证阶段 / Schema validation stages on raw envelope streams.
pub trait ValidateStreamExt: Stream<Item = Envelope<Value>> + Send + Sized + 'static {
    /// 模式过滤，失败时确认并交给同步处理函数
    ///
    /// Validate each payload against `schema`. Valid envelopes pass through
    /// carrying the validated value. An invalid envelope is acknowledged and
    /// then handed to `on_invalid` together with the error; it never reaches
    /// the output.
    fn validate<S, H>(self, schema: S, mut on_invalid: H) -> EnvelopeStream<S::Output>
    where
        S: Schema,
        H: FnMut(BusError, Envelope<Value>) + Send + 'static,
    {
        let mut source = Box::pin(self);
        Box::pin(async_stream::stream! {
            while let Some(envelope) = source.next().await {
                match check(&schema, &envelope) {
                    Ok(data) => {
                        yield envelope.with_data(data);
                    }
                    Err(err) => {
                        warn!(
                            "验证失败 {}/{}: {} / Validation failed {}/{}: {}",
                            envelope.exchange, envelope.routing_key, err, envelope.exchange, envelope.routing_key, err
                        );
                        if let Err(e) = envelope.acker().ack().await {
                            warn!("确认无效信封失败: {} / Ack of invalid envelope failed: {}", e, e);
                        }
                        on_invalid(err, envelope);
                    }
                }
            }
        })
    }

    /// 模式过滤，失败时转发到错误队列
    ///
    /// Validate each payload against `schema`; an invalid envelope is
    /// dead-lettered through [`Envelope::forward_error`], which records its
    /// provenance on the error queue and acknowledges it.
    fn validate_or_dead_letter<S>(self, schema: S) -> EnvelopeStream<S::Output>
    where
        S: Schema,
    {
        let mut source = Box::pin(self);
        Box::pin(async_stream::stream! {
            while let Some(envelope) = source.next().await {
                match check(&schema, &envelope) {
                    Ok(data) => {
                        yield envelope.with_data(data);
                    }
                    Err(err) => {
                        warn!(
                            "验证失败，转发到错误队列 {}/{}: {} / Validation failed, dead-lettering {}/{}: {}",
                            envelope.exchange, envelope.routing_key, err, envelope.exchange, envelope.routing_key, err
                        );
                        if let Err(e) = envelope.forward_error(&err).await {
                            error!("死信转发失败: {} / Dead-lettering failed: {}", e, e);
                        }
                    }
                }
            }
        })
    }
}

impl<St> ValidateStreamExt for St where St: Stream<Item = Envelope<Value>> + Send + 'static {}

fn check<S: Schema>(schema: &S, envelope: &Envelope<Value>) -> Result<S::Output, BusError> {
    if let Some(err) = envelope.decode_error() {
        return Err(err.clone());
    }
    schema.validate(&envelope.data).map_err(BusError::from)
}
