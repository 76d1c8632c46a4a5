use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kestrel_cql::frame::response::error::DbError;
use rand::Rng;
use tokio::sync::mpsc;

use crate::frame::{RequestFrame, RequestOpcode, ResponseFrame};

/// Specifies when an associated `Reaction` will be performed.
/// Conditions are subject to logic, with `not()`, `and()` and `or()`
/// convenience functions.
#[derive(Debug, Clone)]
pub enum Condition {
    True,

    False,

    Not(Box<Condition>),

    And(Box<Condition>, Box<Condition>),

    Or(Box<Condition>, Box<Condition>),

    /// True iff the frame has come in the n-th driver connection established with the node.
    ConnectionSeqNo(usize),

    /// True iff the frame has the given opcode.
    RequestOpcode(RequestOpcode),

    /// True iff the frame body contains the given byte slice, with case-sensitive comparison.
    BodyContainsCaseSensitive(Box<[u8]>),

    /// True iff the frame body contains the given byte slice, with case-insensitive comparison (ASCII only).
    BodyContainsCaseInsensitive(Box<[u8]>),

    /// True with the given probability.
    RandomWithProbability(f64),

    /// True for the first `n` evaluations, false afterwards.
    TrueForLimitedTimes(usize),

    /// True iff the connection has sent a REGISTER.
    ConnectionRegisteredAnyEvent,
}

/// The context in which [`Conditions`](Condition) are evaluated.
pub(crate) struct EvaluationContext {
    pub(crate) connection_seq_no: usize,
    pub(crate) opcode: RequestOpcode,
    pub(crate) frame_body: Bytes,
    pub(crate) connection_has_events: bool,
}

impl Condition {
    pub(crate) fn eval(&mut self, ctx: &EvaluationContext) -> bool {
        match self {
            Condition::True => true,

            Condition::False => false,

            Condition::Not(c) => !c.eval(ctx),

            Condition::And(c1, c2) => c1.eval(ctx) && c2.eval(ctx),

            Condition::Or(c1, c2) => c1.eval(ctx) || c2.eval(ctx),

            Condition::ConnectionSeqNo(no) => *no == ctx.connection_seq_no,

            Condition::RequestOpcode(op) => *op == ctx.opcode,

            Condition::BodyContainsCaseSensitive(pattern) => ctx
                .frame_body
                .windows(pattern.len())
                .any(|window| *window == **pattern),

            Condition::BodyContainsCaseInsensitive(pattern) => std::str::from_utf8(pattern)
                .map(|pattern_str| {
                    ctx.frame_body.windows(pattern.len()).any(|window| {
                        std::str::from_utf8(window)
                            .map(|window_str| str::eq_ignore_ascii_case(window_str, pattern_str))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false),

            Condition::RandomWithProbability(probability) => rand::rng().random_bool(*probability),

            Condition::TrueForLimitedTimes(times) => {
                let val = *times > 0;
                if val {
                    *times -= 1;
                }
                val
            }

            Condition::ConnectionRegisteredAnyEvent => ctx.connection_has_events,
        }
    }

    /// A convenience function for creating [Condition::Not] variant.
    #[allow(clippy::should_implement_trait)]
    pub fn not(c: Self) -> Self {
        Condition::Not(Box::new(c))
    }

    /// A convenience function for creating [Condition::And] variant.
    pub fn and(self, c2: Self) -> Self {
        Self::And(Box::new(self), Box::new(c2))
    }

    /// A convenience function for creating [Condition::Or] variant.
    pub fn or(self, c2: Self) -> Self {
        Self::Or(Box::new(self), Box::new(c2))
    }

    /// Matches QUERY frames whose text contains `needle`.
    pub fn query_contains(needle: &str) -> Self {
        Condition::RequestOpcode(RequestOpcode::Query)
            .and(Condition::BodyContainsCaseSensitive(needle.as_bytes().into()))
    }
}

pub type FrameProcessor = Arc<dyn Fn(RequestFrame) -> ResponseFrame + Send + Sync>;

/// Describes how to forge a response to the given request and after what delay.
#[derive(Clone)]
pub struct Action {
    pub delay: Option<Duration>,
    pub msg_processor: Option<FrameProcessor>,
}

/// What the node does with a request matched by a rule.
///
/// With `answer_normally` unset and no `to_sender`, the request is swallowed:
/// the driver never gets an answer on that stream.
#[derive(Clone, Default)]
pub struct RequestReaction {
    /// Let the node's built-in behaviour answer the request.
    pub answer_normally: bool,
    pub to_sender: Option<Action>,
    pub drop_connection: Option<Option<Duration>>,
    pub feedback_channel: Option<mpsc::UnboundedSender<RequestFrame>>,
}

impl std::fmt::Debug for RequestReaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestReaction")
            .field("answer_normally", &self.answer_normally)
            .field("forges_response", &self.to_sender.is_some())
            .field("drop_connection", &self.drop_connection)
            .field("has_feedback_channel", &self.feedback_channel.is_some())
            .finish()
    }
}

/// Convenience constructors and modifiers for reactions.
pub trait Reaction: Sized {
    /// Does nothing: the request is answered by the node's built-in behaviour.
    fn noop() -> Self;

    /// Swallows the request without answering.
    fn drop_frame() -> Self;

    /// Answers with the given error.
    fn forge_with_error(error: DbError) -> Self;

    /// Answers with the given error after `delay`.
    fn forge_with_error_delayed(error: DbError, delay: Duration) -> Self;

    /// Answers with whatever `processor` builds from the request.
    fn forge_response(processor: FrameProcessor) -> Self;

    /// Closes the connection, optionally after a delay.
    fn drop_connection() -> Self;

    /// Delays the forged answer.
    fn with_delay(self, delay: Duration) -> Self;

    /// Sends every matched request to `tx`, in addition to reacting.
    fn with_feedback_when_performed(self, tx: mpsc::UnboundedSender<RequestFrame>) -> Self;
}

fn forge_error_processor(error: DbError) -> FrameProcessor {
    Arc::new(move |request: RequestFrame| {
        // Error bodies are a handful of bytes, far below any length limit.
        ResponseFrame::forged_error(request.params, error.clone(), None)
            .unwrap_or_else(|_| ResponseFrame::forged_ready(request.params))
    })
}

impl Reaction for RequestReaction {
    fn noop() -> Self {
        RequestReaction {
            answer_normally: true,
            to_sender: None,
            drop_connection: None,
            feedback_channel: None,
        }
    }

    fn drop_frame() -> Self {
        RequestReaction::default()
    }

    fn forge_with_error(error: DbError) -> Self {
        RequestReaction {
            to_sender: Some(Action {
                delay: None,
                msg_processor: Some(forge_error_processor(error)),
            }),
            ..RequestReaction::default()
        }
    }

    fn forge_with_error_delayed(error: DbError, delay: Duration) -> Self {
        RequestReaction::forge_with_error(error).with_delay(delay)
    }

    fn forge_response(processor: FrameProcessor) -> Self {
        RequestReaction {
            to_sender: Some(Action {
                delay: None,
                msg_processor: Some(processor),
            }),
            ..RequestReaction::default()
        }
    }

    fn drop_connection() -> Self {
        RequestReaction {
            drop_connection: Some(None),
            ..RequestReaction::default()
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        if let Some(action) = self.to_sender.as_mut() {
            action.delay = Some(delay);
        }
        if let Some(drop) = self.drop_connection.as_mut() {
            *drop = Some(delay);
        }
        self
    }

    fn with_feedback_when_performed(mut self, tx: mpsc::UnboundedSender<RequestFrame>) -> Self {
        self.feedback_channel = Some(tx);
        self
    }
}

/// A rule describing what the node should do with a received request frame
/// and on what conditions.
///
/// Rules are checked in order; only the first matching rule is applied.
/// A frame no rule matches is answered by the node's built-in behaviour.
#[derive(Clone, Debug)]
pub struct RequestRule(pub Condition, pub RequestReaction);

impl RequestRule {
    /// A rule that only records matched requests and lets the node answer them.
    pub fn observe(condition: Condition, tx: mpsc::UnboundedSender<RequestFrame>) -> Self {
        RequestRule(
            condition,
            RequestReaction::noop().with_feedback_when_performed(tx),
        )
    }
}

/// A few errors a test may want to inject, one per retry-relevant category.
pub mod example_db_errors {
    use kestrel_cql::frame::response::error::{DbError, WriteType};
    use kestrel_cql::Consistency;

    pub fn overloaded() -> DbError {
        DbError::Overloaded
    }

    pub fn is_bootstrapping() -> DbError {
        DbError::IsBootstrapping
    }

    pub fn server_error() -> DbError {
        DbError::ServerError
    }

    pub fn syntax_error() -> DbError {
        DbError::SyntaxError
    }

    pub fn unavailable() -> DbError {
        DbError::Unavailable {
            consistency: Consistency::Quorum,
            required: 2,
            alive: 1,
        }
    }

    pub fn read_timeout() -> DbError {
        DbError::ReadTimeout {
            consistency: Consistency::Quorum,
            received: 1,
            required: 2,
            data_present: false,
        }
    }

    pub fn write_timeout() -> DbError {
        DbError::WriteTimeout {
            consistency: Consistency::Quorum,
            received: 1,
            required: 2,
            write_type: WriteType::Simple,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(opcode: RequestOpcode, body: &'static [u8]) -> EvaluationContext {
        EvaluationContext {
            connection_seq_no: 0,
            opcode,
            frame_body: Bytes::from_static(body),
            connection_has_events: false,
        }
    }

    #[test]
    fn condition_case_insensitive_matching() {
        let mut condition_matching =
            Condition::BodyContainsCaseInsensitive(Box::new(*b"cassandra'sInefficiency"));
        let mut condition_nonmatching =
            Condition::BodyContainsCaseInsensitive(Box::new(*b"cassandrasInefficiency"));
        let ctx = ctx(
            RequestOpcode::Query,
            b"Cassandra'sINEFFICIENCY is only a consequence of its design",
        );

        assert!(condition_matching.eval(&ctx));
        assert!(!condition_nonmatching.eval(&ctx));
    }

    #[test]
    fn true_for_limited_times_counts_down() {
        let mut condition = Condition::TrueForLimitedTimes(2);
        let ctx = ctx(RequestOpcode::Query, b"");
        assert!(condition.eval(&ctx));
        assert!(condition.eval(&ctx));
        assert!(!condition.eval(&ctx));
    }

    #[test]
    fn query_contains_requires_query_opcode() {
        let mut condition = Condition::query_contains("ks.t");
        assert!(condition.eval(&ctx(RequestOpcode::Query, b"...SELECT * FROM ks.t")));
        assert!(!condition.eval(&ctx(RequestOpcode::Startup, b"ks.t")));
    }
}
