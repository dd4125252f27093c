//! Structural matching over reply vectors.
//!
//! The upload FSM consumes whole reply vectors and cares about their exact
//! shape: "a read header, then the challenge, then OK". These helpers turn a
//! `Vec<Reply>` into a typed tuple when the shape matches, and `None`
//! otherwise — shape mismatches are ordinary soft failures, not panics.

use super::reply::{
    BearerParams, GprsStatus, HttpActionDone, HttpReadHeader, PositionTime, Reply, ResetChallenge,
    ResetFailure, ResetSuccess,
};

/// A payload that can be pulled out of exactly one [`Reply`] variant.
pub trait FromReply: Sized {
    fn from_reply(reply: Reply) -> Option<Self>;
}

/// Marker for the `OK` terminator in an extraction pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Okay;

impl FromReply for Okay {
    fn from_reply(reply: Reply) -> Option<Self> {
        matches!(reply, Reply::Ok).then_some(Okay)
    }
}

macro_rules! impl_from_reply {
    ($($payload:ident),+ $(,)?) => {
        $(
            impl FromReply for $payload {
                fn from_reply(reply: Reply) -> Option<Self> {
                    match reply {
                        Reply::$payload(inner) => Some(inner),
                        _ => None,
                    }
                }
            }
        )+
    };
}

impl_from_reply!(
    BearerParams,
    GprsStatus,
    PositionTime,
    HttpActionDone,
    HttpReadHeader,
    ResetChallenge,
    ResetFailure,
    ResetSuccess,
);

/// A tuple of payloads extractable from a reply vector of the same length.
pub trait ReplyTuple: Sized {
    fn extract(replies: Vec<Reply>) -> Option<Self>;
}

macro_rules! impl_reply_tuple {
    ($len:expr; $($t:ident),+) => {
        impl<$($t: FromReply),+> ReplyTuple for ($($t,)+) {
            fn extract(replies: Vec<Reply>) -> Option<Self> {
                if replies.len() != $len {
                    return None;
                }
                let mut iter = replies.into_iter();
                Some(($( $t::from_reply(iter.next()?)?, )+))
            }
        }
    };
}

impl_reply_tuple!(1; A);
impl_reply_tuple!(2; A, B);
impl_reply_tuple!(3; A, B, C);
impl_reply_tuple!(4; A, B, C, D);

/// Match a reply vector against an exact sequence of payload types.
pub fn extract_replies<T: ReplyTuple>(replies: Vec<Reply>) -> Option<T> {
    T::extract(replies)
}

/// Shortcut for the common `[payload, OK]` transaction shape.
pub fn extract_single<T: FromReply>(replies: Vec<Reply>) -> Option<T> {
    let (payload, Okay) = extract_replies::<(T, Okay)>(replies)?;
    Some(payload)
}
