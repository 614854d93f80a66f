//! The interactive bisection game played over an open challenge.
//!
//! [`machine`] holds the pure protocol state machine, [`segment`] the
//! geometry of a bisection, [`session`] drives one challenge against the
//! chain and [`client`] watches the rollup for challenges naming us.

pub mod client;
pub mod machine;
pub mod segment;
pub mod session;

use std::fmt;

use ethereum_types::H256;
use state_proof::ProofError;
use thiserror::Error;

pub use self::client::BisectionClient;
pub use self::machine::{BisectionState, Outcome};
pub use self::segment::Segment;
pub use self::session::ChallengeSession;

/// Which side of a challenge we are on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Our assertion is the one being challenged.
    Defender,
    Challenger,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Defender => "defender",
            Side::Challenger => "challenger",
        })
    }
}

#[derive(Debug, Error)]
pub enum BisectionError {
    #[error("a bisection of {segment:?} cannot have {points} points")]
    MalformedBisection { segment: Segment, points: usize },
    #[error("step {step} is outside the local timeline")]
    OutsideTimeline { step: u64 },
    #[error("opponent disputes the agreed start state of {segment:?}")]
    StartDisagreement { segment: Segment },
    #[error("opponent's bisection of {segment:?} agrees with ours everywhere")]
    NoDisagreement { segment: Segment },
    #[error("no recoverable bisection of {segment:?} hashes to challenge state {expected:?}")]
    UnknownBisection { segment: Segment, expected: H256 },
    #[error(transparent)]
    Proof(#[from] ProofError),
    #[error("submitting `{call}` failed: {source:#}")]
    Submission {
        call: &'static str,
        source: anyhow::Error,
    },
    #[error(transparent)]
    Chain(#[from] anyhow::Error),
}

impl BisectionError {
    /// Whether the local view can no longer be trusted to play the game.
    ///
    /// Protocol divergence and liveness failures are not fatal: a lost race
    /// or a dropped submission is retried on the next head.
    pub fn is_fatal(&self) -> bool {
        match self {
            BisectionError::MalformedBisection { .. }
            | BisectionError::OutsideTimeline { .. }
            | BisectionError::StartDisagreement { .. }
            | BisectionError::UnknownBisection { .. } => true,
            BisectionError::Proof(e) => e.is_fatal(),
            BisectionError::NoDisagreement { .. }
            | BisectionError::Submission { .. }
            | BisectionError::Chain(_) => false,
        }
    }
}
