//! Bisection geometry over the steps of an execution timeline.

use ethereum_types::{H256, U256};
use keccak_hash::keccak;
use rollup_common::BISECTION_DEGREE;

use super::BisectionError;

/// A half-open range of timeline steps, `[start, start + length)`.
///
/// A segment of length `L` spans `L` transitions and therefore `L + 1`
/// states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Segment {
    pub start: u64,
    pub length: u64,
}

impl Segment {
    pub const fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    pub const fn end(&self) -> u64 {
        self.start + self.length
    }

    pub const fn is_one_step(&self) -> bool {
        self.length == 1
    }

    /// The two halves of this segment. The first takes the odd step.
    pub fn split(&self) -> [Segment; 2] {
        let first = self.length / 2 + self.length % 2;
        [
            Segment::new(self.start, first),
            Segment::new(self.start + first, self.length - first),
        ]
    }

    /// The states a bisection into `parts` sub-segments publishes hashes
    /// for. A single part is the segment's two endpoints.
    pub fn points(&self, parts: usize) -> Result<Vec<u64>, BisectionError> {
        match parts {
            1 => Ok(vec![self.start, self.end()]),
            2 => {
                let [first, _] = self.split();
                Ok(vec![self.start, first.end(), self.end()])
            }
            _ => Err(BisectionError::MalformedBisection {
                segment: *self,
                points: parts + 1,
            }),
        }
    }

    /// Sub-segment `index` (1-based) of a bisection into `parts`.
    pub fn sub_segment(&self, parts: usize, index: usize) -> Result<Segment, BisectionError> {
        let points = self.points(parts)?;
        let bounds = index
            .checked_sub(1)
            .and_then(|first| Some((*points.get(first)?, *points.get(index)?)));
        match bounds {
            Some((start, end)) if end > start => Ok(Segment::new(start, end - start)),
            _ => Err(BisectionError::MalformedBisection {
                segment: *self,
                points: parts + 1,
            }),
        }
    }
}

/// `keccak256(abi.encodePacked(start, length, bisection))`, the digest the
/// challenge contract stores for the current bisection.
pub fn challenge_state(segment: Segment, bisection: &[H256]) -> H256 {
    let mut preimage = Vec::with_capacity(64 + 32 * bisection.len());
    let mut word = [0u8; 32];
    U256::from(segment.start).to_big_endian(&mut word);
    preimage.extend_from_slice(&word);
    U256::from(segment.length).to_big_endian(&mut word);
    preimage.extend_from_slice(&word);
    for hash in bisection {
        preimage.extend_from_slice(hash.as_bytes());
    }
    keccak(preimage)
}

/// What we submit when it is our turn to respond to a posted bisection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Move {
    /// Narrow the dispute to `challenged_segment_index` and publish our own
    /// hashes over it.
    Bisect {
        bisection: Vec<H256>,
        challenged_segment_index: u64,
        segment: Segment,
    },
    /// The disputed sub-segment is a single transition from `step`.
    OneStepProof {
        step: u64,
        challenged_step_index: u64,
    },
}

/// Picks the sub-segment of `posted` (a bisection of `segment`) ending at
/// the first hash we disagree with, and our move on it.
///
/// `hash_at` looks up our own hash for a timeline step.
pub fn respond(
    segment: Segment,
    posted: &[H256],
    hash_at: impl Fn(u64) -> Option<H256>,
) -> Result<Move, BisectionError> {
    let parts = posted.len().saturating_sub(1);
    if parts == 0 || parts as u64 > BISECTION_DEGREE {
        return Err(BisectionError::MalformedBisection {
            segment,
            points: posted.len(),
        });
    }

    let points = segment.points(parts)?;
    let ours = points
        .iter()
        .map(|&step| hash_at(step).ok_or(BisectionError::OutsideTimeline { step }))
        .collect::<Result<Vec<_>, _>>()?;

    if ours[0] != posted[0] {
        return Err(BisectionError::StartDisagreement { segment });
    }
    let diverged = ours
        .iter()
        .zip(posted)
        .position(|(ours, theirs)| ours != theirs)
        .ok_or(BisectionError::NoDisagreement { segment })?;

    let disputed = segment.sub_segment(parts, diverged)?;
    if disputed.is_one_step() {
        return Ok(Move::OneStepProof {
            step: disputed.start,
            challenged_step_index: diverged as u64,
        });
    }

    let bisection = disputed
        .points(BISECTION_DEGREE as usize)?
        .into_iter()
        .map(|step| hash_at(step).ok_or(BisectionError::OutsideTimeline { step }))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Move::Bisect {
        bisection,
        challenged_segment_index: diverged as u64,
        segment: disputed,
    })
}
