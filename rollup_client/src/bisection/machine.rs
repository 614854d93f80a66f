//! The per-challenge protocol state machine.
//!
//! Nothing here talks to the chain. [`BisectionState::on`] consumes one
//! [`Input`] and returns the next state together with the [`Action`] the
//! driver must perform, if any.

use ethereum_types::{Address, H256};

use super::{Segment, Side};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BisectionState {
    #[default]
    Idle,
    ChallengeOpened(Opened),
    AwaitingOurTurn(OurTurn),
    AwaitingOpponentTurn(OpponentTurn),
    Resolved(Outcome),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Opened {
    pub side: Side,
    pub num_steps: u64,
    /// The defender's `initializeChallengeLength` did not go through and is
    /// resent on the next head.
    pub retry_initialization: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OurTurn {
    /// The segment the opponent's bisection covers.
    pub segment: Segment,
    pub posted: Vec<H256>,
    /// Our response did not go through and is resent on the next head.
    pub retry: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpponentTurn {
    /// Last L1 block the opponent may respond in.
    pub deadline: u64,
    pub timeout_sent: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub winner: Address,
    pub loser: Address,
    pub reason: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    Opened {
        side: Side,
        num_steps: u64,
    },
    Bisected {
        segment: Segment,
        posted: Vec<H256>,
        block_number: u64,
        our_turn: bool,
        /// Blocks the current responder has left.
        time_left: u64,
    },
    NewHead(u64),
    /// The last submitted [`Action`] failed.
    SubmissionFailed,
    Completed(Outcome),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    InitializeChallengeLength(u64),
    /// Answer the opponent's bisection of `segment`.
    Respond {
        segment: Segment,
        posted: Vec<H256>,
    },
    Timeout,
}

impl BisectionState {
    pub fn on(self, input: Input) -> (Self, Option<Action>) {
        use BisectionState::*;

        match (self, input) {
            (Resolved(outcome), _) => (Resolved(outcome), None),
            (_, Input::Completed(outcome)) => (Resolved(outcome), None),

            (Idle, Input::Opened { side, num_steps }) => {
                let action =
                    (side == Side::Defender).then_some(Action::InitializeChallengeLength(num_steps));
                let opened = Opened {
                    side,
                    num_steps,
                    retry_initialization: false,
                };
                (ChallengeOpened(opened), action)
            }

            (Idle, _) => (Idle, None),

            (
                _,
                Input::Bisected {
                    segment,
                    posted,
                    our_turn: true,
                    ..
                },
            ) => {
                let action = Action::Respond {
                    segment,
                    posted: posted.clone(),
                };
                let turn = OurTurn {
                    segment,
                    posted,
                    retry: false,
                };
                (AwaitingOurTurn(turn), Some(action))
            }
            (
                _,
                Input::Bisected {
                    block_number,
                    our_turn: false,
                    time_left,
                    ..
                },
            ) => {
                let turn = OpponentTurn {
                    deadline: block_number.saturating_add(time_left),
                    timeout_sent: false,
                };
                (AwaitingOpponentTurn(turn), None)
            }

            (ChallengeOpened(mut opened), Input::SubmissionFailed) => {
                opened.retry_initialization = opened.side == Side::Defender;
                (ChallengeOpened(opened), None)
            }
            (ChallengeOpened(mut opened), Input::NewHead(_)) if opened.retry_initialization => {
                opened.retry_initialization = false;
                let action = Action::InitializeChallengeLength(opened.num_steps);
                (ChallengeOpened(opened), Some(action))
            }

            (AwaitingOurTurn(mut turn), Input::SubmissionFailed) => {
                turn.retry = true;
                (AwaitingOurTurn(turn), None)
            }
            (AwaitingOurTurn(mut turn), Input::NewHead(_)) if turn.retry => {
                turn.retry = false;
                let action = Action::Respond {
                    segment: turn.segment,
                    posted: turn.posted.clone(),
                };
                (AwaitingOurTurn(turn), Some(action))
            }

            (AwaitingOpponentTurn(mut turn), Input::SubmissionFailed) => {
                turn.timeout_sent = false;
                (AwaitingOpponentTurn(turn), None)
            }
            (AwaitingOpponentTurn(mut turn), Input::NewHead(head))
                if head > turn.deadline && !turn.timeout_sent =>
            {
                turn.timeout_sent = true;
                (AwaitingOpponentTurn(turn), Some(Action::Timeout))
            }

            (state, _) => (state, None),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, BisectionState::Resolved(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            BisectionState::Idle => "idle",
            BisectionState::ChallengeOpened(_) => "challenge opened",
            BisectionState::AwaitingOurTurn(_) => "awaiting our turn",
            BisectionState::AwaitingOpponentTurn(_) => "awaiting opponent turn",
            BisectionState::Resolved(_) => "resolved",
        }
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::*;

    fn bisected(block_number: u64, our_turn: bool, time_left: u64) -> Input {
        Input::Bisected {
            segment: Segment::new(0, 8),
            posted: vec![H256::repeat_byte(1), H256::repeat_byte(2)],
            block_number,
            our_turn,
            time_left,
        }
    }

    fn run(inputs: impl IntoIterator<Item = Input>) -> (BisectionState, Vec<Action>) {
        let mut state = BisectionState::Idle;
        let mut actions = Vec::new();
        for input in inputs {
            let (next, action) = state.on(input);
            state = next;
            actions.extend(action);
        }
        (state, actions)
    }

    fn opened(side: Side) -> Input {
        Input::Opened { side, num_steps: 8 }
    }

    #[test]
    fn only_the_defender_initializes() {
        let (state, actions) = run([opened(Side::Defender)]);
        check!(state.name() == "challenge opened");
        check!(actions == [Action::InitializeChallengeLength(8)]);

        let (_, actions) = run([opened(Side::Challenger)]);
        check!(actions.is_empty());
    }

    #[test]
    fn failed_initialization_is_resent_once() {
        let (_, actions) = run([
            opened(Side::Defender),
            Input::NewHead(10),
            Input::SubmissionFailed,
            Input::NewHead(11),
            Input::NewHead(12),
        ]);
        check!(actions == [Action::InitializeChallengeLength(8), Action::InitializeChallengeLength(8)]);
    }

    #[test]
    fn timeout_is_claimed_exactly_once() {
        let (state, actions) = run([
            opened(Side::Challenger),
            bisected(100, false, 0),
            Input::NewHead(100),
            Input::NewHead(101),
            Input::NewHead(102),
        ]);
        check!(actions == [Action::Timeout]);
        let_assert!(BisectionState::AwaitingOpponentTurn(turn) = state);
        check!(turn.deadline == 100);
        check!(turn.timeout_sent);
    }

    #[test]
    fn a_lost_timeout_race_is_retried() {
        let (_, actions) = run([
            opened(Side::Challenger),
            bisected(100, false, 5),
            Input::NewHead(105),
            Input::NewHead(106),
            Input::SubmissionFailed,
            Input::NewHead(107),
        ]);
        check!(actions == [Action::Timeout, Action::Timeout]);
    }

    #[test]
    fn our_turn_responds_and_retries_failures() {
        let (state, actions) = run([
            opened(Side::Challenger),
            bisected(100, true, 50),
            Input::NewHead(101),
            Input::SubmissionFailed,
            Input::NewHead(102),
        ]);
        check!(actions.len() == 2);
        check!(actions.iter().all(|action| matches!(action, Action::Respond { .. })));
        check!(state.name() == "awaiting our turn");
    }

    #[test]
    fn the_opponent_answering_cancels_a_pending_timeout() {
        let (state, actions) = run([
            opened(Side::Defender),
            bisected(100, false, 10),
            bisected(105, true, 10),
            Input::NewHead(200),
        ]);
        check!(actions.len() == 2);
        check!(!actions.contains(&Action::Timeout));
        let_assert!(BisectionState::AwaitingOurTurn(_) = state);
    }

    #[test]
    fn completion_is_terminal() {
        let outcome = Outcome {
            winner: Address::repeat_byte(1),
            loser: Address::repeat_byte(2),
            reason: 0,
        };
        let (state, actions) = run([
            opened(Side::Challenger),
            bisected(100, false, 0),
            Input::Completed(outcome),
            Input::NewHead(500),
            bisected(501, true, 0),
        ]);
        check!(actions.is_empty());
        check!(state == BisectionState::Resolved(outcome));
        check!(state.is_resolved());
    }

    #[test]
    fn events_before_opening_are_ignored() {
        let (state, actions) = run([bisected(1, true, 0), Input::NewHead(5)]);
        check!(state == BisectionState::Idle);
        check!(actions.is_empty());
    }
}
