//! Solidity bindings for the rollup and challenge contracts.

#![allow(missing_docs)]

use alloy::sol;

sol! {
    #[sol(rpc)]
    #[derive(Debug)]
    interface IRollup {
        struct Assertion {
            bytes32 stateHash;
            uint256 inboxSize;
            uint256 parent;
            uint256 deadline;
            uint256 prevCumulativeGasUsed;
            uint256 cumulativeGasUsed;
        }

        event AssertionCreated(uint256 assertionID, address asserterAddr, bytes32 vmHash, uint256 inboxSize);
        event AssertionChallenged(uint256 assertionID, address challengeAddr);
        event AssertionConfirmed(uint256 assertionID);
        event AssertionRejected(uint256 assertionID);

        function createAssertion(bytes32 vmHash, uint256 inboxSize, uint256 l2GasUsed) external;
        function challengeAssertion(address[2] calldata players, uint256[2] calldata assertionIDs)
            external
            returns (address);
        function advanceStake(uint256 assertionID) external;
        function confirmFirstUnresolvedAssertion() external;
        function rejectFirstUnresolvedAssertion(address stakerAddress) external;
        function getAssertion(uint256 assertionID) external view returns (Assertion memory);
    }

    #[sol(rpc)]
    #[derive(Debug)]
    interface IChallenge {
        event Bisected(bytes32 challengeState, uint256 challengedSegmentStart, uint256 challengedSegmentLength);
        event Completed(address winner, address loser, uint8 reason);

        function initializeChallengeLength(uint256 _numSteps) external;
        function bisectExecution(
            bytes32[] calldata bisection,
            uint256 challengedSegmentIndex,
            bytes32[] calldata prevBisection,
            uint256 prevChallengedSegmentStart,
            uint256 prevChallengedSegmentLength
        ) external;
        function verifyOneStepProof(
            bytes calldata proof,
            uint256 challengedStepIndex,
            bytes32[] calldata prevBisection,
            uint256 prevChallengedSegmentStart,
            uint256 prevChallengedSegmentLength
        ) external;
        function timeout() external;
        function currentResponder() external view returns (address);
        function currentResponderTimeLeft() external view returns (uint256);
        function defender() external view returns (address);
        function challenger() external view returns (address);
    }
}
