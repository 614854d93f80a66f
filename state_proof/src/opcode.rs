//! The handful of opcodes whose side effects the state generator tracks.
//!
//! Stack operands are addressed by their distance from the top of the stack
//! (`0` is the top), matching the order in which the EVM pops them.

pub const STOP: u8 = 0x00;
pub const ADD: u8 = 0x01;
pub const BALANCE: u8 = 0x31;
pub const EXTCODESIZE: u8 = 0x3b;
pub const EXTCODECOPY: u8 = 0x3c;
pub const EXTCODEHASH: u8 = 0x3f;
pub const BLOCKHASH: u8 = 0x40;
pub const MSTORE: u8 = 0x52;
pub const SLOAD: u8 = 0x54;
pub const SSTORE: u8 = 0x55;
pub const PUSH1: u8 = 0x60;
pub const LOG0: u8 = 0xa0;
pub const LOG4: u8 = 0xa4;
pub const CREATE: u8 = 0xf0;
pub const CALL: u8 = 0xf1;
pub const CALLCODE: u8 = 0xf2;
pub const RETURN: u8 = 0xf3;
pub const DELEGATECALL: u8 = 0xf4;
pub const CREATE2: u8 = 0xf5;
pub const STATICCALL: u8 = 0xfa;
pub const REVERT: u8 = 0xfd;
pub const SELFDESTRUCT: u8 = 0xff;

/// Positions of the `(retOffset, retSize)` operands of a call opcode.
///
/// `CALL` and `CALLCODE` carry a `value` operand that shifts the output
/// window one slot deeper than for `DELEGATECALL` and `STATICCALL`.
pub fn call_output_operands(opcode: u8) -> Option<(usize, usize)> {
    match opcode {
        CALL | CALLCODE => Some((5, 6)),
        DELEGATECALL | STATICCALL => Some((4, 5)),
        _ => None,
    }
}

/// Number of topics of a `LOGn` opcode.
pub fn log_topics(opcode: u8) -> Option<usize> {
    (LOG0..=LOG4)
        .contains(&opcode)
        .then(|| (opcode - LOG0) as usize)
}

/// Position of the address operand for opcodes that warm an account.
pub fn accessed_address_operand(opcode: u8) -> Option<usize> {
    match opcode {
        BALANCE | EXTCODESIZE | EXTCODECOPY | EXTCODEHASH | SELFDESTRUCT => Some(0),
        CALL | CALLCODE | DELEGATECALL | STATICCALL => Some(1),
        _ => None,
    }
}

/// Position of the slot operand for opcodes that warm a storage slot of the
/// executing contract.
pub fn accessed_slot_operand(opcode: u8) -> Option<usize> {
    match opcode {
        SLOAD | SSTORE => Some(0),
        _ => None,
    }
}

pub fn is_create(opcode: u8) -> bool {
    matches!(opcode, CREATE | CREATE2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_bearing_calls_read_the_output_window_deeper() {
        assert_eq!(call_output_operands(CALL), Some((5, 6)));
        assert_eq!(call_output_operands(CALLCODE), Some((5, 6)));
        assert_eq!(call_output_operands(DELEGATECALL), Some((4, 5)));
        assert_eq!(call_output_operands(STATICCALL), Some((4, 5)));
        assert_eq!(call_output_operands(CREATE), None);
    }

    #[test]
    fn log_topic_counts() {
        assert_eq!(log_topics(LOG0), Some(0));
        assert_eq!(log_topics(LOG4), Some(4));
        assert_eq!(log_topics(SSTORE), None);
    }
}
