mod common;

use common::*;
use iced_x86::Mnemonic;
use sfi_validator::decoder::{InstIter, X86_64};

#[test]
fn test_walk_masked_jump_sequence() {
    let code = masked_jump_r11();
    let mut iter = InstIter::x86_64(&code, VBASE);
    let mut seen = Vec::new();
    while iter.has_next() {
        let inst = iter.current();
        seen.push((inst.vpc - VBASE, inst.length, inst.mnemonic()));
        iter.advance();
    }
    assert_eq!(
        seen,
        vec![(0, 4, Mnemonic::And), (4, 4, Mnemonic::Lea), (8, 3, Mnemonic::Jmp)]
    );
    assert_eq!(iter.position(), 3);
}

#[test]
fn test_lookback_from_jump() {
    let code = masked_jump_r11();
    let mut iter = InstIter::x86_64(&code, VBASE);
    iter.advance();
    iter.advance();
    assert_eq!(iter.current().mnemonic(), Mnemonic::Jmp);
    assert_eq!(iter.lookback(1).mnemonic(), Mnemonic::Lea);
    assert_eq!(iter.lookback(2).mnemonic(), Mnemonic::And);
    assert!(iter.try_lookback(3).is_none());
}

#[test]
fn test_each_instruction_decoded_once() {
    let code = segment(&masked_jump_r11(), 16, NOP);
    let mut iter = InstIter::new(&X86_64, &code, VBASE, 4);
    while iter.has_next() {
        for distance in 0..=4 {
            let _ = iter.try_lookback(distance);
        }
        iter.advance();
    }
    // three idiom instructions and five nops
    assert_eq!(iter.position(), 8);
    assert_eq!(iter.decoded_count(), 8);
}

#[test]
fn test_truncated_final_instruction() {
    // mov eax, imm32 cut after two bytes
    let code = [NOP, 0xb8, 0x01];
    let mut iter = InstIter::x86_64(&code, VBASE);
    iter.advance();
    let inst = iter.current();
    assert_eq!(inst.mnemonic(), Mnemonic::Mov);
    assert_eq!(inst.length, 5);
    assert_eq!(inst.read_length, 2);
    iter.advance();
    assert!(!iter.has_next());
}
