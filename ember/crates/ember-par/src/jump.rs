//! Jump-patch chains for short-circuit and comparison lowering.
//!
//! A pending jump list is a single `i32` head: the index of a `Jmp`
//! instruction whose `sBx` field does not yet hold a relative offset to its
//! real target. Instead, until the list is patched, that field holds the
//! index of the *next* pending jump in the list (or [`NO_JUMP`] if it is the
//! last one) -- an index-based intrusive singly linked list threaded through
//! the instruction buffer itself, so chaining never needs a side table and
//! never needs fixing up when the buffer grows. This mirrors the technique
//! `Parser_ChainJump`/`Parser_CloseJump` describe, just expressed as free
//! functions over the instruction buffer rather than in-place pointer
//! surgery.

use ember_value::{Instruction, Opcode};

/// Sentinel meaning "no jump" / "end of chain".
pub const NO_JUMP: i32 = -1;

/// Reads the `sBx` field of the jump at `pc` as if it already held an
/// absolute target, returning [`NO_JUMP`] if the field is still the
/// "end of chain" sentinel.
fn jump_dest(code: &[Instruction], pc: i32) -> i32 {
    let offset = code[pc as usize].sbx();
    if offset == NO_JUMP {
        NO_JUMP
    } else {
        pc + 1 + offset
    }
}

/// Patches the jump at `pc` to branch to `target`.
fn fix_jump(code: &mut [Instruction], pc: i32, target: i32) {
    let offset = target - (pc + 1);
    code[pc as usize].patch_sbx(offset);
}

/// Appends `list2` onto the end of `list1`, returning the combined list's
/// head. Either list may be [`NO_JUMP`].
pub fn concat(code: &mut [Instruction], list1: i32, list2: i32) -> i32 {
    if list2 == NO_JUMP {
        return list1;
    }
    if list1 == NO_JUMP {
        return list2;
    }
    let mut tail = list1;
    loop {
        let next = jump_dest(code, tail);
        if next == NO_JUMP {
            break;
        }
        tail = next;
    }
    fix_jump(code, tail, list2);
    list1
}

/// Patches every jump in `list` to branch to `target`.
pub fn patch_to(code: &mut [Instruction], list: i32, target: i32) {
    let mut pc = list;
    while pc != NO_JUMP {
        let next = jump_dest(code, pc);
        fix_jump(code, pc, target);
        pc = next;
    }
}

/// Patches every jump in `list` to branch to the instruction that will be
/// emitted next (`code.len()`).
pub fn patch_here(code: &mut [Instruction], list: i32) {
    patch_to(code, list, code.len() as i32);
}

/// Emits a new unconditional `Jmp` with an open (unpatched) target and
/// returns its instruction index, suitable as the head of a fresh
/// single-element list.
pub fn emit(code: &mut Vec<Instruction>, line_info: &mut Vec<u32>, line: u32) -> i32 {
    code.push(Instruction::asbx(Opcode::Jmp, 0, NO_JUMP));
    line_info.push(line);
    (code.len() - 1) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_jump_patches_to_target() {
        let mut code = vec![Instruction::asbx(Opcode::Jmp, 0, NO_JUMP)];
        patch_to(&mut code, 0, 5);
        assert_eq!(jump_dest(&code, 0), 5);
    }

    #[test]
    fn concat_then_patch_hits_both_jumps() {
        let mut code = vec![
            Instruction::asbx(Opcode::Jmp, 0, NO_JUMP),
            Instruction::asbx(Opcode::Jmp, 0, NO_JUMP),
        ];
        let list = concat(&mut code, 0, 1);
        patch_to(&mut code, list, 10);
        assert_eq!(jump_dest(&code, 0), 10);
        assert_eq!(jump_dest(&code, 1), 10);
    }

    #[test]
    fn concat_with_no_jump_is_identity() {
        let mut code = vec![Instruction::asbx(Opcode::Jmp, 0, NO_JUMP)];
        assert_eq!(concat(&mut code, 0, NO_JUMP), 0);
        assert_eq!(concat(&mut code, NO_JUMP, 0), 0);
    }
}
