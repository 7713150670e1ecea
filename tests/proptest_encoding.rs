#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use proptest::prelude::*;

use sbjit::jit::{CompiledProgram, HelperTable, JitCompiler};
use sbjit::program::insn::{self, Insn, asm};
use sbjit::program::Program;

const ALU_OPS: &[u8] = &[
    insn::ADD,
    insn::SUB,
    insn::MUL,
    insn::DIV,
    insn::OR,
    insn::AND,
    insn::LSH,
    insn::RSH,
    insn::NEG,
    insn::MOD,
    insn::XOR,
    insn::MOV,
    insn::ARSH,
];

const JMP_OPS: &[u8] = &[
    insn::JEQ,
    insn::JGT,
    insn::JGE,
    insn::JSET,
    insn::JNE,
    insn::JSGT,
    insn::JSGE,
    insn::JLT,
    insn::JLE,
    insn::JSLT,
    insn::JSLE,
];

fn compile(insns: Vec<Insn>) -> CompiledProgram {
    let mut prog = Program::new("prop", insns);
    JitCompiler::default()
        .compile(&mut prog, &HelperTable::new())
        .unwrap()
        .into_compiled()
        .unwrap()
}

fn insn_len(compiled: &CompiledProgram, k: usize) -> usize {
    compiled.addrs()[k + 1] - compiled.addrs()[k]
}

/// One generated instruction. `skip` is only used by jumps and is clamped
/// so every jump stays inside the program.
#[derive(Debug, Clone)]
struct Step {
    jump: bool,
    op_index: usize,
    is64: bool,
    by_reg: bool,
    dst: u8,
    src: u8,
    imm: i32,
    skip: i16,
}

fn step() -> impl Strategy<Value = Step> {
    (
        prop::bool::weighted(0.25),
        0usize..16,
        any::<bool>(),
        any::<bool>(),
        0u8..=6,
        0u8..=6,
        prop_oneof![any::<i32>(), -200i32..200],
        0i16..6,
    )
        .prop_map(|(jump, op_index, is64, by_reg, dst, src, imm, skip)| Step {
            jump,
            op_index,
            is64,
            by_reg,
            dst,
            src,
            imm,
            skip,
        })
}

fn build_alu(step: &Step) -> Insn {
    let op = ALU_OPS[step.op_index % ALU_OPS.len()];
    let class = if step.is64 { insn::ALU64 } else { insn::ALU };
    let bits = if step.is64 { 64 } else { 32 };
    let (by_reg, imm) = match op {
        insn::NEG => (false, 0),
        // divisors are always non-zero immediates
        insn::DIV | insn::MOD => (false, if step.imm == 0 { 1 } else { step.imm }),
        // 32-bit shifts keep a non-zero count so the result is always written
        insn::LSH | insn::RSH | insn::ARSH if !step.by_reg || !step.is64 => {
            (false, 1 + step.imm.rem_euclid(bits - 1))
        }
        _ => (step.by_reg, step.imm),
    };
    let kind = if by_reg { insn::X } else { insn::K };
    Insn::new(class | op | kind, step.dst, if by_reg { step.src } else { 0 }, 0, imm)
}

fn build_jump(step: &Step, remaining: usize) -> Insn {
    let op = JMP_OPS[step.op_index % JMP_OPS.len()];
    let class = if step.is64 { insn::JMP } else { insn::JMP32 };
    let kind = if step.by_reg { insn::X } else { insn::K };
    let off = step.skip.min(remaining as i16);
    let src = if step.by_reg { step.src } else { 0 };
    Insn::new(class | op | kind, step.dst, src, off, step.imm)
}

/// Straight-line body with forward jumps, bracketed by register setup and a
/// fold of every register into r0.
fn build_program(steps: &[Step]) -> Vec<Insn> {
    let mut insns = vec![asm::mov64_imm(0, 0), asm::mov64_reg(6, 1)];
    for (i, step) in steps.iter().enumerate() {
        let remaining = steps.len() - i - 1;
        insns.push(if step.jump {
            build_jump(step, remaining)
        } else {
            build_alu(step)
        });
    }
    for reg in 1..=6 {
        insns.push(asm::alu64_reg(insn::XOR, 0, reg));
    }
    insns.push(asm::exit());
    insns
}

fn alu64(op: u8, a: u64, b: u64) -> u64 {
    match op {
        insn::ADD => a.wrapping_add(b),
        insn::SUB => a.wrapping_sub(b),
        insn::MUL => a.wrapping_mul(b),
        insn::DIV => a / b,
        insn::MOD => a % b,
        insn::OR => a | b,
        insn::AND => a & b,
        insn::LSH => a.wrapping_shl(b as u32),
        insn::RSH => a.wrapping_shr(b as u32),
        insn::ARSH => (a as i64).wrapping_shr(b as u32) as u64,
        insn::NEG => a.wrapping_neg(),
        insn::XOR => a ^ b,
        insn::MOV => b,
        _ => unreachable!("alu op {op:#x}"),
    }
}

fn alu32(op: u8, a: u32, b: u32) -> u32 {
    match op {
        insn::ADD => a.wrapping_add(b),
        insn::SUB => a.wrapping_sub(b),
        insn::MUL => a.wrapping_mul(b),
        insn::DIV => a / b,
        insn::MOD => a % b,
        insn::OR => a | b,
        insn::AND => a & b,
        insn::LSH => a.wrapping_shl(b),
        insn::RSH => a.wrapping_shr(b),
        insn::ARSH => (a as i32).wrapping_shr(b) as u32,
        insn::NEG => a.wrapping_neg(),
        insn::XOR => a ^ b,
        insn::MOV => b,
        _ => unreachable!("alu op {op:#x}"),
    }
}

fn cond64(op: u8, a: u64, b: u64) -> bool {
    match op {
        insn::JEQ => a == b,
        insn::JNE => a != b,
        insn::JGT => a > b,
        insn::JGE => a >= b,
        insn::JLT => a < b,
        insn::JLE => a <= b,
        insn::JSGT => (a as i64) > (b as i64),
        insn::JSGE => (a as i64) >= (b as i64),
        insn::JSLT => (a as i64) < (b as i64),
        insn::JSLE => (a as i64) <= (b as i64),
        insn::JSET => a & b != 0,
        _ => unreachable!("jump op {op:#x}"),
    }
}

fn cond32(op: u8, a: u32, b: u32) -> bool {
    match op {
        insn::JSGT => (a as i32) > (b as i32),
        insn::JSGE => (a as i32) >= (b as i32),
        insn::JSLT => (a as i32) < (b as i32),
        insn::JSLE => (a as i32) <= (b as i32),
        _ => cond64(op, a as u64, b as u64),
    }
}

/// Reference semantics for the ALU/jump subset the generator produces.
fn interpret(insns: &[Insn], args: [u64; 5]) -> u64 {
    let mut regs = [0u64; 11];
    regs[1..6].copy_from_slice(&args);
    let mut pc = 0usize;
    loop {
        let i = insns[pc];
        pc += 1;
        let op = insn::op(i.code);
        let dst = i.dst as usize;
        let operand = if insn::src_kind(i.code) == insn::X {
            regs[i.src as usize]
        } else {
            i.imm as i64 as u64
        };
        match insn::class(i.code) {
            insn::ALU64 => regs[dst] = alu64(op, regs[dst], operand),
            insn::ALU => regs[dst] = alu32(op, regs[dst] as u32, operand as u32) as u64,
            insn::JMP if op == insn::EXIT => return regs[0],
            class @ (insn::JMP | insn::JMP32) => {
                let taken = if class == insn::JMP {
                    cond64(op, regs[dst], operand)
                } else {
                    cond32(op, regs[dst] as u32, operand as u32)
                };
                if taken {
                    pc = (pc as i64 + i.off as i64) as usize;
                }
            }
            class => unreachable!("class {class:#x}"),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn add_immediate_picks_shortest_form(imm in any::<i32>()) {
        let compiled = compile(vec![asm::alu64_imm(insn::ADD, 1, imm), asm::exit()]);
        let expected = if (-128..=127).contains(&imm) { 4 } else { 7 };
        prop_assert_eq!(insn_len(&compiled, 0), expected);
    }

    #[test]
    fn ld_imm64_picks_shortest_form(value in prop_oneof![Just(0u64), any::<u32>().prop_map(u64::from), any::<u64>()]) {
        let [lo, hi] = asm::ld_imm64(0, value);
        let compiled = compile(vec![lo, hi, asm::exit()]);
        let expected = if value == 0 {
            2
        } else if value <= u32::MAX as u64 {
            5
        } else {
            10
        };
        prop_assert_eq!(insn_len(&compiled, 0), expected);
        prop_assert_eq!(compiled.addrs()[1], compiled.addrs()[2]);
    }

    #[test]
    fn offset_map_is_consistent(steps in prop::collection::vec(step(), 1..120)) {
        let insns = build_program(&steps);
        let compiled = compile(insns.clone());
        let addrs = compiled.addrs();
        prop_assert_eq!(addrs.len(), insns.len() + 1);
        prop_assert!(addrs.windows(2).all(|w| w[0] <= w[1]));
        prop_assert_eq!(*addrs.last().unwrap(), compiled.code().len());

        // a second compilation converges on the same code
        let again = compile(insns);
        prop_assert_eq!(compiled.code(), again.code());
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn compiled_code_matches_interpreter(
        steps in prop::collection::vec(step(), 1..40),
        args in any::<[u64; 5]>(),
    ) {
        let insns = build_program(&steps);
        let expected = interpret(&insns, args);
        let compiled = compile(insns);
        let actual = unsafe { (compiled.as_fn())(args[0], args[1], args[2], args[3], args[4]) };
        prop_assert_eq!(actual, expected);
    }
}
