//! Evaluation of an already-compiled classic BPF filter.
//!
//! Filter *compilation* (turning a `tcpdump`-style expression into
//! bytecode) is out of scope (§1); this module only runs a bytecode
//! program a caller already compiled (typically via `libpcap`) against
//! captured slot bytes, matching `source-netmap.c`'s
//! `pcap_offline_filter(&ntv->bpf_prog, &pkthdr, slot_data)` call.

/// One classic BPF instruction (`struct sock_filter` / `struct bpf_insn`).
#[derive(Debug, Clone, Copy)]
pub struct BpfInsn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const BPF_LD: u16 = 0x00;
const BPF_LDX: u16 = 0x01;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_ALU: u16 = 0x04;

const BPF_W: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_B: u16 = 0x10;

const BPF_ABS: u16 = 0x20;
const BPF_IMM: u16 = 0x00;

const BPF_JEQ: u16 = 0x10;
const BPF_JGT: u16 = 0x20;
const BPF_JGE: u16 = 0x30;
const BPF_JSET: u16 = 0x40;
const BPF_JA: u16 = 0x00;

const BPF_ADD: u16 = 0x00;
const BPF_AND: u16 = 0x50;

/// An already-compiled BPF program, owned by a single capture thread.
///
/// Only the subset of classic BPF needed to evaluate simple packet
/// filters is interpreted: absolute loads, immediate/memory ALU, and
/// conditional/unconditional jumps. Anything else is treated as "no
/// match" rather than panicking, since a malformed or unsupported
/// program must never take a capture thread down.
#[derive(Debug, Clone)]
pub struct BpfProgram {
    insns: Vec<BpfInsn>,
}

impl BpfProgram {
    pub fn new(insns: Vec<BpfInsn>) -> Self {
        BpfProgram { insns }
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Evaluates the program against `data`. Returns `true` if the packet
    /// is accepted (matches `pcap_offline_filter`'s nonzero-means-accept
    /// convention).
    pub fn matches(&self, data: &[u8]) -> bool {
        if self.insns.is_empty() {
            return true;
        }
        let mut acc: u32 = 0;
        let mut x: u32 = 0;
        let mut pc: usize = 0;

        let load = |off: u32, width: u16, data: &[u8]| -> Option<u32> {
            let off = off as usize;
            match width {
                BPF_W => data
                    .get(off..off + 4)
                    .map(|b| u32::from_be_bytes(b.try_into().unwrap())),
                BPF_H => data
                    .get(off..off + 2)
                    .map(|b| u16::from_be_bytes(b.try_into().unwrap()) as u32),
                BPF_B => data.get(off).map(|&b| b as u32),
                _ => None,
            }
        };

        while pc < self.insns.len() {
            let insn = self.insns[pc];
            let class = insn.code & 0x07;
            match class {
                c if c == BPF_LD => {
                    let mode = insn.code & 0xe0;
                    let width = insn.code & 0x18;
                    let value = if mode == BPF_ABS {
                        match load(insn.k, width, data) {
                            Some(v) => v,
                            None => return false,
                        }
                    } else if mode == BPF_IMM {
                        insn.k
                    } else {
                        return false;
                    };
                    acc = value;
                    pc += 1;
                }
                c if c == BPF_LDX => {
                    x = insn.k;
                    pc += 1;
                }
                c if c == BPF_ALU => {
                    let op = insn.code & 0xf0;
                    let operand = if insn.code & 0x08 != 0 { x } else { insn.k };
                    acc = if op == BPF_ADD {
                        acc.wrapping_add(operand)
                    } else if op == BPF_AND {
                        acc & operand
                    } else {
                        return false;
                    };
                    pc += 1;
                }
                c if c == BPF_JMP => {
                    let op = insn.code & 0xf0;
                    if op == BPF_JA {
                        pc += insn.k as usize + 1;
                        continue;
                    }
                    let operand = if insn.code & 0x08 != 0 { x } else { insn.k };
                    let taken = match op {
                        o if o == BPF_JEQ => acc == operand,
                        o if o == BPF_JGT => acc > operand,
                        o if o == BPF_JGE => acc >= operand,
                        o if o == BPF_JSET => acc & operand != 0,
                        _ => return false,
                    };
                    pc += 1 + if taken { insn.jt as usize } else { insn.jf as usize };
                }
                c if c == BPF_RET => {
                    return insn.k != 0;
                }
                _ => return false,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_program_accepts_everything() {
        let prog = BpfProgram::new(Vec::new());
        assert!(prog.is_empty());
        assert!(prog.matches(&[]));
        assert!(prog.matches(&[1, 2, 3]));
    }

    #[test]
    fn matches_on_a_fixed_byte_at_offset() {
        // ld [0]; jeq #0xaa, 0, 1; ret #-1; ret #0
        let prog = BpfProgram::new(vec![
            BpfInsn { code: BPF_LD | BPF_B | BPF_ABS, jt: 0, jf: 0, k: 0 },
            BpfInsn { code: BPF_JMP | BPF_JEQ, jt: 0, jf: 1, k: 0xaa },
            BpfInsn { code: BPF_RET, jt: 0, jf: 0, k: 0xffff_ffff },
            BpfInsn { code: BPF_RET, jt: 0, jf: 0, k: 0 },
        ]);

        assert!(prog.matches(&[0xaa, 0x01, 0x02]));
        assert!(!prog.matches(&[0xab, 0x01, 0x02]));
    }

    #[test]
    fn out_of_bounds_load_rejects_rather_than_panics() {
        let prog = BpfProgram::new(vec![
            BpfInsn { code: BPF_LD | BPF_W | BPF_ABS, jt: 0, jf: 0, k: 100 },
            BpfInsn { code: BPF_RET, jt: 0, jf: 0, k: 0xffff_ffff },
        ]);
        assert!(!prog.matches(&[1, 2, 3]));
    }
}
