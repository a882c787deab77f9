//! Bytecode instruction encoding: a 32-bit word per instruction, low 8 bits opcode,
//! high 24 bits an unsigned argument (§3.4, §4.3.3).

use crate::error::VmError;

/// The full instruction set (§4.3.3). Values are assigned arbitrarily; only their
/// uniqueness and round-trip through [`OpCode::try_from_u8`] matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Psh = 0,
    Pop = 1,
    Nul = 2,
    Dup = 3,
    J = 4,
    Jt = 5,
    Jf = 6,
    Rref = 7,
    Nref = 8,
    Cref = 9,
    Fref = 10,
    Get = 11,
    Set = 12,
    Typ = 13,
    Add = 14,
    Sub = 15,
    Mul = 16,
    Exp = 17,
    Div = 18,
    Lt = 19,
    Le = 20,
    Gt = 21,
    Ge = 22,
    Eq = 23,
    Ne = 24,
    And = 25,
    Or = 26,
    Not = 27,
    Neg = 28,
    Inc = 29,
    Dec = 30,
    Idx = 31,
    Key = 32,
    Mat = 33,
    Wat = 34,
    Sz = 35,
    Keys = 36,
    Wr = 37,
    Vec = 38,
    Hash = 39,
    Arg = 40,
    Call = 41,
    Tcall = 42,
    Ret = 43,
    End = 44,
}

impl OpCode {
    pub fn try_from_u8(byte: u8) -> Result<Self, VmError> {
        use OpCode::*;
        Ok(match byte {
            0 => Psh,
            1 => Pop,
            2 => Nul,
            3 => Dup,
            4 => J,
            5 => Jt,
            6 => Jf,
            7 => Rref,
            8 => Nref,
            9 => Cref,
            10 => Fref,
            11 => Get,
            12 => Set,
            13 => Typ,
            14 => Add,
            15 => Sub,
            16 => Mul,
            17 => Exp,
            18 => Div,
            19 => Lt,
            20 => Le,
            21 => Gt,
            22 => Ge,
            23 => Eq,
            24 => Ne,
            25 => And,
            26 => Or,
            27 => Not,
            28 => Neg,
            29 => Inc,
            30 => Dec,
            31 => Idx,
            32 => Key,
            33 => Mat,
            34 => Wat,
            35 => Sz,
            36 => Keys,
            37 => Wr,
            38 => Vec,
            39 => Hash,
            40 => Arg,
            41 => Call,
            42 => Tcall,
            43 => Ret,
            44 => End,
            other => return Err(VmError::InvalidOpcode(other)),
        })
    }

    pub fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            Psh => "psh",
            Pop => "pop",
            Nul => "nul",
            Dup => "dup",
            J => "j",
            Jt => "jt",
            Jf => "jf",
            Rref => "rref",
            Nref => "nref",
            Cref => "cref",
            Fref => "fref",
            Get => "get",
            Set => "set",
            Typ => "typ",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Exp => "exp",
            Div => "div",
            Lt => "lt",
            Le => "le",
            Gt => "gt",
            Ge => "ge",
            Eq => "eq",
            Ne => "ne",
            And => "and",
            Or => "or",
            Not => "not",
            Neg => "neg",
            Inc => "inc",
            Dec => "dec",
            Idx => "idx",
            Key => "key",
            Mat => "mat",
            Wat => "wat",
            Sz => "sz",
            Keys => "keys",
            Wr => "wr",
            Vec => "vec",
            Hash => "hash",
            Arg => "arg",
            Call => "call",
            Tcall => "tcall",
            Ret => "ret",
            End => "end",
        }
    }
}

/// One decoded instruction: opcode plus its 24-bit unsigned argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub arg: u32,
}

impl Instruction {
    pub fn new(opcode: OpCode, arg: u32) -> Self {
        debug_assert!(arg <= 0x00FF_FFFF, "argument does not fit in 24 bits");
        Instruction { opcode, arg }
    }

    /// Packs into the low-8/high-24 word the VM's program array stores.
    pub fn encode(self) -> u32 {
        (self.opcode as u32) | (self.arg << 8)
    }

    /// Decodes a single program word.
    pub fn decode(word: u32) -> Result<Self, VmError> {
        let opcode = OpCode::try_from_u8((word & 0xFF) as u8)?;
        let arg = word >> 8;
        Ok(Instruction { opcode, arg })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_word() {
        let ins = Instruction::new(OpCode::Call, 0x00AB_CDEF & 0x00FF_FFFF);
        let word = ins.encode();
        assert_eq!(Instruction::decode(word).unwrap(), ins);
    }

    #[test]
    fn rejects_unknown_opcode_byte() {
        assert!(matches!(OpCode::try_from_u8(255), Err(VmError::InvalidOpcode(255))));
    }
}
