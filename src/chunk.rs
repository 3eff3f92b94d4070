use super::value::Value;
use std::convert::{Into, TryFrom};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Constant,
    Nil,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    GetUpValue,
    SetUpValue,
    GetProperty,
    SetProperty,
    GetSuper,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    Closure,
    CloseUpValue,
    Return,
    Class,
    Inherit,
    Method,
}

impl Into<u8> for Instruction {
    fn into(self) -> u8 {
        match self {
            Self::Constant => 0,
            Self::Nil => 1,
            Self::True => 2,
            Self::False => 3,
            Self::Pop => 4,
            Self::GetLocal => 5,
            Self::SetLocal => 6,
            Self::GetGlobal => 7,
            Self::DefineGlobal => 8,
            Self::SetGlobal => 9,
            Self::GetUpValue => 10,
            Self::SetUpValue => 11,
            Self::GetProperty => 12,
            Self::SetProperty => 13,
            Self::GetSuper => 14,
            Self::Equal => 15,
            Self::Greater => 16,
            Self::Less => 17,
            Self::Add => 18,
            Self::Subtract => 19,
            Self::Multiply => 20,
            Self::Divide => 21,
            Self::Not => 22,
            Self::Negate => 23,
            Self::Print => 24,
            Self::Jump => 25,
            Self::JumpIfFalse => 26,
            Self::Loop => 27,
            Self::Call => 28,
            Self::Invoke => 29,
            Self::SuperInvoke => 30,
            Self::Closure => 31,
            Self::CloseUpValue => 32,
            Self::Return => 33,
            Self::Class => 34,
            Self::Inherit => 35,
            Self::Method => 36,
        }
    }
}

impl TryFrom<u8> for Instruction {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Constant),
            1 => Ok(Self::Nil),
            2 => Ok(Self::True),
            3 => Ok(Self::False),
            4 => Ok(Self::Pop),
            5 => Ok(Self::GetLocal),
            6 => Ok(Self::SetLocal),
            7 => Ok(Self::GetGlobal),
            8 => Ok(Self::DefineGlobal),
            9 => Ok(Self::SetGlobal),
            10 => Ok(Self::GetUpValue),
            11 => Ok(Self::SetUpValue),
            12 => Ok(Self::GetProperty),
            13 => Ok(Self::SetProperty),
            14 => Ok(Self::GetSuper),
            15 => Ok(Self::Equal),
            16 => Ok(Self::Greater),
            17 => Ok(Self::Less),
            18 => Ok(Self::Add),
            19 => Ok(Self::Subtract),
            20 => Ok(Self::Multiply),
            21 => Ok(Self::Divide),
            22 => Ok(Self::Not),
            23 => Ok(Self::Negate),
            24 => Ok(Self::Print),
            25 => Ok(Self::Jump),
            26 => Ok(Self::JumpIfFalse),
            27 => Ok(Self::Loop),
            28 => Ok(Self::Call),
            29 => Ok(Self::Invoke),
            30 => Ok(Self::SuperInvoke),
            31 => Ok(Self::Closure),
            32 => Ok(Self::CloseUpValue),
            33 => Ok(Self::Return),
            34 => Ok(Self::Class),
            35 => Ok(Self::Inherit),
            36 => Ok(Self::Method),
            _ => Err(()),
        }
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:20}",
            match self {
                Self::Constant => "CONSTANT",
                Self::Nil => "NIL",
                Self::True => "TRUE",
                Self::False => "FALSE",
                Self::Pop => "POP",
                Self::GetLocal => "GET_LOCAL",
                Self::SetLocal => "SET_LOCAL",
                Self::GetGlobal => "GET_GLOBAL",
                Self::DefineGlobal => "DEFINE_GLOBAL",
                Self::SetGlobal => "SET_GLOBAL",
                Self::GetUpValue => "GET_UPVALUE",
                Self::SetUpValue => "SET_UPVALUE",
                Self::GetProperty => "GET_PROPERTY",
                Self::SetProperty => "SET_PROPERTY",
                Self::GetSuper => "GET_SUPER",
                Self::Equal => "EQUAL",
                Self::Greater => "GREATER",
                Self::Less => "LESS",
                Self::Add => "ADD",
                Self::Subtract => "SUBTRACT",
                Self::Multiply => "MULTIPLY",
                Self::Divide => "DIVIDE",
                Self::Not => "NOT",
                Self::Negate => "NEGATE",
                Self::Print => "PRINT",
                Self::Jump => "JUMP",
                Self::JumpIfFalse => "JUMP_IF_FALSE",
                Self::Loop => "LOOP",
                Self::Call => "CALL",
                Self::Invoke => "INVOKE",
                Self::SuperInvoke => "SUPER_INVOKE",
                Self::Closure => "CLOSURE",
                Self::CloseUpValue => "CLOSE_UPVALUE",
                Self::Return => "RETURN",
                Self::Class => "CLASS",
                Self::Inherit => "INHERIT",
                Self::Method => "METHOD",
            },
        )
    }
}

pub const MAX_CONSTANTS: usize = 256;

pub struct Chunk {
    code: Vec<u8>,
    /// Run-length encoded: (offset of the first byte on the line, line).
    lines: Vec<(usize, u32)>,
    constants: Vec<Value>,
}

impl Chunk {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
        }
    }

    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        match self.lines.last() {
            Some(&(_, last)) if last == line => {}
            _ => self.lines.push((self.code.len() - 1, line)),
        }
    }

    pub fn emit_instr(&mut self, instr: Instruction, line: u32) {
        self.write(instr.into(), line);
    }

    pub fn emit_u16(&mut self, value: u16, line: u32) {
        self.write((value >> 8) as u8, line);
        self.write(value as u8, line);
    }

    fn patch_u16(&mut self, index: usize, value: u16) {
        self.code[index] = (value >> 8) as u8;
        self.code[index + 1] = value as u8;
    }

    pub fn add_constant(&mut self, value: Value) -> Result<u8, ()> {
        // interned strings make cell identity content identity
        if value.is_string() {
            for (index, constant) in self.constants.iter().enumerate() {
                if *constant == value {
                    return Ok(index as u8);
                }
            }
        }

        if self.constants.len() >= MAX_CONSTANTS {
            return Err(());
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u8)
    }

    /// Emits a jump with a placeholder offset and returns the index of
    /// the operand, for `patch_jump`.
    pub fn emit_jump(&mut self, instr: Instruction, line: u32) -> usize {
        self.emit_instr(instr, line);
        let index = self.code.len();
        self.emit_u16(0xffff, line);
        index
    }

    pub fn patch_jump(&mut self, index: usize) -> Result<(), ()> {
        // distance from the byte after the operand to the current end
        let jump = self.code.len() - index - 2;
        if jump > u16::MAX as usize {
            return Err(());
        }
        self.patch_u16(index, jump as u16);
        Ok(())
    }

    pub fn emit_loop(&mut self, loop_start: usize, line: u32) -> Result<(), ()> {
        self.emit_instr(Instruction::Loop, line);
        let offset = self.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            return Err(());
        }
        self.emit_u16(offset as u16, line);
        Ok(())
    }

    pub fn byte(&self, offset: usize) -> u8 {
        self.code[offset]
    }

    pub fn u16_at(&self, offset: usize) -> u16 {
        (self.code[offset] as u16) << 8 | self.code[offset + 1] as u16
    }

    pub fn constant(&self, index: usize) -> &Value {
        &self.constants[index]
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn line_at(&self, offset: usize) -> u32 {
        let mut line = 1;
        for &(start, l) in &self.lines {
            if start > offset {
                break;
            }
            line = l;
        }
        line
    }

    pub fn heap_size(&self) -> usize {
        self.code.capacity()
            + self.lines.capacity() * std::mem::size_of::<(usize, u32)>()
            + self.constants.capacity() * std::mem::size_of::<Value>()
    }
}

#[cfg(any(feature = "debug-bytecode", feature = "debug-execution"))]
impl Chunk {
    pub fn disassemble_instr_at(&self, offset: usize) -> (String, usize) {
        let instr = Instruction::try_from(self.code[offset]).unwrap();
        let mut buffer = format!("{:0>5} {:?}", offset, instr);

        match instr {
            Instruction::Nil
            | Instruction::True
            | Instruction::False
            | Instruction::Pop
            | Instruction::Equal
            | Instruction::Greater
            | Instruction::Less
            | Instruction::Add
            | Instruction::Subtract
            | Instruction::Multiply
            | Instruction::Divide
            | Instruction::Not
            | Instruction::Negate
            | Instruction::Print
            | Instruction::CloseUpValue
            | Instruction::Inherit
            | Instruction::Return => {
                buffer += "\n";
                (buffer, 1)
            }
            Instruction::Constant
            | Instruction::GetGlobal
            | Instruction::DefineGlobal
            | Instruction::SetGlobal
            | Instruction::GetProperty
            | Instruction::SetProperty
            | Instruction::GetSuper
            | Instruction::Class
            | Instruction::Method => {
                let index = self.code[offset + 1] as usize;
                buffer += &format!("{} ({})\n", index, self.constants[index]);
                (buffer, 2)
            }
            Instruction::GetLocal
            | Instruction::SetLocal
            | Instruction::GetUpValue
            | Instruction::SetUpValue
            | Instruction::Call => {
                buffer += &format!("{}\n", self.code[offset + 1]);
                (buffer, 2)
            }
            Instruction::Jump | Instruction::JumpIfFalse | Instruction::Loop => {
                buffer += &format!("{}\n", self.u16_at(offset + 1));
                (buffer, 3)
            }
            Instruction::Invoke | Instruction::SuperInvoke => {
                let index = self.code[offset + 1] as usize;
                let argc = self.code[offset + 2];
                buffer += &format!("{} ({}) argc {}\n", index, self.constants[index], argc);
                (buffer, 3)
            }
            Instruction::Closure => {
                let index = self.code[offset + 1] as usize;
                buffer += &format!("{} ({})\n", index, self.constants[index]);
                let upvalue_count = self
                    .constants[index]
                    .as_function()
                    .content
                    .upvalue_count;
                for i in 0..upvalue_count {
                    buffer += &format!(
                        "|     {i}: is_local: {}, index: {}\n",
                        self.code[offset + 2 + i * 2] != 0,
                        self.code[offset + 3 + i * 2]
                    );
                }
                (buffer, 2 + upvalue_count * 2)
            }
        }
    }

    pub fn disassemble(&self) -> String {
        let mut buffer = String::new();
        let mut offset = 0;
        while offset < self.len() {
            let (as_string, progress) = self.disassemble_instr_at(offset);
            buffer += &as_string;
            offset += progress;
        }
        buffer
    }
}

#[cfg(feature = "debug-bytecode")]
impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.disassemble())
    }
}

#[cfg(test)]
mod tests {
    use super::super::heap::Heap;
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for byte in 0..=36u8 {
            let instr = Instruction::try_from(byte).unwrap();
            let back: u8 = instr.into();
            assert_eq!(back, byte);
        }
        assert!(Instruction::try_from(37).is_err());
    }

    #[test]
    fn line_tracking() {
        let mut chunk = Chunk::new();
        chunk.emit_instr(Instruction::Nil, 1);
        chunk.emit_instr(Instruction::Pop, 1);
        chunk.emit_instr(Instruction::Nil, 3);
        assert_eq!(chunk.line_at(0), 1);
        assert_eq!(chunk.line_at(1), 1);
        assert_eq!(chunk.line_at(2), 3);
    }

    #[test]
    fn string_constants_dedup() {
        let mut heap = Heap::new();
        let mut chunk = Chunk::new();
        let a = chunk
            .add_constant(Value::String(heap.intern("x".to_string())))
            .unwrap();
        let b = chunk
            .add_constant(Value::String(heap.intern("x".to_string())))
            .unwrap();
        let c = chunk.add_constant(Value::Number(1.0)).unwrap();
        let d = chunk.add_constant(Value::Number(1.0)).unwrap();
        assert_eq!(a, b);
        assert_ne!(c, d);
    }

    #[test]
    fn constant_limit() {
        let mut chunk = Chunk::new();
        for i in 0..MAX_CONSTANTS {
            chunk.add_constant(Value::Number(i as f64)).unwrap();
        }
        assert!(chunk.add_constant(Value::Number(0.0)).is_err());
    }

    #[test]
    fn jump_patching() {
        let mut chunk = Chunk::new();
        let jump = chunk.emit_jump(Instruction::JumpIfFalse, 1);
        chunk.emit_instr(Instruction::Pop, 1);
        chunk.emit_instr(Instruction::Pop, 1);
        chunk.patch_jump(jump).unwrap();
        // lands just past the two pops
        assert_eq!(chunk.u16_at(jump), 2);
    }

    #[test]
    fn loop_offset() {
        let mut chunk = Chunk::new();
        let start = chunk.len();
        chunk.emit_instr(Instruction::Nil, 1);
        chunk.emit_instr(Instruction::Pop, 1);
        chunk.emit_loop(start, 1).unwrap();
        let operand = chunk.u16_at(chunk.len() - 2);
        // ip sits after the operand when the VM subtracts
        assert_eq!(chunk.len() - operand as usize, start);
    }
}
