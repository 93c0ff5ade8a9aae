//! Bytecode Definitions
//!
//! A dense variable-length encoding shared by the code generator and the
//! interpreter. Opcodes are one byte with 0-4 immediate bytes; three opcode
//! blocks encode an operand directly in the opcode value:
//!
//! ```text
//! 0x03        CONSTM1, then CONST0..CONST32      small integer constants
//! 0x70..0x77  BRANCH (conditional, forward)      11-bit offset: low 3 bits + byte
//! 0x78..0x7F  JUMP (unconditional, backward)     11-bit offset: low 3 bits + byte
//! 0x80..0xBF  LOADM64 block                      stack-relative load, offset -64..-1
//! 0xC0..0xFF  STOREM64 block                     stack-relative store, offset -64..-1
//! ```
//!
//! Rare opcodes live behind the `BC_EXTENDED` prefix. Bytecode offsets are
//! capped at 2^23 bytes per heap because return addresses embed the PC in a
//! stack value with the high bit set.

// Stack management
pub const BC_POP: u8 = 0x00;
pub const BC_POPN: u8 = 0x01; // u8: pop count
pub const BC_CHECK_STACK: u8 = 0x02; // u16: frame stack reserve

// Small integer constants encoded in the opcode
pub const BC_CONSTM1: u8 = 0x03;
pub const BC_CONST0: u8 = 0x04; // ..BC_CONST32 = 0x24

// Wider constants
pub const BC_CONST_P8: u8 = 0x25; // u8: value 33..=255
pub const BC_CONST_N8: u8 = 0x26; // u8: value -(imm) - 1, so -2..=-257
pub const BC_CONST_P16: u8 = 0x27; // u16
pub const BC_CONST_N16: u8 = 0x28; // u16: value -(imm) - 1
pub const BC_CONST_I32: u8 = 0x29; // i32
pub const BC_CONST_F32: u8 = 0x2A; // f32 bits, pushed with the reference flag
pub const BC_CONST_REF: u8 = 0x2B; // i32 payload pushed with the reference flag

// Integer arithmetic (overflow raises; _MOD variants wrap)
pub const BC_ADD: u8 = 0x2C;
pub const BC_SUB: u8 = 0x2D;
pub const BC_MUL: u8 = 0x2E;
pub const BC_ADD_MOD: u8 = 0x2F;
pub const BC_SUB_MOD: u8 = 0x30;
pub const BC_MUL_MOD: u8 = 0x31;
pub const BC_DIV: u8 = 0x32;
pub const BC_REM: u8 = 0x33;
pub const BC_SHL: u8 = 0x34;
pub const BC_SHR: u8 = 0x35;
pub const BC_USHR: u8 = 0x36;
pub const BC_AND: u8 = 0x37;
pub const BC_OR: u8 = 0x38;
pub const BC_XOR: u8 = 0x39;

// Comparison and logic
pub const BC_LT: u8 = 0x3A;
pub const BC_LE: u8 = 0x3B;
pub const BC_GT: u8 = 0x3C;
pub const BC_GE: u8 = 0x3D;
pub const BC_EQ: u8 = 0x3E; // raw (payload, flag) equality
pub const BC_NE: u8 = 0x3F;
pub const BC_EQ_VALUE: u8 = 0x40; // structural equality
pub const BC_NE_VALUE: u8 = 0x41;
pub const BC_NOT: u8 = 0x42;
pub const BC_BITNOT: u8 = 0x43;
pub const BC_NEG: u8 = 0x44;

// Local increment/decrement, i8 stack-relative slot offset
pub const BC_INC: u8 = 0x45;
pub const BC_DEC: u8 = 0x46;

// Float arithmetic (results flush denormals)
pub const BC_FLOAT_ADD: u8 = 0x47;
pub const BC_FLOAT_SUB: u8 = 0x48;
pub const BC_FLOAT_MUL: u8 = 0x49;
pub const BC_FLOAT_DIV: u8 = 0x4A;
pub const BC_FLOAT_LT: u8 = 0x4B;
pub const BC_FLOAT_LE: u8 = 0x4C;
pub const BC_FLOAT_GT: u8 = 0x4D;
pub const BC_FLOAT_GE: u8 = 0x4E;

// Generic local access: offset comes from the stack (see LOADM64 block for
// the single-byte forms)
pub const BC_LOADN: u8 = 0x4F;
pub const BC_STOREN: u8 = 0x50;

// Script variables stored in the heap's globals area
pub const BC_LOAD_GLOBAL: u8 = 0x51; // u16: global index
pub const BC_STORE_GLOBAL: u8 = 0x52; // u16

// Array and hash element access
pub const BC_ARRAY_GET: u8 = 0x53;
pub const BC_ARRAY_SET: u8 = 0x54;
pub const BC_ARRAY_APPEND: u8 = 0x55;
pub const BC_HASH_GET: u8 = 0x56;
pub const BC_HASH_SET: u8 = 0x57;

// Constructors for the extended literal forms
pub const BC_CREATE_ARRAY: u8 = 0x58; // u16: element count popped
pub const BC_CREATE_HASH: u8 = 0x59; // u16: pair count popped
pub const BC_CREATE_STRING: u8 = 0x5A; // u16: element count popped, concatenated

// Calls. The marker slot (stack top minus the argument count) holds the
// callee id and is replaced by the encoded return PC.
pub const BC_CALL_DIRECT: u8 = 0x5B; // u8: argument count
pub const BC_CALL_DYNAMIC: u8 = 0x5C; // u8
pub const BC_CALL_NATIVE: u8 = 0x5D; // u8
pub const BC_CALL2_DIRECT: u8 = 0x5E; // u8
pub const BC_CALL2_DYNAMIC: u8 = 0x5F; // u8
pub const BC_CALL2_NATIVE: u8 = 0x60; // u8
pub const BC_CLEAN_CALL2: u8 = 0x61;
pub const BC_RETURN: u8 = 0x62; // u16: frame height above the marker slot
pub const BC_RETURN2: u8 = 0x63; // u16

// Long branch forms (32-bit relative offsets)
pub const BC_BRANCH_LONG: u8 = 0x64; // i32: jump if popped value is zero
pub const BC_JUMP_LONG: u8 = 0x65; // i32

// Switch jump table, u32 absolute table offset (4-byte aligned)
pub const BC_SWITCH: u8 = 0x66;

// Extended opcode prefix
pub const BC_EXTENDED: u8 = 0x67;

// Short branch blocks: 11-bit offsets, low 3 bits in the opcode
pub const BC_BRANCH0: u8 = 0x70; // forward, jump if popped value is zero
pub const BC_JUMP0: u8 = 0x78; // backward

// Stack-relative load/store blocks, offset = opcode - block_base - 64
pub const BC_LOADM64: u8 = 0x80;
pub const BC_STOREM64: u8 = 0xC0;

// Extended opcodes (second byte after BC_EXTENDED)
pub const EXT_CHECK_TIME_LIMIT: u8 = 0x00;

/// Maximum value encoded by the contiguous CONST block.
pub const MAX_CONST_OPCODE_VALUE: i32 = 32;

/// Maximum offset a short branch or jump can encode.
pub const MAX_SHORT_BRANCH: u32 = 0x7FF;

/// Elements batched on the stack for array/hash literals before folding
/// into the constructor opcode; longer literals append to a running tail.
pub const MAX_IMMEDIATE_STACK: usize = 256;

/// Bytecode size cap per heap (PC values embed into 23 bits).
pub const MAX_BYTECODE: usize = 1 << 23;

/// Opcode for a small integer constant, when one exists.
#[inline]
pub fn const_opcode(v: i32) -> Option<u8> {
    if v == -1 {
        Some(BC_CONSTM1)
    } else if (0..=MAX_CONST_OPCODE_VALUE).contains(&v) {
        Some(BC_CONST0 + v as u8)
    } else {
        None
    }
}

/// Stack-relative load opcode for offsets -64..=-1.
#[inline]
pub fn load_opcode(offset: i32) -> Option<u8> {
    if (-64..=-1).contains(&offset) {
        Some(BC_LOADM64 + (offset + 64) as u8)
    } else {
        None
    }
}

/// Stack-relative store opcode for offsets -64..=-1.
#[inline]
pub fn store_opcode(offset: i32) -> Option<u8> {
    if (-64..=-1).contains(&offset) {
        Some(BC_STOREM64 + (offset + 64) as u8)
    } else {
        None
    }
}

/// Total instruction length (opcode + immediates) at `pc`, for linear scans.
pub fn instr_len(code: &[u8], pc: usize) -> usize {
    let op = code[pc];
    match op {
        BC_POPN | BC_CONST_P8 | BC_CONST_N8 | BC_INC | BC_DEC => 2,
        BC_CHECK_STACK | BC_CONST_P16 | BC_CONST_N16 | BC_LOAD_GLOBAL | BC_STORE_GLOBAL
        | BC_CREATE_ARRAY | BC_CREATE_HASH | BC_CREATE_STRING | BC_RETURN | BC_RETURN2 => 3,
        BC_CONST_I32 | BC_CONST_F32 | BC_CONST_REF | BC_BRANCH_LONG | BC_JUMP_LONG | BC_SWITCH => 5,
        BC_CALL_DIRECT | BC_CALL_DYNAMIC | BC_CALL_NATIVE | BC_CALL2_DIRECT | BC_CALL2_DYNAMIC
        | BC_CALL2_NATIVE => 2,
        BC_EXTENDED => 2,
        _ if (BC_BRANCH0..BC_JUMP0 + 8).contains(&op) => 2,
        _ => 1,
    }
}

fn read_u16(code: &[u8], pc: usize) -> u16 {
    u16::from_le_bytes([code[pc], code[pc + 1]])
}

fn read_i32(code: &[u8], pc: usize) -> i32 {
    i32::from_le_bytes([code[pc], code[pc + 1], code[pc + 2], code[pc + 3]])
}

/// Render one instruction as text. Used by tests and debugging helpers.
pub fn disassemble_one(code: &[u8], pc: usize) -> String {
    let op = code[pc];
    match op {
        BC_POP => "pop".to_string(),
        BC_POPN => format!("popn {}", code[pc + 1]),
        BC_CHECK_STACK => format!("check_stack {}", read_u16(code, pc + 1)),
        BC_CONSTM1 => "const -1".to_string(),
        BC_CONST0..=0x24 => format!("const {}", op - BC_CONST0),
        BC_CONST_P8 => format!("const {}", code[pc + 1]),
        BC_CONST_N8 => format!("const {}", -(code[pc + 1] as i32) - 1),
        BC_CONST_P16 => format!("const {}", read_u16(code, pc + 1)),
        BC_CONST_N16 => format!("const {}", -(read_u16(code, pc + 1) as i32) - 1),
        BC_CONST_I32 => format!("const {}", read_i32(code, pc + 1)),
        BC_CONST_F32 => format!("const_f32 {}", f32::from_bits(read_i32(code, pc + 1) as u32)),
        BC_CONST_REF => format!("const_ref {}", read_i32(code, pc + 1)),
        BC_ADD => "add".to_string(),
        BC_SUB => "sub".to_string(),
        BC_MUL => "mul".to_string(),
        BC_ADD_MOD => "add_mod".to_string(),
        BC_SUB_MOD => "sub_mod".to_string(),
        BC_MUL_MOD => "mul_mod".to_string(),
        BC_DIV => "div".to_string(),
        BC_REM => "rem".to_string(),
        BC_SHL => "shl".to_string(),
        BC_SHR => "shr".to_string(),
        BC_USHR => "ushr".to_string(),
        BC_AND => "and".to_string(),
        BC_OR => "or".to_string(),
        BC_XOR => "xor".to_string(),
        BC_LT => "lt".to_string(),
        BC_LE => "le".to_string(),
        BC_GT => "gt".to_string(),
        BC_GE => "ge".to_string(),
        BC_EQ => "eq".to_string(),
        BC_NE => "ne".to_string(),
        BC_EQ_VALUE => "eq_value".to_string(),
        BC_NE_VALUE => "ne_value".to_string(),
        BC_NOT => "not".to_string(),
        BC_BITNOT => "bitnot".to_string(),
        BC_NEG => "neg".to_string(),
        BC_INC => format!("inc {}", code[pc + 1] as i8),
        BC_DEC => format!("dec {}", code[pc + 1] as i8),
        BC_FLOAT_ADD => "fadd".to_string(),
        BC_FLOAT_SUB => "fsub".to_string(),
        BC_FLOAT_MUL => "fmul".to_string(),
        BC_FLOAT_DIV => "fdiv".to_string(),
        BC_FLOAT_LT => "flt".to_string(),
        BC_FLOAT_LE => "fle".to_string(),
        BC_FLOAT_GT => "fgt".to_string(),
        BC_FLOAT_GE => "fge".to_string(),
        BC_LOADN => "loadn".to_string(),
        BC_STOREN => "storen".to_string(),
        BC_LOAD_GLOBAL => format!("load_global {}", read_u16(code, pc + 1)),
        BC_STORE_GLOBAL => format!("store_global {}", read_u16(code, pc + 1)),
        BC_ARRAY_GET => "array_get".to_string(),
        BC_ARRAY_SET => "array_set".to_string(),
        BC_ARRAY_APPEND => "array_append".to_string(),
        BC_HASH_GET => "hash_get".to_string(),
        BC_HASH_SET => "hash_set".to_string(),
        BC_CREATE_ARRAY => format!("create_array {}", read_u16(code, pc + 1)),
        BC_CREATE_HASH => format!("create_hash {}", read_u16(code, pc + 1)),
        BC_CREATE_STRING => format!("create_string {}", read_u16(code, pc + 1)),
        BC_CALL_DIRECT => format!("call_direct {}", code[pc + 1]),
        BC_CALL_DYNAMIC => format!("call_dynamic {}", code[pc + 1]),
        BC_CALL_NATIVE => format!("call_native {}", code[pc + 1]),
        BC_CALL2_DIRECT => format!("call2_direct {}", code[pc + 1]),
        BC_CALL2_DYNAMIC => format!("call2_dynamic {}", code[pc + 1]),
        BC_CALL2_NATIVE => format!("call2_native {}", code[pc + 1]),
        BC_CLEAN_CALL2 => "clean_call2".to_string(),
        BC_RETURN => format!("return {}", read_u16(code, pc + 1)),
        BC_RETURN2 => format!("return2 {}", read_u16(code, pc + 1)),
        BC_BRANCH_LONG => format!("branch {:+}", read_i32(code, pc + 1)),
        BC_JUMP_LONG => format!("jump {:+}", read_i32(code, pc + 1)),
        BC_SWITCH => format!("switch @{}", read_i32(code, pc + 1)),
        BC_EXTENDED => match code[pc + 1] {
            EXT_CHECK_TIME_LIMIT => "check_time_limit".to_string(),
            ext => format!("ext {:#04x}", ext),
        },
        _ if (BC_BRANCH0..BC_BRANCH0 + 8).contains(&op) => {
            let off = ((op - BC_BRANCH0) as u32) << 8 | code[pc + 1] as u32;
            format!("branch +{}", off)
        }
        _ if (BC_JUMP0..BC_JUMP0 + 8).contains(&op) => {
            let off = ((op - BC_JUMP0) as u32) << 8 | code[pc + 1] as u32;
            format!("jump -{}", off)
        }
        _ if op >= BC_STOREM64 => format!("store {}", op as i32 - BC_STOREM64 as i32 - 64),
        _ if op >= BC_LOADM64 => format!("load {}", op as i32 - BC_LOADM64 as i32 - 64),
        _ => format!("?? {:#04x}", op),
    }
}

/// Disassemble the instructions in `[start, end)`, one per line.
pub fn disassemble(code: &[u8], start: usize, end: usize) -> String {
    let mut out = String::new();
    let mut pc = start;
    while pc < end {
        out.push_str(&format!("{:6}  {}\n", pc, disassemble_one(code, pc)));
        pc += instr_len(code, pc);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_opcode_range() {
        assert_eq!(const_opcode(-1), Some(BC_CONSTM1));
        assert_eq!(const_opcode(0), Some(BC_CONST0));
        assert_eq!(const_opcode(32), Some(0x24));
        assert_eq!(const_opcode(33), None);
        assert_eq!(const_opcode(-2), None);
    }

    #[test]
    fn test_load_store_blocks_do_not_overlap() {
        assert_eq!(load_opcode(-64), Some(0x80));
        assert_eq!(load_opcode(-1), Some(0xBF));
        assert_eq!(store_opcode(-64), Some(0xC0));
        assert_eq!(store_opcode(-1), Some(0xFF));
        assert_eq!(load_opcode(0), None);
        assert_eq!(store_opcode(-65), None);
    }

    #[test]
    fn test_instr_len_walk() {
        let code = [
            BC_CHECK_STACK,
            4,
            0,
            BC_CONST0 + 2,
            BC_CONST_I32,
            1,
            2,
            3,
            4,
            BC_ADD,
            BC_RETURN,
            1,
            0,
        ];
        let mut pc = 0;
        let mut ops = Vec::new();
        while pc < code.len() {
            ops.push(code[pc]);
            pc += instr_len(&code, pc);
        }
        assert_eq!(pc, code.len());
        assert_eq!(ops.len(), 5);
    }

    #[test]
    fn test_disassemble_one() {
        let code = [BC_CONST_N8, 1];
        assert_eq!(disassemble_one(&code, 0), "const -2");
        let code = [BC_BRANCH0 + 1, 0x34];
        assert_eq!(disassemble_one(&code, 0), "branch +308");
    }
}
