//! Single-Pass Parser and Bytecode Generator
//!
//! A recursive-descent compiler that emits bytecode directly, tracking a
//! simulated stack position that must match the runtime stack depth at
//! every bytecode boundary (`BC_RETURN` encodes `stack_pos - 1`). Constant
//! subexpressions fold at the stack level by rolling the emitted code back.
//!
//! Short conditional branches carry 11-bit forward offsets; when one
//! overflows during code generation the parser restarts the whole script in
//! long-jump mode (at most two passes). Function references and call
//! targets are recorded as patches and resolved after the whole script has
//! parsed: locally declared functions first, then imports, then the native
//! registry, with a placeholder native that raises when the name stays
//! unresolved.
//!
//! A script is `use* import* const* (var-decl | function)*`. The `use`
//! directives run before parsing proper: the rest of the file is
//! materialised into a token-record array and handed to the named script's
//! `process_tokens#3`, whose (possibly rewritten) token stream replaces the
//! current source.

use crate::error::CompileError;
use crate::token::{
    TOK_CHAR, TOK_FUNC_REF, TOK_FLOAT_NUMBER, TOK_HEX_NUMBER, TOK_IDENT, TOK_KEYWORD, TOK_NUMBER,
    TOK_STRING, TOK_SYMBOL, Token, TokenValue, Tokenizer, decode_record,
};
use fixscript_core::bytecode::*;
use fixscript_core::{FUNC_REF_OFFSET, Value};
use fixscript_runtime::{Heap, NativeResult, Script};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::OnceLock;

/// Import chains deeper than this fail with a dedicated error.
const MAX_IMPORT_DEPTH: u32 = 100;

/// Heap-local storage key for the in-progress compilation state.
fn loading_key() -> usize {
    static KEY: OnceLock<usize> = OnceLock::new();
    *KEY.get_or_init(fixscript_core::next_heap_key)
}

#[derive(Default)]
struct LoadingState {
    names: FxHashSet<String>,
    depth: u32,
}

enum Abort {
    /// A short branch overflowed; restart in long-jump mode.
    NeedLongJumps,
    Error(CompileError),
}

type PResult<T> = Result<T, Abort>;

impl From<CompileError> for Abort {
    fn from(e: CompileError) -> Abort {
        Abort::Error(e)
    }
}

/// Compile source text and register it under `name`. Loading is idempotent:
/// an already-registered name returns the existing script.
pub fn compile_source(heap: &mut Heap, name: &str, source: &str) -> Result<usize, CompileError> {
    if let Some(id) = heap.script_by_name(name) {
        return Ok(id);
    }
    {
        let state = loading_state(heap);
        if state.names.contains(name) {
            return Err(CompileError::new(name, 0, "circular import"));
        }
        if state.depth >= MAX_IMPORT_DEPTH {
            return Err(CompileError::new(name, 0, "maximum import depth exceeded"));
        }
        state.names.insert(name.to_string());
        state.depth += 1;
    }
    let result = compile_inner(heap, name, source);
    {
        let state = loading_state(heap);
        state.names.remove(name);
        state.depth -= 1;
    }
    result
}

fn loading_state(heap: &mut Heap) -> &mut LoadingState {
    let key = loading_key();
    if heap.heap_data::<LoadingState>(key).is_none() {
        heap.set_heap_data(key, Box::new(LoadingState::default()));
    }
    heap.heap_data_mut(key).unwrap()
}

fn compile_inner(heap: &mut Heap, name: &str, source: &str) -> Result<usize, CompileError> {
    let tokens = Tokenizer::new(source, 1, false)
        .tokenize_all()
        .map_err(|e| e.in_file(name))?;
    let (src, tokens) = process_uses(heap, name, source.to_string(), tokens)?;
    for attempt in 0..2 {
        let mut parser = Parser::new(heap, name, &src, &tokens, attempt > 0);
        match parser.parse_program() {
            Ok(()) => return parser.install(),
            Err(abort) => {
                parser.abandon();
                match abort {
                    Abort::NeedLongJumps if attempt == 0 => continue,
                    Abort::NeedLongJumps => {
                        return Err(CompileError::new(name, 0, "branch offset overflow"));
                    }
                    Abort::Error(e) => return Err(e.in_file(name)),
                }
            }
        }
    }
    unreachable!()
}

// ---------------------------------------------------------------------
// `use` preprocessing
// ---------------------------------------------------------------------

fn process_uses(
    heap: &mut Heap,
    file: &str,
    mut src: String,
    mut tokens: Vec<Token>,
) -> Result<(String, Vec<Token>), CompileError> {
    loop {
        let is_use = tokens.first().is_some_and(|t| t.ty == TOK_KEYWORD && t.text(&src) == "use");
        if !is_use {
            return Ok((src, tokens));
        }
        let name_tok = tokens
            .get(1)
            .filter(|t| t.ty == TOK_STRING)
            .ok_or_else(|| CompileError::new(file, 1, "expected script name after 'use'"))?;
        let TokenValue::Str(script_name) = name_tok.value.clone() else {
            return Err(CompileError::new(file, name_tok.line, "expected script name"));
        };
        let semi_ok = tokens.get(2).is_some_and(|t| t.text(&src) == ";");
        if !semi_ok {
            return Err(CompileError::new(file, name_tok.line, "expected ';' after 'use'"));
        }
        let line = name_tok.line;
        let rest: Vec<Token> = tokens.split_off(3);

        heap.load_script(&script_name)
            .map_err(|msg| CompileError::new(file, line, &msg))?;

        // Materialise the remaining tokens and hand them to the
        // preprocessor, which may rewrite both the records and the source.
        // Everything passed across stays pinned until the records have been
        // read back.
        let mut pinned: Vec<Value> = Vec::new();
        let result = run_preprocessor(heap, file, line, &script_name, &src, &rest, &mut pinned);
        for v in &pinned {
            heap.unref(*v);
        }
        let (new_src, rebuilt) = result?;
        src = new_src;
        tokens = rebuilt;
    }
}

fn run_preprocessor(
    heap: &mut Heap,
    file: &str,
    line: u32,
    script_name: &str,
    src: &str,
    rest: &[Token],
    pinned: &mut Vec<Value>,
) -> Result<(String, Vec<Token>), CompileError> {
    let fix = |e: fixscript_runtime::FixError| CompileError::new(file, line, &e.to_string());
    let records = heap.create_array(rest.len() * 4).map_err(fix)?;
    heap.add_ref(records);
    pinned.push(records);
    for (i, t) in rest.iter().enumerate() {
        for (j, field) in [t.ty, t.off as i32, t.len as i32, t.line as i32]
            .into_iter()
            .enumerate()
        {
            heap.set_array_elem(records, i * 4 + j, Value::int(field))
                .map_err(fix)?;
        }
    }
    let fname = heap.create_string(file).map_err(fix)?;
    heap.add_ref(fname);
    pinned.push(fname);
    let src_val = heap.create_string(src).map_err(fix)?;
    heap.add_ref(src_val);
    pinned.push(src_val);

    heap.call_by_name(script_name, "process_tokens#3", &[fname, records, src_val])
        .map_err(|e| CompileError::new(file, line, &e.to_string()))?;

    let new_src = heap.get_string(src_val).map_err(fix)?;
    let count = heap.length(records).map_err(fix)? / 4;
    let mut rebuilt = Vec::with_capacity(count);
    for i in 0..count {
        let mut f = [0i32; 4];
        for (j, slot) in f.iter_mut().enumerate() {
            *slot = heap.get_array_elem(records, i * 4 + j).map_err(fix)?.data;
        }
        rebuilt.push(
            decode_record(&new_src, f[0], f[1] as usize, f[2] as usize, f[3] as u32)
                .map_err(|e| e.in_file(file))?,
        );
    }
    Ok((new_src, rebuilt))
}

// ---------------------------------------------------------------------
// Parser state
// ---------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Expr {
    Value,
    Const(Value),
}

/// Assignable-place info threaded out of postfix parsing. The emitted code
/// for the place's load sits at `mark..`, so assignment can roll it back.
#[derive(Clone, Copy, PartialEq)]
enum Place {
    None,
    Local(i32),
    Global(GlobalSlot),
    /// Stack holds `array, index`; the trailing ARRAY_GET byte was emitted.
    ArrayElem,
    /// Stack holds `hash, key`; the trailing HASH_GET byte was emitted.
    HashElem,
}

#[derive(Clone, Copy, PartialEq)]
enum GlobalSlot {
    /// Index into this script's globals; final slot assigned at install.
    Own(usize),
    /// Absolute slot of an imported script's variable.
    Absolute(usize),
}

#[derive(Clone, Copy)]
struct Parsed {
    expr: Expr,
    place: Place,
}

impl Parsed {
    fn value() -> Parsed {
        Parsed {
            expr: Expr::Value,
            place: Place::None,
        }
    }

    fn konst(v: Value) -> Parsed {
        Parsed {
            expr: Expr::Const(v),
            place: Place::None,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum PatchKind {
    /// Marker constant holding a call target id; the opcode byte may be
    /// rewritten to the native form.
    CallTarget,
    /// CONST_REF payload of a function-reference literal.
    FuncRefValue,
}

struct CallPatch {
    const_at: usize,
    opcode_at: usize,
    name: String,
    line: u32,
    kind: PatchKind,
}

struct LocalFunc {
    name: String,
    offset: u32,
    num_params: usize,
}

struct LoopCtx {
    break_patches: Vec<usize>,
    continue_back: Option<u32>,
    continue_patches: Vec<usize>,
    base_stack: i32,
    is_switch: bool,
}

struct PendingSwitch {
    imm_at: usize,
    cases: Vec<(i32, i32, u32)>,
    default_pc: Option<u32>,
}

struct TableEntry {
    offset: usize,
    count: usize,
}

pub(crate) struct Parser<'h, 't> {
    heap: &'h mut Heap,
    file: String,
    src: &'t str,
    tokens: &'t [Token],
    pos: usize,
    long_jumps: bool,

    code: Vec<u8>,
    lines: Vec<(u32, u32)>,
    last_line: u32,
    funcs: Vec<LocalFunc>,
    func_map: FxHashMap<String, usize>,
    global_names: Vec<String>,
    global_map: FxHashMap<String, usize>,
    global_patches: Vec<(usize, usize)>,
    constants: FxHashMap<String, Value>,
    imports: Vec<usize>,
    aliases: FxHashMap<String, usize>,
    const_roots: Vec<Value>,
    call_patches: Vec<CallPatch>,
    switch_imms: Vec<usize>,
    tables: Vec<TableEntry>,
    pending_switches: Vec<PendingSwitch>,

    stack_pos: i32,
    max_stack: i32,
    scopes: Vec<FxHashMap<String, i32>>,
    loops: Vec<LoopCtx>,
    float_mode: bool,
}

impl<'h, 't> Parser<'h, 't> {
    fn new(
        heap: &'h mut Heap,
        file: &str,
        src: &'t str,
        tokens: &'t [Token],
        long_jumps: bool,
    ) -> Parser<'h, 't> {
        Parser {
            heap,
            file: file.to_string(),
            src,
            tokens,
            pos: 0,
            long_jumps,
            code: Vec::new(),
            lines: Vec::new(),
            last_line: 0,
            funcs: Vec::new(),
            func_map: FxHashMap::default(),
            global_names: Vec::new(),
            global_map: FxHashMap::default(),
            global_patches: Vec::new(),
            constants: FxHashMap::default(),
            imports: Vec::new(),
            aliases: FxHashMap::default(),
            const_roots: Vec::new(),
            call_patches: Vec::new(),
            switch_imms: Vec::new(),
            tables: Vec::new(),
            pending_switches: Vec::new(),
            stack_pos: 0,
            max_stack: 0,
            scopes: Vec::new(),
            loops: Vec::new(),
            float_mode: false,
        }
    }

    // -----------------------------------------------------------------
    // Token cursor
    // -----------------------------------------------------------------

    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos)
    }

    fn peek_text(&self) -> &'t str {
        self.peek().map_or("", |t| t.text(self.src))
    }

    fn peek_at(&self, n: usize) -> Option<&'t Token> {
        self.tokens.get(self.pos + n)
    }

    fn advance(&mut self) -> PResult<&'t Token> {
        let t = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| self.err_here("unexpected end of file"))?;
        self.pos += 1;
        Ok(t)
    }

    fn check(&self, text: &str) -> bool {
        self.peek_text() == text
    }

    fn accept(&mut self, text: &str) -> bool {
        if self.check(text) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, text: &str) -> PResult<()> {
        if self.accept(text) {
            Ok(())
        } else {
            Err(self.err_here(&format!("expected '{}'", text)))
        }
    }

    fn cur_line(&self) -> u32 {
        self.peek()
            .map(|t| t.line)
            .or_else(|| self.tokens.last().map(|t| t.line))
            .unwrap_or(1)
    }

    fn err_here(&self, msg: &str) -> Abort {
        Abort::Error(CompileError::new(&self.file, self.cur_line(), msg))
    }

    fn err_at(&self, line: u32, msg: &str) -> Abort {
        Abort::Error(CompileError::new(&self.file, line, msg))
    }

    // -----------------------------------------------------------------
    // Emission
    // -----------------------------------------------------------------

    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    fn emit(&mut self, b: u8) {
        self.code.push(b);
    }

    fn emit_u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i32(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn note_line(&mut self, line: u32) {
        if line != self.last_line {
            self.lines.push((self.here(), line));
            self.last_line = line;
        }
    }

    fn adjust(&mut self, delta: i32) {
        self.stack_pos += delta;
        if self.stack_pos > self.max_stack {
            self.max_stack = self.stack_pos;
        }
    }

    fn emit_const_int(&mut self, v: i32) {
        if let Some(op) = const_opcode(v) {
            self.emit(op);
        } else if (33..=255).contains(&v) {
            self.emit(BC_CONST_P8);
            self.emit(v as u8);
        } else if (-257..=-2).contains(&v) {
            self.emit(BC_CONST_N8);
            self.emit((-v - 1) as u8);
        } else if (256..=0xFFFF).contains(&v) {
            self.emit(BC_CONST_P16);
            self.emit_u16(v as u16);
        } else if (-0x10000..=-258).contains(&v) {
            self.emit(BC_CONST_N16);
            self.emit_u16((-v - 1) as u16);
        } else {
            self.emit(BC_CONST_I32);
            self.emit_i32(v);
        }
        self.adjust(1);
    }

    fn emit_const_value(&mut self, v: Value) {
        if v.is_ref {
            if v.data == 0 || v.is_float() {
                self.emit(BC_CONST_F32);
            } else {
                self.emit(BC_CONST_REF);
            }
            self.emit_i32(v.data);
            self.adjust(1);
        } else {
            self.emit_const_int(v.data);
        }
    }

    fn emit_load_slot(&mut self, s: i32) {
        let k = s - self.stack_pos - 1;
        if let Some(op) = load_opcode(k) {
            self.emit(op);
            self.adjust(1);
        } else {
            self.emit_const_int(k);
            self.emit(BC_LOADN);
        }
    }

    fn emit_store_slot(&mut self, s: i32) {
        let k = s - self.stack_pos;
        if let Some(op) = store_opcode(k) {
            self.emit(op);
            self.adjust(-1);
        } else {
            self.emit_const_int(k);
            self.emit(BC_STOREN);
            self.adjust(-2);
        }
    }

    fn emit_load_global(&mut self, slot: GlobalSlot) {
        self.emit(BC_LOAD_GLOBAL);
        match slot {
            GlobalSlot::Own(idx) => {
                self.global_patches.push((self.code.len(), idx));
                self.emit_u16(0);
            }
            GlobalSlot::Absolute(idx) => self.emit_u16(idx as u16),
        }
        self.adjust(1);
    }

    fn emit_store_global(&mut self, slot: GlobalSlot) {
        self.emit(BC_STORE_GLOBAL);
        match slot {
            GlobalSlot::Own(idx) => {
                self.global_patches.push((self.code.len(), idx));
                self.emit_u16(0);
            }
            GlobalSlot::Absolute(idx) => self.emit_u16(idx as u16),
        }
        self.adjust(-1);
    }

    /// Forward conditional branch (taken when the popped value is zero).
    /// Returns the patch position.
    fn emit_branch_fwd(&mut self) -> usize {
        let at = self.code.len();
        if self.long_jumps {
            self.emit(BC_BRANCH_LONG);
            self.emit_i32(0);
        } else {
            self.emit(BC_BRANCH0);
            self.emit(0);
        }
        self.adjust(-1);
        at
    }

    fn patch_branch_fwd(&mut self, at: usize, target: u32) -> PResult<()> {
        if self.code[at] == BC_BRANCH_LONG {
            let off = target as i64 - (at as i64 + 5);
            self.code[at + 1..at + 5].copy_from_slice(&(off as i32).to_le_bytes());
            return Ok(());
        }
        let off = target as i64 - (at as i64 + 2);
        if !(0..=MAX_SHORT_BRANCH as i64).contains(&off) {
            return Err(Abort::NeedLongJumps);
        }
        self.code[at] = BC_BRANCH0 + (off >> 8) as u8;
        self.code[at + 1] = (off & 0xFF) as u8;
        Ok(())
    }

    /// Forward unconditional jump placeholder (always long form).
    fn emit_jump_fwd(&mut self) -> usize {
        let at = self.code.len();
        self.emit(BC_JUMP_LONG);
        self.emit_i32(0);
        at
    }

    fn patch_jump_fwd(&mut self, at: usize, target: u32) {
        let off = target as i64 - (at as i64 + 5);
        self.code[at + 1..at + 5].copy_from_slice(&(off as i32).to_le_bytes());
    }

    /// Backward unconditional jump to a known target.
    fn emit_jump_back(&mut self, target: u32) -> PResult<()> {
        if self.long_jumps {
            let at = self.code.len() as i64;
            self.emit(BC_JUMP_LONG);
            self.emit_i32((target as i64 - (at + 5)) as i32);
            return Ok(());
        }
        let off = (self.code.len() as i64 + 2) - target as i64;
        if !(0..=MAX_SHORT_BRANCH as i64).contains(&off) {
            return Err(Abort::NeedLongJumps);
        }
        self.emit(BC_JUMP0 + (off >> 8) as u8);
        self.emit((off & 0xFF) as u8);
        Ok(())
    }

    fn emit_time_check(&mut self) {
        if self.heap.has_time_limit() {
            self.emit(BC_EXTENDED);
            self.emit(EXT_CHECK_TIME_LIMIT);
        }
    }

    // -----------------------------------------------------------------
    // Scopes
    // -----------------------------------------------------------------

    fn lookup_local(&self, name: &str) -> Option<i32> {
        for scope in self.scopes.iter().rev() {
            if let Some(&s) = scope.get(name) {
                return Some(s);
            }
        }
        None
    }

    fn lookup_global(&self, name: &str) -> Option<GlobalSlot> {
        if let Some(&idx) = self.global_map.get(name) {
            return Some(GlobalSlot::Own(idx));
        }
        for &imp in &self.imports {
            if let Some(&abs) = self.heap.script(imp).globals.get(name) {
                return Some(GlobalSlot::Absolute(abs));
            }
        }
        None
    }

    fn lookup_constant(&self, name: &str) -> Option<Value> {
        if let Some(&v) = self.constants.get(name) {
            return Some(v);
        }
        for &imp in &self.imports {
            if let Some(&v) = self.heap.script(imp).constants.get(name) {
                return Some(v);
            }
        }
        None
    }

    /// Bind `name` to a frame slot in the innermost scope.
    fn bind_local(&mut self, name: &str, line: u32, slot: i32) -> PResult<()> {
        let dup_msg = format!("duplicate variable '{}'", name);
        let Some(scope) = self.scopes.last_mut() else {
            return Err(self.err_at(line, "variable outside function"));
        };
        if scope.insert(name.to_string(), slot).is_some() {
            return Err(self.err_at(line, &dup_msg));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Top level
    // -----------------------------------------------------------------

    fn parse_program(&mut self) -> PResult<()> {
        while self.check("import") {
            self.parse_import()?;
        }
        while self.peek().is_some() {
            if self.check("const") {
                self.parse_const_decl()?;
            } else if self.check("var") {
                self.parse_global_var()?;
            } else if self.check("function") {
                self.parse_function()?;
            } else if self.check("use") {
                return Err(self.err_here("'use' must appear before any declarations"));
            } else if self.check("import") {
                return Err(self.err_here("'import' must appear before declarations"));
            } else {
                return Err(self.err_here("expected declaration"));
            }
        }
        Ok(())
    }

    fn parse_import(&mut self) -> PResult<()> {
        self.expect("import")?;
        let tok = self.advance()?;
        if tok.ty != TOK_STRING {
            return Err(self.err_at(tok.line, "expected script name after 'import'"));
        }
        let TokenValue::Str(name) = tok.value.clone() else {
            return Err(self.err_at(tok.line, "expected script name"));
        };
        let line = tok.line;
        let id = self
            .heap
            .load_script(&name)
            .map_err(|msg| self.err_at(line, &msg))?;
        self.imports.push(id);
        if self.accept("as") {
            let alias = self.advance()?;
            if alias.ty != TOK_IDENT {
                return Err(self.err_at(alias.line, "expected alias name"));
            }
            self.aliases.insert(alias.text(self.src).to_string(), id);
        }
        self.expect(";")?;
        Ok(())
    }

    fn parse_const_decl(&mut self) -> PResult<()> {
        self.expect("const")?;
        let tok = self.advance()?;
        if tok.ty != TOK_IDENT {
            return Err(self.err_at(tok.line, "expected constant name"));
        }
        let name = tok.text(self.src).to_string();
        let line = tok.line;
        self.expect("=")?;
        let value = self.parse_const_expr()?;
        self.expect(";")?;
        if self.constants.insert(name.clone(), value).is_some() {
            return Err(self.err_at(line, &format!("duplicate constant '{}'", name)));
        }
        // Object-valued constants (interned strings) already joined
        // const_roots when their literal was parsed.
        Ok(())
    }

    /// Evaluate a constant expression at compile time by parsing it and
    /// rolling back the emitted code.
    fn parse_const_expr(&mut self) -> PResult<Value> {
        let mark = self.code.len();
        let spos = self.stack_pos;
        let line = self.cur_line();
        let parsed = self.parse_ternary()?;
        self.code.truncate(mark);
        self.stack_pos = spos;
        match parsed.expr {
            Expr::Const(v) => Ok(v),
            Expr::Value => Err(self.err_at(line, "constant expression required")),
        }
    }

    fn parse_global_var(&mut self) -> PResult<()> {
        self.expect("var")?;
        loop {
            let tok = self.advance()?;
            if tok.ty != TOK_IDENT {
                return Err(self.err_at(tok.line, "expected variable name"));
            }
            let name = tok.text(self.src).to_string();
            let line = tok.line;
            if self.global_map.contains_key(&name) {
                return Err(self.err_at(line, &format!("duplicate variable '{}'", name)));
            }
            let idx = self.global_names.len();
            self.global_names.push(name.clone());
            self.global_map.insert(name, idx);
            if self.accept(",") {
                continue;
            }
            break;
        }
        self.expect(";")?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------

    fn parse_function(&mut self) -> PResult<()> {
        self.expect("function")?;
        let tok = self.advance()?;
        if tok.ty != TOK_IDENT {
            return Err(self.err_at(tok.line, "expected function name"));
        }
        let base_name = tok.text(self.src).to_string();
        let line = tok.line;
        self.expect("(")?;
        let mut params = Vec::new();
        if !self.check(")") {
            loop {
                let p = self.advance()?;
                if p.ty != TOK_IDENT {
                    return Err(self.err_at(p.line, "expected parameter name"));
                }
                params.push(p.text(self.src).to_string());
                if !self.accept(",") {
                    break;
                }
            }
        }
        self.expect(")")?;
        let mangled = format!("{}#{}", base_name, params.len());
        if self.func_map.contains_key(&mangled) {
            return Err(self.err_at(line, &format!("duplicate function '{}'", mangled)));
        }

        self.note_line(line);
        let offset = self.here();
        let check_stack_at = self.code.len();
        self.emit(BC_CHECK_STACK);
        self.emit_u16(0);

        let mut scope = FxHashMap::default();
        for (i, p) in params.iter().enumerate() {
            if scope.insert(p.clone(), i as i32 + 1).is_some() {
                return Err(self.err_at(line, &format!("duplicate parameter '{}'", p)));
            }
        }
        self.scopes.push(scope);
        self.stack_pos = params.len() as i32;
        self.max_stack = self.stack_pos;

        self.expect("{")?;
        while !self.check("}") {
            self.parse_statement()?;
        }
        self.expect("}")?;
        self.scopes.pop();

        // Implicit `return 0;`
        self.emit_const_int(0);
        self.emit(BC_RETURN);
        self.emit_u16((self.stack_pos - 1) as u16);
        self.adjust(-1);

        let reserve = (self.max_stack + 8).min(u16::MAX as i32) as u16;
        self.code[check_stack_at + 1..check_stack_at + 3].copy_from_slice(&reserve.to_le_bytes());

        self.write_switch_tables()?;

        let local_idx = self.funcs.len();
        self.funcs.push(LocalFunc {
            name: mangled.clone(),
            offset,
            num_params: params.len(),
        });
        self.func_map.insert(mangled, local_idx);
        self.stack_pos = 0;
        self.max_stack = 0;
        Ok(())
    }

    fn write_switch_tables(&mut self) -> PResult<()> {
        let pending = std::mem::take(&mut self.pending_switches);
        for sw in pending {
            while self.code.len() % 4 != 0 {
                self.emit(0);
            }
            let table_off = self.code.len();
            let end_pc = sw.default_pc.unwrap_or(0);
            let mut entries: Vec<(i32, i32)> = Vec::new();
            let mut cases = sw.cases;
            cases.sort_by_key(|&(lo, _, _)| lo);
            for w in cases.windows(2) {
                if w[0].1 >= w[1].0 {
                    return Err(self.err_at(0, "duplicate case value"));
                }
            }
            // Collapse contiguous same-target runs into ranges
            let mut i = 0;
            while i < cases.len() {
                let (lo, mut hi, pc) = cases[i];
                let mut j = i + 1;
                while j < cases.len() && cases[j].2 == pc && cases[j].0 as i64 == hi as i64 + 1 {
                    hi = cases[j].1;
                    j += 1;
                }
                if lo == hi {
                    entries.push((lo, pc as i32));
                } else {
                    entries.push((lo, -(pc as i32)));
                    entries.push((hi, 0));
                }
                i = j;
            }
            self.emit_i32(entries.len() as i32);
            self.emit_i32(end_pc as i32);
            for (v, t) in &entries {
                self.emit_i32(*v);
                self.emit_i32(*t);
            }
            self.tables.push(TableEntry {
                offset: table_off,
                count: entries.len(),
            });
            let off = table_off as i32;
            self.code[sw.imm_at..sw.imm_at + 4].copy_from_slice(&off.to_le_bytes());
            self.switch_imms.push(sw.imm_at);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------

    fn parse_statement(&mut self) -> PResult<()> {
        let line = self.cur_line();
        self.note_line(line);
        match self.peek_text() {
            "var" => self.parse_var_statement(),
            "if" => self.parse_if(),
            "while" => self.parse_while(),
            "do" => self.parse_do_while(),
            "for" => self.parse_for(),
            "switch" => self.parse_switch(),
            "break" => self.parse_break(),
            "continue" => self.parse_continue(),
            "return" => self.parse_return(),
            "{" => self.parse_block(),
            "(" if self.is_pair_assignment() => self.parse_pair_assignment(),
            ";" => {
                self.pos += 1;
                Ok(())
            }
            _ => {
                let spos = self.stack_pos;
                self.parse_assignment(false)?;
                while self.stack_pos > spos {
                    self.emit(BC_POP);
                    self.adjust(-1);
                }
                self.expect(";")?;
                Ok(())
            }
        }
    }

    fn parse_block(&mut self) -> PResult<()> {
        self.expect("{")?;
        let base = self.stack_pos;
        self.scopes.push(FxHashMap::default());
        while !self.check("}") {
            self.parse_statement()?;
        }
        self.expect("}")?;
        self.scopes.pop();
        self.emit_scope_unwind(base);
        Ok(())
    }

    /// Pop `n` runtime slots without changing the simulated position (for
    /// paths that leave the linear flow, like break and continue).
    fn emit_pops(&mut self, mut n: i32) {
        if n == 1 {
            self.emit(BC_POP);
            return;
        }
        while n > 0 {
            let chunk = n.min(255);
            self.emit(BC_POPN);
            self.emit(chunk as u8);
            n -= chunk;
        }
    }

    fn emit_scope_unwind(&mut self, base: i32) {
        let n = self.stack_pos - base;
        self.emit_pops(n);
        self.stack_pos = base;
    }

    fn parse_var_statement(&mut self) -> PResult<()> {
        self.expect("var")?;
        if self.check("(") {
            return self.parse_pair_var();
        }
        loop {
            let tok = self.advance()?;
            if tok.ty != TOK_IDENT {
                return Err(self.err_at(tok.line, "expected variable name"));
            }
            let name = tok.text(self.src).to_string();
            let line = tok.line;
            let slot = self.stack_pos + 1;
            if self.accept("=") {
                self.parse_assignment(true)?;
            } else {
                self.emit_const_int(0);
            }
            self.bind_local(&name, line, slot)?;
            if self.accept(",") {
                continue;
            }
            break;
        }
        self.expect(";")?;
        Ok(())
    }

    /// `var (r, e) = call(...);` binds the two-result pair of a protected
    /// call to fresh locals.
    fn parse_pair_var(&mut self) -> PResult<()> {
        self.expect("(")?;
        let r_tok = self.advance()?;
        let r_name = r_tok.text(self.src).to_string();
        let r_line = r_tok.line;
        self.expect(",")?;
        let e_tok = self.advance()?;
        let e_name = e_tok.text(self.src).to_string();
        let e_line = e_tok.line;
        self.expect(")")?;
        self.expect("=")?;
        let r_slot = self.stack_pos + 1;
        self.parse_call_expr(true)?;
        self.bind_local(&r_name, r_line, r_slot)?;
        self.bind_local(&e_name, e_line, r_slot + 1)?;
        self.expect(";")?;
        Ok(())
    }

    fn is_pair_assignment(&self) -> bool {
        self.peek_at(1).is_some_and(|t| t.ty == TOK_IDENT)
            && self.peek_at(2).is_some_and(|t| t.text(self.src) == ",")
            && self.peek_at(3).is_some_and(|t| t.ty == TOK_IDENT)
            && self.peek_at(4).is_some_and(|t| t.text(self.src) == ")")
            && self.peek_at(5).is_some_and(|t| t.text(self.src) == "=")
    }

    /// `(r, e) = call(...);` stores a two-result pair into existing places.
    fn parse_pair_assignment(&mut self) -> PResult<()> {
        self.expect("(")?;
        let r_tok = self.advance()?;
        let r_name = r_tok.text(self.src).to_string();
        let r_line = r_tok.line;
        self.expect(",")?;
        let e_tok = self.advance()?;
        let e_name = e_tok.text(self.src).to_string();
        let e_line = e_tok.line;
        self.expect(")")?;
        self.expect("=")?;
        self.parse_call_expr(true)?;
        // error on top, result below
        self.store_named(&e_name, e_line)?;
        self.store_named(&r_name, r_line)?;
        self.expect(";")?;
        Ok(())
    }

    fn store_named(&mut self, name: &str, line: u32) -> PResult<()> {
        if let Some(slot) = self.lookup_local(name) {
            self.emit_store_slot(slot);
            Ok(())
        } else if let Some(g) = self.lookup_global(name) {
            self.emit_store_global(g);
            Ok(())
        } else {
            Err(self.err_at(line, &format!("unknown variable '{}'", name)))
        }
    }

    fn parse_if(&mut self) -> PResult<()> {
        self.expect("if")?;
        self.expect("(")?;
        self.parse_expression()?;
        self.expect(")")?;
        let to_else = self.emit_branch_fwd();
        self.parse_statement()?;
        if self.check("else") {
            self.pos += 1;
            let to_end = self.emit_jump_fwd();
            let else_pc = self.here();
            self.patch_branch_fwd(to_else, else_pc)?;
            self.parse_statement()?;
            let end = self.here();
            self.patch_jump_fwd(to_end, end);
        } else {
            let end = self.here();
            self.patch_branch_fwd(to_else, end)?;
        }
        Ok(())
    }

    fn parse_while(&mut self) -> PResult<()> {
        self.expect("while")?;
        self.expect("(")?;
        let start = self.here();
        let mark = self.code.len();
        let spos = self.stack_pos;
        let cond = self.parse_expression()?;
        self.expect(")")?;
        // `while (1)` style constant conditions skip the test entirely
        let exit = match cond.expr {
            Expr::Const(v) if !v.is_null() => {
                self.code.truncate(mark);
                self.stack_pos = spos;
                None
            }
            _ => Some(self.emit_branch_fwd()),
        };
        self.loops.push(LoopCtx {
            break_patches: Vec::new(),
            continue_back: Some(start),
            continue_patches: Vec::new(),
            base_stack: self.stack_pos,
            is_switch: false,
        });
        self.parse_statement()?;
        self.emit_time_check();
        self.emit_jump_back(start)?;
        let end = self.here();
        if let Some(exit) = exit {
            self.patch_branch_fwd(exit, end)?;
        }
        self.finish_loop(end)?;
        Ok(())
    }

    fn parse_do_while(&mut self) -> PResult<()> {
        self.expect("do")?;
        let start = self.here();
        self.loops.push(LoopCtx {
            break_patches: Vec::new(),
            continue_back: None,
            continue_patches: Vec::new(),
            base_stack: self.stack_pos,
            is_switch: false,
        });
        self.parse_statement()?;
        let cond_pc = self.here();
        self.expect("while")?;
        self.expect("(")?;
        self.parse_expression()?;
        self.expect(")")?;
        self.expect(";")?;
        let exit = self.emit_branch_fwd();
        self.emit_time_check();
        self.emit_jump_back(start)?;
        let end = self.here();
        self.patch_branch_fwd(exit, end)?;
        // `continue` in a do-while re-tests the condition
        let ctx = self.loops.last_mut().expect("loop context");
        let continues = std::mem::take(&mut ctx.continue_patches);
        for at in continues {
            self.patch_jump_fwd(at, cond_pc);
        }
        self.finish_loop(end)?;
        Ok(())
    }

    fn parse_for(&mut self) -> PResult<()> {
        self.expect("for")?;
        self.expect("(")?;
        let base = self.stack_pos;
        self.scopes.push(FxHashMap::default());
        if !self.check(";") {
            if self.check("var") {
                self.parse_var_statement()?;
            } else {
                let spos = self.stack_pos;
                self.parse_assignment(false)?;
                while self.stack_pos > spos {
                    self.emit(BC_POP);
                    self.adjust(-1);
                }
                self.expect(";")?;
            }
        } else {
            self.expect(";")?;
        }
        let cond_pc = self.here();
        let exit = if !self.check(";") {
            self.parse_expression()?;
            Some(self.emit_branch_fwd())
        } else {
            None
        };
        self.expect(";")?;
        // The step clause runs after the body; buffer its tokens.
        let step_start = self.pos;
        let mut depth = 0usize;
        while let Some(t) = self.peek() {
            let text = t.text(self.src);
            if text == "(" {
                depth += 1;
            } else if text == ")" {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            self.pos += 1;
        }
        let step_end = self.pos;
        self.expect(")")?;
        self.loops.push(LoopCtx {
            break_patches: Vec::new(),
            continue_back: None,
            continue_patches: Vec::new(),
            base_stack: self.stack_pos,
            is_switch: false,
        });
        self.parse_statement()?;
        let step_pc = self.here();
        if step_end > step_start {
            let after = self.pos;
            self.pos = step_start;
            let spos = self.stack_pos;
            self.parse_assignment(false)?;
            while self.stack_pos > spos {
                self.emit(BC_POP);
                self.adjust(-1);
            }
            if self.pos != step_end {
                return Err(self.err_here("invalid for-loop step"));
            }
            self.pos = after;
        }
        self.emit_time_check();
        self.emit_jump_back(cond_pc)?;
        let end = self.here();
        if let Some(exit) = exit {
            self.patch_branch_fwd(exit, end)?;
        }
        let ctx = self.loops.last_mut().expect("loop context");
        let continues = std::mem::take(&mut ctx.continue_patches);
        for at in continues {
            self.patch_jump_fwd(at, step_pc);
        }
        self.finish_loop(end)?;
        self.scopes.pop();
        self.emit_scope_unwind(base);
        Ok(())
    }

    fn finish_loop(&mut self, end: u32) -> PResult<()> {
        let ctx = self.loops.pop().expect("loop context");
        for at in ctx.break_patches {
            self.patch_jump_fwd(at, end);
        }
        for at in ctx.continue_patches {
            match ctx.continue_back {
                Some(target) => {
                    // Backward continues were emitted directly; forward
                    // patches only exist for loops without a known target.
                    self.patch_jump_fwd(at, target);
                }
                None => return Err(self.err_at(0, "continue outside loop")),
            }
        }
        Ok(())
    }

    fn parse_break(&mut self) -> PResult<()> {
        self.expect("break")?;
        self.expect(";")?;
        let Some(idx) = self.loops.len().checked_sub(1) else {
            return Err(self.err_here("break outside loop"));
        };
        let base = self.loops[idx].base_stack;
        let n = self.stack_pos - base;
        self.emit_pops(n);
        let at = self.emit_jump_fwd();
        self.loops[idx].break_patches.push(at);
        Ok(())
    }

    fn parse_continue(&mut self) -> PResult<()> {
        self.expect("continue")?;
        self.expect(";")?;
        let Some(idx) = self.loops.iter().rposition(|l| !l.is_switch) else {
            return Err(self.err_here("continue outside loop"));
        };
        let base = self.loops[idx].base_stack;
        let n = self.stack_pos - base;
        self.emit_pops(n);
        if let Some(target) = self.loops[idx].continue_back {
            self.emit_time_check();
            self.emit_jump_back(target)?;
        } else {
            let at = self.emit_jump_fwd();
            self.loops[idx].continue_patches.push(at);
        }
        Ok(())
    }

    fn parse_return(&mut self) -> PResult<()> {
        self.expect("return")?;
        let spos = self.stack_pos;
        if self.accept(";") {
            self.emit_const_int(0);
            self.emit(BC_RETURN);
            self.emit_u16((self.stack_pos - 1) as u16);
        } else {
            self.parse_expression()?;
            if self.accept(",") {
                self.parse_expression()?;
                self.emit(BC_RETURN2);
                self.emit_u16((self.stack_pos - 1) as u16);
            } else {
                self.emit(BC_RETURN);
                self.emit_u16((self.stack_pos - 1) as u16);
            }
            self.expect(";")?;
        }
        self.stack_pos = spos;
        Ok(())
    }

    fn parse_switch(&mut self) -> PResult<()> {
        self.expect("switch")?;
        self.expect("(")?;
        self.parse_expression()?;
        self.expect(")")?;
        self.emit(BC_SWITCH);
        let imm_at = self.code.len();
        self.emit_i32(0);
        self.adjust(-1);
        let mut sw = PendingSwitch {
            imm_at,
            cases: Vec::new(),
            default_pc: None,
        };
        self.loops.push(LoopCtx {
            break_patches: Vec::new(),
            continue_back: None,
            continue_patches: Vec::new(),
            base_stack: self.stack_pos,
            is_switch: true,
        });
        self.expect("{")?;
        let mut saw_label = false;
        while !self.check("}") {
            if self.check("case") {
                self.pos += 1;
                let line = self.cur_line();
                let lo = self.parse_case_value()?;
                let hi = if self.accept("..") {
                    self.parse_case_value()?
                } else {
                    lo
                };
                if hi < lo {
                    return Err(self.err_at(line, "invalid case range"));
                }
                self.expect(":")?;
                sw.cases.push((lo, hi, self.here()));
                saw_label = true;
                continue;
            }
            if self.check("default") {
                self.pos += 1;
                self.expect(":")?;
                sw.default_pc = Some(self.here());
                saw_label = true;
                continue;
            }
            if !saw_label {
                return Err(self.err_here("expected 'case' or 'default'"));
            }
            self.parse_statement()?;
        }
        self.expect("}")?;
        let end = self.here();
        if sw.default_pc.is_none() {
            sw.default_pc = Some(end);
        }
        let ctx = self.loops.pop().expect("switch context");
        for at in ctx.break_patches {
            self.patch_jump_fwd(at, end);
        }
        if !ctx.continue_patches.is_empty() {
            return Err(self.err_here("continue inside switch without a loop"));
        }
        self.pending_switches.push(sw);
        Ok(())
    }

    fn parse_case_value(&mut self) -> PResult<i32> {
        let line = self.cur_line();
        let v = self.parse_const_expr()?;
        if !v.is_int() {
            return Err(self.err_at(line, "integer case value required"));
        }
        Ok(v.data)
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    fn parse_expression(&mut self) -> PResult<Parsed> {
        self.parse_assignment(true)
    }

    fn parse_assignment(&mut self, need_value: bool) -> PResult<Parsed> {
        let mark = self.code.len();
        let spos = self.stack_pos;
        let parsed = self.parse_ternary()?;
        let op_text = self.peek_text();
        let is_assign = matches!(
            op_text,
            "=" | "+=" | "-=" | "*=" | "/=" | "%=" | "&=" | "|=" | "^=" | "<<=" | ">>=" | ">>>="
        );
        if !is_assign {
            return Ok(parsed);
        }
        let line = self.cur_line();
        self.pos += 1;
        match parsed.place {
            Place::Local(slot) => {
                self.code.truncate(mark);
                self.stack_pos = spos;
                if op_text == "=" {
                    self.parse_assignment(true)?;
                } else {
                    self.emit_load_slot(slot);
                    let rhs = self.parse_assignment(true)?;
                    // `x += 1` compiles to the tight in-place form when the
                    // slot offset fits a signed byte.
                    if !need_value
                        && rhs.expr == Expr::Const(Value::int(1))
                        && matches!(op_text, "+=" | "-=")
                    {
                        self.code.truncate(mark);
                        self.stack_pos = spos;
                        let k = slot - self.stack_pos - 1;
                        if (-128..=-1).contains(&k) {
                            self.emit(if op_text == "+=" { BC_INC } else { BC_DEC });
                            self.emit(k as u8);
                            return Ok(Parsed::value());
                        }
                        self.emit_load_slot(slot);
                        self.emit_const_int(1);
                    }
                    self.emit(compound_opcode(op_text, self.float_mode));
                    self.adjust(-1);
                }
                self.emit_store_slot(slot);
                if need_value {
                    self.emit_load_slot(slot);
                    Ok(Parsed {
                        expr: Expr::Value,
                        place: Place::Local(slot),
                    })
                } else {
                    Ok(Parsed::value())
                }
            }
            Place::Global(g) => {
                self.code.truncate(mark);
                self.stack_pos = spos;
                if op_text != "=" {
                    self.emit_load_global(g);
                }
                self.parse_assignment(true)?;
                if op_text != "=" {
                    self.emit(compound_opcode(op_text, self.float_mode));
                    self.adjust(-1);
                }
                self.emit_store_global(g);
                if need_value {
                    self.emit_load_global(g);
                }
                Ok(Parsed::value())
            }
            Place::ArrayElem | Place::HashElem => {
                if need_value {
                    return Err(self.err_at(line, "element assignment cannot be used as a value"));
                }
                let (get_op, set_op) = if parsed.place == Place::ArrayElem {
                    (BC_ARRAY_GET, BC_ARRAY_SET)
                } else {
                    (BC_HASH_GET, BC_HASH_SET)
                };
                // The trailing get opcode was just emitted; the container
                // and key are still described by the preceding code.
                debug_assert_eq!(self.code.last(), Some(&get_op));
                self.code.pop();
                self.adjust(1);
                if op_text == "=" {
                    self.parse_assignment(true)?;
                } else {
                    // container, key -> duplicate both, fetch, modify
                    self.emit_const_int(-2);
                    self.emit(BC_LOADN);
                    self.emit_const_int(-2);
                    self.emit(BC_LOADN);
                    self.emit(get_op);
                    self.adjust(-1);
                    self.parse_assignment(true)?;
                    self.emit(compound_opcode(op_text, self.float_mode));
                    self.adjust(-1);
                }
                self.emit(set_op);
                self.adjust(-3);
                Ok(Parsed::value())
            }
            Place::None => Err(self.err_at(line, "invalid assignment target")),
        }
    }

    fn parse_ternary(&mut self) -> PResult<Parsed> {
        let cond = self.parse_binary(0)?;
        if !self.check("?") {
            return Ok(cond);
        }
        self.pos += 1;
        let to_else = self.emit_branch_fwd();
        self.parse_ternary()?;
        self.expect(":")?;
        let to_end = self.emit_jump_fwd();
        let else_pc = self.here();
        self.patch_branch_fwd(to_else, else_pc)?;
        // Both arms leave one value; simulate the second arm from the
        // shared starting depth.
        self.adjust(-1);
        self.parse_ternary()?;
        let end = self.here();
        self.patch_jump_fwd(to_end, end);
        Ok(Parsed::value())
    }

    fn parse_binary(&mut self, level: usize) -> PResult<Parsed> {
        const LEVELS: &[&[&str]] = &[
            &["||"],
            &["&&"],
            &["|"],
            &["^"],
            &["&"],
            &["==", "!=", "===", "!=="],
            &["<", "<=", ">", ">="],
            &["<<", ">>", ">>>"],
            &["+", "-"],
            &["*", "/", "%"],
        ];
        if level >= LEVELS.len() {
            return self.parse_unary();
        }
        let mark = self.code.len();
        let spos = self.stack_pos;
        let mut lhs = self.parse_binary(level + 1)?;
        loop {
            let op = self.peek_text();
            if !LEVELS[level].contains(&op) {
                return Ok(lhs);
            }
            self.pos += 1;
            if op == "||" || op == "&&" {
                lhs = self.parse_logical(op, level)?;
                continue;
            }
            let rhs = self.parse_binary(level + 1)?;
            if let (Expr::Const(a), Expr::Const(b)) = (lhs.expr, rhs.expr)
                && let Some(folded) = fold_binop(op, a, b, self.float_mode)
            {
                self.code.truncate(mark);
                self.stack_pos = spos;
                self.emit_const_value(folded);
                lhs = Parsed::konst(folded);
                continue;
            }
            self.emit(binary_opcode(op, self.float_mode));
            self.adjust(-1);
            lhs = Parsed::value();
        }
    }

    /// Short-circuit `&&` / `||`, normalising the result to 0 or 1. The
    /// left operand is already on the stack.
    fn parse_logical(&mut self, op: &str, level: usize) -> PResult<Parsed> {
        if op == "&&" {
            let to_false = self.emit_branch_fwd();
            self.parse_binary(level + 1)?;
            let to_false2 = self.emit_branch_fwd();
            self.emit_const_int(1);
            let to_end = self.emit_jump_fwd();
            let false_pc = self.here();
            self.patch_branch_fwd(to_false, false_pc)?;
            self.patch_branch_fwd(to_false2, false_pc)?;
            self.adjust(-1);
            self.emit_const_int(0);
            let end = self.here();
            self.patch_jump_fwd(to_end, end);
        } else {
            // a || b: branch-if-zero over the short-circuit exit
            let to_try_b = self.emit_branch_fwd();
            self.emit_const_int(1);
            let to_end = self.emit_jump_fwd();
            let try_b = self.here();
            self.patch_branch_fwd(to_try_b, try_b)?;
            self.adjust(-1);
            self.parse_binary(level + 1)?;
            let to_false = self.emit_branch_fwd();
            self.emit_const_int(1);
            let to_end2 = self.emit_jump_fwd();
            let false_pc = self.here();
            self.patch_branch_fwd(to_false, false_pc)?;
            self.adjust(-1);
            self.emit_const_int(0);
            let end = self.here();
            self.patch_jump_fwd(to_end, end);
            self.patch_jump_fwd(to_end2, end);
        }
        Ok(Parsed::value())
    }

    fn parse_unary(&mut self) -> PResult<Parsed> {
        let op = self.peek_text();
        match op {
            "-" => {
                self.pos += 1;
                let mark = self.code.len();
                let spos = self.stack_pos;
                let operand = self.parse_unary()?;
                if let Expr::Const(v) = operand.expr {
                    let folded = if v.is_float() {
                        Some(Value::float(-v.as_float()))
                    } else {
                        v.data.checked_neg().map(Value::int)
                    };
                    if let Some(f) = folded {
                        self.code.truncate(mark);
                        self.stack_pos = spos;
                        self.emit_const_value(f);
                        return Ok(Parsed::konst(f));
                    }
                }
                self.emit(BC_NEG);
                Ok(Parsed::value())
            }
            "!" => {
                self.pos += 1;
                let mark = self.code.len();
                let spos = self.stack_pos;
                let operand = self.parse_unary()?;
                if let Expr::Const(v) = operand.expr {
                    self.code.truncate(mark);
                    self.stack_pos = spos;
                    let f = Value::int(v.is_null() as i32);
                    self.emit_const_value(f);
                    return Ok(Parsed::konst(f));
                }
                self.emit(BC_NOT);
                Ok(Parsed::value())
            }
            "~" => {
                self.pos += 1;
                let mark = self.code.len();
                let spos = self.stack_pos;
                let operand = self.parse_unary()?;
                if let Expr::Const(v) = operand.expr
                    && v.is_int()
                {
                    self.code.truncate(mark);
                    self.stack_pos = spos;
                    let f = Value::int(!v.data);
                    self.emit_const_value(f);
                    return Ok(Parsed::konst(f));
                }
                self.emit(BC_BITNOT);
                Ok(Parsed::value())
            }
            "++" | "--" => {
                self.pos += 1;
                let line = self.cur_line();
                let inc = op == "++";
                let tok = self.advance()?;
                if tok.ty != TOK_IDENT {
                    return Err(self.err_at(line, "invalid increment target"));
                }
                let name = tok.text(self.src).to_string();
                if let Some(slot) = self.lookup_local(&name) {
                    self.emit_incdec_slot(slot, inc);
                    self.emit_load_slot(slot);
                    return Ok(Parsed {
                        expr: Expr::Value,
                        place: Place::Local(slot),
                    });
                }
                if let Some(g) = self.lookup_global(&name) {
                    self.emit_load_global(g);
                    self.emit_const_int(1);
                    self.emit(if inc { BC_ADD } else { BC_SUB });
                    self.adjust(-1);
                    self.emit_store_global(g);
                    self.emit_load_global(g);
                    return Ok(Parsed::value());
                }
                Err(self.err_at(line, "invalid increment target"))
            }
            _ => self.parse_postfix(),
        }
    }

    fn emit_incdec_slot(&mut self, slot: i32, inc: bool) {
        let k = slot - self.stack_pos - 1;
        if (-128..=-1).contains(&k) {
            self.emit(if inc { BC_INC } else { BC_DEC });
            self.emit(k as u8);
        } else {
            self.emit_load_slot(slot);
            self.emit_const_int(1);
            self.emit(if inc { BC_ADD } else { BC_SUB });
            self.adjust(-1);
            self.emit_store_slot(slot);
        }
    }

    fn parse_postfix(&mut self) -> PResult<Parsed> {
        let mut parsed = self.parse_primary()?;
        loop {
            match self.peek_text() {
                "[" => {
                    self.pos += 1;
                    if self.check("]") {
                        // `a[] = v` append form, valid as a statement only
                        self.pos += 1;
                        self.expect("=")?;
                        self.parse_assignment(true)?;
                        self.emit(BC_ARRAY_APPEND);
                        self.adjust(-2);
                        return Ok(Parsed::value());
                    }
                    self.parse_expression()?;
                    self.expect("]")?;
                    self.emit(BC_ARRAY_GET);
                    self.adjust(-1);
                    parsed = Parsed {
                        expr: Expr::Value,
                        place: Place::ArrayElem,
                    };
                }
                "{" => {
                    self.pos += 1;
                    self.parse_expression()?;
                    self.expect("}")?;
                    self.emit(BC_HASH_GET);
                    self.adjust(-1);
                    parsed = Parsed {
                        expr: Expr::Value,
                        place: Place::HashElem,
                    };
                }
                "(" => {
                    // Dynamic call through the value already on the stack
                    let marker = self.stack_pos - 1;
                    let nargs = self.parse_call_args()?;
                    self.emit(BC_CALL_DYNAMIC);
                    self.emit(nargs as u8);
                    self.stack_pos = marker;
                    self.adjust(1);
                    parsed = Parsed::value();
                }
                "++" | "--" => {
                    let inc = self.check("++");
                    self.pos += 1;
                    match parsed.place {
                        Place::Local(slot) => {
                            // Value already loaded; mutate the slot after
                            self.emit_incdec_slot(slot, inc);
                            parsed = Parsed::value();
                        }
                        _ => return Err(self.err_here("invalid increment target")),
                    }
                }
                _ => return Ok(parsed),
            }
        }
    }

    fn parse_call_args(&mut self) -> PResult<usize> {
        self.expect("(")?;
        let mut nargs = 0usize;
        if !self.check(")") {
            loop {
                self.parse_expression()?;
                nargs += 1;
                if !self.accept(",") {
                    break;
                }
            }
        }
        self.expect(")")?;
        Ok(nargs)
    }

    /// Named or dynamic call expression. With `call2` the protected
    /// (two-result) protocol is used and the pair stays on the stack.
    fn parse_call_expr(&mut self, call2: bool) -> PResult<Parsed> {
        let tok = self.advance()?;
        if tok.ty != TOK_IDENT {
            return Err(self.err_at(tok.line, "expected function call"));
        }
        let name = tok.text(self.src).to_string();
        let line = tok.line;
        if let Some(slot) = self.lookup_local(&name) {
            self.emit_load_slot(slot);
            return self.finish_dynamic_call(call2);
        }
        if let Some(g) = self.lookup_global(&name) {
            self.emit_load_global(g);
            return self.finish_dynamic_call(call2);
        }
        if let Some(&alias_id) = self.aliases.get(&name) {
            self.expect(":")?;
            let f = self.advance()?;
            if f.ty != TOK_IDENT {
                return Err(self.err_at(f.line, "expected function name after ':'"));
            }
            let fname = f.text(self.src).to_string();
            return self.emit_qualified_call(alias_id, &fname, line, call2);
        }
        self.emit_named_call(&name, line, call2)
    }

    fn finish_dynamic_call(&mut self, call2: bool) -> PResult<Parsed> {
        let marker = self.stack_pos - 1;
        let nargs = self.parse_call_args()?;
        self.emit(if call2 { BC_CALL2_DYNAMIC } else { BC_CALL_DYNAMIC });
        self.emit(nargs as u8);
        if call2 {
            self.emit(BC_CLEAN_CALL2);
        }
        self.stack_pos = marker;
        self.adjust(if call2 { 2 } else { 1 });
        Ok(Parsed::value())
    }

    fn emit_named_call(&mut self, name: &str, line: u32, call2: bool) -> PResult<Parsed> {
        let marker = self.stack_pos;
        // Patchable marker constant; resolution may rewrite the opcode
        self.emit(BC_CONST_I32);
        let const_at = self.code.len();
        self.emit_i32(0);
        self.adjust(1);
        let nargs = self.parse_call_args()?;
        let opcode_at = self.code.len();
        self.emit(if call2 { BC_CALL2_DIRECT } else { BC_CALL_DIRECT });
        self.emit(nargs as u8);
        if call2 {
            self.emit(BC_CLEAN_CALL2);
        }
        self.call_patches.push(CallPatch {
            const_at,
            opcode_at,
            name: format!("{}#{}", name, nargs),
            line,
            kind: PatchKind::CallTarget,
        });
        self.stack_pos = marker;
        self.adjust(if call2 { 2 } else { 1 });
        Ok(Parsed::value())
    }

    fn emit_qualified_call(
        &mut self,
        script_id: usize,
        fname: &str,
        line: u32,
        call2: bool,
    ) -> PResult<Parsed> {
        let marker = self.stack_pos;
        self.emit(BC_CONST_I32);
        let const_at = self.code.len();
        self.emit_i32(0);
        self.adjust(1);
        let nargs = self.parse_call_args()?;
        let mangled = format!("{}#{}", fname, nargs);
        let fid = self
            .heap
            .script(script_id)
            .functions
            .get(&mangled)
            .copied()
            .ok_or_else(|| self.err_at(line, &format!("unknown function '{}'", mangled)))?;
        self.code[const_at..const_at + 4].copy_from_slice(&(fid as i32).to_le_bytes());
        self.emit(if call2 { BC_CALL2_DIRECT } else { BC_CALL_DIRECT });
        self.emit(nargs as u8);
        if call2 {
            self.emit(BC_CLEAN_CALL2);
        }
        self.stack_pos = marker;
        self.adjust(if call2 { 2 } else { 1 });
        Ok(Parsed::value())
    }

    fn parse_primary(&mut self) -> PResult<Parsed> {
        let Some(tok) = self.peek() else {
            return Err(self.err_here("unexpected end of file"));
        };
        match tok.ty {
            TOK_NUMBER | TOK_HEX_NUMBER | TOK_CHAR => {
                let TokenValue::Int(v) = tok.value.clone() else {
                    return Err(self.err_here("invalid number"));
                };
                self.pos += 1;
                let value = if self.float_mode && tok.ty == TOK_NUMBER {
                    Value::float(v as f32)
                } else {
                    Value::int(v)
                };
                self.emit_const_value(value);
                Ok(Parsed::konst(value))
            }
            TOK_FLOAT_NUMBER => {
                let TokenValue::Float(v) = tok.value.clone() else {
                    return Err(self.err_here("invalid float"));
                };
                self.pos += 1;
                let value = Value::float(v);
                self.emit_const_value(value);
                Ok(Parsed::konst(value))
            }
            TOK_STRING => {
                let TokenValue::Str(s) = tok.value.clone() else {
                    return Err(self.err_here("invalid string"));
                };
                let line = tok.line;
                self.pos += 1;
                let v = self
                    .heap
                    .create_const_string(&s)
                    .map_err(|e| self.err_at(line, &e.to_string()))?;
                // Pinned until install hands ownership to the script roots
                self.heap.add_ref(v);
                self.const_roots.push(v);
                self.emit(BC_CONST_REF);
                self.emit_i32(v.data);
                self.adjust(1);
                Ok(Parsed::konst(v))
            }
            TOK_FUNC_REF => {
                let text = tok.text(self.src).to_string();
                let line = tok.line;
                self.pos += 1;
                self.emit(BC_CONST_REF);
                let const_at = self.code.len();
                self.emit_i32(0);
                self.adjust(1);
                self.call_patches.push(CallPatch {
                    const_at,
                    opcode_at: 0,
                    name: text,
                    line,
                    kind: PatchKind::FuncRefValue,
                });
                Ok(Parsed::value())
            }
            TOK_KEYWORD if tok.text(self.src) == "null" => {
                self.pos += 1;
                self.emit_const_int(0);
                Ok(Parsed::konst(Value::ZERO))
            }
            TOK_SYMBOL if tok.text(self.src) == "(" => {
                self.pos += 1;
                let inner = self.parse_expression()?;
                self.expect(")")?;
                Ok(Parsed {
                    expr: inner.expr,
                    place: Place::None,
                })
            }
            TOK_SYMBOL if tok.text(self.src) == "{" => self.parse_extended_literal(),
            TOK_IDENT => self.parse_ident_expr(),
            _ => Err(self.err_here("unexpected token")),
        }
    }

    fn parse_ident_expr(&mut self) -> PResult<Parsed> {
        let tok = self.advance()?;
        let name = tok.text(self.src).to_string();
        let line = tok.line;
        if let Some(slot) = self.lookup_local(&name) {
            if self.check("(") {
                self.emit_load_slot(slot);
                return self.finish_dynamic_call(false);
            }
            self.emit_load_slot(slot);
            return Ok(Parsed {
                expr: Expr::Value,
                place: Place::Local(slot),
            });
        }
        if let Some(&alias_id) = self.aliases.get(&name)
            && self.check(":")
        {
            self.pos += 1;
            let f = self.advance()?;
            let fname = f.text(self.src).to_string();
            if f.ty == TOK_IDENT && self.check("(") {
                return self.emit_qualified_call(alias_id, &fname, line, false);
            }
            if let Some(&v) = self.heap.script(alias_id).constants.get(&fname) {
                self.emit_const_value(v);
                return Ok(Parsed::konst(v));
            }
            return Err(self.err_at(line, &format!("unknown qualified name '{}'", fname)));
        }
        if let Some(v) = self.lookup_constant(&name) {
            self.emit_const_value(v);
            return Ok(Parsed::konst(v));
        }
        if let Some(g) = self.lookup_global(&name) {
            if self.check("(") {
                self.emit_load_global(g);
                return self.finish_dynamic_call(false);
            }
            self.emit_load_global(g);
            return Ok(Parsed {
                expr: Expr::Value,
                place: Place::Global(g),
            });
        }
        if self.check("(") {
            return self.emit_named_call(&name, line, false);
        }
        Err(self.err_at(line, &format!("unknown identifier '{}'", name)))
    }

    // -----------------------------------------------------------------
    // Extended `{ ... }` forms
    // -----------------------------------------------------------------

    /// Classify the brace form by scanning ahead at bracket depth zero:
    /// a leading `=` builds a string, a top-level `,` builds an array, a
    /// top-level `:` builds a hash, anything else is a float expression
    /// island. `{}` is the empty hash.
    fn classify_braces(&self) -> BraceKind {
        let mut depth = 0usize;
        let mut i = self.pos + 1;
        if self
            .tokens
            .get(i)
            .is_some_and(|t| t.text(self.src) == "}")
        {
            return BraceKind::Hash;
        }
        if self
            .tokens
            .get(i)
            .is_some_and(|t| t.text(self.src) == "=")
        {
            return BraceKind::StringBuild;
        }
        let mut kind = BraceKind::Float;
        let mut ternaries = 0usize;
        while let Some(t) = self.tokens.get(i) {
            match t.text(self.src) {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" => depth = depth.saturating_sub(1),
                "}" => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                "," if depth == 0 => {
                    if kind == BraceKind::Float {
                        kind = BraceKind::Array;
                    }
                }
                // A ternary consumes its own ':'
                "?" if depth == 0 => ternaries += 1,
                ":" if depth == 0 => {
                    if ternaries > 0 {
                        ternaries -= 1;
                    } else if kind == BraceKind::Float || kind == BraceKind::Array {
                        kind = BraceKind::Hash;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        kind
    }

    fn parse_extended_literal(&mut self) -> PResult<Parsed> {
        let kind = self.classify_braces();
        self.expect("{")?;
        match kind {
            BraceKind::Float => {
                let saved = self.float_mode;
                self.float_mode = true;
                let r = self.parse_expression();
                self.float_mode = saved;
                r?;
                self.expect("}")?;
                Ok(Parsed::value())
            }
            BraceKind::StringBuild => {
                self.expect("=")?;
                let mut count = 0usize;
                if !self.check("}") {
                    loop {
                        self.parse_expression()?;
                        count += 1;
                        if !self.accept(",") {
                            break;
                        }
                    }
                }
                self.expect("}")?;
                self.emit(BC_CREATE_STRING);
                self.emit_u16(count as u16);
                self.adjust(1 - count as i32);
                Ok(Parsed::value())
            }
            BraceKind::Array => {
                let mut batched = 0usize;
                let mut overflowed = false;
                if !self.check("}") {
                    loop {
                        if batched == MAX_IMMEDIATE_STACK && !overflowed {
                            // Fold the first batch, then append the tail
                            self.emit(BC_CREATE_ARRAY);
                            self.emit_u16(batched as u16);
                            self.adjust(1 - batched as i32);
                            overflowed = true;
                        }
                        if overflowed {
                            self.emit_const_int(-1);
                            self.emit(BC_LOADN);
                            self.parse_expression()?;
                            self.emit(BC_ARRAY_APPEND);
                            self.adjust(-2);
                        } else {
                            self.parse_expression()?;
                            batched += 1;
                        }
                        if !self.accept(",") {
                            break;
                        }
                    }
                }
                self.expect("}")?;
                if !overflowed {
                    self.emit(BC_CREATE_ARRAY);
                    self.emit_u16(batched as u16);
                    self.adjust(1 - batched as i32);
                }
                Ok(Parsed::value())
            }
            BraceKind::Hash => {
                let mut pairs = 0usize;
                let mut overflowed = false;
                if !self.check("}") {
                    loop {
                        if pairs * 2 == MAX_IMMEDIATE_STACK && !overflowed {
                            self.emit(BC_CREATE_HASH);
                            self.emit_u16(pairs as u16);
                            self.adjust(1 - pairs as i32 * 2);
                            overflowed = true;
                        }
                        if overflowed {
                            self.emit_const_int(-1);
                            self.emit(BC_LOADN);
                            self.parse_expression()?;
                            self.expect(":")?;
                            self.parse_expression()?;
                            self.emit(BC_HASH_SET);
                            self.adjust(-3);
                        } else {
                            self.parse_expression()?;
                            self.expect(":")?;
                            self.parse_expression()?;
                            pairs += 1;
                        }
                        if !self.accept(",") {
                            break;
                        }
                    }
                }
                self.expect("}")?;
                if !overflowed {
                    self.emit(BC_CREATE_HASH);
                    self.emit_u16(pairs as u16);
                    self.adjust(1 - pairs as i32 * 2);
                }
                Ok(Parsed::value())
            }
        }
    }

    // -----------------------------------------------------------------
    // Installation
    // -----------------------------------------------------------------

    fn install(mut self) -> Result<usize, CompileError> {
        // Keep bytecode 4-aligned so switch tables align process-wide
        let misalign = self.heap.bytecode().len() % 4;
        if misalign != 0 {
            let pad = vec![0u8; 4 - misalign];
            self.heap
                .append_bytecode(&pad)
                .map_err(|e| CompileError::new(&self.file, 0, &e.to_string()))?;
        }
        let base = self.heap.bytecode().len() as u32;
        let sid = self.heap.register_script(Script::new(&self.file));
        match self.install_body(base, sid) {
            Ok(()) => Ok(sid),
            Err(e) => {
                // Quarantine the half-registered script so the name stays
                // available for a corrected compile.
                let failed = format!("{}#failed_{}", self.file, sid);
                self.heap.rename_script(sid, failed);
                self.abandon();
                Err(e)
            }
        }
    }

    fn install_body(&mut self, base: u32, sid: usize) -> Result<(), CompileError> {
        let func_base = self.heap.functions().len();
        for f in &self.funcs {
            self.heap.add_function(fixscript_runtime::Function {
                name: f.name.clone(),
                script: sid,
                addr: base + f.offset,
                num_params: f.num_params,
            });
        }

        // Global slots
        let mut global_slots = Vec::with_capacity(self.global_names.len());
        for _ in &self.global_names {
            let slot = self
                .heap
                .alloc_global()
                .map_err(|e| CompileError::new(&self.file, 0, &e.to_string()))?;
            global_slots.push(slot);
        }
        for (pos, local_idx) in &self.global_patches {
            let slot = global_slots[*local_idx];
            if slot > u16::MAX as usize {
                return Err(CompileError::new(&self.file, 0, "too many script variables"));
            }
            self.code[*pos..*pos + 2].copy_from_slice(&(slot as u16).to_le_bytes());
        }

        // Call and function-reference patches. Unresolved call targets get
        // a placeholder native that raises when invoked, so missing natives
        // surface at run time rather than blocking compilation.
        for i in 0..self.call_patches.len() {
            let (kind, name, line, const_at, opcode_at) = {
                let p = &self.call_patches[i];
                (p.kind, p.name.clone(), p.line, p.const_at, p.opcode_at)
            };
            let target = match self.resolve_patch(&name, kind, func_base) {
                Some(t) => t,
                None if kind == PatchKind::CallTarget => {
                    let missing = name.clone();
                    self.heap.register_native(&name, move |heap, _args| {
                        let msg = format!("native function {} not present", missing);
                        match heap.create_string(&msg) {
                            Ok(s) => NativeResult::Error(s),
                            Err(_) => NativeResult::Error(Value::ZERO),
                        }
                    });
                    ResolvedCall::Native(
                        self.heap.find_native(&name).expect("placeholder native"),
                    )
                }
                None => {
                    return Err(CompileError::new(
                        &self.file,
                        line,
                        &format!("unknown function '{}'", name),
                    ));
                }
            };
            match target {
                ResolvedCall::Script(fid) => {
                    let value = match kind {
                        PatchKind::CallTarget => fid as i32,
                        PatchKind::FuncRefValue => FUNC_REF_OFFSET + fid as i32,
                    };
                    self.code[const_at..const_at + 4].copy_from_slice(&value.to_le_bytes());
                }
                ResolvedCall::Native(id) => {
                    self.code[const_at..const_at + 4].copy_from_slice(&(id as i32).to_le_bytes());
                    let op = self.code[opcode_at];
                    self.code[opcode_at] = if op == BC_CALL2_DIRECT {
                        BC_CALL2_NATIVE
                    } else {
                        BC_CALL_NATIVE
                    };
                }
            }
        }

        // Relocate switch tables to absolute offsets
        for &imm_at in &self.switch_imms {
            let old = i32::from_le_bytes(self.code[imm_at..imm_at + 4].try_into().unwrap());
            let new = old + base as i32;
            self.code[imm_at..imm_at + 4].copy_from_slice(&new.to_le_bytes());
        }
        for table in &self.tables {
            let def_at = table.offset + 4;
            reloc_i32(&mut self.code, def_at, base as i32);
            for i in 0..table.count {
                let target_at = table.offset + 12 + i * 8;
                let t = i32::from_le_bytes(self.code[target_at..target_at + 4].try_into().unwrap());
                let nt = match t.cmp(&0) {
                    std::cmp::Ordering::Greater => t + base as i32,
                    std::cmp::Ordering::Less => t - base as i32,
                    std::cmp::Ordering::Equal => 0,
                };
                self.code[target_at..target_at + 4].copy_from_slice(&nt.to_le_bytes());
            }
        }

        let code_len = self.code.len() as u32;
        self.heap
            .append_bytecode(&self.code)
            .map_err(|e| CompileError::new(&self.file, 0, &e.to_string()))?;

        let script = self.heap.script_mut(sid);
        script.code_range = (base, base + code_len);
        script.line_table = self.lines.iter().map(|&(pc, l)| (pc + base, l)).collect();
        script.imports = self.imports.clone();
        script.constants = self.constants.clone();
        script.const_roots = self.const_roots.clone();
        for (i, f) in self.funcs.iter().enumerate() {
            script.functions.insert(f.name.clone(), func_base + i);
        }
        for (name, idx) in &self.global_map {
            script.globals.insert(name.clone(), global_slots[*idx]);
        }
        // The script's root list owns the interned constants now.
        for v in std::mem::take(&mut self.const_roots) {
            self.heap.unref(v);
        }
        Ok(())
    }

    /// Release parse-time pins after a failed compilation.
    fn abandon(&mut self) {
        for v in std::mem::take(&mut self.const_roots) {
            self.heap.unref(v);
        }
    }

    fn resolve_patch(&self, name: &str, kind: PatchKind, func_base: usize) -> Option<ResolvedCall> {
        if let Some(&local) = self.func_map.get(name) {
            return Some(ResolvedCall::Script(func_base + local));
        }
        for &imp in &self.imports {
            if let Some(&fid) = self.heap.script(imp).functions.get(name) {
                return Some(ResolvedCall::Script(fid));
            }
        }
        if kind == PatchKind::CallTarget
            && let Some(id) = self.heap.find_native(name)
        {
            return Some(ResolvedCall::Native(id));
        }
        None
    }
}

enum ResolvedCall {
    Script(usize),
    Native(usize),
}

#[derive(Clone, Copy, PartialEq)]
enum BraceKind {
    Float,
    StringBuild,
    Array,
    Hash,
}

fn reloc_i32(code: &mut [u8], at: usize, delta: i32) {
    let v = i32::from_le_bytes(code[at..at + 4].try_into().unwrap());
    code[at..at + 4].copy_from_slice(&(v + delta).to_le_bytes());
}

fn binary_opcode(op: &str, float_mode: bool) -> u8 {
    if float_mode {
        match op {
            "+" => return BC_FLOAT_ADD,
            "-" => return BC_FLOAT_SUB,
            "*" => return BC_FLOAT_MUL,
            "/" => return BC_FLOAT_DIV,
            "<" => return BC_FLOAT_LT,
            "<=" => return BC_FLOAT_LE,
            ">" => return BC_FLOAT_GT,
            ">=" => return BC_FLOAT_GE,
            _ => {}
        }
    }
    match op {
        "+" => BC_ADD,
        "-" => BC_SUB,
        "*" => BC_MUL,
        "/" => BC_DIV,
        "%" => BC_REM,
        "<<" => BC_SHL,
        ">>" => BC_SHR,
        ">>>" => BC_USHR,
        "&" => BC_AND,
        "|" => BC_OR,
        "^" => BC_XOR,
        "<" => BC_LT,
        "<=" => BC_LE,
        ">" => BC_GT,
        ">=" => BC_GE,
        "==" => BC_EQ,
        "!=" => BC_NE,
        "===" => BC_EQ_VALUE,
        "!==" => BC_NE_VALUE,
        _ => unreachable!("binary operator {}", op),
    }
}

fn compound_opcode(op: &str, float_mode: bool) -> u8 {
    let base = &op[..op.len() - 1];
    binary_opcode(base, float_mode)
}

fn fold_binop(op: &str, a: Value, b: Value, float_mode: bool) -> Option<Value> {
    if float_mode && (a.is_float() || b.is_float()) {
        let (x, y) = (
            if a.is_float() { a.as_float() } else { a.data as f32 },
            if b.is_float() { b.as_float() } else { b.data as f32 },
        );
        let r = match op {
            "+" => x + y,
            "-" => x - y,
            "*" => x * y,
            "/" => x / y,
            "<" => return Some(Value::int((x < y) as i32)),
            "<=" => return Some(Value::int((x <= y) as i32)),
            ">" => return Some(Value::int((x > y) as i32)),
            ">=" => return Some(Value::int((x >= y) as i32)),
            _ => return None,
        };
        return Some(Value::float(r));
    }
    if !a.is_int() || !b.is_int() {
        return None;
    }
    let (x, y) = (a.data, b.data);
    let r = match op {
        "+" => x.checked_add(y)?,
        "-" => x.checked_sub(y)?,
        "*" => x.checked_mul(y)?,
        "/" => {
            if y == 0 {
                return None;
            }
            x.checked_div(y)?
        }
        "%" => {
            if y == 0 {
                return None;
            }
            x.checked_rem(y)?
        }
        "<<" => x.wrapping_shl(y as u32 & 31),
        ">>" => x.wrapping_shr(y as u32 & 31),
        ">>>" => ((x as u32).wrapping_shr(y as u32 & 31)) as i32,
        "&" => x & y,
        "|" => x | y,
        "^" => x ^ y,
        "<" => (x < y) as i32,
        "<=" => (x <= y) as i32,
        ">" => (x > y) as i32,
        ">=" => (x >= y) as i32,
        "==" => (x == y) as i32,
        "!=" => (x != y) as i32,
        _ => return None,
    };
    Some(Value::int(r))
}
