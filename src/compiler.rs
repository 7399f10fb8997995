// File: src/compiler.rs
//
// Single-pass Pratt-parsing compiler (spec.md §4.F). Tokens come straight
// from `scanner::Scanner`; bytecode is emitted directly into the current
// function's `Chunk` with no intermediate AST, matching the source this
// system was distilled from. Replaces the teacher's two-stage
// `parser.rs`+`compiler.rs`+`ast.rs` pipeline, which builds and then lowers
// a syntax tree -- that shape doesn't fit a single-pass compiler, so this
// file plays both roles at once, the way the original compiler it's
// grounded in does.
//
// Every in-progress function is heap-resident from the moment its
// `Compiler` begins (`begin_compiler` allocates the `FunctionObj` up
// front and bytecode is written straight into its chunk) rather than built
// in a local buffer and allocated at the end. That match matters for GC
// safety: the function is a valid root (via `CompilerRoots`) for the whole
// time it's being compiled, including while compiling a nested function
// that might itself trigger a collection.

use crate::chunk::{Chunk, OpCode};
use crate::errors::CompileError;
use crate::gc::{Heap, ObjRef, Roots};
use crate::object::{FunctionObj, Obj};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::Value;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Minus | Plus => Precedence::Term,
        Slash | Star => Precedence::Factor,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        And => Precedence::And,
        Or => Precedence::Or,
        LeftParen | Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u32,
    is_local: bool,
}

struct CompilerState<'src> {
    function_ref: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

/// Compile-time GC roots: every function currently mid-compilation
/// (spec.md §4.G "compile-time roots: every Compiler on the current stack
/// contributes its current Function").
struct CompilerRoots<'a, 'src>(&'a [CompilerState<'src>]);

impl<'a, 'src> Roots for CompilerRoots<'a, 'src> {
    fn mark_roots(&self, heap: &mut Heap) {
        for c in self.0 {
            heap.mark_object(c.function_ref);
        }
    }
}

/// Resolves `name` against an enclosing scope, capturing a local as an
/// upvalue if it's found there, or chaining further outward otherwise.
/// Implemented over a shrinking slice (rather than explicit indices) so the
/// borrow of each level is disjoint from the ones it recurses into.
fn resolve_upvalue<'src>(chain: &mut [CompilerState<'src>], name: &str) -> Option<u32> {
    if chain.len() < 2 {
        return None;
    }
    let split = chain.len() - 1;
    let (outer, inner) = chain.split_at_mut(split);
    let enclosing = outer.last_mut().unwrap();
    let current = &mut inner[0];

    if let Some((slot, true)) = resolve_local(&enclosing.locals, name) {
        enclosing.locals[slot as usize].is_captured = true;
        return Some(add_upvalue(&mut current.upvalues, slot, true));
    }
    if let Some(slot) = resolve_upvalue(outer, name) {
        return Some(add_upvalue(&mut current.upvalues, slot, false));
    }
    None
}

/// Returns `(slot, initialized)` for the nearest local named `name`.
fn resolve_local(locals: &[Local], name: &str) -> Option<(u32, bool)> {
    for (i, local) in locals.iter().enumerate().rev() {
        if local.name == name {
            return Some((i as u32, local.depth != -1));
        }
    }
    None
}

fn add_upvalue(upvalues: &mut Vec<UpvalueDesc>, index: u32, is_local: bool) -> u32 {
    for (i, uv) in upvalues.iter().enumerate() {
        if uv.index == index && uv.is_local == is_local {
            return i as u32;
        }
    }
    upvalues.push(UpvalueDesc { index, is_local });
    (upvalues.len() - 1) as u32
}

struct Parser<'src> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    heap: &'src mut Heap,
    compilers: Vec<CompilerState<'src>>,
    class_depth: u32,
}

/// Compiles `source` into a top-level (`Script`-kind) function. On success,
/// returns a handle to that function, ready to be wrapped in a closure and
/// run. On failure, returns every diagnostic collected across the whole
/// compile (panic-mode recovery lets more than one surface per run).
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    let mut parser = Parser::new(source, heap);
    parser.begin_compiler(FunctionKind::Script, None);
    parser.advance();
    while !parser.check(TokenKind::Eof) {
        parser.declaration();
    }
    let (function_ref, _upvalues) = parser.end_compiler();

    if parser.had_error {
        Err(parser.errors)
    } else {
        Ok(function_ref)
    }
}

impl<'src> Parser<'src> {
    fn new(source: &'src str, heap: &'src mut Heap) -> Self {
        Parser {
            scanner: Scanner::new(source),
            previous: Token { kind: TokenKind::Eof, lexeme: "", line: 1 },
            current: Token { kind: TokenKind::Eof, lexeme: "", line: 1 },
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            heap,
            compilers: Vec::new(),
            class_depth: 0,
        }
    }

    // --- token stream plumbing ----------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current(self.current.lexeme.to_string());
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message.to_string());
    }

    fn error_at_current(&mut self, message: String) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: impl Into<String>) {
        self.error_at(self.previous, message.into());
    }

    fn error_at(&mut self, token: Token<'src>, message: String) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(CompileError::at(&token, message));
        self.had_error = true;
    }

    /// Skips tokens until a likely statement boundary, so one bad token
    /// doesn't cascade into a wall of spurious errors (spec.md §4.F).
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // --- compiler-stack / chunk plumbing -------------------------------

    fn begin_compiler(&mut self, kind: FunctionKind, name: Option<&str>) {
        let name_ref = name.map(|n| self.heap.intern(n.as_bytes(), &CompilerRoots(&self.compilers)));
        let function_ref = self.heap.alloc(
            Obj::Function(FunctionObj {
                name: name_ref,
                arity: 0,
                upvalue_count: 0,
                chunk: Chunk::new(),
            }),
            &CompilerRoots(&self.compilers),
        );

        let mut locals = Vec::new();
        // Slot 0 is reserved for the callee itself (spec.md §3 invariant
        // 3); methods name it `this` so bodies can reference the receiver
        // exactly like any other local.
        locals.push(Local {
            name: if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
                "this"
            } else {
                ""
            },
            depth: 0,
            is_captured: false,
        });

        self.compilers.push(CompilerState {
            function_ref,
            kind,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        });
    }

    /// Emits the implicit return, pops the compiler, and hands back the
    /// finished function's handle plus its upvalue descriptors (needed by
    /// the caller to emit the `CLOSURE` operand pairs in the *enclosing*
    /// chunk).
    fn end_compiler(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit_return();
        let compiler = self.compilers.pop().unwrap();
        (compiler.function_ref, compiler.upvalues)
    }

    fn current(&mut self) -> &mut CompilerState<'src> {
        self.compilers.last_mut().unwrap()
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        let function_ref = self.compilers.last().unwrap().function_ref;
        &mut self.heap.get_mut(function_ref).as_function_mut().unwrap().chunk
    }

    /// Runs `f` against the current function's chunk and reconciles
    /// `Heap::bytes_allocated` for whatever size change `f` causes -- the
    /// chunk's code/constants vectors keep growing for as long as the
    /// function is being compiled, well after the `FunctionObj` itself was
    /// allocated (spec.md §4.G).
    fn with_chunk_mut<R>(&mut self, f: impl FnOnce(&mut Chunk) -> R) -> R {
        let function_ref = self.compilers.last().unwrap().function_ref;
        self.heap.with_object_mut(function_ref, |obj| f(&mut obj.as_function_mut().unwrap().chunk))
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.with_chunk_mut(|c| c.write_byte(byte, line));
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.to_byte());
    }

    fn emit_return(&mut self) {
        if self.current().kind == FunctionKind::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Chooses the short (one operand byte) or long (24-bit big-endian)
    /// form of a named-operand opcode, per spec.md §4.F.
    fn emit_const_ref(&mut self, short: OpCode, long: OpCode, index: usize) {
        let line = self.line();
        if index <= 0xFF {
            self.emit_op(short);
            self.emit_byte(index as u8);
        } else {
            self.emit_op(long);
            self.with_chunk_mut(|c| c.write_u24(index as u32, line));
        }
    }

    fn emit_constant(&mut self, value: Value) {
        match self.with_chunk_mut(|c| c.add_constant(value)) {
            Ok(index) => self.emit_const_ref(OpCode::Constant, OpCode::ConstantLong, index),
            Err(message) => self.error(message),
        }
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let line = self.line();
        self.with_chunk_mut(|c| c.write_u16_placeholder(line))
    }

    fn patch_jump(&mut self, offset: usize) {
        if let Err(message) = self.current_chunk().patch_jump(offset) {
            self.error(message);
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let line = self.line();
        let distance = self.current_chunk().len() + 2 - loop_start;
        if distance > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.with_chunk_mut(|chunk| {
            chunk.write_byte(((distance >> 8) & 0xFF) as u8, line);
            chunk.write_byte((distance & 0xFF) as u8, line);
        });
    }

    /// Pops trailing locals leaving a scope, batching consecutive
    /// uncaptured ones into `OP_POPN` (operand biased by −2, spec.md §9
    /// supplement) and emitting `OP_CLOSE_UPVALUE` one at a time for
    /// captured ones, in declaration order from innermost outward.
    fn emit_pop_run(&mut self, mut count: usize) {
        while count > 0 {
            if count >= 2 {
                let n = (count - 2).min(255);
                self.emit_op(OpCode::PopN);
                self.emit_byte(n as u8);
                count -= n + 2;
            } else {
                self.emit_op(OpCode::Pop);
                count -= 1;
            }
        }
    }

    // --- scopes & variables --------------------------------------------

    fn begin_scope(&mut self) {
        self.current().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = {
            let c = self.current();
            c.scope_depth -= 1;
            c.scope_depth
        };

        let mut popped = Vec::new();
        while matches!(self.current().locals.last(), Some(l) if l.depth > depth) {
            popped.push(self.current().locals.pop().unwrap());
        }

        let mut i = 0;
        while i < popped.len() {
            if popped[i].is_captured {
                self.emit_op(OpCode::CloseUpvalue);
                i += 1;
            } else {
                let mut run = 0;
                while i + run < popped.len() && !popped[i + run].is_captured {
                    run += 1;
                }
                self.emit_pop_run(run);
                i += run;
            }
        }
    }

    fn identifier_constant(&mut self, name: &str) -> usize {
        let r = self.heap.intern(name.as_bytes(), &CompilerRoots(&self.compilers));
        match self.with_chunk_mut(|c| c.add_constant(Value::Obj(r))) {
            Ok(index) => index,
            Err(message) => {
                self.error(message);
                0
            }
        }
    }

    fn declare_variable(&mut self, name: &'src str) {
        if self.current().scope_depth == 0 {
            return;
        }
        let depth = self.current().scope_depth;
        let mut duplicate = false;
        for local in self.current().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        if self.current().locals.len() >= 0x0100_0000 {
            self.error("Too many local variables in one scope.");
            return;
        }
        self.current().locals.push(Local { name, depth: -1, is_captured: false });
    }

    /// Consumes an identifier, declaring it as a local (no constant needed)
    /// or, at top level, interning it as a global-name constant whose index
    /// is returned (0 when local -- the caller ignores it in that case).
    fn parse_variable(&mut self, error_message: &str) -> usize {
        self.consume(TokenKind::Identifier, error_message);
        let name = self.previous.lexeme;
        self.declare_variable(name);
        if self.current().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        if self.current().scope_depth == 0 {
            return;
        }
        let depth = self.current().scope_depth;
        self.current().locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global_index: usize) {
        if self.current().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_const_ref(OpCode::DefineGlobal, OpCode::DefineGlobalLong, global_index);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        enum Kind {
            Local(usize),
            Upvalue(usize),
            Global(usize),
        }

        let kind = if let Some((slot, initialized)) = resolve_local(&self.current().locals, name) {
            if !initialized {
                self.error("Can't read local variable in its own initializer.");
            }
            Kind::Local(slot as usize)
        } else if let Some(slot) = resolve_upvalue(&mut self.compilers, name) {
            Kind::Upvalue(slot as usize)
        } else {
            Kind::Global(self.identifier_constant(name))
        };

        let assigning = can_assign && self.check(TokenKind::Equal) && {
            self.advance();
            true
        };

        if assigning {
            self.expression();
        }

        match kind {
            Kind::Local(slot) => {
                let op = if assigning { OpCode::SetLocal } else { OpCode::GetLocal };
                let op_long = if assigning { OpCode::SetLocalLong } else { OpCode::GetLocalLong };
                self.emit_const_ref(op, op_long, slot);
            }
            Kind::Upvalue(slot) => {
                let op = if assigning { OpCode::SetUpvalue } else { OpCode::GetUpvalue };
                let op_long = if assigning { OpCode::SetUpvalueLong } else { OpCode::GetUpvalueLong };
                self.emit_const_ref(op, op_long, slot);
            }
            Kind::Global(index) => {
                let op = if assigning { OpCode::SetGlobal } else { OpCode::GetGlobal };
                let op_long = if assigning { OpCode::SetGlobalLong } else { OpCode::GetGlobalLong };
                self.emit_const_ref(op, op_long, index);
            }
        }
    }

    // --- expressions -----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix_rule(self.previous.kind, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string_literal(),
            TokenKind::False | TokenKind::True | TokenKind::Nil => self.literal(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_expr(),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Minus
            | TokenKind::Plus
            | TokenKind::Slash
            | TokenKind::Star
            | TokenKind::BangEqual
            | TokenKind::EqualEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(),
            TokenKind::And => self.and_(),
            TokenKind::Or => self.or_(),
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            _ => unreachable!("infix_rule dispatched for a token with no infix rule"),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(infix_precedence(operator).next());
        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn number(&mut self) {
        let n: f64 = self.previous.lexeme.parse().expect("scanner only emits well-formed numbers");
        self.emit_constant(Value::Number(n));
    }

    fn string_literal(&mut self) {
        let lexeme = self.previous.lexeme;
        let bytes = &lexeme.as_bytes()[1..lexeme.len() - 1];
        let r = self.heap.intern(bytes, &CompilerRoots(&self.compilers));
        self.emit_constant(Value::Obj(r));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn this_expr(&mut self) {
        if self.class_depth == 0 {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name_const = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_const_ref(OpCode::SetProperty, OpCode::SetPropertyLong, name_const);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_const_ref(OpCode::Invoke, OpCode::InvokeLong, name_const);
            self.emit_byte(arg_count);
        } else {
            self.emit_const_ref(OpCode::GetProperty, OpCode::GetPropertyLong, name_const);
        }
    }

    // --- statements ------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.current().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn var_declaration(&mut self) {
        let global_index = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global_index);
    }

    fn fun_declaration(&mut self) {
        let global_index = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global_index);
    }

    /// Compiles one function body as a standalone `Compiler`, then emits
    /// `CLOSURE[_LONG]` plus its upvalue-capture operand pairs back in the
    /// *enclosing* chunk (spec.md §4.F "Functions").
    fn function(&mut self, kind: FunctionKind) {
        let name = self.previous.lexeme;
        self.begin_compiler(kind, Some(name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let function_ref = self.current().function_ref;
                let arity = self.heap.get(function_ref).as_function().unwrap().arity;
                if arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.".to_string());
                } else {
                    self.heap.get_mut(function_ref).as_function_mut().unwrap().arity = arity + 1;
                }
                let param_const = self.parse_variable("Expect parameter name.");
                self.define_variable(param_const);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function_ref, upvalues) = self.end_compiler();
        self.heap.get_mut(function_ref).as_function_mut().unwrap().upvalue_count =
            upvalues.len() as u32;

        let const_index = match self.with_chunk_mut(|c| c.add_constant(Value::Obj(function_ref))) {
            Ok(index) => index,
            Err(message) => {
                self.error(message);
                0
            }
        };
        self.emit_const_ref(OpCode::Closure, OpCode::ClosureLong, const_index);

        for uv in &upvalues {
            let is_long = uv.index > 0xFF;
            let flag = (uv.is_local as u8) | ((is_long as u8) << 1);
            self.emit_byte(flag);
            if is_long {
                let line = self.line();
                self.with_chunk_mut(|c| c.write_u24(uv.index, line));
            } else {
                self.emit_byte(uv.index as u8);
            }
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name);
        let kind = if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        self.emit_const_ref(OpCode::Method, OpCode::MethodLong, name_const);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_const = self.identifier_constant(class_name);
        self.declare_variable(class_name);

        self.emit_const_ref(OpCode::Class, OpCode::ClassLong, name_const);
        self.define_variable(name_const);

        // `define_variable` at the top level emits `OP_DEFINE_GLOBAL`, which
        // pops the class; re-load it so the method loop below has the class
        // on top of the stack for each `OP_METHOD` to attach to.
        self.named_variable(class_name, false);

        self.class_depth += 1;
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);
        self.class_depth -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled_ops(source: &str) -> Vec<u8> {
        let mut heap = Heap::new();
        let function_ref = compile(source, &mut heap).expect("expected a clean compile");
        heap.get(function_ref).as_function().unwrap().chunk.code.clone()
    }

    #[test]
    fn arithmetic_precedence_emits_multiply_before_add() {
        let code = compiled_ops("1 + 2 * 3;");
        assert_eq!(code[0], OpCode::Constant.to_byte());
        let multiply_pos = code.iter().position(|&b| b == OpCode::Multiply.to_byte()).unwrap();
        let add_pos = code.iter().position(|&b| b == OpCode::Add.to_byte()).unwrap();
        assert!(multiply_pos < add_pos);
    }

    #[test]
    fn top_level_return_is_a_compile_error() {
        let mut heap = Heap::new();
        let result = compile("return 1;", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn global_redefinition_compiles_cleanly_checked_later_at_runtime() {
        // DEFINE_GLOBAL redefinition is rejected by the VM's table
        // operation (spec.md §9(a)), not statically by the compiler.
        let mut heap = Heap::new();
        assert!(compile("var a = 1; var a = 2;", &mut heap).is_ok());
    }

    #[test]
    fn unclosed_block_reports_an_error_without_panicking() {
        let mut heap = Heap::new();
        let result = compile("fun f() { print 1;", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn closure_capturing_an_enclosing_local_compiles() {
        let code = compiled_ops(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; } outer();",
        );
        assert!(code.iter().any(|&b| b == OpCode::Closure.to_byte()));
    }
}
