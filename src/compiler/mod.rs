use crate::diagnostic::{Diagnostic, Span};
use crate::lexer::{Scanner, Token, TokenKind};
use crate::vm::chunk::OpCode;
use crate::vm::heap::{Heap, ObjRef};
use crate::vm::object::{Function, Obj};
use crate::vm::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compiles a source string into a top-level script function. The heap is
/// the VM's: string constants are interned into it and finished functions
/// allocated on it. Collection never runs during compilation (the watermark
/// is only checked inside the dispatch loop), so the working set is safe.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<Diagnostic>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_state();
    if compiler.had_error {
        Err(compiler.diagnostics)
    } else {
        Ok(compiler.heap.alloc(Obj::Function(function)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
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
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

/// Binding power of a token in infix position. Bitwise and shift operators
/// share the additive level; `%` and `**` the multiplicative one.
fn infix_precedence(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::Or => Precedence::Or,
        TokenKind::And => Precedence::And,
        TokenKind::BangEqual | TokenKind::EqualEqual => Precedence::Equality,
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => Precedence::Comparison,
        TokenKind::Plus
        | TokenKind::Minus
        | TokenKind::Amp
        | TokenKind::Pipe
        | TokenKind::Caret
        | TokenKind::Shl
        | TokenKind::Shr => Precedence::Term,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent | TokenKind::StarStar => {
            Precedence::Factor
        }
        TokenKind::LeftParen | TokenKind::Dot | TokenKind::LeftBracket => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// `None` between declaration and the end of its initializer.
    depth: Option<usize>,
    captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. Nested function declarations push a new
/// state; the stack replaces the enclosing-compiler chain.
struct FunctionState<'src> {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: usize,
}

impl<'src> FunctionState<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot 0 is reserved for the callee; in methods it holds `this`.
        let reserved = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        FunctionState {
            function: Function::new(name),
            kind,
            locals: vec![Local { name: reserved, depth: Some(0), captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    source: &'src str,
    heap: &'h mut Heap,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    states: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            span: Span::default(),
            line: 1,
        };
        Compiler {
            scanner: Scanner::new(source),
            source,
            heap,
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            states: vec![FunctionState::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    // ---- Token plumbing ----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ---- Error reporting ----

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let label = match token.kind {
            TokenKind::Eof => "at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!("at '{}'", token.lexeme),
        };
        self.diagnostics.push(
            Diagnostic::error(message)
                .with_span(token.span, label)
                .with_source(self.source),
        );
    }

    /// Skip to a statement boundary so one mistake doesn't cascade.
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
                _ => {}
            }
            self.advance();
        }
    }

    // ---- State access ----

    fn state(&self) -> &FunctionState<'src> {
        self.states.last().unwrap()
    }

    fn state_mut(&mut self) -> &mut FunctionState<'src> {
        self.states.last_mut().unwrap()
    }

    fn code_len(&self) -> usize {
        self.state().function.chunk.code.len()
    }

    fn end_state(&mut self) -> (Function, Vec<UpvalueDesc>) {
        self.emit_return();
        let state = self.states.pop().unwrap();
        let mut function = state.function;
        function.upvalue_count = state.upvalues.len();
        (function, state.upvalues)
    }

    // ---- Emission ----

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.state_mut().function.chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_return(&mut self) {
        if self.state().kind == FunctionKind::Initializer {
            self.emit_bytes(OpCode::GetLocal as u8, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.state_mut().function.chunk.add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_bytes(OpCode::Constant as u8, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let s = self.heap.intern(name);
        self.make_constant(Value::Obj(s))
    }

    /// Emits a jump with a two-byte placeholder; returns the placeholder's
    /// offset for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.code_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // Distance from the byte after the operand to the current end.
        let jump = self.code_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = &mut self.state_mut().function.chunk;
        chunk.code[offset] = (jump >> 8) as u8;
        chunk.code[offset + 1] = jump as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.code_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    // ---- Scopes and variables ----

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        loop {
            let state = self.state();
            let pop = match state.locals.last() {
                Some(local) => local.depth.is_some_and(|d| d > state.scope_depth),
                None => false,
            };
            if !pop {
                break;
            }
            let captured = self.state_mut().locals.pop().unwrap().captured;
            self.emit_op(if captured { OpCode::CloseUpvalue } else { OpCode::Pop });
        }
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let state = self.state();
        let mut duplicate = false;
        for local in state.locals.iter().rev() {
            if local.depth.is_some_and(|d| d < state.scope_depth) {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.state().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local { name, depth: None, captured: false });
    }

    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal as u8, global);
    }

    fn resolve_local(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (i, local) in self.states[state_idx].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((i, local.depth.is_none()));
                break;
            }
        }
        let (index, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(index as u8)
    }

    /// Resolves `name` in an enclosing function, threading an upvalue entry
    /// through every function between the declaration and the use site.
    fn resolve_upvalue(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        if state_idx == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(state_idx - 1, name) {
            self.states[state_idx - 1].locals[local as usize].captured = true;
            return Some(self.add_upvalue(state_idx, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(state_idx - 1, name) {
            return Some(self.add_upvalue(state_idx, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, state_idx: usize, index: u8, is_local: bool) -> u8 {
        for (i, upvalue) in self.states[state_idx].upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }
        if self.states[state_idx].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.states[state_idx].upvalues.push(UpvalueDesc { index, is_local });
        (self.states[state_idx].upvalues.len() - 1) as u8
    }

    // ---- Declarations ----

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_bytes(OpCode::Class as u8, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            // A scoped `super` local lets method bodies resolve the
            // superclass lexically, like any other captured variable.
            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.lexeme);
        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_bytes(OpCode::Method as u8, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; it is initialized before its body.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.previous.lexeme);
        self.states.push(FunctionState::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.state().function.arity;
                if arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.state_mut().function.arity = arity.saturating_add(1);
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // The frame is discarded whole; no end_scope is needed.
        let (function, upvalues) = self.end_state();
        let function_ref = self.heap.alloc(Obj::Function(function));
        let constant = self.make_constant(Value::Obj(function_ref));
        self.emit_bytes(OpCode::Closure as u8, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    // ---- Statements ----

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::LeftBrace) {
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

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.code_len();
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
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.code_len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            // The increment runs after the body: jump over it now, loop back
            // to it from the body's end.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.code_len();
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
        if self.state().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.state().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // ---- Expressions ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    /// Dispatch for a token in prefix position; false if it has no rule.
    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::LeftBracket => self.list_literal(),
            TokenKind::Minus | TokenKind::Bang | TokenKind::Tilde => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::Str => self.string(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::True | TokenKind::False | TokenKind::Nil => self.literal(),
            TokenKind::This => self.this_expression(),
            TokenKind::Super => self.super_expression(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::LeftParen => self.call(),
            TokenKind::LeftBracket => self.subscript(can_assign),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::And => self.and_operator(),
            TokenKind::Or => self.or_operator(),
            _ => self.binary(),
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
            TokenKind::Tilde => self.emit_op(OpCode::BitNot),
            _ => unreachable!("not a unary operator"),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(infix_precedence(operator).next());
        match operator {
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
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulo),
            TokenKind::StarStar => self.emit_op(OpCode::Power),
            TokenKind::Amp => self.emit_op(OpCode::BitAnd),
            TokenKind::Pipe => self.emit_op(OpCode::BitOr),
            TokenKind::Caret => self.emit_op(OpCode::BitXor),
            TokenKind::Shl => self.emit_op(OpCode::ShiftLeft),
            TokenKind::Shr => self.emit_op(OpCode::ShiftRight),
            _ => unreachable!("not a binary operator"),
        }
    }

    fn and_operator(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_operator(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or_default();
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        let s = self.heap.intern(text);
        self.emit_constant(Value::Obj(s));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("not a literal"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let state_idx = self.states.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(state_idx, name.lexeme)
        {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(state_idx, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let constant = self.identifier_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op as u8, arg);
        } else {
            self.emit_bytes(get_op as u8, arg);
        }
    }

    fn synthetic(&self, lexeme: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Identifier,
            lexeme,
            span: self.previous.span,
            line: self.previous.line,
        }
    }

    fn this_expression(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_expression(&mut self) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            _ => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable(self.synthetic("this"), false);
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(self.synthetic("super"), false);
            self.emit_bytes(OpCode::SuperInvoke as u8, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(self.synthetic("super"), false);
            self.emit_bytes(OpCode::GetSuper as u8, name);
        }
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_bytes(OpCode::Call as u8, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty as u8, name);
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_bytes(OpCode::Invoke as u8, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_bytes(OpCode::GetProperty as u8, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                }
                count = count.saturating_add(1);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count
    }

    fn list_literal(&mut self) {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if count == u8::MAX {
                    self.error("Can't have more than 255 elements in a list literal.");
                }
                count = count.saturating_add(1);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list elements.");
        self.emit_bytes(OpCode::BuildList as u8, count);
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetSubscript);
        } else {
            self.emit_op(OpCode::GetSubscript);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("expected successful compile");
        (heap, function)
    }

    fn compile_err(source: &str) -> Vec<Diagnostic> {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect_err("expected compile error")
    }

    fn has_error(diagnostics: &[Diagnostic], message: &str) -> bool {
        diagnostics.iter().any(|d| d.message == message)
    }

    #[test]
    fn arithmetic_emission() {
        let (heap, f) = compile_ok("print 1 + 2;");
        let chunk = &heap.function(f).chunk;
        assert_eq!(
            chunk.code,
            vec![
                OpCode::Constant as u8,
                0,
                OpCode::Constant as u8,
                1,
                OpCode::Add as u8,
                OpCode::Print as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
        assert_eq!(chunk.constants, vec![Value::Number(1.0), Value::Number(2.0)]);
    }

    #[test]
    fn global_declaration_emits_define_global() {
        let (heap, f) = compile_ok("var a = 1;");
        let chunk = &heap.function(f).chunk;
        // Constant 0 is the interned name, constant 1 the initializer.
        assert_eq!(
            chunk.code,
            vec![
                OpCode::Constant as u8,
                1,
                OpCode::DefineGlobal as u8,
                0,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
    }

    #[test]
    fn and_short_circuits_with_jump() {
        let (heap, f) = compile_ok("print true and false;");
        let code = &heap.function(f).chunk.code;
        assert_eq!(code[0], OpCode::True as u8);
        assert_eq!(code[1], OpCode::JumpIfFalse as u8);
        assert_eq!(code[4], OpCode::Pop as u8);
        assert_eq!(code[5], OpCode::False as u8);
        // The jump lands just past the right operand.
        let offset = ((code[2] as usize) << 8) | code[3] as usize;
        assert_eq!(4 + offset, 6);
    }

    #[test]
    fn if_else_jumps_are_patched() {
        let (heap, f) = compile_ok("if (true) print 1; else print 2;");
        let code = &heap.function(f).chunk.code;
        assert_eq!(code[1], OpCode::JumpIfFalse as u8);
        let then_offset = ((code[2] as usize) << 8) | code[3] as usize;
        // The false branch starts with a Pop.
        assert_eq!(code[4 + then_offset], OpCode::Pop as u8);
    }

    #[test]
    fn closure_upvalue_descriptors() {
        let (heap, f) = compile_ok("fun mk(x) { fun g() { return x; } return g; }");
        // The script's constants contain `mk`'s function object.
        let script = heap.function(f);
        let mk_ref = script
            .chunk
            .constants
            .iter()
            .find_map(|v| v.as_obj().filter(|&r| matches!(heap.get(r), Obj::Function(_))))
            .expect("mk function constant");
        let mk = heap.function(mk_ref);
        let g_ref = mk
            .chunk
            .constants
            .iter()
            .find_map(|v| v.as_obj().filter(|&r| matches!(heap.get(r), Obj::Function(_))))
            .expect("g function constant");
        let g = heap.function(g_ref);
        assert_eq!(g.upvalue_count, 1);
        // `Closure` operand is followed by (is_local, index) = (1, 1):
        // x lives in mk's slot 1.
        let pos = mk
            .chunk
            .code
            .iter()
            .position(|&b| b == OpCode::Closure as u8)
            .expect("closure op");
        assert_eq!(mk.chunk.code[pos + 2], 1);
        assert_eq!(mk.chunk.code[pos + 3], 1);
    }

    #[test]
    fn too_many_constants_in_one_chunk() {
        let source: String = (0..300).map(|i| format!("print {i};")).collect();
        let diagnostics = compile_err(&source);
        assert!(has_error(&diagnostics, "Too many constants in one chunk."));
    }

    #[test]
    fn loop_body_too_large() {
        let mut source = String::from("{ var a = 0; while (true) { ");
        for _ in 0..14000 {
            source.push_str("a = a; ");
        }
        source.push_str("} }");
        let diagnostics = compile_err(&source);
        assert!(has_error(&diagnostics, "Loop body too large."));
    }

    #[test]
    fn forward_jump_too_large() {
        let mut source = String::from("{ var a = 0; if (true) { ");
        for _ in 0..14000 {
            source.push_str("a = a; ");
        }
        source.push_str("} }");
        let diagnostics = compile_err(&source);
        assert!(has_error(&diagnostics, "Too much code to jump over."));
    }

    #[test]
    fn invalid_assignment_target() {
        let diagnostics = compile_err("var a = 1; var b = 2; a + b = 3;");
        assert!(has_error(&diagnostics, "Invalid assignment target."));
    }

    #[test]
    fn return_at_top_level() {
        let diagnostics = compile_err("return 1;");
        assert!(has_error(&diagnostics, "Can't return from top-level code."));
    }

    #[test]
    fn this_outside_class() {
        let diagnostics = compile_err("print this;");
        assert!(has_error(&diagnostics, "Can't use 'this' outside of a class."));
    }

    #[test]
    fn super_without_superclass() {
        let diagnostics = compile_err("class A { m() { super.m(); } }");
        assert!(has_error(
            &diagnostics,
            "Can't use 'super' in a class with no superclass."
        ));
    }

    #[test]
    fn self_inheritance() {
        let diagnostics = compile_err("class A < A {}");
        assert!(has_error(&diagnostics, "A class can't inherit from itself."));
    }

    #[test]
    fn local_in_own_initializer() {
        let diagnostics = compile_err("{ var a = a; }");
        assert!(has_error(
            &diagnostics,
            "Can't read local variable in its own initializer."
        ));
    }

    #[test]
    fn duplicate_local_in_scope() {
        let diagnostics = compile_err("{ var a = 1; var a = 2; }");
        assert!(has_error(
            &diagnostics,
            "Already a variable with this name in this scope."
        ));
    }

    #[test]
    fn initializer_cannot_return_value() {
        let diagnostics = compile_err("class A { init() { return 1; } }");
        assert!(has_error(
            &diagnostics,
            "Can't return a value from an initializer."
        ));
    }

    #[test]
    fn panic_mode_recovers_at_statement_boundary() {
        // Both statements are bad; synchronization lets both be reported.
        let diagnostics = compile_err("var = 1; print this;");
        assert!(has_error(&diagnostics, "Expect variable name."));
        assert!(has_error(&diagnostics, "Can't use 'this' outside of a class."));
    }

    #[test]
    fn string_constants_are_interned() {
        let (heap, f) = compile_ok(r#"var a = "hi"; var b = "hi";"#);
        let chunk = &heap.function(f).chunk;
        let strings: Vec<ObjRef> = chunk
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .filter(|&r| heap.as_str(r) == "hi")
            .collect();
        assert_eq!(strings.len(), 2);
        assert_eq!(strings[0], strings[1]);
    }

    #[test]
    fn diagnostics_carry_line_information() {
        let diagnostics = compile_err("print 1;\nprint ;");
        let d = &diagnostics[0];
        let label = d.label.as_ref().expect("span label");
        assert!(d.source.is_some());
        assert!(label.span.start > 8, "span should point into line 2");
    }
}
