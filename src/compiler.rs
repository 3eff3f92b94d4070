use super::{
    chunk::{Chunk, Instruction},
    heap::{mark_ref, Heap, ObjectRef, ObjectRoot, Root},
    reporter::{Report, Reporter},
    token::{Token, TokenType, BOUNDARIES},
    tokenizer::Tokenizer,
    value::{Function, LoxString, Value},
};
use std::mem;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'a> {
    name: &'a str,
    /// `None` until the initializer finishes compiling; reading the
    /// local before that is a compile error.
    depth: Option<usize>,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UpValue {
    pub index: u8,
    pub is_local: bool,
}

/// Per-function compiler state. States form a chain through `enclosing`
/// while nested functions compile; the chain doubles as the GC's
/// compiler roots.
struct FnState<'a> {
    kind: FunctionKind,
    name: Option<ObjectRef<LoxString>>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'a>>,
    up_values: Vec<UpValue>,
    scope_depth: usize,
    enclosing: Option<Box<FnState<'a>>>,
}

impl<'a> FnState<'a> {
    fn new(kind: FunctionKind, name: Option<ObjectRef<LoxString>>) -> Self {
        // slot 0 belongs to the callee: `this` inside methods, unnameable
        // otherwise
        let slot_zero = Local {
            name: match kind {
                FunctionKind::Method | FunctionKind::Initializer => "this",
                _ => "",
            },
            depth: Some(0),
            is_captured: false,
        };
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![slot_zero],
            up_values: Vec::new(),
            scope_depth: 0,
            enclosing: None,
        }
    }

    fn resolve_local(&self, name: &str) -> Result<Option<u8>, &'static str> {
        for (index, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth.is_none() {
                    return Err("Can't read local variable in its own initializer.");
                }
                return Ok(Some(index as u8));
            }
        }
        Ok(None)
    }

    fn add_up_value(&mut self, index: u8, is_local: bool) -> Result<u8, &'static str> {
        for (i, up_value) in self.up_values.iter().enumerate() {
            if up_value.index == index && up_value.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if self.up_values.len() >= MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        self.up_values.push(UpValue { index, is_local });
        Ok((self.up_values.len() - 1) as u8)
    }
}

/// Looks `name` up through the enclosing functions, threading an upvalue
/// per hop: a local of the direct enclosing function is captured as a
/// local upvalue, anything further out as an upvalue of an upvalue.
fn resolve_up_value<'a>(
    state: &mut FnState<'a>,
    name: &str,
) -> Result<Option<u8>, &'static str> {
    let enclosing = match state.enclosing.as_mut() {
        Some(enclosing) => enclosing,
        None => return Ok(None),
    };

    if let Some(index) = enclosing.resolve_local(name)? {
        enclosing.locals[index as usize].is_captured = true;
        return state.add_up_value(index, true).map(Some);
    }

    if let Some(index) = resolve_up_value(enclosing, name)? {
        return state.add_up_value(index, false).map(Some);
    }

    Ok(None)
}

struct ClassState {
    has_superclass: bool,
    enclosing: Option<Box<ClassState>>,
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
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call => Self::Primary,
            Self::Primary => Self::Primary,
        }
    }
}

type ParseFn<'a, 'r> = fn(&mut Compiler<'a, 'r>, bool);

struct ParseRule<'a, 'r> {
    prefix: Option<ParseFn<'a, 'r>>,
    infix: Option<ParseFn<'a, 'r>>,
    precedence: Precedence,
}

pub struct Compiler<'a, 'r> {
    tokenizer: Tokenizer<'a>,
    current: Token<'a>,
    previous: Token<'a>,
    had_error: bool,
    panic_mode: bool,
    heap: &'r mut Heap,
    reporter: &'r mut dyn Reporter,
    roots: &'r dyn Root,
    state: Box<FnState<'a>>,
    class_state: Option<Box<ClassState>>,
}

/// Compiles a source buffer into its top-level function, or `Err` if
/// any compile error was reported. `roots` lets the caller keep its own
/// live objects out of any collection the compiler triggers.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    reporter: &mut dyn Reporter,
    roots: &dyn Root,
) -> Result<ObjectRoot<Function>, ()> {
    let mut compiler = Compiler {
        tokenizer: Tokenizer::new(source),
        current: Token::empty(),
        previous: Token::empty(),
        had_error: false,
        panic_mode: false,
        heap,
        reporter,
        roots,
        state: Box::new(FnState::new(FunctionKind::Script, None)),
        class_state: None,
    };

    compiler.advance();
    while !compiler.matches(TokenType::EOF) {
        compiler.declaration();
    }

    compiler.collect_if_needed();
    let state = compiler.pop_state();
    if compiler.had_error {
        return Err(());
    }
    let function = compiler.heap.alloc(Function {
        name: None,
        arity: 0,
        upvalue_count: state.up_values.len(),
        chunk: state.chunk,
    });
    Ok(function.upgrade().unwrap())
}

impl<'a, 'r> Compiler<'a, 'r> {
    //>> Token plumbing

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.tokenizer.next_token();
            if self.current.typ != TokenType::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, typ: TokenType, msg: &str) {
        if self.current.typ == typ {
            self.advance();
        } else {
            self.error_at_current(msg);
        }
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ == typ
    }

    fn matches(&mut self, typ: TokenType) -> bool {
        if self.check(typ) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_at(&mut self, token: Token<'a>, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let location = match token.typ {
            TokenType::EOF => " at end".to_string(),
            TokenType::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.reporter
            .error(Report::compile(msg.to_string(), token.line, location));
    }

    fn error(&mut self, msg: &str) {
        self.error_at(self.previous, msg);
    }

    fn error_at_current(&mut self, msg: &str) {
        self.error_at(self.current, msg);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.typ != TokenType::EOF {
            if self.previous.typ == TokenType::Semicolon {
                return;
            }
            if BOUNDARIES.contains(&self.current.typ) {
                return;
            }
            self.advance();
        }
    }

    //<<

    //>> Emission

    fn emit(&mut self, instr: Instruction) {
        let line = self.previous.line;
        self.state.chunk.emit_instr(instr, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.state.chunk.write(byte, line);
    }

    fn emit_jump(&mut self, instr: Instruction) -> usize {
        let line = self.previous.line;
        self.state.chunk.emit_jump(instr, line)
    }

    fn patch_jump(&mut self, index: usize) {
        if self.state.chunk.patch_jump(index).is_err() {
            self.error("Too much code to jump over.");
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line;
        if self.state.chunk.emit_loop(loop_start, line).is_err() {
            self.error("Loop body too large.");
        }
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.state.chunk.add_constant(value) {
            Ok(index) => index,
            Err(()) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit(Instruction::Constant);
        self.emit_byte(index);
    }

    fn emit_return(&mut self) {
        if self.state.kind == FunctionKind::Initializer {
            self.emit(Instruction::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit(Instruction::Nil);
        }
        self.emit(Instruction::Return);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        self.collect_if_needed();
        let string = self.heap.intern(name.to_string());
        self.make_constant(Value::String(string))
    }

    //<<

    //>> Compiler states and the GC

    fn push_state(&mut self, kind: FunctionKind) {
        self.collect_if_needed();
        let name = Some(self.heap.intern(self.previous.lexeme.to_string()));
        let enclosing = mem::replace(&mut self.state, Box::new(FnState::new(kind, name)));
        self.state.enclosing = Some(enclosing);
    }

    fn pop_state(&mut self) -> FnState<'a> {
        self.emit_return();

        #[cfg(feature = "debug-bytecode")]
        if !self.had_error {
            let name = match &self.state.name {
                Some(name) => name.upgrade().unwrap().content.chars.clone(),
                None => "<script>".to_string(),
            };
            println!("=== {} ===\n{:?}", name, self.state.chunk);
        }

        let enclosing = self
            .state
            .enclosing
            .take()
            .unwrap_or_else(|| Box::new(FnState::new(FunctionKind::Script, None)));
        *mem::replace(&mut self.state, enclosing)
    }

    /// The compiler's collection point: everything it has allocated is
    /// reachable through the open state chain (pending function names
    /// and the constants of every chunk under construction).
    fn collect_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let state: &FnState = &self.state;
        let roots = self.roots;
        self.heap.collect(|gray| {
            roots.mark(gray);
            let mut current = Some(state);
            while let Some(st) = current {
                if let Some(name) = &st.name {
                    mark_ref(name, gray);
                }
                for constant in st.chunk.constants() {
                    constant.trace(gray);
                }
                current = st.enclosing.as_deref();
            }
        });
    }

    //<<

    //>> Scopes and variables

    fn begin_scope(&mut self) {
        self.state.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state.scope_depth -= 1;
        loop {
            let captured = match self.state.locals.last() {
                Some(local) => match local.depth {
                    Some(depth) if depth > self.state.scope_depth => local.is_captured,
                    _ => break,
                },
                None => break,
            };
            if captured {
                self.emit(Instruction::CloseUpValue);
            } else {
                self.emit(Instruction::Pop);
            }
            self.state.locals.pop();
        }
    }

    fn add_local(&mut self, name: &'a str) {
        if self.state.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state.locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.state.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;

        let mut duplicate = false;
        for local in self.state.locals.iter().rev() {
            if let Some(depth) = local.depth {
                if depth < self.state.scope_depth {
                    break;
                }
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

    fn parse_variable(&mut self, msg: &str) -> u8 {
        self.consume(TokenType::Identifier, msg);
        self.declare_variable();
        if self.state.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        if self.state.scope_depth == 0 {
            return;
        }
        let depth = self.state.scope_depth;
        self.state.locals.last_mut().unwrap().depth = Some(depth);
    }

    fn define_variable(&mut self, global: u8) {
        if self.state.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(Instruction::DefineGlobal);
        self.emit_byte(global);
    }

    fn named_variable(&mut self, name: &'a str, can_assign: bool) {
        let (get_op, set_op, arg) = match self.state.resolve_local(name) {
            Err(msg) => {
                self.error(msg);
                return;
            }
            Ok(Some(index)) => (Instruction::GetLocal, Instruction::SetLocal, index),
            Ok(None) => match resolve_up_value(&mut self.state, name) {
                Err(msg) => {
                    self.error(msg);
                    return;
                }
                Ok(Some(index)) => (Instruction::GetUpValue, Instruction::SetUpValue, index),
                Ok(None) => {
                    let index = self.identifier_constant(name);
                    (Instruction::GetGlobal, Instruction::SetGlobal, index)
                }
            },
        };

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit(set_op);
        } else {
            self.emit(get_op);
        }
        self.emit_byte(arg);
    }

    //<<

    //>> Pratt rules

    fn rule(typ: TokenType) -> ParseRule<'a, 'r> {
        macro_rules! rule {
            ($prefix:expr, $infix:expr, $precedence:ident) => {
                ParseRule {
                    prefix: $prefix,
                    infix: $infix,
                    precedence: Precedence::$precedence,
                }
            };
        }

        match typ {
            TokenType::OParen => rule!(Some(Self::grouping), Some(Self::call), Call),
            TokenType::Period => rule!(None, Some(Self::dot), Call),
            TokenType::Minus => rule!(Some(Self::unary), Some(Self::binary), Term),
            TokenType::Plus => rule!(None, Some(Self::binary), Term),
            TokenType::Slash => rule!(None, Some(Self::binary), Factor),
            TokenType::Star => rule!(None, Some(Self::binary), Factor),
            TokenType::Bang => rule!(Some(Self::unary), None, None),
            TokenType::BangEqual => rule!(None, Some(Self::binary), Equality),
            TokenType::DEqual => rule!(None, Some(Self::binary), Equality),
            TokenType::Greater => rule!(None, Some(Self::binary), Comparison),
            TokenType::GreaterEqual => rule!(None, Some(Self::binary), Comparison),
            TokenType::Less => rule!(None, Some(Self::binary), Comparison),
            TokenType::LessEqual => rule!(None, Some(Self::binary), Comparison),
            TokenType::Identifier => rule!(Some(Self::variable), None, None),
            TokenType::String => rule!(Some(Self::string), None, None),
            TokenType::Number => rule!(Some(Self::number), None, None),
            TokenType::And => rule!(None, Some(Self::and_), And),
            TokenType::Or => rule!(None, Some(Self::or_), Or),
            TokenType::True => rule!(Some(Self::literal), None, None),
            TokenType::False => rule!(Some(Self::literal), None, None),
            TokenType::Nil => rule!(Some(Self::literal), None, None),
            TokenType::This => rule!(Some(Self::this_), None, None),
            TokenType::Super => rule!(Some(Self::super_), None, None),
            _ => rule!(None, None, None),
        }
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = match Self::rule(self.previous.typ).prefix {
            Some(prefix) => prefix,
            None => {
                self.error("Expect expression.");
                return;
            }
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.typ).precedence {
            self.advance();
            let infix = Self::rule(self.previous.typ).infix.unwrap();
            infix(self, can_assign);
        }

        if can_assign && self.matches(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap();
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        self.collect_if_needed();
        let string = self.heap.intern(content.to_string());
        self.emit_constant(Value::String(string));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.typ {
            TokenType::Nil => self.emit(Instruction::Nil),
            TokenType::True => self.emit(Instruction::True),
            TokenType::False => self.emit(Instruction::False),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenType::CParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.typ;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenType::Minus => self.emit(Instruction::Negate),
            TokenType::Bang => self.emit(Instruction::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.typ;
        self.parse_precedence(Self::rule(op).precedence.next());
        match op {
            TokenType::Plus => self.emit(Instruction::Add),
            TokenType::Minus => self.emit(Instruction::Subtract),
            TokenType::Star => self.emit(Instruction::Multiply),
            TokenType::Slash => self.emit(Instruction::Divide),
            TokenType::DEqual => self.emit(Instruction::Equal),
            TokenType::BangEqual => {
                self.emit(Instruction::Equal);
                self.emit(Instruction::Not);
            }
            TokenType::Greater => self.emit(Instruction::Greater),
            TokenType::GreaterEqual => {
                self.emit(Instruction::Less);
                self.emit(Instruction::Not);
            }
            TokenType::Less => self.emit(Instruction::Less),
            TokenType::LessEqual => {
                self.emit(Instruction::Greater);
                self.emit(Instruction::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Instruction::JumpIfFalse);
        self.emit(Instruction::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Instruction::JumpIfFalse);
        let end_jump = self.emit_jump(Instruction::Jump);
        self.patch_jump(else_jump);
        self.emit(Instruction::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.lexeme, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.class_state.is_none() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match &self.class_state {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.")
            }
            _ => {}
        }

        self.consume(TokenType::Period, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable("this", false);
        if self.matches(TokenType::OParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit(Instruction::SuperInvoke);
            self.emit_byte(name);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit(Instruction::GetSuper);
            self.emit_byte(name);
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit(Instruction::Call);
        self.emit_byte(argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit(Instruction::SetProperty);
            self.emit_byte(name);
        } else if self.matches(TokenType::OParen) {
            let argc = self.argument_list();
            self.emit(Instruction::Invoke);
            self.emit_byte(name);
            self.emit_byte(argc);
        } else {
            self.emit(Instruction::GetProperty);
            self.emit_byte(name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u8 = 0;
        if !self.check(TokenType::CParen) {
            loop {
                self.expression();
                if argc == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    argc += 1;
                }
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::CParen, "Expect ')' after arguments.");
        argc
    }

    //<<

    //>> Declarations and statements

    fn declaration(&mut self) {
        if self.matches(TokenType::Class) {
            self.class_declaration();
        } else if self.matches(TokenType::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.matches(TokenType::Equal) {
            self.expression();
        } else {
            self.emit(Instruction::Nil);
        }
        self.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // initialized before the body compiles, so it can recurse
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.push_state(kind);
        self.begin_scope();

        self.consume(TokenType::OParen, "Expect '(' after function name.");
        if !self.check(TokenType::CParen) {
            loop {
                if self.state.arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.state.arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::CParen, "Expect ')' after parameters.");
        self.consume(TokenType::OBrace, "Expect '{' before function body.");
        self.block();

        self.collect_if_needed();
        let state = self.pop_state();
        let up_values = state.up_values;
        let function = self.heap.alloc(Function {
            name: state.name,
            arity: state.arity,
            upvalue_count: up_values.len(),
            chunk: state.chunk,
        });

        let index = self.make_constant(Value::Function(function));
        self.emit(Instruction::Closure);
        self.emit_byte(index);
        for up_value in &up_values {
            self.emit_byte(up_value.is_local as u8);
            self.emit_byte(up_value.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit(Instruction::Class);
        self.emit_byte(name_constant);
        self.define_variable(name_constant);

        self.class_state = Some(Box::new(ClassState {
            has_superclass: false,
            enclosing: self.class_state.take(),
        }));

        if self.matches(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            // the superclass lives in a synthetic local so methods can
            // close over it for `super`
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit(Instruction::Inherit);
            self.class_state.as_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::OBrace, "Expect '{' before class body.");
        while !self.check(TokenType::CBrace) && !self.check(TokenType::EOF) {
            self.method();
        }
        self.consume(TokenType::CBrace, "Expect '}' after class body.");
        self.emit(Instruction::Pop);

        if self.class_state.as_ref().unwrap().has_superclass {
            self.end_scope();
        }
        self.class_state = self.class_state.take().unwrap().enclosing;
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let constant = self.identifier_constant(name);

        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);

        self.emit(Instruction::Method);
        self.emit_byte(constant);
    }

    fn statement(&mut self) {
        if self.matches(TokenType::Print) {
            self.print_statement();
        } else if self.matches(TokenType::For) {
            self.for_statement();
        } else if self.matches(TokenType::If) {
            self.if_statement();
        } else if self.matches(TokenType::Return) {
            self.return_statement();
        } else if self.matches(TokenType::While) {
            self.while_statement();
        } else if self.matches(TokenType::OBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::CBrace) && !self.check(TokenType::EOF) {
            self.declaration();
        }
        self.consume(TokenType::CBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit(Instruction::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit(Instruction::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::OParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::CParen, "Expect ')' after condition.");

        // both arms pop the condition
        let then_jump = self.emit_jump(Instruction::JumpIfFalse);
        self.emit(Instruction::Pop);
        self.statement();
        let else_jump = self.emit_jump(Instruction::Jump);

        self.patch_jump(then_jump);
        self.emit(Instruction::Pop);
        if self.matches(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn return_statement(&mut self) {
        if self.state.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.state.kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit(Instruction::Return);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.state.chunk.len();
        self.consume(TokenType::OParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::CParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Instruction::JumpIfFalse);
        self.emit(Instruction::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(Instruction::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::OParen, "Expect '(' after 'for'.");
        if self.matches(TokenType::Semicolon) {
            // no initializer
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.state.chunk.len();
        let mut exit_jump = None;
        if !self.matches(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Instruction::JumpIfFalse));
            self.emit(Instruction::Pop);
        }

        if !self.matches(TokenType::CParen) {
            // the increment textually precedes the body but runs after
            // it: jump over it, run it on the way back to the condition
            let body_jump = self.emit_jump(Instruction::Jump);
            let increment_start = self.state.chunk.len();
            self.expression();
            self.emit(Instruction::Pop);
            self.consume(TokenType::CParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(Instruction::Pop);
        }
        self.end_scope();
    }

    //<<
}

#[cfg(test)]
mod tests {
    use super::*;

    pub struct ErrorsTracker {
        errors: Vec<Report>,
    }

    impl ErrorsTracker {
        pub fn new() -> Self {
            ErrorsTracker { errors: Vec::new() }
        }
    }

    impl Reporter for ErrorsTracker {
        fn warning(&mut self, _report: Report) {}

        fn error(&mut self, report: Report) {
            self.errors.push(report);
        }
    }

    // the heap is returned alongside the function so weak refs inside
    // the constant pool stay upgradeable
    fn compile_ok(source: &str) -> (Heap, ObjectRoot<Function>) {
        let mut heap = Heap::new();
        let mut tracker = ErrorsTracker::new();
        match compile(source, &mut heap, &mut tracker, &()) {
            Ok(function) => (heap, function),
            Err(()) => {
                for report in &tracker.errors {
                    eprintln!("{}", report);
                }
                panic!("compiling {:?} failed", source);
            }
        }
    }

    fn first_error(source: &str) -> String {
        let mut heap = Heap::new();
        let mut tracker = ErrorsTracker::new();
        assert!(
            compile(source, &mut heap, &mut tracker, &()).is_err(),
            "compiling {:?} succeeded, but it should have failed",
            source
        );
        tracker.errors[0].msg.clone()
    }

    fn opcodes(function: &ObjectRoot<Function>) -> Vec<Instruction> {
        let chunk = &function.content.chunk;
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < chunk.len() {
            let instr = Instruction::try_from(chunk.byte(offset)).unwrap();
            out.push(instr);
            offset += 1 + match instr {
                Instruction::Constant
                | Instruction::GetLocal
                | Instruction::SetLocal
                | Instruction::GetGlobal
                | Instruction::DefineGlobal
                | Instruction::SetGlobal
                | Instruction::GetUpValue
                | Instruction::SetUpValue
                | Instruction::GetProperty
                | Instruction::SetProperty
                | Instruction::GetSuper
                | Instruction::Call
                | Instruction::Class
                | Instruction::Method => 1,
                Instruction::Jump
                | Instruction::JumpIfFalse
                | Instruction::Loop
                | Instruction::Invoke
                | Instruction::SuperInvoke => 2,
                Instruction::Closure => {
                    let index = chunk.byte(offset + 1) as usize;
                    1 + 2 * chunk.constant(index).as_function().content.upvalue_count
                }
                _ => 0,
            };
        }
        out
    }

    #[test]
    fn precedence_drives_emission_order() {
        let (_heap, function) = compile_ok("print 1 + 2 * 3;");
        assert_eq!(
            opcodes(&function),
            vec![
                Instruction::Constant,
                Instruction::Constant,
                Instruction::Constant,
                Instruction::Multiply,
                Instruction::Add,
                Instruction::Print,
                Instruction::Nil,
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn globals_by_name_locals_by_slot() {
        let (_heap, function) = compile_ok("var a = 1; { var b = a; b = 2; }");
        assert_eq!(
            opcodes(&function),
            vec![
                Instruction::Constant,
                Instruction::DefineGlobal,
                Instruction::GetGlobal,
                Instruction::Constant,
                Instruction::SetLocal,
                Instruction::Pop,
                Instruction::Pop,
                Instruction::Nil,
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn closures_resolve_upvalues() {
        let (_heap, function) = compile_ok(
            "fun outer() { var x = 1; fun inner() { x = x + 1; } inner(); }",
        );
        let outer = function
            .content
            .chunk
            .constants()
            .iter()
            .find_map(|c| match c {
                Value::Function(f) => Some(f.upgrade().unwrap()),
                _ => None,
            })
            .unwrap();
        let inner = outer
            .content
            .chunk
            .constants()
            .iter()
            .find_map(|c| match c {
                Value::Function(f) => Some(f.upgrade().unwrap()),
                _ => None,
            })
            .unwrap();
        assert_eq!(outer.content.upvalue_count, 0);
        assert_eq!(inner.content.upvalue_count, 1);
    }

    #[test]
    fn captured_locals_close_at_scope_exit() {
        let (_heap, function) = compile_ok("{ var x = 1; fun f() { x = 2; } }");
        let ops = opcodes(&function);
        assert!(ops.contains(&Instruction::CloseUpValue));
    }

    #[test]
    fn invalid_assignment_target() {
        assert_eq!(first_error("a * b = 1;"), "Invalid assignment target.");
    }

    #[test]
    fn return_outside_function() {
        assert_eq!(first_error("return 1;"), "Can't return from top-level code.");
    }

    #[test]
    fn duplicate_local() {
        assert_eq!(
            first_error("{ var a = 1; var a = 2; }"),
            "Already a variable with this name in this scope."
        );
    }

    #[test]
    fn self_referential_initializer() {
        assert_eq!(
            first_error("{ var a = a; }"),
            "Can't read local variable in its own initializer."
        );
    }

    #[test]
    fn this_outside_class() {
        assert_eq!(
            first_error("print this;"),
            "Can't use 'this' outside of a class."
        );
    }

    #[test]
    fn super_without_superclass() {
        assert_eq!(
            first_error("class A { f() { super.f(); } }"),
            "Can't use 'super' in a class with no superclass."
        );
    }

    #[test]
    fn class_inheriting_from_itself() {
        assert_eq!(
            first_error("class A < A {}"),
            "A class can't inherit from itself."
        );
    }

    #[test]
    fn initializer_cannot_return_value() {
        assert_eq!(
            first_error("class A { init() { return 1; } }"),
            "Can't return a value from an initializer."
        );
    }

    #[test]
    fn shadowing_outer_scope_is_fine() {
        compile_ok("var a = 1; { var a = 2; { var a = 3; } }");
    }

    #[test]
    fn recovery_reports_later_errors() {
        let mut heap = Heap::new();
        let mut tracker = ErrorsTracker::new();
        let result = compile("var 1; print this;", &mut heap, &mut tracker, &());
        assert!(result.is_err());
        // panic mode cleared at the statement boundary, so both surface
        assert_eq!(tracker.errors.len(), 2);
        assert_eq!(tracker.errors[0].msg, "Expect variable name.");
        assert_eq!(tracker.errors[1].msg, "Can't use 'this' outside of a class.");
    }
}
