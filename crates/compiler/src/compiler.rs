//! Single-pass bytecode compiler
//!
//! A Pratt parser that emits a chunk per function as it reads tokens.
//! Each function under compilation tracks its locals (with scope depth),
//! its upvalue descriptors, and whether it is a method or initializer;
//! a class-nesting stack resolves 这 and 超. Identifiers that are neither
//! local nor captured resolve to globals by name at runtime.
//!
//! On error the compiler enters panic mode, synchronizes at the next
//! statement boundary, and keeps parsing so one pass reports every
//! diagnostic; no function object is produced.

use tracing::debug;
use yan_core::{Heap, MAX_CONSTANTS, Obj, ObjFunction, ObjRef, OpCode, Value};

use crate::scanner::{Token, TokenKind, tokenize};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_PARAMS: usize = 255;
const MAX_LIST_ITEMS: usize = 255;

/// Compile a source string into a top-level function object allocated on
/// `heap`. `Err` carries every collected diagnostic, one per line.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, String> {
    let mut errors = Vec::new();
    let tokens: Vec<Token> = tokenize(source)
        .into_iter()
        .filter(|t| {
            if t.kind == TokenKind::Error {
                errors.push(format!("【行 {}】错误：{}", t.line, t.text));
                false
            } else {
                true
            }
        })
        .collect();

    let mut compiler = Compiler {
        heap,
        tokens,
        current: 0,
        previous: 0,
        functions: vec![FunctionState::new(FunctionKind::Script, None)],
        classes: Vec::new(),
        errors,
        panic_mode: false,
    };
    compiler.run()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    /// -1 while the initializer is still being compiled.
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct FunctionState {
    function: ObjFunction,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl FunctionState {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot 0 belongs to the callee: the receiver in methods, unnamed
        // otherwise.
        let slot_zero = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "这"
        } else {
            ""
        };
        FunctionState {
            function: ObjFunction::new(name),
            kind,
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Equality,
    Comparison,
    Shift,
    Term,
    Factor,
    Unary,
    Call,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::BitOr,
            Precedence::BitOr => Precedence::BitXor,
            Precedence::BitXor => Precedence::BitAnd,
            Precedence::BitAnd => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Shift,
            Precedence::Shift => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Call,
        }
    }
}

type ParseFn<'a> = fn(&mut Compiler<'a>, bool);

struct Rule<'a> {
    prefix: Option<ParseFn<'a>>,
    infix: Option<ParseFn<'a>>,
    precedence: Precedence,
}

fn rule<'a>(kind: TokenKind) -> Rule<'a> {
    use TokenKind::*;
    let (prefix, infix, precedence): (Option<ParseFn<'a>>, Option<ParseFn<'a>>, Precedence) = match kind {
        LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        LeftBracket => (
            Some(Compiler::list_literal),
            Some(Compiler::subscript),
            Precedence::Call,
        ),
        Dot => (None, Some(Compiler::dot), Precedence::Call),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => (None, Some(Compiler::binary), Precedence::Term),
        Star | Slash | Percent => (None, Some(Compiler::binary), Precedence::Factor),
        Ampersand => (None, Some(Compiler::binary), Precedence::BitAnd),
        Caret => (None, Some(Compiler::binary), Precedence::BitXor),
        Pipe => (None, Some(Compiler::binary), Precedence::BitOr),
        ShiftLeft | ShiftRight => (None, Some(Compiler::binary), Precedence::Shift),
        Tilde | Bang => (Some(Compiler::unary), None, Precedence::None),
        PlusPlus | MinusMinus => (Some(Compiler::prefix_step), None, Precedence::None),
        BangEqual | EqualEqual => (None, Some(Compiler::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            (None, Some(Compiler::binary), Precedence::Comparison)
        }
        Identifier => (Some(Compiler::variable), None, Precedence::None),
        String => (Some(Compiler::string), None, Precedence::None),
        Number => (Some(Compiler::number), None, Precedence::None),
        And => (None, Some(Compiler::and_expr), Precedence::And),
        Or => (None, Some(Compiler::or_expr), Precedence::Or),
        True | False | Nil => (Some(Compiler::literal), None, Precedence::None),
        This => (Some(Compiler::this_expr), None, Precedence::None),
        Super => (Some(Compiler::super_expr), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    Rule {
        prefix,
        infix,
        precedence,
    }
}

pub(crate) struct Compiler<'a> {
    heap: &'a mut Heap,
    tokens: Vec<Token>,
    current: usize,
    previous: usize,
    functions: Vec<FunctionState>,
    classes: Vec<ClassState>,
    errors: Vec<String>,
    panic_mode: bool,
}

impl<'a> Compiler<'a> {
    fn run(mut self) -> Result<ObjRef, String> {
        while !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.emit_return();
        if self.errors.is_empty() {
            let Some(state) = self.functions.pop() else {
                unreachable!("script compiler state missing");
            };
            debug!(
                code_len = state.function.chunk.code.len(),
                constants = state.function.chunk.constants.len(),
                "script compiled"
            );
            Ok(self.heap.alloc(Obj::Function(state.function)))
        } else {
            Err(self.errors.join("\n"))
        }
    }

    // ----- token plumbing -----

    fn token(&self, index: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[index.min(last)]
    }

    fn cur_kind(&self) -> TokenKind {
        self.token(self.current).kind
    }

    fn prev_kind(&self) -> TokenKind {
        self.token(self.previous).kind
    }

    fn prev_text(&self) -> String {
        self.token(self.previous).text.clone()
    }

    fn prev_line(&self) -> u32 {
        self.token(self.previous).line
    }

    fn advance(&mut self) {
        self.previous = self.current;
        if self.current + 1 < self.tokens.len() {
            self.current += 1;
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.cur_kind() == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, index: usize, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let token = self.token(index);
        let line = token.line;
        let place = if token.kind == TokenKind::Eof {
            "结尾处".to_string()
        } else {
            format!("「{}」处", token.text)
        };
        self.errors
            .push(format!("【行 {line}】错误（{place}）：{message}"));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.prev_kind() == TokenKind::Semicolon {
                return;
            }
            match self.cur_kind() {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ----- emit helpers -----

    fn state(&mut self) -> &mut FunctionState {
        let last = self.functions.len() - 1;
        &mut self.functions[last]
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.prev_line();
        self.state().function.chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        if self.state().kind == FunctionKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.state().function.chunk.add_constant(value);
        if index >= MAX_CONSTANTS {
            self.error("一个块中的常量太多。");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, index);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.state().function.chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let distance = self.state().function.chunk.code.len() - offset - 2;
        if distance > u16::MAX as usize {
            self.error("跳转距离太远。");
            return;
        }
        self.state()
            .function
            .chunk
            .patch_u16(offset, distance as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let distance = self.state().function.chunk.code.len() - loop_start + 2;
        if distance > u16::MAX as usize {
            self.error("循环体太大。");
            return;
        }
        self.emit_byte((distance >> 8) as u8);
        self.emit_byte((distance & 0xff) as u8);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.heap.intern(name);
        self.make_constant(Value::Obj(interned))
    }

    // ----- scopes and variables -----

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state().scope_depth -= 1;
        loop {
            let state = self.state();
            match state.locals.last() {
                Some(local) if local.depth > state.scope_depth => {
                    let captured = local.is_captured;
                    state.locals.pop();
                    if captured {
                        self.emit_op(OpCode::CloseUpvalue);
                    } else {
                        self.emit_op(OpCode::Pop);
                    }
                }
                _ => break,
            }
        }
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.prev_text();
        let state = self.state();
        let depth = state.scope_depth;
        let shadows = state
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == -1 || l.depth >= depth)
            .any(|l| l.name == name);
        if shadows {
            self.error("作用域中已经有叫这个名字的变量。");
            return;
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: String) {
        if self.state().locals.len() >= MAX_LOCALS {
            self.error("功能中的局部变量太多。");
            return;
        }
        self.state().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let state = self.state();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        let name = self.prev_text();
        self.identifier_constant(&name)
    }

    fn resolve_local(&mut self, level: usize, name: &str) -> Option<usize> {
        let mut uninitialized = false;
        let found = self.functions[level]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, l)| {
                if l.depth == -1 {
                    uninitialized = true;
                }
                i
            });
        if uninitialized {
            self.error("无法在变量自己的初始化器中读取它。");
        }
        found
    }

    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(level - 1, name) {
            self.functions[level - 1].locals[local].is_captured = true;
            return Some(self.add_upvalue(level, local as u8, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(level - 1, name) {
            return Some(self.add_upvalue(level, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool) -> u8 {
        let existing = self.functions[level]
            .upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local);
        if let Some(i) = existing {
            return i as u8;
        }
        if self.functions[level].upvalues.len() >= MAX_UPVALUES {
            self.error("功能中的闭包变量太多。");
            return 0;
        }
        self.functions[level].upvalues.push(UpvalueDesc { index, is_local });
        let count = self.functions[level].upvalues.len();
        self.functions[level].function.upvalue_count = count;
        (count - 1) as u8
    }

    /// Get/set opcodes and operand for a name in the current function.
    fn variable_ops(&mut self, name: &str) -> (OpCode, OpCode, u8) {
        let level = self.functions.len() - 1;
        if let Some(slot) = self.resolve_local(level, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot as u8)
        } else if let Some(slot) = self.resolve_upvalue(level, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        }
    }

    fn load_variable(&mut self, name: &str) {
        let (get_op, _, arg) = self.variable_ops(name);
        self.emit_op_byte(get_op, arg);
    }

    // ----- expressions -----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.prev_kind()).prefix else {
            self.error("期望表达式。");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.cur_kind()).precedence {
            self.advance();
            if let Some(infix) = rule(self.prev_kind()).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("无效的赋值目标。");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "期望「)」在表达式之后。");
    }

    fn number(&mut self, _can_assign: bool) {
        match self.prev_text().parse::<f64>() {
            Ok(n) => self.emit_constant(Value::Number(n)),
            Err(_) => self.error("无效的数字字面量。"),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let text = self.prev_text();
        let interned = self.heap.intern(&text);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.prev_kind() {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn list_literal(&mut self, _can_assign: bool) {
        let mut count = 0usize;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if count > MAX_LIST_ITEMS {
                    self.error("列表字面量中的元素太多。");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "期望「]」在列表元素之后。");
        self.emit_op_byte(OpCode::BuildList, count as u8);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.prev_kind();
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Tilde => self.emit_op(OpCode::BitwiseNot),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.prev_kind();
        let precedence = rule(operator).precedence.next();
        self.parse_precedence(precedence);
        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulo),
            TokenKind::Ampersand => self.emit_op(OpCode::BitwiseAnd),
            TokenKind::Pipe => self.emit_op(OpCode::BitwiseOr),
            TokenKind::Caret => self.emit_op(OpCode::BitwiseXor),
            TokenKind::ShiftLeft => self.emit_op(OpCode::ShiftLeft),
            TokenKind::ShiftRight => self.emit_op(OpCode::ShiftRight),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and_expr(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    /// Prefix ++/--: load, step, store; leaves the new value.
    fn prefix_step(&mut self, _can_assign: bool) {
        let step = if self.prev_kind() == TokenKind::PlusPlus {
            OpCode::Increment
        } else {
            OpCode::Decrement
        };
        self.consume(TokenKind::Identifier, "递增或递减的目标必须是变量。");
        let name = self.prev_text();
        let (get_op, set_op, arg) = self.variable_ops(&name);
        self.emit_op_byte(get_op, arg);
        self.emit_op(step);
        self.emit_op_byte(set_op, arg);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.prev_text();
        let (get_op, set_op, arg) = self.variable_ops(&name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else if can_assign && self.match_compound() {
            let op = self.compound_op();
            self.emit_op_byte(get_op, arg);
            self.expression();
            self.emit_op(op);
            self.emit_op_byte(set_op, arg);
        } else if self.match_token(TokenKind::PlusPlus) {
            // Postfix: leave the old value as the expression result.
            self.emit_op_byte(get_op, arg);
            self.emit_op(OpCode::Dup);
            self.emit_op(OpCode::Increment);
            self.emit_op_byte(set_op, arg);
            self.emit_op(OpCode::Pop);
        } else if self.match_token(TokenKind::MinusMinus) {
            self.emit_op_byte(get_op, arg);
            self.emit_op(OpCode::Dup);
            self.emit_op(OpCode::Decrement);
            self.emit_op_byte(set_op, arg);
            self.emit_op(OpCode::Pop);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    fn match_compound(&mut self) -> bool {
        match self.cur_kind() {
            TokenKind::PlusEqual
            | TokenKind::MinusEqual
            | TokenKind::StarEqual
            | TokenKind::SlashEqual
            | TokenKind::PercentEqual => {
                self.advance();
                true
            }
            _ => false,
        }
    }

    fn compound_op(&self) -> OpCode {
        match self.prev_kind() {
            TokenKind::PlusEqual => OpCode::Add,
            TokenKind::MinusEqual => OpCode::Subtract,
            TokenKind::StarEqual => OpCode::Multiply,
            TokenKind::SlashEqual => OpCode::Divide,
            TokenKind::PercentEqual => OpCode::Modulo,
            _ => unreachable!("compound op on non-compound token"),
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count = 0usize;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                count += 1;
                if count > MAX_PARAMS {
                    self.error("参数不能超过 255 个。");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "期望「)」在参数之后。");
        count.min(MAX_PARAMS) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "期望属性名在「.」之后。");
        let name = self.prev_text();
        let constant = self.identifier_constant(&name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, constant);
        } else if can_assign && self.match_compound() {
            let op = self.compound_op();
            self.emit_op(OpCode::Dup);
            self.emit_op_byte(OpCode::GetProperty, constant);
            self.expression();
            self.emit_op(op);
            self.emit_op_byte(OpCode::SetProperty, constant);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, constant);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(OpCode::GetProperty, constant);
        }
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "期望「]」在索引之后。");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetIndex);
        } else if can_assign && self.match_compound() {
            let op = self.compound_op();
            self.emit_op(OpCode::DoubleDup);
            self.emit_op(OpCode::GetIndex);
            self.expression();
            self.emit_op(op);
            self.emit_op(OpCode::SetIndex);
        } else {
            self.emit_op(OpCode::GetIndex);
        }
    }

    fn this_expr(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("无法在类之外使用「这」。");
            return;
        }
        self.load_variable("这");
    }

    fn super_expr(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => {
                self.error("无法在类之外使用「超」。");
            }
            Some(class) if !class.has_superclass => {
                self.error("无法在没有超类的类中使用「超」。");
            }
            Some(_) => {}
        }
        self.consume(TokenKind::Dot, "期望「.」在「超」之后。");
        self.consume(TokenKind::Identifier, "期望超类方法名。");
        let name = self.prev_text();
        let constant = self.identifier_constant(&name);
        self.load_variable("这");
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.load_variable("超");
            self.emit_op_byte(OpCode::SuperInvoke, constant);
            self.emit_byte(arg_count);
        } else {
            self.load_variable("超");
            self.emit_op_byte(OpCode::GetSuper, constant);
        }
    }

    // ----- declarations and statements -----

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
        if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
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
        self.consume(TokenKind::RightBrace, "期望「}」在代码块之后。");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "期望「;」在表达式之后。");
        self.emit_op(OpCode::Pop);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("期望变量名。");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "期望「;」在变量声明之后。");
        self.define_variable(global);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "期望「(」在「如果」之后。");
        self.expression();
        self.consume(TokenKind::RightParen, "期望「)」在条件之后。");

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
        let loop_start = self.state().function.chunk.code.len();
        self.consume(TokenKind::LeftParen, "期望「(」在「而」之后。");
        self.expression();
        self.consume(TokenKind::RightParen, "期望「)」在条件之后。");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "期望「(」在「为」之后。");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.state().function.chunk.code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "期望「;」在循环条件之后。");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.state().function.chunk.code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "期望「)」在循环子句之后。");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::Script {
            self.error("无法从顶层代码返回。");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.state().kind == FunctionKind::Initializer {
                self.error("无法从初始化器中返回值。");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "期望「;」在返回值之后。");
            self.emit_op(OpCode::Return);
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("期望功能名。");
        self.mark_initialized();
        let name = self.prev_text();
        self.function(FunctionKind::Function, &name);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind, name: &str) {
        let name_ref = self.heap.intern(name);
        self.functions.push(FunctionState::new(kind, Some(name_ref)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "期望「(」在功能名之后。");
        if !self.check(TokenKind::RightParen) {
            loop {
                if usize::from(self.state().function.arity) >= MAX_PARAMS {
                    self.error_at_current("参数不能超过 255 个。");
                } else {
                    self.state().function.arity += 1;
                }
                let constant = self.parse_variable("期望参数名。");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "期望「)」在参数之后。");
        self.consume(TokenKind::LeftBrace, "期望「{」在功能体之前。");
        self.block();

        self.emit_return();
        let Some(state) = self.functions.pop() else {
            return;
        };
        let upvalues = state.upvalues;
        let function_ref = self.heap.alloc(Obj::Function(state.function));
        let constant = self.make_constant(Value::Obj(function_ref));
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in &upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "期望类名。");
        let class_name = self.prev_text();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();
        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "期望超类名。");
            let super_name = self.prev_text();
            self.variable(false);
            if super_name == class_name {
                self.error("类不能继承自己。");
            }
            self.begin_scope();
            self.add_local("超".to_string());
            self.define_variable(0);
            self.load_variable(&class_name);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.load_variable(&class_name);
        self.consume(TokenKind::LeftBrace, "期望「{」在类体之前。");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "期望「}」在类体之后。");
        self.emit_op(OpCode::Pop);

        let had_superclass = self.classes.pop().is_some_and(|c| c.has_superclass);
        if had_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "期望方法名。");
        let name = self.prev_text();
        let constant = self.identifier_constant(&name);
        let kind = if name == "初始化" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind, &name);
        self.emit_op_byte(OpCode::Method, constant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yan_core::Heap;

    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).unwrap();
        (heap, function)
    }

    fn ops(heap: &Heap, function: ObjRef) -> Vec<u8> {
        heap.function(function).chunk.code.clone()
    }

    #[test]
    fn test_var_declaration_bytecode() {
        let (heap, function) = compile_ok("变量 甲 = 1；");
        let code = ops(&heap, function);
        // Constant 0 is the variable name; the literal lands at index 1.
        assert_eq!(
            code,
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
    fn test_nested_function_captures_local_as_upvalue() {
        let (heap, function) = compile_ok(
            "功能 外(){ 变量 数 = 0；功能 内(){ 返回 数；} 返回 内；}",
        );
        // The inner function is reachable from the outer's constant pool.
        let outer = heap
            .function(function)
            .chunk
            .constants
            .iter()
            .find_map(|&v| match v {
                Value::Obj(r) => match heap.get(r) {
                    Obj::Function(f) if f.upvalue_count == 0 && f.arity == 0 => Some(r),
                    _ => None,
                },
                _ => None,
            })
            .unwrap();
        let inner = heap
            .function(outer)
            .chunk
            .constants
            .iter()
            .find_map(|&v| match v {
                Value::Obj(r) => match heap.get(r) {
                    Obj::Function(f) if f.upvalue_count == 1 => Some(r),
                    _ => None,
                },
                _ => None,
            });
        assert!(inner.is_some(), "inner function should capture one upvalue");
        // The outer function emits Closure followed by an is_local pair.
        let outer_code = ops(&heap, outer);
        let closure_at = outer_code
            .iter()
            .position(|&b| b == OpCode::Closure as u8)
            .unwrap();
        assert_eq!(outer_code[closure_at + 2], 1); // is_local
    }

    #[test]
    fn test_class_with_superclass_emits_inherit() {
        let (heap, function) = compile_ok("类 甲 {} 类 乙 < 甲 {}");
        assert!(ops(&heap, function).contains(&(OpCode::Inherit as u8)));
    }

    #[test]
    fn test_method_call_fuses_to_invoke() {
        let (heap, function) = compile_ok("变量 甲 = \"字\"；甲.长度()；");
        let code = ops(&heap, function);
        assert!(code.contains(&(OpCode::Invoke as u8)));
        assert!(!code.contains(&(OpCode::GetProperty as u8)));
    }

    #[test]
    fn test_missing_semicolon_reports_line() {
        let mut heap = Heap::new();
        let err = compile("变量 甲 = 1", &mut heap).unwrap_err();
        assert!(err.contains("【行 1】"), "got: {err}");
        assert!(err.contains("期望「;」"), "got: {err}");
    }

    #[test]
    fn test_top_level_return_is_an_error() {
        let mut heap = Heap::new();
        let err = compile("返回 1；", &mut heap).unwrap_err();
        assert!(err.contains("无法从顶层代码返回"), "got: {err}");
    }

    #[test]
    fn test_constant_pool_overflow_is_reported() {
        let mut heap = Heap::new();
        let source: String = (0..300).map(|i| format!("{i}；")).collect();
        let err = compile(&source, &mut heap).unwrap_err();
        assert!(err.contains("常量太多"), "got: {err}");
    }

    #[test]
    fn test_compound_subscript_assignment_uses_double_dup() {
        let (heap, function) = compile_ok("变量 表 = [1]；表[0] += 2；");
        let code = ops(&heap, function);
        assert!(code.contains(&(OpCode::DoubleDup as u8)));
        assert!(code.contains(&(OpCode::SetIndex as u8)));
    }

    #[test]
    fn test_postfix_increment_preserves_old_value() {
        let (heap, function) = compile_ok("变量 甲 = 1；甲++；");
        let code = ops(&heap, function);
        let dup_at = code.iter().position(|&b| b == OpCode::Dup as u8);
        assert!(dup_at.is_some());
        assert!(code.contains(&(OpCode::Increment as u8)));
    }
}
