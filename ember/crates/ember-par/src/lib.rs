//! Single-pass parser and bytecode code generator.
//!
//! There is no intermediate AST: [`Compiler`] walks the token stream with a
//! single token of lookahead and, for every construct, emits bytecode
//! directly into the [`function_state::FunctionState`] currently on top of
//! its function stack. An expression doesn't produce a node, it produces an
//! [`expr::Expression`] -- a small descriptor saying where its value
//! currently lives (a constant, a register, an open call, a pending jump
//! test) -- and materializing that value into a concrete register or RK
//! operand happens lazily, at the point something downstream needs it. This
//! is the same structure RocketVM's `Parser.c`/`Parser.h` use, adapted from
//! a hand-rolled C parser/codegen pair to Rust's ownership rules: one
//! `FunctionState` per nested function body, pushed and popped as
//! `function ... end` is entered and left, with name resolution walking the
//! stack outward to thread upvalue chains through intermediate functions.

mod calls;
pub mod error;
pub mod expr;
mod function_state;
pub mod jump;
mod stmt;

use ember_gc::{Gc, Heap};
use ember_lex::{Lexer, Token};
use ember_util::{Handler, Span};
use ember_value::{Prototype, StringPool};

pub use error::CompileError;
use error::{PResult, ParseAbort};
use function_state::FunctionState;

/// Drives the token stream and owns the stack of in-progress function
/// bodies. Lives only for the duration of a single `compile` call.
pub struct Compiler<'a> {
    lexer: Lexer<'a>,
    current: Token,
    line: u32,
    heap: &'a Heap,
    strings: &'a StringPool,
    handler: &'a Handler,
    chunk_name: &'a str,
    functions: Vec<FunctionState>,
}

impl<'a> Compiler<'a> {
    fn new(source: &'a str, chunk_name: &'a str, heap: &'a Heap, strings: &'a StringPool, handler: &'a Handler) -> Self {
        let mut lexer = Lexer::new(source, handler);
        let current = lexer.next_token();
        let line = lexer.current_line();
        Compiler {
            lexer,
            current,
            line,
            heap,
            strings,
            handler,
            chunk_name,
            functions: Vec::new(),
        }
    }

    // -- function-state access ---------------------------------------------

    pub(crate) fn fs(&self) -> &FunctionState {
        self.functions.last().expect("no active function")
    }

    pub(crate) fn fs_mut(&mut self) -> &mut FunctionState {
        self.functions.last_mut().expect("no active function")
    }

    // -- token stream --------------------------------------------------------

    /// Consumes the current token, returning it, and pulls the next one
    /// into `self.current`.
    pub(crate) fn advance(&mut self) -> Token {
        let next = self.lexer.next_token();
        let next_line = self.lexer.current_line();
        let previous = std::mem::replace(&mut self.current, next);
        self.line = next_line;
        previous
    }

    pub(crate) fn check(&self, token: &Token) -> bool {
        &self.current == token
    }

    /// Looks one token past `self.current` without consuming anything --
    /// resolves the `Name '='` vs. bare `Name`-as-expression ambiguity at
    /// the start of a table-constructor field. Cloning the lexer is cheap
    /// (every field is `Copy`); the cloned scanner is thrown away after one
    /// token.
    pub(crate) fn peek_second(&self) -> Token {
        self.lexer.clone().next_token()
    }

    /// Consumes `token` if it's current, else reports a syntax error naming
    /// `what` (e.g. `")"`, `"end"`) and aborts.
    pub(crate) fn expect(&mut self, token: Token, what: &str) -> PResult<()> {
        if self.current == token {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("'{what}' expected")))
        }
    }

    pub(crate) fn expect_ident(&mut self) -> PResult<String> {
        if let Token::Ident(name) = self.current.clone() {
            self.advance();
            Ok(name)
        } else {
            Err(self.error("<name> expected".to_string()))
        }
    }

    /// Reports a syntax error at the current line and returns the sentinel
    /// that unwinds the recursive-descent call stack via `?`.
    pub(crate) fn error(&mut self, message: String) -> ParseAbort {
        self.handler.error(message, Span::point(self.line, 1));
        ParseAbort
    }

    // -- top level ------------------------------------------------------------

    /// Parses the whole token stream as a chunk: an implicit vararg
    /// function of zero parameters whose body is a block followed by `Eof`.
    fn chunk(&mut self) -> PResult<Prototype> {
        self.functions.push(FunctionState::new(0, true));
        self.fs_mut().begin_block(false);
        self.block()?;
        if !self.check(&Token::Eof) {
            return Err(self.error("'<eof>' expected".to_string()));
        }
        let line = self.line;
        self.fs_mut().end_block(line);
        let fs = self.functions.pop().expect("chunk pushed a function state");
        Ok(fs.into_prototype(self.chunk_name.to_string()))
    }
}

/// Compiles `source` into a top-level function prototype, allocated on
/// `heap`. Errors are reported to `handler`; a `CompileError` return means
/// at least one diagnostic was emitted there -- the caller doesn't get a
/// second copy of the message.
pub fn compile(
    source: &str,
    chunk_name: &str,
    heap: &Heap,
    strings: &StringPool,
    handler: &Handler,
) -> Result<Gc<Prototype>, CompileError> {
    let mut compiler = Compiler::new(source, chunk_name, heap, strings, handler);
    match compiler.chunk() {
        Ok(prototype) => Ok(heap.alloc(prototype)),
        Err(ParseAbort) => Err(CompileError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_gc::GcConfig;

    fn compile_ok(source: &str) -> Gc<Prototype> {
        let heap = Heap::new(GcConfig::default());
        let strings = StringPool::new();
        let handler = Handler::new();
        let proto = compile(source, "test", &heap, &strings, &handler);
        assert!(!handler.has_errors(), "unexpected errors: {:?}", handler.diagnostics());
        proto.expect("compile should succeed")
    }

    #[test]
    fn empty_chunk_compiles() {
        let proto = compile_ok("");
        assert_eq!(proto.num_params, 0);
        assert!(proto.is_vararg);
    }

    #[test]
    fn local_assignment_compiles() {
        let proto = compile_ok("local x = 1 + 2");
        assert!(!proto.code.is_empty());
    }

    #[test]
    fn syntax_error_is_reported() {
        let heap = Heap::new(GcConfig::default());
        let strings = StringPool::new();
        let handler = Handler::new();
        let result = compile("local = 1", "test", &heap, &strings, &handler);
        assert!(result.is_err());
        assert!(handler.has_errors());
    }

    fn opcodes(proto: &Prototype) -> Vec<ember_value::Opcode> {
        proto.code.iter().map(|i| i.opcode()).collect()
    }

    #[test]
    fn upvalue_sharing_threads_through_nested_closures() {
        let proto = compile_ok(
            r#"
            local function counter()
                local n = 0
                local function incr()
                    n = n + 1
                    return n
                end
                return incr
            end
            return counter
            "#,
        );
        // `counter`'s prototype is the first closure built in the chunk;
        // its body declares `incr`, which must capture `n` as an upvalue
        // rather than re-resolving it as a global.
        let counter_proto = &proto.prototypes[0];
        let incr_proto = &counter_proto.prototypes[0];
        assert_eq!(incr_proto.upvalues.len(), 1);
        assert!(opcodes(incr_proto).contains(&ember_value::Opcode::GetUpval));
        assert!(opcodes(incr_proto).contains(&ember_value::Opcode::SetUpval));
    }

    #[test]
    fn and_or_short_circuit_to_test_jumps() {
        let proto = compile_ok("local x = 1 and 2 or 3");
        assert!(opcodes(&proto).contains(&ember_value::Opcode::Jmp));
    }

    #[test]
    fn numeric_for_emits_forprep_and_forloop() {
        let proto = compile_ok("local sum = 0\nfor i = 1, 10 do sum = sum + i end\nreturn sum");
        let ops = opcodes(&proto);
        assert!(ops.contains(&ember_value::Opcode::ForPrep));
        assert!(ops.contains(&ember_value::Opcode::ForLoop));
    }

    #[test]
    fn generic_for_emits_tforloop() {
        let proto = compile_ok("for k, v in pairs({}) do end");
        assert!(opcodes(&proto).contains(&ember_value::Opcode::TForLoop));
    }

    #[test]
    fn table_constructor_emits_newtable_and_settable() {
        let proto = compile_ok("local t = { 1, 2, x = 3, [4] = 5 }");
        let ops = opcodes(&proto);
        assert!(ops.contains(&ember_value::Opcode::NewTable));
        assert_eq!(ops.iter().filter(|o| **o == ember_value::Opcode::SetTable).count(), 4);
    }

    #[test]
    fn multi_assignment_swap_compiles() {
        let proto = compile_ok("local a, b = 1, 2\na, b = b, a");
        assert!(!proto.code.is_empty());
    }

    #[test]
    fn method_call_compiles_with_implicit_self() {
        let proto = compile_ok("local obj = {}\nfunction obj:method(x) return x end\nreturn obj:method(1)");
        let method_proto = &proto.prototypes[0];
        // implicit `self` makes this a one-parameter-visible, two-slot body.
        assert_eq!(method_proto.num_params, 2);
    }

    #[test]
    fn return_forwards_open_call_results() {
        let proto = compile_ok("local function f() return 1, 2 end\nreturn f()");
        assert!(opcodes(&proto).contains(&ember_value::Opcode::Return));
    }

    #[test]
    fn vararg_function_compiles() {
        let proto = compile_ok("local function f(...) return ... end\nreturn f(1, 2, 3)");
        let f_proto = &proto.prototypes[0];
        assert!(f_proto.is_vararg);
    }

    #[test]
    fn repeat_until_sees_loop_locals() {
        let proto = compile_ok("local i = 0\nrepeat\n  local done = i >= 3\n  i = i + 1\nuntil done");
        assert!(!proto.code.is_empty());
    }
}
