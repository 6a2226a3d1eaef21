//! Expression representation and expression parsing.
//!
//! Every subexpression is reduced to an [`Expression`] descriptor rather
//! than an AST node -- there is no tree, only the running instruction
//! buffer and a small value describing where the result currently lives.
//! Materializing an expression into a register (or an RK operand) is
//! deferred until something downstream actually needs it, which is what
//! lets constant arithmetic fold away and lets locals and call results flow
//! straight into the operand slot of the next instruction instead of
//! through a redundant `Move`.

use ember_lex::Token;
use ember_value::{encode_rk_constant, is_rk_constant, rk_constant_index, Instruction, Opcode, Value};

use crate::error::PResult;
use crate::jump;
use crate::Compiler;

/// Where the key of a table-field expression lives: a register or an
/// already-RK-encodable constant slot.
#[derive(Clone, Copy, Debug)]
pub enum KeyRef {
    Register(u8),
    Constant(u32),
}

/// A deferred-emission expression result. See the module docs.
#[derive(Clone, Debug)]
pub enum Expression {
    Nil,
    True,
    False,
    Number(f64),
    /// A string literal, not yet interned -- interning happens lazily the
    /// first time it's actually needed as a constant, so a string built
    /// purely for, say, a `..` concatenation can intern once at its final
    /// use site.
    Str(String),
    Constant(u32),
    Local(u8),
    /// A value already materialized into a (temporary) register.
    Register(u8),
    /// `index` is the constant-table slot holding the global's name.
    Global(u32),
    Upvalue(u32),
    Field {
        table: u8,
        key: KeyRef,
    },
    /// An open call: results start at `base` and the call has not yet been
    /// adjusted to a fixed result count. `pc` is the index of the already
    /// emitted `Call` instruction, so adjusting the result count later is a
    /// direct rewrite rather than a second pass over the buffer.
    Call {
        base: u8,
        pc: usize,
    },
    VarArg {
        base: u8,
        pc: usize,
    },
    /// A boolean test pending materialization. `true_list`/`false_list`
    /// are jump-list heads (see [`crate::jump`]) that must be patched once
    /// the final destination for each outcome is known.
    Test {
        true_list: i32,
        false_list: i32,
    },
    Not(Box<Expression>),
}

impl<'a> Compiler<'a> {
    // -- entry points -----------------------------------------------------

    /// Parses a full expression (the lowest-precedence entry point: `or`).
    pub(crate) fn expr(&mut self) -> PResult<Expression> {
        self.expr_or()
    }

    fn expr_or(&mut self) -> PResult<Expression> {
        let mut lhs = self.expr_and()?;
        while self.check(&Token::Or) {
            let line = self.line;
            self.advance();
            let (true_list, mut false_list) = self.to_test(lhs, line)?;
            // `or`'s left truthy short-circuits; only the false branch
            // falls through to evaluate the right operand.
            jump::patch_here(&mut self.fs_mut().code, false_list);
            false_list = jump::NO_JUMP;
            let rhs = self.expr_and()?;
            let (rhs_true, rhs_false) = self.to_test(rhs, line)?;
            let combined_true = jump::concat(&mut self.fs_mut().code, true_list, rhs_true);
            lhs = Expression::Test {
                true_list: combined_true,
                false_list: jump::concat(&mut self.fs_mut().code, false_list, rhs_false),
            };
        }
        Ok(lhs)
    }

    fn expr_and(&mut self) -> PResult<Expression> {
        let mut lhs = self.expr_cmp()?;
        while self.check(&Token::And) {
            let line = self.line;
            self.advance();
            let (mut true_list, false_list) = self.to_test(lhs, line)?;
            jump::patch_here(&mut self.fs_mut().code, true_list);
            true_list = jump::NO_JUMP;
            let rhs = self.expr_cmp()?;
            let (rhs_true, rhs_false) = self.to_test(rhs, line)?;
            lhs = Expression::Test {
                true_list: jump::concat(&mut self.fs_mut().code, true_list, rhs_true),
                false_list: jump::concat(&mut self.fs_mut().code, false_list, rhs_false),
            };
        }
        Ok(lhs)
    }

    // Relational operators don't associate in Lua grammar (`a < b < c` is a
    // syntax error), so at most one comparison ever folds into `lhs` here --
    // no loop needed.
    fn expr_cmp(&mut self) -> PResult<Expression> {
        let lhs = self.expr_concat()?;
        let op = match self.current {
            Token::EqEq => Opcode::Eq,
            Token::NotEq => Opcode::Eq, // negated via `expect` below
            Token::Lt => Opcode::Lt,
            Token::GtEq => Opcode::Le, // a >= b  ==  b <= a
            Token::Gt => Opcode::Lt,   // a > b   ==  b < a
            Token::LtEq => Opcode::Le,
            _ => return Ok(lhs),
        };
        let negate = matches!(self.current, Token::NotEq);
        let swap = matches!(self.current, Token::GtEq | Token::Gt);
        let line = self.line;
        self.advance();
        let rhs = self.expr_concat()?;
        let (mut a, mut b) = (self.to_rk(lhs, line)?, self.to_rk(rhs, line)?);
        if swap {
            std::mem::swap(&mut a, &mut b);
        }
        let expect = if negate { 0 } else { 1 };
        self.fs_mut().emit_abc(op, expect, a, b, line);
        let jmp = self.open_jump(line);
        Ok(Expression::Test {
            true_list: jmp,
            false_list: jump::NO_JUMP,
        })
    }

    fn expr_concat(&mut self) -> PResult<Expression> {
        let lhs = self.expr_additive()?;
        if self.check(&Token::DotDot) {
            let line = self.line;
            self.advance();
            // Right-associative: `a .. b .. c` concatenates all three in
            // one instruction, so recurse rather than loop.
            let rhs = self.expr_concat()?;
            let base = self.fs_mut().num_registers();
            self.discharge_into_new(lhs, line)?;
            self.discharge_into_new(rhs, line)?;
            let top = self.fs_mut().num_registers();
            self.fs_mut().free_registers_to(base);
            let dst = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
            self.fs_mut()
                .emit_abc(Opcode::Concat, dst as u32, base as u32, (top - 1) as u32, line);
            return Ok(Expression::Register(dst));
        }
        Ok(lhs)
    }

    fn expr_additive(&mut self) -> PResult<Expression> {
        let mut lhs = self.expr_multiplicative()?;
        loop {
            let op = match self.current {
                Token::Plus => Opcode::Add,
                Token::Minus => Opcode::Sub,
                _ => break,
            };
            let line = self.line;
            self.advance();
            let rhs = self.expr_multiplicative()?;
            lhs = self.emit_binary(op, lhs, rhs, line)?;
        }
        Ok(lhs)
    }

    fn expr_multiplicative(&mut self) -> PResult<Expression> {
        let mut lhs = self.expr_unary()?;
        loop {
            let op = match self.current {
                Token::Star => Opcode::Mul,
                Token::Slash => Opcode::Div,
                Token::Percent => Opcode::Mod,
                _ => break,
            };
            let line = self.line;
            self.advance();
            let rhs = self.expr_unary()?;
            lhs = self.emit_binary(op, lhs, rhs, line)?;
        }
        Ok(lhs)
    }

    fn expr_unary(&mut self) -> PResult<Expression> {
        let line = self.line;
        match self.current {
            Token::Not => {
                self.advance();
                let inner = self.expr_unary()?;
                Ok(match inner {
                    Expression::Nil | Expression::False => Expression::True,
                    Expression::True
                    | Expression::Number(_)
                    | Expression::Str(_)
                    | Expression::Constant(_) => Expression::False,
                    Expression::Test {
                        true_list,
                        false_list,
                    } => Expression::Test {
                        true_list: false_list,
                        false_list: true_list,
                    },
                    other => Expression::Not(Box::new(other)),
                })
            }
            Token::Minus => {
                self.advance();
                let inner = self.expr_unary()?;
                if let Expression::Number(n) = inner {
                    return Ok(Expression::Number(-n));
                }
                let src = self.discharge(inner, line)?;
                let dst = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
                self.fs_mut().emit_abc(Opcode::Unm, dst as u32, src as u32, 0, line);
                Ok(Expression::Register(dst))
            }
            Token::Hash => {
                self.advance();
                let inner = self.expr_unary()?;
                let src = self.discharge(inner, line)?;
                let dst = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
                self.fs_mut().emit_abc(Opcode::Len, dst as u32, src as u32, 0, line);
                Ok(Expression::Register(dst))
            }
            _ => self.expr_pow(),
        }
    }

    // `^` binds tighter than unary operators on its left but is
    // right-associative and binds *looser* than unary on its right
    // (`-2^2 == -4`, `2^-2 == 0.25`), so it gets its own precedence level
    // between unary and the primary/suffixed expressions.
    fn expr_pow(&mut self) -> PResult<Expression> {
        let base = self.expr_suffixed()?;
        if self.check(&Token::Caret) {
            let line = self.line;
            self.advance();
            let exponent = self.expr_unary()?;
            return self.emit_binary(Opcode::Pow, base, exponent, line);
        }
        Ok(base)
    }

    /// Emits a new open `Jmp` and returns its pc. A thin wrapper around
    /// [`jump::emit`] that borrows `code` and `line_info` from the same
    /// `fs_mut()` call -- calling `fs_mut()` twice in one expression would
    /// borrow `self.functions` mutably twice at once.
    pub(crate) fn open_jump(&mut self, line: u32) -> i32 {
        let fs = self.fs_mut();
        jump::emit(&mut fs.code, &mut fs.line_info, line)
    }

    fn emit_binary(
        &mut self,
        op: Opcode,
        lhs: Expression,
        rhs: Expression,
        line: u32,
    ) -> PResult<Expression> {
        if let (Expression::Number(a), Expression::Number(b)) = (&lhs, &rhs) {
            let folded = match op {
                Opcode::Add => a + b,
                Opcode::Sub => a - b,
                Opcode::Mul => a * b,
                Opcode::Div => a / b,
                Opcode::Mod => a - (a / b).floor() * b,
                Opcode::Pow => a.powf(*b),
                _ => unreachable!("emit_binary only called for arithmetic opcodes"),
            };
            return Ok(Expression::Number(folded));
        }
        let a = self.to_rk(lhs, line)?;
        let b = self.to_rk(rhs, line)?;
        let dst = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
        self.fs_mut().emit_abc(op, dst as u32, a, b, line);
        Ok(Expression::Register(dst))
    }

    // -- suffixed / primary expressions -----------------------------------

    pub(crate) fn expr_suffixed(&mut self) -> PResult<Expression> {
        let mut e = self.expr_primary()?;
        loop {
            match self.current {
                Token::Dot => {
                    self.advance();
                    let name = self.expect_ident()?;
                    e = self.index_field(e, Expression::Str(name))?;
                }
                Token::LBracket => {
                    self.advance();
                    let key = self.expr()?;
                    self.expect(Token::RBracket, "]")?;
                    e = self.index_field(e, key)?;
                }
                Token::Colon => {
                    self.advance();
                    let method = self.expect_ident()?;
                    let line = self.line;
                    e = self.parse_call(e, Some(method), line)?;
                }
                Token::LParen | Token::Str(_) | Token::LBrace => {
                    let line = self.line;
                    e = self.parse_call(e, None, line)?;
                }
                _ => break,
            }
        }
        Ok(e)
    }

    pub(crate) fn index_field(&mut self, table: Expression, key: Expression) -> PResult<Expression> {
        let line = self.line;
        let table_reg = self.discharge(table, line)?;
        let key = match key {
            Expression::Str(s) => {
                let idx = self.intern_string_constant(&s);
                KeyRef::Constant(idx)
            }
            other => {
                let rk = self.to_rk(other, line)?;
                if is_rk_constant(rk) {
                    KeyRef::Constant(rk_constant_index(rk))
                } else {
                    KeyRef::Register(rk as u8)
                }
            }
        };
        Ok(Expression::Field {
            table: table_reg,
            key,
        })
    }

    fn expr_primary(&mut self) -> PResult<Expression> {
        let line = self.line;
        match self.current.clone() {
            Token::Nil => {
                self.advance();
                Ok(Expression::Nil)
            }
            Token::True => {
                self.advance();
                Ok(Expression::True)
            }
            Token::False => {
                self.advance();
                Ok(Expression::False)
            }
            Token::Number(n) => {
                self.advance();
                Ok(Expression::Number(n))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expression::Str(s))
            }
            Token::Ellipsis => {
                self.advance();
                if !self.fs().is_vararg {
                    self.error("cannot use '...' outside a vararg function".to_string());
                    return Err(crate::error::ParseAbort);
                }
                let base = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
                let pc = self.fs_mut().emit_abc(Opcode::VarArg, base as u32, 2, 0, line);
                Ok(Expression::VarArg { base, pc })
            }
            Token::Function => {
                self.advance();
                self.function_body(false)
            }
            Token::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(Token::RParen, ")")?;
                // Parenthesizing truncates a multi-value expression to one
                // result; materialize calls/varargs now so later uses see
                // a plain single value.
                Ok(match inner {
                    Expression::Call { base, .. } | Expression::VarArg { base, .. } => {
                        Expression::Register(base)
                    }
                    other => other,
                })
            }
            Token::LBrace => self.table_constructor(),
            Token::Ident(name) => {
                self.advance();
                Ok(self.resolve_name(&name))
            }
            _ => {
                self.error("unexpected symbol".to_string());
                Err(crate::error::ParseAbort)
            }
        }
    }

    // -- materialization ----------------------------------------------------

    /// Ensures `expr` occupies *some* register, allocating a fresh one only
    /// if it isn't already in one.
    pub(crate) fn discharge(&mut self, expr: Expression, line: u32) -> PResult<u8> {
        match expr {
            Expression::Local(r) | Expression::Register(r) => Ok(r),
            other => {
                let reg = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
                self.discharge_into(other, reg, line)?;
                Ok(reg)
            }
        }
    }

    /// Like [`Compiler::discharge`] but always allocates a brand new
    /// register even for a `Local`, so the source local is never
    /// aliased/clobbered by the caller's subsequent writes (used for
    /// operands that get bundled into a contiguous argument/concat run).
    pub(crate) fn discharge_into_new(&mut self, expr: Expression, line: u32) -> PResult<u8> {
        let reg = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
        self.discharge_into(expr, reg, line)?;
        Ok(reg)
    }

    /// Emits whatever is necessary to land `expr`'s value in register
    /// `reg`.
    pub(crate) fn discharge_into(&mut self, expr: Expression, reg: u8, line: u32) -> PResult<()> {
        match expr {
            Expression::Nil => {
                self.fs_mut().emit_abc(Opcode::LoadNil, reg as u32, reg as u32, 0, line);
            }
            Expression::True => {
                self.fs_mut().emit_abc(Opcode::LoadBool, reg as u32, 1, 0, line);
            }
            Expression::False => {
                self.fs_mut().emit_abc(Opcode::LoadBool, reg as u32, 0, 0, line);
            }
            Expression::Number(n) => {
                let idx = self.fs_mut().add_constant(Value::Number(n));
                self.fs_mut().emit_abx(Opcode::LoadK, reg as u32, idx, line);
            }
            Expression::Str(s) => {
                let idx = self.intern_string_constant(&s);
                self.fs_mut().emit_abx(Opcode::LoadK, reg as u32, idx, line);
            }
            Expression::Constant(idx) => {
                self.fs_mut().emit_abx(Opcode::LoadK, reg as u32, idx, line);
            }
            Expression::Local(src) | Expression::Register(src) => {
                if src != reg {
                    self.fs_mut().emit_abc(Opcode::Move, reg as u32, src as u32, 0, line);
                }
            }
            Expression::Global(name_idx) => {
                self.fs_mut().emit_abx(Opcode::GetGlobal, reg as u32, name_idx, line);
            }
            Expression::Upvalue(idx) => {
                self.fs_mut().emit_abc(Opcode::GetUpval, reg as u32, idx, 0, line);
            }
            Expression::Field { table, key } => {
                let key = self.encode_key(key);
                self.fs_mut().emit_abc(Opcode::GetTable, reg as u32, table as u32, key, line);
            }
            Expression::Call { base, pc } => {
                // Adjust the already-emitted CALL to return exactly one
                // result, then move it into place if needed.
                self.set_call_results(pc, 2);
                if base != reg {
                    self.fs_mut().emit_abc(Opcode::Move, reg as u32, base as u32, 0, line);
                }
            }
            Expression::VarArg { base, pc } => {
                self.set_vararg_results(pc, 2);
                if base != reg {
                    self.fs_mut().emit_abc(Opcode::Move, reg as u32, base as u32, 0, line);
                }
            }
            Expression::Not(inner) => {
                let src = self.discharge(*inner, line)?;
                self.fs_mut().emit_abc(Opcode::Not, reg as u32, src as u32, 0, line);
            }
            Expression::Test {
                true_list,
                false_list,
            } => {
                // Synthesize the classic two-`LoadBool` pattern: the
                // second `LoadBool`'s C operand of 1 means "skip the next
                // instruction", so the true branch lands on `reg = true`
                // then jumps over `reg = false`.
                let false_pos = self.fs_mut().pc();
                self.fs_mut().emit_abc(Opcode::LoadBool, reg as u32, 0, 1, line);
                let true_pos = self.fs_mut().pc();
                self.fs_mut().emit_abc(Opcode::LoadBool, reg as u32, 1, 0, line);
                jump::patch_to(&mut self.fs_mut().code, true_list, true_pos as i32);
                jump::patch_to(&mut self.fs_mut().code, false_list, false_pos as i32);
            }
        }
        Ok(())
    }

    /// Rewrites an already-emitted `Call`'s result-count field in place.
    /// `c` follows the instruction's own encoding: `want + 1`, or `0` for
    /// "all results" (an open call feeding the last slot of an argument
    /// list, table constructor, or return statement).
    pub(crate) fn set_call_results(&mut self, pc: usize, c: u32) {
        let fs = self.fs_mut();
        let inst = fs.code[pc];
        fs.code[pc] = Instruction::abc(Opcode::Call, inst.a(), inst.b(), c);
    }

    /// Rewrites an already-emitted `VarArg`'s result-count field in place,
    /// using the same `want + 1` / `0`-means-all encoding as
    /// [`Compiler::set_call_results`].
    pub(crate) fn set_vararg_results(&mut self, pc: usize, b: u32) {
        let fs = self.fs_mut();
        let inst = fs.code[pc];
        fs.code[pc] = Instruction::abc(Opcode::VarArg, inst.a(), b, 0);
    }

    pub(crate) fn encode_key(&self, key: KeyRef) -> u32 {
        match key {
            KeyRef::Register(r) => r as u32,
            KeyRef::Constant(idx) => encode_rk_constant(idx),
        }
    }

    /// Returns an RK-encoded operand: a plain register index, or a
    /// constant-table index tagged with the RK high bit. Spills to a
    /// register move if the constant index doesn't fit the RK field.
    pub(crate) fn to_rk(&mut self, expr: Expression, line: u32) -> PResult<u32> {
        match expr {
            Expression::Number(n) => {
                let idx = self.fs_mut().add_constant(Value::Number(n));
                self.rk_from_constant(idx, line)
            }
            Expression::Str(s) => {
                let idx = self.intern_string_constant(&s);
                self.rk_from_constant(idx, line)
            }
            Expression::Constant(idx) => self.rk_from_constant(idx, line),
            other => Ok(self.discharge(other, line)? as u32),
        }
    }

    fn rk_from_constant(&mut self, idx: u32, line: u32) -> PResult<u32> {
        if idx <= ember_value::MAX_RK_INDEX {
            Ok(encode_rk_constant(idx))
        } else {
            let reg = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
            self.fs_mut().emit_abx(Opcode::LoadK, reg as u32, idx, line);
            Ok(reg as u32)
        }
    }

    pub(crate) fn intern_string_constant(&mut self, s: &str) -> u32 {
        let ws = self.strings.intern(self.heap, s.as_bytes());
        self.fs_mut().add_constant(Value::String(ws))
    }

    /// Converts any expression into a true/false jump-list pair -- the
    /// canonical form consumed by `if`/`while`/`and`/`or`.
    pub(crate) fn to_test(&mut self, expr: Expression, line: u32) -> PResult<(i32, i32)> {
        match expr {
            Expression::Test {
                true_list,
                false_list,
            } => Ok((true_list, false_list)),
            Expression::Nil | Expression::False => {
                let jmp = self.open_jump(line);
                Ok((jump::NO_JUMP, jmp))
            }
            Expression::True | Expression::Number(_) | Expression::Str(_) | Expression::Constant(_) => {
                let jmp = self.open_jump(line);
                Ok((jmp, jump::NO_JUMP))
            }
            other => {
                let reg = self.discharge(other, line)?;
                self.fs_mut().emit_abc(Opcode::Test, reg as u32, 0, 0, line);
                let jmp = self.open_jump(line);
                Ok((jump::NO_JUMP, jmp))
            }
        }
    }
}
