//! Name resolution, function literals, table constructors, and call
//! argument lists -- the pieces of expression parsing that need more than
//! the expression-precedence chain in [`crate::expr`] by itself.

use ember_lex::Token;
use ember_value::{encode_rk_constant, Opcode, UpvalSource};

use crate::error::PResult;
use crate::expr::Expression;
use crate::function_state::FunctionState;
use crate::Compiler;

impl<'a> Compiler<'a> {
    // -- name resolution ----------------------------------------------------

    /// Resolves `name` against the function stack: a local of the innermost
    /// function, an upvalue chain threaded through every enclosing function
    /// back to wherever it's a local, or (if it's nowhere on the stack) a
    /// global.
    pub(crate) fn resolve_name(&mut self, name: &str) -> Expression {
        let depth = self.functions.len() - 1;
        self.resolve_at(depth, name)
    }

    fn resolve_at(&mut self, depth: usize, name: &str) -> Expression {
        let innermost = self.functions.len() - 1;
        if let Some(reg) = self.functions[depth].find_local(name) {
            if depth == innermost {
                return Expression::Local(reg);
            }
            return self.thread_upvalue(depth, innermost, UpvalSource::ParentLocal(reg as u32), name);
        }
        if let Some(idx) = self.functions[depth].find_upvalue(name) {
            if depth == innermost {
                return Expression::Upvalue(idx);
            }
            return self.thread_upvalue(depth, innermost, UpvalSource::ParentUpvalue(idx), name);
        }
        if depth == 0 {
            let idx = self.intern_string_constant(name);
            return Expression::Global(idx);
        }
        self.resolve_at(depth - 1, name)
    }

    /// Installs an upvalue descriptor for `name` in every function from
    /// `found_depth + 1` up to `innermost`, chaining each hop off the
    /// previous one's upvalue slot.
    fn thread_upvalue(
        &mut self,
        found_depth: usize,
        innermost: usize,
        source_at_found: UpvalSource,
        name: &str,
    ) -> Expression {
        let mut source = source_at_found;
        for depth in (found_depth + 1)..=innermost {
            match self.functions[depth].add_upvalue(name, source) {
                Ok(idx) => source = UpvalSource::ParentUpvalue(idx),
                Err(message) => {
                    self.error(message);
                    return Expression::Global(self.intern_string_constant(name));
                }
            }
        }
        match source {
            UpvalSource::ParentUpvalue(idx) => Expression::Upvalue(idx),
            UpvalSource::ParentLocal(_) => {
                unreachable!("loop above runs at least once whenever found_depth < innermost")
            }
        }
    }

    // -- function literals ----------------------------------------------------

    /// Parses `(params) block end` (the `function` keyword itself is
    /// already consumed by the caller). `implicit_self` prepends a `self`
    /// parameter, for `obj:method(...)` sugar.
    pub(crate) fn function_body(&mut self, implicit_self: bool) -> PResult<Expression> {
        let line = self.line;
        self.expect(Token::LParen, "(")?;
        let mut params = Vec::new();
        if implicit_self {
            params.push("self".to_string());
        }
        let mut is_vararg = false;
        if !self.check(&Token::RParen) {
            loop {
                if self.check(&Token::Ellipsis) {
                    self.advance();
                    is_vararg = true;
                    break;
                }
                params.push(self.expect_ident()?);
                if self.check(&Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen, ")")?;

        self.functions.push(FunctionState::new(params.len() as u8, is_vararg));
        for p in &params {
            self.fs_mut().add_local(p).map_err(|e| self.error(e))?;
        }
        self.fs_mut().commit_locals();
        self.fs_mut().begin_block(false);
        self.block()?;
        self.expect(Token::End, "end")?;
        let end_line = self.line;
        self.fs_mut().end_block(end_line);

        let fs = self.functions.pop().expect("function_body pushed a function state");
        let upvalues = fs.upvalues.clone();
        let prototype = fs.into_prototype(self.chunk_name.to_string());
        let proto_gc = self.heap.alloc(prototype);
        self.fs_mut().prototypes.push(proto_gc);
        let proto_idx = (self.fs_mut().prototypes.len() - 1) as u32;

        let dst = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
        self.fs_mut().emit_abx(Opcode::Closure, dst as u32, proto_idx, line);
        // One pseudo-instruction per upvalue immediately follows `Closure`,
        // telling the VM how to bind each of the new closure's upvalues:
        // a `Move` copies a parent local, a `GetUpval` copies one of the
        // parent's own upvalues. Neither is executed as a normal
        // instruction -- the VM's `Closure` handler consumes exactly
        // `upvalues.len()` of them when it runs.
        for up in &upvalues {
            match up.source {
                UpvalSource::ParentLocal(reg) => {
                    self.fs_mut().emit_abc(Opcode::Move, 0, reg, 0, line);
                }
                UpvalSource::ParentUpvalue(idx) => {
                    self.fs_mut().emit_abc(Opcode::GetUpval, 0, idx, 0, line);
                }
            }
        }
        Ok(Expression::Register(dst))
    }

    // -- table constructors ---------------------------------------------------

    /// `{` already current. Parses fields up to the matching `}`. There is
    /// no `SetList` fast path in this instruction set, so every field --
    /// positional or keyed -- lowers to its own `SetTable`.
    pub(crate) fn table_constructor(&mut self) -> PResult<Expression> {
        let line = self.line;
        self.expect(Token::LBrace, "{")?;
        let dst = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
        self.fs_mut().emit_abc(Opcode::NewTable, dst as u32, 0, 0, line);

        let mut array_index = 1.0f64;
        while !self.check(&Token::RBrace) {
            let field_line = self.line;
            if self.check(&Token::LBracket) {
                self.advance();
                let key = self.expr()?;
                self.expect(Token::RBracket, "]")?;
                self.expect(Token::Eq, "=")?;
                let value = self.expr()?;
                self.emit_table_field(dst, key, value, field_line)?;
            } else if matches!(self.current, Token::Ident(_)) && self.peek_second() == Token::Eq {
                let name = self.expect_ident()?;
                self.advance(); // '='
                let value = self.expr()?;
                self.emit_table_field(dst, Expression::Str(name), value, field_line)?;
            } else {
                let value = self.expr()?;
                let key = Expression::Number(array_index);
                array_index += 1.0;
                self.emit_table_field(dst, key, value, field_line)?;
            }
            if self.check(&Token::Comma) || self.check(&Token::Semi) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(Token::RBrace, "}")?;
        Ok(Expression::Register(dst))
    }

    fn emit_table_field(
        &mut self,
        table: u8,
        key: Expression,
        value: Expression,
        line: u32,
    ) -> PResult<()> {
        let key_rk = self.to_rk(key, line)?;
        let value_rk = self.to_rk(value, line)?;
        self.fs_mut().emit_abc(Opcode::SetTable, table as u32, key_rk, value_rk, line);
        Ok(())
    }

    // -- calls ------------------------------------------------------------

    /// Parses a call's argument list and emits `Call`. `callee` is the
    /// function expression already parsed; for a `:method` call `method`
    /// names the field to look up, with `self` threaded in as the first
    /// argument.
    pub(crate) fn parse_call(
        &mut self,
        callee: Expression,
        method: Option<String>,
        line: u32,
    ) -> PResult<Expression> {
        let base = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
        self.discharge_into(callee, base, line)?;

        let mut fixed_args = 0u32;
        if let Some(name) = method {
            let self_reg = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
            self.fs_mut().emit_abc(Opcode::Move, self_reg as u32, base as u32, 0, line);
            let key_idx = self.intern_string_constant(&name);
            self.fs_mut()
                .emit_abc(Opcode::GetTable, base as u32, self_reg as u32, encode_rk_constant(key_idx), line);
            fixed_args += 1;
        }

        let args_start = self.fs_mut().num_registers();
        let mut open = false;
        match self.current.clone() {
            Token::LParen => {
                self.advance();
                if !self.check(&Token::RParen) {
                    loop {
                        let arg = self.expr()?;
                        if self.check(&Token::Comma) {
                            self.discharge_into_new(arg, line)?;
                            self.advance();
                        } else {
                            match arg {
                                Expression::Call { pc, .. } => {
                                    self.set_call_results(pc, 0);
                                    open = true;
                                }
                                Expression::VarArg { pc, .. } => {
                                    self.set_vararg_results(pc, 0);
                                    open = true;
                                }
                                other => {
                                    self.discharge_into_new(other, line)?;
                                }
                            }
                            break;
                        }
                    }
                }
                self.expect(Token::RParen, ")")?;
            }
            Token::Str(s) => {
                self.advance();
                self.discharge_into_new(Expression::Str(s), line)?;
            }
            Token::LBrace => {
                let table = self.table_constructor()?;
                self.discharge_into_new(table, line)?;
            }
            _ => return Err(self.error("function arguments expected".to_string())),
        }

        let top = self.fs_mut().num_registers();
        let num_args = fixed_args + (top - args_start) as u32;
        let b = if open { 0 } else { num_args + 1 };
        let pc = self.fs_mut().emit_abc(Opcode::Call, base as u32, b, 0, line);
        // The call's result(s) occupy `base` onward; nothing past `base`
        // is a live value until the result count is fixed by whoever
        // consumes this expression.
        self.fs_mut().free_registers_to(base + 1);
        Ok(Expression::Call { base, pc })
    }
}
