//! Statement and block parsing.
//!
//! Unlike expressions, statements have no deferred "descriptor" -- each one
//! is parsed and its bytecode emitted in a single pass, with only the
//! jump-list bookkeeping from [`crate::jump`] left pending across control
//! structures.

use ember_lex::Token;
use ember_value::Opcode;

use crate::error::PResult;
use crate::expr::Expression;
use crate::jump;
use crate::Compiler;

impl<'a> Compiler<'a> {
    /// A sequence of statements, ending at a block-terminating token or an
    /// explicit (and necessarily final) `return`.
    pub(crate) fn block(&mut self) -> PResult<()> {
        loop {
            if self.block_follows() {
                return Ok(());
            }
            if self.check(&Token::Return) {
                self.return_stmt()?;
                return Ok(());
            }
            self.statement()?;
        }
    }

    fn block_follows(&self) -> bool {
        matches!(
            self.current,
            Token::Eof | Token::End | Token::Else | Token::Elseif | Token::Until
        )
    }

    fn statement(&mut self) -> PResult<()> {
        match self.current.clone() {
            Token::Semi => {
                self.advance();
                Ok(())
            }
            Token::If => self.if_stmt(),
            Token::While => self.while_stmt(),
            Token::Do => {
                self.advance();
                self.fs_mut().begin_block(false);
                self.block()?;
                self.expect(Token::End, "end")?;
                let line = self.line;
                self.fs_mut().end_block(line);
                Ok(())
            }
            Token::For => self.for_stmt(),
            Token::Repeat => self.repeat_stmt(),
            Token::Function => self.function_stmt(),
            Token::Local => self.local_stmt(),
            Token::Break => {
                self.advance();
                let line = self.line;
                self.fs_mut().break_block(line).map_err(|e| self.error(e))?;
                Ok(())
            }
            _ => self.expr_stmt(),
        }
    }

    // -- simple / compound statements -----------------------------------------

    fn if_stmt(&mut self) -> PResult<()> {
        self.advance(); // 'if'
        let mut end_jumps = jump::NO_JUMP;
        let mut false_list = self.if_condition()?;
        self.expect(Token::Then, "then")?;
        self.fs_mut().begin_block(false);
        self.block()?;
        let line = self.line;
        self.fs_mut().end_block(line);

        loop {
            match self.current {
                Token::Elseif => {
                    let jline = self.line;
                    let j = self.open_jump(jline);
                    end_jumps = jump::concat(&mut self.fs_mut().code, end_jumps, j);
                    jump::patch_here(&mut self.fs_mut().code, false_list);
                    self.advance();
                    false_list = self.if_condition()?;
                    self.expect(Token::Then, "then")?;
                    self.fs_mut().begin_block(false);
                    self.block()?;
                    let bline = self.line;
                    self.fs_mut().end_block(bline);
                }
                Token::Else => {
                    let jline = self.line;
                    let j = self.open_jump(jline);
                    end_jumps = jump::concat(&mut self.fs_mut().code, end_jumps, j);
                    jump::patch_here(&mut self.fs_mut().code, false_list);
                    self.advance();
                    self.fs_mut().begin_block(false);
                    self.block()?;
                    let bline = self.line;
                    self.fs_mut().end_block(bline);
                    self.expect(Token::End, "end")?;
                    jump::patch_here(&mut self.fs_mut().code, end_jumps);
                    return Ok(());
                }
                _ => break,
            }
        }
        self.expect(Token::End, "end")?;
        jump::patch_here(&mut self.fs_mut().code, false_list);
        jump::patch_here(&mut self.fs_mut().code, end_jumps);
        Ok(())
    }

    /// Parses a condition expression and patches its true branch to fall
    /// straight into the following block, returning the (still open) false
    /// branch.
    fn if_condition(&mut self) -> PResult<i32> {
        let cond = self.expr()?;
        let line = self.line;
        let (true_list, false_list) = self.to_test(cond, line)?;
        jump::patch_here(&mut self.fs_mut().code, true_list);
        Ok(false_list)
    }

    fn while_stmt(&mut self) -> PResult<()> {
        self.advance(); // 'while'
        let loop_start = self.fs_mut().pc();
        let cond = self.expr()?;
        let line = self.line;
        let (true_list, false_list) = self.to_test(cond, line)?;
        jump::patch_here(&mut self.fs_mut().code, true_list);
        self.expect(Token::Do, "do")?;
        self.fs_mut().begin_block(true);
        self.block()?;
        self.expect(Token::End, "end")?;
        let end_line = self.line;
        let back = self.open_jump(end_line);
        jump::patch_to(&mut self.fs_mut().code, back, loop_start as i32);
        let break_jumps = self.fs_mut().end_block(end_line);
        jump::patch_here(&mut self.fs_mut().code, false_list);
        jump::patch_here(&mut self.fs_mut().code, break_jumps);
        Ok(())
    }

    /// `until`'s condition is parsed before the block's locals go out of
    /// scope, so it can see them.
    fn repeat_stmt(&mut self) -> PResult<()> {
        self.advance(); // 'repeat'
        let loop_start = self.fs_mut().pc();
        self.fs_mut().begin_block(true);
        self.block()?;
        self.expect(Token::Until, "until")?;
        let cond = self.expr()?;
        let line = self.line;
        let (true_list, false_list) = self.to_test(cond, line)?;
        jump::patch_to(&mut self.fs_mut().code, false_list, loop_start as i32);
        jump::patch_here(&mut self.fs_mut().code, true_list);
        let break_jumps = self.fs_mut().end_block(line);
        jump::patch_here(&mut self.fs_mut().code, break_jumps);
        Ok(())
    }

    fn for_stmt(&mut self) -> PResult<()> {
        self.advance(); // 'for'
        let first_name = self.expect_ident()?;
        if self.check(&Token::Eq) {
            self.numeric_for_stmt(first_name)
        } else {
            self.generic_for_stmt(first_name)
        }
    }

    /// `for name = start, limit [, step] do block end`. Three hidden
    /// control registers (start, limit, step) sit directly below the
    /// visible induction variable; `ForPrep`/`ForLoop` is the same
    /// register layout real Lua uses.
    fn numeric_for_stmt(&mut self, name: String) -> PResult<()> {
        self.expect(Token::Eq, "=")?;
        let line = self.line;
        let start = self.expr()?;
        self.expect(Token::Comma, ",")?;
        let limit = self.expr()?;
        let step = if self.check(&Token::Comma) {
            self.advance();
            self.expr()?
        } else {
            Expression::Number(1.0)
        };
        let base = self.fs_mut().num_registers();
        self.discharge_into_new(start, line)?;
        self.discharge_into_new(limit, line)?;
        self.discharge_into_new(step, line)?;

        self.expect(Token::Do, "do")?;
        let prep_pc = self.fs_mut().emit_asbx(Opcode::ForPrep, base as u32, 0, line);
        self.fs_mut().begin_block(true);
        self.fs_mut().add_local(&name).map_err(|e| self.error(e))?;
        self.fs_mut().commit_locals();
        self.block()?;
        self.expect(Token::End, "end")?;
        let end_line = self.line;

        let loop_pc = self.fs_mut().emit_asbx(Opcode::ForLoop, base as u32, 0, end_line);
        let prep_offset = loop_pc as i32 - prep_pc as i32 - 1;
        self.fs_mut().code[prep_pc].patch_sbx(prep_offset);
        let loop_offset = (prep_pc as i32 + 1) - loop_pc as i32 - 1;
        self.fs_mut().code[loop_pc].patch_sbx(loop_offset);

        let break_jumps = self.fs_mut().end_block(end_line);
        jump::patch_here(&mut self.fs_mut().code, break_jumps);
        Ok(())
    }

    /// `for n1, n2, ... in explist do block end` via `TForLoop`: the
    /// iterator/state/control triplet occupies three hidden registers
    /// below the visible loop variables, mirroring the numeric form.
    fn generic_for_stmt(&mut self, first_name: String) -> PResult<()> {
        let mut names = vec![first_name];
        while self.check(&Token::Comma) {
            self.advance();
            names.push(self.expect_ident()?);
        }
        self.expect(Token::In, "in")?;
        let line = self.line;
        let base = self.expr_list_into_registers(3, line)?;

        self.expect(Token::Do, "do")?;
        let prep_jump = self.open_jump(line);
        let loop_start = self.fs_mut().pc();
        self.fs_mut().begin_block(true);
        for name in &names {
            self.fs_mut().add_local(name).map_err(|e| self.error(e))?;
        }
        self.fs_mut().commit_locals();
        self.block()?;
        self.expect(Token::End, "end")?;
        let end_line = self.line;

        jump::patch_here(&mut self.fs_mut().code, prep_jump);
        self.fs_mut()
            .emit_abc(Opcode::TForLoop, base as u32, 0, names.len() as u32, end_line);
        let back = self.open_jump(end_line);
        jump::patch_to(&mut self.fs_mut().code, back, loop_start as i32);

        let break_jumps = self.fs_mut().end_block(end_line);
        jump::patch_here(&mut self.fs_mut().code, break_jumps);
        Ok(())
    }

    /// Parses and discharges the return value list one expression at a
    /// time (like [`Compiler::parse_call`]'s argument loop), so a trailing
    /// open call/vararg's results land immediately after the fixed values
    /// with no gap -- `Return` needs that contiguity, and discharging the
    /// whole list only after it's fully parsed (as a generic `expr_list`
    /// would) can't guarantee it.
    fn return_stmt(&mut self) -> PResult<()> {
        let line = self.line;
        self.advance(); // 'return'
        let base = self.fs_mut().num_registers();
        let mut fixed_count: u32 = 0;
        let mut open = false;

        if !self.block_follows() && !self.check(&Token::Semi) {
            loop {
                let value = self.expr()?;
                if self.check(&Token::Comma) {
                    self.discharge_into_new(value, line)?;
                    fixed_count += 1;
                    self.advance();
                } else {
                    match value {
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
                            fixed_count += 1;
                        }
                    }
                    break;
                }
            }
        }
        if self.check(&Token::Semi) {
            self.advance();
        }

        let b = if open { 0 } else { fixed_count + 1 };
        self.fs_mut().emit_abc(Opcode::Return, base as u32, b, 0, line);
        Ok(())
    }

    // -- local declarations ---------------------------------------------------

    fn local_stmt(&mut self) -> PResult<()> {
        self.advance(); // 'local'
        if self.check(&Token::Function) {
            return self.local_function_stmt();
        }
        let mut names = vec![self.expect_ident()?];
        while self.check(&Token::Comma) {
            self.advance();
            names.push(self.expect_ident()?);
        }
        let line = self.line;
        // The right-hand side is discharged into fresh registers *before*
        // the names are declared, so `local x = x` resolves the
        // right-hand `x` against whatever scope already had that name,
        // not the new local about to occupy the same register range.
        let base = if self.check(&Token::Eq) {
            self.advance();
            self.expr_list_into_registers(names.len(), line)?
        } else {
            let base = self.fs_mut().num_registers();
            for _ in &names {
                let reg = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
                self.fs_mut().emit_abc(Opcode::LoadNil, reg as u32, reg as u32, 0, line);
            }
            base
        };
        for (i, name) in names.iter().enumerate() {
            self.fs_mut()
                .declare_local_at(name, base + i as u8)
                .map_err(|e| self.error(e))?;
        }
        self.fs_mut().commit_locals();
        Ok(())
    }

    /// `local function` is sugar for declaring the local *before* parsing
    /// the function body, so the function can call itself recursively
    /// through that local/upvalue rather than only through a global.
    fn local_function_stmt(&mut self) -> PResult<()> {
        self.advance(); // 'function'
        let name = self.expect_ident()?;
        let line = self.line;
        let reg = self.fs_mut().add_local(&name).map_err(|e| self.error(e))?;
        self.fs_mut().commit_locals();
        let func_expr = self.function_body(false)?;
        self.discharge_into(func_expr, reg, line)
    }

    // -- function declarations and assignment ---------------------------------

    /// `function Name{.field}[:method](...) body end`, desugared to an
    /// assignment into the resolved target.
    fn function_stmt(&mut self) -> PResult<()> {
        self.advance(); // 'function'
        let line = self.line;
        let first_name = self.expect_ident()?;
        let mut target = self.resolve_name(&first_name);
        let mut implicit_self = false;
        loop {
            if self.check(&Token::Dot) {
                self.advance();
                let field = self.expect_ident()?;
                target = self.index_field(target, Expression::Str(field))?;
            } else if self.check(&Token::Colon) {
                self.advance();
                let field = self.expect_ident()?;
                target = self.index_field(target, Expression::Str(field))?;
                implicit_self = true;
                break;
            } else {
                break;
            }
        }
        let func_expr = self.function_body(implicit_self)?;
        let reg = self.discharge(func_expr, line)?;
        self.store(target, reg, line)
    }

    fn expr_stmt(&mut self) -> PResult<()> {
        let line = self.line;
        let first = self.expr_suffixed()?;
        if self.check(&Token::Eq) || self.check(&Token::Comma) {
            let mut targets = vec![first];
            while self.check(&Token::Comma) {
                self.advance();
                targets.push(self.expr_suffixed()?);
            }
            self.expect(Token::Eq, "=")?;
            self.assignment(targets, line)
        } else {
            match first {
                Expression::Call { pc, .. } => {
                    self.set_call_results(pc, 1); // a call statement discards all results
                    Ok(())
                }
                _ => Err(self.error("syntax error: expected a call or an assignment".to_string())),
            }
        }
    }

    fn assignment(&mut self, targets: Vec<Expression>, line: u32) -> PResult<()> {
        // Every right-hand value lands in its own fresh register before
        // any target is stored into, so `a, b = b, a` reads both old
        // values before either store can overwrite one of them.
        let base = self.expr_list_into_registers(targets.len(), line)?;
        for (i, target) in targets.into_iter().enumerate() {
            self.store(target, base + i as u8, line)?;
        }
        Ok(())
    }

    fn store(&mut self, target: Expression, value_reg: u8, line: u32) -> PResult<()> {
        match target {
            Expression::Local(r) => {
                if r != value_reg {
                    self.fs_mut().emit_abc(Opcode::Move, r as u32, value_reg as u32, 0, line);
                }
            }
            Expression::Global(idx) => {
                self.fs_mut().emit_abx(Opcode::SetGlobal, value_reg as u32, idx, line);
            }
            Expression::Upvalue(idx) => {
                self.fs_mut().emit_abc(Opcode::SetUpval, value_reg as u32, idx, 0, line);
            }
            Expression::Field { table, key } => {
                let key = self.encode_key(key);
                self.fs_mut().emit_abc(Opcode::SetTable, table as u32, key, value_reg as u32, line);
            }
            _ => return Err(self.error("cannot assign to this expression".to_string())),
        }
        Ok(())
    }

    /// Parses a comma-separated expression list and discharges it into
    /// exactly `want` fresh, contiguous registers starting at the current
    /// register top (returned). A deficient tail whose last expression is
    /// an open call/vararg is expanded in place to cover the shortfall
    /// (its results already land contiguously, since they come from one
    /// instruction); a deficit with no such tail is padded with `Nil`. A
    /// surplus is still fully parsed and discharged, for side effects, and
    /// then freed back down to `base + want`.
    ///
    /// This is the same shape as [`Compiler::parse_call`]'s argument loop,
    /// generalized to assignment/`local`/generic-`for` right-hand sides,
    /// which all need this "last value may expand or truncate" adjustment.
    fn expr_list_into_registers(&mut self, want: usize, line: u32) -> PResult<u8> {
        let base = self.fs_mut().num_registers();
        let mut filled = 0usize;
        loop {
            let value = self.expr()?;
            let is_last = !self.check(&Token::Comma);
            let remaining = want.saturating_sub(filled);
            if is_last && remaining > 1 {
                match value {
                    Expression::Call { pc, .. } => {
                        self.set_call_results(pc, (remaining + 1) as u32);
                        filled = want;
                    }
                    Expression::VarArg { pc, .. } => {
                        self.set_vararg_results(pc, (remaining + 1) as u32);
                        filled = want;
                    }
                    other => {
                        self.discharge_into_new(other, line)?;
                        filled += 1;
                    }
                }
            } else {
                self.discharge_into_new(value, line)?;
                filled += 1;
            }
            if is_last {
                break;
            }
            self.advance(); // ','
        }
        while filled < want {
            let reg = self.fs_mut().allocate_register().map_err(|e| self.error(e))?;
            self.discharge_into(Expression::Nil, reg, line)?;
            filled += 1;
        }
        self.fs_mut().free_registers_to(base + want as u8);
        Ok(base)
    }
}
