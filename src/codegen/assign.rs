//! Bajada de las instrucciones de asignación.
//!
//! Convenciones de la ISA que gobiernan estas rutinas: la multiplicación
//! y la división trabajan sobre AX y pisan DX en las formas de 16 y 32
//! bits; los desplazamientos toman la cuenta desde CL. Los registros que
//! sostienen operandos en vuelo se suprimen de la asignación automática
//! mientras dura la instrucción.

use super::{DosExeEmitter, SaveReason};
use crate::arch::i386::{self, modrm, opr, CpuRegister};
use crate::error::CompileResult;
use crate::ir::{AssignKind, Operand, OperandIndex};
use crate::symbols::{BaseType, ExpressionKind};

impl<'a> DosExeEmitter<'a> {
    pub(crate) fn emit_assign(
        &mut self,
        kind: AssignKind,
        dst_value: &str,
        dst_index: Option<&OperandIndex>,
        op1: &Operand,
        op2: Option<&Operand>,
    ) -> CompileResult<()> {
        match kind {
            AssignKind::None => self.emit_assign_none(dst_value, dst_index, op1),
            AssignKind::Negation => self.emit_assign_negation(dst_value, op1),
            AssignKind::Add | AssignKind::Subtract => {
                let op2 = match op2 {
                    Some(op2) => op2,
                    None => unexpected!(),
                };
                self.emit_assign_add_subtract(kind, dst_value, op1, op2)
            }
            AssignKind::Multiply => {
                let op2 = match op2 {
                    Some(op2) => op2,
                    None => unexpected!(),
                };
                self.emit_assign_multiply(dst_value, op1, op2)
            }
            AssignKind::Divide | AssignKind::Remainder => {
                let op2 = match op2 {
                    Some(op2) => op2,
                    None => unexpected!(),
                };
                self.emit_assign_divide(kind, dst_value, op1, op2)
            }
            AssignKind::ShiftLeft | AssignKind::ShiftRight => {
                let op2 = match op2 {
                    Some(op2) => op2,
                    None => unexpected!(),
                };
                self.emit_assign_shift(kind, dst_value, op1, op2)
            }
        }
    }

    /// Copia simple: constante, literal de cadena o variable a variable,
    /// con acceso indexado opcional en cualquiera de los dos lados.
    fn emit_assign_none(
        &mut self,
        dst_value: &str,
        dst_index: Option<&OperandIndex>,
        op1: &Operand,
    ) -> CompileResult<()> {
        let dst = self.find_variable(dst_value)?;

        match op1.exp_type {
            ExpressionKind::Constant => {
                let reg_dst;
                if op1.typ.base == BaseType::String {
                    // La dirección del literal se conoce recién al volcar
                    // el pool de cadenas
                    reg_dst = self.get_unused_register()?;

                    self.buf.emit_code(&[opr(0xB8, reg_dst.enc()), 0, 0]); // mov r16, imm16
                    let hole = self.buf.offset() - 2;
                    self.fixup_string(hole, &op1.value);
                } else {
                    reg_dst = self.get_unused_register()?;

                    let value = op1.constant_value();
                    let dst_size = self.variables[dst].symbol.typ.size()?;
                    self.load_constant_sized(value, reg_dst, dst_size)?;
                }

                if let Some(index) = dst_index {
                    // Los elementos de memoria indexada no se conservan
                    // en registro
                    self.save_indexed_variable(dst, index, reg_dst)?;
                } else {
                    self.variables[dst].reg = Some(reg_dst);
                    self.variables[dst].is_dirty = true;
                }
                self.variables[dst].last_used = self.ip_src;
            }

            ExpressionKind::Variable => {
                let op1_var = self.find_variable(&op1.value)?;
                let dst_size = self.variables[dst].symbol.typ.size()?;

                let reg_dst;
                if self.variables[op1_var].symbol.exp_type == ExpressionKind::Constant {
                    if self.variables[op1_var].symbol.typ.base == BaseType::String {
                        unexpected!();
                    }

                    reg_dst = self.get_unused_register()?;

                    let text = self.variables[op1_var].value.clone().unwrap_or_default();
                    let value = crate::ir::parse_constant(&text);
                    self.load_constant_sized(value, reg_dst, dst_size)?;
                } else if let Some(index) = &op1.index {
                    reg_dst = self.load_indexed_variable(op1_var, index, dst_size)?;
                } else {
                    let needs_reference = dst_index.is_none()
                        && self.variables[dst].symbol.typ.pointer
                            > self.variables[op1_var].symbol.typ.pointer;

                    if needs_reference {
                        // Se toma la dirección: la variable tiene que
                        // existir en memoria pase lo que pase
                        self.variables[op1_var].force_save = true;

                        reg_dst = self.load_variable_pointer(op1_var, true)?;
                    } else {
                        reg_dst = self.load_variable_unreferenced(op1_var, dst_size)?;
                    }
                }

                if let Some(index) = dst_index {
                    self.save_indexed_variable(dst, index, reg_dst)?;
                } else {
                    self.variables[dst].reg = Some(reg_dst);
                    self.variables[dst].is_dirty = true;
                }
                self.variables[dst].last_used = self.ip_src;
            }

            ExpressionKind::None => unexpected!(),
        }

        Ok(())
    }

    fn emit_assign_negation(&mut self, dst_value: &str, op1: &Operand) -> CompileResult<()> {
        let dst = self.find_variable(dst_value)?;

        let reg_dst = match self.variables[dst].reg {
            Some(reg) => reg,
            None => self.get_unused_register()?,
        };

        let dst_size = self.variables[dst].symbol.typ.size()?;

        match op1.exp_type {
            ExpressionKind::Constant => {
                self.load_constant_sized(op1.constant_value(), reg_dst, dst_size)?;
            }
            ExpressionKind::Variable => {
                let op1_var = self.find_variable(&op1.value)?;
                self.copy_variable_to_register(op1_var, reg_dst, dst_size)?;
            }

            ExpressionKind::None => unexpected!(),
        }

        match dst_size {
            1 => {
                // neg rm8
                self.buf.emit_code(&[0xF6, modrm(3, 3, reg_dst.enc())]);
            }
            2 => {
                // neg rm16
                self.buf.emit_code(&[0xF7, modrm(3, 3, reg_dst.enc())]);
            }
            4 => {
                // neg rm32
                self.buf
                    .emit_code(&[i386::OPERAND_SIZE, 0xF7, modrm(3, 3, reg_dst.enc())]);
            }

            _ => unexpected!(),
        }

        self.variables[dst].reg = Some(reg_dst);
        self.variables[dst].is_dirty = true;
        self.variables[dst].last_used = self.ip_src;
        Ok(())
    }

    fn emit_assign_add_subtract(
        &mut self,
        kind: AssignKind,
        dst_value: &str,
        op1: &Operand,
        op2: &Operand,
    ) -> CompileResult<()> {
        let dst = self.find_variable(dst_value)?;

        if kind == AssignKind::Add
            && self.variables[dst].symbol.typ.base == BaseType::String
        {
            // Concatenación: solo entre literales, resuelta en el pool
            if op1.exp_type == ExpressionKind::Constant
                && op2.exp_type == ExpressionKind::Constant
            {
                let concat = format!("{}{}", op1.value, op2.value);
                self.add_string(&concat);
                self.variables[dst].value = Some(concat.clone());

                let reg_dst = self.get_unused_register()?;
                self.variables[dst].reg = Some(reg_dst);

                self.buf.emit_code(&[opr(0xB8, reg_dst.enc()), 0, 0]); // mov r16, imm16
                let hole = self.buf.offset() - 2;
                self.fixup_string(hole, &concat);
            } else {
                unexpected!();
            }

            self.variables[dst].is_dirty = true;
            self.variables[dst].last_used = self.ip_src;
            return Ok(());
        }

        // La constante siempre como segundo operando; restar al revés se
        // compensa negando el resultado
        let (op1, op2, constant_swapped) = if op1.exp_type == ExpressionKind::Constant {
            (op2.clone(), op1.clone(), true)
        } else {
            (op1.clone(), op2.clone(), false)
        };

        let dst_size = self.variables[dst].symbol.typ.size()?;

        if op1.exp_type == ExpressionKind::Constant {
            // Ambos operandos constantes: se pliega en compilación
            let value1 = op1.constant_value();
            let value2 = op2.constant_value();

            let folded = if kind == AssignKind::Add {
                value1.wrapping_add(value2)
            } else {
                value1.wrapping_sub(value2)
            };

            let reg_dst = self.get_unused_register()?;
            self.load_constant_sized(folded, reg_dst, dst_size)?;

            self.variables[dst].reg = Some(reg_dst);
            self.variables[dst].is_dirty = true;
            self.variables[dst].last_used = self.ip_src;
            return Ok(());
        }

        let op1_var = self.find_variable(&op1.value)?;

        let reg_dst = if dst == op1_var && self.variables[op1_var].reg.is_some() {
            self.variables[op1_var].reg.ok_or_else(crate::error::CompilerError::unexpected)?
        } else {
            self.load_variable_unreferenced(op1_var, dst_size)?
        };

        match op2.exp_type {
            ExpressionKind::Constant => {
                let mut value = op2.constant_value();
                if kind == AssignKind::Subtract {
                    value = value.wrapping_neg();
                }

                match dst_size {
                    1 => {
                        // add rm8, imm8
                        self.buf
                            .emit_code(&[0x80, modrm(3, 0, reg_dst.enc()), value as u8]);
                    }
                    2 => {
                        // add rm16, imm16
                        let imm = (value as u16).to_le_bytes();
                        self.buf
                            .emit_code(&[0x81, modrm(3, 0, reg_dst.enc()), imm[0], imm[1]]);
                    }
                    4 => {
                        // add rm32, imm32
                        let imm = (value as u32).to_le_bytes();
                        self.buf.emit_code(&[
                            i386::OPERAND_SIZE,
                            0x81,
                            modrm(3, 0, reg_dst.enc()),
                            imm[0],
                            imm[1],
                            imm[2],
                            imm[3],
                        ]);
                    }

                    _ => unexpected!(),
                }

                if kind == AssignKind::Subtract && constant_swapped {
                    self.emit_neg(reg_dst, dst_size)?;
                }
            }

            ExpressionKind::Variable => {
                let op2_var = self.find_variable(&op2.value)?;
                let op2_size = self.variables[op2_var].symbol.typ.size()?;

                if op2_size < dst_size {
                    // El ensanchamiento no puede tocar el acumulador
                    let loaded = self.with_suppressed(&[reg_dst], |emitter| {
                        emitter.load_variable_unreferenced(op2_var, dst_size)
                    })?;
                    self.variables[op2_var].reg = Some(loaded);
                }

                match dst_size {
                    1 => {
                        let opcode = if kind == AssignKind::Add { 0x02 } else { 0x2A };
                        // add/sub r8, rm8
                        self.emit_op_var_rm(&[opcode], reg_dst.enc(), op2_var)?;
                    }
                    2 => {
                        let opcode = if kind == AssignKind::Add { 0x03 } else { 0x2B };
                        // add/sub r16, rm16
                        self.emit_op_var_rm(&[opcode], reg_dst.enc(), op2_var)?;
                    }
                    4 => {
                        let opcode = if kind == AssignKind::Add { 0x03 } else { 0x2B };
                        // add/sub r32, rm32
                        self.emit_op_var_rm(
                            &[i386::OPERAND_SIZE, opcode],
                            reg_dst.enc(),
                            op2_var,
                        )?;
                    }

                    _ => unexpected!(),
                }

                if kind == AssignKind::Subtract && constant_swapped {
                    self.emit_neg(reg_dst, dst_size)?;
                }
            }

            ExpressionKind::None => unexpected!(),
        }

        self.variables[dst].reg = Some(reg_dst);
        self.variables[dst].is_dirty = true;
        self.variables[dst].last_used = self.ip_src;
        Ok(())
    }

    fn emit_neg(&mut self, reg: CpuRegister, size: i32) -> CompileResult<()> {
        match size {
            1 => self.buf.emit_code(&[0xF6, modrm(3, 3, reg.enc())]),
            2 => self.buf.emit_code(&[0xF7, modrm(3, 3, reg.enc())]),
            4 => self
                .buf
                .emit_code(&[i386::OPERAND_SIZE, 0xF7, modrm(3, 3, reg.enc())]),

            _ => unexpected!(),
        }

        Ok(())
    }

    fn emit_assign_multiply(
        &mut self,
        dst_value: &str,
        op1: &Operand,
        op2: &Operand,
    ) -> CompileResult<()> {
        let dst = self.find_variable(dst_value)?;
        let dst_size = self.variables[dst].symbol.typ.size()?;

        // La constante siempre como segundo operando
        let (op1, op2) = if op1.exp_type == ExpressionKind::Constant {
            (op2.clone(), op1.clone())
        } else {
            (op1.clone(), op2.clone())
        };

        if op1.exp_type == ExpressionKind::Constant {
            // Expresión constante
            let folded = op1.constant_value().wrapping_mul(op2.constant_value());

            let reg_dst = self.get_unused_register()?;
            self.load_constant_sized(folded, reg_dst, dst_size)?;

            self.variables[dst].reg = Some(reg_dst);
            self.variables[dst].is_dirty = true;
            self.variables[dst].last_used = self.ip_src;
            return Ok(());
        }

        let op1_var = self.find_variable(&op1.value)?;

        match op2.exp_type {
            ExpressionKind::Constant => {
                let value = op2.constant_value();

                self.save_and_unload_register(CpuRegister::AX, SaveReason::Inside)?;
                self.load_constant_sized(value, CpuRegister::AX, dst_size)?;

                match dst_size {
                    1 => {
                        // mul rm8
                        self.emit_op_var_rm(&[0xF6], 4, op1_var)?;
                    }
                    2 => {
                        // mul pisa DX en las formas anchas
                        self.save_and_unload_register(CpuRegister::DX, SaveReason::Inside)?;
                        // mul rm16
                        self.emit_op_var_rm(&[0xF7], 4, op1_var)?;
                    }
                    4 => {
                        self.save_and_unload_register(CpuRegister::DX, SaveReason::Inside)?;
                        // mul rm32
                        self.emit_op_var_rm(&[i386::OPERAND_SIZE, 0xF7], 4, op1_var)?;
                    }

                    _ => unexpected!(),
                }
            }

            ExpressionKind::Variable => {
                let mut op1_var = op1_var;
                let mut op2_var = self.find_variable(&op2.value)?;

                // Alguno de los dos tiene que pasar por AX; si el segundo
                // ya está ahí, mejor
                if self.variables[op2_var].reg == Some(CpuRegister::AX) {
                    std::mem::swap(&mut op1_var, &mut op2_var);
                }

                self.copy_variable_to_register(op1_var, CpuRegister::AX, dst_size)?;

                self.with_suppressed(&[CpuRegister::AX], |emitter| {
                    let op2_size = emitter.variables[op2_var].symbol.typ.size()?;
                    if op2_size < dst_size {
                        // El tamaño no alcanza: se desliga y ensancha
                        let loaded =
                            emitter.load_variable_unreferenced(op2_var, dst_size)?;
                        emitter.variables[op2_var].reg = Some(loaded);
                    }

                    match dst_size {
                        1 => {
                            // mul rm8
                            emitter.emit_op_var_rm(&[0xF6], 4, op2_var)?;
                        }
                        2 => {
                            emitter
                                .save_and_unload_register(CpuRegister::DX, SaveReason::Inside)?;
                            // mul rm16
                            emitter.emit_op_var_rm(&[0xF7], 4, op2_var)?;
                        }
                        4 => {
                            emitter
                                .save_and_unload_register(CpuRegister::DX, SaveReason::Inside)?;
                            // mul rm32
                            emitter.emit_op_var_rm(&[i386::OPERAND_SIZE, 0xF7], 4, op2_var)?;
                        }

                        _ => unexpected!(),
                    }

                    Ok(())
                })?;
            }

            ExpressionKind::None => unexpected!(),
        }

        // El producto queda en AX
        self.variables[dst].reg = Some(CpuRegister::AX);
        self.variables[dst].is_dirty = true;
        self.variables[dst].last_used = self.ip_src;
        Ok(())
    }

    fn emit_assign_divide(
        &mut self,
        kind: AssignKind,
        dst_value: &str,
        op1: &Operand,
        op2: &Operand,
    ) -> CompileResult<()> {
        let dst = self.find_variable(dst_value)?;
        let dst_size = self.variables[dst].symbol.typ.size()?;

        // El numerador se carga al doble del tamaño del destino para que
        // la parte alta (AH o DX) llegue limpia a la división
        match op1.exp_type {
            ExpressionKind::Constant => {
                self.save_and_unload_register(CpuRegister::AX, SaveReason::Inside)?;
                self.load_constant_sized(op1.constant_value(), CpuRegister::AX, dst_size * 2)?;
            }
            ExpressionKind::Variable => {
                let op1_var = self.find_variable(&op1.value)?;
                self.copy_variable_to_register(op1_var, CpuRegister::AX, dst_size * 2)?;
            }

            ExpressionKind::None => unexpected!(),
        }

        // AX ya tiene un operando y DX será pisado
        self.with_suppressed(&[CpuRegister::AX, CpuRegister::DX], |emitter| {
            let mut op2_var: Option<usize> = None;
            let op2_reg: Option<CpuRegister>;

            match op2.exp_type {
                ExpressionKind::Constant => {
                    let reg = emitter.get_unused_register()?;
                    emitter.load_constant_sized(op2.constant_value(), reg, dst_size)?;
                    op2_reg = Some(reg);
                }
                ExpressionKind::Variable => {
                    let variable = emitter.find_variable(&op2.value)?;
                    op2_reg = emitter.variables[variable].reg;
                    op2_var = Some(variable);
                }

                ExpressionKind::None => unexpected!(),
            }

            match dst_size {
                1 => {
                    // div rm8: cociente en AL, resto en AH
                    emitter.emit_div_operand(&[0xF6], op2_reg, op2_var)?;

                    if kind == AssignKind::Remainder {
                        // mov al, ah
                        emitter.buf.emit_code(&[
                            0x8A,
                            modrm(3, 0, CpuRegister::AX.h8()),
                        ]);
                    }

                    // xor ah, ah
                    emitter.buf.emit_code(&[
                        0x32,
                        modrm(3, CpuRegister::AX.h8(), CpuRegister::AX.h8()),
                    ]);

                    emitter.variables[dst].reg = Some(CpuRegister::AX);
                }
                2 => {
                    emitter.save_and_unload_register(CpuRegister::DX, SaveReason::Inside)?;
                    emitter.zero_register(CpuRegister::DX, 2)?;

                    // div rm16: cociente en AX, resto en DX
                    emitter.emit_div_operand(&[0xF7], op2_reg, op2_var)?;

                    emitter.variables[dst].reg = Some(if kind == AssignKind::Remainder {
                        CpuRegister::DX
                    } else {
                        CpuRegister::AX
                    });
                }
                4 => {
                    emitter.save_and_unload_register(CpuRegister::DX, SaveReason::Inside)?;
                    emitter.zero_register(CpuRegister::DX, 4)?;

                    // div rm32
                    emitter.emit_div_operand(&[i386::OPERAND_SIZE, 0xF7], op2_reg, op2_var)?;

                    emitter.variables[dst].reg = Some(if kind == AssignKind::Remainder {
                        CpuRegister::DX
                    } else {
                        CpuRegister::AX
                    });
                }

                _ => unexpected!(),
            }

            Ok(())
        })?;

        self.variables[dst].is_dirty = true;
        self.variables[dst].last_used = self.ip_src;
        Ok(())
    }

    /// `div` sobre el denominador, esté en registro o en memoria.
    fn emit_div_operand(
        &mut self,
        opcode: &[u8],
        op2_reg: Option<CpuRegister>,
        op2_var: Option<usize>,
    ) -> CompileResult<()> {
        match (op2_reg, op2_var) {
            (Some(reg), _) => {
                let mut bytes = opcode.to_vec();
                bytes.push(modrm(3, 6, reg.enc()));
                self.buf.emit_code(&bytes);
                Ok(())
            }
            (None, Some(variable)) => self.emit_op_var_rm(opcode, 6, variable),
            (None, None) => unexpected!(),
        }
    }

    fn emit_assign_shift(
        &mut self,
        kind: AssignKind,
        dst_value: &str,
        op1: &Operand,
        op2: &Operand,
    ) -> CompileResult<()> {
        let dst = self.find_variable(dst_value)?;
        let dst_size = self.variables[dst].symbol.typ.size()?;

        match op2.exp_type {
            ExpressionKind::Constant => {
                let shift = op2.constant_value();

                if op1.exp_type == ExpressionKind::Constant {
                    // Desplazamiento entre constantes
                    let value = op1.constant_value();
                    let folded = if kind == AssignKind::ShiftLeft {
                        value.wrapping_shl(shift as u32)
                    } else {
                        value.wrapping_shr(shift as u32)
                    };

                    let reg_dst = self.get_unused_register()?;
                    self.load_constant_sized(folded, reg_dst, dst_size)?;

                    self.variables[dst].reg = Some(reg_dst);
                    self.variables[dst].is_dirty = true;
                    self.variables[dst].last_used = self.ip_src;
                    return Ok(());
                }

                self.save_and_unload_register(CpuRegister::CX, SaveReason::Inside)?;
                self.load_constant_sized(shift, CpuRegister::CX, 1)?;
            }
            ExpressionKind::Variable => {
                let op2_var = self.find_variable(&op2.value)?;
                self.copy_variable_to_register(op2_var, CpuRegister::CX, 1)?;
            }

            ExpressionKind::None => unexpected!(),
        }

        // La cuenta ya está en CL
        let reg_dst = self.with_suppressed(&[CpuRegister::CX], |emitter| {
            let reg_dst = match op1.exp_type {
                ExpressionKind::Constant => {
                    let reg = emitter.get_unused_register()?;
                    emitter.load_constant_sized(op1.constant_value(), reg, dst_size)?;
                    reg
                }
                ExpressionKind::Variable => {
                    let op1_var = emitter.find_variable(&op1.value)?;
                    let op1_size = emitter.variables[op1_var].symbol.typ.size()?;

                    if dst == op1_var
                        && emitter.variables[op1_var].reg.is_some()
                        && dst_size <= op1_size
                    {
                        match emitter.variables[op1_var].reg {
                            Some(reg) => reg,
                            None => unexpected!(),
                        }
                    } else {
                        emitter.load_variable_unreferenced(op1_var, dst_size)?
                    }
                }

                ExpressionKind::None => unexpected!(),
            };

            let modrm_op = if kind == AssignKind::ShiftLeft { 4 } else { 5 };

            match dst_size {
                1 => {
                    // shl/shr rm8, cl
                    emitter
                        .buf
                        .emit_code(&[0xD2, modrm(3, modrm_op, reg_dst.enc())]);
                }
                2 => {
                    // shl/shr rm16, cl
                    emitter
                        .buf
                        .emit_code(&[0xD3, modrm(3, modrm_op, reg_dst.enc())]);
                }
                4 => {
                    // shl/shr rm32, cl
                    emitter.buf.emit_code(&[
                        i386::OPERAND_SIZE,
                        0xD3,
                        modrm(3, modrm_op, reg_dst.enc()),
                    ]);
                }

                _ => unexpected!(),
            }

            Ok(reg_dst)
        })?;

        self.variables[dst].reg = Some(reg_dst);
        self.variables[dst].is_dirty = true;
        self.variables[dst].last_used = self.ip_src;
        Ok(())
    }
}
