//! Asignación de registros y ubicación de variables.
//!
//! Cuatro registros de propósito general (AX, CX, DX, BX) son candidatos
//! a alojar variables. Cada variable tiene un descriptor con su registro
//! actual, su ubicación en memoria (desplazamiento de stack para locales,
//! dirección estática para globales), el último IP que la usó y si el
//! registro contiene un valor aún no escrito a memoria.
//!
//! Cuando no hay registro libre se desaloja el de uso más antiguo,
//! guardándolo primero si está sucio. Durante la emisión de una
//! instrucción, los registros que sostienen operandos en vuelo se
//! suprimen de la asignación con [`DosExeEmitter::with_suppressed`].

use super::DosExeEmitter;
use crate::arch::i386::{self, modrm, opr, CpuRegister};
use crate::error::{CompileResult, CompilerError};
use crate::ir::{Instruction, OperandIndex};
use crate::symbols::{size_to_shift, ExpressionKind, SymbolEntry};

/// Registros utilizables por la asignación automática, por codificación.
const ALLOCATABLE: [CpuRegister; 4] = [
    CpuRegister::AX,
    CpuRegister::CX,
    CpuRegister::DX,
    CpuRegister::BX,
];

/// Momento y motivo de un guardado a memoria.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SaveReason {
    /// Se guarda si la variable se referencia en la instrucción actual o
    /// en alguna posterior.
    Before,
    /// Se guarda solo si se referencia en una instrucción posterior.
    Inside,
    /// Se guarda siempre.
    Force,
}

/// Descriptor de ubicación de una variable durante la emisión.
pub(crate) struct DosVariable {
    pub symbol: SymbolEntry,

    /// Valor constante conocido, para literales fabricados en compilación.
    pub value: Option<String>,

    pub reg: Option<CpuRegister>,

    /// Desplazamiento de stack (locales) o cero si aún no se asigna.
    pub location: i32,

    pub last_used: i32,

    pub is_dirty: bool,
    pub force_save: bool,
}

impl DosVariable {
    pub fn new(symbol: SymbolEntry) -> Self {
        DosVariable {
            symbol,
            value: None,
            reg: None,
            location: 0,
            last_used: 0,
            is_dirty: false,
            force_save: false,
        }
    }
}

impl<'a> DosExeEmitter<'a> {
    /// Indica si el descriptor pertenece al alcance actual: estáticas
    /// siempre, locales solo las de la función en curso.
    fn in_scope(&self, variable: usize) -> bool {
        match &self.variables[variable].symbol.parent {
            None => true,
            Some(function) => match &self.parent {
                Some(parent) => *function == parent.name,
                None => false,
            },
        }
    }

    /// Busca el descriptor de una variable visible: primero las locales
    /// de la función en curso, luego las estáticas.
    pub(crate) fn find_variable(&self, name: &str) -> CompileResult<usize> {
        if let Some(parent) = &self.parent {
            let local = self.variables.iter().position(|variable| {
                variable.symbol.belongs_to(&parent.name) && variable.symbol.name == name
            });
            if let Some(local) = local {
                return Ok(local);
            }
        }

        self.variables
            .iter()
            .position(|variable| {
                variable.symbol.parent.is_none() && variable.symbol.name == name
            })
            .ok_or_else(CompilerError::unexpected)
    }

    /// Suprime registros de la asignación automática mientras dura la
    /// operación; se liberan a la salida incluso ante error.
    pub(crate) fn with_suppressed<R, F>(
        &mut self,
        regs: &[CpuRegister],
        operation: F,
    ) -> CompileResult<R>
    where
        F: FnOnce(&mut Self) -> CompileResult<R>,
    {
        for reg in regs {
            self.suppressed.push(*reg);
        }

        let result = operation(self);

        for _ in regs {
            self.suppressed.pop();
        }

        result
    }

    fn register_owners(&self) -> [Option<usize>; 4] {
        let mut owners = [None; 4];
        for (index, variable) in self.variables.iter().enumerate() {
            if let Some(reg) = variable.reg {
                if self.in_scope(index) {
                    owners[reg.enc() as usize] = Some(index);
                }
            }
        }
        owners
    }

    /// Registro libre; si los cuatro están ocupados, desaloja el de uso
    /// más antiguo guardándolo primero.
    pub(crate) fn get_unused_register(&mut self) -> CompileResult<CpuRegister> {
        let owners = self.register_owners();

        let mut oldest: Option<usize> = None;
        for (slot, reg) in ALLOCATABLE.iter().enumerate() {
            if self.suppressed.contains(reg) {
                continue;
            }

            match owners[slot] {
                None => return Ok(*reg),
                Some(owner) => {
                    let replace = match oldest {
                        None => true,
                        Some(current) => {
                            self.variables[owner].last_used
                                < self.variables[current].last_used
                        }
                    };
                    if replace {
                        oldest = Some(owner);
                    }
                }
            }
        }

        let oldest = match oldest {
            Some(oldest) => oldest,
            None => unexpected!(),
        };

        let reg = match self.variables[oldest].reg {
            Some(reg) => reg,
            None => unexpected!(),
        };

        self.save_variable(oldest, SaveReason::Inside)?;
        self.variables[oldest].reg = None;
        self.variables[oldest].is_dirty = false;

        Ok(reg)
    }

    /// Registro libre sin desalojar a nadie.
    pub(crate) fn try_get_unused_register(&self) -> Option<CpuRegister> {
        let owners = self.register_owners();

        for (slot, reg) in ALLOCATABLE.iter().enumerate() {
            if self.suppressed.contains(reg) {
                continue;
            }
            if owners[slot].is_none() {
                return Some(*reg);
            }
        }

        None
    }

    /// Busca la siguiente referencia a la variable desde la instrucción
    /// actual hasta el fin de la función. Los saltos hacia atrás vuelven
    /// impredecible el siguiente uso: se asume referencia salvo que sea
    /// una temporal, que para entonces salió de alcance.
    pub(crate) fn find_next_variable_reference(
        &self,
        variable: usize,
        reason: SaveReason,
    ) -> bool {
        if reason == SaveReason::Force {
            // Referenciada en la instrucción actual, pero da igual
            return true;
        }

        let name = &self.variables[variable].symbol.name;
        let is_temp = self.variables[variable].symbol.is_temp;

        let mut ip = self.ip_src;
        if reason == SaveReason::Inside {
            ip += 1;
        }

        while ip <= self.parent_end_ip {
            let instruction = match self.stream.find_by_ip(ip) {
                Some(instruction) => instruction,
                None => break,
            };

            match instruction {
                Instruction::Assign {
                    dst_value,
                    dst_index,
                    op1,
                    op2,
                    ..
                } => {
                    let op1_hit =
                        op1.exp_type == ExpressionKind::Variable && op1.value == *name;
                    let op2_hit = op2.as_ref().map_or(false, |op| {
                        op.exp_type == ExpressionKind::Variable && op.value == *name
                    });
                    let dst_hit = dst_index.as_ref().map_or(false, |index| {
                        dst_value == name || index.value == *name
                    });

                    if op1_hit || op2_hit || dst_hit {
                        return true;
                    }
                }

                Instruction::If {
                    op1, op2, target, ..
                } => {
                    let op1_hit =
                        op1.exp_type == ExpressionKind::Variable && op1.value == *name;
                    let op2_hit =
                        op2.exp_type == ExpressionKind::Variable && op2.value == *name;
                    if op1_hit || op2_hit {
                        return true;
                    }

                    if *target < self.ip_src {
                        return !is_temp;
                    }
                }

                Instruction::Goto { target } => {
                    if *target < self.ip_src {
                        return !is_temp;
                    }
                }

                Instruction::GotoLabel { label } => {
                    // Etiqueta ya definida: salto hacia atrás
                    if self.labels.iter().any(|entry| entry.name == *label) {
                        return !is_temp;
                    }
                }

                Instruction::Push { arg } => {
                    if arg.exp_type == ExpressionKind::Variable && arg.value == *name {
                        return true;
                    }
                }

                Instruction::Return { op } => {
                    let hit = op.as_ref().map_or(false, |op| {
                        op.exp_type == ExpressionKind::Variable && op.value == *name
                    });
                    if hit {
                        return true;
                    }
                }

                _ => {}
            }

            ip += 1;
        }

        false
    }

    /// Escribe la variable a su ubicación de memoria si está sucia. Las
    /// locales que ya no se referencian se descartan sin emitir nada.
    pub(crate) fn save_variable(
        &mut self,
        variable: usize,
        reason: SaveReason,
    ) -> CompileResult<()> {
        if self.variables[variable].symbol.size > 0 {
            // Memoria pre-reservada: solo se accede con índice
            unexpected!();
        }

        if !self.variables[variable].is_dirty {
            return Ok(());
        }

        let var_size = self.variables[variable].symbol.typ.size()?;
        let reg = match self.variables[variable].reg {
            Some(reg) => reg,
            None => unexpected!(),
        };

        if self.variables[variable].symbol.parent.is_some() {
            if !self.variables[variable].force_save
                && !self.find_next_variable_reference(variable, reason)
            {
                // No hace falta: nadie la vuelve a leer
                let name = self.variables[variable].symbol.name.clone();
                self.log
                    .verbose(&format!("Variable \"{}\" was optimized out", name));
                return Ok(());
            }

            match var_size {
                1 => {
                    // mov [bp + disp8], r8
                    self.buf.emit_code(&[0x88, modrm(1, reg.enc(), 6), 0]);
                    let hole = self.buf.offset() - 1;
                    self.fixup_local(hole, variable);
                }
                2 => {
                    // mov [bp + disp8], r16
                    self.buf.emit_code(&[0x89, modrm(1, reg.enc(), 6), 0]);
                    let hole = self.buf.offset() - 1;
                    self.fixup_local(hole, variable);
                }
                4 => {
                    // mov [bp + disp8], r32
                    self.buf
                        .emit_code(&[i386::OPERAND_SIZE, 0x89, modrm(1, reg.enc(), 6), 0]);
                    let hole = self.buf.offset() - 1;
                    self.fixup_local(hole, variable);
                }

                _ => unexpected!(),
            }
        } else {
            match var_size {
                1 => {
                    // mov [estática], r8
                    self.buf.emit_code(&[0x88, modrm(0, reg.enc(), 6), 0, 0]);
                    let hole = self.buf.offset() - 2;
                    self.fixup_static(hole, variable);
                }
                2 => {
                    // mov [estática], r16
                    self.buf.emit_code(&[0x89, modrm(0, reg.enc(), 6), 0, 0]);
                    let hole = self.buf.offset() - 2;
                    self.fixup_static(hole, variable);
                }
                4 => {
                    // mov [estática], r32
                    self.buf.emit_code(&[
                        i386::OPERAND_SIZE,
                        0x89,
                        modrm(0, reg.enc(), 6),
                        0,
                        0,
                    ]);
                    let hole = self.buf.offset() - 2;
                    self.fixup_static(hole, variable);
                }

                _ => unexpected!(),
            }
        }

        self.variables[variable].is_dirty = false;
        Ok(())
    }

    /// Guarda y desliga la variable que ocupe el registro dado.
    pub(crate) fn save_and_unload_register(
        &mut self,
        reg: CpuRegister,
        reason: SaveReason,
    ) -> CompileResult<()> {
        for index in 0..self.variables.len() {
            if self.variables[index].reg == Some(reg) && self.in_scope(index) {
                self.save_variable(index, reason)?;
                self.variables[index].reg = None;
                break;
            }
        }

        Ok(())
    }

    /// Guarda y desliga todas las variables en registro.
    pub(crate) fn save_and_unload_all(&mut self, reason: SaveReason) -> CompileResult<()> {
        for index in 0..self.variables.len() {
            if self.variables[index].reg.is_some() && self.in_scope(index) {
                self.save_variable(index, reason)?;
                self.variables[index].reg = None;
            }
        }

        Ok(())
    }

    /// Rompe la asociación variable-registro. La variable tiene que estar
    /// ya guardada; encontrarla sucia es un error interno.
    pub(crate) fn mark_register_discarded(&mut self, reg: CpuRegister) -> CompileResult<()> {
        if self.parent.is_none() {
            return Ok(());
        }

        for index in 0..self.variables.len() {
            if self.variables[index].reg == Some(reg) && self.in_scope(index) {
                if self.variables[index].is_dirty {
                    unexpected!();
                }

                self.variables[index].reg = None;
                break;
            }
        }

        Ok(())
    }

    /// Emite `opcode` con un operando rm que es la ubicación actual de la
    /// variable: registro directo, stack local o memoria estática.
    pub(crate) fn emit_op_var_rm(
        &mut self,
        opcode: &[u8],
        reg_field: u8,
        variable: usize,
    ) -> CompileResult<()> {
        let mut bytes = opcode.to_vec();

        match self.variables[variable].reg {
            Some(reg) => {
                bytes.push(modrm(3, reg_field, reg.enc()));
                self.buf.emit_code(&bytes);
            }
            None => {
                if self.variables[variable].symbol.parent.is_none() {
                    bytes.push(modrm(0, reg_field, 6));
                    bytes.extend_from_slice(&[0, 0]);
                    self.buf.emit_code(&bytes);
                    let hole = self.buf.offset() - 2;
                    self.fixup_static(hole, variable);
                } else {
                    bytes.push(modrm(1, reg_field, 6));
                    bytes.push(0);
                    self.buf.emit_code(&bytes);
                    let hole = self.buf.offset() - 1;
                    self.fixup_local(hole, variable);
                }
            }
        }

        Ok(())
    }

    /// Apila el valor de una variable como parámetro, ensanchándolo si el
    /// formal es más grande.
    pub(crate) fn push_variable_to_stack(
        &mut self,
        variable: usize,
        param_size: i32,
    ) -> CompileResult<()> {
        let var_size = self.variables[variable].symbol.typ.size()?;

        if var_size < param_size {
            // Hay que ensanchar antes de apilar
            let reg = self.load_variable_unreferenced(variable, param_size)?;

            match param_size {
                2 => {
                    self.buf.emit_code(&[opr(0x50, reg.enc())]); // push r16
                }
                4 => {
                    // push r32
                    self.buf
                        .emit_code(&[i386::OPERAND_SIZE, opr(0x50, reg.enc())]);
                }

                _ => unexpected!(),
            }
        } else if let Some(reg) = self.variables[variable].reg {
            match param_size {
                1 => {
                    // La mitad alta se limpia y se apila la palabra entera
                    self.buf.emit_code(&[
                        0x32, // xor r8, rm8
                        modrm(3, reg.h8(), reg.h8()),
                        opr(0x50, reg.enc()), // push r16
                    ]);
                }
                2 => {
                    self.buf.emit_code(&[opr(0x50, reg.enc())]); // push r16
                }
                4 => {
                    // push r32
                    self.buf
                        .emit_code(&[i386::OPERAND_SIZE, opr(0x50, reg.enc())]);
                }

                _ => unexpected!(),
            }
        } else {
            // La variable está en memoria
            match param_size {
                1 => {
                    let reg_temp = self.get_unused_register()?;

                    // movzx r16, rm8 (i386+)
                    self.emit_op_var_rm(&[0x0F, 0xB6], reg_temp.enc(), variable)?;

                    self.buf.emit_code(&[opr(0x50, reg_temp.enc())]); // push r16
                }
                2 => {
                    // push rm16
                    self.emit_op_var_rm(&[0xFF], 6, variable)?;
                }
                4 => {
                    // push rm32
                    self.emit_op_var_rm(&[i386::OPERAND_SIZE, 0xFF], 6, variable)?;
                }

                _ => unexpected!(),
            }
        }

        Ok(())
    }

    /// Carga el valor de la variable en algún registro y le quita la
    /// propiedad, dejándolo libre para que lo consuma una operación.
    pub(crate) fn load_variable_unreferenced(
        &mut self,
        variable: usize,
        desired_size: i32,
    ) -> CompileResult<CpuRegister> {
        if self.variables[variable].symbol.size > 0 {
            // Memoria pre-reservada: lo que circula es su dirección
            if desired_size != 2 {
                unexpected!();
            }

            return self.load_variable_pointer(variable, true);
        }

        let var_size = self.variables[variable].symbol.typ.size()?;

        let reg_dst = match self.variables[variable].reg {
            None => self.get_unused_register()?,
            Some(reg) => {
                if var_size < desired_size {
                    // Si hay un registro de sobra, el ensanchamiento sale
                    // más barato hacia él
                    self.try_get_unused_register().unwrap_or(reg)
                } else {
                    reg
                }
            }
        };

        self.copy_variable_to_register(variable, reg_dst, desired_size)?;
        Ok(reg_dst)
    }

    /// Carga en un registro la dirección de la variable.
    pub(crate) fn load_variable_pointer(
        &mut self,
        variable: usize,
        force_reference: bool,
    ) -> CompileResult<CpuRegister> {
        let reg_dst = self.get_unused_register()?;

        // Los punteros miden 16 bits
        if !force_reference && self.variables[variable].symbol.size == 0 {
            // Ya es un puntero: basta cargar su valor
            return self.load_variable_unreferenced(variable, 2);
        }

        if self.variables[variable].symbol.parent.is_some() {
            // lea r16, [bp + disp8]
            self.buf.emit_code(&[0x8D, modrm(1, reg_dst.enc(), 6), 0]);
            let hole = self.buf.offset() - 1;
            self.fixup_local(hole, variable);
        } else {
            // mov r16, imm16 con la dirección estática
            self.buf.emit_code(&[opr(0xB8, reg_dst.enc()), 0, 0]);
            let hole = self.buf.offset() - 2;
            self.fixup_static(hole, variable);
        }

        Ok(reg_dst)
    }

    /// Calcula en SI la dirección efectiva `base + índice × tamaño` de un
    /// acceso indexado.
    fn load_index_to_si(
        &mut self,
        variable: usize,
        index: &OperandIndex,
        resolved_size: i32,
    ) -> CompileResult<()> {
        match index.exp_type {
            ExpressionKind::Constant => {
                let value = crate::ir::parse_constant(&index.value) * resolved_size;
                self.load_constant_sized(value, CpuRegister::SI, 2)?;
            }
            ExpressionKind::Variable => {
                let index_var = self.find_variable(&index.value)?;
                self.copy_variable_to_register(index_var, CpuRegister::SI, 2)?;

                // Multiplicación por el tamaño del elemento
                let shift = size_to_shift(resolved_size);
                if shift > 0 {
                    // shl rm16, imm8
                    self.buf.emit_code(&[
                        0xC1,
                        modrm(3, 4, CpuRegister::SI.enc()),
                        shift as u8,
                    ]);
                }
            }

            ExpressionKind::None => unexpected!(),
        }

        if self.variables[variable].symbol.size == 0 {
            // Puntero almacenado en otro lado: se suma su valor
            match self.variables[variable].reg {
                Some(reg) => {
                    // add r16, rm16
                    self.buf
                        .emit_code(&[0x03, modrm(3, CpuRegister::SI.enc(), reg.enc())]);
                }
                None => {
                    self.emit_op_var_rm(&[0x03], CpuRegister::SI.enc(), variable)?;
                }
            }
        }

        Ok(())
    }

    /// Carga el elemento `variable[index]` en un registro, con
    /// ensanchamiento a `desired_size` si hace falta.
    pub(crate) fn load_indexed_variable(
        &mut self,
        variable: usize,
        index: &OperandIndex,
        desired_size: i32,
    ) -> CompileResult<CpuRegister> {
        if self.variables[variable].symbol.typ.pointer == 0 {
            unexpected!();
        }

        let resolved_size = self.variables[variable].symbol.typ.dereference().size()?;

        self.load_index_to_si(variable, index, resolved_size)?;

        let reg_dst = self.get_unused_register()?;

        let is_pointer = self.variables[variable].symbol.size == 0;
        let is_static = self.variables[variable].symbol.parent.is_none();

        // rm = 4 es [SI]; para locales, rm = 2 es [BP + SI + disp8]
        match resolved_size {
            1 => {
                if desired_size == 4 {
                    if is_pointer {
                        // movzx r32, byte [si]
                        self.buf.emit_code(&[
                            i386::OPERAND_SIZE,
                            0x0F,
                            0xB6,
                            modrm(0, reg_dst.enc(), 4),
                        ]);
                    } else if is_static {
                        self.buf.emit_code(&[
                            i386::OPERAND_SIZE,
                            0x0F,
                            0xB6,
                            modrm(2, reg_dst.enc(), 4),
                            0,
                            0,
                        ]);
                        let hole = self.buf.offset() - 2;
                        self.fixup_static(hole, variable);
                    } else {
                        self.buf.emit_code(&[
                            i386::OPERAND_SIZE,
                            0x0F,
                            0xB6,
                            modrm(1, reg_dst.enc(), 2),
                            0,
                        ]);
                        let hole = self.buf.offset() - 1;
                        self.fixup_local(hole, variable);
                    }
                } else if desired_size == 2 {
                    if is_pointer {
                        // movzx r16, byte [si]
                        self.buf
                            .emit_code(&[0x0F, 0xB6, modrm(0, reg_dst.enc(), 4)]);
                    } else if is_static {
                        self.buf
                            .emit_code(&[0x0F, 0xB6, modrm(2, reg_dst.enc(), 4), 0, 0]);
                        let hole = self.buf.offset() - 2;
                        self.fixup_static(hole, variable);
                    } else {
                        self.buf
                            .emit_code(&[0x0F, 0xB6, modrm(1, reg_dst.enc(), 2), 0]);
                        let hole = self.buf.offset() - 1;
                        self.fixup_local(hole, variable);
                    }
                } else if is_pointer {
                    // mov r8, [si]
                    self.buf.emit_code(&[0x8A, modrm(0, reg_dst.enc(), 4)]);
                } else if is_static {
                    self.buf
                        .emit_code(&[0x8A, modrm(2, reg_dst.enc(), 4), 0, 0]);
                    let hole = self.buf.offset() - 2;
                    self.fixup_static(hole, variable);
                } else {
                    self.buf.emit_code(&[0x8A, modrm(1, reg_dst.enc(), 2), 0]);
                    let hole = self.buf.offset() - 1;
                    self.fixup_local(hole, variable);
                }
            }
            2 => {
                if desired_size == 4 {
                    if is_pointer {
                        // movzx r32, word [si]
                        self.buf
                            .emit_code(&[0x0F, 0xB7, modrm(0, reg_dst.enc(), 4)]);
                    } else if is_static {
                        self.buf
                            .emit_code(&[0x0F, 0xB7, modrm(2, reg_dst.enc(), 4), 0, 0]);
                        let hole = self.buf.offset() - 2;
                        self.fixup_static(hole, variable);
                    } else {
                        self.buf
                            .emit_code(&[0x0F, 0xB7, modrm(1, reg_dst.enc(), 2), 0]);
                        let hole = self.buf.offset() - 1;
                        self.fixup_local(hole, variable);
                    }
                } else if is_pointer {
                    // mov r16, [si]
                    self.buf.emit_code(&[0x8B, modrm(0, reg_dst.enc(), 4)]);
                } else if is_static {
                    self.buf
                        .emit_code(&[0x8B, modrm(2, reg_dst.enc(), 4), 0, 0]);
                    let hole = self.buf.offset() - 2;
                    self.fixup_static(hole, variable);
                } else {
                    self.buf.emit_code(&[0x8B, modrm(1, reg_dst.enc(), 2), 0]);
                    let hole = self.buf.offset() - 1;
                    self.fixup_local(hole, variable);
                }
            }
            4 => {
                if is_pointer {
                    // mov r32, [si]
                    self.buf
                        .emit_code(&[i386::OPERAND_SIZE, 0x8B, modrm(0, reg_dst.enc(), 4)]);
                } else if is_static {
                    self.buf.emit_code(&[
                        i386::OPERAND_SIZE,
                        0x8B,
                        modrm(2, reg_dst.enc(), 4),
                        0,
                        0,
                    ]);
                    let hole = self.buf.offset() - 2;
                    self.fixup_static(hole, variable);
                } else {
                    self.buf.emit_code(&[
                        i386::OPERAND_SIZE,
                        0x8B,
                        modrm(1, reg_dst.enc(), 2),
                        0,
                    ]);
                    let hole = self.buf.offset() - 1;
                    self.fixup_local(hole, variable);
                }
            }

            _ => unexpected!(),
        }

        Ok(reg_dst)
    }

    /// Escribe el registro en `variable[index]`. El índice se calcula en
    /// DI; los valores indexados nunca se conservan en registro.
    pub(crate) fn save_indexed_variable(
        &mut self,
        variable: usize,
        index: &OperandIndex,
        reg_src: CpuRegister,
    ) -> CompileResult<()> {
        if self.variables[variable].symbol.typ.pointer == 0 {
            // Sin indirección no hay acceso indexado
            unexpected!();
        }

        let resolved_size = self.variables[variable].symbol.typ.dereference().size()?;

        match index.exp_type {
            ExpressionKind::Constant => {
                let value = crate::ir::parse_constant(&index.value) * resolved_size;
                self.load_constant_sized(value, CpuRegister::DI, 2)?;
            }
            ExpressionKind::Variable => {
                let index_var = self.find_variable(&index.value)?;
                self.copy_variable_to_register(index_var, CpuRegister::DI, 2)?;

                let shift = size_to_shift(resolved_size);
                if shift > 0 {
                    // shl rm16, imm8
                    self.buf.emit_code(&[
                        0xC1,
                        modrm(3, 4, CpuRegister::DI.enc()),
                        shift as u8,
                    ]);
                }
            }

            ExpressionKind::None => unexpected!(),
        }

        if self.variables[variable].symbol.size == 0 {
            match self.variables[variable].reg {
                Some(reg) => {
                    // add r16, rm16
                    self.buf
                        .emit_code(&[0x03, modrm(3, CpuRegister::DI.enc(), reg.enc())]);
                }
                None => {
                    self.emit_op_var_rm(&[0x03], CpuRegister::DI.enc(), variable)?;
                }
            }
        }

        let is_pointer = self.variables[variable].symbol.size == 0;
        let is_static = self.variables[variable].symbol.parent.is_none();

        // rm = 5 es [DI]; para locales, rm = 3 es [BP + DI + disp8]
        let (prefix, opcode): (Option<u8>, u8) = match resolved_size {
            1 => (None, 0x88),                      // mov rm8, r8
            2 => (None, 0x89),                      // mov rm16, r16
            4 => (Some(i386::OPERAND_SIZE), 0x89),  // mov rm32, r32
            _ => unexpected!(),
        };

        let mut bytes: Vec<u8> = Vec::new();
        if let Some(prefix) = prefix {
            bytes.push(prefix);
        }
        bytes.push(opcode);

        if is_pointer {
            bytes.push(modrm(0, reg_src.enc(), 5));
            self.buf.emit_code(&bytes);
        } else if is_static {
            bytes.push(modrm(2, reg_src.enc(), 5));
            bytes.extend_from_slice(&[0, 0]);
            self.buf.emit_code(&bytes);
            let hole = self.buf.offset() - 2;
            self.fixup_static(hole, variable);
        } else {
            bytes.push(modrm(1, reg_src.enc(), 3));
            bytes.push(0);
            self.buf.emit_code(&bytes);
            let hole = self.buf.offset() - 1;
            self.fixup_local(hole, variable);
        }

        Ok(())
    }

    /// Copia el valor de la variable al registro indicado, emitiendo
    /// `movzx` cuando hay que ensanchar un valor sin signo.
    pub(crate) fn copy_variable_to_register(
        &mut self,
        variable: usize,
        reg_dst: CpuRegister,
        desired_size: i32,
    ) -> CompileResult<()> {
        if self.variables[variable].symbol.size > 0 {
            unexpected!();
        }

        let var_size = self.variables[variable].symbol.typ.size()?;

        if let Some(reg_src) = self.variables[variable].reg {
            if reg_src == reg_dst && var_size >= desired_size {
                // Ya está donde y como se la quiere: solo cambia de dueño
                self.save_variable(variable, SaveReason::Inside)?;
                self.variables[variable].reg = None;
                return Ok(());
            }

            if reg_src == reg_dst {
                self.save_variable(variable, SaveReason::Inside)?;
                self.variables[variable].reg = None;
            } else {
                self.save_and_unload_register(reg_dst, SaveReason::Inside)?;
            }

            match var_size {
                1 => {
                    if desired_size == 4 {
                        // movzx r32, rm8 (i386+)
                        self.buf.emit_code(&[
                            i386::OPERAND_SIZE,
                            0x0F,
                            0xB6,
                            modrm(3, reg_dst.enc(), reg_src.enc()),
                        ]);
                    } else if desired_size == 2 {
                        // movzx r16, rm8 (i386+)
                        self.buf
                            .emit_code(&[0x0F, 0xB6, modrm(3, reg_dst.enc(), reg_src.enc())]);
                    } else {
                        // mov r8, rm8
                        self.buf
                            .emit_code(&[0x8A, modrm(3, reg_dst.enc(), reg_src.enc())]);
                    }
                }
                2 => {
                    if desired_size == 4 {
                        // movzx r32, rm16 (i386+)
                        self.buf.emit_code(&[
                            i386::OPERAND_SIZE,
                            0x0F,
                            0xB7,
                            modrm(3, reg_dst.enc(), reg_src.enc()),
                        ]);
                    } else {
                        // mov r16, rm16
                        self.buf
                            .emit_code(&[0x8B, modrm(3, reg_dst.enc(), reg_src.enc())]);
                    }
                }
                4 => {
                    // mov r32, rm32
                    self.buf.emit_code(&[
                        i386::OPERAND_SIZE,
                        0x8B,
                        modrm(3, reg_dst.enc(), reg_src.enc()),
                    ]);
                }

                _ => unexpected!(),
            }

            return Ok(());
        }

        self.save_and_unload_register(reg_dst, SaveReason::Inside)?;

        match var_size {
            1 => {
                if desired_size == 4 {
                    // movzx r32, rm8
                    self.emit_op_var_rm(
                        &[i386::OPERAND_SIZE, 0x0F, 0xB6],
                        reg_dst.enc(),
                        variable,
                    )?;
                } else if desired_size == 2 {
                    // movzx r16, rm8
                    self.emit_op_var_rm(&[0x0F, 0xB6], reg_dst.enc(), variable)?;
                } else {
                    // mov r8, rm8
                    self.emit_op_var_rm(&[0x8A], reg_dst.enc(), variable)?;
                }
            }
            2 => {
                if desired_size == 4 {
                    // movzx r32, rm16
                    self.emit_op_var_rm(
                        &[i386::OPERAND_SIZE, 0x0F, 0xB7],
                        reg_dst.enc(),
                        variable,
                    )?;
                } else {
                    // mov r16, rm16
                    self.emit_op_var_rm(&[0x8B], reg_dst.enc(), variable)?;
                }
            }
            4 => {
                // mov r32, rm32
                self.emit_op_var_rm(&[i386::OPERAND_SIZE, 0x8B], reg_dst.enc(), variable)?;
            }

            _ => unexpected!(),
        }

        Ok(())
    }

    /// Carga una constante con el tamaño pedido; el cero se materializa
    /// con `xor`, que es más corto.
    pub(crate) fn load_constant_sized(
        &mut self,
        value: i32,
        reg: CpuRegister,
        desired_size: i32,
    ) -> CompileResult<()> {
        if value == 0 {
            return self.zero_register(reg, desired_size);
        }

        self.mark_register_discarded(reg)?;

        match desired_size {
            1 => {
                // mov r8, imm8
                self.buf.emit_code(&[opr(0xB0, reg.enc()), value as u8]);
            }
            2 => {
                // mov r16, imm16
                let imm = (value as u16).to_le_bytes();
                self.buf.emit_code(&[opr(0xB8, reg.enc()), imm[0], imm[1]]);
            }
            4 | 8 => {
                // mov r32, imm32
                let imm = (value as u32).to_le_bytes();
                self.buf.emit_code(&[
                    i386::OPERAND_SIZE,
                    opr(0xB8, reg.enc()),
                    imm[0],
                    imm[1],
                    imm[2],
                    imm[3],
                ]);
            }

            _ => unexpected!(),
        }

        Ok(())
    }

    /// Pone el registro en cero.
    pub(crate) fn zero_register(
        &mut self,
        reg: CpuRegister,
        desired_size: i32,
    ) -> CompileResult<()> {
        self.mark_register_discarded(reg)?;

        match desired_size {
            1 => {
                // xor r8, rm8
                self.buf.emit_code(&[0x32, modrm(3, reg.enc(), reg.enc())]);
            }
            2 => {
                // xor r16, rm16
                self.buf.emit_code(&[0x33, modrm(3, reg.enc(), reg.enc())]);
            }
            4 | 8 => {
                // xor r32, rm32
                self.buf.emit_code(&[
                    i386::OPERAND_SIZE,
                    0x33,
                    modrm(3, reg.enc(), reg.enc()),
                ]);
            }

            _ => unexpected!(),
        }

        Ok(())
    }
}
