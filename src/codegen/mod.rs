//! Back end: emisión de ejecutables MZ de DOS con código i386.
//!
//! El emisor recorre la secuencia de instrucciones abstractas en orden de
//! IP y produce la imagen completa del ejecutable en un búfer: cabecera
//! MZ, código de las funciones alcanzables, funciones compartidas,
//! literales de cadena y región estática. Las referencias hacia adelante
//! (saltos, llamadas, cadenas, locales y estáticas) se registran en una
//! tabla de parcheo única y se resuelven en fases deterministas:
//!
//! - `Ip` al alcanzar el IP fuente destino,
//! - `Label` al definirse la etiqueta,
//! - `Function` al comenzar la emisión de la función,
//! - `String` al volcar el pool de cadenas,
//! - `Local` en el epílogo, cuando los offsets de stack son finales,
//! - `Static` al reservar la región estática.
//!
//! Las direcciones absolutas dentro de DS llevan el sesgo de 0x0100 del
//! Program Segment Prefix, porque el modelo de memoria es plano.

mod assign;
mod regs;
mod shared;

use std::collections::{HashMap, HashSet};
use std::io::Write;

use crate::arch::i386::{self, modrm, CpuRegister, CpuSegment};
use crate::buffer::CodeBuffer;
use crate::error::{CompileResult, CompilerError, ErrorKind};
use crate::ir::{
    parse_constant, CallArgument, CompareKind, Instruction, Operand, Stream,
};
use crate::log::Log;
use crate::semantic::Compiler;
use crate::symbols::{
    largest_arithmetic, BaseType, ExpressionKind, SymbolEntry, SymbolTable, SymbolType,
};

pub(crate) use regs::{DosVariable, SaveReason};

/// Máxima cantidad de instrucciones abstractas que se estima caben en una
/// dirección relativa de 8 bits.
const NEAR_JUMP_THRESHOLD: i32 = 10;

/// Sesgo del Program Segment Prefix en el modelo plano.
pub(crate) const PSP_OFFSET: i32 = 0x0100;

/// Forma en que se escribe un valor pendiente.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FixupKind {
    /// Dirección relativa con signo de 8 bits.
    Rel8,
    /// Dirección relativa de 16 bits.
    Rel16,
    /// Dirección absoluta de 16 bits dentro de DS.
    DsAbs16,
    /// Desplazamiento de stack con signo de 8 bits.
    Stack8,
}

/// A qué se refiere un valor pendiente.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FixupTarget {
    Ip(i32),
    Label(String),
    Function(String),
    Str(String),
    Local(String),
    Static(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FixupTargetKind {
    Ip,
    Label,
    Function,
    Str,
    Local,
    Static,
}

impl FixupTarget {
    fn kind(&self) -> FixupTargetKind {
        match self {
            FixupTarget::Ip(_) => FixupTargetKind::Ip,
            FixupTarget::Label(_) => FixupTargetKind::Label,
            FixupTarget::Function(_) => FixupTargetKind::Function,
            FixupTarget::Str(_) => FixupTargetKind::Str,
            FixupTarget::Local(_) => FixupTargetKind::Local,
            FixupTarget::Static(_) => FixupTargetKind::Static,
        }
    }

    fn name(&self) -> Option<&str> {
        match self {
            FixupTarget::Ip(_) => None,
            FixupTarget::Label(name)
            | FixupTarget::Function(name)
            | FixupTarget::Str(name)
            | FixupTarget::Local(name)
            | FixupTarget::Static(name) => Some(name),
        }
    }
}

/// Un valor pendiente de escribir en el búfer.
#[derive(Debug)]
pub(crate) struct Fixup {
    kind: FixupKind,
    target: FixupTarget,
    /// Offset absoluto del hueco dentro del búfer.
    offset: usize,
    /// `ip_dst` inmediatamente después de la instrucción, base de las
    /// direcciones relativas.
    at_ip: i32,
}

/// Posición de destino resuelta con nombre: funciones y etiquetas.
#[derive(Clone, Debug)]
pub(crate) struct DosLabel {
    pub name: String,
    pub ip_dst: i32,
}

/// Hueco de salto corto dentro de una misma rutina.
#[derive(Copy, Clone)]
pub(crate) struct Hole {
    offset: usize,
    at_ip: i32,
}

/// Función en curso de emisión.
#[derive(Clone)]
pub(crate) struct ParentFunction {
    pub name: String,
    pub is_entry_point: bool,
    pub return_type: SymbolType,
    pub parameter: i32,
}

/// Emite el ejecutable completo a partir del estado final del front end.
pub fn emit<W: Write>(compiler: &mut Compiler, output: &mut W) -> CompileResult<()> {
    let requested_stack = compiler.stack_size;
    let Compiler {
        symbols,
        stream,
        log,
        ..
    } = compiler;

    let mut emitter = DosExeEmitter::new(symbols, stream, log.as_mut(), requested_stack);
    emitter.emit_mz_header();
    emitter.emit_instructions()?;
    emitter.emit_shared_functions()?;
    emitter.emit_static_data()?;
    emitter.fix_mz_header()?;
    emitter.save(output)
}

// Offsets de los campos de la cabecera MZ dentro del búfer
const HDR_LAST_BLOCK_SIZE: usize = 2;
const HDR_BLOCK_COUNT: usize = 4;
const HDR_HEADER_PARAGRAPHS: usize = 8;
const HDR_MIN_EXTRA_PARAGRAPHS: usize = 10;
const HDR_MAX_EXTRA_PARAGRAPHS: usize = 12;
const HDR_SS: usize = 14;
const HDR_SP: usize = 16;
const HDR_IP: usize = 20;
const HDR_SIZE: usize = 28;

pub(crate) struct DosExeEmitter<'a> {
    pub(crate) symbols: &'a mut SymbolTable,
    pub(crate) stream: &'a Stream,
    pub(crate) log: &'a mut dyn Log,

    requested_stack: u32,

    pub(crate) buf: CodeBuffer,

    pub(crate) ip_src: i32,
    static_size: i32,

    ip_src_to_dst: HashMap<i32, i32>,
    pub(crate) fixups: Vec<Fixup>,
    pub(crate) variables: Vec<DosVariable>,
    functions: Vec<DosLabel>,
    pub(crate) labels: Vec<DosLabel>,
    pub(crate) strings: Vec<String>,

    pub(crate) suppressed: Vec<CpuRegister>,

    pub(crate) parent: Option<ParentFunction>,
    pub(crate) parent_end_ip: i32,
    parent_stack_offset: usize,

    call_parameters: Vec<CallArgument>,

    was_return: bool,
}

impl<'a> DosExeEmitter<'a> {
    pub(crate) fn new(
        symbols: &'a mut SymbolTable,
        stream: &'a Stream,
        log: &'a mut dyn Log,
        requested_stack: u32,
    ) -> Self {
        DosExeEmitter {
            symbols,
            stream,
            log,
            requested_stack,
            buf: CodeBuffer::new(),
            ip_src: 0,
            static_size: 0,
            ip_src_to_dst: HashMap::new(),
            fixups: Vec::new(),
            variables: Vec::new(),
            functions: Vec::new(),
            labels: Vec::new(),
            strings: Vec::new(),
            suppressed: Vec::new(),
            parent: None,
            parent_end_ip: 0,
            parent_stack_offset: 0,
            call_parameters: Vec::new(),
            was_return: false,
        }
    }

    // ------------------------------------------------------------------
    // Cabecera MZ

    /// Emite la cabecera con su firma y el relleno hasta la frontera de
    /// párrafo; el resto de los campos se corrige al final.
    pub(crate) fn emit_mz_header(&mut self) {
        let mut header = [0u8; HDR_SIZE];
        header[0] = b'M';
        header[1] = b'Z';

        let header_paragraphs = ((HDR_SIZE + 16 - 1) >> 4) as u16;
        header[HDR_HEADER_PARAGRAPHS..HDR_HEADER_PARAGRAPHS + 2]
            .copy_from_slice(&header_paragraphs.to_le_bytes());

        self.buf.emit_raw(&header);

        // Relleno para que las instrucciones queden alineadas
        let remaining = ((header_paragraphs as usize) << 4) - HDR_SIZE;
        if remaining > 0 {
            self.buf.emit_raw(&vec![0u8; remaining]);
        }
    }

    /// Completa la cabecera una vez conocidos los tamaños finales.
    pub(crate) fn fix_mz_header(&mut self) -> CompileResult<()> {
        self.log.info("Finalizing executable file...");
        self.log.push_indent();

        let ip_dst = self.buf.ip();

        self.log
            .verbose(&format!("Program size: {} bytes", ip_dst));
        self.log
            .verbose(&format!("Static size: {} bytes", self.static_size));

        // Tamaño de la imagen en bloques de 512 bytes
        let mut block_count = (ip_dst / 512) as u16;
        let last_block_size = (ip_dst % 512) as u16;
        if last_block_size > 0 {
            block_count += 1;
        }
        self.buf.patch_u16(HDR_BLOCK_COUNT, block_count);
        self.buf.patch_u16(HDR_LAST_BLOCK_SIZE, last_block_size);

        // Stack después del código y la región estática
        let mut ss = (((ip_dst + self.static_size + 16 - 1) >> 4) & 0xFFFF) as u16;

        let requested = self.requested_stack;
        let mut sp: u16 = if (0x20..=0x8000).contains(&requested) {
            requested as u16
        } else {
            0x2000
        };

        self.log.verbose(&format!("Stack size: {} bytes", sp));
        self.log.verbose(&format!("Stack segment: 0x{:04x}", ss));

        // Memoria adicional que DOS debe reservar
        let min_extra =
            (((self.static_size + i32::from(sp) + 16 - 1) >> 4) + 1) as u16;
        self.buf.patch_u16(HDR_MIN_EXTRA_PARAGRAPHS, min_extra);
        self.buf.patch_u16(HDR_MAX_EXTRA_PARAGRAPHS, min_extra);

        // Ajuste de SP para el modelo de memoria plano
        sp = sp.wrapping_add(ss << 4).wrapping_add(PSP_OFFSET as u16);
        ss = 0;
        self.buf.patch_u16(HDR_SS, ss);
        self.buf.patch_u16(HDR_SP, sp);

        // El IP inicial sale del salto que el parser emite al principio
        if let Some(Instruction::Goto { target }) = self.stream.find_by_ip(0) {
            let entry_ip = self
                .ip_src_to_dst
                .get(target)
                .copied()
                .ok_or_else(CompilerError::unexpected)?;
            self.buf.patch_u16(HDR_IP, entry_ip as u16);

            self.log
                .verbose(&format!("Entry point: 0x{:04x}", entry_ip));
        }

        self.log.pop_indent();
        Ok(())
    }

    /// Escribe la imagen final, verificando que ninguna tabla de parcheo
    /// quede con entradas pendientes.
    pub(crate) fn save<W: Write>(&mut self, output: &mut W) -> CompileResult<()> {
        self.check_fixups_empty(FixupTargetKind::Function)?;
        self.check_fixups_empty(FixupTargetKind::Str)?;
        self.check_fixups_empty(FixupTargetKind::Static)?;

        output.write_all(self.buf.as_slice()).map_err(|_| {
            CompilerError::new(ErrorKind::Compilation, "Emitting of executable file failed")
        })
    }

    // ------------------------------------------------------------------
    // Recorrido principal

    pub(crate) fn emit_instructions(&mut self) -> CompileResult<()> {
        self.log
            .info("Compiling intermediate code to i386 machine code...");
        self.log.push_indent();
        self.log.push_indent();

        self.build_variable_list();

        // IPs que son destino de algún salto: ahí los registros deben
        // estar descargados, para poder llegar desde cualquier lado
        let mut discontinuous_ips: HashSet<i32> = HashSet::new();
        for instruction in self.stream.iter() {
            match instruction {
                Instruction::Goto { target } => {
                    discontinuous_ips.insert(*target);
                }
                Instruction::If { target, .. } => {
                    discontinuous_ips.insert(*target);
                }
                _ => {}
            }
        }

        let stream = self.stream;

        // El salto inicial sobre las declaraciones se omite
        if let Some(Instruction::Goto { .. }) = stream.find_by_ip(0) {
            self.ip_src = 1;
        }

        while (self.ip_src as usize) < stream.len() {
            if discontinuous_ips.contains(&self.ip_src) {
                self.save_and_unload_all(SaveReason::Before)?;
            }

            // Conversión de IP abstracto a IP real
            self.ip_src_to_dst.insert(self.ip_src, self.buf.ip());

            self.process_symbol_linkage()?;

            if (self.ip_src as usize) >= stream.len() {
                // El salto sobre funciones muertas puede agotar la secuencia
                break;
            }

            self.backpatch_addresses()?;

            self.was_return = false;

            let instruction = stream
                .find_by_ip(self.ip_src)
                .ok_or_else(CompilerError::unexpected)?;

            match instruction {
                Instruction::Nop => {}
                Instruction::Assign {
                    kind,
                    dst_value,
                    dst_index,
                    op1,
                    op2,
                } => {
                    self.emit_assign(*kind, dst_value, dst_index.as_ref(), op1, op2.as_ref())?;
                }
                Instruction::Goto { target } => self.emit_goto(*target)?,
                Instruction::GotoLabel { label } => self.emit_goto_label(label)?,
                Instruction::If {
                    kind,
                    op1,
                    op2,
                    target,
                } => self.emit_if(*kind, op1, op2, *target)?,
                Instruction::Push { arg } => self.emit_push(arg),
                Instruction::Call {
                    target,
                    return_symbol,
                } => self.emit_call(target, return_symbol.as_deref())?,
                Instruction::Return { op } => self.emit_return(op.as_ref())?,
            }

            self.ip_src += 1;
        }

        self.emit_function_epilogue()?;

        self.log.pop_indent();
        self.log.pop_indent();
        Ok(())
    }

    fn build_variable_list(&mut self) {
        for symbol in self.symbols.iter() {
            if symbol.typ.is_value_type() {
                self.variables.push(DosVariable::new(symbol.clone()));
            }
        }
    }

    /// Acciones ligadas a los símbolos cuyo IP coincide con el actual:
    /// prólogos de función, salto sobre funciones no referenciadas y
    /// definición de etiquetas.
    fn process_symbol_linkage(&mut self) -> CompileResult<()> {
        'retry: loop {
            for index in 0..self.symbols.len() {
                if self.symbols.get(index).ip != self.ip_src {
                    continue;
                }

                match self.symbols.get(index).typ.base {
                    BaseType::EntryPoint => {
                        self.emit_function_epilogue()?;
                        self.emit_entry_point_prologue(index);
                        self.refresh_parent_end_ip();

                        self.log.pop_indent();
                        self.log.info("Compiling entry point...");
                        self.log.push_indent();
                    }

                    BaseType::Function => {
                        self.emit_function_epilogue()?;

                        if self.symbols.get(index).ref_count == 0 {
                            // Sin referencias: la función no se emite
                            let name = self.symbols.get(index).name.clone();
                            self.log.pop_indent();
                            self.log.info(&format!(
                                "Function \"{}\" was optimized out",
                                name
                            ));
                            self.log.push_indent();

                            // Avanza hasta el comienzo de la siguiente función
                            self.ip_src += 1;
                            while (self.ip_src as usize) < self.stream.len() {
                                let boundary = self.symbols.iter().any(|symbol| {
                                    symbol.ip == self.ip_src
                                        && matches!(
                                            symbol.typ.base,
                                            BaseType::Function | BaseType::EntryPoint
                                        )
                                });
                                if boundary {
                                    break;
                                }
                                self.ip_src += 1;
                            }

                            self.ip_src_to_dst.insert(self.ip_src, self.buf.ip());
                            continue 'retry;
                        }

                        self.emit_function_prologue(index)?;
                        self.refresh_parent_end_ip();

                        let name = self
                            .parent
                            .as_ref()
                            .map(|parent| parent.name.clone())
                            .unwrap_or_default();
                        self.log.pop_indent();
                        self.log
                            .info(&format!("Compiling function \"{}\"...", name));
                        self.log.push_indent();
                    }

                    BaseType::Label => {
                        // Igual que con los saltos, la etiqueta debe poder
                        // alcanzarse sin suposiciones sobre registros
                        self.save_and_unload_all(SaveReason::Before)?;
                        self.ip_src_to_dst.insert(self.ip_src, self.buf.ip());

                        let name = self.symbols.get(index).name.clone();
                        let ip_dst = self.buf.ip();
                        self.labels.push(DosLabel {
                            name: name.clone(),
                            ip_dst,
                        });
                        self.backpatch_labels(&name, ip_dst, FixupTargetKind::Label)?;
                    }

                    _ => {}
                }
            }

            return Ok(());
        }
    }

    /// Fin de la función en curso: busca el IP donde comienza la próxima.
    pub(crate) fn refresh_parent_end_ip(&mut self) {
        let mut ip = self.ip_src;

        while self.stream.find_by_ip(ip + 1).is_some() {
            let boundary = self.symbols.iter().any(|symbol| {
                symbol.ip == ip + 1
                    && matches!(
                        symbol.typ.base,
                        BaseType::Function | BaseType::EntryPoint
                    )
            });
            if boundary {
                self.parent_end_ip = ip;
                return;
            }

            ip += 1;
        }

        self.parent_end_ip = ip;
    }

    // ------------------------------------------------------------------
    // Parcheo

    fn apply_fixup(
        buf: &mut CodeBuffer,
        fixup: &Fixup,
        resolved_ip: i32,
    ) -> CompileResult<()> {
        match fixup.kind {
            FixupKind::Rel8 => {
                let rel8 = resolved_ip - fixup.at_ip;
                if rel8 < i32::from(i8::MIN) || rel8 > i32::from(i8::MAX) {
                    return Err(CompilerError::new(
                        ErrorKind::Compilation,
                        "Compiler cannot generate that high relative address",
                    ));
                }
                buf.patch_i8(fixup.offset, rel8 as i8);
            }
            FixupKind::Rel16 => {
                let rel16 = (resolved_ip - fixup.at_ip) as i16;
                buf.patch_i16(fixup.offset, rel16);
            }
            FixupKind::DsAbs16 => {
                let abs16 = (resolved_ip as u16).wrapping_add(PSP_OFFSET as u16);
                buf.patch_u16(fixup.offset, abs16);
            }
            FixupKind::Stack8 => {
                buf.patch_i8(fixup.offset, resolved_ip as i8);
            }
        }

        Ok(())
    }

    /// Resuelve las entradas pendientes dirigidas al IP fuente actual.
    fn backpatch_addresses(&mut self) -> CompileResult<()> {
        let resolved_ip = match self.ip_src_to_dst.get(&self.ip_src) {
            Some(ip) => *ip,
            None => return Ok(()),
        };

        let mut fixups = std::mem::take(&mut self.fixups);
        let mut index = 0;
        while index < fixups.len() {
            let matches_ip =
                matches!(&fixups[index].target, FixupTarget::Ip(ip) if *ip == self.ip_src);
            if matches_ip {
                let fixup = fixups.remove(index);
                if let Err(error) = Self::apply_fixup(&mut self.buf, &fixup, resolved_ip) {
                    self.fixups = fixups;
                    return Err(error);
                }
            } else {
                index += 1;
            }
        }
        self.fixups = fixups;

        Ok(())
    }

    /// Resuelve las entradas pendientes dirigidas al nombre dado, con el
    /// valor recién conocido (IP de destino u offset de stack).
    pub(crate) fn backpatch_labels(
        &mut self,
        name: &str,
        resolved_ip: i32,
        target: FixupTargetKind,
    ) -> CompileResult<()> {
        let mut fixups = std::mem::take(&mut self.fixups);
        let mut index = 0;
        while index < fixups.len() {
            let matches_name =
                fixups[index].target.kind() == target && fixups[index].target.name() == Some(name);
            if matches_name {
                let fixup = fixups.remove(index);
                if let Err(error) = Self::apply_fixup(&mut self.buf, &fixup, resolved_ip) {
                    self.fixups = fixups;
                    return Err(error);
                }
            } else {
                index += 1;
            }
        }
        self.fixups = fixups;

        Ok(())
    }

    /// Verifica que no queden entradas pendientes del tipo dado.
    pub(crate) fn check_fixups_empty(&self, target: FixupTargetKind) -> CompileResult<()> {
        for fixup in &self.fixups {
            if fixup.target.kind() != target {
                continue;
            }

            let name = fixup.target.name().unwrap_or("");
            return Err(match target {
                FixupTargetKind::Function => CompilerError::new(
                    ErrorKind::Statement,
                    format!("Function \"{}\" could not be resolved", name),
                ),
                FixupTargetKind::Str => CompilerError::new(
                    ErrorKind::Statement,
                    format!("String \"{}\" could not be resolved", name),
                ),
                FixupTargetKind::Label => CompilerError::new(
                    ErrorKind::Compilation,
                    format!("Label \"{}\" could not be resolved", name),
                ),
                _ => CompilerError::unexpected(),
            });
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Prólogos y epílogo

    fn parent_info(symbol: &SymbolEntry) -> ParentFunction {
        ParentFunction {
            name: symbol.name.clone(),
            is_entry_point: symbol.typ.base == BaseType::EntryPoint,
            return_type: symbol.return_type,
            parameter: symbol.parameter,
        }
    }

    /// Prólogo del punto de entrada: DOS entrega DS apuntando al PSP; el
    /// modelo plano hace SS = ES = DS antes de crear el stack frame.
    fn emit_entry_point_prologue(&mut self, index: usize) {
        self.parent = Some(Self::parent_info(self.symbols.get(index)));

        i386::mov_r_sreg(&mut self.buf, CpuRegister::AX, CpuSegment::DS);
        i386::mov_sreg_r(&mut self.buf, CpuSegment::SS, CpuRegister::AX);
        i386::mov_sreg_r(&mut self.buf, CpuSegment::ES, CpuRegister::AX);

        // Nuevo stack frame
        self.buf.emit_code(&[
            i386::OPERAND_SIZE,
            0x8B, // mov ebp, esp
            modrm(3, CpuRegister::BP.enc(), CpuRegister::SP.enc()),
        ]);

        // Espacio para locales; el tamaño se parchea en el epílogo
        self.buf.emit_code(&[
            0x81, // sub esp, imm16
            modrm(3, 5, CpuRegister::SP.enc()),
            0,
            0,
        ]);
        self.parent_stack_offset = self.buf.offset() - 2;

        self.labels.clear();
    }

    fn emit_function_prologue(&mut self, index: usize) -> CompileResult<()> {
        self.parent = Some(Self::parent_info(self.symbols.get(index)));
        let name = self.symbols.get(index).name.clone();

        // Las llamadas emitidas antes de este punto esperan la dirección
        let ip_dst = self.buf.ip();
        self.backpatch_labels(&name, ip_dst, FixupTargetKind::Function)?;
        self.functions.push(DosLabel {
            name: name.clone(),
            ip_dst,
        });

        i386::proc_enter(&mut self.buf);

        // Offsets positivos de los parámetros: 4 bytes de ebp guardado
        // más 2 bytes de dirección de retorno, con slot mínimo de 2 bytes
        let mut stack_param_size = 0;
        for variable in self.variables.iter_mut() {
            if variable.symbol.belongs_to(&name) && variable.symbol.parameter != 0 {
                let size = variable.symbol.typ.size()?.max(2);
                variable.location = stack_param_size + 6;
                stack_param_size += size;
            }
        }

        self.buf.emit_code(&[
            0x81, // sub esp, imm16
            modrm(3, 5, CpuRegister::SP.enc()),
            0,
            0,
        ]);
        self.parent_stack_offset = self.buf.offset() - 2;

        self.labels.clear();
        Ok(())
    }

    /// Cierra la función en curso: retorno implícito de las `void`,
    /// asignación de offsets a las locales usadas y parcheo del hueco de
    /// `sub esp`.
    pub(crate) fn emit_function_epilogue(&mut self) -> CompileResult<()> {
        let parent = match &self.parent {
            Some(parent) => parent.clone(),
            None => return Ok(()),
        };

        self.check_return_present()?;

        let mut stack_var_size: i32 = 0;
        let mut stack_saved_size: i32 = 0;
        let mut assigned: Vec<(String, i32)> = Vec::new();

        for variable in self.variables.iter_mut() {
            if !variable.symbol.belongs_to(&parent.name) || variable.symbol.parameter != 0 {
                continue;
            }

            let size = if variable.symbol.size > 0 {
                variable.symbol.size * variable.symbol.typ.dereference().size()?
            } else {
                variable.symbol.typ.size()?
            };

            if variable.symbol.ref_count == 0 {
                // Nunca referenciada: el espacio ni se reserva
                stack_saved_size += size;
            } else {
                stack_var_size += size;
                variable.location = -stack_var_size;
                assigned.push((variable.symbol.name.clone(), variable.location));
            }
        }

        for (name, location) in assigned {
            self.backpatch_labels(&name, location, FixupTargetKind::Local)?;
        }

        if self.parent_stack_offset == 0 {
            unexpected!();
        }

        if stack_var_size >= i32::from(i8::MAX) {
            return Err(CompilerError::new(
                ErrorKind::Compilation,
                "Compiler cannot generate that high address offset",
            ));
        }

        self.buf
            .patch_u16(self.parent_stack_offset, stack_var_size as u16);

        self.check_fixups_empty(FixupTargetKind::Local)?;

        self.log.verbose(&format!(
            "Uses {} bytes in stack ({} bytes saved)",
            stack_var_size, stack_saved_size
        ));

        // Las etiquetas son locales a la función: a esta altura no puede
        // quedar ninguna sin resolver
        self.check_fixups_empty(FixupTargetKind::Label)?;

        self.parent = None;
        Ok(())
    }

    /// La última sentencia de una función debe ser un retorno; en las
    /// `void` se sintetiza uno.
    fn check_return_present(&mut self) -> CompileResult<()> {
        let parent = match &self.parent {
            Some(parent) => parent.clone(),
            None => return Ok(()),
        };

        if self.was_return {
            return Ok(());
        }

        if parent.return_type.is_void() {
            self.emit_return(None)?;

            // Los registros descargados corren el IP real
            self.ip_src_to_dst.insert(self.ip_src, self.buf.ip());
            Ok(())
        } else {
            Err(CompilerError::new(
                ErrorKind::Compilation,
                format!(
                    "Function \"{}\" must have \"return\" as the last statement",
                    parent.name
                ),
            ))
        }
    }

    // ------------------------------------------------------------------
    // Saltos

    fn emit_goto(&mut self, target: i32) -> CompileResult<()> {
        // Los "goto" los genera el compilador: el salto a sí mismo no
        // puede ocurrir
        if target == self.ip_src {
            unexpected!();
        }

        // El salto a la instrucción siguiente se elimina solo
        if target == self.ip_src + 1 {
            return Ok(());
        }

        self.save_and_unload_all(SaveReason::Before)?;

        let backward = target < self.ip_src;

        let goto_near = if backward {
            // Ya emitido: se sabe si alcanza una dirección de 8 bits
            let dst = self.resolved_dst(target)?;
            let rel = dst - (self.buf.ip() + 2);
            rel > i32::from(i8::MIN) && rel < i32::from(i8::MAX)
        } else {
            // Aún no emitido: estimación
            let rel = (target - self.ip_src) * NEAR_JUMP_THRESHOLD;
            rel > i32::from(i8::MIN) && rel < i32::from(i8::MAX)
        };

        let hole = if goto_near {
            self.buf.emit_code(&[0xEB, 0]); // jmp rel8
            self.buf.offset() - 1
        } else {
            self.buf.emit_code(&[0xE9, 0, 0]); // jmp rel16
            self.buf.offset() - 2
        };

        if backward {
            let dst = self.resolved_dst(target)?;
            let rel = dst - self.buf.ip();

            if goto_near {
                if rel < i32::from(i8::MIN) || rel > i32::from(i8::MAX) {
                    return Err(CompilerError::new(
                        ErrorKind::Compilation,
                        "Compiler cannot generate that high relative address",
                    ));
                }
                self.buf.patch_i8(hole, rel as i8);
            } else {
                self.buf.patch_i16(hole, rel as i16);
            }
        } else {
            self.fixups.push(Fixup {
                kind: if goto_near {
                    FixupKind::Rel8
                } else {
                    FixupKind::Rel16
                },
                target: FixupTarget::Ip(target),
                offset: hole,
                at_ip: self.buf.ip(),
            });
        }

        Ok(())
    }

    fn emit_goto_label(&mut self, label: &str) -> CompileResult<()> {
        let known = self
            .labels
            .iter()
            .find(|entry| entry.name == label)
            .map(|entry| entry.ip_dst);

        self.save_and_unload_all(SaveReason::Before)?;

        let goto_near = match known {
            Some(dst) => {
                let rel = dst - (self.buf.ip() + 2);
                rel > i32::from(i8::MIN) && rel < i32::from(i8::MAX)
            }
            // Sin estimación posible hacia adelante
            None => false,
        };

        let hole = if goto_near {
            self.buf.emit_code(&[0xEB, 0]); // jmp rel8
            self.buf.offset() - 1
        } else {
            self.buf.emit_code(&[0xE9, 0, 0]); // jmp rel16
            self.buf.offset() - 2
        };

        match known {
            Some(dst) => {
                let rel = dst - self.buf.ip();
                if goto_near {
                    if rel < i32::from(i8::MIN) || rel > i32::from(i8::MAX) {
                        return Err(CompilerError::new(
                            ErrorKind::Compilation,
                            "Compiler cannot generate that high relative address",
                        ));
                    }
                    self.buf.patch_i8(hole, rel as i8);
                } else {
                    self.buf.patch_i16(hole, rel as i16);
                }
            }
            None => {
                self.fixups.push(Fixup {
                    kind: if goto_near {
                        FixupKind::Rel8
                    } else {
                        FixupKind::Rel16
                    },
                    target: FixupTarget::Label(label.to_string()),
                    offset: hole,
                    at_ip: self.buf.ip(),
                });
            }
        }

        Ok(())
    }

    fn resolved_dst(&self, ip_src: i32) -> CompileResult<i32> {
        self.ip_src_to_dst
            .get(&ip_src)
            .copied()
            .ok_or_else(CompilerError::unexpected)
    }

    // ------------------------------------------------------------------
    // If

    fn emit_if(
        &mut self,
        kind: CompareKind,
        op1: &Operand,
        op2: &Operand,
        target: i32,
    ) -> CompileResult<()> {
        if target == self.ip_src {
            unexpected!();
        }

        // Salto a la instrucción siguiente: nada que emitir
        if target == self.ip_src + 1 {
            return Ok(());
        }

        self.save_and_unload_all(SaveReason::Before)?;

        let goto_near = if target < self.ip_src {
            let dst = self.resolved_dst(target)?;
            let rel = dst - (self.buf.ip() + NEAR_JUMP_THRESHOLD);
            rel > i32::from(i8::MIN) && rel < i32::from(i8::MAX)
        } else {
            let rel = (target - self.ip_src) * NEAR_JUMP_THRESHOLD;
            rel > i32::from(i8::MIN) && rel < i32::from(i8::MAX)
        };

        // La constante siempre como segundo operando
        let (op1, op2, kind) = if op1.exp_type == ExpressionKind::Constant {
            (op2.clone(), op1.clone(), kind.swapped())
        } else {
            (op1.clone(), op2.clone(), kind)
        };

        let hole = if op1.typ.base == BaseType::String || op2.typ.base == BaseType::String {
            self.emit_if_strings(kind, &op1, &op2, goto_near)?
        } else {
            match kind {
                CompareKind::LogOr | CompareKind::LogAnd => {
                    self.emit_if_or_and(kind, &op1, &op2, goto_near)?
                }

                _ => self.emit_if_arithmetic(kind, &op1, &op2, goto_near)?,
            }
        };

        let hole = match hole {
            Some(hole) => hole,
            None => return Ok(()),
        };

        if target < self.ip_src {
            let dst = self.resolved_dst(target)?;
            let rel = dst - hole.at_ip;

            if goto_near {
                if rel < i32::from(i8::MIN) || rel > i32::from(i8::MAX) {
                    return Err(CompilerError::new(
                        ErrorKind::Compilation,
                        "Compiler cannot generate that high relative address",
                    ));
                }
                self.buf.patch_i8(hole.offset, rel as i8);
            } else {
                self.buf.patch_i16(hole.offset, rel as i16);
            }
        } else {
            self.fixups.push(Fixup {
                kind: if goto_near {
                    FixupKind::Rel8
                } else {
                    FixupKind::Rel16
                },
                target: FixupTarget::Ip(target),
                offset: hole.offset,
                at_ip: hole.at_ip,
            });
        }

        Ok(())
    }

    /// Salto incondicional corto o cercano con hueco pendiente.
    fn emit_jmp_hole(&mut self, goto_near: bool) -> Hole {
        if goto_near {
            self.buf.emit_code(&[0xEB, 0]); // jmp rel8
        } else {
            self.buf.emit_code(&[0xE9, 0, 0]); // jmp rel16
        }
        Hole {
            offset: self.buf.offset() - if goto_near { 1 } else { 2 },
            at_ip: self.buf.ip(),
        }
    }

    /// Salto condicional corto (`opcode`) o su forma cercana con prefijo
    /// `0x0F` (i386+), con hueco pendiente.
    fn emit_jcc_hole(&mut self, opcode: u8, goto_near: bool) -> Hole {
        if goto_near {
            self.buf.emit_code(&[opcode, 0]);
        } else {
            self.buf.emit_code(&[0x0F, opcode + 0x10, 0, 0]);
        }
        Hole {
            offset: self.buf.offset() - if goto_near { 1 } else { 2 },
            at_ip: self.buf.ip(),
        }
    }

    fn emit_if_or_and(
        &mut self,
        kind: CompareKind,
        op1: &Operand,
        op2: &Operand,
        goto_near: bool,
    ) -> CompileResult<Option<Hole>> {
        match (op1.exp_type, op2.exp_type) {
            (ExpressionKind::Constant, ExpressionKind::Constant) => {
                // Evaluación en tiempo de compilación: salto siempre o nunca
                let taken = if_constexpr(kind, op1.constant_value(), op2.constant_value())?;
                if taken {
                    return Ok(Some(self.emit_jmp_hole(goto_near)));
                }
                return Ok(None);
            }

            (ExpressionKind::Variable, ExpressionKind::Constant) => {
                let op1_var = self.find_variable(&op1.value)?;
                let op1_size = self.variables[op1_var].symbol.typ.size()?;
                let value = op2.constant_value();

                let reg_dst = self.load_variable_unreferenced(op1_var, op1_size)?;

                let modrm_op = if kind == CompareKind::LogOr { 1 } else { 4 };
                match op1_size {
                    1 => {
                        // or/and rm8, imm8
                        self.buf.emit_code(&[
                            0x80,
                            modrm(3, modrm_op, reg_dst.enc()),
                            value as u8,
                        ]);
                    }
                    2 => {
                        // or/and rm16, imm16
                        let imm = (value as u16).to_le_bytes();
                        self.buf.emit_code(&[
                            0x81,
                            modrm(3, modrm_op, reg_dst.enc()),
                            imm[0],
                            imm[1],
                        ]);
                    }
                    4 => {
                        // or/and rm32, imm32
                        let imm = (value as u32).to_le_bytes();
                        self.buf.emit_code(&[
                            i386::OPERAND_SIZE,
                            0x81,
                            modrm(3, modrm_op, reg_dst.enc()),
                            imm[0],
                            imm[1],
                            imm[2],
                            imm[3],
                        ]);
                    }

                    _ => unexpected!(),
                }
            }

            (ExpressionKind::Variable, ExpressionKind::Variable) => {
                let mut op1_var = self.find_variable(&op1.value)?;
                let mut op2_var = self.find_variable(&op2.value)?;

                // Uno de los dos tiene que quedar en registro; si el
                // segundo ya lo está, se aprovecha
                if self.variables[op2_var].reg.is_some() {
                    std::mem::swap(&mut op1_var, &mut op2_var);
                }

                let op1_size = self.variables[op1_var].symbol.typ.size()?;
                let reg_dst = self.load_variable_unreferenced(op1_var, op1_size)?;

                match op1_size {
                    1 => {
                        let opcode = if kind == CompareKind::LogOr { 0x0A } else { 0x22 };
                        self.emit_op_var_rm(&[opcode], reg_dst.enc(), op2_var)?;
                    }
                    2 => {
                        let opcode = if kind == CompareKind::LogOr { 0x0B } else { 0x23 };
                        self.emit_op_var_rm(&[opcode], reg_dst.enc(), op2_var)?;
                    }
                    4 => {
                        let opcode = if kind == CompareKind::LogOr { 0x0B } else { 0x23 };
                        self.emit_op_var_rm(
                            &[i386::OPERAND_SIZE, opcode],
                            reg_dst.enc(),
                            op2_var,
                        )?;
                    }

                    _ => unexpected!(),
                }
            }

            _ => unexpected!(),
        }

        // El resultado quedó en las banderas: se salta si no es cero
        Ok(Some(self.emit_jcc_hole(0x75, goto_near))) // jnz rel
    }

    fn emit_if_arithmetic(
        &mut self,
        kind: CompareKind,
        op1: &Operand,
        op2: &Operand,
        goto_near: bool,
    ) -> CompileResult<Option<Hole>> {
        let mut kind = kind;

        match (op1.exp_type, op2.exp_type) {
            (ExpressionKind::Constant, ExpressionKind::Constant) => {
                let taken = if_constexpr(kind, op1.constant_value(), op2.constant_value())?;
                if taken {
                    return Ok(Some(self.emit_jmp_hole(goto_near)));
                }
                return Ok(None);
            }

            (ExpressionKind::Variable, ExpressionKind::Constant) => {
                let op1_var = self.find_variable(&op1.value)?;
                let op1_size = self.variables[op1_var].symbol.typ.size()?;
                let value = op2.constant_value();

                let reg_dst = self.load_variable_unreferenced(op1_var, op1_size)?;

                match op1_size {
                    1 => {
                        // cmp rm8, imm8
                        self.buf
                            .emit_code(&[0x80, modrm(3, 7, reg_dst.enc()), value as u8]);
                    }
                    2 => {
                        // cmp rm16, imm16
                        let imm = (value as u16).to_le_bytes();
                        self.buf
                            .emit_code(&[0x81, modrm(3, 7, reg_dst.enc()), imm[0], imm[1]]);
                    }
                    4 => {
                        // cmp rm32, imm32
                        let imm = (value as u32).to_le_bytes();
                        self.buf.emit_code(&[
                            i386::OPERAND_SIZE,
                            0x81,
                            modrm(3, 7, reg_dst.enc()),
                            imm[0],
                            imm[1],
                            imm[2],
                            imm[3],
                        ]);
                    }

                    _ => unexpected!(),
                }
            }

            (ExpressionKind::Variable, ExpressionKind::Variable) => {
                let mut op1_var = self.find_variable(&op1.value)?;
                let mut op2_var = self.find_variable(&op2.value)?;

                if self.variables[op2_var].reg.is_some() {
                    // El operando en registro pasa al lado izquierdo,
                    // invirtiendo el sentido de la comparación
                    std::mem::swap(&mut op1_var, &mut op2_var);
                    kind = kind.swapped();
                }

                let op1_size = self.variables[op1_var].symbol.typ.size()?;
                let reg_dst = self.load_variable_unreferenced(op1_var, op1_size)?;

                match op1_size {
                    1 => {
                        // cmp r8, rm8
                        self.emit_op_var_rm(&[0x3A], reg_dst.enc(), op2_var)?;
                    }
                    2 => {
                        // cmp r16, rm16
                        self.emit_op_var_rm(&[0x3B], reg_dst.enc(), op2_var)?;
                    }
                    4 => {
                        // cmp r32, rm32
                        self.emit_op_var_rm(
                            &[i386::OPERAND_SIZE, 0x3B],
                            reg_dst.enc(),
                            op2_var,
                        )?;
                    }

                    _ => unexpected!(),
                }
            }

            _ => unexpected!(),
        }

        let opcode = match kind {
            CompareKind::Equal => 0x74,          // jz rel
            CompareKind::NotEqual => 0x75,       // jnz rel
            CompareKind::Greater => 0x77,        // jnbe rel
            CompareKind::Less => 0x72,           // jb rel
            CompareKind::GreaterOrEqual => 0x73, // jnb rel
            CompareKind::LessOrEqual => 0x76,    // jbe rel

            _ => unexpected!(),
        };

        Ok(Some(self.emit_jcc_hole(opcode, goto_near)))
    }

    /// Comparación de cadenas: ambas constantes se resuelven en tiempo de
    /// compilación; si no, se llama a `#StringsEqual` y se examina AX.
    fn emit_if_strings(
        &mut self,
        kind: CompareKind,
        op1: &Operand,
        op2: &Operand,
        goto_near: bool,
    ) -> CompileResult<Option<Hole>> {
        if op1.typ != op2.typ {
            unexpected!();
        }

        if op1.exp_type == ExpressionKind::Constant {
            // Las dos son constantes: comparación en tiempo de compilación
            let mut taken = op1.value == op2.value;
            if kind == CompareKind::NotEqual {
                taken = !taken;
            } else if kind != CompareKind::Equal {
                unexpected!();
            }

            if taken {
                return Ok(Some(self.emit_jmp_hole(goto_near)));
            }
            return Ok(None);
        }

        if op2.exp_type == ExpressionKind::Constant {
            // push imm16 con la dirección del literal
            self.buf.emit_code(&[0x68, 0, 0]);
            let hole = self.buf.offset() - 2;
            self.fixup_string(hole, &op2.value);
        } else {
            let op2_var = self.find_variable(&op2.value)?;
            self.push_variable_to_stack(op2_var, 2)?;
        }

        let op1_var = self.find_variable(&op1.value)?;
        self.push_variable_to_stack(op1_var, 2)?;

        // La comparación cuenta como referencia a la función compartida
        for symbol in self.symbols.iter_mut() {
            if symbol.typ.base == BaseType::SharedFunction && symbol.name == "#StringsEqual" {
                symbol.ref_count += 1;
                break;
            }
        }

        self.buf.emit_code(&[0xE8, 0, 0]); // call rel16
        let hole = self.buf.offset() - 2;
        self.fixups.push(Fixup {
            kind: FixupKind::Rel16,
            target: FixupTarget::Function("#StringsEqual".to_string()),
            offset: hole,
            at_ip: self.buf.ip(),
        });

        // Resultado 0/1 en AL
        i386::or_rr(&mut self.buf, CpuRegister::AX, CpuRegister::AX, 1)?;

        let opcode = match kind {
            CompareKind::NotEqual => 0x74, // jz rel
            CompareKind::Equal => 0x75,    // jnz rel

            _ => unexpected!(),
        };

        Ok(Some(self.emit_jcc_hole(opcode, goto_near)))
    }

    // ------------------------------------------------------------------
    // Llamadas

    /// Los parámetros quedan en cola hasta la instrucción `Call`.
    fn emit_push(&mut self, arg: &CallArgument) {
        self.call_parameters.push(arg.clone());
    }

    fn emit_call(&mut self, target: &str, return_symbol: Option<&str>) -> CompileResult<()> {
        let (target_name, target_parameter, target_return) = {
            let entry = self
                .symbols
                .find_callable(target)
                .ok_or_else(CompilerError::unexpected)?;
            (entry.name.clone(), entry.parameter, entry.return_type)
        };

        // Las instrucciones "call" las genera el compilador: la aridad ya
        // fue validada
        if target_parameter != self.call_parameters.len() as i32 {
            unexpected!();
        }

        // Los parámetros se apilan de derecha a izquierda
        for param in (1..=target_parameter).rev() {
            let arg = self
                .call_parameters
                .pop()
                .ok_or_else(CompilerError::unexpected)?;

            let formal_type = self
                .symbols
                .iter()
                .find(|symbol| {
                    symbol.parameter == param && symbol.belongs_to(&target_name)
                })
                .map(|symbol| symbol.typ)
                .ok_or_else(CompilerError::unexpected)?;

            match arg.exp_type {
                ExpressionKind::Constant => match formal_type.base {
                    BaseType::Bool | BaseType::Uint8 => {
                        let imm8 = parse_constant(&arg.value) as u8;
                        self.buf.emit_code(&[0x6A, imm8]); // push imm8
                    }
                    BaseType::Uint16 => {
                        let imm = (parse_constant(&arg.value) as u16).to_le_bytes();
                        self.buf.emit_code(&[0x68, imm[0], imm[1]]); // push imm16
                    }
                    BaseType::Uint32 => {
                        let imm = (parse_constant(&arg.value) as u32).to_le_bytes();
                        // push imm32
                        self.buf.emit_code(&[
                            i386::OPERAND_SIZE,
                            0x68,
                            imm[0],
                            imm[1],
                            imm[2],
                            imm[3],
                        ]);
                    }
                    BaseType::String => {
                        self.buf.emit_code(&[0x68, 0, 0]); // push imm16
                        let hole = self.buf.offset() - 2;
                        self.fixup_string(hole, &arg.value);
                    }

                    _ => unexpected!(),
                },

                ExpressionKind::Variable => {
                    let variable = self.find_variable(&arg.value)?;
                    let param_size = formal_type.size()?;
                    self.push_variable_to_stack(variable, param_size)?;
                }

                ExpressionKind::None => unexpected!(),
            }
        }

        self.save_and_unload_all(SaveReason::Inside)?;

        // call rel16, directo si la función ya fue emitida
        self.buf.emit_code(&[0xE8, 0, 0]);
        let hole = self.buf.offset() - 2;
        let at_ip = self.buf.ip();

        let known = self
            .functions
            .iter()
            .find(|function| function.name == target_name)
            .map(|function| function.ip_dst);

        match known {
            Some(ip_dst) => {
                self.buf.patch_i16(hole, (ip_dst - at_ip) as i16);
            }
            None => {
                self.fixups.push(Fixup {
                    kind: FixupKind::Rel16,
                    target: FixupTarget::Function(target_name),
                    offset: hole,
                    at_ip,
                });
            }
        }

        if !target_return.is_void() {
            // El valor de retorno queda en AX, ligado al receptor
            let name = return_symbol.ok_or_else(CompilerError::unexpected)?;
            let variable = self.find_variable(name)?;
            self.variables[variable].reg = Some(CpuRegister::AX);
            self.variables[variable].is_dirty = true;
            self.variables[variable].last_used = self.ip_src;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Return

    pub(crate) fn emit_return(&mut self, op: Option<&Operand>) -> CompileResult<()> {
        self.was_return = true;

        let parent = match &self.parent {
            Some(parent) => parent.clone(),
            None => unexpected!(),
        };

        // Antes de abandonar la función no puede quedar estado vivo solo
        // en registros: las estáticas sucias se escriben a su región y
        // las locales con usos posteriores a su slot
        self.save_and_unload_all(SaveReason::Inside)?;

        let compatible = match op {
            None => parent.return_type.is_void(),
            Some(op) => {
                op.typ == parent.return_type
                    || largest_arithmetic(op.typ, parent.return_type).base != BaseType::Unknown
            }
        };

        if !compatible {
            let found = op
                .map(|op| op.typ.base.to_string())
                .unwrap_or_else(|| "void".to_string());
            return Err(CompilerError::new(
                ErrorKind::Statement,
                format!(
                    "All returns in function \"{}\" must return \"{}\" value, found \"{}\" instead",
                    parent.name, parent.return_type.base, found
                ),
            ));
        }

        if parent.is_entry_point {
            // El punto de entrada termina el proceso: el valor va en AL y
            // se invoca al DOS Function Dispatcher
            let op = match op {
                Some(op) => op,
                None => unexpected!(),
            };

            match op.exp_type {
                ExpressionKind::Constant => {
                    let imm8 = op.constant_value() as u8;
                    self.buf.emit_code(&[0xB0, imm8]); // mov al, imm8
                }
                ExpressionKind::Variable => {
                    let src = self.find_variable(&op.value)?;

                    match self.variables[src].reg {
                        Some(CpuRegister::AX) => {
                            // Ya está donde debe
                        }
                        Some(reg) => {
                            self.buf
                                .emit_code(&[0x8A, modrm(3, 0, reg.enc())]); // mov al, r8
                        }
                        None => {
                            if self.variables[src].symbol.parent.is_none() {
                                // mov al, [estática]
                                self.buf.emit_code(&[0x8A, modrm(0, 0, 6), 0, 0]);
                                let hole = self.buf.offset() - 2;
                                self.fixup_static(hole, src);
                            } else {
                                // mov al, [bp + disp8]
                                self.buf.emit_code(&[0x8A, modrm(1, 0, 6), 0]);
                                let hole = self.buf.offset() - 1;
                                self.fixup_local(hole, src);
                            }
                        }
                    }
                }

                ExpressionKind::None => unexpected!(),
            }

            i386::int_ah(&mut self.buf, 0x21, 0x4C); // Terminate With Return Code
        } else {
            // Convención stdcall: el valor de retorno viaja en AX y la
            // función libera sus propios parámetros
            if !parent.return_type.is_void() {
                let dst_size = parent.return_type.size()?;

                match op {
                    Some(op) => match op.exp_type {
                        ExpressionKind::Constant => {
                            let value = op.constant_value();
                            self.load_constant_sized(value, CpuRegister::AX, dst_size)?;
                        }
                        ExpressionKind::Variable => {
                            let src = self.find_variable(&op.value)?;
                            self.copy_variable_to_register(src, CpuRegister::AX, dst_size)?;
                        }

                        ExpressionKind::None => unexpected!(),
                    },

                    None => unexpected!(),
                }
            }

            if parent.parameter > 0 {
                // Espacio ocupado por los parámetros en el stack, para
                // que "retn" lo libere
                let mut stack_param_size: u16 = 0;
                for symbol in self.symbols.iter() {
                    if symbol.parameter != 0 && symbol.belongs_to(&parent.name) {
                        stack_param_size += symbol.typ.size()?.max(2) as u16;
                    }
                }

                i386::proc_leave(&mut self.buf, stack_param_size, true);
            } else {
                i386::proc_leave(&mut self.buf, 0, false);
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Cadenas y región estática

    /// Registra un literal en el pool (una sola vez por contenido).
    pub(crate) fn add_string(&mut self, value: &str) {
        if !self.strings.iter().any(|existing| existing == value) {
            self.strings.push(value.to_string());
        }
    }

    /// Hueco de 16 bits que recibirá la dirección DS-absoluta del literal.
    pub(crate) fn fixup_string(&mut self, offset: usize, value: &str) {
        self.add_string(value);
        self.fixups.push(Fixup {
            kind: FixupKind::DsAbs16,
            target: FixupTarget::Str(value.to_string()),
            offset,
            at_ip: 0,
        });
    }

    /// Hueco de 16 bits que recibirá la dirección DS-absoluta de una
    /// variable estática.
    pub(crate) fn fixup_static(&mut self, offset: usize, variable: usize) {
        let name = self.variables[variable].symbol.name.clone();
        self.fixups.push(Fixup {
            kind: FixupKind::DsAbs16,
            target: FixupTarget::Static(name),
            offset,
            at_ip: 0,
        });
    }

    /// Hueco de 8 bits con el desplazamiento de una local; si el offset
    /// ya es conocido se escribe directo.
    pub(crate) fn fixup_local(&mut self, offset: usize, variable: usize) {
        if self.variables[variable].location != 0 {
            let location = self.variables[variable].location;
            self.buf.patch_i8(offset, location as i8);
        } else {
            let name = self.variables[variable].symbol.name.clone();
            self.fixups.push(Fixup {
                kind: FixupKind::Stack8,
                target: FixupTarget::Local(name),
                offset,
                at_ip: 0,
            });
            // El epílogo reserva espacio solo para locales referenciadas
            self.variables[variable].symbol.ref_count += 1;
        }
    }

    /// Vuelca el pool de cadenas dentro de la región de código y reserva
    /// (virtualmente) la región estática, resolviendo sus parcheos.
    pub(crate) fn emit_static_data(&mut self) -> CompileResult<()> {
        // Literales de cadena, terminados en NUL
        let strings = std::mem::take(&mut self.strings);
        for value in &strings {
            self.backpatch_labels(value, self.buf.ip(), FixupTargetKind::Str)?;

            let mut bytes = value.as_bytes().to_vec();
            bytes.push(0);
            self.buf.emit_code(&bytes);
        }

        // Las estáticas viven después de la imagen; solo se calculan sus
        // direcciones
        let mut statics: Vec<(String, i32)> = Vec::new();
        for variable in &self.variables {
            if variable.symbol.parent.is_some() {
                continue;
            }

            let size = if variable.symbol.size > 0 {
                variable.symbol.size * variable.symbol.typ.dereference().size()?
            } else {
                variable.symbol.typ.size()?
            };

            statics.push((variable.symbol.name.clone(), size));
        }

        for (name, size) in statics {
            let address = self.buf.ip() + self.static_size;
            self.backpatch_labels(&name, address, FixupTargetKind::Static)?;
            self.static_size += size;
        }

        Ok(())
    }
}

/// Evalúa una comparación entre constantes en tiempo de compilación.
fn if_constexpr(kind: CompareKind, op1: i32, op2: i32) -> CompileResult<bool> {
    Ok(match kind {
        CompareKind::LogOr => op1 != 0 || op2 != 0,
        CompareKind::LogAnd => op1 != 0 && op2 != 0,

        CompareKind::Equal => op1 == op2,
        CompareKind::NotEqual => op1 != op2,
        CompareKind::Greater => op1 > op2,
        CompareKind::Less => op1 < op2,
        CompareKind::GreaterOrEqual => op1 >= op2,
        CompareKind::LessOrEqual => op1 <= op2,
    })
}
