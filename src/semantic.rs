//! Núcleo semántico del front end.
//!
//! El parser es un colaborador externo: a medida que reduce producciones
//! invoca el API de construcción de este módulo, que mantiene la tabla de
//! símbolos, la cola de declaraciones de la función en curso, las pilas
//! de alcance y la secuencia de instrucciones abstractas. Al terminar el
//! análisis, [`Compiler::finish_parse`] marca la alcanzabilidad de las
//! funciones desde el punto de entrada; las que quedan sin referencias no
//! se emiten.
//!
//! # Cola de declaraciones
//! Parámetros, variables locales y etiquetas se acumulan en una cola
//! transitoria mientras el cuerpo de la función se reduce. Cuando el
//! parser cierra la definición con [`Compiler::define_function`], la cola
//! se vacía dentro de la tabla de símbolos con la función como `parent`.
//!
//! # Prototipos
//! Un prototipo reserva el nombre y la firma. La definición posterior lo
//! promueve en el mismo lugar de la tabla, validando aridad, tipos de
//! parámetros y tipo de retorno.

use crate::error::{CompileResult, CompilerError, ErrorKind};
use crate::ir::{BackpatchList, CallArgument, Instruction, Stream};
use crate::log::Log;
use crate::source::Cursor;
use crate::symbols::{BaseType, ExpressionKind, SymbolEntry, SymbolTable, SymbolType};

pub use crate::symbols::{can_explicit_cast, can_implicit_cast, largest_arithmetic};

/// Nombre de la función que actúa como punto de entrada del programa.
pub const ENTRY_POINT_NAME: &str = "Main";

/// Alcances anidados que el parser abre y cierra.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    /// Contexto de expresión dentro de una asignación; crea booleanos
    /// implícitos para los cortocircuitos.
    Assign,

    /// Saltos `break` pendientes del lazo en curso.
    Break,

    /// Saltos `continue` pendientes del lazo en curso.
    Continue,
}

/// El núcleo semántico: recibe las acciones del parser y produce la tabla
/// de símbolos junto con la secuencia de instrucciones abstractas.
pub struct Compiler {
    pub(crate) symbols: SymbolTable,
    pub(crate) stream: Stream,
    pub(crate) log: Box<dyn Log>,

    declaration_queue: Vec<SymbolEntry>,

    current_ip: i32,
    function_ip: i32,

    parameter_count: u16,

    var_count_bool: u32,
    var_count_uint8: u32,
    var_count_uint16: u32,
    var_count_uint32: u32,
    var_count_string: u32,

    assign_scope: i32,
    break_scopes: Vec<BackpatchList>,
    continue_scopes: Vec<BackpatchList>,

    pub(crate) stack_size: u32,

    cursor: Cursor,
}

impl Compiler {
    /// Crea un compilador con las funciones compartidas ya declaradas,
    /// de modo que el programa pueda llamarlas por nombre.
    pub fn new(log: Box<dyn Log>) -> Self {
        let mut compiler = Compiler {
            symbols: SymbolTable::new(),
            stream: Stream::new(),
            log,
            declaration_queue: Vec::new(),
            current_ip: -1,
            function_ip: 0,
            parameter_count: 0,
            var_count_bool: 0,
            var_count_uint8: 0,
            var_count_uint16: 0,
            var_count_uint32: 0,
            var_count_string: 0,
            assign_scope: 0,
            break_scopes: Vec::new(),
            continue_scopes: Vec::new(),
            stack_size: 0,
            cursor: Cursor::default(),
        };

        compiler.declare_shared_functions();
        compiler
    }

    /// Posición actual del lexer, usada para ubicar diagnósticos.
    pub fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = cursor;
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Tamaño de stack solicitado por directivas, cero si no hubo.
    pub fn requested_stack_size(&self) -> u32 {
        self.stack_size
    }

    fn declaration_error<S: Into<String>>(&self, message: S) -> CompilerError {
        CompilerError::at(ErrorKind::Declaration, message, self.cursor)
    }

    fn statement_error<S: Into<String>>(&self, message: S) -> CompilerError {
        CompilerError::at(ErrorKind::Statement, message, self.cursor)
    }

    // ------------------------------------------------------------------
    // Cola de declaraciones

    /// Declara una variable local de la función en curso.
    pub fn declare_local<S: Into<String>>(
        &mut self,
        typ: SymbolType,
        size: i32,
        name: S,
        exp_type: ExpressionKind,
    ) -> CompileResult<()> {
        let name = name.into();

        if self.declaration_queue.iter().any(|entry| entry.name == name) {
            return Err(self.declaration_error(format!(
                "Variable \"{}\" is already declared in this scope",
                name
            )));
        }

        let mut entry = SymbolEntry::new(name, typ);
        entry.size = size;
        entry.exp_type = exp_type;
        self.declaration_queue.push(entry);

        Ok(())
    }

    /// Declara un parámetro formal de la función en curso. La posición es
    /// 1-based en orden de aparición.
    pub fn declare_parameter<S: Into<String>>(
        &mut self,
        typ: SymbolType,
        name: S,
    ) -> CompileResult<()> {
        let name = name.into();

        if self.declaration_queue.iter().any(|entry| entry.name == name) {
            return Err(self.declaration_error(format!(
                "Parameter \"{}\" is already declared in this scope",
                name
            )));
        }

        self.parameter_count += 1;

        let mut entry = SymbolEntry::new(name, typ);
        entry.parameter = i32::from(self.parameter_count);
        self.declaration_queue.push(entry);

        Ok(())
    }

    /// Declara una variable estática, visible desde cualquier función.
    pub fn declare_static<S: Into<String>>(
        &mut self,
        typ: SymbolType,
        size: i32,
        name: S,
    ) -> CompileResult<()> {
        let name = name.into();

        let mut entry = SymbolEntry::new(name, typ);
        entry.size = size;
        entry.exp_type = ExpressionKind::Variable;
        self.add_symbol(entry)?;

        Ok(())
    }

    /// Registra una etiqueta local con su IP destino.
    pub fn add_label<S: Into<String>>(&mut self, name: S, ip: i32) -> CompileResult<()> {
        let name = name.into();

        if self.declaration_queue.iter().any(|entry| entry.name == name) {
            return Err(self.declaration_error(format!(
                "Label \"{}\" is already declared in this scope",
                name
            )));
        }

        let mut entry = SymbolEntry::new(name, SymbolType::new(BaseType::Label));
        entry.ip = ip;
        self.declaration_queue.push(entry);

        Ok(())
    }

    /// Variable sintética del tipo indicado, con nombre estable por
    /// familia (`#b_N`, `#ui8_N`, `#ui16_N`, `#ui32_N`, `#s_N`).
    pub fn get_unused_variable(&mut self, typ: SymbolType) -> CompileResult<SymbolEntry> {
        let name = match typ.base {
            BaseType::Bool => {
                self.var_count_bool += 1;
                format!("#b_{}", self.var_count_bool)
            }
            BaseType::Uint8 => {
                self.var_count_uint8 += 1;
                format!("#ui8_{}", self.var_count_uint8)
            }
            BaseType::Uint16 => {
                self.var_count_uint16 += 1;
                format!("#ui16_{}", self.var_count_uint16)
            }
            BaseType::Uint32 => {
                self.var_count_uint32 += 1;
                format!("#ui32_{}", self.var_count_uint32)
            }
            BaseType::String => {
                self.var_count_string += 1;
                format!("#s_{}", self.var_count_string)
            }

            _ => unexpected!(),
        };

        self.declare_local(typ, 0, name.clone(), ExpressionKind::Variable)?;

        let entry = self
            .declaration_queue
            .last_mut()
            .ok_or_else(CompilerError::unexpected)?;
        entry.is_temp = true;

        Ok(entry.clone())
    }

    /// Busca un símbolo visible para la función en curso: primero la cola
    /// de declaraciones, luego las estáticas.
    pub fn get_parameter(&self, name: &str) -> Option<&SymbolEntry> {
        self.declaration_queue
            .iter()
            .find(|entry| entry.name == name)
            .or_else(|| {
                self.symbols.iter().find(|entry| {
                    entry.parent.is_none() && !entry.typ.base.is_callable() && entry.name == name
                })
            })
    }

    /// Busca una función invocable por nombre.
    pub fn get_function(&self, name: &str) -> Option<&SymbolEntry> {
        self.symbols.find_callable(name)
    }

    pub fn find_symbol_by_name(&self, name: &str) -> Option<&SymbolEntry> {
        self.symbols.find_by_name(name)
    }

    // ------------------------------------------------------------------
    // Funciones

    /// Cierra la definición de una función: reconcilia con su prototipo
    /// si existe, vacía la cola de declaraciones y registra el IP donde
    /// comenzó su cuerpo.
    pub fn define_function<S: Into<String>>(
        &mut self,
        name: S,
        return_type: SymbolType,
    ) -> CompileResult<()> {
        let name = name.into();

        // Ya definida con cualquier rol que no sea prototipo
        let already_defined = self.symbols.iter().any(|entry| {
            matches!(
                entry.typ.base,
                BaseType::Function | BaseType::EntryPoint | BaseType::SharedFunction
            ) && entry.name == name
        });
        if already_defined {
            return Err(self.declaration_error(format!(
                "Function \"{}\" is already defined",
                name
            )));
        }

        // El cuerpo ya fue reducido: su primera instrucción es el slot
        // siguiente al terminador de la función anterior
        let ip = self.function_ip;
        self.function_ip = self.next_ip();

        if name == ENTRY_POINT_NAME {
            if self.parameter_count != 0 {
                return Err(
                    self.declaration_error("Entry point must have zero parameters")
                );
            }
            if return_type != SymbolType::new(BaseType::Uint8) {
                return Err(
                    self.declaration_error("Entry point must return \"uint8\" value")
                );
            }

            let locals = std::mem::take(&mut self.declaration_queue);
            for mut local in locals {
                local.parameter = 0;
                local.parent = Some(name.clone());
                self.add_symbol(local)?;
            }

            let mut entry = SymbolEntry::new(name, SymbolType::new(BaseType::EntryPoint));
            entry.return_type = return_type;
            entry.ip = ip;
            self.add_symbol(entry)?;

            self.release_declaration_queue();
            return Ok(());
        }

        let prototype = self.symbols.iter().position(|entry| {
            entry.typ.base == BaseType::FunctionPrototype && entry.name == name
        });

        if let Some(prototype) = prototype {
            let declared = self.symbols.get(prototype).parameter;
            if (self.declaration_queue.is_empty() && self.parameter_count != 0)
                || declared != i32::from(self.parameter_count)
            {
                return Err(self.declaration_error(format!(
                    "Parameter count does not match for function \"{}\"",
                    name
                )));
            }

            if self.symbols.get(prototype).return_type != return_type {
                return Err(self.declaration_error(format!(
                    "Return type does not match for function \"{}\"",
                    name
                )));
            }

            // El prototipo pasa a ser la función completa, en su lugar
            {
                let entry = self.symbols.get_mut(prototype);
                entry.typ = SymbolType::new(BaseType::Function);
                entry.ip = ip;
            }

            // Los parámetros del prototipo deben coincidir con los recién
            // declarados, posición por posición
            let prototype_params: Vec<(String, SymbolType)> = self
                .symbols
                .parameters_of(&name)
                .map(|entry| (entry.name.clone(), entry.typ))
                .collect();

            for (position, (param_name, param_type)) in prototype_params.iter().enumerate() {
                let declared = self
                    .declaration_queue
                    .get(position)
                    .ok_or_else(CompilerError::unexpected)?;

                if declared.typ != *param_type {
                    return Err(self.declaration_error(format!(
                        "Parameter \"{}\" type does not match for function \"{}\"",
                        param_name, name
                    )));
                }
            }

            // Las locales restantes de la cola pertenecen a la función
            let locals: Vec<SymbolEntry> = self
                .declaration_queue
                .drain(usize::from(self.parameter_count)..)
                .collect();
            for mut local in locals {
                local.parameter = 0;
                local.parent = Some(name.clone());
                self.add_symbol(local)?;
            }
        } else {
            if self.declaration_queue.is_empty() && self.parameter_count != 0 {
                return Err(self.declaration_error(format!(
                    "Parameter count does not match for function \"{}\"",
                    name
                )));
            }

            // Sin prototipo: la cola trae primero los parámetros en orden
            let queue = std::mem::take(&mut self.declaration_queue);
            for (position, mut entry) in queue.into_iter().enumerate() {
                entry.parameter = if position < usize::from(self.parameter_count) {
                    (position + 1) as i32
                } else {
                    0
                };
                entry.parent = Some(name.clone());
                self.add_symbol(entry)?;
            }

            let mut entry = SymbolEntry::new(name, SymbolType::new(BaseType::Function));
            entry.return_type = return_type;
            entry.ip = ip;
            entry.parameter = i32::from(self.parameter_count);
            self.add_symbol(entry)?;
        }

        self.release_declaration_queue();
        Ok(())
    }

    /// Declara un prototipo de función. La cola de declaraciones debe
    /// contener exactamente sus parámetros.
    pub fn declare_function_prototype<S: Into<String>>(
        &mut self,
        name: S,
        return_type: SymbolType,
    ) -> CompileResult<()> {
        let name = name.into();

        if name == ENTRY_POINT_NAME {
            return Err(self.declaration_error("Prototype for entry point is not allowed"));
        }
        if self.declaration_queue.is_empty() && self.parameter_count != 0 {
            return Err(self.declaration_error("Parameter count does not match"));
        }

        let duplicated = self
            .symbols
            .iter()
            .any(|entry| entry.typ.base.is_callable() && entry.name == name);
        if duplicated {
            return Err(self.declaration_error(format!(
                "Duplicate function definition for \"{}\"",
                name
            )));
        }

        let mut entry = SymbolEntry::new(name.clone(), SymbolType::new(BaseType::FunctionPrototype));
        entry.return_type = return_type;
        entry.parameter = i32::from(self.parameter_count);
        self.add_symbol(entry)?;

        let queue = std::mem::take(&mut self.declaration_queue);
        for (position, mut param) in queue.into_iter().enumerate() {
            param.parameter = (position + 1) as i32;
            param.parent = Some(name.clone());
            self.add_symbol(param)?;
        }

        self.release_declaration_queue();
        Ok(())
    }

    /// Baja los argumentos reales de una llamada a instrucciones `Push`,
    /// validando aridad y conversiones implícitas contra los formales.
    pub fn lower_call(&mut self, name: &str, arguments: &[CallArgument]) -> CompileResult<()> {
        let function = match self.symbols.find_callable(name) {
            Some(entry) => entry,
            None => {
                return Err(self.statement_error(format!(
                    "Cannot call function \"{}\", because it was not declared",
                    name
                )));
            }
        };

        if function.parameter != arguments.len() as i32 {
            return Err(self.statement_error(format!(
                "Cannot call function \"{}\" because of parameter count mismatch",
                name
            )));
        }

        let formals: Vec<(String, SymbolType)> = self
            .symbols
            .parameters_of(name)
            .map(|entry| (entry.name.clone(), entry.typ))
            .collect();

        if formals.len() != arguments.len() {
            return Err(self.statement_error(format!(
                "Cannot call function \"{}\" because of parameter count mismatch",
                name
            )));
        }

        for ((formal_name, formal_type), argument) in formals.iter().zip(arguments) {
            if !can_implicit_cast(*formal_type, argument.typ, argument.exp_type) {
                return Err(self.statement_error(format!(
                    "Cannot call function \"{}\" because of parameter \"{}\" type mismatch",
                    name, formal_name
                )));
            }

            self.add_to_stream(Instruction::Push {
                arg: argument.clone(),
            });
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Secuencia de instrucciones

    /// Siguiente IP abstracto a asignar.
    pub fn next_ip(&self) -> i32 {
        self.current_ip + 1
    }

    /// Anexa una instrucción y devuelve su IP.
    pub fn add_to_stream(&mut self, instruction: Instruction) -> i32 {
        self.current_ip += 1;
        self.stream.push(instruction)
    }

    /// Anexa una instrucción y devuelve la obligación de backpatch que la
    /// completará cuando el destino se conozca.
    pub fn add_to_stream_with_backpatch(&mut self, instruction: Instruction) -> BackpatchList {
        let ip = self.add_to_stream(instruction);
        BackpatchList::single(ip)
    }

    /// Escribe `new_ip` como destino de todas las instrucciones de la
    /// lista. Solo `Goto` e `If` admiten backpatch; la lista se consume.
    pub fn backpatch(&mut self, list: BackpatchList, new_ip: i32) -> CompileResult<()> {
        for ip in list.into_entries() {
            match self.stream.get_mut(ip) {
                Some(Instruction::Goto { target }) => *target = new_ip,
                Some(Instruction::If { target, .. }) => *target = new_ip,
                _ => {
                    self.log.error("Trying to backpatch unsupported instruction");
                    unexpected!();
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Alcances

    /// Abre un alcance del tipo indicado.
    pub fn increase_scope(&mut self, kind: ScopeKind) {
        match kind {
            ScopeKind::Assign => self.assign_scope += 1,
            ScopeKind::Break => self.break_scopes.push(BackpatchList::new()),
            ScopeKind::Continue => self.continue_scopes.push(BackpatchList::new()),
        }
    }

    /// Cierra de golpe el alcance de asignación.
    pub fn reset_scope(&mut self, kind: ScopeKind) -> CompileResult<()> {
        match kind {
            ScopeKind::Assign => {
                self.assign_scope = 0;
                Ok(())
            }

            _ => unexpected!(),
        }
    }

    /// Indica si hay un alcance activo del tipo dado.
    pub fn is_scope_active(&self, kind: ScopeKind) -> bool {
        match kind {
            ScopeKind::Assign => self.assign_scope > 0,
            ScopeKind::Break => !self.break_scopes.is_empty(),
            ScopeKind::Continue => !self.continue_scopes.is_empty(),
        }
    }

    /// Funde una obligación de backpatch en el alcance superior. Devuelve
    /// `false` si no hay alcance abierto (p. ej. `break` fuera de lazo).
    pub fn add_to_scope_list(&mut self, kind: ScopeKind, list: BackpatchList) -> bool {
        let scopes = match kind {
            ScopeKind::Break => &mut self.break_scopes,
            ScopeKind::Continue => &mut self.continue_scopes,
            ScopeKind::Assign => return false,
        };

        match scopes.last_mut() {
            Some(top) => {
                top.merge(list);
                true
            }
            None => false,
        }
    }

    /// Cierra el alcance superior del tipo dado, resolviendo todas sus
    /// obligaciones hacia `new_ip`.
    pub fn backpatch_scope(&mut self, kind: ScopeKind, new_ip: i32) -> CompileResult<()> {
        let scopes = match kind {
            ScopeKind::Break => &mut self.break_scopes,
            ScopeKind::Continue => &mut self.continue_scopes,
            ScopeKind::Assign => unexpected!(),
        };

        let list = match scopes.pop() {
            Some(list) => list,
            None => unexpected!(),
        };

        self.backpatch(list, new_ip)
    }

    // ------------------------------------------------------------------
    // Directivas

    /// Procesa una línea de directiva (`#nombre parámetro`). El núcleo
    /// entiende `#stack N` y `#stack ^N`; el resto se delega al callback
    /// y, si este no la reconoce, queda registrada como advertencia.
    pub fn parse_compiler_directive<F>(&mut self, directive: &str, callback: F)
    where
        F: FnOnce(&str, Option<&str>) -> bool,
    {
        let directive = directive.trim_end_matches(|c| c == '\r' || c == '\n');

        let (name, param) = match directive.find(' ') {
            Some(split) => {
                let (name, rest) = directive.split_at(split);
                let param = rest.trim_start_matches(' ');
                (name, if param.is_empty() { None } else { Some(param) })
            }
            None => (directive, None),
        };

        if name == "#stack" {
            if let Some(param) = param {
                if let Some(raised) = param.strip_prefix('^') {
                    let new_stack_size = raised.parse().unwrap_or(0);
                    if self.stack_size < new_stack_size {
                        self.stack_size = new_stack_size;
                    }
                } else {
                    self.stack_size = param.parse().unwrap_or(0);
                }
                return;
            }
        }

        if callback(name, param) {
            return;
        }

        self.log.warning(&format!(
            "Compiler directive \"{}\" cannot be resolved",
            name
        ));
    }

    // ------------------------------------------------------------------
    // Post-análisis

    /// Acciones al terminar el análisis sintáctico: corrige el IP de la
    /// primera función y marca la alcanzabilidad desde el punto de
    /// entrada incrementando `ref_count` de cada función visitada. Las
    /// funciones compartidas se cuentan pero no se recorren: no tienen
    /// cuerpo intermedio.
    pub fn finish_parse(&mut self) -> CompileResult<()> {
        if self.symbols.is_empty() {
            return Ok(());
        }

        self.log.info("Post-processing the symbol table...");

        // La primera instrucción del programa es el salto inicial sobre
        // las declaraciones; la primera función comienza después de él
        for entry in self.symbols.iter_mut() {
            if entry.parent.is_none()
                && matches!(entry.typ.base, BaseType::Function | BaseType::EntryPoint)
            {
                if entry.ip == 0 {
                    entry.ip = 1;
                    break;
                }
            }
        }

        let entry_point = self
            .symbols
            .iter()
            .position(|entry| {
                entry.parent.is_none() && entry.typ.base == BaseType::EntryPoint
            })
            .ok_or_else(|| {
                CompilerError::new(ErrorKind::Declaration, "Entry point was not found")
            })?;

        let symbols = &mut self.symbols;
        let stream = &self.stream;

        let mut dependency_stack = vec![entry_point];

        while let Some(index) = dependency_stack.pop() {
            if symbols.get(index).ref_count > 0 {
                // Función ya procesada
                continue;
            }
            symbols.get_mut(index).ref_count += 1;

            let ip_start = symbols.get(index).ip;
            let mut ip_current = ip_start;

            while let Some(instruction) = stream.find_by_ip(ip_current) {
                if ip_current != ip_start {
                    let function_boundary = symbols.iter().any(|symbol| {
                        symbol.ip == ip_current
                            && matches!(
                                symbol.typ.base,
                                BaseType::Function | BaseType::EntryPoint
                            )
                    });
                    if function_boundary {
                        break;
                    }
                }

                if let Instruction::Call { target, .. } = instruction {
                    let target = symbols
                        .find_callable_index(target)
                        .ok_or_else(CompilerError::unexpected)?;

                    if symbols.get(target).typ.base == BaseType::SharedFunction {
                        symbols.get_mut(target).ref_count += 1;
                    } else {
                        dependency_stack.push(target);
                    }
                }

                ip_current += 1;
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------

    fn add_symbol(&mut self, entry: SymbolEntry) -> CompileResult<()> {
        if entry.name.is_empty() {
            return Err(self.declaration_error("Symbol name must not be empty"));
        }

        self.symbols.push(entry);
        Ok(())
    }

    fn release_declaration_queue(&mut self) {
        self.declaration_queue.clear();
        self.parameter_count = 0;
    }

    /// Declara las funciones compartidas que el back end sabe emitir, de
    /// forma que el código fuente pueda llamarlas directamente.
    fn declare_shared_functions(&mut self) {
        const VOID: SymbolType = SymbolType::new(BaseType::Void);
        const BOOL: SymbolType = SymbolType::new(BaseType::Bool);
        const U32: SymbolType = SymbolType::new(BaseType::Uint32);
        const STR: SymbolType = SymbolType::new(BaseType::String);
        const VOID_PTR: SymbolType = SymbolType::pointer_to(BaseType::Void, 1);

        let mut declare = |name: &str, return_type: SymbolType, params: &[(&str, SymbolType)]| {
            let mut entry = SymbolEntry::new(name, SymbolType::new(BaseType::SharedFunction));
            entry.return_type = return_type;
            entry.parameter = params.len() as i32;
            self.symbols.push(entry);

            for (position, (param_name, param_type)) in params.iter().enumerate() {
                let mut param = SymbolEntry::new(*param_name, *param_type);
                param.parameter = (position + 1) as i32;
                param.parent = Some(name.to_string());
                self.symbols.push(param);
            }
        };

        declare("PrintUint32", VOID, &[("value", U32)]);
        declare("PrintString", VOID, &[("value", STR)]);
        declare("PrintNewLine", VOID, &[]);
        declare("ReadUint32", U32, &[]);
        declare("GetCommandLine", STR, &[]);
        declare("#StringsEqual", BOOL, &[("a", STR), ("b", STR)]);
        declare("#Alloc", VOID_PTR, &[("bytes", U32)]);
        declare("release", VOID, &[("ptr", VOID_PTR)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Operand;
    use crate::log::NullLog;

    const U8: SymbolType = SymbolType::new(BaseType::Uint8);
    const U16: SymbolType = SymbolType::new(BaseType::Uint16);
    const U32: SymbolType = SymbolType::new(BaseType::Uint32);

    fn compiler() -> Compiler {
        Compiler::new(Box::new(NullLog))
    }

    fn define_main(c: &mut Compiler) {
        c.add_to_stream(Instruction::Goto { target: 1 });
        c.add_to_stream(Instruction::Return {
            op: Some(Operand::constant("0", U8)),
        });
        c.define_function(ENTRY_POINT_NAME, U8).unwrap();
    }

    #[test]
    fn shared_functions_are_predeclared() {
        let c = compiler();

        for name in [
            "PrintUint32",
            "PrintString",
            "PrintNewLine",
            "ReadUint32",
            "GetCommandLine",
            "#StringsEqual",
            "#Alloc",
            "release",
        ]
        .iter()
        {
            let entry = c.get_function(name).unwrap();
            assert_eq!(entry.typ.base, BaseType::SharedFunction);
        }

        assert_eq!(c.get_function("#StringsEqual").unwrap().parameter, 2);
    }

    #[test]
    fn duplicate_local_is_a_declaration_error() {
        let mut c = compiler();
        c.declare_local(U8, 0, "x", ExpressionKind::Variable).unwrap();

        let error = c
            .declare_local(U16, 0, "x", ExpressionKind::Variable)
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Declaration);
        assert_eq!(
            error.message,
            "Variable \"x\" is already declared in this scope"
        );
    }

    #[test]
    fn entry_point_shape_is_enforced() {
        let mut c = compiler();
        c.add_to_stream(Instruction::Goto { target: 1 });
        c.declare_parameter(U8, "a").unwrap();

        let error = c.define_function(ENTRY_POINT_NAME, U8).unwrap_err();
        assert_eq!(error.message, "Entry point must have zero parameters");

        let mut c = compiler();
        c.add_to_stream(Instruction::Goto { target: 1 });
        let error = c.define_function(ENTRY_POINT_NAME, U32).unwrap_err();
        assert_eq!(error.message, "Entry point must return \"uint8\" value");
    }

    #[test]
    fn prototype_is_promoted_in_place() {
        let mut c = compiler();

        c.declare_parameter(U16, "a").unwrap();
        c.declare_function_prototype("f", SymbolType::new(BaseType::Void))
            .unwrap();

        let before = c
            .symbols()
            .iter()
            .position(|entry| entry.name == "f")
            .unwrap();

        c.add_to_stream(Instruction::Goto { target: 1 });
        c.declare_parameter(U16, "a").unwrap();
        c.add_to_stream(Instruction::Return { op: None });
        c.define_function("f", SymbolType::new(BaseType::Void))
            .unwrap();

        let after = c
            .symbols()
            .iter()
            .position(|entry| entry.name == "f")
            .unwrap();

        assert_eq!(before, after);
        assert_eq!(
            c.symbols().get(after).typ.base,
            BaseType::Function
        );
    }

    #[test]
    fn prototype_parameter_type_mismatch() {
        let mut c = compiler();

        c.declare_parameter(U16, "a").unwrap();
        c.declare_function_prototype("f", SymbolType::new(BaseType::Void))
            .unwrap();

        c.add_to_stream(Instruction::Goto { target: 1 });
        c.declare_parameter(U32, "a").unwrap();
        c.add_to_stream(Instruction::Return { op: None });

        let error = c
            .define_function("f", SymbolType::new(BaseType::Void))
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Declaration);
        assert_eq!(
            error.message,
            "Parameter \"a\" type does not match for function \"f\""
        );
    }

    #[test]
    fn prototype_return_type_mismatch() {
        let mut c = compiler();

        c.declare_function_prototype("f", U16).unwrap();

        c.add_to_stream(Instruction::Return { op: None });
        let error = c.define_function("f", U32).unwrap_err();
        assert_eq!(
            error.message,
            "Return type does not match for function \"f\""
        );
    }

    #[test]
    fn prototype_for_entry_point_is_rejected() {
        let mut c = compiler();
        let error = c
            .declare_function_prototype(ENTRY_POINT_NAME, U8)
            .unwrap_err();
        assert_eq!(error.message, "Prototype for entry point is not allowed");
    }

    #[test]
    fn redefinition_is_rejected() {
        let mut c = compiler();

        c.add_to_stream(Instruction::Return { op: None });
        c.define_function("f", SymbolType::new(BaseType::Void))
            .unwrap();

        c.add_to_stream(Instruction::Return { op: None });
        let error = c
            .define_function("f", SymbolType::new(BaseType::Void))
            .unwrap_err();
        assert_eq!(error.message, "Function \"f\" is already defined");
    }

    #[test]
    fn call_arity_and_types_are_checked() {
        let mut c = compiler();

        let error = c.lower_call("missing", &[]).unwrap_err();
        assert_eq!(error.kind, ErrorKind::Statement);
        assert_eq!(
            error.message,
            "Cannot call function \"missing\", because it was not declared"
        );

        let error = c.lower_call("PrintUint32", &[]).unwrap_err();
        assert_eq!(
            error.message,
            "Cannot call function \"PrintUint32\" because of parameter count mismatch"
        );

        let argument = CallArgument {
            value: "s".to_string(),
            typ: SymbolType::new(BaseType::String),
            exp_type: ExpressionKind::Variable,
        };
        let error = c.lower_call("PrintUint32", &[argument]).unwrap_err();
        assert_eq!(
            error.message,
            "Cannot call function \"PrintUint32\" because of parameter \"value\" type mismatch"
        );
    }

    #[test]
    fn lowered_call_pushes_in_source_order() {
        let mut c = compiler();

        let a = CallArgument {
            value: "left".to_string(),
            typ: SymbolType::new(BaseType::String),
            exp_type: ExpressionKind::Variable,
        };
        let b = CallArgument {
            value: "right".to_string(),
            typ: SymbolType::new(BaseType::String),
            exp_type: ExpressionKind::Constant,
        };
        c.lower_call("#StringsEqual", &[a, b]).unwrap();

        let pushes: Vec<&Instruction> = c.stream().iter().collect();
        assert_eq!(pushes.len(), 2);
        assert!(
            matches!(pushes[0], Instruction::Push { arg } if arg.value == "left")
        );
        assert!(
            matches!(pushes[1], Instruction::Push { arg } if arg.value == "right")
        );
    }

    #[test]
    fn temporary_names_are_stable_per_kind() {
        let mut c = compiler();

        assert_eq!(c.get_unused_variable(U8).unwrap().name, "#ui8_1");
        assert_eq!(c.get_unused_variable(U8).unwrap().name, "#ui8_2");
        assert_eq!(c.get_unused_variable(U32).unwrap().name, "#ui32_1");
        assert_eq!(
            c.get_unused_variable(SymbolType::new(BaseType::Bool))
                .unwrap()
                .name,
            "#b_1"
        );
        assert_eq!(
            c.get_unused_variable(SymbolType::new(BaseType::String))
                .unwrap()
                .name,
            "#s_1"
        );

        assert!(c.get_unused_variable(U8).unwrap().is_temp);
    }

    #[test]
    fn backpatch_fills_goto_and_if_only() {
        let mut c = compiler();

        let goto = c.add_to_stream_with_backpatch(Instruction::Goto {
            target: crate::ir::UNRESOLVED_TARGET,
        });
        c.add_to_stream(Instruction::Nop);
        c.backpatch(goto, 5).unwrap();

        assert!(matches!(
            c.stream().find_by_ip(0),
            Some(Instruction::Goto { target: 5 })
        ));

        let nop = c.add_to_stream_with_backpatch(Instruction::Nop);
        assert!(c.backpatch(nop, 1).is_err());
    }

    #[test]
    fn break_scope_collects_and_resolves() {
        let mut c = compiler();

        assert!(!c.is_scope_active(ScopeKind::Break));
        c.increase_scope(ScopeKind::Break);
        assert!(c.is_scope_active(ScopeKind::Break));

        let jump = c.add_to_stream_with_backpatch(Instruction::Goto {
            target: crate::ir::UNRESOLVED_TARGET,
        });
        assert!(c.add_to_scope_list(ScopeKind::Break, jump));

        c.backpatch_scope(ScopeKind::Break, 9).unwrap();
        assert!(matches!(
            c.stream().find_by_ip(0),
            Some(Instruction::Goto { target: 9 })
        ));
        assert!(!c.is_scope_active(ScopeKind::Break));

        // Sin alcance abierto, la obligación se rechaza
        let jump = c.add_to_stream_with_backpatch(Instruction::Goto {
            target: crate::ir::UNRESOLVED_TARGET,
        });
        assert!(!c.add_to_scope_list(ScopeKind::Break, jump));
    }

    #[test]
    fn assign_scope_is_a_counter() {
        let mut c = compiler();

        assert!(!c.is_scope_active(ScopeKind::Assign));
        c.increase_scope(ScopeKind::Assign);
        c.increase_scope(ScopeKind::Assign);
        assert!(c.is_scope_active(ScopeKind::Assign));

        c.reset_scope(ScopeKind::Assign).unwrap();
        assert!(!c.is_scope_active(ScopeKind::Assign));

        // Solo el alcance de asignación se reinicia de golpe
        assert!(c.reset_scope(ScopeKind::Break).is_err());
    }

    #[test]
    fn symbol_lookup_prefers_the_declaration_queue() {
        let mut c = compiler();

        c.declare_static(U32, 0, "x").unwrap();
        c.declare_local(U16, 0, "x", ExpressionKind::Variable)
            .unwrap();

        // La local en cola esconde a la estática homónima
        assert_eq!(c.get_parameter("x").unwrap().typ, U16);

        c.add_to_stream(Instruction::Goto { target: 1 });
        c.add_to_stream(Instruction::Return {
            op: Some(Operand::constant("0", U8)),
        });
        c.define_function(ENTRY_POINT_NAME, U8).unwrap();

        // Con la cola vacía queda visible la estática
        assert_eq!(c.get_parameter("x").unwrap().typ, U32);
        assert!(c.get_parameter("missing").is_none());
    }

    #[test]
    fn stack_directive_sets_and_raises() {
        let mut c = compiler();

        c.parse_compiler_directive("#stack 1024", |_, _| false);
        assert_eq!(c.requested_stack_size(), 1024);

        c.parse_compiler_directive("#stack ^512", |_, _| false);
        assert_eq!(c.requested_stack_size(), 1024);

        c.parse_compiler_directive("#stack ^4096", |_, _| false);
        assert_eq!(c.requested_stack_size(), 4096);
    }

    #[test]
    fn unknown_directives_reach_the_callback() {
        let mut c = compiler();

        let mut seen = None;
        c.parse_compiler_directive("#custom  value here", |name, param| {
            seen = Some((name.to_string(), param.map(str::to_string)));
            true
        });

        assert_eq!(
            seen,
            Some(("#custom".to_string(), Some("value here".to_string())))
        );
    }

    #[test]
    fn reachability_marks_called_functions_only() {
        let mut c = compiler();

        // ip 0: goto inicial; ip 1..2: dead(); ip 3..4: Main
        c.add_to_stream(Instruction::Goto { target: 3 });

        c.add_to_stream(Instruction::Nop);
        c.add_to_stream(Instruction::Return { op: None });
        c.define_function("dead", SymbolType::new(BaseType::Void))
            .unwrap();

        c.add_to_stream(Instruction::Call {
            target: "PrintNewLine".to_string(),
            return_symbol: None,
        });
        c.add_to_stream(Instruction::Return {
            op: Some(Operand::constant("0", U8)),
        });
        c.define_function(ENTRY_POINT_NAME, U8).unwrap();

        c.finish_parse().unwrap();

        assert_eq!(c.find_symbol_by_name("dead").unwrap().ref_count, 0);
        assert_eq!(
            c.find_symbol_by_name(ENTRY_POINT_NAME).unwrap().ref_count,
            1
        );
        assert_eq!(
            c.find_symbol_by_name("PrintNewLine").unwrap().ref_count,
            1
        );
    }

    #[test]
    fn missing_entry_point_is_reported() {
        let mut c = compiler();
        c.add_to_stream(Instruction::Return { op: None });
        c.define_function("f", SymbolType::new(BaseType::Void))
            .unwrap();

        let error = c.finish_parse().unwrap_err();
        assert_eq!(error.kind, ErrorKind::Declaration);
        assert_eq!(error.message, "Entry point was not found");
    }

    #[test]
    fn first_function_ip_skips_initial_goto() {
        let mut c = compiler();
        define_main(&mut c);
        c.finish_parse().unwrap();

        assert_eq!(c.find_symbol_by_name(ENTRY_POINT_NAME).unwrap().ip, 1);
    }
}
