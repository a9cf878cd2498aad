//! Representación intermedia de código.
//!
//! La representación intermedia es lineal: una secuencia de instrucciones
//! abstractas de tres direcciones, indexada por un puntero de instrucción
//! monotónico (`ip`). El parser la produce en orden de lectura a través
//! del API de construcción y el back end la consume en orden de IP, sin
//! reordenarla nunca.
//!
//! # Operandos
//! Los operandos llevan el valor textual que entregó el lexer (un nombre
//! de variable o una constante sin convertir), el tipo resuelto y la
//! clasificación de la expresión. Un operando puede llevar además un
//! índice, para los accesos a memoria pre-reservada.
//!
//! # Backpatching
//! Los saltos hacia adelante se crean sin destino y se completan después
//! mediante listas de backpatch: colecciones de IPs de instrucciones cuyo
//! campo de destino debe llenarse cuando la posición objetivo se conozca.
//! Dos listas se funden por concatenación y una lista se destruye al
//! resolverse.

use crate::symbols::{ExpressionKind, SymbolType};

/// Operación de una instrucción de asignación.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AssignKind {
    // Un operando
    None,
    Negation,

    // Dos operandos
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    ShiftLeft,
    ShiftRight,
}

/// Comparación de una instrucción `If`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompareKind {
    LogOr,
    LogAnd,

    Equal,
    NotEqual,
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
}

impl CompareKind {
    /// Comparación equivalente con los operandos intercambiados.
    pub fn swapped(self) -> CompareKind {
        match self {
            CompareKind::Greater => CompareKind::Less,
            CompareKind::Less => CompareKind::Greater,
            CompareKind::GreaterOrEqual => CompareKind::LessOrEqual,
            CompareKind::LessOrEqual => CompareKind::GreaterOrEqual,
            other => other,
        }
    }
}

/// Índice opcional de un operando (acceso `a[i]`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperandIndex {
    pub value: String,
    pub typ: SymbolType,
    pub exp_type: ExpressionKind,
}

/// Un operando de instrucción.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operand {
    pub value: String,
    pub typ: SymbolType,
    pub exp_type: ExpressionKind,
    pub index: Option<OperandIndex>,
}

impl Operand {
    /// Operando constante con el valor textual dado.
    pub fn constant<S: Into<String>>(value: S, typ: SymbolType) -> Self {
        Operand {
            value: value.into(),
            typ,
            exp_type: ExpressionKind::Constant,
            index: None,
        }
    }

    /// Operando que nombra una variable.
    pub fn variable<S: Into<String>>(name: S, typ: SymbolType) -> Self {
        Operand {
            value: name.into(),
            typ,
            exp_type: ExpressionKind::Variable,
            index: None,
        }
    }

    /// Valor numérico de un operando constante. Las constantes llegan ya
    /// validadas por el lexer; cualquier resto no numérico se trunca.
    pub fn constant_value(&self) -> i32 {
        parse_constant(&self.value)
    }
}

/// Interpreta el lexema de una constante entera con truncamiento de 32 bits.
pub fn parse_constant(text: &str) -> i32 {
    text.parse::<i64>().unwrap_or(0) as i32
}

/// Argumento real de una llamada, acumulado por el parser antes de
/// bajarla a instrucciones `Push`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallArgument {
    pub value: String,
    pub typ: SymbolType,
    pub exp_type: ExpressionKind,
}

/// Destino aún sin resolver de un salto hacia adelante.
pub const UNRESOLVED_TARGET: i32 = -1;

/// Una instrucción abstracta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    Nop,

    /// `dst[dst_index] = op1 <kind> op2`
    Assign {
        kind: AssignKind,
        dst_value: String,
        dst_index: Option<OperandIndex>,
        op1: Operand,
        op2: Option<Operand>,
    },

    /// Salto incondicional a un IP de la secuencia.
    Goto { target: i32 },

    /// Salto incondicional a una etiqueta local a la función.
    GotoLabel { label: String },

    /// Salto condicional: se toma cuando la comparación es verdadera.
    If {
        kind: CompareKind,
        op1: Operand,
        op2: Operand,
        target: i32,
    },

    /// Parámetro de una llamada pendiente, en orden de aparición.
    Push { arg: CallArgument },

    /// Llamada a función; `return_symbol` nombra la variable que recibirá
    /// el valor de retorno, si la función no es `void`.
    Call {
        target: String,
        return_symbol: Option<String>,
    },

    /// Retorno de la función actual, con operando para las no-`void`.
    Return { op: Option<Operand> },
}

/// La secuencia de instrucciones abstractas.
#[derive(Default)]
pub struct Stream {
    entries: Vec<Instruction>,
}

impl Stream {
    pub fn new() -> Self {
        Stream {
            entries: Vec::new(),
        }
    }

    /// Agrega una instrucción y devuelve el IP asignado.
    pub fn push(&mut self, instruction: Instruction) -> i32 {
        self.entries.push(instruction);
        (self.entries.len() - 1) as i32
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Instrucción en el IP indicado.
    pub fn find_by_ip(&self, ip: i32) -> Option<&Instruction> {
        if ip < 0 {
            return None;
        }
        self.entries.get(ip as usize)
    }

    pub fn get_mut(&mut self, ip: i32) -> Option<&mut Instruction> {
        if ip < 0 {
            return None;
        }
        self.entries.get_mut(ip as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.entries.iter()
    }
}

/// Obligaciones de backpatch: IPs de instrucciones `Goto`/`If` cuyo
/// destino se escribirá más tarde.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BackpatchList {
    entries: Vec<i32>,
}

impl BackpatchList {
    pub fn new() -> Self {
        BackpatchList {
            entries: Vec::new(),
        }
    }

    /// Lista con una única obligación.
    pub fn single(ip: i32) -> Self {
        BackpatchList { entries: vec![ip] }
    }

    /// Funde otra lista al final de esta.
    pub fn merge(&mut self, mut other: BackpatchList) {
        self.entries.append(&mut other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consume la lista, entregando las obligaciones pendientes.
    pub fn into_entries(self) -> Vec<i32> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::BaseType;

    #[test]
    fn stream_assigns_sequential_ips() {
        let mut stream = Stream::new();
        assert_eq!(stream.push(Instruction::Nop), 0);
        assert_eq!(stream.push(Instruction::Goto { target: 0 }), 1);

        assert!(matches!(stream.find_by_ip(0), Some(Instruction::Nop)));
        assert!(matches!(
            stream.find_by_ip(1),
            Some(Instruction::Goto { target: 0 })
        ));
        assert!(stream.find_by_ip(2).is_none());
        assert!(stream.find_by_ip(-1).is_none());
    }

    #[test]
    fn backpatch_lists_merge_by_concatenation() {
        let mut a = BackpatchList::single(3);
        a.merge(BackpatchList::single(7));
        a.merge(BackpatchList::new());

        assert_eq!(a.into_entries(), vec![3, 7]);
    }

    #[test]
    fn swapped_compare_mirrors_ordering() {
        assert_eq!(CompareKind::Greater.swapped(), CompareKind::Less);
        assert_eq!(
            CompareKind::LessOrEqual.swapped(),
            CompareKind::GreaterOrEqual
        );
        assert_eq!(CompareKind::Equal.swapped(), CompareKind::Equal);
        assert_eq!(CompareKind::LogAnd.swapped(), CompareKind::LogAnd);
    }

    #[test]
    fn constants_parse_with_truncation() {
        let op = Operand::constant("12", SymbolType::new(BaseType::Uint8));
        assert_eq!(op.constant_value(), 12);
        assert_eq!(parse_constant("4294967295"), -1);
        assert_eq!(parse_constant("garbage"), 0);
    }
}
