//! Rastreo de la posición actual en el código fuente.
//!
//! El análisis léxico y sintáctico ocurre en un colaborador externo; lo
//! único que el núcleo necesita de él es la posición en la que va leyendo,
//! para ubicar los diagnósticos que se produzcan durante las acciones
//! semánticas. El colaborador alimenta esta posición con
//! [`Compiler::set_cursor`](crate::semantic::Compiler::set_cursor).

use std::fmt::{self, Display};

/// Una posición línea-columna reportada por el lexer.
///
/// La columna puede no conocerse: varias acciones semánticas ocurren al
/// cierre de una producción completa, donde solo la línea tiene sentido.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    line: u32,
    column: Option<u32>,
}

impl Cursor {
    /// Construye a partir de una línea y columna conocidas.
    pub fn at(line: u32, column: Option<u32>) -> Self {
        Cursor { line, column }
    }

    /// Obtiene el número de línea.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Obtiene el número de columna, si se conoce.
    pub fn column(&self) -> Option<u32> {
        self.column
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor {
            line: 1,
            column: None,
        }
    }
}

impl Display for Cursor {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(column) => write!(formatter, "{}:{}", self.line, column),
            None => write!(formatter, "{}:-", self.line),
        }
    }
}
