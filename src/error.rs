//! Diagnósticos de compilación.
//!
//! Toda falla aborta la compilación: no hay recuperación local. Cada error
//! pertenece a una categoría plana y lleva opcionalmente la línea y columna
//! donde el colaborador léxico se encontraba al producirse.

use std::fmt::{self, Display};
use thiserror::Error;

use crate::source::Cursor;

/// Resultado estándar de las fases de compilación.
pub type CompileResult<T> = Result<T, CompilerError>;

/// Categoría de un error de compilación.
#[non_exhaustive]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Problema reportado por el lexer o el parser.
    Syntax,

    /// Declaración duplicada, prototipo incompatible o forma inválida
    /// del punto de entrada.
    Declaration,

    /// Incompatibilidad de tipos o referencia no resuelta en una sentencia.
    Statement,

    /// Invariante interna violada o límite del generador de código excedido.
    Compilation,
}

impl Display for ErrorKind {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Syntax => fmt.write_str("Syntax"),
            ErrorKind::Declaration => fmt.write_str("Declaration"),
            ErrorKind::Statement => fmt.write_str("Statement"),
            ErrorKind::Compilation => fmt.write_str("Compilation"),
        }
    }
}

/// Un error que aborta la compilación.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CompilerError {
    pub kind: ErrorKind,
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl CompilerError {
    /// Construye un error sin ubicación asociada.
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        CompilerError {
            kind,
            message: message.into(),
            line: None,
            column: None,
        }
    }

    /// Construye un error ubicado en la posición actual del lexer.
    pub fn at<S: Into<String>>(kind: ErrorKind, message: S, cursor: Cursor) -> Self {
        CompilerError {
            kind,
            message: message.into(),
            line: Some(cursor.line()),
            column: cursor.column(),
        }
    }

    /// Error de compilación por estado interno inalcanzable.
    pub fn unexpected() -> Self {
        CompilerError::new(ErrorKind::Compilation, "Unexpected compiler error")
    }

    /// Forma de diagnóstico que consume la interfaz de línea de comandos:
    /// `[línea:columna] Categoría: mensaje`. Si no se conoce la columna se
    /// escribe `-`, y si no se conoce la línea se omite el prefijo completo.
    pub fn diagnostic(&self) -> String {
        match (self.line, self.column) {
            (Some(line), Some(column)) => {
                format!("[{}:{}] {}: {}", line, column, self.kind, self.message)
            }
            (Some(line), None) => format!("[{}:-] {}: {}", line, self.kind, self.message),
            _ => format!("{}: {}", self.kind, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_includes_location_when_known() {
        let error = CompilerError::at(
            ErrorKind::Declaration,
            "Variable \"x\" is already declared in this scope",
            Cursor::at(12, Some(3)),
        );

        assert_eq!(
            error.diagnostic(),
            "[12:3] Declaration: Variable \"x\" is already declared in this scope"
        );
    }

    #[test]
    fn diagnostic_marks_unknown_column() {
        let error = CompilerError::at(ErrorKind::Statement, "bad call", Cursor::at(7, None));
        assert_eq!(error.diagnostic(), "[7:-] Statement: bad call");
    }

    #[test]
    fn diagnostic_without_location_has_no_prefix() {
        let error = CompilerError::unexpected();
        assert_eq!(error.diagnostic(), "Compilation: Unexpected compiler error");
    }
}
