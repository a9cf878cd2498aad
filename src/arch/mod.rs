//! Detalles específicos de la arquitectura objetivo.
//!
//! El único objetivo soportado es i386 en modo real de 16 bits, el
//! procesador que DOS espera. Este módulo expone el modelo de registros
//! y los codificadores de instrucciones que usa el back end.

pub mod i386;
