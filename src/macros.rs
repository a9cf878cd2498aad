/// Aborta la compilación ante un estado interno que no debería ocurrir.
macro_rules! unexpected {
    () => {
        return Err(crate::error::CompilerError::unexpected())
    };
}
