//! Compilation errors.

use regvm_core::Bank;
use thiserror::Error;

/// A malformed call sequence in the instruction stream. Always fatal for the
/// function being compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error(
        "pc {pc}: argument count does not match preceding parameter instructions \
         ({staged} staged, {declared} declared)"
    )]
    ArgCountMismatch {
        pc: usize,
        staged: usize,
        declared: usize,
    },

    #[error("pc {pc}: result type must follow call")]
    ResultMustFollowCall { pc: usize },

    #[error("pc {pc}: result must not be a compile-time constant")]
    ConstantResult { pc: usize },

    #[error("pc {pc}: RESULT without a preceding call")]
    StrayResult { pc: usize },

    #[error("pc {pc}: unrecognized register type {bits:#04x}")]
    UnknownRegType { pc: usize, bits: u8 },

    #[error("pc {pc}: unsupported parameter type {reg_type}")]
    UnsupportedParam { pc: usize, reg_type: String },

    #[error("pc {pc}: unsupported result type {reg_type}")]
    UnsupportedResult { pc: usize, reg_type: String },

    #[error("pc {pc}: unsupported return type {reg_type}")]
    UnsupportedReturn { pc: usize, reg_type: String },

    #[error("pc {pc}: {bank} register {reg} out of range ({count} registers)")]
    RegisterOutOfRange {
        pc: usize,
        bank: Bank,
        reg: usize,
        count: u16,
    },

    #[error("pc {pc}: {pool} constant {index} out of range")]
    ConstantOutOfRange {
        pc: usize,
        pool: &'static str,
        index: usize,
    },

    #[error("pc {pc}: pointer constant {index} is not a function")]
    CalleeNotFunction { pc: usize, index: usize },
}

/// Errors that can occur during code generation.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error("target error: {0}")]
    Target(String),

    #[error("lowering error: {0}")]
    Lowering(String),

    #[error("module error: {0}")]
    Module(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0} is not a script function")]
    NotScript(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_instruction() {
        let e = MarshalError::ArgCountMismatch {
            pc: 4,
            staged: 1,
            declared: 2,
        };
        assert_eq!(
            e.to_string(),
            "pc 4: argument count does not match preceding parameter instructions \
             (1 staged, 2 declared)"
        );
        let e = MarshalError::RegisterOutOfRange {
            pc: 0,
            bank: Bank::Float,
            reg: 3,
            count: 2,
        };
        assert_eq!(e.to_string(), "pc 0: float register 3 out of range (2 registers)");
    }

    #[test]
    fn marshal_errors_convert() {
        let e: CodegenError = MarshalError::StrayResult { pc: 9 }.into();
        assert!(matches!(e, CodegenError::Marshal(MarshalError::StrayResult { pc: 9 })));
        assert_eq!(e.to_string(), "pc 9: RESULT without a preceding call");
    }
}
