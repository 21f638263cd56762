//! Error types for the compiler.
//!
//! Every pass fails fast on its own method with a descriptive error that
//! includes the textual form of the offending instruction where available.

use thiserror::Error;

/// Main error type, one variant per compilation step.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("front-end error: {message}")]
    FrontEnd { message: String },

    #[error("normalization error: {message}{}", fmt_instruction(.instruction))]
    Normalization {
        message: String,
        instruction: Option<String>,
    },

    #[error("optimization error: {message}{}", fmt_instruction(.instruction))]
    Optimization {
        message: String,
        instruction: Option<String>,
    },

    #[error("code-generation error: {message}{}", fmt_instruction(.instruction))]
    CodeGeneration {
        message: String,
        instruction: Option<String>,
    },

    #[error("linker error: {message}")]
    Linker { message: String },

    #[error("internal compiler error: {message}")]
    Internal { message: String },
}

fn fmt_instruction(instruction: &Option<String>) -> String {
    instruction
        .as_ref()
        .map(|text| format!(": {text}"))
        .unwrap_or_default()
}

impl CompileError {
    pub fn front_end(message: impl Into<String>) -> Self {
        Self::FrontEnd {
            message: message.into(),
        }
    }

    pub fn normalization(message: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self::Normalization {
            message: message.into(),
            instruction: Some(instruction.into()),
        }
    }

    pub fn normalization_general(message: impl Into<String>) -> Self {
        Self::Normalization {
            message: message.into(),
            instruction: None,
        }
    }

    pub fn optimization(message: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self::Optimization {
            message: message.into(),
            instruction: Some(instruction.into()),
        }
    }

    pub fn optimization_general(message: impl Into<String>) -> Self {
        Self::Optimization {
            message: message.into(),
            instruction: None,
        }
    }

    pub fn code_generation(message: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self::CodeGeneration {
            message: message.into(),
            instruction: Some(instruction.into()),
        }
    }

    pub fn code_generation_general(message: impl Into<String>) -> Self {
        Self::CodeGeneration {
            message: message.into(),
            instruction: None,
        }
    }

    pub fn linker(message: impl Into<String>) -> Self {
        Self::Linker {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type alias for all compilation steps.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_instruction_text() {
        let err = CompileError::normalization("invalid memory access", "%a = read %b");
        let text = err.to_string();
        assert!(text.contains("invalid memory access"));
        assert!(text.contains("%a = read %b"));
    }

    #[test]
    fn error_display_without_instruction() {
        let err = CompileError::optimization_general("unhandled step form");
        assert_eq!(
            err.to_string(),
            "optimization error: unhandled step form"
        );
    }
}
