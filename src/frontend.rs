//! Front-end collaborator interfaces and input-type detection.
//!
//! The actual parsing of LLVM IR or SPIR-V into the IR module, as well as
//! the pre-compilation of OpenCL C source through external toolchains, live
//! outside this crate. Here are the traits they implement and the detection
//! of what kind of input a byte stream holds.

use std::path::PathBuf;

use crate::backend::MODULE_MAGIC;
use crate::error::CompileResult;
use crate::ir::method::Module;

/// The type of input code determined for a byte stream.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SourceType {
    Unknown,
    OpenClC,
    LlvmIrText,
    LlvmIrBin,
    SpirvBin,
    SpirvText,
    QpuAsmHex,
    QpuAsmBin,
}

const LLVM_BITCODE_MAGIC: &[u8] = b"BC\xC0\xDE";
const SPIRV_MAGIC: u32 = 0x0723_0203;

fn leading_word(data: &[u8]) -> Option<u32> {
    data.get(..4)
        .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Determine the type of code in the given bytes by their leading content.
/// Detection is idempotent on its own output for the binary and hex forms.
pub fn determine_source_type(data: &[u8]) -> SourceType {
    if data.starts_with(LLVM_BITCODE_MAGIC) {
        return SourceType::LlvmIrBin;
    }
    if let Some(word) = leading_word(data) {
        if word == SPIRV_MAGIC || word.swap_bytes() == SPIRV_MAGIC {
            return SourceType::SpirvBin;
        }
        if word == MODULE_MAGIC {
            return SourceType::QpuAsmBin;
        }
    }
    let text = String::from_utf8_lossy(&data[..data.len().min(1024)]);
    let trimmed = text.trim_start();
    if trimmed.starts_with("; SPIR-V") {
        return SourceType::SpirvText;
    }
    if trimmed.starts_with("0x") {
        return SourceType::QpuAsmHex;
    }
    if text.contains("ModuleID") || text.contains("target datalayout") || trimmed.starts_with("define ")
    {
        return SourceType::LlvmIrText;
    }
    if data.is_empty() || text.contains('\u{FFFD}') {
        return SourceType::Unknown;
    }
    SourceType::OpenClC
}

/// A parser turning IR bytes into a populated [`Module`].
pub trait Frontend {
    /// The input type this front-end consumes.
    fn input_type(&self) -> SourceType;

    fn parse(&self, ir: &[u8], module: &mut Module) -> CompileResult<()>;
}

/// The paths of the OpenCL C standard-library implementation files used by
/// the pre-compiler.
#[derive(Clone, Debug, Default)]
pub struct StdlibFiles {
    /// The configuration header, always required.
    pub configuration_header: Option<PathBuf>,
    /// The precompiled header, required for the SPIR-V front-end.
    pub precompiled_header: Option<PathBuf>,
    /// The precompiled LLVM module, required for the LLVM front-end.
    pub llvm_module: Option<PathBuf>,
}

/// The pre-compiler invoking external toolchain binaries to turn source
/// bytes into IR bytes of one of the parseable types.
pub trait Precompiler {
    fn precompile(
        &self,
        source: &[u8],
        options: &str,
        output_type: SourceType,
    ) -> CompileResult<Vec<u8>>;

    /// Locate the standard-library files, also searching the given folders.
    fn find_standard_library(&self, additional_folders: &[PathBuf]) -> CompileResult<StdlibFiles>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_llvm_bitcode() {
        assert_eq!(
            determine_source_type(b"BC\xC0\xDEmore"),
            SourceType::LlvmIrBin
        );
    }

    #[test]
    fn detects_spirv_both_endiannesses() {
        assert_eq!(
            determine_source_type(&0x0723_0203u32.to_le_bytes()),
            SourceType::SpirvBin
        );
        assert_eq!(
            determine_source_type(&0x0723_0203u32.to_be_bytes()),
            SourceType::SpirvBin
        );
    }

    #[test]
    fn detects_llvm_ir_text() {
        let ir = b"; ModuleID = 'kernel.cl'\ntarget datalayout = \"e\"\n";
        assert_eq!(determine_source_type(ir), SourceType::LlvmIrText);
    }

    #[test]
    fn detects_qpu_forms() {
        let mut bin = MODULE_MAGIC.to_le_bytes().to_vec();
        bin.extend_from_slice(&[0u8; 16]);
        assert_eq!(determine_source_type(&bin), SourceType::QpuAsmBin);
        assert_eq!(
            determine_source_type(b"0xdeadbeaf, 0x12345678,\n"),
            SourceType::QpuAsmHex
        );
    }

    #[test]
    fn plain_text_is_opencl() {
        assert_eq!(
            determine_source_type(b"__kernel void k(__global int* out) { }"),
            SourceType::OpenClC
        );
    }

    #[test]
    fn detection_is_idempotent_on_binary_forms() {
        for data in [
            b"BC\xC0\xDE".to_vec(),
            0x0723_0203u32.to_le_bytes().to_vec(),
            MODULE_MAGIC.to_le_bytes().to_vec(),
            b"0x00000000\n".to_vec(),
        ] {
            let first = determine_source_type(&data);
            let second = determine_source_type(&data);
            assert_eq!(first, second);
        }
    }
}
