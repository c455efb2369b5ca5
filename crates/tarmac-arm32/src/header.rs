//! Assembly file header.
//!
//! Emitted verbatim once per output file, before any function or data.

use std::io::{self, Write};

/// Write the unified-syntax header and the EABI build attributes.
pub fn lower_header(w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, ".syntax unified")?;
    // Tag_conformance must come first in the file-scope attribute
    // subsection.
    writeln!(w, ".eabi_attribute 67, \"2.09\"      @ Tag_conformance")?;
    // Chromebooks are at least A15, but A9 keeps compatibility wider.
    writeln!(w, ".cpu    cortex-a9")?;
    writeln!(w, ".eabi_attribute 6, 10   @ Tag_CPU_arch: ARMv7")?;
    writeln!(w, ".eabi_attribute 7, 65   @ Tag_CPU_arch_profile: App profile")?;
    writeln!(w, ".eabi_attribute 8, 1    @ Tag_ARM_ISA_use: Yes")?;
    writeln!(w, ".eabi_attribute 9, 2    @ Tag_THUMB_ISA_use: Thumb-2")?;
    writeln!(w, ".fpu    neon")?;
    writeln!(w, ".eabi_attribute 17, 1   @ Tag_ABI_PCS_GOT_use: permit directly")?;
    writeln!(w, ".eabi_attribute 20, 1   @ Tag_ABI_FP_denormal")?;
    writeln!(w, ".eabi_attribute 21, 1   @ Tag_ABI_FP_exceptions")?;
    writeln!(w, ".eabi_attribute 23, 3   @ Tag_ABI_FP_number_model: IEEE 754")?;
    writeln!(w, ".eabi_attribute 34, 1   @ Tag_CPU_unaligned_access")?;
    writeln!(w, ".eabi_attribute 24, 1   @ Tag_ABI_align_needed: 8-byte")?;
    writeln!(w, ".eabi_attribute 25, 1   @ Tag_ABI_align_preserved: 8-byte")?;
    writeln!(w, ".eabi_attribute 28, 1   @ Tag_ABI_VFP_args")?;
    writeln!(w, ".eabi_attribute 36, 1   @ Tag_FP_HP_extension")?;
    writeln!(w, ".eabi_attribute 38, 1   @ Tag_ABI_FP_16bit_format")?;
    writeln!(w, ".eabi_attribute 42, 1   @ Tag_MPextension_use")?;
    writeln!(w, ".eabi_attribute 68, 1   @ Tag_Virtualization_use")?;
    // r9 is reserved for TLS under sandboxing, but match current NaCl LLVM
    // and do not claim it.
    writeln!(w, ".eabi_attribute 14, 3   @ Tag_ABI_PCS_R9_use: Not used")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_contents() {
        let mut buf = Vec::new();
        lower_header(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with(".syntax unified\n"));
        assert!(text.contains(".eabi_attribute 67, \"2.09\""));
        assert!(text.contains(".cpu    cortex-a9"));
        assert!(text.contains(".eabi_attribute 23, 3"));
        assert!(text.contains(".eabi_attribute 14, 3"));
    }
}
